//! Terminal-multiplexed bash session.
//!
//! One long-lived shell runs inside a PTY for the lifetime of the session,
//! so state (cwd, environment, background jobs) carries across commands and
//! interactive programs can be driven through `is_input` writes. Command
//! boundaries are detected by the prompt metadata block, never by guessing
//! at the output text.

use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::warn;

use windlass_protocol::Action;
use windlass_protocol::ActionKind;
use windlass_protocol::CmdOutputMetadata;
use windlass_protocol::CommandStatus;
use windlass_protocol::Observation;

use crate::bash::BashSession;
use crate::bash::TIMEOUT_MESSAGE_TEMPLATE;
use crate::bash::TRUNCATION_PREFIX;
use crate::bash::is_interrupt_input;
use crate::bash::looks_interactive;
use crate::bash::metadata::parse_ps1_blocks;
use crate::bash::metadata::ps1_prompt;
use crate::bash::split_commands;
use crate::bash::truncate_output;
use crate::config::Config;
use crate::error::Result;
use crate::error::WindlassErr;

/// Sessions sharing this process share the sweep duties: the first session
/// to initialize and the last one to close both clean up leaked shells.
static OPEN_SESSIONS: AtomicUsize = AtomicUsize::new(0);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

pub struct PtyBashSession {
    shell_path: PathBuf,
    work_dir: PathBuf,
    cwd: PathBuf,
    no_change_timeout: Duration,
    default_timeout: Duration,
    max_output_bytes: usize,
    max_output_lines: usize,
    inner: Option<SessionInner>,
    prev_status: Option<CommandStatus>,
}

struct SessionInner {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl PtyBashSession {
    pub fn new(config: &Config) -> Self {
        Self {
            shell_path: config.shell_path.clone(),
            work_dir: config.work_dir.clone(),
            cwd: config.work_dir.clone(),
            no_change_timeout: Duration::from_secs(config.no_change_timeout_secs),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_output_bytes: config.max_output_bytes,
            max_output_lines: config.max_output_lines,
            inner: None,
            prev_status: None,
        }
    }

    /// Status of the last executed command, if any.
    pub fn prev_status(&self) -> Option<CommandStatus> {
        self.prev_status
    }

    /// Tear the terminal down and bring a fresh one up in place. This is the
    /// recovery path for a wedged prompt: afterwards the session accepts
    /// commands again (with a fresh environment).
    pub async fn reset(&mut self) -> Result<()> {
        warn!("resetting bash session terminal");
        self.close().await?;
        self.initialize().await
    }

    fn inner(&self) -> Result<&SessionInner> {
        self.inner
            .as_ref()
            .ok_or_else(|| WindlassErr::Session("bash session is not initialized".to_string()))
    }

    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.inner()?
            .writer_tx
            .send(bytes)
            .await
            .map_err(|_| WindlassErr::Session("terminal writer is gone".to_string()))
    }

    /// Wait for output until a prompt block, a timeout, or shell death.
    async fn collect_output(
        &mut self,
        command: &str,
        hard_timeout: Duration,
    ) -> Result<Observation> {
        let mut rx = self.inner()?.output_tx.subscribe();
        let started = Instant::now();
        let hard_deadline = started + hard_timeout;
        let mut last_change = Instant::now();
        let mut buffer = String::new();

        loop {
            let now = Instant::now();
            if now >= hard_deadline {
                self.prev_status = Some(CommandStatus::HardTimeout);
                let suffix = format!(
                    "\n[The command timed out after {:.1} seconds. {TIMEOUT_MESSAGE_TEMPLATE}]",
                    started.elapsed().as_secs_f64()
                );
                return Ok(self.continuing_output(command, &buffer, suffix));
            }

            let wait = POLL_INTERVAL.min(hard_deadline - now);
            match timeout(wait, rx.recv()).await {
                Ok(Ok(chunk)) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    last_change = Instant::now();
                    if let Some(block) = parse_ps1_blocks(&buffer).into_iter().next() {
                        return Ok(self.completed_output(command, &buffer, block));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("terminal reader lagged; {skipped} chunks dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    self.prev_status = Some(CommandStatus::Error);
                    return Ok(Observation::error(
                        "the shell process exited unexpectedly; reset the terminal to recover",
                    ));
                }
                Err(_) => {
                    // No new bytes this tick; check the no-change window.
                    if last_change.elapsed() >= self.no_change_timeout {
                        if looks_interactive(command, &buffer) {
                            self.prev_status = Some(CommandStatus::Continue);
                            let suffix = format!(
                                "\n[The command has no new output after {:.0} seconds and looks \
                                 like it is waiting for input. {TIMEOUT_MESSAGE_TEMPLATE}]",
                                self.no_change_timeout.as_secs_f64()
                            );
                            return Ok(self.continuing_output(command, &buffer, suffix));
                        }
                        self.prev_status = Some(CommandStatus::Completed);
                        let suffix = format!(
                            "\n[No new output after {:.0} seconds; treating the command as \
                             completed.]",
                            self.no_change_timeout.as_secs_f64()
                        );
                        let mut metadata = self.base_metadata();
                        metadata.exit_code = 0;
                        metadata.suffix = suffix;
                        return Ok(self.cmd_output(command, &buffer, metadata));
                    }
                }
            }
        }
    }

    fn completed_output(
        &mut self,
        command: &str,
        buffer: &str,
        block: crate::bash::metadata::Ps1Block,
    ) -> Observation {
        self.prev_status = Some(CommandStatus::Completed);
        let mut metadata = block.metadata;
        if let Some(dir) = &metadata.working_dir {
            self.cwd = PathBuf::from(dir);
        } else {
            metadata.working_dir = Some(self.cwd.to_string_lossy().to_string());
        }
        let content = strip_echoed_command(&buffer[..block.start], command);
        self.cmd_output(command, &content, metadata)
    }

    fn continuing_output(&self, command: &str, buffer: &str, suffix: String) -> Observation {
        let mut metadata = self.base_metadata();
        metadata.exit_code = -1;
        metadata.suffix = suffix;
        self.cmd_output(command, buffer, metadata)
    }

    fn base_metadata(&self) -> CmdOutputMetadata {
        CmdOutputMetadata {
            working_dir: Some(self.cwd.to_string_lossy().to_string()),
            username: Some(whoami::username()),
            hostname: whoami::fallible::hostname().ok(),
            ..Default::default()
        }
    }

    fn cmd_output(
        &self,
        command: &str,
        content: &str,
        mut metadata: CmdOutputMetadata,
    ) -> Observation {
        let (content, truncated) =
            truncate_output(content, self.max_output_bytes, self.max_output_lines);
        if truncated {
            metadata.prefix = TRUNCATION_PREFIX.to_string();
        }
        Observation::CmdOutput {
            content: content.trim_end_matches(['\r', '\n']).to_string(),
            command: command.to_string(),
            metadata,
        }
    }

    async fn interrupt(&mut self) -> Result<Observation> {
        let mut rx = self.inner()?.output_tx.subscribe();
        self.send_bytes(vec![0x03]).await?;
        let deadline = Instant::now() + INTERRUPT_GRACE;
        let mut buffer = String::new();
        // Consume output up to and including the post-interrupt prompt so a
        // stale prompt block cannot leak into the next command's framing.
        let mut prompt_seen = None;
        while Instant::now() < deadline && prompt_seen.is_none() {
            match timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Ok(chunk)) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    prompt_seen = parse_ps1_blocks(&buffer).into_iter().next();
                }
                Ok(Err(_)) | Err(_) => {}
            }
        }
        self.prev_status = Some(CommandStatus::Interrupted);
        let content = match prompt_seen {
            Some(block) => buffer[..block.start].to_string(),
            None => buffer,
        };
        let mut metadata = self.base_metadata();
        metadata.exit_code = 130;
        metadata.suffix = "\n[The command was interrupted.]".to_string();
        Ok(self.cmd_output("C-c", &content, metadata))
    }
}

#[async_trait]
impl BashSession for PtyBashSession {
    async fn initialize(&mut self) -> Result<()> {
        if self.inner.is_some() {
            return Ok(());
        }
        sweep_zombie_shells(&self.shell_path).await;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WindlassErr::Session(format!("openpty failed: {e}")))?;

        let mut command_builder = CommandBuilder::new(&self.shell_path);
        command_builder.arg("--norc");
        command_builder.arg("--noprofile");
        command_builder.arg("-i");
        command_builder.cwd(&self.work_dir);
        // A dumb terminal keeps readline from redrawing the input line with
        // cursor-movement escapes that would pollute the captured output.
        command_builder.env("TERM", "dumb");
        let child = pair
            .slave
            .spawn_command(command_builder)
            .map_err(|e| WindlassErr::Session(format!("failed to spawn shell: {e}")))?;

        // Reader: drain the PTY on a blocking thread, fan chunks out to
        // whichever execute() call is currently listening.
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WindlassErr::Session(format!("failed to clone PTY reader: {e}")))?;
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(256);
        let reader_handle = {
            let output_tx = output_tx.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; 8192];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let _ = output_tx.send(buf[..n].to_vec());
                        }
                        Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        // Writer: serialize stdin writes through a channel so callers never
        // block on terminal I/O.
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WindlassErr::Session(format!("failed to take PTY writer: {e}")))?;
        let writer = Arc::new(StdMutex::new(writer));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
        let writer_handle = tokio::spawn({
            let writer = Arc::clone(&writer);
            async move {
                while let Some(bytes) = writer_rx.recv().await {
                    let writer = Arc::clone(&writer);
                    let _ = tokio::task::spawn_blocking(move || {
                        if let Ok(mut guard) = writer.lock() {
                            use std::io::Write;
                            let _ = guard.write_all(&bytes);
                            let _ = guard.flush();
                        }
                    })
                    .await;
                }
            }
        });

        self.inner = Some(SessionInner {
            writer_tx,
            output_tx,
            child,
            reader_handle,
            writer_handle,
        });
        OPEN_SESSIONS.fetch_add(1, Ordering::SeqCst);

        // Frame every future prompt with the metadata block, silence command
        // echo, then wait for the first framed prompt so the session is
        // known-good before the first command. The markers are split with
        // an empty `''` inside the quoted assignment: the shell joins the
        // pieces back together, while the echoed setup line never contains
        // a literal marker the block scanner could mistake for a prompt.
        let split = |marker: &str| marker.replacen("###WIN", "###WIN''", 1);
        let setup = format!(
            "export PROMPT_COMMAND=''; export PS1='{}'; export PS2=''; stty -echo\n",
            ps1_prompt()
                .replace(crate::bash::metadata::PS1_BEGIN, &split(
                    crate::bash::metadata::PS1_BEGIN
                ))
                .replace(crate::bash::metadata::PS1_END, &split(
                    crate::bash::metadata::PS1_END
                ))
        );
        let mut rx = self.inner()?.output_tx.subscribe();
        self.send_bytes(setup.into_bytes()).await?;

        let deadline = Instant::now() + SETUP_TIMEOUT;
        let mut buffer = String::new();
        loop {
            if Instant::now() >= deadline {
                return Err(WindlassErr::Session(
                    "shell did not present a prompt during initialization".to_string(),
                ));
            }
            match timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Ok(chunk)) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));
                    if let Some(block) = parse_ps1_blocks(&buffer).into_iter().next_back() {
                        if let Some(dir) = block.metadata.working_dir {
                            self.cwd = PathBuf::from(dir);
                        }
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(WindlassErr::Session(
                        "shell exited during initialization".to_string(),
                    ));
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) | Err(_) => {}
            }
        }

        debug!("PTY bash session ready in {}", self.cwd.display());
        Ok(())
    }

    async fn execute(&mut self, action: &Action) -> Result<Observation> {
        let ActionKind::CmdRun {
            command,
            is_input,
            hard_timeout_ms,
        } = &action.kind
        else {
            return Err(WindlassErr::Session(
                "bash session can only execute CmdRun actions".to_string(),
            ));
        };
        if self.inner.is_none() {
            return Err(WindlassErr::Session(
                "bash session is not initialized".to_string(),
            ));
        }

        let hard_timeout = (*hard_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        if *is_input {
            if is_interrupt_input(command) {
                return self.interrupt().await;
            }
            if !command.is_empty() {
                let mut bytes = command.clone().into_bytes();
                bytes.push(b'\n');
                self.send_bytes(bytes).await?;
            }
            // Empty input polls the running command without touching it.
            return self.collect_output(command, hard_timeout).await;
        }

        let trimmed = command.trim();
        if trimmed.is_empty() {
            return self.collect_output("", hard_timeout).await;
        }

        let commands = match split_commands(trimmed) {
            Ok(commands) => commands,
            Err(e) => {
                self.prev_status = Some(CommandStatus::Error);
                return Ok(Observation::error(e.to_string()));
            }
        };
        if commands.len() > 1 {
            self.prev_status = Some(CommandStatus::Error);
            let listing: String = commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| format!("({}) {cmd}\n", i + 1))
                .collect();
            return Ok(Observation::error(format!(
                "Cannot execute multiple commands at once.\n\
                 Please run each command separately OR chain them into a single command \
                 via && or ;\nProvided commands:\n{listing}"
            )));
        }

        let mut bytes = trimmed.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_bytes(bytes).await?;
        self.collect_output(trimmed, hard_timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        let mut child = inner.child;
        // Kill and reap off the async thread; wait() blocks.
        tokio::task::spawn_blocking(move || {
            if let Err(e) = child.kill() {
                warn!("failed to kill session shell: {e}");
            }
            let _ = child.wait();
        });
        inner.reader_handle.abort();
        inner.writer_handle.abort();

        // With a shared multiplexer server the last session out also tears
        // the server down; here the equivalent is a final sweep for shells
        // the kill above may have orphaned.
        if OPEN_SESSIONS.fetch_sub(1, Ordering::SeqCst) == 1 {
            sweep_zombie_shells(&self.shell_path).await;
        }
        Ok(())
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }
}

impl Drop for PtyBashSession {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            let _ = inner.child.kill();
            inner.reader_handle.abort();
            inner.writer_handle.abort();
            OPEN_SESSIONS.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Readline echoes the submitted line back through the terminal even with
/// `stty -echo`, so the first captured line is often the command itself.
/// Drop it when it matches; everything after is real output.
fn strip_echoed_command(content: &str, command: &str) -> String {
    let mut lines = content.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end_matches(['\r', '\n']) == command.trim() => {
            lines.collect()
        }
        _ => content.to_string(),
    }
}

/// Kill defunct shell-server processes left behind by earlier sessions of
/// this user. Failures are logged and never fatal: the sweep is hygiene,
/// not correctness.
async fn sweep_zombie_shells(shell_path: &Path) {
    #[cfg(unix)]
    {
        let shell_name = shell_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "bash".to_string());
        let current_user = whoami::username();

        let output = tokio::process::Command::new("ps")
            .args(["-eo", "pid=,user=,stat=,comm="])
            .output()
            .await;
        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(
                    "zombie sweep: ps exited with {}; skipping",
                    output.status.code().unwrap_or(-1)
                );
                return;
            }
            Err(e) => {
                warn!("zombie sweep: failed to run ps: {e}");
                return;
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [pid, user, stat, comm, ..] = fields.as_slice() else {
                continue;
            };
            if *user != current_user || !stat.starts_with('Z') || !comm.contains(&shell_name) {
                continue;
            }
            let Ok(pid) = pid.parse::<i32>() else {
                continue;
            };
            debug!("zombie sweep: killing defunct shell {pid}");
            // SAFETY: plain signal send; no memory is shared with the target.
            let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
            if rc != 0 {
                warn!(
                    "zombie sweep: kill -9 {pid} failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = shell_path;
    }
}
