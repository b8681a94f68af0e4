//! Subprocess-per-call bash session.
//!
//! Each `execute` spawns a fresh `bash -c`, so there is no terminal to wedge
//! and nothing to reset; the trade-off is that interactive input is not
//! supported. Output is read capped and the child is killed on timeout.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::debug;

use windlass_protocol::Action;
use windlass_protocol::ActionKind;
use windlass_protocol::CmdOutputMetadata;
use windlass_protocol::Observation;

use crate::bash::BashSession;
use crate::bash::TIMEOUT_MESSAGE_TEMPLATE;
use crate::bash::TRUNCATION_PREFIX;
use crate::bash::split_commands;
use crate::bash::truncate_output;
use crate::config::Config;
use crate::error::Result;
use crate::error::WindlassErr;

pub struct SubprocessBashSession {
    shell_path: PathBuf,
    work_dir: PathBuf,
    cwd: PathBuf,
    default_timeout: Duration,
    max_output_bytes: usize,
    max_output_lines: usize,
    initialized: bool,
}

impl SubprocessBashSession {
    pub fn new(config: &Config) -> Self {
        Self {
            shell_path: config.shell_path.clone(),
            work_dir: config.work_dir.clone(),
            cwd: config.work_dir.clone(),
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_output_bytes: config.max_output_bytes,
            max_output_lines: config.max_output_lines,
            initialized: false,
        }
    }

    async fn run_command(&mut self, command: &str, timeout: Duration) -> Result<Observation> {
        let start = Instant::now();
        let mut child = Command::new(&self.shell_path)
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            // No stdin descriptor: some tools (ripgrep among them) try to
            // read from an open stdin and hang forever.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_reader = child
            .stdout
            .take()
            .ok_or_else(|| WindlassErr::Session("stdout pipe unavailable".to_string()))?;
        let stderr_reader = child
            .stderr
            .take()
            .ok_or_else(|| WindlassErr::Session("stderr pipe unavailable".to_string()))?;

        let max_bytes = self.max_output_bytes;
        let max_lines = self.max_output_lines;
        let stdout_handle =
            tokio::spawn(read_capped(BufReader::new(stdout_reader), max_bytes, max_lines));
        let stderr_handle =
            tokio::spawn(read_capped(BufReader::new(stderr_reader), max_bytes, max_lines));

        let mut timed_out = false;
        let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?.code().unwrap_or(-1),
            Err(_) => {
                timed_out = true;
                child.start_kill()?;
                -1
            }
        };

        let stdout = stdout_handle
            .await
            .map_err(|e| WindlassErr::Session(e.to_string()))??;
        let stderr = stderr_handle
            .await
            .map_err(|e| WindlassErr::Session(e.to_string()))??;

        let mut combined = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let (content, truncated) =
            truncate_output(&combined, self.max_output_bytes, self.max_output_lines);

        let mut metadata = CmdOutputMetadata {
            exit_code,
            working_dir: Some(self.cwd.to_string_lossy().to_string()),
            ..Default::default()
        };
        if truncated {
            metadata.prefix = TRUNCATION_PREFIX.to_string();
        }
        if timed_out {
            metadata.suffix = format!(
                "\n[The command timed out after {:.1} seconds. {TIMEOUT_MESSAGE_TEMPLATE}]",
                start.elapsed().as_secs_f64()
            );
        } else if exit_code == 0 {
            self.track_cd(command).await;
            metadata.working_dir = Some(self.cwd.to_string_lossy().to_string());
        }

        Ok(Observation::CmdOutput {
            content: content.trim_end().to_string(),
            command: command.to_string(),
            metadata,
        })
    }

    /// `cd` only affects a subprocess session if we observe it and move our
    /// notion of the working directory along with it.
    async fn track_cd(&mut self, command: &str) {
        if !command.trim_start().starts_with("cd") {
            return;
        }
        let probe = format!("{command} && pwd");
        let output = Command::new(&self.shell_path)
            .arg("-c")
            .arg(&probe)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output();
        if let Ok(Ok(output)) = tokio::time::timeout(Duration::from_secs(5), output).await
            && output.status.success()
            && let Ok(stdout) = String::from_utf8(output.stdout)
            && let Some(last) = stdout.lines().last()
        {
            let candidate = PathBuf::from(last.trim());
            if candidate.is_dir() {
                debug!("session cwd moved to {}", candidate.display());
                self.cwd = candidate;
            }
        }
    }
}

#[async_trait]
impl BashSession for SubprocessBashSession {
    async fn initialize(&mut self) -> Result<()> {
        self.cwd = self.work_dir.clone();
        self.initialized = true;
        debug!(
            "subprocess bash session initialized in {}",
            self.work_dir.display()
        );
        Ok(())
    }

    async fn execute(&mut self, action: &Action) -> Result<Observation> {
        if !self.initialized {
            return Err(WindlassErr::Session(
                "bash session is not initialized".to_string(),
            ));
        }
        let ActionKind::CmdRun {
            command,
            is_input,
            hard_timeout_ms,
        } = &action.kind
        else {
            return Err(WindlassErr::Session(
                "subprocess session can only execute CmdRun actions".to_string(),
            ));
        };
        let hard_timeout_ms = *hard_timeout_ms;

        if *is_input {
            return Ok(Observation::error(format!(
                "Subprocess bash session does not support interactive input. \
                 The command '{command}' was not sent to any process."
            )));
        }

        let command = command.trim();
        if command.is_empty() {
            return Ok(Observation::error("No command provided."));
        }

        let commands = match split_commands(command) {
            Ok(commands) => commands,
            Err(e) => return Ok(Observation::error(e.to_string())),
        };
        if commands.len() > 1 {
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

        let timeout = hard_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        self.run_command(command, timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }
}

async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
    max_lines: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_bytes.min(8 * 1024));
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = max_bytes;
    let mut remaining_lines = max_lines;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        if remaining_bytes > 0 && remaining_lines > 0 {
            let mut copy_len = 0;
            for &b in &tmp[..n] {
                if remaining_bytes == 0 || remaining_lines == 0 {
                    break;
                }
                copy_len += 1;
                remaining_bytes -= 1;
                if b == b'\n' {
                    remaining_lines -= 1;
                }
            }
            buf.extend_from_slice(&tmp[..copy_len]);
        }
        // Keep reading to EOF to avoid back-pressure on the child, but
        // discard once the caps are hit.
    }

    Ok(buf)
}
