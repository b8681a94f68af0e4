//! Repository change discovery, diffing, and commit/push plumbing.
//!
//! Everything runs through an injected [`ShellExec`] so the same handler
//! works against the local host or a remote runtime. Change enumeration is
//! done by a standalone helper script: the canonical command is tried first
//! and, when the target runtime does not ship it, the handler materializes
//! the embedded script into a temp directory and reissues the call.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::WindlassErr;

/// Helper command expected on PATH in managed runtime images.
const GIT_CHANGES_CMD: &str = "windlass-git-changes";
/// Deployed into the runtime when the canonical command is unavailable.
const GIT_CHANGES_SCRIPT: &str = include_str!("git_changes.sh");

/// Timeout for individual shell commands so a huge repository cannot wedge
/// the handler.
const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Substrings that mark a push as failed even on a zero exit code.
const PUSH_ERROR_PATTERNS: [&str; 6] = [
    "error:",
    "fatal:",
    "rejected",
    "failed to push",
    "permission denied",
    "authentication failed",
];

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub content: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shell access the handler runs its git commands through.
#[async_trait]
pub trait ShellExec: Send + Sync {
    async fn run(&self, cmd: &str, cwd: Option<&Path>) -> CommandResult;
    async fn create_file(&self, path: &Path, contents: &str) -> std::io::Result<()>;
}

/// ShellExec against the local host.
pub struct HostShell;

#[async_trait]
impl ShellExec for HostShell {
    async fn run(&self, cmd: &str, cwd: Option<&Path>) -> CommandResult {
        let mut command = Command::new("bash");
        command.arg("-c").arg(cmd);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        match timeout(GIT_COMMAND_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => {
                let mut content = String::from_utf8_lossy(&output.stdout).to_string();
                if !output.status.success() {
                    content.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                CommandResult {
                    content,
                    exit_code: output.status.code().unwrap_or(-1),
                }
            }
            Ok(Err(e)) => CommandResult {
                content: e.to_string(),
                exit_code: -1,
            },
            Err(_) => CommandResult {
                content: format!("command timed out: {cmd}"),
                exit_code: -1,
            },
        }
    }

    async fn create_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        tokio::fs::write(path, contents).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitChange {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitDiff {
    pub original: String,
    pub modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitCommitResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_committed: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GitPushResult {
    pub success: bool,
    pub remote: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct GitHandler {
    exec: Box<dyn ShellExec>,
    cwd: Option<PathBuf>,
    changes_cmd: String,
}

impl GitHandler {
    pub fn new(exec: Box<dyn ShellExec>) -> Self {
        Self {
            exec,
            cwd: None,
            changes_cmd: GIT_CHANGES_CMD.to_string(),
        }
    }

    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    fn cwd(&self) -> Result<&Path> {
        self.cwd
            .as_deref()
            .ok_or_else(|| WindlassErr::Session("git handler has no working directory".to_string()))
    }

    /// Enumerate changed files relative to the baseline ref, including
    /// nested direct-subdirectory repositories, sorted by path.
    pub async fn get_git_changes(&mut self) -> Result<Vec<GitChange>> {
        let cwd = self.cwd()?.to_path_buf();
        let result = self.exec.run(&self.changes_cmd, Some(&cwd)).await;
        if result.ok() {
            return Ok(parse_changes(&result.content));
        }

        if self.changes_cmd != GIT_CHANGES_CMD {
            // The deployed script failed too; nothing more to try.
            return Err(WindlassErr::Session(format!(
                "git changes helper failed: {}",
                result.content
            )));
        }

        // Legacy runtimes may not ship the helper; deploy our own copy and
        // reissue the call against it.
        info!("deploying git changes helper script into the runtime");
        let script = self.deploy_changes_script().await?;
        self.changes_cmd = format!("sh {}", quote(&script.to_string_lossy()));
        Box::pin(self.get_git_changes()).await
    }

    async fn deploy_changes_script(&self) -> Result<PathBuf> {
        let tmp = self.exec.run("mktemp -d", None).await;
        if !tmp.ok() {
            return Err(WindlassErr::Session(format!(
                "mktemp failed: {}",
                tmp.content
            )));
        }
        let script = PathBuf::from(tmp.content.trim()).join("windlass-git-changes.sh");
        self.exec.create_file(&script, GIT_CHANGES_SCRIPT).await?;
        let chmod = self
            .exec
            .run(&format!("chmod +x {}", quote(&script.to_string_lossy())), None)
            .await;
        if !chmod.ok() {
            warn!("chmod on deployed git helper failed: {}", chmod.content);
        }
        Ok(script)
    }

    /// Baseline and working-tree content for one file. `original` is the
    /// file at the current branch tip, or empty when it did not exist;
    /// `modified` is the working tree, or empty when deleted.
    pub async fn get_git_diff(&self, relative_file_path: &str) -> Result<GitDiff> {
        let cwd = self.cwd()?.to_path_buf();
        let quoted = quote(relative_file_path);

        let original = self
            .exec
            .run(&format!("git show HEAD:{quoted}"), Some(&cwd))
            .await;
        let modified = self.exec.run(&format!("cat {quoted}"), Some(&cwd)).await;

        Ok(GitDiff {
            original: if original.ok() {
                original.content
            } else {
                String::new()
            },
            modified: if modified.ok() {
                modified.content
            } else {
                String::new()
            },
        })
    }

    /// Stage (everything, or the given set), commit, and report the hash
    /// and file list. Commits with nothing staged are rejected.
    pub async fn commit_changes(
        &self,
        message: &str,
        files: Option<&[String]>,
        add_all: bool,
    ) -> Result<GitCommitResult> {
        let cwd = self.cwd()?.to_path_buf();

        if add_all {
            let staged = self.exec.run("git add -A", Some(&cwd)).await;
            if !staged.ok() {
                return Ok(commit_failure(format!(
                    "Failed to stage files: {}",
                    staged.content
                )));
            }
        } else if let Some(files) = files {
            for file in files {
                let staged = self
                    .exec
                    .run(&format!("git add {}", quote(file)), Some(&cwd))
                    .await;
                if !staged.ok() {
                    return Ok(commit_failure(format!(
                        "Failed to stage file {file}: {}",
                        staged.content
                    )));
                }
            }
        }

        let status = self
            .exec
            .run("git status --porcelain --cached", Some(&cwd))
            .await;
        if !status.ok() {
            return Ok(commit_failure(format!(
                "Failed to check git status: {}",
                status.content
            )));
        }
        if status.content.trim().is_empty() {
            return Ok(commit_failure("No staged changes to commit".to_string()));
        }

        let files_result = self
            .exec
            .run("git diff --cached --name-only", Some(&cwd))
            .await;
        let files_committed: Vec<String> = if files_result.ok() {
            files_result
                .content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };

        let commit = self
            .exec
            .run(&format!("git commit -m {}", quote(message)), Some(&cwd))
            .await;
        if !commit.ok() {
            return Ok(commit_failure(format!(
                "Failed to commit: {}",
                commit.content
            )));
        }

        let hash = self.exec.run("git rev-parse HEAD", Some(&cwd)).await;
        Ok(GitCommitResult {
            success: true,
            commit_hash: hash.ok().then(|| hash.content.trim().to_string()),
            files_committed: Some(files_committed),
            error: None,
        })
    }

    /// Push the current (or named) branch. Failure is detected from the
    /// exit code and from known error substrings, since git sometimes exits
    /// zero while refusing the push.
    pub async fn push_changes(
        &self,
        remote: &str,
        branch: Option<&str>,
        force: bool,
        set_upstream: bool,
    ) -> Result<GitPushResult> {
        let cwd = self.cwd()?.to_path_buf();

        let branch = match branch {
            Some(branch) => branch.to_string(),
            None => {
                let current = self
                    .exec
                    .run("git branch --show-current", Some(&cwd))
                    .await;
                if !current.ok() {
                    return Ok(GitPushResult {
                        success: false,
                        remote: remote.to_string(),
                        branch: None,
                        error: Some(format!(
                            "Failed to get current branch: {}",
                            current.content
                        )),
                    });
                }
                current.content.trim().to_string()
            }
        };

        let mut push_cmd = String::from("git push");
        if set_upstream {
            push_cmd.push_str(" -u");
        }
        if force {
            push_cmd.push_str(" --force");
        }
        push_cmd.push_str(&format!(" {} {}", quote(remote), quote(&branch)));

        let pushed = self.exec.run(&push_cmd, Some(&cwd)).await;
        let lowercase = pushed.content.to_lowercase();
        let has_error = PUSH_ERROR_PATTERNS
            .iter()
            .any(|pattern| lowercase.contains(pattern));

        if !pushed.ok() || has_error {
            return Ok(GitPushResult {
                success: false,
                remote: remote.to_string(),
                branch: Some(branch),
                error: Some(pushed.content),
            });
        }
        Ok(GitPushResult {
            success: true,
            remote: remote.to_string(),
            branch: Some(branch),
            error: None,
        })
    }
}

fn commit_failure(error: String) -> GitCommitResult {
    GitCommitResult {
        success: false,
        commit_hash: None,
        files_committed: None,
        error: Some(error),
    }
}

/// Parse `STATUS<TAB>PATH` lines. The helper emits baseline entries before
/// worktree entries, so keeping the last occurrence per path lets the
/// worktree status win.
fn parse_changes(output: &str) -> Vec<GitChange> {
    let mut by_path: BTreeMap<String, String> = BTreeMap::new();
    for line in output.lines() {
        let Some((status, path)) = line.split_once('\t') else {
            continue;
        };
        let status = status.trim();
        if path.is_empty() || !matches!(status, "A" | "M" | "D" | "R" | "C" | "U") {
            continue;
        }
        by_path.insert(path.to_string(), status.to_string());
    }
    by_path
        .into_iter()
        .map(|(path, status)| GitChange { status, path })
        .collect()
}

fn quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(|quoted| quoted.to_string())
        .unwrap_or_else(|_| format!("'{}'", value.replace('\'', "'\\''")))
}
