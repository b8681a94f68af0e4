//! Stateful shell execution surfaces.
//!
//! Two implementations sit behind one contract: [`PtyBashSession`] keeps a
//! live terminal (interactive programs, stdin input, interrupts) and frames
//! command output with a prompt-embedded metadata block; and
//! [`SubprocessBashSession`] spawns a fresh shell per call (no interactive
//! input, simpler lifecycle).

mod metadata;
mod parser;
mod pty;
mod subprocess;

pub use metadata::PS1_BEGIN;
pub use metadata::PS1_END;
pub use metadata::parse_ps1_blocks;
pub use metadata::ps1_prompt;
pub use parser::split_commands;
pub use pty::PtyBashSession;
pub use subprocess::SubprocessBashSession;

use std::path::Path;

use async_trait::async_trait;

use windlass_protocol::Action;
use windlass_protocol::Observation;

use crate::error::Result;

/// Guidance appended to timeout suffixes so the model knows how to proceed
/// with a still-running command.
pub const TIMEOUT_MESSAGE_TEMPLATE: &str = "You may wait longer to see additional output by \
    sending empty command '', send other commands to interact with the current process, \
    send keys to interrupt/kill the command, \
    or use the timeout parameter in execute_bash for future commands.";

/// Output cues suggesting a quiet command is waiting for the user rather
/// than still crunching.
pub(crate) const INTERACTIVE_CUES: [&str; 5] = ["read", "input", "enter", "type", "press"];

#[async_trait]
pub trait BashSession: Send {
    /// Acquire resources and start the shell in the configured working
    /// directory.
    async fn initialize(&mut self) -> Result<()>;

    /// Run a CmdRun action (or deliver it as stdin when `is_input` and the
    /// session supports it). Soft failures come back as an `Error`
    /// observation; `Err` is reserved for misuse of the session itself.
    async fn execute(&mut self, action: &Action) -> Result<Observation>;

    /// Terminate the shell and any running child, release OS resources.
    async fn close(&mut self) -> Result<()>;

    /// Working directory as observed in the session (follows `cd`).
    fn cwd(&self) -> &Path;
}

pub(crate) const TRUNCATION_PREFIX: &str = "Previous command outputs are truncated";

/// Drop the oldest portion of `output` so at most `max_bytes` /
/// `max_lines` of the newest content remains. The final lines always
/// survive. Returns the kept tail and whether anything was dropped.
pub(crate) fn truncate_output(output: &str, max_bytes: usize, max_lines: usize) -> (String, bool) {
    let over_bytes = output.len() > max_bytes;
    let over_lines = output.lines().count() > max_lines;
    if !over_bytes && !over_lines {
        return (output.to_string(), false);
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut kept_bytes = 0;
    for line in output.lines().rev() {
        let line_cost = line.len() + 1;
        if kept.len() + 1 > max_lines || kept_bytes + line_cost > max_bytes {
            break;
        }
        kept.push(line);
        kept_bytes += line_cost;
    }
    kept.reverse();
    (kept.join("\n"), true)
}

pub(crate) fn looks_interactive(command: &str, output: &str) -> bool {
    let command = command.to_lowercase();
    let output = output.to_lowercase();
    INTERACTIVE_CUES
        .iter()
        .any(|cue| command.contains(cue) || output.contains(cue))
}

/// True for the inputs we treat as a terminal interrupt request.
pub(crate) fn is_interrupt_input(command: &str) -> bool {
    matches!(command.trim(), "C-c" | "C-C" | "ctrl+c" | "\x03")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_cue_detection() {
        assert!(looks_interactive("read -p 'name?'", ""));
        assert!(looks_interactive("./install.sh", "Press any key to continue"));
        assert!(!looks_interactive("cargo build", "Compiling windlass-core"));
    }

    #[test]
    fn interrupt_aliases() {
        assert!(is_interrupt_input("C-c"));
        assert!(is_interrupt_input("ctrl+c"));
        assert!(is_interrupt_input("\x03"));
        assert!(!is_interrupt_input("c"));
    }

    #[test]
    fn truncation_keeps_the_final_lines() {
        let output: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let (kept, truncated) = truncate_output(&output, 64, 1000);
        assert!(truncated);
        assert!(kept.len() <= 64);
        assert!(kept.lines().last().is_some_and(|l| l == "line 99"));

        let (kept, truncated) = truncate_output(&output, usize::MAX, 3);
        assert!(truncated);
        assert_eq!(kept.lines().count(), 3);
        assert!(kept.ends_with("line 99"));
    }

    #[test]
    fn short_output_is_untouched() {
        let (kept, truncated) = truncate_output("hello\nworld", 1024, 100);
        assert!(!truncated);
        assert_eq!(kept, "hello\nworld");
    }
}
