//! Prompt-embedded output framing.
//!
//! Instead of guessing where command output ends by regexing free-form
//! text, the PTY session configures the shell prompt to print a JSON
//! metadata block between fixed markers after every command. The session
//! parses only that block; everything before it is command output.

use serde::Deserialize;
use tracing::warn;

use windlass_protocol::CmdOutputMetadata;

pub const PS1_BEGIN: &str = "###WINDLASS_PS1_BEGIN###";
pub const PS1_END: &str = "###WINDLASS_PS1_END###";

/// The PS1 value installed into the session shell. Prompt escapes (`\u`,
/// `\H`) and parameter expansion (`$?`, `$(pwd)`) are resolved by the shell
/// every time the prompt is printed, which is exactly once per completed
/// command.
pub fn ps1_prompt() -> String {
    format!(
        concat!(
            "{begin}\n",
            "{{\"pid\": \"$$\", \"exit_code\": \"$?\", \"username\": \"\\u\", ",
            "\"hostname\": \"\\H\", \"working_dir\": \"$(pwd)\", ",
            "\"py_interpreter_path\": \"$(command -v python3 2>/dev/null || true)\"}}\n",
            "{end}\n",
        ),
        begin = PS1_BEGIN,
        end = PS1_END,
    )
}

/// String-typed twin of the wire metadata; the shell can only interpolate
/// text, so every field arrives as a string and is converted here.
#[derive(Debug, Deserialize)]
struct RawPs1Metadata {
    #[serde(default)]
    pid: String,
    #[serde(default)]
    exit_code: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    py_interpreter_path: String,
}

impl From<RawPs1Metadata> for CmdOutputMetadata {
    fn from(raw: RawPs1Metadata) -> Self {
        CmdOutputMetadata {
            exit_code: raw.exit_code.trim().parse().unwrap_or(-1),
            pid: raw.pid.trim().parse().unwrap_or(-1),
            username: non_empty(raw.username),
            hostname: non_empty(raw.hostname),
            working_dir: non_empty(raw.working_dir),
            py_interpreter_path: non_empty(raw.py_interpreter_path),
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// One parsed prompt block plus the byte span it occupies in the scanned
/// text, so the caller can cut output around it.
#[derive(Debug)]
pub struct Ps1Block {
    pub start: usize,
    pub end: usize,
    pub metadata: CmdOutputMetadata,
}

/// Find every complete `PS1_BEGIN ... PS1_END` block in `text`. Incomplete
/// trailing blocks (the shell is mid-print) are ignored; a block that fails
/// to parse is logged and skipped rather than aborting the scan.
pub fn parse_ps1_blocks(text: &str) -> Vec<Ps1Block> {
    let mut blocks = Vec::new();
    let mut search_from = 0;
    while let Some(rel_begin) = text[search_from..].find(PS1_BEGIN) {
        let begin = search_from + rel_begin;
        let body_start = begin + PS1_BEGIN.len();
        let Some(rel_end) = text[body_start..].find(PS1_END) else {
            break;
        };
        let body_end = body_start + rel_end;
        let end = body_end + PS1_END.len();

        let body: String = text[body_start..body_end].replace('\r', "");
        match serde_json::from_str::<RawPs1Metadata>(body.trim()) {
            Ok(raw) => blocks.push(Ps1Block {
                start: begin,
                end,
                metadata: raw.into(),
            }),
            Err(e) => {
                warn!("skipping malformed PS1 metadata block: {e}");
            }
        }
        search_from = end;
    }
    blocks
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn block(exit_code: i32, cwd: &str) -> String {
        format!(
            "{PS1_BEGIN}\n{{\"pid\": \"42\", \"exit_code\": \"{exit_code}\", \
             \"username\": \"dev\", \"hostname\": \"box\", \"working_dir\": \"{cwd}\", \
             \"py_interpreter_path\": \"\"}}\n{PS1_END}\n"
        )
    }

    #[test]
    fn parses_single_block_with_surrounding_output() {
        let text = format!("total 0\nfile.txt\n{}", block(0, "/workspace"));
        let blocks = parse_ps1_blocks(&text);
        assert_eq!(blocks.len(), 1);
        let parsed = &blocks[0];
        assert_eq!(parsed.metadata.exit_code, 0);
        assert_eq!(parsed.metadata.pid, 42);
        assert_eq!(parsed.metadata.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(&text[..parsed.start], "total 0\nfile.txt\n");
    }

    #[test]
    fn ignores_incomplete_trailing_block() {
        let text = format!("output\n{PS1_BEGIN}\n{{\"exit_code\": \"0\"");
        assert!(parse_ps1_blocks(&text).is_empty());
    }

    #[test]
    fn multiple_blocks_in_scan_order() {
        let text = format!("a\n{}b\n{}", block(0, "/one"), block(1, "/two"));
        let blocks = parse_ps1_blocks(&text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].metadata.exit_code, 0);
        assert_eq!(blocks[1].metadata.exit_code, 1);
        assert_eq!(blocks[1].metadata.working_dir.as_deref(), Some("/two"));
    }

    #[test]
    fn carriage_returns_from_the_pty_are_tolerated() {
        let text = block(7, "/w").replace('\n', "\r\n");
        let blocks = parse_ps1_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.exit_code, 7);
    }

    #[test]
    fn malformed_block_is_skipped() {
        let text = format!(
            "{PS1_BEGIN}\nnot json\n{PS1_END}\nmore output\n{}",
            block(0, "/w")
        );
        let blocks = parse_ps1_blocks(&text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].metadata.exit_code, 0);
    }

    #[test]
    fn prompt_template_contains_markers_and_expansions() {
        let prompt = ps1_prompt();
        assert!(prompt.starts_with(PS1_BEGIN));
        assert!(prompt.contains("$?"));
        assert!(prompt.contains("$(pwd)"));
        assert!(prompt.trim_end().ends_with(PS1_END));
    }
}
