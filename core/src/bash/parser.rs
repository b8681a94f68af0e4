//! Top-level command splitting for the bash sessions.
//!
//! A session executes exactly one command per call. `;`-separated lists are
//! separable and rejected; pipelines, `&&`/`||` chains, heredocs, compound
//! statements and backslash continuations are all a single command. Comments
//! never count. Splitting works on the parse tree, not on the text, so
//! quoted strings pass through byte-for-byte.

use tree_sitter::Parser;
use tree_sitter::Tree;

use crate::error::Result;
use crate::error::WindlassErr;

fn try_parse_bash(source: &str) -> Option<Tree> {
    let lang = tree_sitter_bash::LANGUAGE.into();
    let mut parser = Parser::new();
    parser.set_language(&lang).ok()?;

    let old_tree: Option<&Tree> = None;
    parser.parse(source, old_tree)
}

/// Split `source` into its top-level commands, in order. Fails on shell
/// syntax the grammar cannot parse (unclosed quotes and the like).
pub fn split_commands(source: &str) -> Result<Vec<String>> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let tree = try_parse_bash(source)
        .ok_or_else(|| WindlassErr::Session("bash grammar unavailable".to_string()))?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(WindlassErr::Session(format!(
            "invalid bash syntax: {trimmed}"
        )));
    }

    let mut commands = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        // Comments ride along with whichever command they precede or trail;
        // they are never a command of their own.
        if child.kind() == "comment" {
            continue;
        }
        if let Ok(text) = child.utf8_text(source.as_bytes()) {
            commands.push(text.to_string());
        }
    }
    Ok(commands)
}
