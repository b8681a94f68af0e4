use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::agent_state::AgentState;

/// Something that happened in response to an action: command output, a file
/// snapshot, an error, a state transition. Observations are produced by the
/// runtime, the memory subscriber, or the controller itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Display)]
#[serde(tag = "kind", content = "payload")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum Observation {
    CmdOutput {
        content: String,
        #[serde(default)]
        command: String,
        #[serde(default)]
        metadata: CmdOutputMetadata,
    },

    FileRead {
        path: String,
        content: String,
    },

    FileEdit {
        path: String,
        #[serde(default)]
        content: String,
    },

    Error {
        content: String,
    },

    AgentStateChanged {
        agent_state: AgentState,
    },

    /// Outputs copied out of a finished delegate's state.
    AgentDelegate {
        #[serde(default)]
        outputs: serde_json::Map<String, serde_json::Value>,
    },

    Recall {
        content: String,
    },

    Mcp {
        content: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<serde_json::Value>,
    },

    /// The user declined a runnable action in confirmation mode.
    UserRejected {
        #[serde(default)]
        content: String,
    },

    Condensation {
        #[serde(default)]
        content: String,
    },

    BrowserOutput {
        url: String,
        content: String,
    },
}

impl Observation {
    /// Short error constructor; the most common observation the controller
    /// fabricates itself.
    pub fn error(content: impl Into<String>) -> Self {
        Observation::Error {
            content: content.into(),
        }
    }
}

/// Exit metadata framed into command output by the bash session prompt.
/// `prefix` and `suffix` wrap the content when the session needs to annotate
/// it (truncation notices, timeout instructions).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CmdOutputMetadata {
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(default = "default_pid")]
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub py_interpreter_path: Option<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

fn default_exit_code() -> i32 {
    -1
}

fn default_pid() -> i32 {
    -1
}

impl Default for CmdOutputMetadata {
    fn default() -> Self {
        Self {
            exit_code: default_exit_code(),
            pid: default_pid(),
            username: None,
            hostname: None,
            working_dir: None,
            py_interpreter_path: None,
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

/// Lifecycle of a command inside a bash session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandStatus {
    Completed,
    /// Still running; the caller may poll with empty input, interact, or
    /// interrupt.
    Continue,
    HardTimeout,
    Interrupted,
    Error,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cmd_output_wire_shape() {
        let obs = Observation::CmdOutput {
            content: "test\n".to_string(),
            command: "echo test".to_string(),
            metadata: CmdOutputMetadata {
                exit_code: 0,
                working_dir: Some("/workspace".to_string()),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&obs).unwrap();
        assert_eq!(value["kind"], "CmdOutput");
        assert_eq!(value["payload"]["metadata"]["exit_code"], 0);
        assert_eq!(value["payload"]["metadata"]["working_dir"], "/workspace");
    }

    #[test]
    fn metadata_defaults_to_unknown_exit() {
        let metadata: CmdOutputMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(metadata.exit_code, -1);
        assert_eq!(metadata.pid, -1);
        assert!(metadata.prefix.is_empty());
    }
}
