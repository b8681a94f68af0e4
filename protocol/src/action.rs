use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::agent_state::AgentState;

/// An action proposed by the agent (or injected by the user). The variant
/// payload carries exactly the fields the runtime needs to execute it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Free-form agent commentary attached to the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Raw reasoning emitted by the model alongside the tool call. Only the
    /// first action extracted from a model response carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "ConfirmationState::is_confirmed")]
    pub confirmation_state: ConfirmationState,
}

impl Action {
    pub fn is_runnable(&self) -> bool {
        self.kind.is_runnable()
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }
}

impl From<ActionKind> for Action {
    fn from(kind: ActionKind) -> Self {
        Self {
            kind,
            thought: None,
            reasoning_content: None,
            confirmation_state: ConfirmationState::Confirmed,
        }
    }
}

/// Whether a runnable action has been cleared for execution when the session
/// runs in confirmation mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfirmationState {
    #[default]
    Confirmed,
    Rejected,
    AwaitingConfirmation,
}

impl ConfirmationState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationState::Confirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Display)]
#[serde(tag = "kind", content = "payload")]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum ActionKind {
    /// Plain message to the user; never executed.
    Message {
        content: String,
        #[serde(default)]
        wait_for_response: bool,
    },

    /// Run a shell command in the session's bash surface, or feed input to a
    /// process that is already running there.
    CmdRun {
        command: String,
        #[serde(default)]
        is_input: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hard_timeout_ms: Option<u64>,
    },

    FileRead {
        path: String,
        /// Inclusive 1-based line range; `None` reads the whole file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        view_range: Option<(i64, i64)>,
        #[serde(default)]
        source: FileReadSource,
    },

    FileEdit {
        path: String,
        /// Whole-file content for plain writes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Structured edit fields, used instead of `content`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<FileEditCommand>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_str: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_str: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        insert_line: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_text: Option<String>,
    },

    IPythonRunCell {
        code: String,
    },

    BrowseUrl {
        url: String,
    },

    BrowseInteractive {
        browser_actions: String,
    },

    /// Hand the task to a named sub-agent. The delegating controller pauses
    /// until the child reaches a terminal state.
    AgentDelegate {
        agent: String,
        #[serde(default)]
        inputs: serde_json::Map<String, serde_json::Value>,
    },

    AgentFinish {
        #[serde(default)]
        final_thought: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_completed: Option<bool>,
    },

    AgentThink {
        thought: String,
    },

    ChangeAgentState {
        agent_state: AgentState,
    },

    /// Drop a prefix of the visible history, optionally replacing it with a
    /// summary event.
    Condensation {
        #[serde(default)]
        forgotten_event_ids: Vec<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    McpCallTool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<serde_json::Value>,
    },

    /// Ask memory for workspace context or microagent knowledge. Answered by
    /// the memory subscriber, not the runtime.
    Recall {
        query: String,
        #[serde(default)]
        recall_type: RecallType,
    },
}

impl ActionKind {
    /// True for the kinds that produce a side effect the runtime executes.
    /// Everything else is consumed by the controller or the memory
    /// subscriber.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ActionKind::CmdRun { .. }
                | ActionKind::FileRead { .. }
                | ActionKind::FileEdit { .. }
                | ActionKind::IPythonRunCell { .. }
                | ActionKind::BrowseUrl { .. }
                | ActionKind::BrowseInteractive { .. }
                | ActionKind::McpCallTool { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileReadSource {
    #[default]
    Default,
    OhAci,
}

/// Structured editor verbs, mirroring the str-replace editor tool surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileEditCommand {
    View,
    Create,
    StrReplace,
    Insert,
    UndoEdit,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecallType {
    #[default]
    WorkspaceContext,
    Knowledge,
}
