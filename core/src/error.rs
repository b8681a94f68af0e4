use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WindlassErr>;

#[derive(Error, Debug)]
pub enum WindlassErr {
    /// The iteration control flag refused another step. The message carries
    /// the current and maximum values so it can be surfaced verbatim.
    #[error("reached maximum iteration, current iteration: {current}, max iteration: {max}")]
    ReachedMaxIteration { current: i64, max: i64 },

    /// The budget control flag refused another step.
    #[error(
        "reached maximum budget for conversation, current budget: {current:.2}, max budget: {max:.2}"
    )]
    ReachedMaxBudget { current: f64, max: f64 },

    /// The event stream could not persist an event. Fatal to the session:
    /// subscribers were not notified and the id was not handed out.
    #[error("failed to persist event {id} for session {session_id}: {source}")]
    Persist {
        session_id: String,
        id: i64,
        #[source]
        source: io::Error,
    },

    /// A requested event does not exist in the session's range.
    #[error("no event with id {id} in session {session_id}")]
    EventNotFound { session_id: String, id: i64 },

    /// The model asked for a tool with missing or malformed arguments. Fed
    /// back into the agent loop so it can self-correct; never fatal.
    #[error("tool call validation failed: {0}")]
    ToolValidation(String),

    /// The requested agent state transition is not legal from the current
    /// state.
    #[error("illegal agent state transition: {from} -> {to}")]
    IllegalStateTransition { from: String, to: String },

    /// The agent produced no actions for a step.
    #[error("agent returned an empty set of actions")]
    EmptyAgentResponse,

    /// No sub-agent registered under the requested name.
    #[error("no agent registered with name: {0}")]
    AgentNotRegistered(String),

    /// The bash session is unusable (not initialized, closed, or its
    /// terminal is broken beyond the reset path).
    #[error("bash session error: {0}")]
    Session(String),

    /// The controller's driver loop died unexpectedly.
    #[error("internal error; controller loop died unexpectedly")]
    InternalControllerDied,

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WindlassErr {
    /// Quota errors terminate the step loop but are recoverable through
    /// `increase_limit`; everything the controller catches is mapped onto an
    /// error observation either way.
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            WindlassErr::ReachedMaxIteration { .. } | WindlassErr::ReachedMaxBudget { .. }
        )
    }
}
