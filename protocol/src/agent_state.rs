use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// The controller state machine.
///
/// LOADING → INIT → RUNNING ⇄ AWAITING_USER_INPUT, with the confirmation
/// detour RUNNING → AWAITING_USER_CONFIRMATION → {USER_CONFIRMED,
/// USER_REJECTED} → RUNNING, and the terminal set {FINISHED, STOPPED, ERROR,
/// REJECTED}. PAUSED is re-enterable from RUNNING.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Loading,
    Init,
    Running,
    AwaitingUserInput,
    AwaitingUserConfirmation,
    UserConfirmed,
    UserRejected,
    Finished,
    Stopped,
    Error,
    Paused,
    Rejected,
}

impl AgentState {
    /// States that end the controller loop for the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Finished | AgentState::Stopped | AgentState::Error | AgentState::Rejected
        )
    }

    /// Whether a controller may move from `self` to `target`. The controller
    /// refuses illegal requests instead of silently clamping them.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        if *self == target {
            return true;
        }
        // Stopping or erroring out is always allowed; it is how sessions are
        // torn down from any point.
        if matches!(target, AgentState::Stopped | AgentState::Error) {
            return true;
        }
        match self {
            AgentState::Loading => matches!(target, AgentState::Init | AgentState::Running),
            AgentState::Init => matches!(
                target,
                AgentState::Running | AgentState::AwaitingUserInput | AgentState::Paused
            ),
            AgentState::Running => matches!(
                target,
                AgentState::AwaitingUserInput
                    | AgentState::AwaitingUserConfirmation
                    | AgentState::Paused
                    | AgentState::Finished
                    | AgentState::Rejected
            ),
            AgentState::AwaitingUserInput => {
                matches!(target, AgentState::Running | AgentState::Paused)
            }
            AgentState::AwaitingUserConfirmation => matches!(
                target,
                AgentState::UserConfirmed | AgentState::UserRejected | AgentState::Paused
            ),
            AgentState::UserConfirmed | AgentState::UserRejected => matches!(
                target,
                AgentState::Running | AgentState::AwaitingUserConfirmation
            ),
            AgentState::Paused => matches!(target, AgentState::Running),
            // A finished or rejected session can be revived by a fresh user
            // task; a session that errored out must be resumed explicitly.
            AgentState::Finished | AgentState::Rejected => {
                matches!(target, AgentState::Running | AgentState::Init)
            }
            AgentState::Error => matches!(target, AgentState::Running | AgentState::Init),
            AgentState::Stopped => matches!(target, AgentState::Init | AgentState::Running),
        }
    }
}
