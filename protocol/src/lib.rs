//! Data model shared by every component of a windlass session: the event
//! envelope, the action/observation variants, and the agent state machine.
//!
//! This crate is purely declarative. It performs no I/O and holds no locks so
//! that the wire shapes can be reused by servers, runtimes and test harnesses
//! without dragging in the execution core.

mod action;
mod agent_state;
mod event;
mod observation;
mod task;

pub use action::Action;
pub use action::ActionKind;
pub use action::ConfirmationState;
pub use action::FileEditCommand;
pub use action::FileReadSource;
pub use action::RecallType;
pub use agent_state::AgentState;
pub use event::Event;
pub use event::EventPayload;
pub use event::EventSource;
pub use event::ToolCallMetadata;
pub use observation::CmdOutputMetadata;
pub use observation::CommandStatus;
pub use observation::Observation;
pub use task::ProviderType;
pub use task::TaskType;
