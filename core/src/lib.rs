//! Root of the `windlass-core` library: the agent execution core.
//!
//! The event stream is the sole coordination medium; the controller, the
//! runtime, and memory are all just subscribers that write back into it.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the appropriate abstraction (e.g.,
// the hosting UI or the tracing stack).
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod bash;
pub mod config;
pub mod control_flags;
pub mod controller;
pub mod error;
pub mod event_stream;
pub mod git;
pub mod metrics;
pub mod runtime;
pub mod state;
pub mod store;

pub use agent::Agent;
pub use agent::AgentRegistry;
pub use config::Config;
pub use control_flags::BudgetControlFlag;
pub use control_flags::IterationControlFlag;
pub use control_flags::SharedBudgetFlag;
pub use controller::AgentController;
pub use error::Result;
pub use error::WindlassErr;
pub use event_stream::EventStream;
pub use event_stream::SubscriberKind;
pub use git::GitHandler;
pub use metrics::Metrics;
pub use runtime::LocalRuntime;
pub use runtime::Runtime;
pub use state::State;
pub use store::FileStore;
pub use store::InMemoryFileStore;
pub use store::LocalFileStore;
