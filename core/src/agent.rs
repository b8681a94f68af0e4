//! The agent seam. The controller drives anything implementing [`Agent`];
//! how prompts are built and which LLM answers them is the implementer's
//! business.

use std::collections::HashMap;

use async_trait::async_trait;

use windlass_protocol::Action;

use crate::error::Result;
use crate::error::WindlassErr;
use crate::state::State;

#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    /// Propose the next action(s) given the current state. Returning an
    /// empty list is an error the controller surfaces.
    async fn step(&mut self, state: &State) -> Result<Vec<Action>>;

    /// Emitted into the stream once at session start, if any.
    fn system_message(&self) -> Option<String> {
        None
    }

    /// Drop any internal caches; called when a session is re-driven from a
    /// restored history.
    fn reset(&mut self) {}
}

pub type AgentFactory = Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Named agent constructors, consulted when an AgentDelegate action asks for
/// a sub-agent by name.
#[derive(Default)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AgentFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Agent>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| WindlassErr::AgentNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
