//! The runtime seam: whatever executes runnable actions.
//!
//! The core only relies on the contract: a runtime subscribes to the same
//! event stream as the controller and answers every runnable action with
//! exactly one observation whose `cause` is the action's id. The
//! [`LocalRuntime`] here is the reference implementation used by the
//! end-to-end tests: shell commands go to a bash session, file reads and
//! edits go to the local filesystem, everything else is reported as
//! unsupported.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use windlass_protocol::ActionKind;
use windlass_protocol::AgentState;
use windlass_protocol::ConfirmationState;
use windlass_protocol::Event;
use windlass_protocol::EventSource;
use windlass_protocol::Observation;

use crate::bash::BashSession;
use crate::error::Result;
use crate::event_stream::EventStream;
use crate::event_stream::SubscriberKind;

pub type StatusCallback = Box<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Attach to the session: subscribe to the stream and acquire whatever
    /// execution resources the runtime needs.
    async fn connect(&self) -> Result<()>;

    fn set_status_callback(&mut self, callback: StatusCallback);
}

pub struct LocalRuntime {
    stream: Arc<EventStream>,
    session: Arc<Mutex<Box<dyn BashSession>>>,
    /// A runnable action gated behind confirmation; executed when the user
    /// confirms, dropped when they reject.
    held_for_confirmation: Arc<StdMutex<Option<Event>>>,
    status_callback: Arc<StdMutex<Option<StatusCallback>>>,
}

impl LocalRuntime {
    pub fn new(stream: Arc<EventStream>, session: Box<dyn BashSession>) -> Self {
        Self {
            stream,
            session: Arc::new(Mutex::new(session)),
            held_for_confirmation: Arc::new(StdMutex::new(None)),
            status_callback: Arc::new(StdMutex::new(None)),
        }
    }

    async fn execute_action(
        stream: &EventStream,
        session: &Mutex<Box<dyn BashSession>>,
        event: &Event,
    ) {
        let Some(action) = event.as_action() else {
            return;
        };
        let observation = match &action.kind {
            ActionKind::CmdRun { .. } => {
                let mut session = session.lock().await;
                match session.execute(action).await {
                    Ok(observation) => observation,
                    Err(e) => Observation::error(e.to_string()),
                }
            }
            ActionKind::FileRead {
                path, view_range, ..
            } => match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let content = match view_range {
                        Some((start, end)) => {
                            let start = (*start).max(1) as usize;
                            let end = (*end).max(0) as usize;
                            content
                                .lines()
                                .skip(start - 1)
                                .take(end.saturating_sub(start - 1))
                                .collect::<Vec<_>>()
                                .join("\n")
                        }
                        None => content,
                    };
                    Observation::FileRead {
                        path: path.clone(),
                        content,
                    }
                }
                Err(e) => Observation::error(format!("failed to read {path}: {e}")),
            },
            ActionKind::FileEdit { path, content, .. } => {
                let Some(content) = content else {
                    let message = format!(
                        "structured edits are not supported by the local runtime: {path}"
                    );
                    let result = Observation::error(message);
                    Self::emit(stream, event.id, result);
                    return;
                };
                match tokio::fs::write(path, content).await {
                    Ok(()) => Observation::FileEdit {
                        path: path.clone(),
                        content: content.clone(),
                    },
                    Err(e) => Observation::error(format!("failed to write {path}: {e}")),
                }
            }
            other => Observation::error(format!(
                "action {other} is not supported by the local runtime"
            )),
        };
        Self::emit(stream, event.id, observation);
    }

    fn emit(stream: &EventStream, cause: i64, observation: Observation) {
        let event =
            Event::observation(EventSource::Environment, observation).with_cause(cause);
        if let Err(e) = stream.add_event(event, EventSource::Environment) {
            tracing::error!("runtime failed to append observation: {e}");
        }
    }

    fn report(&self, message: &str) {
        if let Ok(guard) = self.status_callback.lock()
            && let Some(callback) = guard.as_ref()
        {
            callback(message);
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn connect(&self) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            session.initialize().await?;
        }
        self.report("runtime connected");

        let stream = Arc::clone(&self.stream);
        let session = Arc::clone(&self.session);
        let held = Arc::clone(&self.held_for_confirmation);
        self.stream.subscribe(
            SubscriberKind::Runtime,
            Arc::new(move |event: Event| {
                let stream = Arc::clone(&stream);
                let session = Arc::clone(&session);
                let held = Arc::clone(&held);
                Box::pin(async move {
                    match &event.payload {
                        windlass_protocol::EventPayload::Action(action)
                            if event.source == EventSource::Agent && action.is_runnable() =>
                        {
                            match action.confirmation_state {
                                ConfirmationState::AwaitingConfirmation => {
                                    debug!("holding action {} for confirmation", event.id);
                                    if let Ok(mut guard) = held.lock() {
                                        *guard = Some(event.clone());
                                    }
                                }
                                ConfirmationState::Rejected => {}
                                ConfirmationState::Confirmed => {
                                    Self::execute_action(&stream, &session, &event).await;
                                }
                            }
                        }
                        windlass_protocol::EventPayload::Observation(
                            Observation::AgentStateChanged { agent_state },
                        ) if *agent_state == AgentState::UserConfirmed => {
                            let confirmed = held.lock().ok().and_then(|mut guard| guard.take());
                            if let Some(confirmed) = confirmed {
                                Self::execute_action(&stream, &session, &confirmed).await;
                            }
                        }
                        windlass_protocol::EventPayload::Observation(
                            Observation::UserRejected { .. },
                        ) => {
                            if let Ok(mut guard) = held.lock() {
                                *guard = None;
                            }
                        }
                        _ => {}
                    }
                    Ok(())
                })
            }),
            self.stream.session_id().to_string(),
        );
        Ok(())
    }

    fn set_status_callback(&mut self, callback: StatusCallback) {
        if let Ok(mut guard) = self.status_callback.lock() {
            *guard = Some(callback);
        }
    }
}
