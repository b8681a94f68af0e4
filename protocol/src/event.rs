use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::action::Action;
use crate::observation::Observation;

/// Sentinel id carried by an event that has not been appended to a stream
/// yet. The stream assigns the real id under its append lock.
pub const UNASSIGNED_ID: i64 = -1;

/// Envelope shared by every action and observation in a session.
///
/// `id` and `timestamp` are assigned by the event stream on append and are
/// immutable afterwards. `cause` points at the event this one responds to
/// (an observation's causing action, a rejection's rejected action, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default = "default_id")]
    pub id: i64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(default)]
    pub cause: Option<i64>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(default)]
    pub tool_call_metadata: Option<ToolCallMetadata>,
    /// Identifier of the LLM call that produced this event, used to link
    /// per-call metrics back to the transcript.
    #[serde(default)]
    pub response_id: Option<String>,
}

fn default_id() -> i64 {
    UNASSIGNED_ID
}

impl Event {
    /// Build a not-yet-appended event around an action payload.
    pub fn action(source: EventSource, action: Action) -> Self {
        Self::new(source, EventPayload::Action(action))
    }

    /// Build a not-yet-appended event around an observation payload.
    pub fn observation(source: EventSource, observation: Observation) -> Self {
        Self::new(source, EventPayload::Observation(observation))
    }

    fn new(source: EventSource, payload: EventPayload) -> Self {
        Self {
            id: UNASSIGNED_ID,
            timestamp: Utc::now(),
            source,
            cause: None,
            payload,
            tool_call_metadata: None,
            response_id: None,
        }
    }

    pub fn with_cause(mut self, cause: i64) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            EventPayload::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Action(_) => None,
            EventPayload::Observation(observation) => Some(observation),
        }
    }

    /// True when the runtime is expected to execute this event and answer it
    /// with a matching observation.
    pub fn is_runnable(&self) -> bool {
        self.as_action().is_some_and(Action::is_runnable)
    }
}

/// Who put the event on the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

/// An event is either an action (something proposed) or an observation
/// (something that happened). The split is carried on the wire as
/// `"type": "action" | "observation"` with the variant tag under `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
}

/// Raw linkage between an event and the model tool call that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCallMetadata {
    pub tool_call_id: String,
    pub function_name: String,
    /// The raw model response the tool call was extracted from. Kept opaque:
    /// the core never interprets it, it only rides along for replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_response: Option<serde_json::Value>,
    #[serde(default)]
    pub total_calls_in_response: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use pretty_assertions::assert_eq;

    /// The wire shape of an event is load-bearing: persisted sessions are
    /// replayed from these JSON documents.
    #[test]
    fn serialize_action_event() {
        let mut event = Event::action(
            EventSource::Agent,
            Action::from(ActionKind::CmdRun {
                command: "ls".to_string(),
                is_input: false,
                hard_timeout_ms: None,
            }),
        );
        event.id = 3;
        let at = DateTime::parse_from_rfc3339("2025-01-02T03:04:05Z").unwrap();
        event.timestamp = at.with_timezone(&Utc);

        let serialized = serde_json::to_value(&event).unwrap();
        assert_eq!(
            serialized,
            serde_json::json!({
                "id": 3,
                "timestamp": "2025-01-02T03:04:05Z",
                "source": "AGENT",
                "cause": null,
                "type": "action",
                "kind": "CmdRun",
                "payload": {
                    "command": "ls",
                    "is_input": false,
                },
                "tool_call_metadata": null,
                "response_id": null,
            }),
        );
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = Event::observation(
            EventSource::Environment,
            Observation::Error {
                content: "boom".to_string(),
            },
        )
        .with_cause(7);

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
