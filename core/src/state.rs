//! Controller-scoped state: the history window, control flags, delegation
//! payloads, and the serialized snapshot a session is resumed from.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use windlass_protocol::ActionKind;
use windlass_protocol::AgentState;
use windlass_protocol::Event;
use windlass_protocol::EventPayload;

use crate::control_flags::IterationControlFlag;
use crate::control_flags::SharedBudgetFlag;
use crate::error::Result;
use crate::error::WindlassErr;
use crate::metrics::Metrics;
use crate::metrics::MetricsSnapshot;
use crate::store::FileStore;

/// Condensed, agent-facing view over a history. Events forgotten by a
/// condensation action are dropped; everything else is kept in order.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub events: Vec<Event>,
}

impl View {
    pub fn from_events(history: &[Event]) -> Self {
        let mut forgotten: Vec<i64> = Vec::new();
        for event in history {
            if let EventPayload::Action(action) = &event.payload
                && let ActionKind::Condensation {
                    forgotten_event_ids,
                    ..
                } = &action.kind
            {
                forgotten.extend_from_slice(forgotten_event_ids);
            }
        }
        let events = history
            .iter()
            .filter(|event| !forgotten.contains(&event.id))
            .cloned()
            .collect();
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    pub session_id: String,

    /// Rebuilt from the event stream on restore; never serialized.
    #[serde(skip)]
    pub history: Vec<Event>,

    pub iteration_flag: IterationControlFlag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_flag: Option<SharedBudgetFlag>,

    #[serde(default = "default_agent_state")]
    pub agent_state: AgentState,
    /// The state the session was in when it was saved; consulted once on
    /// resume while `agent_state` restarts from LOADING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<AgentState>,

    #[serde(default)]
    pub confirmation_mode: bool,

    #[serde(default)]
    pub metrics: Metrics,
    /// Parent's accounting at the moment of delegation, kept so a delegate's
    /// own spend can be reported separately from the inherited total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_metrics_snapshot: Option<MetricsSnapshot>,

    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub extra_data: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub last_error: String,
    /// Root controller is level 0; each delegation adds one.
    #[serde(default)]
    pub delegate_level: u32,

    /// Inclusive id range of this session's slice of the stream; −1 until
    /// the first event lands.
    #[serde(default = "default_event_bound")]
    pub start_id: i64,
    #[serde(default = "default_event_bound")]
    pub end_id: i64,

    #[serde(skip)]
    view_cache: Mutex<Option<(usize, Arc<View>)>>,
}

fn default_agent_state() -> AgentState {
    AgentState::Loading
}

fn default_event_bound() -> i64 {
    -1
}

impl State {
    pub fn new(session_id: impl Into<String>, iteration_flag: IterationControlFlag) -> Self {
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
            iteration_flag,
            budget_flag: None,
            agent_state: AgentState::Loading,
            resume_state: None,
            confirmation_mode: false,
            metrics: Metrics::default(),
            parent_metrics_snapshot: None,
            inputs: serde_json::Map::new(),
            outputs: serde_json::Map::new(),
            extra_data: serde_json::Map::new(),
            last_error: String::new(),
            delegate_level: 0,
            start_id: -1,
            end_id: -1,
            view_cache: Mutex::new(None),
        }
    }

    /// The condensed view over `history`, cached by history length. The
    /// cache never leaves memory: mutating history invalidates it through
    /// the length change, and snapshots never contain it.
    pub fn view(&self) -> Arc<View> {
        let checksum = self.history.len();
        let mut cache = match self.view_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached_checksum, view)) = cache.as_ref()
            && *cached_checksum == checksum
        {
            return Arc::clone(view);
        }
        let view = Arc::new(View::from_events(&self.history));
        *cache = Some((checksum, Arc::clone(&view)));
        view
    }

    /// Record an event into the history window and keep the id range
    /// consistent.
    pub fn push_history(&mut self, event: Event) {
        if self.start_id < 0 {
            self.start_id = event.id;
        }
        self.end_id = self.end_id.max(event.id);
        self.history.push(event);
    }

    /// Persist a snapshot (without history or any derived state) at
    /// `sessions/{sid}/state.json`, along with the metrics aggregate.
    pub fn save_to_session(&self, store: &dyn FileStore) -> Result<()> {
        let serialized = serde_json::to_string(self)?;
        store.write(&state_path(&self.session_id), &serialized)?;
        let metrics = serde_json::to_string(&self.metrics.snapshot())?;
        store.write(&metrics_path(&self.session_id), &metrics)?;
        Ok(())
    }

    /// Load a snapshot, tolerating and migrating the deprecated field layout
    /// of older snapshots. The restored state always begins in LOADING, with
    /// the saved agent state captured in `resume_state`.
    pub fn restore_from_session(session_id: &str, store: &dyn FileStore) -> Result<Self> {
        let raw = store
            .read(&state_path(session_id))
            .map_err(|_| WindlassErr::EventNotFound {
                session_id: session_id.to_string(),
                id: -1,
            })?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        migrate_legacy_fields(&mut value);

        let mut state: State = serde_json::from_value(value)?;
        state.resume_state = match state.agent_state {
            AgentState::Loading => None,
            saved => Some(saved),
        };
        state.agent_state = AgentState::Loading;
        state.history.clear();
        Ok(state)
    }
}

fn state_path(session_id: &str) -> String {
    format!("sessions/{session_id}/state.json")
}

fn metrics_path(session_id: &str) -> String {
    format!("sessions/{session_id}/metrics.json")
}

/// Rewrite a legacy snapshot in place into the current layout. Deprecated
/// fields are consumed here and never re-emitted on the next save:
/// `iteration`/`max_iterations` (and the delegate-era `local_iteration`)
/// fold into the iteration flag, `local_metrics` and `delegates` are
/// dropped, and `traffic_control_state` is dropped so the controller
/// reconstructs normal flow on resume.
fn migrate_legacy_fields(value: &mut serde_json::Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    let legacy_iteration = obj.remove("iteration").and_then(|v| v.as_i64());
    let legacy_max = obj.remove("max_iterations").and_then(|v| v.as_i64());
    obj.remove("local_iteration");

    if !obj.contains_key("iteration_flag") && (legacy_iteration.is_some() || legacy_max.is_some()) {
        let current = legacy_iteration.unwrap_or(0);
        let max = legacy_max.unwrap_or(crate::config::DEFAULT_MAX_ITERATIONS);
        debug!("migrating legacy iteration fields: current={current}, max={max}");
        obj.insert(
            "iteration_flag".to_string(),
            serde_json::json!({
                "current_value": current,
                "max_value": max,
                "limit_increase_amount": max,
            }),
        );
    }

    for deprecated in ["traffic_control_state", "local_metrics", "delegates"] {
        if obj.remove(deprecated).is_some() {
            debug!("dropping deprecated state field: {deprecated}");
        }
    }
}
