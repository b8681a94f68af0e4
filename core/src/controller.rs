//! The controller state machine driving one agent through its session.
//!
//! The controller is the only component that mutates its [`State`]. It runs
//! as a single driver consuming an ordered queue fed by the stream
//! subscription, so no two events are ever handled concurrently and a step
//! is never attempted while the previous runnable action is still waiting
//! for its observation.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use windlass_protocol::Action;
use windlass_protocol::ActionKind;
use windlass_protocol::AgentState;
use windlass_protocol::ConfirmationState;
use windlass_protocol::Event;
use windlass_protocol::EventPayload;
use windlass_protocol::EventSource;
use windlass_protocol::Observation;

use crate::agent::Agent;
use crate::agent::AgentRegistry;
use crate::config::Config;
use crate::control_flags::BudgetControlFlag;
use crate::control_flags::IterationControlFlag;
use crate::control_flags::SharedBudgetFlag;
use crate::error::Result;
use crate::error::WindlassErr;
use crate::event_stream::EventStream;
use crate::event_stream::SubscriberKind;
use crate::state::State;

const SET_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentController {
    inner: Arc<ControllerInner>,
    driver: Option<JoinHandle<()>>,
}

struct ControllerInner {
    id: String,
    stream: Arc<EventStream>,
    registry: Arc<AgentRegistry>,
    agent: Mutex<Box<dyn Agent>>,
    state: Mutex<State>,
    headless: bool,
    confirmation_mode: bool,
    iteration_delta: i64,

    /// Id of the runnable action whose observation has not arrived yet.
    pending_action: StdMutex<Option<i64>>,
    /// Runnable action parked until the user confirms or rejects it.
    awaiting_confirmation: StdMutex<Option<Event>>,
    /// Active delegation, if any. While set, the parent only forwards.
    delegate: Mutex<Option<Delegation>>,
    state_tx: watch::Sender<AgentState>,
    closed: AtomicBool,
}

struct Delegation {
    child: AgentController,
    action_id: i64,
    parent_iteration_before: i64,
}

impl AgentController {
    /// Construct a root controller: seeds the control flags, subscribes to
    /// the stream, and emits the agent's system message once for fresh
    /// sessions.
    pub async fn new(
        stream: Arc<EventStream>,
        agent: Box<dyn Agent>,
        registry: Arc<AgentRegistry>,
        config: &Config,
        initial_state: Option<State>,
    ) -> Result<AgentController> {
        let controller = Self::build(
            Arc::clone(&stream),
            agent,
            registry,
            config,
            initial_state,
            0,
            None,
        )
        .await?;

        // Feed the driver through a bounded queue so stream fan-out and
        // event handling stay decoupled.
        let (queue_tx, queue_rx) = async_channel::bounded::<Event>(64);
        let inner = Arc::clone(&controller.inner);
        let driver = tokio::spawn(async move {
            while let Ok(event) = queue_rx.recv().await {
                inner.handle_event(event).await;
            }
            debug!("controller driver exited");
        });

        let callback_id = controller.inner.id.clone();
        stream.subscribe(
            SubscriberKind::AgentController,
            Arc::new(move |event: Event| {
                let queue_tx = queue_tx.clone();
                Box::pin(async move {
                    queue_tx
                        .send(event)
                        .await
                        .map_err(|_| anyhow::anyhow!("controller queue closed"))
                })
            }),
            callback_id,
        );

        let mut controller = controller;
        controller.driver = Some(driver);
        Ok(controller)
    }

    async fn build(
        stream: Arc<EventStream>,
        agent: Box<dyn Agent>,
        registry: Arc<AgentRegistry>,
        config: &Config,
        initial_state: Option<State>,
        delegate_level: u32,
        shared: Option<(crate::metrics::Metrics, Option<SharedBudgetFlag>)>,
    ) -> Result<AgentController> {
        let sid = stream.session_id().to_string();
        let restored = initial_state.is_some();
        let mut state = match initial_state {
            Some(state) => state,
            None => {
                let flag = if delegate_level == 0 {
                    IterationControlFlag::new(config.max_iterations, config.iteration_delta)
                } else {
                    IterationControlFlag::new(config.iteration_delta, config.iteration_delta)
                };
                State::new(sid.clone(), flag)
            }
        };
        state.confirmation_mode = config.confirmation_mode;
        state.delegate_level = delegate_level;

        // Snapshots never carry history; a resumed session rebuilds it from
        // the stream before the agent sees the state.
        if restored && state.history.is_empty() {
            let start = (state.start_id >= 0).then_some(state.start_id);
            let end = (state.end_id >= 0).then_some(state.end_id);
            let events: Vec<Event> = stream.get_events(start, end, false, None).collect();
            for event in events {
                state.push_history(event);
            }
        }

        match shared {
            Some((metrics, budget_flag)) => {
                // Delegates alias the parent's accounting and budget.
                state.parent_metrics_snapshot = Some(metrics.snapshot());
                state.metrics = metrics;
                state.budget_flag = budget_flag;
            }
            None => {
                // The root controller's accounting is the session's: fold
                // anything a restored snapshot carried into the stream's
                // handle and alias it.
                let session_metrics = stream.metrics();
                let carried = state.metrics.snapshot();
                if !carried.is_empty() {
                    session_metrics.merge(&carried);
                }
                state.metrics = session_metrics;
                if state.budget_flag.is_none()
                    && let Some(max_budget) = config.max_budget_per_task
                {
                    state.budget_flag = Some(SharedBudgetFlag::new(BudgetControlFlag::new(
                        max_budget,
                        config.budget_delta,
                    )));
                }
            }
        }

        let system_message = agent.system_message();
        let (state_tx, _) = watch::channel(state.agent_state);
        let id = if delegate_level == 0 {
            sid.clone()
        } else {
            format!("{sid}-delegate-{delegate_level}")
        };

        let controller = AgentController {
            inner: Arc::new(ControllerInner {
                id,
                stream: Arc::clone(&stream),
                registry,
                agent: Mutex::new(agent),
                state: Mutex::new(state),
                headless: config.headless,
                confirmation_mode: config.confirmation_mode,
                iteration_delta: config.iteration_delta,
                pending_action: StdMutex::new(None),
                awaiting_confirmation: StdMutex::new(None),
                delegate: Mutex::new(None),
                state_tx,
                closed: AtomicBool::new(false),
            }),
            driver: None,
        };

        // Fresh sessions lead with the agent's system message; resumed ones
        // already have it in their history.
        if delegate_level == 0
            && stream.get_latest_event_id() < 0
            && let Some(content) = system_message
        {
            let event = Event::action(
                EventSource::Agent,
                Action::from(ActionKind::Message {
                    content,
                    wait_for_response: false,
                }),
            );
            stream.add_event(event, EventSource::Agent)?;
        }

        Ok(controller)
    }

    /// Write a ChangeAgentState action and wait until the driver has applied
    /// it (or refused it as illegal).
    pub async fn set_agent_state_to(&self, target: AgentState) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if !state.agent_state.can_transition_to(target) {
                return Err(WindlassErr::IllegalStateTransition {
                    from: state.agent_state.to_string(),
                    to: target.to_string(),
                });
            }
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        let event = Event::action(
            EventSource::User,
            Action::from(ActionKind::ChangeAgentState {
                agent_state: target,
            }),
        );
        self.inner.stream.add_event(event, EventSource::User)?;

        // Confirmation decisions are transient: the controller moves through
        // them straight back to RUNNING, so the watch may only ever show the
        // follow-up state.
        let accepts = move |state: AgentState| {
            state == target
                || (matches!(
                    target,
                    AgentState::UserConfirmed | AgentState::UserRejected
                ) && state == AgentState::Running)
        };
        let reached = tokio::time::timeout(SET_STATE_TIMEOUT, async {
            loop {
                if accepts(*state_rx.borrow_and_update()) {
                    return true;
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(WindlassErr::InternalControllerDied),
            Err(_) => Err(WindlassErr::IllegalStateTransition {
                from: self.agent_state().await.to_string(),
                to: target.to_string(),
            }),
        }
    }

    pub async fn agent_state(&self) -> AgentState {
        self.inner.state.lock().await.agent_state
    }

    /// Run `f` against the live state. Used by callers that need more than
    /// the agent state (metrics, flags, outputs) without cloning the whole
    /// thing.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        f(&mut state)
    }

    /// Extend the iteration ceiling after a quota refusal; obeys headless
    /// policy. The budget flag is extended through the state's shared flag.
    pub async fn increase_iteration_limit(&self) {
        let mut state = self.inner.state.lock().await;
        let headless = self.inner.headless;
        state.iteration_flag.increase_limit(headless);
    }

    /// Unsubscribe and release resources; the state snapshot is persisted so
    /// the session can be resumed.
    pub async fn close(&mut self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .stream
            .unsubscribe(SubscriberKind::AgentController, &self.inner.id);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }

        let mut delegate = self.inner.delegate.lock().await;
        if let Some(mut delegation) = delegate.take() {
            Box::pin(delegation.child.close()).await?;
        }
        drop(delegate);

        let mut state = self.inner.state.lock().await;
        if !state.agent_state.is_terminal() {
            state.agent_state = AgentState::Stopped;
            let _ = self.inner.state_tx.send(AgentState::Stopped);
        }
        if state.delegate_level == 0 {
            state.save_to_session(self.inner.stream.store().as_ref())?;
        }
        Ok(())
    }
}

impl ControllerInner {
    /// Sole entry point for events, invoked sequentially by the driver (or,
    /// for delegates, by the parent).
    async fn handle_event(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // While a delegation is active the parent is paused: events flow to
        // the child until it reaches a terminal state.
        let mut delegate_guard = self.delegate.lock().await;
        if let Some(delegation) = delegate_guard.as_mut() {
            Box::pin(delegation.child.inner.handle_event(event)).await;
            let child_state = delegation.child.agent_state().await;
            if matches!(
                child_state,
                AgentState::Finished | AgentState::Rejected | AgentState::Error
            ) {
                let delegation = delegate_guard.take();
                drop(delegate_guard);
                if let Some(delegation) = delegation {
                    self.end_delegation(delegation, child_state).await;
                }
            }
            return;
        }
        drop(delegate_guard);

        if let Err(e) = self.dispatch(event).await {
            self.handle_controller_error(e).await;
        }
        self.maybe_step().await;
    }

    async fn dispatch(&self, event: Event) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.push_history(event.clone());
        }

        match &event.payload {
            EventPayload::Action(action) => match &action.kind {
                ActionKind::ChangeAgentState { agent_state } => {
                    self.apply_state_change(*agent_state, &event).await?;
                }
                ActionKind::Message { .. } if event.source == EventSource::User => {
                    let current = self.state.lock().await.agent_state;
                    if current.can_transition_to(AgentState::Running) {
                        self.transition(AgentState::Running).await?;
                    }
                }
                _ if event.source == EventSource::Agent
                    && action.is_runnable()
                    && action.confirmation_state == ConfirmationState::Confirmed =>
                {
                    if let Ok(mut pending) = self.pending_action.lock() {
                        *pending = Some(event.id);
                    }
                }
                _ => {}
            },
            EventPayload::Observation(observation) => {
                let cleared = {
                    let mut pending = self
                        .pending_action
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if event.cause.is_some() && *pending == event.cause {
                        pending.take()
                    } else {
                        None
                    }
                };
                if let Some(action_id) = cleared {
                    debug!("observation {} answers pending action {action_id}", event.id);
                }

                // An externally injected terminal state change shuts the
                // loop down for this session.
                if let Observation::AgentStateChanged { agent_state } = observation
                    && agent_state.is_terminal()
                {
                    info!("session {} reached terminal state {agent_state}", self.id);
                    let mut state = self.state.lock().await;
                    if !state.agent_state.is_terminal() {
                        state.agent_state = *agent_state;
                        let _ = self.state_tx.send(*agent_state);
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a requested state transition, refusing illegal ones with an
    /// error observation rather than silently clamping.
    async fn apply_state_change(&self, target: AgentState, event: &Event) -> Result<()> {
        let current = self.state.lock().await.agent_state;
        if !current.can_transition_to(target) {
            warn!("refusing illegal transition {current} -> {target}");
            self.append_observation(
                Observation::error(format!(
                    "illegal agent state transition: {current} -> {target}"
                )),
                Some(event.id),
            )?;
            return Ok(());
        }

        match target {
            AgentState::UserRejected => {
                self.transition(AgentState::UserRejected).await?;
                let rejected = self
                    .awaiting_confirmation
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(rejected) = rejected {
                    self.append_observation(
                        Observation::UserRejected {
                            content: "The user rejected the action.".to_string(),
                        },
                        Some(rejected.id),
                    )?;
                }
                self.transition(AgentState::Running).await?;
            }
            AgentState::UserConfirmed => {
                self.transition(AgentState::UserConfirmed).await?;
                let confirmed = self
                    .awaiting_confirmation
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(confirmed) = confirmed
                    && let Ok(mut pending) = self.pending_action.lock()
                {
                    // The runtime executes the held action when it sees the
                    // UserConfirmed announcement; from here on it is pending.
                    *pending = Some(confirmed.id);
                }
                self.append_observation(
                    Observation::AgentStateChanged {
                        agent_state: AgentState::UserConfirmed,
                    },
                    Some(event.id),
                )?;
                self.transition(AgentState::Running).await?;
            }
            other => {
                self.transition(other).await?;
            }
        }
        Ok(())
    }

    /// Step when running with nothing outstanding.
    async fn maybe_step(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let has_pending = self
                .pending_action
                .lock()
                .map(|pending| pending.is_some())
                .unwrap_or(false);
            let has_awaiting = self
                .awaiting_confirmation
                .lock()
                .map(|awaiting| awaiting.is_some())
                .unwrap_or(false);
            if has_pending || has_awaiting {
                return;
            }
        }
        if self.delegate.lock().await.is_some() {
            return;
        }
        if self.state.lock().await.agent_state != AgentState::Running {
            return;
        }

        if let Err(e) = self.step().await {
            self.handle_controller_error(e).await;
        }
    }

    async fn step(&self) -> Result<()> {
        // Quota checks first: iterations advance here, cost is synced in
        // from the shared metrics.
        {
            let mut state = self.state.lock().await;
            state.iteration_flag.step()?;
            let accumulated = state.metrics.accumulated_cost();
            if let Some(budget_flag) = &state.budget_flag {
                budget_flag.with(|flag| {
                    flag.sync_current(accumulated);
                    flag.step()
                })?;
            }
        }

        let actions = {
            let mut agent = self.agent.lock().await;
            let state = self.state.lock().await;
            agent.step(&state).await?
        };
        if actions.is_empty() {
            return Err(WindlassErr::EmptyAgentResponse);
        }

        for action in actions {
            match &action.kind {
                ActionKind::AgentFinish {
                    final_thought,
                    task_completed,
                } => {
                    {
                        let mut state = self.state.lock().await;
                        state.outputs.insert(
                            "final_thought".to_string(),
                            serde_json::Value::String(final_thought.clone()),
                        );
                        if let Some(task_completed) = task_completed {
                            state.outputs.insert(
                                "task_completed".to_string(),
                                serde_json::Value::Bool(*task_completed),
                            );
                        }
                    }
                    self.append_action(action)?;
                    self.transition(AgentState::Finished).await?;
                    break;
                }
                ActionKind::AgentDelegate { .. } => {
                    Box::pin(self.start_delegation(action)).await?;
                    break;
                }
                _ => {
                    let runnable = action.is_runnable();
                    if runnable && self.confirmation_mode {
                        let mut gated = action;
                        gated.confirmation_state = ConfirmationState::AwaitingConfirmation;
                        let id = self.append_action(gated.clone())?;
                        let mut held = Event::action(EventSource::Agent, gated);
                        held.id = id;
                        if let Ok(mut awaiting) = self.awaiting_confirmation.lock() {
                            *awaiting = Some(held);
                        }
                        self.transition(AgentState::AwaitingUserConfirmation).await?;
                        break;
                    }
                    self.append_action(action)?;
                }
            }
        }
        Ok(())
    }

    async fn start_delegation(&self, action: Action) -> Result<()> {
        let ActionKind::AgentDelegate { agent, inputs } = &action.kind else {
            return Err(WindlassErr::ToolValidation(
                "start_delegation requires an AgentDelegate action".to_string(),
            ));
        };
        let agent_name = agent.clone();
        let inputs = inputs.clone();

        let action_id = self.append_action(action)?;
        let sub_agent = self.registry.create(&agent_name)?;

        let (metrics, budget_flag, delegate_level, parent_iteration) = {
            let state = self.state.lock().await;
            (
                state.metrics.clone(),
                state.budget_flag.clone(),
                state.delegate_level + 1,
                state.iteration_flag.current_value,
            )
        };

        let config = Config {
            iteration_delta: self.iteration_delta,
            confirmation_mode: self.confirmation_mode,
            headless: self.headless,
            ..Default::default()
        };
        let mut child = AgentController::build(
            Arc::clone(&self.stream),
            sub_agent,
            Arc::clone(&self.registry),
            &config,
            None,
            delegate_level,
            Some((metrics, budget_flag)),
        )
        .await?;
        {
            let mut child_state = child.inner.state.lock().await;
            child_state.inputs = inputs;
            child_state.agent_state = AgentState::Running;
            let _ = child.inner.state_tx.send(AgentState::Running);
        }
        info!("delegating to {agent_name} (level {delegate_level})");

        // Kick the child's first step directly; subsequent activity arrives
        // through forwarded events.
        child.inner.maybe_step().await;
        child.driver = None;

        let mut delegate = self.delegate.lock().await;
        *delegate = Some(Delegation {
            child,
            action_id,
            // The step that issued the delegation is accounted separately.
            parent_iteration_before: parent_iteration - 1,
        });
        Ok(())
    }

    async fn end_delegation(&self, mut delegation: Delegation, child_state: AgentState) {
        let (outputs, child_iterations) = {
            let child = delegation.child.inner.state.lock().await;
            (child.outputs.clone(), child.iteration_flag.current_value)
        };

        {
            let mut state = self.state.lock().await;
            state.iteration_flag.current_value =
                delegation.parent_iteration_before + 1 + child_iterations;
        }
        info!(
            "delegation finished with {child_state}; child took {child_iterations} iterations"
        );

        if let Err(e) = delegation.child.close().await {
            warn!("failed to close delegate: {e}");
        }

        let result = self.append_observation(
            Observation::AgentDelegate { outputs },
            Some(delegation.action_id),
        );
        if let Err(e) = result {
            self.handle_controller_error(e).await;
        }
    }

    /// Every caught error lands here: record it and surface it on the
    /// stream. Tool-validation failures feed back into the loop so the
    /// agent can self-correct; everything else parks the session in ERROR.
    async fn handle_controller_error(&self, error: WindlassErr) {
        error!("controller {} error: {error}", self.id);
        {
            let mut state = self.state.lock().await;
            state.last_error = error.to_string();
        }
        if let Err(e) = self.append_observation(Observation::error(error.to_string()), None) {
            error!("failed to surface controller error: {e}");
        }
        if matches!(error, WindlassErr::ToolValidation(_)) {
            return;
        }
        if let Err(e) = self.transition(AgentState::Error).await {
            error!("failed to transition to ERROR: {e}");
        }
    }

    /// Mutate the agent state. Routine transitions stay off the durable
    /// stream (the watch channel serves in-process observers); the
    /// confirmation decision is the one transition announced on the stream,
    /// since the runtime acts on it.
    async fn transition(&self, target: AgentState) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.agent_state == target {
                return Ok(());
            }
            state.agent_state = target;
            if state.delegate_level == 0
                && (target == AgentState::Paused || target == AgentState::Stopped)
            {
                // Pause and shutdown are the resume points; snapshot now.
                if let Err(e) = state.save_to_session(self.stream.store().as_ref()) {
                    warn!("failed to snapshot state on {target}: {e}");
                }
            }
        }
        let _ = self.state_tx.send(target);
        Ok(())
    }

    fn append_action(&self, action: Action) -> Result<i64> {
        let event = Event::action(EventSource::Agent, action);
        self.stream.add_event(event, EventSource::Agent)
    }

    fn append_observation(&self, observation: Observation, cause: Option<i64>) -> Result<i64> {
        let mut event = Event::observation(EventSource::Environment, observation);
        event.cause = cause;
        self.stream.add_event(event, EventSource::Environment)
    }
}
