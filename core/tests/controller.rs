//! End-to-end controller scenarios: a scripted agent drives real sessions
//! over an in-memory store, with the local runtime executing shell actions.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use windlass_core::Agent;
use windlass_core::AgentController;
use windlass_core::AgentRegistry;
use windlass_core::Config;
use windlass_core::EventStream;
use windlass_core::InMemoryFileStore;
use windlass_core::LocalRuntime;
use windlass_core::Runtime;
use windlass_core::State;
use windlass_core::bash::SubprocessBashSession;
use windlass_core::error::Result;

use windlass_protocol::Action;
use windlass_protocol::ActionKind;
use windlass_protocol::AgentState;
use windlass_protocol::ConfirmationState;
use windlass_protocol::Event;
use windlass_protocol::EventPayload;
use windlass_protocol::EventSource;
use windlass_protocol::Observation;

/// Plays back a fixed list of steps; optionally charges a cost per step so
/// budget behavior can be exercised, and optionally dawdles per step like a
/// real model call would.
struct ScriptedAgent {
    name: String,
    steps: Mutex<VecDeque<Vec<Action>>>,
    cost_per_step: f64,
    step_delay: Duration,
}

impl ScriptedAgent {
    fn new(name: &str, steps: Vec<Vec<Action>>, cost_per_step: f64) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(steps.into()),
            cost_per_step,
            step_delay: Duration::ZERO,
        }
    }

    fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn step(&mut self, state: &State) -> Result<Vec<Action>> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        if self.cost_per_step > 0.0 {
            state.metrics.add_cost(self.cost_per_step);
        }
        let next = self.steps.lock().unwrap().pop_front();
        Ok(next.unwrap_or_default())
    }
}

fn cmd_run(command: &str) -> Action {
    Action::from(ActionKind::CmdRun {
        command: command.to_string(),
        is_input: false,
        hard_timeout_ms: None,
    })
}

fn finish() -> Action {
    Action::from(ActionKind::AgentFinish {
        final_thought: "done".to_string(),
        task_completed: Some(true),
    })
}

fn think(thought: &str) -> Action {
    Action::from(ActionKind::AgentThink {
        thought: thought.to_string(),
    })
}

fn user_message(text: &str) -> Event {
    Event::action(
        EventSource::User,
        Action::from(ActionKind::Message {
            content: text.to_string(),
            wait_for_response: false,
        }),
    )
}

async fn wait_for_state(controller: &AgentController, target: AgentState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if controller.agent_state().await == target {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {target}, currently {}",
            controller.agent_state().await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn collect_events(stream: &EventStream) -> Vec<Event> {
    stream.get_events(None, None, false, None).collect()
}

struct Harness {
    stream: Arc<EventStream>,
    controller: AgentController,
    _runtime: LocalRuntime,
}

async fn harness(
    sid: &str,
    config: Config,
    agent: ScriptedAgent,
    registry: AgentRegistry,
) -> Harness {
    let stream = Arc::new(EventStream::new(sid, Arc::new(InMemoryFileStore::new())));
    let session = SubprocessBashSession::new(&config);
    let runtime = LocalRuntime::new(Arc::clone(&stream), Box::new(session));
    runtime.connect().await.expect("runtime connect");

    let controller = AgentController::new(
        Arc::clone(&stream),
        Box::new(agent),
        Arc::new(registry),
        &config,
        None,
    )
    .await
    .expect("controller");

    Harness {
        stream,
        controller,
        _runtime: runtime,
    }
}

fn test_config() -> Config {
    Config {
        work_dir: std::env::temp_dir(),
        ..Default::default()
    }
}

/// User task, one command, one observation, then finish; the stream is
/// exactly the four events and ids are contiguous from zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simple_completion_produces_exactly_four_events() {
    let sid = format!("simple-{}", uuid::Uuid::new_v4());
    let agent = ScriptedAgent::new("coder", vec![vec![cmd_run("ls")], vec![finish()]], 0.0);
    let mut h = harness(&sid, test_config(), agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("list files"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;

    let events = collect_events(&h.stream);
    assert_eq!(events.len(), 4, "events: {events:#?}");
    assert_eq!(
        events.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    match &events[1].payload {
        EventPayload::Action(action) => {
            assert!(matches!(&action.kind, ActionKind::CmdRun { command, .. } if command == "ls"));
        }
        other => panic!("expected CmdRun action, got {other:?}"),
    }
    match &events[2].payload {
        EventPayload::Observation(Observation::CmdOutput { metadata, .. }) => {
            assert_eq!(metadata.exit_code, 0);
            assert_eq!(events[2].cause, Some(1));
        }
        other => panic!("expected CmdOutput observation, got {other:?}"),
    }
    match &events[3].payload {
        EventPayload::Action(action) => {
            assert!(matches!(&action.kind, ActionKind::AgentFinish { .. }));
        }
        other => panic!("expected AgentFinish action, got {other:?}"),
    }

    h.controller.close().await.unwrap();
}

/// The budget flag trips once cost is synced past the ceiling; an
/// explicit extension rebases the ceiling on current spend and the session
/// can be resumed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn budget_exhaustion_then_extension() {
    let sid = format!("budget-{}", uuid::Uuid::new_v4());
    let config = Config {
        max_budget_per_task: Some(5.0),
        budget_delta: 5.0,
        ..test_config()
    };
    // One step charging 6.0; the follow-up observation triggers the check.
    let agent = ScriptedAgent::new("spender", vec![vec![cmd_run("true")], vec![finish()]], 6.0);
    let mut h = harness(&sid, config, agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("do something pricey"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Error).await;

    let events = collect_events(&h.stream);
    let budget_error = events.iter().find(|e| {
        matches!(
            &e.payload,
            EventPayload::Observation(Observation::Error { content })
                if content.contains("reached maximum budget")
        )
    });
    assert!(budget_error.is_some(), "events: {events:#?}");
    let last_error = h.controller.with_state(|s| s.last_error.clone()).await;
    assert!(last_error.contains("reached maximum budget"));

    // Extend and resume: new ceiling is current + delta.
    let max_value = h
        .controller
        .with_state(|s| {
            let flag = s.budget_flag.clone().expect("budget flag");
            flag.with(|f| {
                f.increase_limit(false);
                f.max_value
            })
        })
        .await;
    assert_eq!(max_value, 11.0);

    h.controller
        .set_agent_state_to(AgentState::Running)
        .await
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;
    h.controller.close().await.unwrap();
}

/// Delegation shares metrics and budget with the child by reference,
/// folds child iterations into the parent, and answers the delegate action
/// with an AgentDelegateObservation.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delegation_shares_budget_and_accounts_iterations() {
    let sid = format!("delegate-{}", uuid::Uuid::new_v4());
    let mut registry = AgentRegistry::new();
    registry.register(
        "researcher",
        Box::new(|| {
            Box::new(ScriptedAgent::new("researcher", vec![vec![finish()]], 0.25))
        }),
    );

    let parent = ScriptedAgent::new(
        "planner",
        vec![
            vec![Action::from(ActionKind::AgentDelegate {
                agent: "researcher".to_string(),
                inputs: serde_json::Map::new(),
            })],
            vec![finish()],
        ],
        0.0,
    );
    let mut h = harness(&sid, test_config(), parent, registry).await;

    h.stream
        .add_event(user_message("delegate the research"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;

    let events = collect_events(&h.stream);
    let delegate_action_id = events
        .iter()
        .find(|e| {
            matches!(
                &e.payload,
                EventPayload::Action(action)
                    if matches!(&action.kind, ActionKind::AgentDelegate { .. })
            )
        })
        .map(|e| e.id)
        .expect("delegate action in stream");
    let delegate_obs = events
        .iter()
        .find(|e| {
            matches!(
                &e.payload,
                EventPayload::Observation(Observation::AgentDelegate { .. })
            )
        })
        .expect("delegate observation in stream");
    assert_eq!(delegate_obs.cause, Some(delegate_action_id));
    match &delegate_obs.payload {
        EventPayload::Observation(Observation::AgentDelegate { outputs }) => {
            assert_eq!(
                outputs.get("final_thought").and_then(|v| v.as_str()),
                Some("done")
            );
        }
        other => panic!("expected delegate outputs, got {other:?}"),
    }

    // The child's spend went straight into the shared session metrics.
    assert_eq!(h.stream.get_metrics().accumulated_cost, 0.25);
    let shares = h
        .controller
        .with_state(|s| s.metrics.shares_storage_with(&h.stream.metrics()))
        .await;
    assert!(shares, "parent metrics must alias the session metrics");

    // pre-delegation 0, +1 for issuing, +1 child step, +1 finishing step.
    let iterations = h
        .controller
        .with_state(|s| s.iteration_flag.current_value)
        .await;
    assert_eq!(iterations, 3);

    h.controller.close().await.unwrap();
}

/// In confirmation mode a runnable action parks awaiting confirmation;
/// rejection emits a UserRejected observation, returns to RUNNING, and the
/// command never runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirmation_rejection_never_executes() {
    let sid = format!("confirm-{}", uuid::Uuid::new_v4());
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("executed_marker");
    let config = Config {
        confirmation_mode: true,
        work_dir: scratch.path().to_path_buf(),
        ..Default::default()
    };
    let agent = ScriptedAgent::new(
        "careful",
        vec![
            vec![cmd_run(&format!("touch {}", marker.display()))],
            vec![finish()],
        ],
        0.0,
    );
    let mut h = harness(&sid, config, agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("please run it"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::AwaitingUserConfirmation).await;

    let events = collect_events(&h.stream);
    let gated = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Action(action)
                if matches!(action.kind, ActionKind::CmdRun { .. }) =>
            {
                Some((e.id, action.confirmation_state))
            }
            _ => None,
        })
        .expect("gated command in stream");
    assert_eq!(gated.1, ConfirmationState::AwaitingConfirmation);

    h.controller
        .set_agent_state_to(AgentState::UserRejected)
        .await
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;

    let events = collect_events(&h.stream);
    let rejection = events
        .iter()
        .find(|e| {
            matches!(
                &e.payload,
                EventPayload::Observation(Observation::UserRejected { .. })
            )
        })
        .expect("UserRejected observation");
    assert_eq!(rejection.cause, Some(gated.0));
    assert!(!marker.exists(), "rejected command must not execute");

    h.controller.close().await.unwrap();
}

/// The approval side of confirmation mode: USER_CONFIRMED is announced on
/// the stream and the held action executes exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn confirmation_approval_executes_once() {
    let sid = format!("approve-{}", uuid::Uuid::new_v4());
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("approved_marker");
    let config = Config {
        confirmation_mode: true,
        work_dir: scratch.path().to_path_buf(),
        ..Default::default()
    };
    let agent = ScriptedAgent::new(
        "careful",
        vec![
            vec![cmd_run(&format!("touch {}", marker.display()))],
            vec![finish()],
        ],
        0.0,
    );
    let mut h = harness(&sid, config, agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("please run it"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::AwaitingUserConfirmation).await;

    h.controller
        .set_agent_state_to(AgentState::UserConfirmed)
        .await
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;

    assert!(marker.exists(), "confirmed command must execute");
    let events = collect_events(&h.stream);
    let executions = events
        .iter()
        .filter(|e| {
            matches!(
                &e.payload,
                EventPayload::Observation(Observation::CmdOutput { .. })
            )
        })
        .count();
    assert_eq!(executions, 1);

    h.controller.close().await.unwrap();
}

/// Iteration quota: the flag trips, headless extension is refused, an
/// interactive extension resumes the loop.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iteration_limit_trips_and_extends() {
    let sid = format!("iter-{}", uuid::Uuid::new_v4());
    let config = Config {
        max_iterations: 2,
        iteration_delta: 2,
        ..test_config()
    };
    let agent = ScriptedAgent::new(
        "thinker",
        vec![
            vec![think("one")],
            vec![think("two")],
            vec![finish()],
        ],
        0.0,
    );
    let mut h = harness(&sid, config, agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("think it over"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Error).await;

    let last_error = h.controller.with_state(|s| s.last_error.clone()).await;
    assert!(last_error.contains("reached maximum iteration"), "{last_error}");

    h.controller.increase_iteration_limit().await;
    let max = h
        .controller
        .with_state(|s| s.iteration_flag.max_value)
        .await;
    assert_eq!(max, 4);

    h.controller
        .set_agent_state_to(AgentState::Running)
        .await
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;
    h.controller.close().await.unwrap();
}

/// Pausing parks the loop and snapshots the state; resuming picks the
/// script back up.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_snapshots_and_resume_continues() {
    let sid = format!("pause-{}", uuid::Uuid::new_v4());
    let config = Config {
        max_iterations: 500,
        ..test_config()
    };
    let mut steps: Vec<Vec<Action>> = (0..200)
        .map(|i| vec![think(&format!("step {i}"))])
        .collect();
    steps.push(vec![finish()]);
    let agent =
        ScriptedAgent::new("marathon", steps, 0.0).with_step_delay(Duration::from_millis(5));
    let mut h = harness(&sid, config, agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("off you go"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Running).await;
    h.controller
        .set_agent_state_to(AgentState::Paused)
        .await
        .unwrap();
    assert_eq!(h.controller.agent_state().await, AgentState::Paused);

    // The pause snapshot landed next to the events.
    let snapshot = h
        .stream
        .store()
        .read(&format!("sessions/{sid}/state.json"));
    assert!(snapshot.is_ok(), "state snapshot must exist after pause");

    let before = h.stream.get_latest_event_id();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.stream.get_latest_event_id(),
        before,
        "no stepping while paused"
    );

    h.controller
        .set_agent_state_to(AgentState::Running)
        .await
        .unwrap();
    wait_for_state(&h.controller, AgentState::Finished).await;
    h.controller.close().await.unwrap();
}

/// A malformed tool call surfaces as an error observation and the loop
/// continues so the agent can self-correct.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tool_validation_error_reenters_the_loop() {
    struct FlakyToolAgent {
        failed_once: bool,
    }

    #[async_trait]
    impl Agent for FlakyToolAgent {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn step(&mut self, _state: &State) -> Result<Vec<Action>> {
            if !self.failed_once {
                self.failed_once = true;
                return Err(windlass_core::WindlassErr::ToolValidation(
                    "missing required argument: command".to_string(),
                ));
            }
            Ok(vec![finish()])
        }
    }

    let sid = format!("toolval-{}", uuid::Uuid::new_v4());
    let stream = Arc::new(EventStream::new(&sid, Arc::new(InMemoryFileStore::new())));
    let mut controller = AgentController::new(
        Arc::clone(&stream),
        Box::new(FlakyToolAgent { failed_once: false }),
        Arc::new(AgentRegistry::new()),
        &test_config(),
        None,
    )
    .await
    .unwrap();

    stream
        .add_event(user_message("try a tool"), EventSource::User)
        .unwrap();
    wait_for_state(&controller, AgentState::Finished).await;

    let events = collect_events(&stream);
    let validation_error = events.iter().any(|e| {
        matches!(
            &e.payload,
            EventPayload::Observation(Observation::Error { content })
                if content.contains("missing required argument")
        )
    });
    assert!(validation_error, "events: {events:#?}");
    controller.close().await.unwrap();
}

/// An agent that returns nothing is a controller error, not a hang.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_agent_response_is_an_error() {
    let sid = format!("empty-{}", uuid::Uuid::new_v4());
    let agent = ScriptedAgent::new("mute", vec![], 0.0);
    let mut h = harness(&sid, test_config(), agent, AgentRegistry::new()).await;

    h.stream
        .add_event(user_message("say something"), EventSource::User)
        .unwrap();
    wait_for_state(&h.controller, AgentState::Error).await;

    let last_error = h.controller.with_state(|s| s.last_error.clone()).await;
    assert!(last_error.contains("empty"), "{last_error}");
    h.controller.close().await.unwrap();
}

/// Closing a controller mid-session stops it and persists a resumable
/// snapshot; a fresh controller restores flags and rebuilds history from
/// the stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_then_restore_rebuilds_history() {
    let sid = format!("restore-{}", uuid::Uuid::new_v4());
    let store: Arc<dyn windlass_core::FileStore> = Arc::new(InMemoryFileStore::new());
    let stream = Arc::new(EventStream::new(&sid, Arc::clone(&store)));
    let config = test_config();

    let session = SubprocessBashSession::new(&config);
    let runtime = LocalRuntime::new(Arc::clone(&stream), Box::new(session));
    runtime.connect().await.unwrap();

    let agent = ScriptedAgent::new("coder", vec![vec![cmd_run("ls")], vec![finish()]], 0.5);
    let mut controller = AgentController::new(
        Arc::clone(&stream),
        Box::new(agent),
        Arc::new(AgentRegistry::new()),
        &config,
        None,
    )
    .await
    .unwrap();

    stream
        .add_event(user_message("list files"), EventSource::User)
        .unwrap();
    wait_for_state(&controller, AgentState::Finished).await;
    controller.close().await.unwrap();

    let restored = State::restore_from_session(&sid, store.as_ref()).unwrap();
    assert_eq!(restored.agent_state, AgentState::Loading);
    assert_eq!(restored.resume_state, Some(AgentState::Finished));
    assert!(restored.history.is_empty());

    // A resumed process opens the session over the same store with a fresh
    // stream; the restored snapshot folds into that stream's metrics.
    let resumed_stream = Arc::new(EventStream::new(&sid, Arc::clone(&store)));
    assert_eq!(resumed_stream.get_latest_event_id(), stream.get_latest_event_id());

    let mut resumed = AgentController::new(
        Arc::clone(&resumed_stream),
        Box::new(ScriptedAgent::new("coder", vec![vec![finish()]], 0.0)),
        Arc::new(AgentRegistry::new()),
        &config,
        Some(restored),
    )
    .await
    .unwrap();
    let (history_len, cost) = resumed
        .with_state(|s| (s.history.len(), s.metrics.accumulated_cost()))
        .await;
    assert_eq!(history_len as i64, resumed_stream.get_latest_event_id() + 1);
    assert_eq!(cost, 1.0, "restored spend stays on the session metrics");

    resumed.close().await.unwrap();
}
