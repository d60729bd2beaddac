/// Routine executor — the state machine that drives a run.
///
/// A run walks `step_id` from 1 to `steps_total`. Each step lights a set
/// of nodes and waits for touches; the step's expression decides when it
/// is complete. Step and routine deadlines fire one-shot timers whose
/// callbacks are linearized against touches by the state lock — stale
/// fires are filtered by a step generation check. Every transition emits
/// an event on a bounded stream that closes exactly once, when the run
/// finalizes or is stopped.
///
/// The two strategies share the driver and differ only in how the next
/// step is produced: `Custom` replays pre-authored steps, `Random` draws
/// a fresh node permutation per step.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::Expr;
use crate::protocol::Color;
use crate::timer::{self, OneShot};

/// Capacity of the event stream.
pub const EVENT_CHANNEL_SIZE: usize = 30;

/// Consumes the node commands a run produces. Implemented by the
/// terminal, which turns each config into a wire frame.
pub trait Sender: Send + Sync + 'static {
    fn send(&self, step_id: u32, config: &NodeConfig);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor has no runnable configuration")]
    InvalidExecutor,
    #[error("executor is not running")]
    NotRunning,
}

/// One lit node within a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wire id of the node.
    pub id: u32,
    pub color: Color,
    #[serde(default)]
    pub delay_ms: u32,
}

/// One authored step of a custom routine.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub node_configs: Vec<NodeConfig>,
    /// Infix formula over the wire ids of `node_configs`.
    pub expression: String,
    #[serde(default)]
    pub timeout_ms: u32,
    #[serde(default)]
    pub stop_on_timeout: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomConfig {
    #[serde(default)]
    pub duration_ms: u32,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RandomConfig {
    pub colors: Vec<Color>,
    #[serde(default)]
    pub delay_ms: u32,
    #[serde(default)]
    pub timeout_ms: u32,
    #[serde(default)]
    pub duration_ms: u32,
    pub steps: u32,
    pub nodes: u32,
    #[serde(default)]
    pub stop_on_timeout: bool,
    /// Accepted for companion-app compatibility; random steps always
    /// require every lit node to be hit.
    #[serde(default)]
    pub wait_for_all_players: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Touche,
    StepTimeout,
    RoutineTimeout,
    End,
}

/// One entry of a run's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub color: Color,
    pub delay_ms: u32,
    pub step: u32,
    pub node: u32,
}

fn event(kind: EventKind, step: u32) -> Event {
    Event {
        kind,
        color: Color::None,
        delay_ms: 0,
        step,
        node: 0,
    }
}

/// Step generation strategy.
#[derive(Debug, Clone)]
pub enum Strategy {
    Custom(CustomConfig),
    Random(RandomConfig),
}

impl Strategy {
    fn validate(&self) -> Result<(), ExecutorError> {
        let runnable = match self {
            Strategy::Custom(cfg) => !cfg.steps.is_empty(),
            Strategy::Random(cfg) => cfg.steps != 0 && cfg.nodes != 0 && !cfg.colors.is_empty(),
        };
        if runnable {
            Ok(())
        } else {
            Err(ExecutorError::InvalidExecutor)
        }
    }

    fn steps_total(&self) -> u32 {
        match self {
            Strategy::Custom(cfg) => cfg.steps.len() as u32,
            Strategy::Random(cfg) => cfg.steps,
        }
    }

    fn duration_ms(&self) -> u32 {
        match self {
            Strategy::Custom(cfg) => cfg.duration_ms,
            Strategy::Random(cfg) => cfg.duration_ms,
        }
    }

    fn next_step(&self, step_id: u32) -> ActiveStep {
        let config = match self {
            Strategy::Custom(cfg) => cfg.steps[(step_id - 1) as usize].clone(),
            Strategy::Random(cfg) => random_step(cfg),
        };
        ActiveStep::compile(config)
    }
}

/// Draw a random step: a permutation of the node ids, one config per
/// configured color, and an all-and expression over the drawn ids.
fn random_step(cfg: &RandomConfig) -> StepConfig {
    use std::fmt::Write;

    let mut ids: Vec<u32> = (0..cfg.nodes).collect();
    ids.shuffle(&mut rand::thread_rng());
    let count = cfg.colors.len().min(cfg.nodes as usize);
    let mut node_configs = Vec::with_capacity(count);
    let mut expression = String::new();
    for (i, &color) in cfg.colors.iter().take(count).enumerate() {
        let id = ids[i];
        node_configs.push(NodeConfig {
            id,
            color,
            delay_ms: cfg.delay_ms,
        });
        if i > 0 {
            expression.push('&');
        }
        let _ = write!(expression, "{id}");
    }
    StepConfig {
        node_configs,
        expression,
        timeout_ms: cfg.timeout_ms,
        stop_on_timeout: cfg.stop_on_timeout,
    }
}

/// A compiled step: configs, the expression remapped from wire ids to
/// touched-vector slots, and the touched bits themselves.
struct ActiveStep {
    configs: Vec<NodeConfig>,
    expr: Expr,
    touched: Vec<bool>,
    timeout_ms: u32,
    stop_on_timeout: bool,
}

impl ActiveStep {
    fn compile(config: StepConfig) -> ActiveStep {
        let configs = config.node_configs;
        let expr = Expr::parse(&config.expression).map_leaves(|id| {
            configs
                .iter()
                .position(|nc| nc.id as usize == id)
                // Leaves naming no config read as never-touched slots.
                .unwrap_or(usize::MAX)
        });
        ActiveStep {
            touched: vec![false; configs.len()],
            configs,
            expr,
            timeout_ms: config.timeout_ms,
            stop_on_timeout: config.stop_on_timeout,
        }
    }

    /// Mark a touch and report whether the step is now complete.
    fn touch(&mut self, node_id: u32) -> bool {
        if let Some(slot) = self.configs.iter().position(|nc| nc.id == node_id) {
            self.touched[slot] = true;
        }
        self.expr.eval(&self.touched)
    }

    fn node_color(&self, node_id: u32) -> Color {
        self.configs
            .iter()
            .find(|nc| nc.id == node_id)
            .map(|nc| nc.color)
            .unwrap_or(Color::None)
    }
}

#[derive(Default)]
struct State {
    started: bool,
    done: bool,
    sender: Option<Arc<dyn Sender>>,
    events: Option<SyncSender<Event>>,
    pending_events: Option<Mutex<Receiver<Event>>>,
    step: Option<ActiveStep>,
    step_id: u32,
    steps_total: u32,
    step_timer: Option<OneShot>,
    routine_timer: Option<OneShot>,
}

struct Shared {
    strategy: Strategy,
    state: RwLock<State>,
}

/// Handle to one routine run. Clones share the run.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(strategy: Strategy) -> Executor {
        Executor {
            shared: Arc::new(Shared {
                strategy,
                state: RwLock::new(State::default()),
            }),
        }
    }

    /// Start the run: send step 1, arm the deadlines, emit `Start`.
    pub fn start(&self, sender: Arc<dyn Sender>) -> Result<(), ExecutorError> {
        self.shared.strategy.validate()?;
        let mut state = self.shared.state.write().unwrap();
        if state.started {
            return Err(ExecutorError::InvalidExecutor);
        }
        state.started = true;
        state.steps_total = self.shared.strategy.steps_total();
        state.sender = Some(sender);
        let (events_tx, events_rx) = mpsc::sync_channel(EVENT_CHANNEL_SIZE);
        state.events = Some(events_tx);
        state.pending_events = Some(Mutex::new(events_rx));
        state.step_id = 1;
        Shared::send_step(&self.shared, &mut state);
        let duration_ms = self.shared.strategy.duration_ms();
        if duration_ms != 0 {
            let weak = Arc::downgrade(&self.shared);
            state.routine_timer = Some(timer::one_shot(
                Duration::from_millis(u64::from(duration_ms)),
                move || {
                    if let Some(shared) = weak.upgrade() {
                        Shared::routine_timeout(&shared);
                    }
                },
            ));
        }
        Shared::emit(&mut state, event(EventKind::Start, 1));
        Ok(())
    }

    /// Feed a touch into the run. Touches for finished runs or other
    /// steps are discarded.
    pub fn touche(&self, step_id: u32, node_id: u32, delay_ms: u32) {
        let mut state = self.shared.state.write().unwrap();
        if state.done || !state.started || step_id != state.step_id {
            return;
        }
        let complete = match state.step.as_mut() {
            Some(step) => step.touch(node_id),
            None => return,
        };
        if !complete {
            return;
        }
        state.step_timer = None;
        let color = state
            .step
            .as_ref()
            .map(|step| step.node_color(node_id))
            .unwrap_or(Color::None);
        let step = state.step_id;
        Shared::emit(
            &mut state,
            Event {
                kind: EventKind::Touche,
                color,
                delay_ms,
                step,
                node: node_id,
            },
        );
        Shared::advance(&self.shared, &mut state);
    }

    /// Abort a running routine: extinguish the current step, emit `End`,
    /// close the stream.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        let mut state = self.shared.state.write().unwrap();
        if !state.started || state.done {
            return Err(ExecutorError::NotRunning);
        }
        state.step_timer = None;
        state.routine_timer = None;
        Shared::cancel_step(&state);
        state.done = true;
        let step = state.step_id;
        Shared::emit(&mut state, event(EventKind::End, step));
        state.events = None;
        Ok(())
    }

    /// The run's event stream. Yields events until the run finalizes or
    /// is stopped; can be taken once, after `start`.
    pub fn take_events(&self) -> Option<Receiver<Event>> {
        self.shared
            .state
            .write()
            .unwrap()
            .pending_events
            .take()
            .map(|m| m.into_inner().unwrap())
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.read().unwrap().done
    }

    pub fn steps_total(&self) -> u32 {
        self.shared.state.read().unwrap().steps_total
    }
}

impl Shared {
    /// Produce and transmit the step for the current `step_id`, arming
    /// its deadline.
    fn send_step(shared: &Arc<Shared>, state: &mut State) {
        let step = shared.strategy.next_step(state.step_id);
        if let Some(sender) = &state.sender {
            for config in &step.configs {
                sender.send(state.step_id, config);
            }
        }
        if step.timeout_ms != 0 {
            let weak = Arc::downgrade(shared);
            let armed_for = state.step_id;
            state.step_timer = Some(timer::one_shot(
                Duration::from_millis(u64::from(step.timeout_ms)),
                move || {
                    if let Some(shared) = weak.upgrade() {
                        Shared::step_timeout(&shared, armed_for);
                    }
                },
            ));
        } else {
            state.step_timer = None;
        }
        state.step = Some(step);
    }

    /// Move past the current step: next step, or finalize after the
    /// last one.
    fn advance(shared: &Arc<Shared>, state: &mut State) {
        if state.step_id == state.steps_total {
            Self::finalize(state);
        } else {
            state.step_id += 1;
            Self::send_step(shared, state);
        }
    }

    fn step_timeout(shared: &Arc<Shared>, armed_for: u32) {
        let mut state = shared.state.write().unwrap();
        // A touch may have completed the step while this fire was
        // waiting on the lock.
        if state.done || !state.started || state.step_id != armed_for {
            return;
        }
        let step = state.step_id;
        Self::emit(&mut state, event(EventKind::StepTimeout, step));
        Self::cancel_step(&state);
        let stop = state
            .step
            .as_ref()
            .map(|step| step.stop_on_timeout)
            .unwrap_or(false);
        if stop {
            Self::finalize(&mut state);
        } else {
            Self::advance(shared, &mut state);
        }
    }

    fn routine_timeout(shared: &Arc<Shared>) {
        let mut state = shared.state.write().unwrap();
        if state.done || !state.started {
            return;
        }
        state.step_timer = None;
        Self::cancel_step(&state);
        let step = state.step_id;
        Self::emit(&mut state, event(EventKind::RoutineTimeout, step));
        Self::finalize(&mut state);
    }

    /// Extinguish every light of the current step. Cancels are sent
    /// before `step_id` moves; step 0 marks them as out-of-band.
    fn cancel_step(state: &State) {
        let (Some(step), Some(sender)) = (&state.step, &state.sender) else {
            return;
        };
        for config in &step.configs {
            sender.send(
                0,
                &NodeConfig {
                    id: config.id,
                    color: Color::None,
                    delay_ms: 0,
                },
            );
        }
    }

    fn finalize(state: &mut State) {
        state.done = true;
        state.step_timer = None;
        state.routine_timer = None;
        let steps_total = state.steps_total;
        Self::emit(state, event(EventKind::End, steps_total));
        // Dropping the sender closes the stream; `done` guards against a
        // second close.
        state.events = None;
    }

    fn emit(state: &mut State, ev: Event) {
        if let Some(events) = &state.events {
            if events.send(ev).is_err() {
                log::warn!("event stream receiver gone, dropping event");
            }
        }
    }
}
