//! Gillespie state machine over a [`ReactionNetwork`].
//!
//! `Idle -> Running -> Finished(cause)`. A finished engine never runs again;
//! continuing requires a new engine built from a [`Snapshot`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::WorkerContext;
use crate::error::{EXIT_ABORTED, SimError};
use crate::network::{CollectionPolicy, ReactionId, ReactionNetwork};
use crate::rules::{Parameters, Ruleset};
use crate::selector::SelectorError;
use crate::snapshot::{Snapshot, SnapshotSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergedBy {
    TimeLimit,
    EventLimit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    WallClock,
    Interrupted,
    /// A peer asked the whole pool to stop.
    Collective,
    Persistence(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Converged(ConvergedBy),
    /// Every weight is zero: nothing can fire any more.
    Exhausted,
    Aborted(AbortReason),
}

impl TerminationCause {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TerminationCause::Aborted(_))
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_aborted() { EXIT_ABORTED } else { 0 }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCause::Converged(ConvergedBy::TimeLimit) => {
                write!(f, "converged (time limit)")
            }
            TerminationCause::Converged(ConvergedBy::EventLimit) => {
                write!(f, "converged (event limit)")
            }
            TerminationCause::Exhausted => write!(f, "exhausted"),
            TerminationCause::Aborted(AbortReason::WallClock) => {
                write!(f, "aborted (wall-clock limit)")
            }
            TerminationCause::Aborted(AbortReason::Interrupted) => {
                write!(f, "aborted (interrupted)")
            }
            TerminationCause::Aborted(AbortReason::Collective) => {
                write!(f, "aborted (collective stop)")
            }
            TerminationCause::Aborted(AbortReason::Persistence(msg)) => {
                write!(f, "aborted (persistence failure: {msg})")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub events: u64,
    pub time: f64,
    pub cause: TerminationCause,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    Idle,
    Running,
    Finished(TerminationCause),
}

/// Result of [`SimulationEngine::advance_until`].
#[derive(Clone, Debug, PartialEq)]
pub enum Advance {
    Reached,
    /// `max_steps` events fired before the target time.
    StepLimit,
    Finished(TerminationCause),
}

/// Cloneable external stop flag, honoured between events.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub tend: f64,
    pub max_events: Option<u64>,
    pub wall_clock: Option<Duration>,
    /// Events between two [`ReactionNetwork::rebuild`] calls.
    pub rebuild_every: Option<u64>,
    /// Simulated time between two snapshot points. The network is rebuilt
    /// at each point, so a run resumed from any emitted snapshot draws the
    /// same chain as the uninterrupted one.
    pub snapshot_every: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tend: f64::INFINITY,
            max_events: None,
            wall_clock: None,
            rebuild_every: None,
            snapshot_every: None,
        }
    }
}

pub struct SimulationEngine {
    network: ReactionNetwork,
    rng: ChaCha8Rng,
    time: f64,
    events: u64,
    state: EngineState,
    config: EngineConfig,
    context: WorkerContext,
    stop: StopSignal,
    started: Option<Instant>,
    /// Index `i` of the next snapshot point `i * snapshot_every`.
    snapshot_index: u64,
    sink: Option<Box<dyn SnapshotSink + Send>>,
}

impl SimulationEngine {
    pub fn new(
        network: ReactionNetwork,
        config: EngineConfig,
        context: WorkerContext,
        seed: u64,
    ) -> Self {
        Self::with_rng(network, config, context, ChaCha8Rng::seed_from_u64(seed))
    }

    pub fn with_rng(
        network: ReactionNetwork,
        config: EngineConfig,
        context: WorkerContext,
        rng: ChaCha8Rng,
    ) -> Self {
        Self {
            network,
            rng,
            time: 0.0,
            events: 0,
            state: EngineState::Idle,
            config,
            context,
            stop: StopSignal::new(),
            started: None,
            snapshot_index: 1,
            sink: None,
        }
    }

    /// Rebuilds the network from `snapshot` and continues from its clock and
    /// event count.
    #[allow(clippy::too_many_arguments)]
    pub fn from_snapshot(
        snapshot: &Snapshot,
        ruleset: Ruleset,
        params: Parameters,
        volume: f64,
        policy: CollectionPolicy,
        config: EngineConfig,
        context: WorkerContext,
        rng: ChaCha8Rng,
    ) -> Result<Self, SimError> {
        snapshot.validate()?;
        let network = ReactionNetwork::from_populations(
            ruleset,
            params,
            volume,
            policy,
            &snapshot.populations,
        )?;
        let mut engine = Self::with_rng(network, config, context, rng);
        engine.time = snapshot.time;
        engine.events = snapshot.events;
        if let Some(every) = engine.config.snapshot_every {
            engine.snapshot_index = snapshot_index_after(snapshot.time, every);
        }
        Ok(engine)
    }

    pub fn with_sink(mut self, sink: Box<dyn SnapshotSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn network(&self) -> &ReactionNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ReactionNetwork {
        &mut self.network
    }

    pub fn rng(&self) -> &ChaCha8Rng {
        &self.rng
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn context(&self) -> WorkerContext {
        self.context
    }

    pub fn cause(&self) -> Option<&TerminationCause> {
        match &self.state {
            EngineState::Finished(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            time: self.time,
            events: self.events,
            populations: self.network.populations(),
            cause: self.cause().cloned(),
        }
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.cause().map(|cause| RunSummary {
            events: self.events,
            time: self.time,
            cause: cause.clone(),
        })
    }

    fn start(&mut self) {
        if self.state == EngineState::Idle {
            self.state = EngineState::Running;
            self.started = Some(Instant::now());
            info!(
                "worker {}/{}: run started at t={} with {} compounds, {} reactions",
                self.context.rank,
                self.context.size,
                self.time,
                self.network.compound_count(),
                self.network.reaction_count()
            );
        }
    }

    fn finish(&mut self, cause: TerminationCause) -> TerminationCause {
        info!(
            "worker {}/{}: {} after {} events at t={}",
            self.context.rank, self.context.size, cause, self.events, self.time
        );
        self.state = EngineState::Finished(cause.clone());
        if let Some(sink) = self.sink.as_mut() {
            let snapshot = Snapshot {
                time: self.time,
                events: self.events,
                populations: self.network.populations(),
                cause: Some(cause.clone()),
            };
            if let Err(err) = sink.emit(&snapshot) {
                warn!("final snapshot could not be written: {err}");
            }
        }
        cause
    }

    /// Ends the run with an `Aborted` cause. No-op once finished.
    pub fn abort(&mut self, reason: AbortReason) -> TerminationCause {
        match &self.state {
            EngineState::Finished(cause) => cause.clone(),
            _ => self.finish(TerminationCause::Aborted(reason)),
        }
    }

    fn external_stop(&self) -> Option<AbortReason> {
        if self.stop.is_stopped() {
            return Some(AbortReason::Interrupted);
        }
        match (self.config.wall_clock, self.started) {
            (Some(limit), Some(started)) if started.elapsed() >= limit => {
                Some(AbortReason::WallClock)
            }
            _ => None,
        }
    }

    fn planned_stop(&self) -> Option<ConvergedBy> {
        if self.time >= self.config.tend {
            return Some(ConvergedBy::TimeLimit);
        }
        match self.config.max_events {
            Some(max) if self.events >= max => Some(ConvergedBy::EventLimit),
            _ => None,
        }
    }

    /// Rebuilds the network once the clock passes a snapshot point, then
    /// hands the snapshot to the sink, if any. Points skipped by a single
    /// long event collapse into one.
    fn snapshot_point(&mut self) -> Result<Option<String>, SimError> {
        let Some(every) = self.config.snapshot_every else {
            return Ok(None);
        };
        if self.time < self.snapshot_index as f64 * every {
            return Ok(None);
        }
        self.snapshot_index = snapshot_index_after(self.time, every);
        self.network.rebuild()?;
        let Some(sink) = self.sink.as_mut() else {
            return Ok(None);
        };
        let snapshot = Snapshot {
            time: self.time,
            events: self.events,
            populations: self.network.populations(),
            cause: None,
        };
        Ok(sink.emit(&snapshot).err().map(|err| err.to_string()))
    }

    /// Fires at most one event. Returns the termination cause once the run
    /// is over; fatal invariant violations are returned as errors.
    pub fn step(&mut self) -> Result<Option<TerminationCause>, SimError> {
        if let EngineState::Finished(cause) = &self.state {
            return Ok(Some(cause.clone()));
        }
        self.start();
        if let Some(reason) = self.external_stop() {
            return Ok(Some(self.finish(TerminationCause::Aborted(reason))));
        }
        if let Some(by) = self.planned_stop() {
            return Ok(Some(self.finish(TerminationCause::Converged(by))));
        }

        let total = self.network.total_weight();
        if total <= 0.0 {
            return Ok(Some(self.finish(TerminationCause::Exhausted)));
        }
        let u = 1.0 - self.rng.r#gen::<f64>();
        let dt = -u.ln() / total;
        let reaction: ReactionId = match self.network.draw(&mut self.rng) {
            Ok(reaction) => reaction,
            Err(SelectorError::Empty) => return Ok(Some(self.finish(TerminationCause::Exhausted))),
            Err(err) => return Err(err.into()),
        };
        self.network.apply(reaction)?;
        self.time += dt;
        self.events += 1;

        if let Some(period) = self.config.rebuild_every {
            if period > 0 && self.events % period == 0 {
                self.network.rebuild()?;
            }
        }
        if let Some(msg) = self.snapshot_point()? {
            let cause = TerminationCause::Aborted(AbortReason::Persistence(msg));
            return Ok(Some(self.finish(cause)));
        }
        if let Some(by) = self.planned_stop() {
            return Ok(Some(self.finish(TerminationCause::Converged(by))));
        }
        if let Some(reason) = self.external_stop() {
            return Ok(Some(self.finish(TerminationCause::Aborted(reason))));
        }
        Ok(None)
    }

    /// Fires events until the clock reaches `target`, the run ends, or
    /// `max_steps` events have fired in this call.
    pub fn advance_until(
        &mut self,
        target: f64,
        max_steps: Option<u64>,
    ) -> Result<Advance, SimError> {
        let mut fired = 0u64;
        while self.time < target {
            if let Some(max) = max_steps {
                if fired >= max {
                    warn!(
                        "worker {}: {} events fired before t={} (now t={})",
                        self.context.rank, max, target, self.time
                    );
                    return Ok(Advance::StepLimit);
                }
            }
            if let Some(cause) = self.step()? {
                return Ok(Advance::Finished(cause));
            }
            fired += 1;
        }
        debug!(
            "worker {}: t={} reached after {} events (total weight {})",
            self.context.rank,
            self.time,
            fired,
            self.network.total_weight()
        );
        Ok(Advance::Reached)
    }

    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        loop {
            if let Some(cause) = self.step()? {
                return Ok(RunSummary {
                    events: self.events,
                    time: self.time,
                    cause,
                });
            }
        }
    }
}

/// Smallest `i >= 1` with `i * every > time`.
fn snapshot_index_after(time: f64, every: f64) -> u64 {
    let mut index = ((time / every).floor() as u64).max(1);
    while index as f64 * every <= time {
        index += 1;
    }
    while index > 1 && (index - 1) as f64 * every > time {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RateFunction;
    use crate::snapshot::MemorySink;
    use std::sync::Mutex;

    fn decay_network(a: u64) -> ReactionNetwork {
        let mut network = ReactionNetwork::new(
            Ruleset::new(),
            Parameters::default(),
            1.0,
            CollectionPolicy::Keep,
        )
        .unwrap();
        network.add_compound("A", a).unwrap();
        network
            .add_reaction(&["A"], &["B"], 1.0, RateFunction::MassAction)
            .unwrap();
        network
    }

    fn decay_engine(a: u64, config: EngineConfig, seed: u64) -> SimulationEngine {
        SimulationEngine::new(decay_network(a), config, WorkerContext::single(), seed)
    }

    #[test]
    fn zero_total_weight_is_exhaustion_not_an_error() {
        let mut engine = decay_engine(3, EngineConfig::default(), 7);
        let summary = engine.run().unwrap();
        assert_eq!(summary.cause, TerminationCause::Exhausted);
        assert_eq!(summary.events, 3);
        assert_eq!(engine.network().population("B"), 3);
        assert_eq!(engine.step().unwrap(), Some(TerminationCause::Exhausted));
        assert_eq!(engine.events(), 3);
    }

    #[test]
    fn event_limit_converges() {
        let config = EngineConfig {
            max_events: Some(5),
            ..EngineConfig::default()
        };
        let mut engine = decay_engine(100, config, 1);
        let summary = engine.run().unwrap();
        assert_eq!(summary.cause, TerminationCause::Converged(ConvergedBy::EventLimit));
        assert_eq!(summary.events, 5);
    }

    #[test]
    fn time_limit_converges_and_clock_is_monotonic() {
        let config = EngineConfig {
            tend: 0.01,
            ..EngineConfig::default()
        };
        let mut engine = decay_engine(10_000, config, 3);
        let mut last = 0.0;
        loop {
            let outcome = engine.step().unwrap();
            assert!(engine.time() >= last);
            last = engine.time();
            if let Some(cause) = outcome {
                assert_eq!(cause, TerminationCause::Converged(ConvergedBy::TimeLimit));
                break;
            }
        }
        assert!(engine.time() >= 0.01);
    }

    #[test]
    fn stop_signal_aborts_between_events() {
        let mut engine = decay_engine(100, EngineConfig::default(), 5);
        engine.step().unwrap();
        engine.stop_signal().stop();
        let summary = engine.run().unwrap();
        assert_eq!(summary.cause, TerminationCause::Aborted(AbortReason::Interrupted));
        assert_eq!(summary.events, 1);
        assert_eq!(summary.cause.exit_code(), EXIT_ABORTED);
    }

    #[test]
    fn advance_until_reports_step_limit() {
        let mut engine = decay_engine(1000, EngineConfig::default(), 9);
        assert_eq!(engine.advance_until(10.0, Some(4)).unwrap(), Advance::StepLimit);
        assert_eq!(engine.events(), 4);
        assert!(matches!(
            engine.advance_until(f64::INFINITY, None).unwrap(),
            Advance::Finished(TerminationCause::Exhausted)
        ));
    }

    struct SharedSink(Arc<Mutex<MemorySink>>);

    impl SnapshotSink for SharedSink {
        fn emit(&mut self, snapshot: &Snapshot) -> Result<(), SimError> {
            self.0.lock().unwrap().emit(snapshot)
        }
    }

    struct BrokenSink;

    impl SnapshotSink for BrokenSink {
        fn emit(&mut self, _snapshot: &Snapshot) -> Result<(), SimError> {
            Err(SimError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn snapshots_are_emitted_on_schedule_and_at_the_end() {
        let store = Arc::new(Mutex::new(MemorySink::default()));
        let config = EngineConfig {
            snapshot_every: Some(0.001),
            ..EngineConfig::default()
        };
        let mut engine = decay_engine(50, config, 11)
            .with_sink(Box::new(SharedSink(Arc::clone(&store))));
        engine.run().unwrap();
        let store = store.lock().unwrap();
        let last = store.snapshots.last().unwrap();
        assert_eq!(last.cause, Some(TerminationCause::Exhausted));
        assert_eq!(last.populations.get("B"), Some(&50));
        assert!(store.snapshots.len() >= 2);
        assert!(store.snapshots.windows(2).all(|pair| pair[0].time <= pair[1].time));
    }

    #[test]
    fn snapshot_points_rebuild_the_network_without_a_sink() {
        let mut plain = decay_engine(5, EngineConfig::default(), 2);
        plain.run().unwrap();
        assert!(plain.network().compound("A").is_some());

        let config = EngineConfig {
            snapshot_every: Some(1e-9),
            ..EngineConfig::default()
        };
        let mut engine = decay_engine(5, config, 2);
        engine.run().unwrap();
        assert_eq!(engine.network().population("B"), 5);
        assert!(engine.network().compound("A").is_none());
    }

    #[test]
    fn snapshot_index_is_the_next_point_after_the_clock() {
        assert_eq!(snapshot_index_after(0.0, 0.25), 1);
        assert_eq!(snapshot_index_after(0.1, 0.25), 1);
        assert_eq!(snapshot_index_after(0.25, 0.25), 2);
        assert_eq!(snapshot_index_after(0.35, 0.1), 4);
        assert_eq!(snapshot_index_after(1.0, 0.1), 11);
    }

    #[test]
    fn persistence_failure_aborts_the_run() {
        let config = EngineConfig {
            snapshot_every: Some(1e-9),
            ..EngineConfig::default()
        };
        let mut engine = decay_engine(50, config, 11).with_sink(Box::new(BrokenSink));
        let summary = engine.run().unwrap();
        assert!(matches!(
            summary.cause,
            TerminationCause::Aborted(AbortReason::Persistence(_))
        ));
        assert_eq!(summary.events, 1);
    }
}
