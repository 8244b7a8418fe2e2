//! Distributed runs: one engine per worker thread, each over its own share
//! of the initial population, meeting only through the [`Gate`].

use std::collections::BTreeMap;
use std::thread;

use log::{debug, info, warn};
use serde::Serialize;

use crate::WorkerContext;
use crate::engine::{
    AbortReason, Advance, RunSummary, SimulationEngine, StopSignal, TerminationCause,
};
use crate::error::SimError;
use crate::gate::{Gate, GateRequest};
use crate::params::Params;
use crate::snapshot::{Snapshot, SnapshotSink};

/// What a worker brings to a rendezvous.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerReport {
    pub rank: usize,
    pub time: f64,
    pub events: u64,
    pub populations: BTreeMap<String, u64>,
}

/// Joint view computed at every rendezvous.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStatus {
    pub epoch: u64,
    pub workers: usize,
    pub min_time: f64,
    pub max_time: f64,
    pub events: u64,
    pub populations: BTreeMap<String, u64>,
}

/// State of a worker at the end of one time step: the concentrations of the
/// `save` compounds and the configured statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepRecord {
    pub time: f64,
    pub events: u64,
    pub concentrations: BTreeMap<String, f64>,
    /// `None` where the statistic had nothing to reduce.
    pub stats: BTreeMap<String, Option<f64>>,
    /// `(sort value, statistic)` pairs of each map.
    pub maps: BTreeMap<String, Vec<(f64, f64)>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerOutcome {
    pub rank: usize,
    pub summary: RunSummary,
    pub snapshot: Snapshot,
    pub steps: Vec<StepRecord>,
    pub rendezvous: Vec<PoolStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolReport {
    pub workers: Vec<WorkerOutcome>,
    pub events: u64,
    pub populations: BTreeMap<String, u64>,
}

impl PoolReport {
    /// Exit code of the whole run: aborted if any worker aborted.
    pub fn exit_code(&self) -> i32 {
        self.workers
            .iter()
            .map(|worker| worker.summary.cause.exit_code())
            .max()
            .unwrap_or(0)
    }
}

fn aggregate(epoch: u64, reports: &[(usize, WorkerReport)]) -> PoolStatus {
    let mut populations: BTreeMap<String, u64> = BTreeMap::new();
    for (_, report) in reports {
        for (name, pop) in &report.populations {
            *populations.entry(name.clone()).or_default() += pop;
        }
    }
    PoolStatus {
        epoch,
        workers: reports.len(),
        min_time: reports.iter().map(|(_, r)| r.time).fold(f64::INFINITY, f64::min),
        max_time: reports.iter().map(|(_, r)| r.time).fold(f64::NEG_INFINITY, f64::max),
        events: reports.iter().map(|(_, r)| r.events).sum(),
        populations,
    }
}

fn report(engine: &SimulationEngine) -> WorkerReport {
    WorkerReport {
        rank: engine.context().rank,
        time: engine.time(),
        events: engine.events(),
        populations: engine.network().populations(),
    }
}

fn record(params: &Params, engine: &SimulationEngine) -> StepRecord {
    let network = engine.network();
    StepRecord {
        time: engine.time(),
        events: engine.events(),
        concentrations: params
            .save
            .iter()
            .map(|name| (name.clone(), network.population(name) as f64 / network.volume()))
            .collect(),
        stats: params
            .stat
            .iter()
            .map(|(name, spec)| (name.clone(), spec.compute(network)))
            .collect(),
        maps: params
            .maps
            .iter()
            .map(|(name, spec)| (name.clone(), spec.compute(network)))
            .collect(),
    }
}

/// Outer loop of one worker: advance by `tstep`, record, and pass the gate
/// checkpoint, requesting a rendezvous every `sync_every` steps.
///
/// When `maxsteps` events fire before the end of a step, the worker passes
/// the checkpoint and keeps going toward the same step end; the step is
/// recorded once, when its end is reached.
pub fn run_worker(
    params: &Params,
    mut engine: SimulationEngine,
    gate: &mut Gate<WorkerReport>,
) -> Result<WorkerOutcome, SimError> {
    let rank = engine.context().rank;
    let mut steps = Vec::new();
    let mut rendezvous = Vec::new();
    let mut tnext = engine.time() + params.tstep;
    let mut step = 0u64;
    let outcome = loop {
        let advance = match engine.advance_until(tnext, Some(params.maxsteps)) {
            Ok(advance) => advance,
            Err(err) => {
                gate.checkout();
                return Err(err);
            }
        };
        match advance {
            Advance::Finished(cause) => {
                steps.push(record(params, &engine));
                break cause;
            }
            Advance::Reached => {
                steps.push(record(params, &engine));
                debug!(
                    "worker {rank}: step {step} at t={} ({} events)",
                    engine.time(),
                    engine.events()
                );
                tnext += params.tstep;
                step += 1;
                if params.sync_every > 0 && step % params.sync_every == 0 {
                    gate.request_close(GateRequest::Sync);
                }
            }
            Advance::StepLimit => {}
        }
        let epoch = gate.epoch();
        let passed = gate.checkpoint(|| report(&engine), |reports| aggregate(epoch, reports))?;
        if let Some(passed) = passed {
            info!(
                "worker {rank}: rendezvous {} with {} workers, {} events in total",
                passed.epoch, passed.aggregate.workers, passed.aggregate.events
            );
            let stop = passed.stop();
            rendezvous.push(passed.aggregate);
            if stop {
                warn!("worker {rank}: stopping on collective request");
                break engine.abort(AbortReason::Collective);
            }
        }
    };
    if let TerminationCause::Aborted(reason) = &outcome {
        if *reason != AbortReason::Collective {
            gate.request_close(GateRequest::Stop);
        }
    }
    gate.checkout();
    Ok(WorkerOutcome {
        rank,
        summary: RunSummary {
            events: engine.events(),
            time: engine.time(),
            cause: outcome,
        },
        snapshot: engine.snapshot(),
        steps,
        rendezvous,
    })
}

/// Runs `params.workers` workers on scoped threads. `sink_for(rank)` may
/// supply a snapshot sink per worker.
pub fn run_pool<F>(
    params: &Params,
    stop: &StopSignal,
    mut sink_for: F,
) -> Result<PoolReport, SimError>
where
    F: FnMut(usize) -> Result<Option<Box<dyn SnapshotSink + Send>>, SimError>,
{
    params.validate()?;
    let size = params.workers;
    let mut engines = Vec::with_capacity(size);
    for rank in 0..size {
        let context = WorkerContext { rank, size };
        let mut engine = params
            .build_engine(context, params.seed_for(context))?
            .with_stop_signal(stop.clone());
        if let Some(sink) = sink_for(rank)? {
            engine = engine.with_sink(sink);
        }
        engines.push(engine);
    }
    run_engines(params, engines)
}

/// Runs already built engines, one per rank, as a pool.
pub fn run_engines(
    params: &Params,
    engines: Vec<SimulationEngine>,
) -> Result<PoolReport, SimError> {
    let size = engines.len();
    if size == 0 {
        return Err(SimError::invalid("a pool needs at least one worker"));
    }
    let misplaced = engines
        .iter()
        .enumerate()
        .any(|(rank, engine)| engine.context() != (WorkerContext { rank, size }));
    if misplaced {
        return Err(SimError::invalid(
            "engines must be ordered by rank and sized for the pool",
        ));
    }
    info!("{}: starting {size} worker(s) until t={}", params.name, params.tend);

    let gates = Gate::<WorkerReport>::pool(size);
    let results: Vec<Result<WorkerOutcome, SimError>> = thread::scope(|scope| {
        let handles: Vec<_> = engines
            .into_iter()
            .zip(gates)
            .map(|(engine, mut gate)| {
                scope.spawn(move || run_worker(params, engine, &mut gate))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(SimError::WorkerPanicked(rank)))
            })
            .collect()
    });

    let mut workers = Vec::with_capacity(size);
    for result in results {
        workers.push(result?);
    }
    let mut populations: BTreeMap<String, u64> = BTreeMap::new();
    for worker in &workers {
        for (name, pop) in &worker.snapshot.populations {
            *populations.entry(name.clone()).or_default() += pop;
        }
    }
    let events = workers.iter().map(|worker| worker.summary.events).sum();
    info!("{}: {events} events over {size} worker(s)", params.name);
    Ok(PoolReport {
        workers,
        events,
        populations,
    })
}
