use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::WorkerContext;
use crate::engine::RunSummary;
use crate::error::SimError;
use crate::params::Params;

/// Final populations of independent replicate runs.
#[derive(Clone, Debug)]
pub struct EnsembleOutput {
    pub names: Vec<String>,
    /// `n_trajectories × names.len()`, row-major.
    pub data: Vec<u64>,
    pub summaries: Vec<RunSummary>,
}

impl EnsembleOutput {
    pub fn n_trajectories(&self) -> usize {
        self.summaries.len()
    }

    pub fn trajectory(&self, index: usize) -> &[u64] {
        let stride = self.names.len();
        &self.data[index * stride..(index + 1) * stride]
    }
}

/// Runs `n_trajectories` single-worker replicates of `params` in parallel.
/// Replicate `i` is seeded with `derive_seed(seed, i)`, so results do not
/// depend on the thread count.
pub fn run_ensemble(
    params: &Params,
    names: &[String],
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> Result<EnsembleOutput, SimError> {
    if n_trajectories == 0 {
        return Err(SimError::invalid("number of trajectories must be greater than zero"));
    }
    if names.is_empty() {
        return Err(SimError::invalid("at least one compound name must be recorded"));
    }
    params.validate()?;
    let seed = seed.or(params.seed);
    let stride = names.len();
    let mut data = vec![0u64; n_trajectories * stride];
    let mut summaries: Vec<Option<RunSummary>> = vec![None; n_trajectories];

    let mut simulate = || -> Result<(), SimError> {
        data.par_chunks_mut(stride)
            .zip(summaries.par_iter_mut())
            .enumerate()
            .try_for_each(|(traj_idx, (chunk, summary))| {
                let traj_seed = derive_seed(seed, traj_idx as u64);
                let mut engine = params.build_engine(WorkerContext::single(), traj_seed)?;
                let outcome = engine.run()?;
                for (slot, name) in chunk.iter_mut().zip(names) {
                    *slot = engine.network().population(name);
                }
                *summary = Some(outcome);
                Ok(())
            })
    };

    match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(|| simulate())?,
        None => simulate()?,
    };

    Ok(EnsembleOutput {
        names: names.to_vec(),
        data,
        summaries: summaries.into_iter().flatten().collect(),
    })
}

pub fn derive_seed(seed: Option<u64>, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}
