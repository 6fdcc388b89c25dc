//! Dummy-prediction baseline.
use crate::space::Configuration;
use crate::worker::{
    Instance, ResamplingStrategy, RunLimits, RunRequest, RunStatus, TargetAlgorithm, TrialResult,
    DUMMY_RUN_ID, TA_MEMORY_LIMIT,
};
use std::f64;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Trains the trivial baseline model before any search starts.
///
/// The baseline always uses run identifier `DUMMY_RUN_ID` and is trained at full effort.
#[derive(Debug, Clone)]
pub struct DummyPredictionStage {
    n_data_points: u64,
    time_for_task: Duration,
    seed: u64,
    shuffle: bool,
}
impl DummyPredictionStage {
    /// Makes a new `DummyPredictionStage` instance.
    pub fn new(n_data_points: u64, time_for_task: Duration) -> Self {
        Self {
            n_data_points,
            time_for_task,
            seed: 0,
            shuffle: true,
        }
    }

    /// Sets the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets whether the data may be shuffled.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Runs the baseline on `trainer`.
    ///
    /// Failures are logged and reported in the returned result; they never abort the run.
    pub fn run<T: TargetAlgorithm + ?Sized>(&self, trainer: &mut T) -> TrialResult {
        let resampling = ResamplingStrategy::for_data_points(self.n_data_points);
        info!("Using resampling strategy {}.", resampling);
        info!("Starting to create dummy predictions.");

        let cutoff = Duration::from_secs(self.time_for_task.as_secs());
        let request = RunRequest {
            num_run: DUMMY_RUN_ID,
            seed: self.seed,
            config: None,
            resampling,
            instance: Instance::default(),
            cutoff,
            shuffle: self.shuffle,
            limits: RunLimits {
                wallclock_limit: cutoff,
                run_limit: None,
                memory_limit_mb: TA_MEMORY_LIMIT,
                started_at: Instant::now(),
            },
        };
        let outcome = trainer.run(&request);

        let loss = if outcome.status == RunStatus::Success {
            info!("Finished creating dummy predictions.");
            outcome.cost
        } else {
            error!("Error creating dummy predictions: {:?}", outcome.info);
            f64::INFINITY
        };
        TrialResult {
            run_id: DUMMY_RUN_ID,
            status: outcome.status,
            loss,
            budget: 1.0,
            runtime: outcome.runtime,
            info: outcome.info,
            config: Configuration::new(),
        }
    }
}
