//! Evaluation of a single (configuration, budget) trial.
use crate::budget::{BudgetConverter, BudgetMode, Effort};
use crate::reduction::{self, ReducedSpace};
use crate::space::{Configuration, ConfigurationSpace, Value};
use crate::{ErrorKind, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::f64;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Datasets with more points than `N_KEEP_DATA * 1.5` are down-sampled to `N_KEEP_DATA`.
pub const N_KEEP_DATA: u64 = 30_000;

/// Memory limit handed to the trainer (in MiB).
pub const TA_MEMORY_LIMIT: u64 = 6000;

/// Number of folds for cross-validation.
pub const N_FOLDS: usize = 10;

/// Datasets smaller than this are cross-validated instead of split.
pub const MIN_N_DATA_FOR_SH: u64 = 1000;

/// Run identifier reserved for the dummy baseline.
pub const DUMMY_RUN_ID: u64 = 1;

/// How a trial's quality is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResamplingStrategy {
    /// Single train/validation split.
    Holdout,

    /// k-fold cross-validation.
    Cv {
        /// Number of folds.
        folds: usize,
    },
}
impl ResamplingStrategy {
    /// Chooses the strategy for a dataset of `n_data_points` examples.
    pub fn for_data_points(n_data_points: u64) -> Self {
        if n_data_points < MIN_N_DATA_FOR_SH {
            ResamplingStrategy::Cv { folds: N_FOLDS }
        } else {
            ResamplingStrategy::Holdout
        }
    }

    /// Returns `true` if this is cross-validation.
    pub fn is_cv(&self) -> bool {
        if let ResamplingStrategy::Cv { .. } = self {
            true
        } else {
            false
        }
    }
}
impl fmt::Display for ResamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResamplingStrategy::Holdout => write!(f, "holdout"),
            ResamplingStrategy::Cv { .. } => write!(f, "cv"),
        }
    }
}

/// Training effort instructions for the trainer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instance {
    /// Maximum number of training rounds.
    pub max_iter: Option<u64>,

    /// Number of training examples to use.
    pub subsample: Option<u64>,
}

/// Limits a trainer has to respect.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    /// Wall-clock time available to the whole evaluation phase.
    pub wallclock_limit: Duration,

    /// Maximum number of runs (`None` means unlimited).
    pub run_limit: Option<u64>,

    /// Memory limit in MiB.
    pub memory_limit_mb: u64,

    /// When the evaluation phase started.
    pub started_at: Instant,
}

/// Request passed to a `TargetAlgorithm`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Unique run identifier.
    pub num_run: u64,

    /// Random seed.
    pub seed: u64,

    /// Configuration to train (`None` for the dummy baseline).
    pub config: Option<Configuration>,

    /// Resampling strategy.
    pub resampling: ResamplingStrategy,

    /// Effort instructions.
    pub instance: Instance,

    /// Wall-clock cutoff for this run.
    pub cutoff: Duration,

    /// Whether the data may be shuffled.
    pub shuffle: bool,

    /// Limits of the evaluation phase.
    pub limits: RunLimits,
}

/// Final state of a trainer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RunStatus {
    /// The run finished and produced a cost.
    Success,

    /// The run crashed.
    Crashed,

    /// The run hit its cutoff.
    Timeout,

    /// The run hit its memory limit.
    MemoryOut,

    /// The run was aborted before starting.
    Abort,
}

/// What a `TargetAlgorithm` reports back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final state.
    pub status: RunStatus,

    /// Cost (lower is better); ignored unless `status` is `RunStatus::Success`.
    pub cost: f64,

    /// Wall-clock time spent.
    pub runtime: Duration,

    /// Free-form diagnostics.
    pub info: BTreeMap<String, String>,
}
impl RunOutcome {
    /// Makes a successful outcome.
    pub fn success(cost: f64, runtime: Duration) -> Self {
        Self {
            status: RunStatus::Success,
            cost,
            runtime,
            info: BTreeMap::new(),
        }
    }

    /// Makes a failed outcome with the given status and message.
    pub fn failure<S: Into<String>>(status: RunStatus, message: S, runtime: Duration) -> Self {
        let mut info = BTreeMap::new();
        info.insert("error".to_owned(), message.into());
        Self {
            status,
            cost: f64::INFINITY,
            runtime,
            info,
        }
    }
}

/// External training/evaluation callable.
pub trait TargetAlgorithm {
    /// Trains and evaluates the requested configuration.
    fn run(&mut self, request: &RunRequest) -> RunOutcome;
}
impl<T: TargetAlgorithm + ?Sized> TargetAlgorithm for Box<T> {
    fn run(&mut self, request: &RunRequest) -> RunOutcome {
        (**self).run(request)
    }
}

/// Result of one (configuration, budget) evaluation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrialResult {
    /// Run identifier.
    pub run_id: u64,

    /// Final state.
    pub status: RunStatus,

    /// Loss used for ranking (`+inf` on failure or penalty).
    pub loss: f64,

    /// Budget the trial was evaluated at.
    pub budget: f64,

    /// Wall-clock time spent by the trainer.
    pub runtime: Duration,

    /// Free-form diagnostics.
    pub info: BTreeMap<String, String>,

    /// The exact configuration evaluated (after deactivation).
    pub config: Configuration,
}
impl TrialResult {
    /// Returns `true` if the loss is finite.
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }
}

/// Mutable bookkeeping of an `EvaluationWorker`.
#[derive(Debug, Clone)]
pub struct WorkerState {
    /// Identifier of the next trial.
    pub counter: u64,

    /// Sum of budgets this worker's time is allotted against.
    pub total_budget: f64,

    /// Wall-clock time available to this worker.
    pub total_time: Duration,

    /// Per-family budget conversion.
    pub converter: BudgetConverter,
}

/// Builder of `EvaluationWorker`.
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    n_data_points: u64,
    total_budget: f64,
    total_time: Duration,
    mode: Option<BudgetMode>,
    counter: u64,
    backup_budgets: bool,
    shuffle: bool,
    seed: u64,
    caps: Vec<(String, f64)>,
}
impl WorkerBuilder {
    /// Makes a new `WorkerBuilder` instance with the default settings.
    pub fn new(n_data_points: u64, total_budget: f64, total_time: Duration) -> Self {
        Self {
            n_data_points,
            total_budget,
            total_time,
            mode: None,
            counter: 2,
            backup_budgets: false,
            shuffle: true,
            seed: 0,
            caps: vec![(
                "rescaling:quantile_transformer:n_quantiles".to_owned(),
                2000.0,
            )],
        }
    }

    /// Overrides the per-family budget mode of every family.
    pub fn mode(&mut self, mode: Option<BudgetMode>) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Sets the first run identifier this worker issues.
    ///
    /// # Errors
    ///
    /// Identifiers below `2` are reserved and rejected with `ErrorKind::InvalidInput`.
    pub fn counter(&mut self, counter: u64) -> Result<&mut Self> {
        track_assert!(counter > DUMMY_RUN_ID, ErrorKind::InvalidInput; counter);
        self.counter = counter;
        Ok(self)
    }

    /// Makes the worker use the backup budget multipliers.
    pub fn backup_budgets(&mut self) -> &mut Self {
        self.backup_budgets = true;
        self
    }

    /// Sets whether the data may be shuffled.
    pub fn shuffle(&mut self, shuffle: bool) -> &mut Self {
        self.shuffle = shuffle;
        self
    }

    /// Sets the seed (also used as the worker identifier).
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    /// Caps the value of a numerical hyperparameter.
    pub fn cap<S: Into<String>>(&mut self, name: S, max: f64) -> &mut Self {
        self.caps.push((name.into(), max));
        self
    }

    /// Builds a new `EvaluationWorker` instance over the full space `space`.
    pub fn finish<T>(&self, space: &ConfigurationSpace, trainer: T) -> Result<EvaluationWorker<T>>
    where
        T: TargetAlgorithm,
    {
        track_assert!(self.n_data_points > 0, ErrorKind::InvalidInput);
        track_assert!(
            self.total_budget.is_finite() && self.total_budget > 0.0,
            ErrorKind::InvalidInput;
            self.total_budget
        );

        let reduced = track!(reduction::reduce(space))?;
        let converter = if self.backup_budgets {
            BudgetConverter::backup(self.mode)
        } else {
            BudgetConverter::standard(self.mode)
        };
        Ok(EvaluationWorker {
            full_space: space.clone(),
            reduced,
            state: WorkerState {
                counter: self.counter,
                total_budget: self.total_budget,
                total_time: self.total_time,
                converter,
            },
            trainer,
            rng: StdRng::seed_from_u64(self.seed),
            n_data_points: self.n_data_points,
            shuffle: self.shuffle,
            seed: self.seed,
            caps: self.caps.clone(),
        })
    }
}

/// Trains one configuration at one budget and reports a loss.
#[derive(Debug)]
pub struct EvaluationWorker<T> {
    full_space: ConfigurationSpace,
    reduced: ReducedSpace,
    state: WorkerState,
    trainer: T,
    rng: StdRng,
    n_data_points: u64,
    shuffle: bool,
    seed: u64,
    caps: Vec<(String, f64)>,
}
impl<T: TargetAlgorithm> EvaluationWorker<T> {
    /// Returns the reduced space the scheduler should search.
    pub fn reduced_space(&self) -> &ReducedSpace {
        &self.reduced
    }

    pub fn full_space(&self) -> &ConfigurationSpace {
        &self.full_space
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Returns the identifier the next trial will get.
    pub fn counter(&self) -> u64 {
        self.state.counter
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Consumes the worker, returning the trainer.
    pub fn into_trainer(self) -> T {
        self.trainer
    }

    /// Evaluates `config` (or a random configuration if `None`) at `budget`.
    ///
    /// This never fails: problems are reported as a non-successful trial with an infinite loss.
    pub fn evaluate(&mut self, config: Option<Configuration>, budget: f64) -> TrialResult {
        match track!(self.prepare(config, budget)) {
            Ok((config, request, mode)) => {
                let outcome = self.trainer.run(&request);
                let result = self.finish_trial(config, budget, outcome, mode);
                self.state.counter += 1;
                result
            }
            Err(e) => {
                debug!("Trial {} was rejected: {}", self.state.counter, e);
                self.crashed_trial(budget, &e.to_string())
            }
        }
    }

    /// Records a trial whose trainer did not return (for example because it panicked).
    pub fn crashed_trial(&mut self, budget: f64, message: &str) -> TrialResult {
        let mut info = BTreeMap::new();
        info.insert("error".to_owned(), message.to_owned());
        let result = TrialResult {
            run_id: self.state.counter,
            status: RunStatus::Crashed,
            loss: f64::INFINITY,
            budget,
            runtime: Duration::from_secs(0),
            info,
            config: Configuration::new(),
        };
        self.state.counter += 1;
        result
    }

    fn prepare(
        &mut self,
        config: Option<Configuration>,
        budget: f64,
    ) -> Result<(Configuration, RunRequest, BudgetMode)> {
        track_assert!(
            budget.is_finite() && budget > 0.0,
            ErrorKind::InvalidInput;
            budget
        );

        let config = if let Some(mut config) = config {
            self.apply_caps(&mut config);
            let config = self.reduced.reinsert_constants(&config);
            track!(self.full_space.deactivate_inactive_hyperparameters(&config))?
        } else {
            self.full_space.sample_configuration(&mut self.rng)
        };
        let family = track_assert_some!(
            config.algorithm(),
            ErrorKind::InvalidInput,
            "configuration has no algorithm choice"
        )
        .to_owned();

        let mut instance = Instance::default();
        let n_data_points = if self.n_data_points > N_KEEP_DATA * 3 / 2 {
            info!(
                "Changing train/test split. Using only {} ({} data points) of the data.",
                N_KEEP_DATA as f64 / self.n_data_points as f64,
                N_KEEP_DATA
            );
            instance.subsample = Some(N_KEEP_DATA);
            N_KEEP_DATA
        } else {
            self.n_data_points
        };

        let resampling = ResamplingStrategy::for_data_points(n_data_points);
        info!("Using resampling strategy {}.", resampling);

        let mode = track!(self.state.converter.mode(&family))?;
        if !resampling.is_cv() {
            match track!(self.state.converter.convert(&family, budget, n_data_points))? {
                Effort::Iterations(n) => instance.max_iter = Some(n),
                Effort::Subsample(n) => instance.subsample = Some(n),
            }
        }

        let fraction = budget / self.state.total_budget;
        let cutoff = (self.state.total_time.as_secs_f64() * fraction).ceil();
        let request = RunRequest {
            num_run: self.state.counter,
            seed: self.seed,
            config: Some(config.clone()),
            resampling,
            instance,
            cutoff: Duration::from_secs_f64(cutoff.max(0.0)),
            shuffle: self.shuffle,
            limits: RunLimits {
                wallclock_limit: self.state.total_time,
                run_limit: None,
                memory_limit_mb: TA_MEMORY_LIMIT,
                started_at: Instant::now(),
            },
        };
        Ok((config, request, mode))
    }

    fn apply_caps(&self, config: &mut Configuration) {
        for (name, max) in &self.caps {
            let capped = match config.get(name) {
                Some(Value::Int(v)) if (*v as f64) > *max => Value::Int(*max as i64),
                Some(Value::Float(v)) if *v > *max => Value::Float(*max),
                _ => continue,
            };
            config.insert(name.as_str(), capped);
        }
    }

    fn finish_trial(
        &self,
        config: Configuration,
        budget: f64,
        outcome: RunOutcome,
        mode: BudgetMode,
    ) -> TrialResult {
        let family = config.algorithm().unwrap_or_default();
        let loss = if outcome.status != RunStatus::Success || outcome.cost.is_nan() {
            f64::INFINITY
        } else if self.state.converter.is_penalized(family, mode) {
            // More rounds do not change this family's model, so its ranking must not benefit from them.
            f64::INFINITY
        } else {
            outcome.cost
        };
        TrialResult {
            run_id: self.state.counter,
            status: outcome.status,
            loss,
            budget,
            runtime: outcome.runtime,
            info: outcome.info,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ALGORITHM_CHOICE;
    use crate::testing::{self, Script};
    use trackable::result::TestResult;

    fn worker(n: u64, script: Script) -> Result<EvaluationWorker<testing::ScriptedTrainer>> {
        let space = track!(testing::full_space())?;
        track!(WorkerBuilder::new(n, 2.0, Duration::from_secs(100))
            .finish(&space, testing::ScriptedTrainer::new(script)))
    }

    fn config(family: &str) -> Configuration {
        let mut c = Configuration::new();
        c.insert(ALGORITHM_CHOICE, family);
        c
    }

    #[test]
    fn holdout_iterations_work() -> TestResult {
        let mut w = track!(worker(2000, Script::Succeed(0.25)))?;
        let r = w.evaluate(Some(config("xgradient_boosting")), 0.25);
        assert_eq!(r.status, RunStatus::Success);
        assert_eq!(r.loss, 0.25);
        assert_eq!(r.run_id, 2);
        assert_eq!(w.counter(), 3);

        let requests = w.trainer().requests();
        let req = &requests[0];
        assert_eq!(req.resampling, ResamplingStrategy::Holdout);
        assert_eq!(req.instance.max_iter, Some(128));
        assert_eq!(req.instance.subsample, None);
        // 100s * (0.25 / 2.0)
        assert_eq!(req.cutoff, Duration::from_secs(13));
        Ok(())
    }

    #[test]
    fn constants_are_reinserted_before_training() -> TestResult {
        let mut w = track!(worker(2000, Script::Succeed(0.1)))?;
        let r = w.evaluate(Some(config("extra_trees")), 1.0);
        assert_eq!(r.status, RunStatus::Success);
        assert_eq!(
            r.config.get("classifier:extra_trees:bootstrap"),
            Some(&Value::from("True"))
        );
        track!(w.full_space().check_configuration(&r.config))?;
        Ok(())
    }

    #[test]
    fn small_datasets_are_cross_validated_without_conversion() -> TestResult {
        let mut w = track!(worker(500, Script::Succeed(0.3)))?;
        let r = w.evaluate(Some(config("xgradient_boosting")), 1.0);
        assert_eq!(r.loss, 0.3);

        let requests = w.trainer().requests();
        let req = &requests[0];
        assert_eq!(req.resampling, ResamplingStrategy::Cv { folds: 10 });
        assert_eq!(req.instance, Instance::default());
        Ok(())
    }

    #[test]
    fn large_datasets_are_subsampled() -> TestResult {
        let mut w = track!(worker(100_000, Script::Succeed(0.3)))?;
        w.evaluate(Some(config("libsvm_svc")), 0.5);

        let requests = w.trainer().requests();
        let req = &requests[0];
        assert_eq!(req.instance.subsample, Some(15_000));
        assert_eq!(req.instance.max_iter, None);
        Ok(())
    }

    #[test]
    fn failures_become_infinite_losses() -> TestResult {
        let mut w = track!(worker(2000, Script::Fail))?;
        let r = w.evaluate(Some(config("sgd")), 1.0);
        assert_eq!(r.status, RunStatus::Crashed);
        assert!(r.loss.is_infinite());
        assert_eq!(w.counter(), 3);
        Ok(())
    }

    #[test]
    fn svm_in_iterations_mode_is_penalized() -> TestResult {
        let space = track!(testing::full_space())?;
        let mut w = track!(WorkerBuilder::new(2000, 2.0, Duration::from_secs(100))
            .mode(Some(BudgetMode::Iterations))
            .finish(&space, testing::ScriptedTrainer::new(Script::Succeed(0.01))))?;

        let r = w.evaluate(Some(config("libsvm_svc")), 1.0);
        assert_eq!(r.status, RunStatus::Success);
        assert!(r.loss.is_infinite());

        let r = w.evaluate(Some(config("sgd")), 1.0);
        assert_eq!(r.loss, 0.01);
        Ok(())
    }

    #[test]
    fn caps_are_applied() -> TestResult {
        let mut w = track!(worker(2000, Script::Succeed(0.1)))?;
        let mut c = config("sgd");
        c.insert("rescaling:__choice__", "quantile_transformer");
        c.insert("rescaling:quantile_transformer:n_quantiles", 5000i64);
        let r = w.evaluate(Some(c), 1.0);
        assert_eq!(
            r.config.get("rescaling:quantile_transformer:n_quantiles"),
            Some(&Value::Int(2000))
        );
        Ok(())
    }

    #[test]
    fn missing_configuration_is_sampled() -> TestResult {
        let mut w = track!(worker(2000, Script::Succeed(0.1)))?;
        let r = w.evaluate(None, 1.0);
        assert_eq!(r.status, RunStatus::Success);
        track!(w.full_space().check_configuration(&r.config))?;
        Ok(())
    }

    #[test]
    fn invalid_requests_are_reported_not_raised() -> TestResult {
        let mut w = track!(worker(2000, Script::Succeed(0.1)))?;
        let r = w.evaluate(Some(config("no_such_family")), 1.0);
        assert_eq!(r.status, RunStatus::Crashed);
        assert!(r.loss.is_infinite());
        assert!(w.trainer().requests().is_empty());
        assert_eq!(w.counter(), 3);
        Ok(())
    }

    #[test]
    fn reserved_counter_is_rejected() {
        let mut builder = WorkerBuilder::new(10, 1.0, Duration::from_secs(1));
        assert!(builder.counter(1).is_err());
        assert!(builder.counter(5).is_ok());
    }
}
