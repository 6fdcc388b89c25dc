//! Top-level sequencing of one AutoML task.
//!
//! A task goes through these phases:
//!
//! 1. the dummy baseline is trained,
//! 2. the ensemble service is started in the background,
//! 3. one successive-halving bracket (or one single-rung iteration per
//!    portfolio entry on small datasets) searches the primary space,
//! 4. a fresh worker continues that search, or, if nothing succeeded, a
//!    fallback search over a single-family space takes over,
//! 5. the ensemble service is joined and terminated if it does not stop in time.
use crate::budget::{self, BudgetMode};
use crate::dummy::DummyPredictionStage;
use crate::ensemble::BackgroundService;
use crate::history::{Run, RunHistory};
use crate::pool::{QueuePolicy, WorkerPool};
use crate::portfolio::Portfolio;
use crate::reduction::ReducedSpace;
use crate::scheduler::{Scheduler, SchedulerBuilder, Termination};
use crate::space::{Configuration, ConfigurationSpace, ALGORITHM_CHOICE};
use crate::worker::{
    EvaluationWorker, TargetAlgorithm, TrialResult, WorkerBuilder, DUMMY_RUN_ID, MIN_N_DATA_FOR_SH,
};
use crate::Result;
use factory::Factory;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Time reserved at the end of each dataset's budget.
pub const TASK_TIME_BUFFER: Duration = Duration::from_secs(10);

/// Gap between the first run identifiers of workers started together.
pub const RUN_ID_STRIDE: u64 = 1_000_000;

/// Returns the time one task may take.
///
/// This is `min(dataset_budget - TASK_TIME_BUFFER - task_elapsed, overall_budget - overall_elapsed)`,
/// saturating at zero.
pub fn task_time_limit(
    dataset_budget: Duration,
    task_elapsed: Duration,
    overall_budget: Duration,
    overall_elapsed: Duration,
) -> Duration {
    let for_dataset = dataset_budget
        .saturating_sub(TASK_TIME_BUFFER)
        .saturating_sub(task_elapsed);
    let overall = overall_budget.saturating_sub(overall_elapsed);
    cmp::min(for_dataset, overall)
}

/// The extra-trees configuration the fallback search starts from.
pub fn fallback_configuration() -> Configuration {
    let mut c = Configuration::new();
    c.insert("balancing:strategy", "weighting");
    c.insert("categorical_encoding:__choice__", "no_encoding");
    c.insert(ALGORITHM_CHOICE, "extra_trees");
    c.insert("classifier:extra_trees:bootstrap", "True");
    c.insert("classifier:extra_trees:criterion", "entropy");
    c.insert("classifier:extra_trees:max_features", 0.5);
    c.insert("classifier:extra_trees:min_samples_leaf", 5i64);
    c.insert("classifier:extra_trees:min_samples_split", 10i64);
    c.insert("imputation:strategy", "mean");
    c.insert("preprocessor:__choice__", "no_preprocessing");
    c.insert("rescaling:__choice__", "none");
    c
}

/// Settings of `AutoMl`.
#[derive(Debug, Clone)]
pub struct AutoMlOptions {
    /// Reduction factor between rungs.
    pub eta: f64,

    /// Smallest budget (ignored for datasets below `MIN_N_DATA_FOR_SH` points).
    pub min_budget: f64,

    /// Largest budget.
    pub max_budget: f64,

    /// Seed of the workers and the samplers.
    pub seed: u64,

    /// Poll interval of the scheduler and the ensemble service.
    pub sleep: Duration,

    /// Overrides the budget mode of every family.
    pub mode: Option<BudgetMode>,

    /// Whether the data may be shuffled (`false` for chronologically ordered data).
    pub shuffle: bool,

    /// Number of workers per search.
    pub n_workers: usize,

    /// How long the ensemble service is waited for at the end.
    pub ensemble_join_timeout: Duration,

    /// Iterations run after the primary search.
    pub final_iterations: usize,

    /// Total budget used for datasets below `MIN_N_DATA_FOR_SH` points.
    pub small_dataset_total_budget: f64,

    /// Fraction of random configurations in the fallback search.
    pub fallback_random_fraction: f64,

    /// Job queue policy of every worker pool.
    pub queue_policy: QueuePolicy,
}
impl Default for AutoMlOptions {
    fn default() -> Self {
        Self {
            eta: 4.0,
            min_budget: 1.0 / 16.0,
            max_budget: 1.0,
            seed: 3,
            sleep: Duration::from_secs(5),
            mode: None,
            shuffle: true,
            n_workers: 1,
            ensemble_join_timeout: Duration::from_secs(10),
            final_iterations: 1000,
            small_dataset_total_budget: 16.0,
            fallback_random_fraction: 0.1,
            queue_policy: QueuePolicy::default(),
        }
    }
}

/// Configuration spaces searched by `AutoMl`.
#[derive(Debug, Clone)]
pub struct SearchSpaces {
    /// Space of the primary search.
    pub primary: ConfigurationSpace,

    /// Single-family space searched when the primary search found nothing.
    ///
    /// It must contain `fallback_configuration()`.
    pub fallback: ConfigurationSpace,
}

/// One dataset to solve.
#[derive(Debug, Clone)]
pub struct Task {
    /// Dataset name (informational).
    pub name: String,

    /// Number of training examples.
    pub n_data_points: u64,

    /// Wall-clock time for the whole task (see `task_time_limit`).
    pub time_budget: Duration,

    /// Configurations tried first; `None` means random members of the reduced space.
    pub portfolio: Option<Portfolio>,
}
impl Task {
    /// Makes a new `Task` instance without a portfolio.
    pub fn new<S: Into<String>>(name: S, n_data_points: u64, time_budget: Duration) -> Self {
        Self {
            name: name.into(),
            n_data_points,
            time_budget,
            portfolio: None,
        }
    }
}

/// What the task predicts with.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// No search trial succeeded; the dummy baseline is used.
    Dummy,

    /// The incumbent configuration.
    Model(Configuration),
}

/// Result of `AutoMl::run`.
#[derive(Debug, Clone)]
pub struct AutoMlOutcome {
    /// The dummy baseline trial.
    pub dummy: TrialResult,

    /// Whether the fallback search ran.
    pub fallback_used: bool,

    /// Run history of every scheduler, in start order.
    pub histories: Vec<RunHistory>,

    /// Best run of the last scheduler.
    pub incumbent: Option<Run>,

    /// Why the last scheduler stopped.
    pub termination: Termination,

    /// What the task predicts with.
    pub prediction: Prediction,
}

#[derive(Debug)]
struct Search {
    histories: Vec<RunHistory>,
    fallback_used: bool,
    incumbent: Option<Run>,
    termination: Termination,
}

/// Runs AutoML tasks with trainers made by a factory.
#[derive(Debug)]
pub struct AutoMl<F> {
    factory: F,
    spaces: SearchSpaces,
    options: AutoMlOptions,
}
impl<F> AutoMl<F>
where
    F: Factory,
    F::Item: TargetAlgorithm + Send + 'static,
{
    /// Makes a new `AutoMl` instance.
    pub fn new(factory: F, spaces: SearchSpaces, options: AutoMlOptions) -> Self {
        Self {
            factory,
            spaces,
            options,
        }
    }

    /// Returns the settings.
    pub fn options(&self) -> &AutoMlOptions {
        &self.options
    }

    /// Solves `task`.
    ///
    /// `ensemble` builds the background ensemble service from the time left
    /// after the dummy baseline. The service is always stopped before this returns.
    pub fn run<B, E>(&self, task: &Task, ensemble: E) -> Result<AutoMlOutcome>
    where
        B: BackgroundService,
        E: FnOnce(Duration) -> B,
    {
        let started = Instant::now();
        let deadline = started + task.time_budget;
        info!(
            "Solving {} ({} data points) within {:?}",
            task.name, task.n_data_points, task.time_budget
        );

        let mut trainer = self.factory.create();
        let dummy = DummyPredictionStage::new(task.n_data_points, task.time_budget)
            .seed(self.options.seed)
            .shuffle(self.options.shuffle)
            .run(&mut trainer);

        let time_left = task.time_budget.saturating_sub(started.elapsed());
        info!("Starting ensemble service with {:?} left", time_left);
        let mut service = ensemble(time_left);
        track!(service.start())?;

        let search = self.search(task, time_left, deadline);
        self.stop_ensemble(&mut service, deadline);
        let search = track!(search)?;

        let prediction = match &search.incumbent {
            Some(run) => Prediction::Model(run.result.config.clone()),
            None => {
                warn!("No search trial succeeded; predicting with the dummy baseline");
                Prediction::Dummy
            }
        };
        Ok(AutoMlOutcome {
            dummy,
            fallback_used: search.fallback_used,
            histories: search.histories,
            incumbent: search.incumbent,
            termination: search.termination,
            prediction,
        })
    }

    fn search(&self, task: &Task, time_left: Duration, deadline: Instant) -> Result<Search> {
        let o = &self.options;
        let (min_budget, total_budget) = if task.n_data_points < MIN_N_DATA_FOR_SH {
            (o.max_budget, o.small_dataset_total_budget)
        } else {
            (
                o.min_budget,
                budget::total_budget(o.min_budget, o.max_budget, o.eta),
            )
        };

        let builder = self.worker_builder(task, total_budget, time_left);
        let (mut pool, reduced) =
            track!(self.start_workers(&self.spaces.primary, builder, DUMMY_RUN_ID + 1))?;

        let mut portfolio = match &task.portfolio {
            Some(p) => p.clone(),
            None => Portfolio::random(reduced.space(), &mut StdRng::seed_from_u64(o.seed)),
        };
        portfolio.strip_constants(&reduced);
        info!("Retrieved portfolio of length {}", portfolio.len());
        let n_primary = if min_budget < o.max_budget {
            1
        } else {
            cmp::max(portfolio.len(), 1)
        };

        let mut scheduler = track!(track!(self.scheduler_builder(min_budget, true))?
            .finish(reduced.space().clone(), portfolio))?;
        let termination = match track!(scheduler.run(n_primary, &mut pool, 1, Some(deadline))) {
            Ok(t) => t,
            Err(e) => {
                pool.abandon();
                return Err(e);
            }
        };
        if termination == Termination::DeadlineExceeded {
            pool.abandon();
            return Ok(Search {
                histories: vec![scheduler.history().clone()],
                fallback_used: false,
                incumbent: scheduler.history().incumbent().cloned(),
                termination,
            });
        }
        let counter = pool
            .shutdown()
            .iter()
            .map(EvaluationWorker::counter)
            .max()
            .unwrap_or(DUMMY_RUN_ID + 1);

        let time_taken = scheduler.history().time_taken();
        let worker_time = if min_budget < o.max_budget {
            time_left.saturating_sub(time_taken)
        } else {
            time_left
        };
        info!(
            "Primary search took {:?}; {:?} left for the next worker",
            time_taken, worker_time
        );

        if scheduler.history().any_finite() {
            let builder = self.worker_builder(task, total_budget, worker_time);
            let (pool, _) = track!(self.start_workers(&self.spaces.primary, builder, counter + 1))?;
            let termination = track!(self.finish_search(&mut scheduler, pool, deadline))?;
            return Ok(Search {
                histories: vec![scheduler.history().clone()],
                fallback_used: false,
                incumbent: scheduler.history().incumbent().cloned(),
                termination,
            });
        }

        error!("Found no successful runs so far, will continue with a fallback configuration space!");
        let mut builder = self.worker_builder(task, total_budget, worker_time);
        builder.backup_budgets();
        let (pool, reduced) =
            track!(self.start_workers(&self.spaces.fallback, builder, counter + 1))?;

        let mut portfolio = Portfolio::new();
        portfolio.push(fallback_configuration());
        portfolio.strip_constants(&reduced);
        let mut fallback = track!(self.scheduler_builder(min_budget, false))?;
        track!(fallback.random_fraction(o.fallback_random_fraction))?;
        let mut fallback = track!(fallback.finish(reduced.space().clone(), portfolio))?;
        let termination = track!(self.finish_search(&mut fallback, pool, deadline))?;
        Ok(Search {
            histories: vec![scheduler.history().clone(), fallback.history().clone()],
            fallback_used: true,
            incumbent: fallback.history().incumbent().cloned(),
            termination,
        })
    }

    fn finish_search(
        &self,
        scheduler: &mut Scheduler,
        mut pool: WorkerPool<F::Item>,
        deadline: Instant,
    ) -> Result<Termination> {
        let termination = track!(scheduler.run(
            self.options.final_iterations,
            &mut pool,
            1,
            Some(deadline)
        ));
        match termination {
            Ok(Termination::Completed) => {
                pool.shutdown();
            }
            _ => pool.abandon(),
        }
        termination
    }

    fn worker_builder(&self, task: &Task, total_budget: f64, total_time: Duration) -> WorkerBuilder {
        let mut builder = WorkerBuilder::new(task.n_data_points, total_budget, total_time);
        builder
            .mode(self.options.mode)
            .shuffle(self.options.shuffle)
            .seed(self.options.seed);
        builder
    }

    fn start_workers(
        &self,
        space: &ConfigurationSpace,
        builder: WorkerBuilder,
        first_counter: u64,
    ) -> Result<(WorkerPool<F::Item>, ReducedSpace)> {
        let mut pool = WorkerPool::new(self.options.queue_policy);
        let mut reduced = None;
        for i in 0..cmp::max(self.options.n_workers, 1) {
            let mut builder = builder.clone();
            track!(builder.counter(first_counter + i as u64 * RUN_ID_STRIDE))?;
            let worker = track!(builder.finish(space, self.factory.create()))?;
            if reduced.is_none() {
                reduced = Some(worker.reduced_space().clone());
            }
            track!(pool.register(worker))?;
        }
        let reduced = reduced.unwrap_or_else(|| unreachable!());
        Ok((pool, reduced))
    }

    fn scheduler_builder(&self, min_budget: f64, sh_only: bool) -> Result<SchedulerBuilder> {
        let mut builder = SchedulerBuilder::new();
        track!(builder.eta(self.options.eta))?;
        track!(builder.budgets(min_budget, self.options.max_budget))?;
        builder
            .sh_only(sh_only)
            .seed(self.options.seed)
            .poll_interval(self.options.sleep);
        Ok(builder)
    }

    // The join never waits past the task deadline.
    fn stop_ensemble<B: BackgroundService>(&self, service: &mut B, deadline: Instant) {
        let timeout = cmp::min(
            self.options.ensemble_join_timeout,
            deadline.saturating_duration_since(Instant::now()),
        );
        if !service.join(timeout) && service.is_alive() {
            service.terminate();
        }
    }
}
