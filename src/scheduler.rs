//! Bracket driver: samples configurations, dispatches trials and advances rungs.
use crate::generators::{BohbGenerator, BohbOptions, ConfigGenerator, ConfigInfo};
use crate::history::{Run, RunHistory};
use crate::hyperband::BracketSchedule;
use crate::iteration::{ConfigId, Iteration, SuccessiveHalving};
use crate::pool::{Completion, Dispatch, WorkerPool};
use crate::portfolio::{Portfolio, PortfolioConfigGenerator};
use crate::space::ConfigurationSpace;
use crate::worker::TargetAlgorithm;
use crate::{ErrorKind, Result};
use std::cmp;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Why `Scheduler::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Every requested iteration finished.
    Completed,

    /// The deadline passed; in-flight trials were not awaited.
    DeadlineExceeded,
}

/// Builder of `Scheduler`.
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    eta: f64,
    min_budget: f64,
    max_budget: f64,
    sh_only: bool,
    bohb: BohbOptions,
    seed: u64,
    poll_interval: Duration,
}
impl SchedulerBuilder {
    /// Makes a new `SchedulerBuilder` instance with the default settings.
    ///
    /// The defaults are `eta = 3`, budgets in `[0.01, 1]`, full Hyperband
    /// (not successive-halving only) and the default `BohbOptions`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reduction factor.
    pub fn eta(&mut self, eta: f64) -> Result<&mut Self> {
        track_assert!(eta.is_finite() && eta > 1.0, ErrorKind::InvalidInput; eta);
        self.eta = eta;
        Ok(self)
    }

    /// Sets the smallest and the largest budget.
    pub fn budgets(&mut self, min_budget: f64, max_budget: f64) -> Result<&mut Self> {
        track_assert!(
            min_budget > 0.0 && max_budget.is_finite() && min_budget <= max_budget,
            ErrorKind::InvalidInput;
            min_budget,
            max_budget
        );
        self.min_budget = min_budget;
        self.max_budget = max_budget;
        Ok(self)
    }

    /// Restricts the scheduler to the largest bracket (plain successive halving).
    pub fn sh_only(&mut self, sh_only: bool) -> &mut Self {
        self.sh_only = sh_only;
        self
    }

    /// Sets the fraction of configurations sampled at random.
    pub fn random_fraction(&mut self, fraction: f64) -> Result<&mut Self> {
        track_assert!(0.0 <= fraction && fraction <= 1.0, ErrorKind::InvalidInput; fraction);
        self.bohb.random_fraction = fraction;
        Ok(self)
    }

    /// Sets the percentage of observations considered good.
    pub fn top_n_percent(&mut self, n: usize) -> Result<&mut Self> {
        track_assert!(0 < n && n < 100, ErrorKind::InvalidInput; n);
        self.bohb.top_n_percent = n;
        Ok(self)
    }

    /// Sets the number of candidates drawn per model-based pick.
    pub fn num_samples(&mut self, n: usize) -> Result<&mut Self> {
        track_assert!(n > 0, ErrorKind::InvalidInput);
        self.bohb.num_samples = n;
        Ok(self)
    }

    /// Sets the bandwidth widening factor used when drawing candidates.
    pub fn bandwidth_factor(&mut self, factor: f64) -> Result<&mut Self> {
        track_assert!(factor > 0.0, ErrorKind::InvalidInput; factor);
        self.bohb.bandwidth_factor = factor;
        Ok(self)
    }

    /// Sets the minimum number of observations a density model is built from.
    pub fn min_points_in_model(&mut self, n: Option<usize>) -> &mut Self {
        self.bohb.min_points_in_model = n;
        self
    }

    /// Sets the seed of the configuration sampler.
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    /// Sets how often the deadline is checked while waiting for results.
    pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    /// Builds a scheduler that serves `portfolio` first and then samples `space`
    /// with the model-based generator.
    pub fn finish(&self, space: ConfigurationSpace, portfolio: Portfolio) -> Result<Scheduler> {
        let bohb = track!(BohbGenerator::new(space, self.bohb.clone(), self.seed))?;
        let generator = PortfolioConfigGenerator::new(portfolio, bohb);
        track!(self.finish_with_generator(generator))
    }

    /// Builds a scheduler that draws configurations from `generator`.
    pub fn finish_with_generator<G>(&self, generator: G) -> Result<Scheduler>
    where
        G: ConfigGenerator + 'static,
    {
        let schedule = track!(BracketSchedule::new(
            self.eta,
            self.min_budget,
            self.max_budget
        ))?;
        info!("Using budgets {:?}", schedule.budgets());
        Ok(Scheduler {
            schedule,
            sh_only: self.sh_only,
            generator: Box::new(generator),
            iterations: Vec::new(),
            history: RunHistory::new(),
            running: HashMap::new(),
            poll_interval: self.poll_interval,
        })
    }
}
impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            eta: 3.0,
            min_budget: 0.01,
            max_budget: 1.0,
            sh_only: false,
            bohb: BohbOptions::default(),
            seed: 0,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Runs successive-halving brackets on a pool of workers.
pub struct Scheduler {
    schedule: BracketSchedule,
    sh_only: bool,
    generator: Box<dyn ConfigGenerator>,
    iterations: Vec<Iteration>,
    history: RunHistory,
    running: HashMap<ConfigId, (Instant, ConfigInfo)>,
    poll_interval: Duration,
}
impl Scheduler {
    /// Returns the rung geometry.
    pub fn schedule(&self) -> &BracketSchedule {
        &self.schedule
    }

    /// Returns the runs finished so far.
    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Returns the iterations started so far.
    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    /// Runs `n_iterations` more iterations on `pool`.
    ///
    /// At least `min_n_workers` (and at least one) workers must be registered.
    /// If `deadline` passes, the method returns `Termination::DeadlineExceeded`
    /// immediately; the caller should then abandon the pool.
    pub fn run<T>(
        &mut self,
        n_iterations: usize,
        pool: &mut WorkerPool<T>,
        min_n_workers: usize,
        deadline: Option<Instant>,
    ) -> Result<Termination>
    where
        T: TargetAlgorithm + Send + 'static,
    {
        let min_n_workers = cmp::max(min_n_workers, 1);
        track_assert!(
            pool.num_workers() >= min_n_workers,
            ErrorKind::InvalidInput,
            "{} worker(s) registered, {} required",
            pool.num_workers(),
            min_n_workers
        );

        let mut remaining = n_iterations;
        loop {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                info!(
                    "Deadline exceeded with {} trial(s) in flight",
                    pool.outstanding()
                );
                return Ok(Termination::DeadlineExceeded);
            }

            if pool.can_submit() {
                if track!(self.dispatch_next(pool))? {
                    continue;
                }
                if remaining > 0 {
                    track!(self.start_iteration())?;
                    remaining -= 1;
                    continue;
                }
            }

            if !self.has_active_iterations() {
                return Ok(Termination::Completed);
            }

            let mut timeout = self.poll_interval;
            if let Some(d) = deadline {
                timeout = cmp::min(timeout, d.saturating_duration_since(Instant::now()));
            }
            if let Some(c) = track!(pool.recv_timeout(timeout))? {
                track!(self.handle_completion(c))?;
            }
        }
    }

    fn has_active_iterations(&self) -> bool {
        self.iterations.iter().any(|i| !i.is_finished())
    }

    fn start_iteration(&mut self) -> Result<()> {
        let number = self.iterations.len();
        let bracket = self.schedule.bracket(number, self.sh_only);
        debug!(
            "Starting iteration {} with capacities {:?} and budgets {:?}",
            number, bracket.num_configs, bracket.budgets
        );
        let iteration = track!(Iteration::new(
            number,
            bracket.num_configs,
            bracket.budgets,
            Box::new(SuccessiveHalving)
        ))?;
        self.iterations.push(iteration);
        Ok(())
    }

    fn dispatch_next<T>(&mut self, pool: &mut WorkerPool<T>) -> Result<bool>
    where
        T: TargetAlgorithm + Send + 'static,
    {
        let generator = &mut *self.generator;
        for iteration in self.iterations.iter_mut().filter(|i| !i.is_finished()) {
            if let Some(job) = track!(iteration.next_run(generator))? {
                debug!("Submitting {} at budget {}", job.id, job.budget);
                self.running.insert(job.id, (Instant::now(), job.info));
                track!(pool.submit(Dispatch {
                    id: job.id,
                    config: job.config,
                    budget: job.budget,
                }))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_completion(&mut self, c: Completion) -> Result<()> {
        let finished = Instant::now();
        let (started, info) = track_assert_some!(
            self.running.remove(&c.id),
            ErrorKind::UnknownJob,
            "{}",
            c.id
        );
        let iteration = track_assert_some!(
            self.iterations.get_mut(c.id.iteration),
            ErrorKind::UnknownJob,
            "{}",
            c.id
        );
        track!(iteration.register_result(c.id, &c.result))?;
        track!(self.generator.new_result(&c.result))?;
        debug!(
            "Job {} finished with loss {} (run {})",
            c.id, c.result.loss, c.result.run_id
        );
        self.history.push(Run {
            config_id: c.id,
            info,
            result: c.result,
            started,
            finished,
        });
        Ok(())
    }
}
impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("schedule", &self.schedule)
            .field("sh_only", &self.sh_only)
            .field("iterations", &self.iterations)
            .field("runs", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::QueuePolicy;
    use crate::space::{Configuration, ALGORITHM_CHOICE};
    use crate::testing::{self, Script, ScriptedTrainer};
    use crate::worker::{EvaluationWorker, WorkerBuilder};
    use trackable::result::TestResult;

    fn worker(script: Script, counter: u64) -> Result<EvaluationWorker<ScriptedTrainer>> {
        let space = track!(testing::full_space())?;
        let mut builder = WorkerBuilder::new(2000, 2.0, Duration::from_secs(10));
        track!(track!(builder.counter(counter))?.finish(&space, ScriptedTrainer::new(script)))
    }

    fn pool(script: Script, n: usize) -> Result<WorkerPool<ScriptedTrainer>> {
        let mut pool = WorkerPool::new(QueuePolicy::default());
        for i in 0..n {
            track!(pool.register(track!(worker(script, 2 + 1000 * i as u64))?))?;
        }
        Ok(pool)
    }

    fn scheduler(sh_only: bool, portfolio: Portfolio) -> Result<Scheduler> {
        let w = track!(worker(Script::Fail, 2))?;
        let space = w.reduced_space().space().clone();
        let mut builder = SchedulerBuilder::new();
        track!(track!(track!(builder.eta(4.0))?.budgets(1.0 / 16.0, 1.0))?
            .sh_only(sh_only)
            .finish(space, portfolio))
    }

    #[test]
    fn successive_halving_bracket_completes() -> TestResult {
        let mut s = track!(scheduler(true, Portfolio::new()))?;
        let mut p = track!(pool(Script::Loss(testing::budget_loss), 1))?;
        let t = track!(s.run(1, &mut p, 1, None))?;
        assert_eq!(t, Termination::Completed);
        assert_eq!(s.history().len(), 16 + 4 + 1);
        assert_eq!(s.iterations().len(), 1);
        assert_eq!(s.iterations()[0].actual_num_configs(), &[16, 4, 1]);

        let best = track_assert_some!(s.history().incumbent(), ErrorKind::Other);
        assert_eq!(best.budget(), 1.0);

        let workers = p.shutdown();
        assert_eq!(workers[0].counter(), 2 + 21);
        Ok(())
    }

    #[test]
    fn portfolio_is_served_before_sampling() -> TestResult {
        let mut portfolio = Portfolio::new();
        for family in &["sgd", "extra_trees", "xgradient_boosting"] {
            let mut c = Configuration::new();
            c.insert(ALGORITHM_CHOICE, *family);
            portfolio.push(c);
        }
        let mut s = track!(scheduler(true, portfolio))?;
        let mut p = track!(pool(Script::Succeed(0.5), 1))?;
        track!(s.run(1, &mut p, 1, None))?;

        let first_rung = &s.history().runs()[..16];
        let members = first_rung
            .iter()
            .map(|r| r.info.portfolio_member)
            .collect::<Vec<_>>();
        assert_eq!(&members[..3], &[true, true, true]);
        assert!(members[3..].iter().all(|m| !m));
        assert_eq!(
            first_rung[0].result.config.algorithm(),
            Some("xgradient_boosting")
        );
        p.shutdown();
        Ok(())
    }

    #[test]
    fn hyperband_runs_every_bracket() -> TestResult {
        let mut s = track!(scheduler(false, Portfolio::new()))?;
        let mut p = track!(pool(Script::Succeed(0.5), 2))?;
        let t = track!(s.run(3, &mut p, 2, None))?;
        assert_eq!(t, Termination::Completed);
        assert_eq!(s.history().len(), 21 + 5 + 3);

        // A second call continues with new iterations.
        track!(s.run(1, &mut p, 1, None))?;
        assert_eq!(s.iterations().len(), 4);
        assert_eq!(s.history().len(), 29 + 21);
        p.shutdown();
        Ok(())
    }

    #[test]
    fn failures_do_not_stall_the_bracket() -> TestResult {
        let mut s = track!(scheduler(true, Portfolio::new()))?;
        let mut p = track!(pool(Script::Fail, 1))?;
        let t = track!(s.run(1, &mut p, 1, None))?;
        assert_eq!(t, Termination::Completed);
        assert_eq!(s.history().len(), 21);
        assert!(!s.history().any_finite());
        assert!(s.history().incumbent().is_none());
        p.shutdown();
        Ok(())
    }

    #[test]
    fn deadline_stops_waiting() -> TestResult {
        let mut s = track!(scheduler(true, Portfolio::new()))?;
        let mut p = track!(pool(Script::Sleep(Duration::from_millis(500)), 1))?;
        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);
        let t = track!(s.run(1, &mut p, 1, Some(deadline)))?;
        assert_eq!(t, Termination::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(s.history().is_empty());
        p.abandon();
        Ok(())
    }

    #[test]
    fn missing_workers_are_rejected() -> TestResult {
        let mut s = track!(scheduler(true, Portfolio::new()))?;
        let mut p = track!(pool(Script::Fail, 1))?;
        assert!(s.run(1, &mut p, 2, None).is_err());
        p.shutdown();
        Ok(())
    }
}
