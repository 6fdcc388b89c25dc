//! One successive-halving bracket.
use crate::generators::{ConfigGenerator, ConfigInfo};
use crate::space::Configuration;
use crate::worker::TrialResult;
use crate::{ErrorKind, Result};
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Identifier of a configuration within a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId {
    /// Index of the iteration (bracket) that sampled the configuration.
    pub iteration: usize,

    /// Index of the configuration within its iteration.
    pub index: usize,
}
impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, 0, {})", self.iteration, self.index)
    }
}

/// A (configuration, budget) pair ready to be evaluated.
#[derive(Debug, Clone)]
pub struct Job {
    /// Configuration identifier.
    pub id: ConfigId,

    /// Configuration to evaluate (in the reduced space).
    pub config: Configuration,

    /// Budget to evaluate at.
    pub budget: f64,

    /// How the configuration was produced.
    pub info: ConfigInfo,
}

/// Life cycle of a configuration inside an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be dispatched at its current budget.
    Queued,

    /// Being evaluated.
    Running,

    /// Evaluated; waiting for the rest of its rung.
    Review,

    /// Dropped (or the iteration finished).
    Terminated,
}

/// Decides which configurations of a rung move on to the next one.
pub trait AdvanceStrategy {
    /// Returns, for every loss, whether the configuration advances given
    /// that the next rung holds `capacity` configurations.
    fn advance(&self, losses: &[f64], capacity: usize) -> Vec<bool>;
}

/// Keeps the `capacity` lowest losses; ties are broken by submission order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuccessiveHalving;
impl AdvanceStrategy for SuccessiveHalving {
    fn advance(&self, losses: &[f64], capacity: usize) -> Vec<bool> {
        ranks(losses).into_iter().map(|r| r < capacity).collect()
    }
}

/// Returns the rank of every loss in ascending order (stable).
pub fn ranks(losses: &[f64]) -> Vec<usize> {
    let mut order = (0..losses.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| OrderedFloat(losses[i]));
    let mut ranks = vec![0; losses.len()];
    for (rank, i) in order.into_iter().enumerate() {
        ranks[i] = rank;
    }
    ranks
}

#[derive(Debug)]
struct Datum {
    config: Configuration,
    info: ConfigInfo,
    status: JobStatus,
    budget: f64,
    results: BTreeMap<OrderedFloat<f64>, f64>,
}

/// A successive-halving bracket: rungs of increasing budget and decreasing capacity.
pub struct Iteration {
    number: usize,
    budgets: Vec<f64>,
    num_configs: Vec<usize>,
    actual_num_configs: Vec<usize>,
    stage: usize,
    data: BTreeMap<ConfigId, Datum>,
    num_running: usize,
    is_finished: bool,
    strategy: Box<dyn AdvanceStrategy + Send>,
}
impl Iteration {
    /// Makes a new `Iteration` instance.
    ///
    /// # Errors
    ///
    /// `num_configs` and `budgets` must be non-empty and of the same length,
    /// otherwise an `ErrorKind::InvalidInput` error will be returned.
    pub fn new(
        number: usize,
        num_configs: Vec<usize>,
        budgets: Vec<f64>,
        strategy: Box<dyn AdvanceStrategy + Send>,
    ) -> Result<Self> {
        track_assert!(!budgets.is_empty(), ErrorKind::InvalidInput);
        track_assert_eq!(num_configs.len(), budgets.len(), ErrorKind::InvalidInput);
        let stages = budgets.len();
        Ok(Self {
            number,
            budgets,
            num_configs,
            actual_num_configs: vec![0; stages],
            stage: 0,
            data: BTreeMap::new(),
            num_running: 0,
            is_finished: false,
            strategy,
        })
    }

    /// Returns the iteration number.
    pub fn number(&self) -> usize {
        self.number
    }

    /// Returns the current stage index.
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Returns the budget of every rung.
    pub fn budgets(&self) -> &[f64] {
        &self.budgets
    }

    /// Returns the capacity of every rung.
    pub fn num_configs(&self) -> &[usize] {
        &self.num_configs
    }

    /// Returns the number of configurations that actually entered every rung.
    pub fn actual_num_configs(&self) -> &[usize] {
        &self.actual_num_configs
    }

    /// Returns `true` if every rung has been processed.
    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    /// Returns the number of dispatched jobs without a registered result.
    pub fn num_running(&self) -> usize {
        self.num_running
    }

    /// Returns the status of the given configuration.
    pub fn status(&self, id: ConfigId) -> Option<JobStatus> {
        self.data.get(&id).map(|d| d.status)
    }

    /// Returns the loss of `id` at every budget it was evaluated at.
    pub fn results(&self, id: ConfigId) -> Option<Vec<(f64, f64)>> {
        self.data
            .get(&id)
            .map(|d| d.results.iter().map(|(b, l)| (b.0, *l)).collect())
    }

    /// Returns the next job, sampling a new configuration from `generator` when
    /// the current rung has room left.
    ///
    /// `None` means that the iteration is finished or waits for running jobs.
    pub fn next_run(&mut self, generator: &mut dyn ConfigGenerator) -> Result<Option<Job>> {
        loop {
            if self.is_finished {
                return Ok(None);
            }

            let queued = self
                .data
                .iter_mut()
                .find(|(_, d)| d.status == JobStatus::Queued);
            if let Some((&id, datum)) = queued {
                datum.status = JobStatus::Running;
                self.num_running += 1;
                return Ok(Some(Job {
                    id,
                    config: datum.config.clone(),
                    budget: datum.budget,
                    info: datum.info.clone(),
                }));
            }

            if self.actual_num_configs[self.stage] < self.num_configs[self.stage] {
                let budget = self.budgets[self.stage];
                let (config, info) = track!(generator.get_config(budget))?;
                let id = ConfigId {
                    iteration: self.number,
                    index: self.data.len(),
                };
                self.data.insert(
                    id,
                    Datum {
                        config,
                        info,
                        status: JobStatus::Queued,
                        budget,
                        results: BTreeMap::new(),
                    },
                );
                self.actual_num_configs[self.stage] += 1;
                continue;
            }

            if self.num_running == 0 {
                self.process_results();
                continue;
            }
            return Ok(None);
        }
    }

    /// Registers the result of a running job.
    ///
    /// # Errors
    ///
    /// If `id` is not running in this iteration, an `ErrorKind::UnknownJob` error will be returned.
    pub fn register_result(&mut self, id: ConfigId, result: &TrialResult) -> Result<()> {
        let datum = track_assert_some!(self.data.get_mut(&id), ErrorKind::UnknownJob, "{}", id);
        track_assert_eq!(datum.status, JobStatus::Running, ErrorKind::UnknownJob, "{}", id);
        datum.status = JobStatus::Review;
        datum.results.insert(OrderedFloat(datum.budget), result.loss);
        self.num_running -= 1;
        Ok(())
    }

    /// Decides which configurations of the finished rung advance.
    ///
    /// Must be called with the stage already moved to the next rung. If there
    /// is nothing to advance, the capacities of every remaining rung drop to zero.
    pub fn advance_to_next_stage(&mut self, losses: &[f64]) -> Vec<bool> {
        if losses.is_empty() {
            for n in &mut self.num_configs[self.stage..] {
                *n = 0;
            }
            return Vec::new();
        }
        self.strategy.advance(losses, self.num_configs[self.stage])
    }

    fn process_results(&mut self) {
        self.stage += 1;
        let reviewed = self
            .data
            .iter()
            .filter(|(_, d)| d.status == JobStatus::Review)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        if self.stage >= self.num_configs.len() {
            self.finish_up();
            return;
        }

        let losses = reviewed
            .iter()
            .map(|id| {
                let d = &self.data[id];
                d.results
                    .get(&OrderedFloat(d.budget))
                    .cloned()
                    .unwrap_or(std::f64::INFINITY)
            })
            .collect::<Vec<_>>();
        let advance = self.advance_to_next_stage(&losses);

        let budget = self.budgets[self.stage];
        for (id, a) in reviewed.into_iter().zip(advance) {
            let datum = self.data.get_mut(&id).unwrap_or_else(|| unreachable!());
            if a {
                datum.status = JobStatus::Queued;
                datum.budget = budget;
                self.actual_num_configs[self.stage] += 1;
            } else {
                datum.status = JobStatus::Terminated;
            }
        }
        debug!(
            "Iteration {} advanced to stage {} with {} configurations",
            self.number, self.stage, self.actual_num_configs[self.stage]
        );
    }

    fn finish_up(&mut self) {
        self.is_finished = true;
        for d in self.data.values_mut() {
            d.status = JobStatus::Terminated;
        }
    }
}
impl fmt::Debug for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Iteration")
            .field("number", &self.number)
            .field("budgets", &self.budgets)
            .field("num_configs", &self.num_configs)
            .field("actual_num_configs", &self.actual_num_configs)
            .field("stage", &self.stage)
            .field("num_running", &self.num_running)
            .field("is_finished", &self.is_finished)
            .finish()
    }
}
