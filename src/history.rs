//! Record of the trials a scheduler ran.
use crate::generators::ConfigInfo;
use crate::iteration::ConfigId;
use crate::worker::TrialResult;
use ordered_float::OrderedFloat;
use std::time::{Duration, Instant};

/// A finished trial.
#[derive(Debug, Clone)]
pub struct Run {
    /// Scheduler-level configuration identifier.
    pub config_id: ConfigId,

    /// How the configuration was produced.
    pub info: ConfigInfo,

    /// What the worker reported.
    pub result: TrialResult,

    /// When the job was dispatched.
    pub started: Instant,

    /// When the result was received.
    pub finished: Instant,
}
impl Run {
    /// Returns the wall-clock time between dispatch and result.
    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }

    pub fn loss(&self) -> f64 {
        self.result.loss
    }

    pub fn budget(&self) -> f64 {
        self.result.budget
    }
}

/// All runs of one scheduler, in completion order.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    runs: Vec<Run>,
}
impl RunHistory {
    /// Makes an empty `RunHistory`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a run.
    pub fn push(&mut self, run: Run) {
        self.runs.push(run);
    }

    /// Returns the runs in completion order.
    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Returns `true` if at least one run produced a finite loss.
    pub fn any_finite(&self) -> bool {
        self.runs.iter().any(|r| r.loss().is_finite())
    }

    /// Returns the sum of the wall-clock time of every run.
    pub fn time_taken(&self) -> Duration {
        self.runs.iter().map(Run::elapsed).sum()
    }

    /// Returns the largest budget any run was evaluated at.
    pub fn max_budget(&self) -> Option<f64> {
        self.runs
            .iter()
            .map(|r| OrderedFloat(r.budget()))
            .max()
            .map(|b| b.0)
    }

    /// Returns the run with the lowest finite loss among those at the largest evaluated budget.
    pub fn incumbent(&self) -> Option<&Run> {
        let budget = self.max_budget()?;
        self.runs
            .iter()
            .filter(|r| r.budget() == budget && r.loss().is_finite())
            .min_by_key(|r| OrderedFloat(r.loss()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Configuration;
    use crate::worker::RunStatus;
    use std::collections::BTreeMap;
    use std::f64::INFINITY;

    fn run(index: usize, budget: f64, loss: f64, millis: u64) -> Run {
        let started = Instant::now();
        Run {
            config_id: ConfigId {
                iteration: 0,
                index,
            },
            info: ConfigInfo::default(),
            result: TrialResult {
                run_id: index as u64 + 2,
                status: if loss.is_finite() {
                    RunStatus::Success
                } else {
                    RunStatus::Crashed
                },
                loss,
                budget,
                runtime: Duration::from_millis(millis),
                info: BTreeMap::new(),
                config: Configuration::new(),
            },
            started,
            finished: started + Duration::from_millis(millis),
        }
    }

    #[test]
    fn incumbent_is_taken_from_largest_budget() {
        let mut h = RunHistory::new();
        assert!(h.incumbent().is_none());

        h.push(run(0, 0.25, 0.01, 10));
        h.push(run(1, 1.0, 0.3, 20));
        h.push(run(2, 1.0, 0.2, 30));
        h.push(run(3, 1.0, INFINITY, 40));

        let best = h.incumbent().map(|r| r.config_id.index);
        assert_eq!(best, Some(2));
        assert_eq!(h.max_budget(), Some(1.0));
        assert_eq!(h.time_taken(), Duration::from_millis(100));
    }

    #[test]
    fn exhaustion_is_detected() {
        let mut h = RunHistory::new();
        assert!(!h.any_finite());
        h.push(run(0, 1.0, INFINITY, 1));
        assert!(!h.any_finite());
        assert!(h.incumbent().is_none());
        h.push(run(1, 0.5, 0.5, 1));
        assert!(h.any_finite());
    }
}
