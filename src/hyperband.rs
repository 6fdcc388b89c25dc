//! Rung geometry of Hyperband brackets.
use crate::{ErrorKind, Result};
use std::cmp;

const EPSILON: f64 = 1e-9;

/// A single bracket: per-rung capacities and budgets.
#[derive(Debug, Clone, PartialEq)]
pub struct Bracket {
    /// Number of configurations kept alive at each rung.
    pub num_configs: Vec<usize>,

    /// Budget of each rung.
    pub budgets: Vec<f64>,
}

/// Geometric rung budgets from `min_budget` to `max_budget` with ratio `eta`.
#[derive(Debug, Clone)]
pub struct BracketSchedule {
    eta: f64,
    min_budget: f64,
    max_budget: f64,
    max_rungs: usize,
    budgets: Vec<f64>,
}
impl BracketSchedule {
    /// Makes a new `BracketSchedule` instance.
    ///
    /// # Errors
    ///
    /// If `eta <= 1` or the budgets do not satisfy `0 < min_budget <= max_budget`,
    /// an `ErrorKind::InvalidInput` error will be returned.
    pub fn new(eta: f64, min_budget: f64, max_budget: f64) -> Result<Self> {
        track_assert!(eta.is_finite() && eta > 1.0, ErrorKind::InvalidInput; eta);
        track_assert!(
            min_budget > 0.0 && max_budget.is_finite() && min_budget <= max_budget,
            ErrorKind::InvalidInput;
            min_budget,
            max_budget
        );

        // Rounded up, so the smallest rung may fall below `min_budget` when the
        // budget ratio is not a power of `eta`.
        let rungs = -(min_budget / max_budget).ln() / eta.ln();
        let max_rungs = (rungs - EPSILON).ceil().max(0.0) as usize + 1;
        let budgets = (0..max_rungs)
            .map(|i| max_budget * eta.powi(-((max_rungs - 1 - i) as i32)))
            .collect();
        Ok(Self {
            eta,
            min_budget,
            max_budget,
            max_rungs,
            budgets,
        })
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn min_budget(&self) -> f64 {
        self.min_budget
    }

    pub fn max_budget(&self) -> f64 {
        self.max_budget
    }

    /// Returns the number of rungs of the largest bracket.
    pub fn max_rungs(&self) -> usize {
        self.max_rungs
    }

    /// Returns the budgets of the largest bracket in ascending order.
    pub fn budgets(&self) -> &[f64] {
        &self.budgets
    }

    /// Returns the bracket of the given iteration.
    ///
    /// In successive-halving-only mode every iteration uses the largest bracket;
    /// otherwise the number of rungs cycles downwards with the iteration number.
    pub fn bracket(&self, iteration: usize, sh_only: bool) -> Bracket {
        let r = self.max_rungs;
        let s = if sh_only {
            r - 1
        } else {
            r - 1 - (iteration % r)
        };

        let n0 = (r / (s + 1)) as f64 * self.eta.powi(s as i32);
        let num_configs = (0..=s)
            .map(|i| {
                let n = (n0 * self.eta.powi(-(i as i32)) + EPSILON).floor() as usize;
                cmp::max(n, 1)
            })
            .collect();
        let budgets = self.budgets[r - 1 - s..].to_vec();
        Bracket {
            num_configs,
            budgets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackable::result::TestResult;

    #[test]
    fn default_schedule_works() -> TestResult {
        let schedule = track!(BracketSchedule::new(4.0, 1.0 / 16.0, 1.0))?;
        assert_eq!(schedule.max_rungs(), 3);
        assert_eq!(schedule.budgets(), &[0.0625, 0.25, 1.0]);

        let b = schedule.bracket(0, true);
        assert_eq!(b.num_configs, vec![16, 4, 1]);
        assert_eq!(b.budgets, vec![0.0625, 0.25, 1.0]);
        assert_eq!(schedule.bracket(7, true), b);
        Ok(())
    }

    #[test]
    fn hyperband_cycles_brackets() -> TestResult {
        let schedule = track!(BracketSchedule::new(4.0, 1.0 / 16.0, 1.0))?;
        assert_eq!(schedule.bracket(0, false).num_configs, vec![16, 4, 1]);

        let b = schedule.bracket(1, false);
        assert_eq!(b.num_configs, vec![4, 1]);
        assert_eq!(b.budgets, vec![0.25, 1.0]);

        let b = schedule.bracket(2, false);
        assert_eq!(b.num_configs, vec![3]);
        assert_eq!(b.budgets, vec![1.0]);

        assert_eq!(schedule.bracket(3, false), schedule.bracket(0, false));
        Ok(())
    }

    #[test]
    fn equal_budgets_yield_single_rung() -> TestResult {
        let schedule = track!(BracketSchedule::new(4.0, 1.0, 1.0))?;
        assert_eq!(schedule.max_rungs(), 1);
        let b = schedule.bracket(0, true);
        assert_eq!(b.num_configs, vec![1]);
        assert_eq!(b.budgets, vec![1.0]);
        Ok(())
    }

    #[test]
    fn rung_count_rounds_up() -> TestResult {
        let schedule = track!(BracketSchedule::new(3.0, 0.01, 1.0))?;
        assert_eq!(schedule.max_rungs(), 6);

        let budgets = schedule.budgets();
        assert!((budgets[0] - 3f64.powi(-5)).abs() < 1e-12);
        assert!(budgets[0] < schedule.min_budget());
        assert!(budgets[1] > schedule.min_budget());
        Ok(())
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(BracketSchedule::new(1.0, 0.1, 1.0).is_err());
        assert!(BracketSchedule::new(3.0, 0.0, 1.0).is_err());
        assert!(BracketSchedule::new(3.0, 2.0, 1.0).is_err());
    }
}
