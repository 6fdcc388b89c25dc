//! Conversion of abstract budgets into algorithm-native training effort.
//!
//! A budget is a unitless fraction of the maximum training effort. Each model
//! family turns it into either a number of incremental training rounds
//! ("iterations" mode) or a number of training examples ("subsets" mode).
use crate::{ErrorKind, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a budget is turned into training effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BudgetMode {
    /// The budget scales the number of training rounds.
    Iterations,

    /// The budget scales the number of training examples.
    Subsets,
}
impl FromStr for BudgetMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iterations" => Ok(BudgetMode::Iterations),
            "subsets" => Ok(BudgetMode::Subsets),
            _ => track_panic!(
                ErrorKind::InvalidInput,
                "mode has to be either 'subsets' or 'iterations', but got {}",
                s
            ),
        }
    }
}
impl fmt::Display for BudgetMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BudgetMode::Iterations => write!(f, "iterations"),
            BudgetMode::Subsets => write!(f, "subsets"),
        }
    }
}

/// Training effort derived from a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Effort {
    /// Number of incremental training rounds.
    Iterations(u64),

    /// Number of training examples.
    Subsample(u64),
}

/// Per-family conversion policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetPolicy {
    /// Default mode of the family.
    pub mode: BudgetMode,

    /// Number of training rounds per unit of budget (iterations mode).
    pub multiplier: f64,

    /// Whether iterations-mode losses of this family must be disqualified.
    ///
    /// Set for families that are retrained from scratch to a fixed tolerance,
    /// where a larger budget does not change the model.
    pub budget_insensitive: bool,
}
impl BudgetPolicy {
    fn iterative(multiplier: f64) -> Self {
        Self {
            mode: BudgetMode::Iterations,
            multiplier,
            budget_insensitive: false,
        }
    }
}

/// Policy table mapping model families to their budget conversion.
#[derive(Debug, Clone)]
pub struct BudgetConverter {
    policies: BTreeMap<String, BudgetPolicy>,
    mode: Option<BudgetMode>,
}
impl BudgetConverter {
    /// Makes a converter with the standard multipliers.
    ///
    /// `mode` overrides the per-family default mode when it is `Some`.
    pub fn standard(mode: Option<BudgetMode>) -> Self {
        Self::with_multipliers(mode, 128.0, 512.0, 512.0, 1024.0)
    }

    /// Makes a converter with the reduced multipliers used by the fallback search.
    pub fn backup(mode: Option<BudgetMode>) -> Self {
        Self::with_multipliers(mode, 32.0, 32.0, 32.0, 32.0)
    }

    fn with_multipliers(
        mode: Option<BudgetMode>,
        random_forest: f64,
        sgd: f64,
        xgradient_boosting: f64,
        extra_trees: f64,
    ) -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(
            "libsvm_svc".to_owned(),
            BudgetPolicy {
                mode: BudgetMode::Subsets,
                multiplier: 1.0,
                budget_insensitive: true,
            },
        );
        policies.insert(
            "random_forest".to_owned(),
            BudgetPolicy::iterative(random_forest),
        );
        policies.insert("sgd".to_owned(), BudgetPolicy::iterative(sgd));
        policies.insert(
            "xgradient_boosting".to_owned(),
            BudgetPolicy::iterative(xgradient_boosting),
        );
        policies.insert(
            "extra_trees".to_owned(),
            BudgetPolicy::iterative(extra_trees),
        );
        Self { policies, mode }
    }

    /// Adds (or replaces) the policy of a model family.
    pub fn insert_policy<S: Into<String>>(&mut self, family: S, policy: BudgetPolicy) {
        self.policies.insert(family.into(), policy);
    }

    /// Returns the policy of the given family.
    pub fn policy(&self, family: &str) -> Result<&BudgetPolicy> {
        let policy = track_assert_some!(
            self.policies.get(family),
            ErrorKind::InvalidInput,
            "no budget policy for {}",
            family
        );
        Ok(policy)
    }

    /// Returns the effective mode of the given family.
    pub fn mode(&self, family: &str) -> Result<BudgetMode> {
        let policy = track!(self.policy(family))?;
        Ok(self.mode.unwrap_or(policy.mode))
    }

    /// Converts `budget` into training effort for `family`.
    ///
    /// `n_data_points` is the number of training examples available after any
    /// down-sampling; it is only used in subsets mode.
    ///
    /// # Errors
    ///
    /// If `budget` is not a positive finite number or `family` is unknown,
    /// an `ErrorKind::InvalidInput` error will be returned.
    pub fn convert(&self, family: &str, budget: f64, n_data_points: u64) -> Result<Effort> {
        track_assert!(
            budget.is_finite() && budget > 0.0,
            ErrorKind::InvalidInput;
            family,
            budget
        );
        let policy = track!(self.policy(family))?;
        match self.mode.unwrap_or(policy.mode) {
            BudgetMode::Iterations => {
                let n = (budget * policy.multiplier).floor() as u64;
                Ok(Effort::Iterations(n))
            }
            BudgetMode::Subsets => {
                let n = (budget * n_data_points as f64).floor() as u64;
                Ok(Effort::Subsample(n))
            }
        }
    }

    /// Returns `true` if a loss of `family` measured in `mode` must be replaced by `+inf`.
    pub fn is_penalized(&self, family: &str, mode: BudgetMode) -> bool {
        mode == BudgetMode::Iterations
            && self
                .policies
                .get(family)
                .map_or(false, |p| p.budget_insensitive)
    }
}

/// Returns the sum of the budgets consumed by one successive-halving bracket
/// running from `min_budget` to `max_budget` with reduction factor `eta`.
///
/// If the bracket has a single rung, `max_budget` is returned.
pub fn total_budget(min_budget: f64, max_budget: f64, eta: f64) -> f64 {
    let mut total = 0.0;
    let mut n_algos = max_budget / min_budget;
    let mut budget = min_budget;
    while n_algos > 1.0 {
        total += budget * n_algos;
        budget *= eta;
        n_algos /= eta;
    }
    if total == 0.0 {
        max_budget
    } else {
        total
    }
}
