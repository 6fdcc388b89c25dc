//! Fixtures shared by the unit tests.
use crate::estimator::Estimator;
use crate::space::{Condition, ConfigurationSpace, Hyperparameter, Value, ALGORITHM_CHOICE};
use crate::worker::{RunOutcome, RunRequest, RunStatus, TargetAlgorithm};
use crate::{ErrorKind, Result};
use factory::Factory;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How a `ScriptedTrainer` answers configured trials.
///
/// Dummy-baseline requests (without a configuration) always succeed with cost `1.0`.
#[derive(Clone, Copy)]
pub enum Script {
    Succeed(f64),
    Fail,
    Loss(fn(&RunRequest) -> f64),
    Panic,
    Sleep(Duration),
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Script::Succeed(cost) => write!(f, "Succeed({})", cost),
            Script::Fail => write!(f, "Fail"),
            Script::Loss(_) => write!(f, "Loss(_)"),
            Script::Panic => write!(f, "Panic"),
            Script::Sleep(d) => write!(f, "Sleep({:?})", d),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedTrainer {
    script: Script,
    log: Arc<Mutex<Vec<RunRequest>>>,
}
impl ScriptedTrainer {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: Arc::default(),
        }
    }

    /// Returns the configured (non-dummy) requests seen so far.
    pub fn requests(&self) -> Vec<RunRequest> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}
impl TargetAlgorithm for ScriptedTrainer {
    fn run(&mut self, request: &RunRequest) -> RunOutcome {
        let runtime = Duration::from_millis(1);
        if request.config.is_none() {
            return RunOutcome::success(1.0, runtime);
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(request.clone());
        }
        match self.script {
            Script::Succeed(cost) => RunOutcome::success(cost, runtime),
            Script::Fail => RunOutcome::failure(RunStatus::Crashed, "scripted failure", runtime),
            Script::Loss(f) => RunOutcome::success(f(request), runtime),
            Script::Panic => panic!("scripted panic"),
            Script::Sleep(d) => {
                thread::sleep(d);
                RunOutcome::success(0.5, d)
            }
        }
    }
}

/// Creates `ScriptedTrainer`s sharing one request log.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    script: Script,
    log: Arc<Mutex<Vec<RunRequest>>>,
}
impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}
impl Factory for ScriptedFactory {
    type Item = ScriptedTrainer;

    fn create(&self) -> Self::Item {
        ScriptedTrainer {
            script: self.script,
            log: Arc::clone(&self.log),
        }
    }
}

/// Loss that only depends on the budget: larger budgets are better.
pub fn budget_loss(request: &RunRequest) -> f64 {
    let effort = request
        .instance
        .max_iter
        .or(request.instance.subsample)
        .unwrap_or(1) as f64;
    1.0 / (1.0 + effort)
}

/// A boosting-like model that converges after `limit` rounds.
#[derive(Debug)]
pub struct ToyBooster {
    limit: u64,
    rounds: u64,
    fitted: bool,
    mean: f64,
}
impl ToyBooster {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            rounds: 0,
            fitted: false,
            mean: 0.0,
        }
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}
impl Estimator for ToyBooster {
    type Features = [f64];
    type Targets = [f64];

    fn fit(&mut self, x: &[f64], y: &[f64]) -> Result<()> {
        self.iterative_fit(x, y, self.limit, true)
    }

    fn supports_iterative_fit(&self) -> bool {
        true
    }

    fn iterative_fit(&mut self, _x: &[f64], y: &[f64], n_iter: u64, refit: bool) -> Result<()> {
        track_assert!(!y.is_empty(), ErrorKind::InvalidInput);
        if refit {
            self.rounds = 0;
        }
        self.rounds += n_iter;
        self.mean = y.iter().sum::<f64>() / y.len() as f64;
        self.fitted = true;
        Ok(())
    }

    fn configuration_fully_fitted(&self) -> bool {
        self.rounds >= self.limit
    }

    fn predict(&self, x: &[f64]) -> Result<Vec<f64>> {
        track_assert!(self.fitted, ErrorKind::NotFitted);
        Ok(vec![self.mean; x.len()])
    }

    fn predict_proba(&self, x: &[f64]) -> Result<Vec<Vec<f64>>> {
        track_assert!(self.fitted, ErrorKind::NotFitted);
        let p = self.mean.max(0.0).min(1.0);
        Ok(vec![vec![1.0 - p, p]; x.len()])
    }
}

fn categorical(name: &str, choices: &[&str]) -> Result<Hyperparameter> {
    track!(Hyperparameter::categorical(
        name,
        choices.iter().map(|&c| Value::from(c)).collect()
    ))
}

fn add_family_children(
    cs: &mut ConfigurationSpace,
    family: &str,
    children: Vec<Hyperparameter>,
) -> Result<()> {
    for hp in children {
        let name = hp.name().to_owned();
        track!(cs.add_hyperparameter(hp))?;
        track!(cs.add_condition(Condition::equals(name, ALGORITHM_CHOICE, family)))?;
    }
    Ok(())
}

fn add_preprocessing(cs: &mut ConfigurationSpace) -> Result<()> {
    track!(cs.add_hyperparameter(track!(categorical(
        "balancing:strategy",
        &["none", "weighting"]
    ))?))?;
    track!(cs.add_hyperparameter(track!(categorical(
        "categorical_encoding:__choice__",
        &["no_encoding", "one_hot_encoding"]
    ))?))?;
    track!(cs.add_hyperparameter(track!(categorical(
        "imputation:strategy",
        &["mean", "median", "most_frequent"]
    ))?))?;
    track!(cs.add_hyperparameter(track!(categorical(
        "preprocessor:__choice__",
        &["no_preprocessing", "pca"]
    ))?))?;
    track!(cs.add_hyperparameter(track!(categorical(
        "rescaling:__choice__",
        &["none", "quantile_transformer", "standardize"]
    ))?))?;
    track!(cs.add_hyperparameter(track!(Hyperparameter::uniform_int(
        "rescaling:quantile_transformer:n_quantiles",
        10,
        5000
    ))?))?;
    track!(cs.add_condition(Condition::equals(
        "rescaling:quantile_transformer:n_quantiles",
        "rescaling:__choice__",
        "quantile_transformer"
    )))?;
    Ok(())
}

fn extra_trees_children() -> Result<Vec<Hyperparameter>> {
    Ok(vec![
        track!(categorical("classifier:extra_trees:bootstrap", &["True"]))?,
        track!(categorical(
            "classifier:extra_trees:criterion",
            &["gini", "entropy"]
        ))?,
        track!(Hyperparameter::uniform_float(
            "classifier:extra_trees:max_features",
            0.0,
            1.0
        ))?,
        track!(Hyperparameter::uniform_int(
            "classifier:extra_trees:min_samples_leaf",
            1,
            20
        ))?,
        track!(Hyperparameter::uniform_int(
            "classifier:extra_trees:min_samples_split",
            2,
            20
        ))?,
    ])
}

/// A small version of the classification pipeline space with all five families.
pub fn full_space() -> Result<ConfigurationSpace> {
    let mut cs = ConfigurationSpace::new();
    track!(cs.add_hyperparameter(track!(categorical(
        ALGORITHM_CHOICE,
        &[
            "extra_trees",
            "libsvm_svc",
            "random_forest",
            "sgd",
            "xgradient_boosting"
        ]
    ))?))?;
    track!(add_preprocessing(&mut cs))?;
    track!(add_family_children(
        &mut cs,
        "extra_trees",
        track!(extra_trees_children())?
    ))?;
    track!(add_family_children(
        &mut cs,
        "libsvm_svc",
        vec![
            track!(track!(Hyperparameter::uniform_float(
                "classifier:libsvm_svc:C",
                0.03125,
                32768.0
            ))?
            .log_scale())?,
            track!(categorical("classifier:libsvm_svc:kernel", &["rbf", "poly"]))?,
        ]
    ))?;
    track!(add_family_children(
        &mut cs,
        "random_forest",
        vec![track!(Hyperparameter::uniform_float(
            "classifier:random_forest:max_features",
            0.0,
            1.0
        ))?]
    ))?;
    track!(add_family_children(
        &mut cs,
        "sgd",
        vec![
            track!(track!(Hyperparameter::uniform_float(
                "classifier:sgd:alpha",
                1e-7,
                1e-1
            ))?
            .log_scale())?,
            Hyperparameter::constant("classifier:sgd:average", "False"),
        ]
    ))?;
    track!(add_family_children(
        &mut cs,
        "xgradient_boosting",
        vec![track!(track!(Hyperparameter::uniform_float(
            "classifier:xgradient_boosting:learning_rate",
            0.001,
            1.0
        ))?
        .log_scale())?]
    ))?;
    Ok(cs)
}

/// The same pipeline space restricted to extra trees.
pub fn extra_trees_space() -> Result<ConfigurationSpace> {
    let mut cs = ConfigurationSpace::new();
    track!(cs.add_hyperparameter(track!(categorical(ALGORITHM_CHOICE, &["extra_trees"]))?))?;
    track!(add_preprocessing(&mut cs))?;
    track!(add_family_children(
        &mut cs,
        "extra_trees",
        track!(extra_trees_children())?
    ))?;
    Ok(cs)
}
