//! The contract the evaluation path expects from a model implementation.
use crate::worker::{RunOutcome, RunRequest, RunStatus, TargetAlgorithm};
use crate::{ErrorKind, Result};
use std::borrow::Borrow;
use std::cmp;
use std::time::Instant;
use tracing::debug;

/// A trainable model.
///
/// Implementations must return an `ErrorKind::NotFitted` error from
/// `predict` and `predict_proba` when called before any fitting.
pub trait Estimator {
    /// Feature matrix type.
    type Features: ?Sized;

    /// Target vector type.
    type Targets: ?Sized;

    /// Fits the model to completion.
    fn fit(&mut self, x: &Self::Features, y: &Self::Targets) -> Result<()>;

    /// Returns `true` if this estimator can be trained incrementally.
    fn supports_iterative_fit(&self) -> bool {
        false
    }

    /// Performs `n_iter` additional training rounds.
    ///
    /// If `refit` is `true`, the model is reset before training.
    /// The default implementation ignores both arguments and calls `fit`.
    fn iterative_fit(
        &mut self,
        x: &Self::Features,
        y: &Self::Targets,
        n_iter: u64,
        refit: bool,
    ) -> Result<()> {
        let _ = (n_iter, refit);
        self.fit(x, y)
    }

    /// Returns `true` once further iterations would not change the model.
    fn configuration_fully_fitted(&self) -> bool;

    /// Predicts targets.
    fn predict(&self, x: &Self::Features) -> Result<Vec<f64>>;

    /// Predicts class probabilities (one row per example).
    fn predict_proba(&self, x: &Self::Features) -> Result<Vec<Vec<f64>>>;
}

/// Trains `estimator`, spending at most `max_iter` training rounds if it supports iterative fitting.
///
/// Training starts with two rounds and then doubles the number of rounds per step
/// until the estimator reports that it is fully fitted or the cap is reached.
/// Estimators without iterative fitting (or calls without a cap on a
/// non-iterative estimator) are fitted once.
///
/// Returns the number of training rounds performed (`0` if `fit` was used).
pub fn fit_with_budget<E>(
    estimator: &mut E,
    x: &E::Features,
    y: &E::Targets,
    max_iter: Option<u64>,
) -> Result<u64>
where
    E: Estimator + ?Sized,
{
    if !estimator.supports_iterative_fit() {
        track!(estimator.fit(x, y))?;
        return Ok(0);
    }
    if max_iter == Some(0) {
        track_panic!(ErrorKind::InvalidInput, "max_iter must be positive");
    }

    let cap = max_iter.unwrap_or(std::u64::MAX);
    let first = cmp::min(2, cap);
    track!(estimator.iterative_fit(x, y, first, true))?;
    let mut done = first;

    let mut iteration = 2;
    while !estimator.configuration_fully_fitted() && done < cap {
        let n_iter = cmp::min(2u64.saturating_pow(iteration) / 2, cap - done);
        track!(estimator.iterative_fit(x, y, n_iter, false))?;
        done += n_iter;
        iteration += 1;
    }
    Ok(done)
}

/// Runs an `Estimator` as a `TargetAlgorithm`.
///
/// `prepare` builds the estimator and its training data for a request (it sees
/// the configuration and the requested subsample); the estimator is then
/// trained with `fit_with_budget` capped at `max_iter`, and `loss` scores it.
#[derive(Debug)]
pub struct EstimatorTarget<P, L> {
    prepare: P,
    loss: L,
}
impl<P, L> EstimatorTarget<P, L> {
    /// Makes a new `EstimatorTarget` instance.
    pub fn new(prepare: P, loss: L) -> Self {
        Self { prepare, loss }
    }
}
impl<E, X, Y, P, L> TargetAlgorithm for EstimatorTarget<P, L>
where
    E: Estimator,
    X: Borrow<E::Features>,
    Y: Borrow<E::Targets>,
    P: FnMut(&RunRequest) -> Result<(E, X, Y)>,
    L: FnMut(&E) -> Result<f64>,
{
    fn run(&mut self, request: &RunRequest) -> RunOutcome {
        let started = Instant::now();
        let trained = track!((self.prepare)(request)).and_then(|(mut estimator, x, y)| {
            let rounds = track!(fit_with_budget(
                &mut estimator,
                x.borrow(),
                y.borrow(),
                request.instance.max_iter
            ))?;
            debug!("Run {} trained for {} rounds", request.num_run, rounds);
            Ok(estimator)
        });
        let loss = trained.and_then(|estimator| track!((self.loss)(&estimator)));

        let runtime = started.elapsed();
        match loss {
            Err(e) => RunOutcome::failure(RunStatus::Crashed, e.to_string(), runtime),
            Ok(_) if runtime > request.cutoff => {
                RunOutcome::failure(RunStatus::Timeout, "cutoff exceeded", runtime)
            }
            Ok(cost) => RunOutcome::success(cost, runtime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Configuration, ALGORITHM_CHOICE};
    use crate::testing::{self, ToyBooster};
    use crate::worker::WorkerBuilder;
    use std::time::Duration;
    use trackable::result::TestResult;

    #[test]
    fn unfitted_estimator_refuses_to_predict() {
        let model = ToyBooster::new(100);
        let e = model.predict(&[1.0]).err();
        assert_eq!(e.map(|e| e.kind().clone()), Some(ErrorKind::NotFitted));
    }

    #[test]
    fn fit_with_budget_respects_cap() -> TestResult {
        let mut model = ToyBooster::new(1000);
        let xs = [0.0, 1.0];
        let ys = [0.0, 1.0];
        let n = track!(fit_with_budget(&mut model, &xs[..], &ys[..], Some(50)))?;
        assert_eq!(n, 50);
        assert_eq!(model.rounds(), 50);
        assert!(!model.configuration_fully_fitted());
        assert_eq!(track!(model.predict(&xs[..]))?.len(), 2);
        Ok(())
    }

    #[test]
    fn fit_with_budget_stops_when_fully_fitted() -> TestResult {
        let mut model = ToyBooster::new(20);
        let xs = [0.0];
        let ys = [1.0];
        let n = track!(fit_with_budget(&mut model, &xs[..], &ys[..], None))?;
        // 2 + 2 + 4 + 8 + 16 (the last step overshoots the model's own limit)
        assert_eq!(n, 32);
        assert!(model.configuration_fully_fitted());
        Ok(())
    }

    #[test]
    fn estimator_target_trains_with_converted_budget() -> TestResult {
        let space = track!(testing::full_space())?;
        let target = EstimatorTarget::new(
            |_: &RunRequest| -> Result<(ToyBooster, Vec<f64>, Vec<f64>)> {
                Ok((ToyBooster::new(1000), vec![0.0, 1.0], vec![0.0, 1.0]))
            },
            |e: &ToyBooster| -> Result<f64> { Ok(1.0 / e.rounds() as f64) },
        );
        let mut w = track!(
            WorkerBuilder::new(2000, 2.0, Duration::from_secs(100)).finish(&space, target)
        )?;
        let mut config = Configuration::new();
        config.insert(ALGORITHM_CHOICE, "xgradient_boosting");

        // 0.25 of 512 rounds.
        let result = w.evaluate(Some(config), 0.25);
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.loss, 1.0 / 128.0);
        Ok(())
    }

    #[test]
    fn estimator_target_reports_failures() -> TestResult {
        let target = EstimatorTarget::new(
            |_: &RunRequest| -> Result<(ToyBooster, Vec<f64>, Vec<f64>)> {
                Ok((ToyBooster::new(10), Vec::new(), Vec::new()))
            },
            |_: &ToyBooster| -> Result<f64> { Ok(0.0) },
        );
        let space = track!(testing::full_space())?;
        let mut w = track!(
            WorkerBuilder::new(2000, 2.0, Duration::from_secs(100)).finish(&space, target)
        )?;
        let mut config = Configuration::new();
        config.insert(ALGORITHM_CHOICE, "sgd");
        let result = w.evaluate(Some(config), 1.0);
        assert_eq!(result.status, RunStatus::Crashed);
        assert!(result.loss.is_infinite());
        Ok(())
    }

    #[test]
    fn zero_cap_is_rejected() {
        let mut model = ToyBooster::new(20);
        assert!(fit_with_budget(&mut model, &[0.0][..], &[1.0][..], Some(0)).is_err());
    }
}
