//! Configuration generators.
use crate::kde::{Kde, VarKind};
use crate::space::{Configuration, ConfigurationSpace, Domain, Hyperparameter};
use crate::worker::TrialResult;
use crate::{ErrorKind, Result};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp;
use std::collections::BTreeMap;
use std::f64;
use tracing::debug;

/// Additional information about how a configuration was produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigInfo {
    /// Whether the configuration came from a portfolio.
    pub portfolio_member: bool,

    /// Whether the configuration was chosen by a density model (rather than sampled at random).
    pub model_based_pick: bool,
}

/// Source of configurations for the scheduler.
pub trait ConfigGenerator {
    /// Returns a new configuration to be evaluated at `budget`.
    fn get_config(&mut self, budget: f64) -> Result<(Configuration, ConfigInfo)>;

    /// Informs the generator about a finished trial.
    fn new_result(&mut self, result: &TrialResult) -> Result<()> {
        let _ = result;
        Ok(())
    }
}
impl<T: ConfigGenerator + ?Sized> ConfigGenerator for Box<T> {
    fn get_config(&mut self, budget: f64) -> Result<(Configuration, ConfigInfo)> {
        (**self).get_config(budget)
    }

    fn new_result(&mut self, result: &TrialResult) -> Result<()> {
        (**self).new_result(result)
    }
}

/// Samples configurations uniformly at random.
#[derive(Debug)]
pub struct RandomSampling {
    space: ConfigurationSpace,
    rng: StdRng,
}
impl RandomSampling {
    /// Makes a new `RandomSampling` instance.
    pub fn new(space: ConfigurationSpace, seed: u64) -> Self {
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}
impl ConfigGenerator for RandomSampling {
    fn get_config(&mut self, _budget: f64) -> Result<(Configuration, ConfigInfo)> {
        let config = self.space.sample_configuration(&mut self.rng);
        Ok((config, ConfigInfo::default()))
    }
}

/// Options of `BohbGenerator`.
#[derive(Debug, Clone)]
pub struct BohbOptions {
    /// Percentage of observations considered good.
    pub top_n_percent: usize,

    /// Number of candidates drawn from the good density per request.
    pub num_samples: usize,

    /// Fraction of configurations sampled at random regardless of the model.
    pub random_fraction: f64,

    /// Widening factor applied to bandwidths when drawing candidates.
    pub bandwidth_factor: f64,

    /// Lower bound of every bandwidth.
    pub min_bandwidth: f64,

    /// Minimum number of observations a model is built from (`None` means dimensionality + 1).
    pub min_points_in_model: Option<usize>,
}
impl Default for BohbOptions {
    fn default() -> Self {
        Self {
            top_n_percent: 15,
            num_samples: 64,
            random_fraction: 0.5,
            bandwidth_factor: 3.0,
            min_bandwidth: 1e-3,
            min_points_in_model: None,
        }
    }
}

/// Model-based sampler that fits good/bad densities per budget and
/// picks the candidate maximizing their ratio.
#[derive(Debug)]
pub struct BohbGenerator {
    space: ConfigurationSpace,
    kinds: Vec<VarKind>,
    options: BohbOptions,
    min_points_in_model: usize,
    observations: BTreeMap<OrderedFloat<f64>, Vec<(Vec<f64>, f64)>>,
    rng: StdRng,
}
impl BohbGenerator {
    /// Makes a new `BohbGenerator` instance.
    ///
    /// # Errors
    ///
    /// Out of range options result in an `ErrorKind::InvalidInput` error.
    pub fn new(space: ConfigurationSpace, options: BohbOptions, seed: u64) -> Result<Self> {
        track_assert!(
            0 < options.top_n_percent && options.top_n_percent < 100,
            ErrorKind::InvalidInput;
            options.top_n_percent
        );
        track_assert!(
            0.0 <= options.random_fraction && options.random_fraction <= 1.0,
            ErrorKind::InvalidInput;
            options.random_fraction
        );
        track_assert!(options.num_samples > 0, ErrorKind::InvalidInput);
        track_assert!(options.min_bandwidth > 0.0, ErrorKind::InvalidInput; options.min_bandwidth);

        let kinds = space
            .hyperparameters()
            .iter()
            .map(|hp| match hp.cardinality() {
                Some(c) => VarKind::Categorical(c),
                None => VarKind::Continuous,
            })
            .collect::<Vec<_>>();
        let min_points_in_model = cmp::max(
            options.min_points_in_model.unwrap_or(kinds.len() + 1),
            kinds.len() + 1,
        );
        Ok(Self {
            space,
            kinds,
            options,
            min_points_in_model,
            observations: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Returns the number of observations recorded for `budget`.
    pub fn observations(&self, budget: f64) -> usize {
        self.observations
            .get(&OrderedFloat(budget))
            .map_or(0, |o| o.len())
    }

    fn encode(&self, config: &Configuration) -> Vec<f64> {
        self.space
            .hyperparameters()
            .iter()
            .map(|hp| {
                config
                    .get(hp.name())
                    .and_then(|v| hp.encode(v).ok())
                    .unwrap_or_else(|| default_encoding(hp))
            })
            .collect()
    }

    fn decode(&self, x: &[f64]) -> Result<Configuration> {
        let config = self
            .space
            .hyperparameters()
            .iter()
            .zip(x)
            .map(|(hp, &v)| (hp.name().to_owned(), hp.decode(v)))
            .collect::<Configuration>();
        track!(self.space.deactivate_inactive_hyperparameters(&config))
    }

    // The largest budget with enough observations wins.
    fn fit_models(&self) -> Result<Option<(Kde, Kde)>> {
        let entry = self
            .observations
            .iter()
            .rev()
            .find(|(_, o)| o.len() >= self.min_points_in_model + 2);
        let observations = match entry {
            None => return Ok(None),
            Some((_, o)) => o,
        };

        let mut sorted = observations.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|(_, loss)| OrderedFloat(*loss));

        let n = sorted.len();
        let n_good = cmp::max(
            self.min_points_in_model,
            self.options.top_n_percent * n / 100,
        );
        let n_bad = cmp::max(
            self.min_points_in_model,
            (100 - self.options.top_n_percent) * n / 100,
        );
        let good = sorted
            .iter()
            .take(n_good)
            .map(|(x, _)| x.clone())
            .collect::<Vec<_>>();
        let bad = sorted
            .iter()
            .skip(n_good)
            .take(n_bad)
            .map(|(x, _)| x.clone())
            .collect::<Vec<_>>();
        if good.is_empty() || bad.is_empty() {
            return Ok(None);
        }

        let l = track!(Kde::fit(good, &self.kinds, self.options.min_bandwidth))?;
        let g = track!(Kde::fit(bad, &self.kinds, self.options.min_bandwidth))?;
        Ok(Some((l, g)))
    }
}
impl ConfigGenerator for BohbGenerator {
    fn get_config(&mut self, _budget: f64) -> Result<(Configuration, ConfigInfo)> {
        if self.kinds.is_empty() || self.rng.gen::<f64>() < self.options.random_fraction {
            let config = self.space.sample_configuration(&mut self.rng);
            return Ok((config, ConfigInfo::default()));
        }

        let (l, g) = match track!(self.fit_models())? {
            None => {
                let config = self.space.sample_configuration(&mut self.rng);
                return Ok((config, ConfigInfo::default()));
            }
            Some(models) => models,
        };

        let mut best = None;
        let mut best_score = f64::NEG_INFINITY;
        for _ in 0..self.options.num_samples {
            let x = l.sample(&mut self.rng, self.options.bandwidth_factor);
            let score = l.pdf(&x) / g.pdf(&x).max(1e-32);
            if score.is_finite() && score > best_score {
                best_score = score;
                best = Some(x);
            }
        }

        let config = if let Some(x) = best {
            track!(self.decode(&x))?
        } else {
            debug!("Sampling by optimization failed; falling back to random sampling");
            let config = self.space.sample_configuration(&mut self.rng);
            return Ok((config, ConfigInfo::default()));
        };
        Ok((
            config,
            ConfigInfo {
                portfolio_member: false,
                model_based_pick: true,
            },
        ))
    }

    fn new_result(&mut self, result: &TrialResult) -> Result<()> {
        // Rejected trials carry no configuration to learn from.
        if result.config.is_empty() {
            return Ok(());
        }
        let x = self.encode(&result.config);
        // Failed trials still inform the bad density.
        let loss = if result.loss.is_nan() {
            f64::INFINITY
        } else {
            result.loss
        };
        self.observations
            .entry(OrderedFloat(result.budget))
            .or_insert_with(Vec::new)
            .push((x, loss));
        Ok(())
    }
}

fn default_encoding(hp: &Hyperparameter) -> f64 {
    match hp.domain() {
        Domain::Constant(_) => 0.0,
        _ => hp.encode(&hp.default_value()).unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Hyperparameter, Value};
    use crate::worker::RunStatus;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;
    use trackable::result::TestResult;

    fn space() -> Result<ConfigurationSpace> {
        let mut cs = ConfigurationSpace::new();
        track!(cs.add_hyperparameter(track!(Hyperparameter::uniform_float("x", 0.0, 1.0))?))?;
        track!(cs.add_hyperparameter(track!(Hyperparameter::categorical(
            "c",
            vec!["a".into(), "b".into()]
        ))?))?;
        Ok(cs)
    }

    fn result(x: f64, c: &str, loss: f64, budget: f64) -> TrialResult {
        let mut config = Configuration::new();
        config.insert("x", x);
        config.insert("c", c);
        TrialResult {
            run_id: 0,
            status: RunStatus::Success,
            loss,
            budget,
            runtime: Duration::from_secs(0),
            info: Map::new(),
            config,
        }
    }

    #[test]
    fn random_sampling_works() -> TestResult {
        let cs = track!(space())?;
        let mut g = RandomSampling::new(cs.clone(), 0);
        for _ in 0..10 {
            let (config, info) = track!(g.get_config(1.0))?;
            track!(cs.check_configuration(&config))?;
            assert_eq!(info, ConfigInfo::default());
        }
        Ok(())
    }

    #[test]
    fn bohb_falls_back_to_random_without_data() -> TestResult {
        let cs = track!(space())?;
        let options = BohbOptions {
            random_fraction: 0.0,
            ..BohbOptions::default()
        };
        let mut g = track!(BohbGenerator::new(cs.clone(), options, 0))?;
        let (config, info) = track!(g.get_config(1.0))?;
        track!(cs.check_configuration(&config))?;
        assert!(!info.model_based_pick);
        Ok(())
    }

    #[test]
    fn bohb_proposes_near_good_observations() -> TestResult {
        let cs = track!(space())?;
        let options = BohbOptions {
            random_fraction: 0.0,
            top_n_percent: 30,
            ..BohbOptions::default()
        };
        let mut g = track!(BohbGenerator::new(cs.clone(), options, 0))?;
        for i in 0..20 {
            let x = i as f64 / 20.0;
            let c = if i % 2 == 0 { "a" } else { "b" };
            // Small x is good.
            track!(g.new_result(&result(x, c, x, 1.0)))?;
        }
        assert_eq!(g.observations(1.0), 20);

        let mut below = 0;
        for _ in 0..20 {
            let (config, info) = track!(g.get_config(1.0))?;
            track!(cs.check_configuration(&config))?;
            assert!(info.model_based_pick);
            if config.get("x").and_then(Value::as_f64).map_or(false, |x| x < 0.5) {
                below += 1;
            }
        }
        assert!(below >= 15, "below={}", below);
        Ok(())
    }

    #[test]
    fn bohb_ignores_results_without_configuration() -> TestResult {
        let cs = track!(space())?;
        let mut g = track!(BohbGenerator::new(cs, BohbOptions::default(), 0))?;

        let mut crashed = result(0.0, "a", f64::INFINITY, 1.0);
        crashed.status = RunStatus::Crashed;
        crashed.config = Configuration::new();
        track!(g.new_result(&crashed))?;
        assert_eq!(g.observations(1.0), 0);

        crashed.config = result(0.5, "b", 0.0, 1.0).config;
        track!(g.new_result(&crashed))?;
        assert_eq!(g.observations(1.0), 1);
        Ok(())
    }

    #[test]
    fn invalid_options_are_rejected() -> TestResult {
        let cs = track!(space())?;
        let options = BohbOptions {
            random_fraction: 1.5,
            ..BohbOptions::default()
        };
        assert!(BohbGenerator::new(cs, options, 0).is_err());
        Ok(())
    }
}
