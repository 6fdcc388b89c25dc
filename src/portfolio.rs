//! Portfolio seeding of configuration generators.
use crate::generators::{ConfigGenerator, ConfigInfo};
use crate::reduction::ReducedSpace;
use crate::space::{Configuration, ConfigurationSpace};
use crate::worker::TrialResult;
use crate::Result;
use rand::Rng;
use tracing::info;

/// Number of random members of a portfolio built without explicit entries.
pub const DEFAULT_PORTFOLIO_SIZE: usize = 5;

/// Stack of configurations to try before any sampling takes place.
///
/// The most recently pushed entry is served first.
#[derive(Debug, Clone, Default)]
pub struct Portfolio {
    entries: Vec<Configuration>,
}
impl Portfolio {
    /// Makes an empty `Portfolio`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a portfolio of `DEFAULT_PORTFOLIO_SIZE` random samples of `space`.
    pub fn random<R: Rng + ?Sized>(space: &ConfigurationSpace, rng: &mut R) -> Self {
        (0..DEFAULT_PORTFOLIO_SIZE)
            .map(|_| space.sample_configuration(rng))
            .collect()
    }

    /// Pushes an entry on top of the stack.
    pub fn push(&mut self, config: Configuration) {
        self.entries.push(config);
    }

    /// Removes and returns the top entry.
    pub fn pop(&mut self) -> Option<Configuration> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the constants of `reduced` from every entry.
    pub fn strip_constants(&mut self, reduced: &ReducedSpace) {
        for entry in &mut self.entries {
            *entry = reduced.strip_constants(entry);
        }
    }
}
impl std::iter::FromIterator<Configuration> for Portfolio {
    fn from_iter<I: IntoIterator<Item = Configuration>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Serves the entries of a `Portfolio` and then delegates to the wrapped generator.
///
/// Once the portfolio is exhausted, every later request goes to the wrapped generator.
#[derive(Debug)]
pub struct PortfolioConfigGenerator<G> {
    portfolio: Portfolio,
    inner: G,
}
impl<G: ConfigGenerator> PortfolioConfigGenerator<G> {
    /// Makes a new `PortfolioConfigGenerator` instance.
    pub fn new(portfolio: Portfolio, inner: G) -> Self {
        info!("Using portfolio of length {}", portfolio.len());
        Self { portfolio, inner }
    }

    /// Returns the number of portfolio entries not yet served.
    pub fn remaining(&self) -> usize {
        self.portfolio.len()
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}
impl<G: ConfigGenerator> ConfigGenerator for PortfolioConfigGenerator<G> {
    fn get_config(&mut self, budget: f64) -> Result<(Configuration, ConfigInfo)> {
        if let Some(config) = self.portfolio.pop() {
            let info = ConfigInfo {
                portfolio_member: true,
                model_based_pick: false,
            };
            return Ok((config, info));
        }
        track!(self.inner.get_config(budget))
    }

    fn new_result(&mut self, result: &TrialResult) -> Result<()> {
        track!(self.inner.new_result(result))
    }
}
