//! Search-space reduction.
//!
//! Hyperparameters that can only take a single value carry no search signal,
//! but the model constructors still need them. They are moved out of the space
//! into a constants table and put back right before training.
use crate::space::{Configuration, ConfigurationSpace};
use crate::{ErrorKind, Result};
use tracing::{debug, info};

/// A configuration space with its constant hyperparameters split off.
#[derive(Debug, Clone)]
pub struct ReducedSpace {
    space: ConfigurationSpace,
    constants: Configuration,
}
impl ReducedSpace {
    /// Returns the space used for sampling and scheduling.
    pub fn space(&self) -> &ConfigurationSpace {
        &self.space
    }

    /// Returns the constants table.
    pub fn constants(&self) -> &Configuration {
        &self.constants
    }

    /// Returns `config` with every constant put back.
    pub fn reinsert_constants(&self, config: &Configuration) -> Configuration {
        let mut config = config.clone();
        config.update(&self.constants);
        config
    }

    /// Returns `config` with every constant removed.
    ///
    /// Portfolio entries are written against the full space and go through this
    /// before they are handed to a scheduler working on the reduced space.
    pub fn strip_constants(&self, config: &Configuration) -> Configuration {
        let mut config = config.clone();
        for (name, _) in self.constants.iter() {
            config.remove(name);
        }
        config
    }
}

/// Splits `full` into a reduced space and a constants table.
///
/// Conditions that reference a removed hyperparameter are dropped.
pub fn reduce(full: &ConfigurationSpace) -> Result<ReducedSpace> {
    info!("Working on {}-dimensional configuration space.", full.len());

    let mut space = ConfigurationSpace::new();
    let mut constants = Configuration::new();
    for hp in full.hyperparameters() {
        if let Some(value) = hp.constant_value() {
            info!("found constant {} with value {}", hp.name(), value);
            constants.insert(hp.name(), value.clone());
        } else {
            track!(space.add_hyperparameter(hp.clone()))?;
        }
    }

    for condition in full.conditions() {
        match space.add_condition(condition.clone()) {
            Ok(()) => {}
            Err(ref e) if *e.kind() == ErrorKind::UnknownHyperparameter => {
                debug!("Not copying condition {}", condition);
            }
            Err(e) => return Err(track!(e)),
        }
    }

    info!("Reduced it to a {}-dimensional configuration space.", space.len());
    Ok(ReducedSpace { space, constants })
}
