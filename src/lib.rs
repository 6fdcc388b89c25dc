//! A budget-aware successive-halving AutoML orchestrator.
//!
//! Abstract budgets are turned into model-specific training effort (boosting
//! rounds or training examples), configurations are ranked and pruned rung by
//! rung, and a fallback search takes over when nothing converges.
//!
//! "hanbun" is a Japanese translation of "half".
#[macro_use]
extern crate trackable;

pub use self::error::{Error, ErrorKind};

pub mod budget;
pub mod driver;
pub mod dummy;
pub mod ensemble;
pub mod estimator;
pub mod generators;
pub mod history;
pub mod hyperband;
pub mod iteration;
pub mod kde;
pub mod pool;
pub mod portfolio;
pub mod reduction;
pub mod scheduler;
pub mod space;
pub mod worker;

mod error;
#[cfg(test)]
mod testing;

/// This crate specific `Result` type.
pub type Result<T> = std::result::Result<T, Error>;
