//! Hyperparameter configuration spaces.
//!
//! This is the minimal model the scheduler and the evaluation worker need:
//! typed hyperparameters, equality/membership conditions between them,
//! sampling, and deactivation of hyperparameters whose conditions do not hold.
use crate::{ErrorKind, Result};
use rand::distributions::Distribution;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter::FromIterator;

/// The hyperparameter that selects the active model family.
pub const ALGORITHM_CHOICE: &str = "classifier:__choice__";

/// Hyperparameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Value {
    /// Integer value.
    Int(i64),

    /// Floating point value.
    Float(f64),

    /// String (categorical) value.
    Str(String),
}
impl Value {
    /// Returns the string if this is a `Value::Str`.
    pub fn as_str(&self) -> Option<&str> {
        if let Value::Str(s) = self {
            Some(s)
        } else {
            None
        }
    }

    /// Returns the numeric value if this is a `Value::Int` or a `Value::Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(x) => Some(x as f64),
            Value::Float(x) => Some(x),
            Value::Str(_) => None,
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(x) => write!(f, "{}", x),
        }
    }
}
impl From<i64> for Value {
    fn from(f: i64) -> Self {
        Value::Int(f)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl<'a> From<&'a str> for Value {
    fn from(f: &'a str) -> Self {
        Value::Str(f.to_owned())
    }
}
impl From<String> for Value {
    fn from(f: String) -> Self {
        Value::Str(f)
    }
}

/// A point of a configuration space: a mapping from hyperparameter names to values.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Configuration(BTreeMap<String, Value>);
impl Configuration {
    /// Makes an empty `Configuration`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of the given hyperparameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Sets a hyperparameter, returning the previous value if any.
    pub fn insert<K, V>(&mut self, name: K, value: V) -> Option<Value>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.0.insert(name.into(), value.into())
    }

    /// Removes a hyperparameter.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Returns `true` if the given hyperparameter is set.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Overwrites this configuration with every entry of `other`.
    pub fn update(&mut self, other: &Configuration) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_owned(), v.clone());
        }
    }

    /// Returns an iterator over the entries, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if this configuration has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the selected model family (the value of `ALGORITHM_CHOICE`).
    pub fn algorithm(&self) -> Option<&str> {
        self.get(ALGORITHM_CHOICE).and_then(Value::as_str)
    }
}
impl<K, V> FromIterator<(K, V)> for Configuration
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Domain of a hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// A finite set of choices.
    Categorical {
        /// Allowed values.
        choices: Vec<Value>,

        /// Index of the default choice.
        default: usize,
    },

    /// A fixed value.
    Constant(Value),

    /// Floating point numbers in `[low, high]`.
    UniformFloat {
        /// Lower bound (inclusive).
        low: f64,

        /// Upper bound (inclusive).
        high: f64,

        /// Whether values are sampled in log space.
        log: bool,

        /// Default value.
        default: f64,
    },

    /// Integers in `[low, high]`.
    UniformInt {
        /// Lower bound (inclusive).
        low: i64,

        /// Upper bound (inclusive).
        high: i64,

        /// Whether values are sampled in log space.
        log: bool,

        /// Default value.
        default: i64,
    },
}

/// A named hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameter {
    name: String,
    domain: Domain,
}
impl Hyperparameter {
    /// Makes a categorical hyperparameter whose default is the first choice.
    ///
    /// # Errors
    ///
    /// If `choices` is empty, an `ErrorKind::InvalidInput` error will be returned.
    pub fn categorical<N: Into<String>>(name: N, choices: Vec<Value>) -> Result<Self> {
        let name = name.into();
        track_assert!(!choices.is_empty(), ErrorKind::InvalidInput; name);
        Ok(Self {
            name,
            domain: Domain::Categorical {
                choices,
                default: 0,
            },
        })
    }

    /// Makes a constant hyperparameter.
    pub fn constant<N: Into<String>, V: Into<Value>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            domain: Domain::Constant(value.into()),
        }
    }

    /// Makes a floating point hyperparameter over `[low, high]` whose default is the midpoint.
    ///
    /// # Errors
    ///
    /// If `low` or `high` is not finite or `low > high`, an `ErrorKind::InvalidInput` error will be returned.
    pub fn uniform_float<N: Into<String>>(name: N, low: f64, high: f64) -> Result<Self> {
        let name = name.into();
        track_assert!(low.is_finite() && high.is_finite(), ErrorKind::InvalidInput; name, low, high);
        track_assert!(low <= high, ErrorKind::InvalidInput; name, low, high);
        Ok(Self {
            name,
            domain: Domain::UniformFloat {
                low,
                high,
                log: false,
                default: low + (high - low) / 2.0,
            },
        })
    }

    /// Makes an integer hyperparameter over `[low, high]` whose default is the midpoint.
    ///
    /// # Errors
    ///
    /// If `low > high`, an `ErrorKind::InvalidInput` error will be returned.
    pub fn uniform_int<N: Into<String>>(name: N, low: i64, high: i64) -> Result<Self> {
        let name = name.into();
        track_assert!(low <= high, ErrorKind::InvalidInput; name, low, high);
        Ok(Self {
            name,
            domain: Domain::UniformInt {
                low,
                high,
                log: false,
                default: low + (high - low) / 2,
            },
        })
    }

    /// Switches a numerical hyperparameter to log-space sampling.
    ///
    /// The default becomes the geometric midpoint of the range.
    ///
    /// # Errors
    ///
    /// If this is not a numerical hyperparameter or its lower bound is not positive,
    /// an `ErrorKind::InvalidInput` error will be returned.
    pub fn log_scale(mut self) -> Result<Self> {
        match &mut self.domain {
            Domain::UniformFloat {
                low,
                high,
                log,
                default,
            } => {
                track_assert!(*low > 0.0, ErrorKind::InvalidInput; self.name, low);
                *log = true;
                *default = (low.ln() + (high.ln() - low.ln()) / 2.0).exp();
            }
            Domain::UniformInt {
                low,
                high,
                log,
                default,
            } => {
                track_assert!(*low > 0, ErrorKind::InvalidInput; self.name, low);
                *log = true;
                let (l, h) = (*low as f64, *high as f64);
                *default = ((l.ln() + (h.ln() - l.ln()) / 2.0).exp().round() as i64)
                    .max(*low)
                    .min(*high);
            }
            _ => track_panic!(ErrorKind::InvalidInput, "{} is not numerical", self.name),
        }
        Ok(self)
    }

    /// Replaces the default value.
    ///
    /// # Errors
    ///
    /// If `value` is outside of the domain, an `ErrorKind::InvalidInput` error will be returned.
    pub fn with_default<V: Into<Value>>(mut self, value: V) -> Result<Self> {
        let value = value.into();
        track_assert!(self.contains(&value), ErrorKind::InvalidInput; self.name, value);
        match &mut self.domain {
            Domain::Categorical { choices, default } => {
                *default = choices
                    .iter()
                    .position(|c| *c == value)
                    .unwrap_or_else(|| unreachable!());
            }
            Domain::Constant(_) => {}
            Domain::UniformFloat { default, .. } => {
                *default = value.as_f64().unwrap_or_else(|| unreachable!());
            }
            Domain::UniformInt { default, .. } => {
                if let Value::Int(v) = value {
                    *default = v;
                }
            }
        }
        Ok(self)
    }

    /// Returns the name of this hyperparameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the domain of this hyperparameter.
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Returns the default value.
    pub fn default_value(&self) -> Value {
        match &self.domain {
            Domain::Categorical { choices, default } => choices[*default].clone(),
            Domain::Constant(v) => v.clone(),
            Domain::UniformFloat { default, .. } => Value::Float(*default),
            Domain::UniformInt { default, .. } => Value::Int(*default),
        }
    }

    /// Returns the only admissible value if this hyperparameter is a constant
    /// or a categorical with a single choice.
    pub fn constant_value(&self) -> Option<&Value> {
        match &self.domain {
            Domain::Constant(v) => Some(v),
            Domain::Categorical { choices, .. } if choices.len() == 1 => Some(&choices[0]),
            _ => None,
        }
    }

    /// Returns `true` if `value` belongs to the domain of this hyperparameter.
    pub fn contains(&self, value: &Value) -> bool {
        match (&self.domain, value) {
            (Domain::Categorical { choices, .. }, v) => choices.contains(v),
            (Domain::Constant(c), v) => c == v,
            (Domain::UniformFloat { low, high, .. }, v) => v
                .as_f64()
                .map_or(false, |x| *low <= x && x <= *high),
            (Domain::UniformInt { low, high, .. }, Value::Int(x)) => *low <= *x && *x <= *high,
            (Domain::UniformInt { .. }, _) => false,
        }
    }

    /// Returns the number of choices for categorical (and constant) hyperparameters.
    pub fn cardinality(&self) -> Option<usize> {
        match &self.domain {
            Domain::Categorical { choices, .. } => Some(choices.len()),
            Domain::Constant(_) => Some(1),
            _ => None,
        }
    }

    /// Converts the given value to its internal representation.
    ///
    /// Categorical values are mapped to their index, numerical values to `[0, 1]`
    /// (in log space if the hyperparameter is log-scaled).
    pub fn encode(&self, value: &Value) -> Result<f64> {
        track_assert!(self.contains(value), ErrorKind::InvalidInput; self.name, value);
        Ok(match &self.domain {
            Domain::Categorical { choices, .. } => choices
                .iter()
                .position(|c| c == value)
                .unwrap_or_else(|| unreachable!()) as f64,
            Domain::Constant(_) => 0.0,
            Domain::UniformFloat { low, high, log, .. } => {
                unit(value.as_f64().unwrap_or_else(|| unreachable!()), *low, *high, *log)
            }
            Domain::UniformInt { low, high, log, .. } => unit(
                value.as_f64().unwrap_or_else(|| unreachable!()),
                *low as f64,
                *high as f64,
                *log,
            ),
        })
    }

    /// Converts the given internal representation to a value of this hyperparameter.
    ///
    /// Out of range inputs are clipped to the domain.
    pub fn decode(&self, x: f64) -> Value {
        match &self.domain {
            Domain::Categorical { choices, .. } => {
                let i = (x.round().max(0.0) as usize).min(choices.len() - 1);
                choices[i].clone()
            }
            Domain::Constant(v) => v.clone(),
            Domain::UniformFloat { low, high, log, .. } => {
                Value::Float(from_unit(x, *low, *high, *log).max(*low).min(*high))
            }
            Domain::UniformInt { low, high, log, .. } => {
                let v = from_unit(x, *low as f64, *high as f64, *log).round() as i64;
                Value::Int(v.max(*low).min(*high))
            }
        }
    }
}
impl Distribution<Value> for Hyperparameter {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match &self.domain {
            Domain::Categorical { choices, .. } => {
                choices[rng.gen_range(0, choices.len())].clone()
            }
            Domain::Constant(v) => v.clone(),
            Domain::UniformFloat { .. } | Domain::UniformInt { .. } => {
                self.decode(rng.gen_range(0.0, 1.0))
            }
        }
    }
}

fn unit(x: f64, low: f64, high: f64, log: bool) -> f64 {
    if high <= low {
        return 0.0;
    }
    if log {
        (x.ln() - low.ln()) / (high.ln() - low.ln())
    } else {
        (x - low) / (high - low)
    }
}

fn from_unit(u: f64, low: f64, high: f64, log: bool) -> f64 {
    let u = u.max(0.0).min(1.0);
    if log {
        (low.ln() + u * (high.ln() - low.ln())).exp()
    } else {
        low + u * (high - low)
    }
}

/// Activation condition of a child hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The child is active iff the parent equals `value`.
    Equals {
        /// Conditioned hyperparameter.
        child: String,

        /// Conditioning hyperparameter.
        parent: String,

        /// Required parent value.
        value: Value,
    },

    /// The child is active iff the parent takes one of `values`.
    In {
        /// Conditioned hyperparameter.
        child: String,

        /// Conditioning hyperparameter.
        parent: String,

        /// Admissible parent values.
        values: Vec<Value>,
    },
}
impl Condition {
    /// Makes a `Condition::Equals` instance.
    pub fn equals<C, P, V>(child: C, parent: P, value: V) -> Self
    where
        C: Into<String>,
        P: Into<String>,
        V: Into<Value>,
    {
        Condition::Equals {
            child: child.into(),
            parent: parent.into(),
            value: value.into(),
        }
    }

    /// Makes a `Condition::In` instance.
    pub fn in_values<C, P>(child: C, parent: P, values: Vec<Value>) -> Self
    where
        C: Into<String>,
        P: Into<String>,
    {
        Condition::In {
            child: child.into(),
            parent: parent.into(),
            values,
        }
    }

    /// Returns the name of the conditioned hyperparameter.
    pub fn child(&self) -> &str {
        match self {
            Condition::Equals { child, .. } | Condition::In { child, .. } => child,
        }
    }

    /// Returns the name of the conditioning hyperparameter.
    pub fn parent(&self) -> &str {
        match self {
            Condition::Equals { parent, .. } | Condition::In { parent, .. } => parent,
        }
    }

    /// Returns `true` if the given parent value activates the child.
    pub fn is_satisfied_by(&self, parent_value: &Value) -> bool {
        match self {
            Condition::Equals { value, .. } => value == parent_value,
            Condition::In { values, .. } => values.contains(parent_value),
        }
    }
}
impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Condition::Equals {
                child,
                parent,
                value,
            } => write!(f, "{} | {} == {}", child, parent, value),
            Condition::In {
                child,
                parent,
                values,
            } => {
                let values = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                write!(f, "{} | {} in {{{}}}", child, parent, values.join(", "))
            }
        }
    }
}

/// A hyperparameter search domain with conditional structure.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationSpace {
    hyperparameters: Vec<Hyperparameter>,
    index: HashMap<String, usize>,
    conditions: Vec<Condition>,
}
impl ConfigurationSpace {
    /// Makes an empty `ConfigurationSpace`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hyperparameter.
    ///
    /// # Errors
    ///
    /// If a hyperparameter with the same name exists, an `ErrorKind::InvalidInput` error will be returned.
    pub fn add_hyperparameter(&mut self, hp: Hyperparameter) -> Result<()> {
        track_assert!(
            !self.index.contains_key(hp.name()),
            ErrorKind::InvalidInput,
            "duplicate hyperparameter: {}",
            hp.name()
        );
        self.index
            .insert(hp.name().to_owned(), self.hyperparameters.len());
        self.hyperparameters.push(hp);
        Ok(())
    }

    /// Adds a condition.
    ///
    /// # Errors
    ///
    /// If the child or the parent is not a hyperparameter of this space,
    /// an `ErrorKind::UnknownHyperparameter` error will be returned.
    pub fn add_condition(&mut self, condition: Condition) -> Result<()> {
        track_assert!(
            self.index.contains_key(condition.child()),
            ErrorKind::UnknownHyperparameter,
            "{}",
            condition
        );
        track_assert!(
            self.index.contains_key(condition.parent()),
            ErrorKind::UnknownHyperparameter,
            "{}",
            condition
        );
        track_assert_ne!(
            condition.child(),
            condition.parent(),
            ErrorKind::InvalidInput
        );
        self.conditions.push(condition);
        Ok(())
    }

    /// Returns the hyperparameters in insertion order.
    pub fn hyperparameters(&self) -> &[Hyperparameter] {
        &self.hyperparameters
    }

    /// Returns the conditions in insertion order.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns the hyperparameter with the given name.
    pub fn get_hyperparameter(&self, name: &str) -> Option<&Hyperparameter> {
        self.index.get(name).map(|&i| &self.hyperparameters[i])
    }

    /// Returns the number of hyperparameters (the dimensionality of this space).
    pub fn len(&self) -> usize {
        self.hyperparameters.len()
    }

    /// Returns `true` if this space has no hyperparameters.
    pub fn is_empty(&self) -> bool {
        self.hyperparameters.is_empty()
    }

    /// Samples a valid configuration uniformly from the prior of every hyperparameter.
    pub fn sample_configuration<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let mut config = Configuration::new();
        for hp in &self.hyperparameters {
            config.insert(hp.name(), hp.sample(rng));
        }
        self.retain_active(config)
    }

    /// Removes the hyperparameters whose conditions do not hold and fills
    /// missing active ones with their default values.
    ///
    /// # Errors
    ///
    /// If `config` contains a name that is not a hyperparameter of this space,
    /// an `ErrorKind::UnknownHyperparameter` error will be returned.
    pub fn deactivate_inactive_hyperparameters(
        &self,
        config: &Configuration,
    ) -> Result<Configuration> {
        for (name, _) in config.iter() {
            track_assert!(
                self.index.contains_key(name),
                ErrorKind::UnknownHyperparameter,
                "{}",
                name
            );
        }
        Ok(self.retain_active(config.clone()))
    }

    /// Checks that `config` is a valid point of this space.
    ///
    /// Every active hyperparameter must be set to a value inside its domain and
    /// no inactive or unknown hyperparameter may be set.
    pub fn check_configuration(&self, config: &Configuration) -> Result<()> {
        for (name, value) in config.iter() {
            let hp = track_assert_some!(
                self.get_hyperparameter(name),
                ErrorKind::UnknownHyperparameter,
                "{}",
                name
            );
            track_assert!(hp.contains(value), ErrorKind::InvalidInput; name, value);
        }
        let activity = self.activity(config);
        for (hp, active) in self.hyperparameters.iter().zip(activity) {
            track_assert_eq!(
                config.contains(hp.name()),
                active,
                ErrorKind::InvalidInput,
                "activity mismatch: {}",
                hp.name()
            );
        }
        Ok(())
    }

    fn retain_active(&self, mut config: Configuration) -> Configuration {
        let activity = self.activity(&config);
        for (hp, active) in self.hyperparameters.iter().zip(activity) {
            if !active {
                config.remove(hp.name());
            } else if !config.contains(hp.name()) {
                config.insert(hp.name(), hp.default_value());
            }
        }
        config
    }

    // A hyperparameter is active iff every parent is active and every condition
    // on it holds. Hyperparameters that cannot be decided (cyclic conditions)
    // are inactive.
    fn activity(&self, config: &Configuration) -> Vec<bool> {
        let mut decided: Vec<Option<bool>> = vec![None; self.hyperparameters.len()];
        loop {
            let mut progressed = false;
            for (i, hp) in self.hyperparameters.iter().enumerate() {
                if decided[i].is_some() {
                    continue;
                }

                let mut pending = false;
                let mut active = true;
                for c in self.conditions.iter().filter(|c| c.child() == hp.name()) {
                    let p = self.index[c.parent()];
                    match decided[p] {
                        None => pending = true,
                        Some(false) => {
                            active = false;
                            break;
                        }
                        Some(true) => {
                            let satisfied = match config.get(c.parent()) {
                                Some(v) => c.is_satisfied_by(v),
                                None => c.is_satisfied_by(
                                    &self.hyperparameters[p].default_value(),
                                ),
                            };
                            if !satisfied {
                                active = false;
                                break;
                            }
                        }
                    }
                }
                if !active {
                    decided[i] = Some(false);
                    progressed = true;
                } else if !pending {
                    decided[i] = Some(true);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        decided.into_iter().map(|d| d.unwrap_or(false)).collect()
    }
}
