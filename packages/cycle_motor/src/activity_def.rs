use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZero;
use std::str::FromStr;

use new_zealand::nz;

use crate::units::parse_count;
use crate::{CyclesSpec, Error, RateSpec, Result};

const ALIAS: &str = "alias";
const CYCLES: &str = "cycles";
const RECYCLES: &str = "recycles";
const THREADS: &str = "threads";
const STRIDE: &str = "stride";
const STRIDE_RATE: &str = "striderate";
const ASYNC: &str = "async";

/// Keys that configure the per-cycle rate limiter, in order of precedence.
const CYCLE_RATE: &[&str] = &["cyclerate", "rate", "targetrate"];

const DEFAULT_ALIAS: &str = "unnamed";

/// In-flight operation limit used when `async` is given as a plain flag.
const DEFAULT_ASYNC_LIMIT: NonZero<usize> = nz!(100);

/// The parameters of an activity.
///
/// An activity definition is a set of `key=value` parameters. The core interprets a handful of
/// them (`alias`, `cycles`, `recycles`, `threads`, `stride`, `rate`/`cyclerate`, `striderate`
/// and `async`) and passes everything else through untouched for actions and outputs to read.
///
/// Definitions are values. A running [`Activity`][crate::Activity] holds the current definition
/// and broadcasts each replacement to the components that observe it.
///
/// # Example
///
/// ```
/// use cycle_motor::ActivityDef;
///
/// let def: ActivityDef = "alias=writes;cycles=1M;threads=4;stride=100;rate=5K".parse().unwrap();
///
/// assert_eq!(def.alias(), "writes");
/// assert_eq!(def.cycles().unwrap().len(), 1_000_000);
/// assert_eq!(def.threads().unwrap().get(), 4);
/// assert_eq!(def.get("table"), None);
/// ```
#[derive(Clone, Default, Eq, PartialEq)]
pub struct ActivityDef {
    params: BTreeMap<String, String>,
}

impl ActivityDef {
    /// Creates an empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the definition with `key` set to `value`.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.params.insert(key.into(), value.to_string());
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.params.remove(key)
    }

    /// The raw value of a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// All parameters, in key order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The name used to identify the activity in logs and diagnostics.
    #[must_use]
    pub fn alias(&self) -> &str {
        self.get(ALIAS).unwrap_or(DEFAULT_ALIAS)
    }

    /// The cycles to execute. Required.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is missing or malformed.
    pub fn cycles(&self) -> Result<CyclesSpec> {
        let value = self.get(CYCLES).ok_or_else(|| Error::MissingParameter {
            name: CYCLES.to_string(),
        })?;

        CyclesSpec::parse_named(CYCLES, value)
    }

    /// How many times the whole cycle range is executed. Defaults to once.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed.
    pub fn recycles(&self) -> Result<CyclesSpec> {
        self.get(RECYCLES).map_or_else(
            || Ok(CyclesSpec::new(0, 1)),
            |value| CyclesSpec::parse_named(RECYCLES, value),
        )
    }

    /// The number of motors to run concurrently. Defaults to 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed or zero.
    pub fn threads(&self) -> Result<NonZero<usize>> {
        self.non_zero(THREADS)
    }

    /// The number of cycles drawn per segment. Defaults to 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed or zero.
    pub fn stride(&self) -> Result<NonZero<usize>> {
        self.non_zero(STRIDE)
    }

    /// The target rate of individual cycles across all motors, if limited.
    ///
    /// Read from `cyclerate`, falling back to `rate` and then `targetrate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed.
    pub fn cycle_rate(&self) -> Result<Option<RateSpec>> {
        CYCLE_RATE
            .iter()
            .find_map(|&name| self.get(name).map(|value| (name, value)))
            .map(|(name, value)| RateSpec::parse_named(name, value))
            .transpose()
    }

    /// The target rate of whole strides across all motors, if limited.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed.
    pub fn stride_rate(&self) -> Result<Option<RateSpec>> {
        self.get(STRIDE_RATE)
            .map(|value| RateSpec::parse_named(STRIDE_RATE, value))
            .transpose()
    }

    /// The in-flight operation limit per motor if the asynchronous execution path is selected.
    ///
    /// `async=true` selects the path with a default limit, `async=N` with a limit of `N`.
    /// Absent, `false` or `0` selects the synchronous path.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter is malformed.
    pub fn async_limit(&self) -> Result<Option<NonZero<usize>>> {
        let Some(value) = self.get(ASYNC) else {
            return Ok(None);
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "" | "true" => Ok(Some(DEFAULT_ASYNC_LIMIT)),
            "false" => Ok(None),
            other => {
                let count = parse_count(other)
                    .and_then(|count| usize::try_from(count).ok())
                    .ok_or_else(|| {
                        Error::invalid_parameter(ASYNC, value, "expected a flag or a count")
                    })?;

                Ok(NonZero::new(count))
            }
        }
    }

    /// Whether the asynchronous execution path is selected.
    ///
    /// A malformed `async` value still selects it, so that validation reports it.
    #[must_use]
    pub fn is_async(&self) -> bool {
        !matches!(self.async_limit(), Ok(None))
    }

    /// Checks every parameter the core interprets.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.cycles()?;
        self.recycles()?;
        self.threads()?;
        self.stride()?;
        self.cycle_rate()?;
        self.stride_rate()?;
        self.async_limit()?;
        Ok(())
    }

    fn non_zero(&self, name: &str) -> Result<NonZero<usize>> {
        let Some(value) = self.get(name) else {
            return Ok(nz!(1));
        };

        parse_count(value)
            .and_then(|count| usize::try_from(count).ok())
            .and_then(NonZero::new)
            .ok_or_else(|| Error::invalid_parameter(name, value, "expected a positive count"))
    }
}

impl FromStr for ActivityDef {
    type Err = Error;

    /// Parses `key=value` pairs separated by `;` or newlines.
    fn from_str(s: &str) -> Result<Self> {
        let mut def = Self::new();

        for pair in s.split([';', '\n']).map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::invalid_parameter(
                    pair,
                    pair,
                    "expected a key=value pair",
                ));
            };

            def.set(key.trim(), value.trim());
        }

        Ok(def)
    }
}

impl fmt::Display for ActivityDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.params().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }

            write!(f, "{key}={value}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for ActivityDef {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.params()).finish()
    }
}

/// A component that reacts to live changes of the activity definition.
///
/// Register observers with [`Activity::add_observer()`][crate::Activity::add_observer]. The
/// activity calls every observer after each successful definition update.
pub trait ActivityDefObserver: Send + Sync {
    /// Called with the new definition after it has been validated and published.
    fn on_activity_def_update(&self, def: &ActivityDef);
}
