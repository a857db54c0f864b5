use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use derive_more::Display;

use crate::units::parse_quantity;
use crate::{Error, Result};

const DEFAULT_BURST_RATIO: f64 = 1.1;

const UNKNOWN_VERB: &str = "verb must be one of 'configure', 'start' or 'restart'";

/// What a rate limiter should do when it receives a new [`RateSpec`].
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum RateVerb {
    /// Apply the new rate. Limiters run from the moment they are created, so this behaves like
    /// [`Start`][Self::Start].
    #[display("configure")]
    Configure,

    /// Apply the new rate, keeping any accumulated scheduling delay. This is the usual verb for a
    /// limiter's first spec.
    #[default]
    #[display("start")]
    Start,

    /// Apply the new rate and discard all accumulated burst and backlog state.
    #[display("restart")]
    Restart,
}

impl RateVerb {
    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "configure" => Some(Self::Configure),
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

impl FromStr for RateVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::invalid_parameter("rate", s, UNKNOWN_VERB))
    }
}

/// A target rate in operations per second, with the burst ratio allowed when callers fall behind.
///
/// The textual form is `<rate>[,<burst ratio>[,<verb>]]`, with `:` accepted as an alternative
/// separator. The rate accepts unit suffixes, e.g. `10K`.
///
/// # Example
///
/// ```
/// use cycle_motor::{RateSpec, RateVerb};
///
/// let spec: RateSpec = "2K,1.5,restart".parse().unwrap();
/// assert_eq!(spec.ops_per_sec(), 2000.0);
/// assert_eq!(spec.burst_ratio(), 1.5);
/// assert_eq!(spec.verb(), RateVerb::Restart);
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSpec {
    ops_per_sec: f64,
    burst_ratio: f64,
    verb: RateVerb,
}

impl RateSpec {
    /// Creates a spec for the given rate with the default burst ratio of 1.1.
    ///
    /// # Panics
    ///
    /// Panics if the rate is not a positive finite number.
    #[must_use]
    pub fn new(ops_per_sec: f64) -> Self {
        assert!(
            ops_per_sec.is_finite() && ops_per_sec > 0.0,
            "rate must be a positive finite number, got {ops_per_sec}"
        );

        Self {
            ops_per_sec,
            burst_ratio: DEFAULT_BURST_RATIO,
            verb: RateVerb::default(),
        }
    }

    /// Sets the burst ratio.
    ///
    /// # Panics
    ///
    /// Panics if the ratio is less than 1.0.
    #[must_use]
    pub fn with_burst_ratio(mut self, burst_ratio: f64) -> Self {
        assert!(
            burst_ratio >= 1.0,
            "burst ratio must be at least 1.0, got {burst_ratio}"
        );

        self.burst_ratio = burst_ratio;
        self
    }

    /// Sets the verb.
    #[must_use]
    pub fn with_verb(mut self, verb: RateVerb) -> Self {
        self.verb = verb;
        self
    }

    /// The target rate in operations per second.
    #[must_use]
    pub fn ops_per_sec(&self) -> f64 {
        self.ops_per_sec
    }

    /// How far above the target rate callers may run while catching up on a backlog.
    #[must_use]
    pub fn burst_ratio(&self) -> f64 {
        self.burst_ratio
    }

    /// What the receiving rate limiter should do with this spec.
    #[must_use]
    pub fn verb(&self) -> RateVerb {
        self.verb
    }

    /// The scheduled time between two operations, never less than one nanosecond.
    #[must_use]
    pub fn op_interval(&self) -> Duration {
        let nanos = (1_000_000_000.0 / self.ops_per_sec).round();

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "rate is positive and finite, saturating conversion is acceptable"
        )]
        let nanos = nanos as u64;

        Duration::from_nanos(nanos.max(1))
    }

    pub(crate) fn parse_named(name: &str, value: &str) -> Result<Self> {
        let invalid = |problem: &str| Error::invalid_parameter(name, value, problem);

        let mut parts = value.split([',', ':']);

        let rate = parts
            .next()
            .and_then(parse_quantity)
            .ok_or_else(|| invalid("rate is not a number"))?;

        if rate <= 0.0 {
            return Err(invalid("rate must be greater than zero"));
        }

        let burst_ratio = match parts.next() {
            Some(burst) => burst
                .trim()
                .parse::<f64>()
                .map_err(|e| invalid(&format!("burst ratio is not a number: {e}")))?,
            None => DEFAULT_BURST_RATIO,
        };

        if !burst_ratio.is_finite() || burst_ratio < 1.0 {
            return Err(invalid("burst ratio must be at least 1.0"));
        }

        let verb = match parts.next() {
            Some(verb) => RateVerb::from_name(verb).ok_or_else(|| invalid(UNKNOWN_VERB))?,
            None => RateVerb::default(),
        };

        if parts.next().is_some() {
            return Err(invalid("expected at most three components"));
        }

        Ok(Self {
            ops_per_sec: rate,
            burst_ratio,
            verb,
        })
    }
}

impl FromStr for RateSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_named("rate", s)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops/s, burst ratio {}, {}",
            self.ops_per_sec, self.burst_ratio, self.verb
        )
    }
}
