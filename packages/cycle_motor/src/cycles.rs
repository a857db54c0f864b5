use std::fmt;
use std::str::FromStr;

use crate::units::parse_count;
use crate::{Error, Result};

/// A half-open range of cycle numbers, as configured by the `cycles` and `recycles` parameters.
///
/// Accepts either a bare count `N`, meaning `0..N`, or an explicit range `A..B`.
/// Both forms accept unit suffixes, e.g. `10K` or `1M..2M`.
///
/// # Example
///
/// ```
/// use cycle_motor::CyclesSpec;
///
/// let spec: CyclesSpec = "5..1K".parse().unwrap();
/// assert_eq!(spec.first(), 5);
/// assert_eq!(spec.end(), 1000);
/// assert_eq!(spec.len(), 995);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CyclesSpec {
    first: u64,
    end: u64,
}

impl CyclesSpec {
    /// Creates a range covering `first..end`.
    ///
    /// # Panics
    ///
    /// Panics if `end` is less than `first`.
    #[must_use]
    pub fn new(first: u64, end: u64) -> Self {
        assert!(end >= first, "cycle range {first}..{end} ends before it starts");

        Self { first, end }
    }

    /// The first cycle in the range.
    #[must_use]
    pub fn first(&self) -> u64 {
        self.first
    }

    /// The first cycle after the range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The number of cycles in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        // Cannot underflow, `end >= first` is upheld by all constructors.
        self.end.wrapping_sub(self.first)
    }

    /// Whether the range contains no cycles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end == self.first
    }

    pub(crate) fn parse_named(name: &str, value: &str) -> Result<Self> {
        let invalid = |problem: &str| Error::invalid_parameter(name, value, problem);

        let Some((first, end)) = value.split_once("..") else {
            let end = parse_count(value).ok_or_else(|| invalid("expected a count or a range"))?;
            return Ok(Self { first: 0, end });
        };

        let first = parse_count(first).ok_or_else(|| invalid("range start is not a count"))?;
        let end = parse_count(end).ok_or_else(|| invalid("range end is not a count"))?;

        if end < first {
            return Err(invalid("range ends before it starts"));
        }

        Ok(Self { first, end })
    }
}

impl FromStr for CyclesSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_named("cycles", s)
    }
}

impl fmt::Display for CyclesSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.first, self.end)
    }
}
