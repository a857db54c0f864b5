use std::iter::FusedIterator;
use std::slice;

use derive_more::From;

use crate::{CycleResult, Error, ResultCode, Result};

/// Size of one packed record: an 8-byte big-endian cycle followed by a 1-byte result code.
pub const PACKED_RECORD_LEN: usize = 9;

const CYCLE_LEN: usize = 8;

/// An immutable collection of cycle results, as handed to outputs.
///
/// There are three representations with different tradeoffs. All of them offer the same read
/// interface: iteration in stored order, count, minimum cycle, sorting and filtering.
///
/// * [`ArraySegment`] stores results as values. General purpose, and the result of
///   [`sorted()`][Self::sorted] and [`filter()`][Self::filter].
/// * [`DenseSegment`] stores a base cycle and one code byte per cycle. The cheapest form when the
///   cycles are contiguous, which is the normal case for a stride.
/// * [`PackedSegment`] stores 9-byte records. Handles arbitrary cycle sets and is the form used
///   for durable storage.
///
/// # Example
///
/// ```
/// use cycle_motor::{CycleResult, CycleResultsSegment, DenseSegment};
///
/// let segment = CycleResultsSegment::from(DenseSegment::new(10, vec![0, 1, 0]));
///
/// assert_eq!(segment.len(), 3);
/// assert_eq!(segment.min_cycle(), Some(10));
///
/// let failures = segment.filter(|r| r.result() != 0);
/// assert_eq!(failures.iter().collect::<Vec<_>>(), vec![CycleResult::new(11, 1)]);
/// ```
#[derive(Clone, Debug, Eq, From, PartialEq)]
#[non_exhaustive]
pub enum CycleResultsSegment {
    /// Results stored as values.
    Array(ArraySegment),

    /// Results of contiguous cycles stored as a base cycle and one code per cycle.
    Dense(DenseSegment),

    /// Results stored as packed binary records.
    Packed(PackedSegment),
}

impl CycleResultsSegment {
    /// The number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Array(s) => s.results.len(),
            Self::Dense(s) => s.codes.len(),
            Self::Packed(s) => s.len(),
        }
    }

    /// Whether the segment contains no results.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lowest cycle in the segment, or `None` if it is empty.
    #[must_use]
    pub fn min_cycle(&self) -> Option<u64> {
        match self {
            Self::Dense(s) => (!s.codes.is_empty()).then_some(s.base),
            Self::Array(_) | Self::Packed(_) => self.iter().map(|r| r.cycle()).min(),
        }
    }

    /// Iterates over the results in stored order.
    pub fn iter(&self) -> SegmentIter<'_> {
        let inner = match self {
            Self::Array(s) => IterInner::Array(s.results.iter()),
            Self::Dense(s) => IterInner::Dense {
                next_cycle: s.base,
                codes: s.codes.iter(),
            },
            Self::Packed(s) => IterInner::Packed(s.bytes.chunks_exact(PACKED_RECORD_LEN)),
        };

        SegmentIter { inner }
    }

    /// Returns the results ordered by cycle.
    #[must_use]
    pub fn sorted(&self) -> Self {
        if let Self::Dense(dense) = self {
            return Self::Dense(dense.clone());
        }

        let mut results: Vec<_> = self.iter().collect();
        results.sort_by_key(CycleResult::cycle);
        Self::Array(ArraySegment::from(results))
    }

    /// Returns a new array-backed segment with only the results that match `predicate`.
    #[must_use]
    pub fn filter(&self, mut predicate: impl FnMut(&CycleResult) -> bool) -> Self {
        let results: Vec<_> = self.iter().filter(|r| predicate(r)).collect();
        Self::Array(ArraySegment::from(results))
    }

    /// Encodes the results in the packed binary form, preserving their order.
    #[must_use]
    pub fn to_packed(&self) -> PackedSegment {
        match self {
            Self::Packed(packed) => packed.clone(),
            Self::Array(_) | Self::Dense(_) => PackedSegment::encode(self.iter()),
        }
    }
}

impl<'a> IntoIterator for &'a CycleResultsSegment {
    type Item = CycleResult;
    type IntoIter = SegmentIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Cycle results stored as values.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ArraySegment {
    results: Box<[CycleResult]>,
}

impl ArraySegment {
    /// The stored results.
    #[must_use]
    pub fn results(&self) -> &[CycleResult] {
        &self.results
    }
}

impl From<Vec<CycleResult>> for ArraySegment {
    fn from(results: Vec<CycleResult>) -> Self {
        Self {
            results: results.into_boxed_slice(),
        }
    }
}

/// Results of the contiguous cycles `base..base + codes.len()`.
///
/// Cycle `base + i` has result code `codes[i]`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DenseSegment {
    base: u64,
    codes: Box<[ResultCode]>,
}

impl DenseSegment {
    /// Creates a segment starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if the cycles would extend beyond `u64::MAX`.
    #[must_use]
    pub fn new(base: u64, codes: Vec<ResultCode>) -> Self {
        let len = u64::try_from(codes.len()).unwrap_or(u64::MAX);
        assert!(
            base.checked_add(len).is_some(),
            "dense segment starting at {base} with {len} codes overflows the cycle space"
        );

        Self {
            base,
            codes: codes.into_boxed_slice(),
        }
    }

    /// The first cycle.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// One code per cycle, starting at the base cycle.
    #[must_use]
    pub fn codes(&self) -> &[ResultCode] {
        &self.codes
    }

    /// Encodes the segment as the 8-byte big-endian base cycle followed by one byte per code.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CYCLE_LEN.saturating_add(self.codes.len()));
        bytes.extend_from_slice(&self.base.to_be_bytes());
        bytes.extend(self.codes.iter().flat_map(|code| code.to_be_bytes()));
        bytes
    }

    /// Decodes a segment produced by [`to_bytes()`][Self::to_bytes].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is too short to contain a base cycle or if the cycles would
    /// extend beyond `u64::MAX`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (base, codes) = bytes
            .split_first_chunk::<CYCLE_LEN>()
            .ok_or_else(|| Error::MalformedCycleLog {
                problem: format!("dense segment of {} bytes has no base cycle", bytes.len()),
            })?;

        let base = u64::from_be_bytes(*base);
        let len = u64::try_from(codes.len()).unwrap_or(u64::MAX);

        if base.checked_add(len).is_none() {
            return Err(Error::MalformedCycleLog {
                problem: format!("dense segment at {base} with {len} codes overflows"),
            });
        }

        Ok(Self {
            base,
            codes: codes.iter().map(|b| i8::from_be_bytes([*b])).collect(),
        })
    }
}

/// Results stored as a flat buffer of 9-byte records in append order.
///
/// Each record is the cycle as an 8-byte big-endian integer followed by the result code byte.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PackedSegment {
    bytes: Box<[u8]>,
}

impl PackedSegment {
    /// Packs the results in the order given.
    pub fn encode(results: impl IntoIterator<Item = CycleResult>) -> Self {
        let results = results.into_iter();
        let mut bytes =
            Vec::with_capacity(results.size_hint().0.saturating_mul(PACKED_RECORD_LEN));

        for result in results {
            bytes.extend_from_slice(&result.cycle().to_be_bytes());
            bytes.extend_from_slice(&result.result().to_be_bytes());
        }

        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Wraps bytes previously obtained from [`as_bytes()`][Self::as_bytes].
    ///
    /// # Errors
    ///
    /// Returns an error if the length is not a whole number of records.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len().checked_rem(PACKED_RECORD_LEN) != Some(0) {
            return Err(Error::MalformedCycleLog {
                problem: format!(
                    "{} bytes is not a whole number of {PACKED_RECORD_LEN}-byte records",
                    bytes.len()
                ),
            });
        }

        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// The encoded records.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len().checked_div(PACKED_RECORD_LEN).unwrap_or(0)
    }

    /// Whether there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Iterator over the results of a [`CycleResultsSegment`].
#[derive(Clone, Debug)]
pub struct SegmentIter<'a> {
    inner: IterInner<'a>,
}

#[derive(Clone, Debug)]
enum IterInner<'a> {
    Array(slice::Iter<'a, CycleResult>),
    Dense {
        next_cycle: u64,
        codes: slice::Iter<'a, ResultCode>,
    },
    Packed(slice::ChunksExact<'a, u8>),
}

fn decode_record(record: &[u8]) -> Option<CycleResult> {
    let (cycle, code) = record.split_first_chunk::<CYCLE_LEN>()?;
    let code = code.first()?;

    Some(CycleResult::new(
        u64::from_be_bytes(*cycle),
        i8::from_be_bytes([*code]),
    ))
}

impl Iterator for SegmentIter<'_> {
    type Item = CycleResult;

    fn next(&mut self) -> Option<CycleResult> {
        match &mut self.inner {
            IterInner::Array(results) => results.next().copied(),
            IterInner::Dense { next_cycle, codes } => {
                let code = codes.next()?;
                let cycle = *next_cycle;
                // Cannot overflow, upheld by the dense segment constructors.
                *next_cycle = next_cycle.wrapping_add(1);
                Some(CycleResult::new(cycle, *code))
            }
            IterInner::Packed(records) => records.next().and_then(decode_record),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            IterInner::Array(results) => results.size_hint(),
            IterInner::Dense { codes, .. } => codes.size_hint(),
            IterInner::Packed(records) => records.size_hint(),
        }
    }
}

impl ExactSizeIterator for SegmentIter<'_> {}

impl FusedIterator for SegmentIter<'_> {}
