use std::ops::Range;

use crate::{CycleResult, CycleResultsSegment, DenseSegment, PackedSegment, ResultCode};

/// Accumulates the results of one stride before they are handed to an output.
///
/// The buffer tracks whether the appended cycles are contiguous. As long as they are, only the
/// codes are stored and [`to_reader()`][Self::to_reader] produces a [`DenseSegment`]. The first
/// out-of-sequence cycle switches the buffer to storing cycles as well, and the reader becomes a
/// [`PackedSegment`].
///
/// The buffer is owned by a single motor and reused across strides: [`reset()`][Self::reset]
/// keeps the allocated capacity.
#[derive(Debug, Default)]
pub struct CycleResultSegmentBuffer {
    base: u64,
    codes: Vec<ResultCode>,

    // Only populated once the cycles stop being contiguous.
    cycles: Vec<u64>,
}

impl CycleResultSegmentBuffer {
    /// Creates a buffer sized for strides of `capacity` cycles.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            base: 0,
            codes: Vec::with_capacity(capacity),
            cycles: Vec::new(),
        }
    }

    /// Records the result of one cycle.
    pub fn append(&mut self, cycle: u64, result: ResultCode) {
        if self.codes.is_empty() {
            self.base = cycle;
        } else if self.is_contiguous() && Some(cycle) != self.next_contiguous_cycle() {
            let contiguous = self.contiguous_cycles();
            self.cycles.reserve(self.codes.capacity());
            self.cycles.extend(contiguous);
        }

        if !self.is_contiguous() {
            self.cycles.push(cycle);
        }

        self.codes.push(result);
    }

    /// The number of recorded results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Whether nothing has been recorded since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Produces an immutable segment with the recorded results, in append order.
    ///
    /// The segment owns its data, so the buffer can be reset and refilled immediately.
    #[must_use]
    pub fn to_reader(&self) -> CycleResultsSegment {
        if self.is_contiguous() {
            return DenseSegment::new(self.base, self.codes.clone()).into();
        }

        PackedSegment::encode(
            self.cycles
                .iter()
                .zip(&self.codes)
                .map(|(cycle, code)| CycleResult::new(*cycle, *code)),
        )
        .into()
    }

    /// Clears the recorded results, keeping the allocated capacity.
    pub fn reset(&mut self) {
        self.base = 0;
        self.codes.clear();
        self.cycles.clear();
    }

    /// Makes sure a stride of `capacity` cycles fits without reallocating.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        self.codes
            .reserve(capacity.saturating_sub(self.codes.len()));
    }

    fn is_contiguous(&self) -> bool {
        self.cycles.is_empty()
    }

    fn next_contiguous_cycle(&self) -> Option<u64> {
        u64::try_from(self.codes.len())
            .ok()
            .and_then(|len| self.base.checked_add(len))
    }

    fn contiguous_cycles(&self) -> Range<u64> {
        let end = self.next_contiguous_cycle().unwrap_or(u64::MAX);
        self.base..end
    }
}
