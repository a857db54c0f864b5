use std::fmt;
use std::num::NonZero;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use crate::{ActivityDef, CyclesSpec, Result};

/// A thread-safe source of cycle segments shared by all motors of an activity.
///
/// Every call to [`get_input_segment()`][Self::get_input_segment] reserves cycles that no other
/// call, concurrent or sequential, will ever receive again.
pub trait Input: Send + Sync {
    /// Reserves the next `stride` cycles.
    ///
    /// The returned segment may be shorter than `stride` when the remaining budget is smaller.
    /// Returns `None` once the budget is exhausted. Exhaustion is permanent.
    fn get_input_segment(&self, stride: NonZero<usize>) -> Option<CycleSegment>;

    /// Called once by each motor before it starts drawing segments.
    fn start(&self) {}

    /// Called after the activity definition changes.
    fn on_activity_def_update(&self, _def: &ActivityDef) {}
}

/// A contiguous range of cycles reserved for exactly one motor.
///
/// Cycles are drawn in increasing order until the segment is exhausted. The segment is also an
/// [`Iterator`] over the cycles it has not yet handed out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleSegment {
    next: u64,
    end: u64,
    recycle: u64,
}

impl CycleSegment {
    /// Creates a segment over `range`, in the first recycle.
    #[must_use]
    pub fn new(range: Range<u64>) -> Self {
        Self {
            next: range.start,
            end: range.end.max(range.start),
            recycle: 0,
        }
    }

    /// Sets the recycle the segment belongs to.
    #[must_use]
    pub fn with_recycle(mut self, recycle: u64) -> Self {
        self.recycle = recycle;
        self
    }

    /// Draws the next cycle, or `None` if the segment is exhausted.
    pub fn next_cycle(&mut self) -> Option<u64> {
        if self.next >= self.end {
            return None;
        }

        let cycle = self.next;
        // Cannot overflow, `next < end <= u64::MAX`.
        self.next = self.next.wrapping_add(1);
        Some(cycle)
    }

    /// The cycle the next call to [`next_cycle()`][Self::next_cycle] would return.
    #[must_use]
    pub fn peek_next_cycle(&self) -> Option<u64> {
        (self.next < self.end).then_some(self.next)
    }

    /// Whether all cycles have been drawn.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.next >= self.end
    }

    /// The number of cycles not yet drawn.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }

    /// The recycle (repetition of the whole cycle range) this segment belongs to.
    #[must_use]
    pub fn recycle(&self) -> u64 {
        self.recycle
    }

    /// Exhausts the segment, returning the cycles that were never drawn.
    pub fn abandon(&mut self) -> Range<u64> {
        let abandoned = self.next..self.end;
        self.next = self.end;
        abandoned
    }
}

impl Iterator for CycleSegment {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        self.next_cycle()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        (remaining, usize::try_from(self.remaining()).ok())
    }
}

#[derive(Debug, Eq, PartialEq)]
struct Bounds {
    cycles: CyclesSpec,
    recycles: CyclesSpec,
}

impl Bounds {
    fn total(&self) -> u64 {
        self.cycles
            .len()
            .checked_mul(self.recycles.len())
            .unwrap_or(u64::MAX)
    }
}

/// The standard [`Input`]: hands out consecutive segments of a cycle range with a single
/// atomic compare-and-swap per segment.
///
/// The position is an ordinal over all recycles of the range. A segment never crosses the end of
/// the range, so the last segment of each recycle may be shorter than the requested stride.
///
/// # Example
///
/// ```
/// use cycle_motor::{AtomicInput, CyclesSpec, Input};
/// use new_zealand::nz;
///
/// let input = AtomicInput::new(CyclesSpec::new(0, 7));
///
/// let first = input.get_input_segment(nz!(5)).unwrap();
/// assert_eq!(first.collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
///
/// let last = input.get_input_segment(nz!(5)).unwrap();
/// assert_eq!(last.collect::<Vec<_>>(), vec![5, 6]);
///
/// assert!(input.get_input_segment(nz!(5)).is_none());
/// ```
pub struct AtomicInput {
    bounds: ArcSwap<Bounds>,
    position: AtomicU64,
    started: AtomicBool,
}

impl AtomicInput {
    /// Creates an input over `cycles`, executed once.
    #[must_use]
    pub fn new(cycles: CyclesSpec) -> Self {
        Self::with_recycles(cycles, CyclesSpec::new(0, 1))
    }

    /// Creates an input over `cycles`, executed once per recycle in `recycles`.
    #[must_use]
    pub fn with_recycles(cycles: CyclesSpec, recycles: CyclesSpec) -> Self {
        Self {
            bounds: ArcSwap::from_pointee(Bounds { cycles, recycles }),
            position: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Creates an input from the `cycles` and `recycles` parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if either parameter is missing or malformed.
    pub fn from_def(def: &ActivityDef) -> Result<Self> {
        Ok(Self::with_recycles(def.cycles()?, def.recycles()?))
    }

    /// The cycle the next segment will start at, or `None` if the input is exhausted.
    #[must_use]
    pub fn next_cycle(&self) -> Option<u64> {
        let bounds = self.bounds.load();
        let position = self.position.load(Ordering::Relaxed);

        if position >= bounds.total() {
            return None;
        }

        position
            .checked_rem(bounds.cycles.len())
            .and_then(|offset| bounds.cycles.first().checked_add(offset))
    }

    /// The number of cycles this input hands out in total, across all recycles.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.bounds.load().total()
    }

    /// The number of cycles not yet handed out.
    #[must_use]
    pub fn remaining_cycles(&self) -> u64 {
        self.total_cycles()
            .saturating_sub(self.position.load(Ordering::Relaxed))
    }

    /// Whether any motor has started this input.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

impl Input for AtomicInput {
    #[expect(
        clippy::arithmetic_side_effects,
        clippy::integer_division,
        reason = "per_recycle is non-zero and every value is bounded by the total"
    )]
    fn get_input_segment(&self, stride: NonZero<usize>) -> Option<CycleSegment> {
        let bounds = self.bounds.load();
        let per_recycle = bounds.cycles.len();
        let total = bounds.total();

        if per_recycle == 0 {
            return None;
        }

        let stride = u64::try_from(stride.get()).unwrap_or(u64::MAX);

        // Relaxed is enough: uniqueness only depends on the total order of this one atomic.
        let mut current = self.position.load(Ordering::Relaxed);

        loop {
            if current >= total {
                return None;
            }

            let recycle_index = current / per_recycle;
            let recycle_end = (recycle_index.saturating_add(1))
                .saturating_mul(per_recycle)
                .min(total);
            let next = current.saturating_add(stride).min(recycle_end);

            match self.position.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let first = bounds.cycles.first() + current % per_recycle;
                    let end = first + (next - current);

                    return Some(
                        CycleSegment::new(first..end)
                            .with_recycle(bounds.recycles.first() + recycle_index),
                    );
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn start(&self) {
        if !self.started.swap(true, Ordering::Relaxed) {
            let bounds = self.bounds.load();
            debug!(
                cycles = %bounds.cycles,
                recycles = %bounds.recycles,
                "input started"
            );
        }
    }

    fn on_activity_def_update(&self, def: &ActivityDef) {
        let (cycles, recycles) = match (def.cycles(), def.recycles()) {
            (Ok(cycles), Ok(recycles)) => (cycles, recycles),
            (Err(error), _) | (_, Err(error)) => {
                warn!(%error, "ignoring input reconfiguration");
                return;
            }
        };

        let new_bounds = Arc::new(Bounds { cycles, recycles });
        let old_bounds = self.bounds.swap(Arc::clone(&new_bounds));

        if *old_bounds == *new_bounds {
            return;
        }

        if old_bounds.cycles.first() != new_bounds.cycles.first() {
            info!(
                old = %old_bounds.cycles,
                new = %new_bounds.cycles,
                "cycle range start changed, restarting from the first cycle"
            );
            self.position.store(0, Ordering::Relaxed);
        } else {
            debug!(cycles = %new_bounds.cycles, recycles = %new_bounds.recycles, "input bounds updated");
        }
    }
}

impl fmt::Debug for AtomicInput {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bounds = self.bounds.load();

        f.debug_struct("AtomicInput")
            .field("cycles", &bounds.cycles)
            .field("recycles", &bounds.recycles)
            .field("position", &self.position.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
