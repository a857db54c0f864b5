use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
    ActivityDef, ArraySegment, BoxError, CycleResult, CycleResultsSegment, DenseSegment,
    ResultCode,
};

/// A consumer of completed result segments.
///
/// Motors call [`on_recycle_result_segment()`][Self::on_recycle_result_segment] once per
/// completed stride, from their own threads, in no particular cycle order. An error returned from
/// any method is fatal for the motor that made the call.
pub trait Output: Send + Sync {
    /// Accepts the results of one stride.
    ///
    /// # Errors
    ///
    /// Whatever the output considers a failure. The error reaches the activity owner unchanged.
    fn on_cycle_result_segment(&self, segment: &CycleResultsSegment) -> Result<(), BoxError>;

    /// Accepts the results of one stride of the given recycle.
    ///
    /// With `recycles` above one, the same cycle is executed once per recycle. Outputs that
    /// need to tell those executions apart override this; the default ignores the recycle.
    ///
    /// # Errors
    ///
    /// Whatever the output considers a failure. The error reaches the activity owner unchanged.
    fn on_recycle_result_segment(
        &self,
        _recycle: u64,
        segment: &CycleResultsSegment,
    ) -> Result<(), BoxError> {
        self.on_cycle_result_segment(segment)
    }

    /// Called after the activity definition changes.
    fn on_activity_def_update(&self, _def: &ActivityDef) {}

    /// Called once after all motors have exited.
    ///
    /// # Errors
    ///
    /// Whatever the output considers a failure while flushing.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Re-sequences segments that arrive in any order and forwards contiguous runs of results to
/// downstream outputs, in increasing cycle order.
///
/// Every recycle is sequenced on its own, starting again at the first cycle, and its runs are
/// forwarded downstream with the recycle they belong to. Results that arrive ahead of the next
/// expected cycle of their recycle are held back until the gap before them is filled. The first
/// result for a cycle wins; later duplicates are dropped with a warning. Whatever is still held
/// back when the output is closed is forwarded as one final sorted segment per recycle, gaps
/// and all.
///
/// # Example
///
/// ```
/// use cycle_motor::{ContiguousChunker, DenseSegment, Output};
///
/// let chunker = ContiguousChunker::new(0, Vec::new());
///
/// chunker.on_cycle_result_segment(&DenseSegment::new(5, vec![0; 5]).into()).unwrap();
/// assert_eq!(chunker.pending_results(), 5);
///
/// // Fills the gap, releasing all ten results downstream.
/// chunker.on_cycle_result_segment(&DenseSegment::new(0, vec![0; 5]).into()).unwrap();
/// assert_eq!(chunker.pending_results(), 0);
/// assert_eq!(chunker.next_cycle(0), 10);
///
/// // The second recycle starts over at cycle 0.
/// assert_eq!(chunker.next_cycle(1), 0);
/// ```
pub struct ContiguousChunker {
    downstream: Vec<Arc<dyn Output>>,
    first_cycle: u64,
    recycles: Mutex<BTreeMap<u64, Sequence>>,
}

/// Sequencing state of one recycle.
#[derive(Debug)]
struct Sequence {
    next_cycle: u64,
    pending: BTreeMap<u64, ResultCode>,
}

impl Sequence {
    fn new(first_cycle: u64) -> Self {
        Self {
            next_cycle: first_cycle,
            pending: BTreeMap::new(),
        }
    }

    /// Holds back `result` unless its cycle was already seen. Returns whether it was accepted.
    fn accept(&mut self, result: CycleResult) -> bool {
        if result.cycle() < self.next_cycle {
            return false;
        }

        match self.pending.entry(result.cycle()) {
            Entry::Vacant(slot) => {
                slot.insert(result.result());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Removes the run of held back results that starts at the next expected cycle.
    fn take_contiguous(&mut self) -> Option<DenseSegment> {
        let base = self.next_cycle;
        let mut codes = Vec::new();

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_cycle {
                break;
            }

            codes.push(entry.remove());
            self.next_cycle = self.next_cycle.saturating_add(1);
        }

        (!codes.is_empty()).then(|| DenseSegment::new(base, codes))
    }
}

impl ContiguousChunker {
    /// Creates a chunker that expects the first result of every recycle to be for
    /// `first_cycle`.
    #[must_use]
    pub fn new(first_cycle: u64, downstream: Vec<Arc<dyn Output>>) -> Self {
        Self {
            downstream,
            first_cycle,
            recycles: Mutex::new(BTreeMap::new()),
        }
    }

    /// The next cycle the chunker is waiting for in `recycle`.
    #[must_use]
    pub fn next_cycle(&self, recycle: u64) -> u64 {
        self.recycles
            .lock()
            .get(&recycle)
            .map_or(self.first_cycle, |sequence| sequence.next_cycle)
    }

    /// The number of results held back because of a gap before them, across all recycles.
    #[must_use]
    pub fn pending_results(&self) -> usize {
        self.recycles
            .lock()
            .values()
            .map(|sequence| sequence.pending.len())
            .sum()
    }

    fn forward(&self, recycle: u64, segment: &CycleResultsSegment) -> Result<(), BoxError> {
        for output in &self.downstream {
            output.on_recycle_result_segment(recycle, segment)?;
        }

        Ok(())
    }
}

impl Output for ContiguousChunker {
    fn on_cycle_result_segment(&self, segment: &CycleResultsSegment) -> Result<(), BoxError> {
        self.on_recycle_result_segment(0, segment)
    }

    fn on_recycle_result_segment(
        &self,
        recycle: u64,
        segment: &CycleResultsSegment,
    ) -> Result<(), BoxError> {
        // Forwarding happens under the lock, which is what keeps the downstream order intact.
        let mut recycles = self.recycles.lock();
        let sequence = recycles
            .entry(recycle)
            .or_insert_with(|| Sequence::new(self.first_cycle));

        for result in segment {
            if !sequence.accept(result) {
                warn!(recycle, cycle = result.cycle(), "ignoring duplicate result");
            }
        }

        let Some(run) = sequence.take_contiguous() else {
            trace!(recycle, pending = sequence.pending.len(), "segment held back");
            return Ok(());
        };

        trace!(recycle, base = run.base(), len = run.codes().len(), "forwarding contiguous run");
        let result = self.forward(recycle, &run.into());
        drop(recycles);
        result
    }

    fn on_activity_def_update(&self, def: &ActivityDef) {
        for output in &self.downstream {
            output.on_activity_def_update(def);
        }
    }

    fn close(&self) -> Result<(), BoxError> {
        let mut recycles = self.recycles.lock();

        for (recycle, sequence) in recycles.iter_mut() {
            if sequence.pending.is_empty() {
                continue;
            }

            let pending = std::mem::take(&mut sequence.pending);
            warn!(
                recycle,
                count = pending.len(),
                expected = sequence.next_cycle,
                "forwarding results that never became contiguous"
            );

            let results: Vec<_> = pending
                .into_iter()
                .map(|(cycle, code)| CycleResult::new(cycle, code))
                .collect();

            self.forward(*recycle, &ArraySegment::from(results).into())?;
        }

        drop(recycles);

        for output in &self.downstream {
            output.close()?;
        }

        Ok(())
    }
}

impl fmt::Debug for ContiguousChunker {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContiguousChunker")
            .field("downstream_count", &self.downstream.len())
            .field("first_cycle", &self.first_cycle)
            .field("recycles", &*self.recycles.lock())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as StdError;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ContiguousChunker: Send, Sync);

    #[derive(Debug, Default)]
    struct Recorder {
        segments: Mutex<Vec<Vec<CycleResult>>>,
        recycles: Mutex<Vec<u64>>,
        closed: Mutex<bool>,
    }

    impl Output for Recorder {
        fn on_cycle_result_segment(&self, segment: &CycleResultsSegment) -> Result<(), BoxError> {
            self.segments.lock().push(segment.iter().collect());
            Ok(())
        }

        fn on_recycle_result_segment(
            &self,
            recycle: u64,
            segment: &CycleResultsSegment,
        ) -> Result<(), BoxError> {
            self.recycles.lock().push(recycle);
            self.on_cycle_result_segment(segment)
        }

        fn close(&self) -> Result<(), BoxError> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    fn chunker() -> (ContiguousChunker, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let chunker = ContiguousChunker::new(0, vec![Arc::clone(&recorder) as Arc<dyn Output>]);
        (chunker, recorder)
    }

    fn dense(base: u64, len: usize) -> CycleResultsSegment {
        DenseSegment::new(base, vec![0; len]).into()
    }

    fn cycles(segment: &[CycleResult]) -> Vec<u64> {
        segment.iter().map(CycleResult::cycle).collect()
    }

    #[test]
    fn in_order_segments_pass_straight_through() {
        let (chunker, recorder) = chunker();

        chunker.on_cycle_result_segment(&dense(0, 3)).unwrap();
        chunker.on_cycle_result_segment(&dense(3, 2)).unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(segments.len(), 2);
        assert_eq!(cycles(&segments[1]), vec![3, 4]);
    }

    #[test]
    fn out_of_order_segments_are_resequenced() {
        let (chunker, recorder) = chunker();

        chunker.on_cycle_result_segment(&dense(6, 3)).unwrap();
        chunker.on_cycle_result_segment(&dense(3, 3)).unwrap();
        assert!(recorder.segments.lock().is_empty());
        assert_eq!(chunker.pending_results(), 6);

        chunker.on_cycle_result_segment(&dense(0, 3)).unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(segments.len(), 1);
        assert_eq!(cycles(&segments[0]), (0..9).collect::<Vec<_>>());
        assert_eq!(chunker.next_cycle(0), 9);
    }

    #[test]
    fn duplicates_are_ignored() {
        let (chunker, recorder) = chunker();

        chunker.on_cycle_result_segment(&dense(0, 2)).unwrap();
        chunker.on_cycle_result_segment(&dense(1, 2)).unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(cycles(&segments[1]), vec![2]);
    }

    #[test]
    fn first_result_for_a_held_back_cycle_wins() {
        let (chunker, recorder) = chunker();

        chunker
            .on_cycle_result_segment(&DenseSegment::new(5, vec![0; 5]).into())
            .unwrap();
        chunker
            .on_cycle_result_segment(&DenseSegment::new(5, vec![9; 5]).into())
            .unwrap();
        chunker
            .on_cycle_result_segment(&DenseSegment::new(0, vec![0; 5]).into())
            .unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(segments.len(), 1);
        assert_eq!(cycles(&segments[0]), (0..10).collect::<Vec<_>>());
        assert!(segments[0].iter().all(|r| r.result() == 0));
    }

    #[test]
    fn recycles_are_sequenced_independently() {
        let (chunker, recorder) = chunker();

        chunker.on_recycle_result_segment(1, &dense(0, 5)).unwrap();
        chunker.on_recycle_result_segment(0, &dense(5, 5)).unwrap();
        assert_eq!(chunker.next_cycle(1), 5);
        assert_eq!(chunker.next_cycle(0), 0);
        assert_eq!(chunker.pending_results(), 5);

        chunker.on_recycle_result_segment(0, &dense(0, 5)).unwrap();
        chunker.on_recycle_result_segment(1, &dense(5, 5)).unwrap();

        assert_eq!(chunker.next_cycle(0), 10);
        assert_eq!(chunker.next_cycle(1), 10);
        assert_eq!(chunker.pending_results(), 0);

        let segments = recorder.segments.lock();
        let forwarded: usize = segments.iter().map(Vec::len).sum();
        assert_eq!(forwarded, 20);
        assert_eq!(*recorder.recycles.lock(), vec![1, 0, 1]);
    }

    #[test]
    fn close_flushes_each_recycle_separately() {
        let (chunker, recorder) = chunker();

        chunker.on_recycle_result_segment(2, &dense(3, 1)).unwrap();
        chunker.on_recycle_result_segment(0, &dense(7, 1)).unwrap();
        chunker.close().unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(segments.len(), 2);
        assert_eq!(cycles(&segments[0]), vec![7]);
        assert_eq!(cycles(&segments[1]), vec![3]);
        assert_eq!(*recorder.recycles.lock(), vec![0, 2]);
    }

    #[test]
    fn close_flushes_gapped_results_and_closes_downstream() {
        let (chunker, recorder) = chunker();

        chunker.on_cycle_result_segment(&dense(5, 1)).unwrap();
        chunker.on_cycle_result_segment(&dense(2, 1)).unwrap();
        chunker.close().unwrap();

        let segments = recorder.segments.lock();
        assert_eq!(segments.len(), 1);
        assert_eq!(cycles(&segments[0]), vec![2, 5]);
        assert!(*recorder.closed.lock());
        assert_eq!(chunker.pending_results(), 0);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("downstream is full")]
    struct Full;

    struct Failing;

    impl Output for Failing {
        fn on_cycle_result_segment(&self, _: &CycleResultsSegment) -> Result<(), BoxError> {
            Err(Box::new(Full))
        }
    }

    #[test]
    fn downstream_errors_propagate() {
        let chunker = ContiguousChunker::new(0, vec![Arc::new(Failing) as Arc<dyn Output>]);

        let error = chunker.on_cycle_result_segment(&dense(0, 1)).unwrap_err();

        assert!(error.is::<Full>());
        assert!(error.source().is_none());
    }
}
