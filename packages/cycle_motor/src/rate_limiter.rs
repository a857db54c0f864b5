use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::metrics::{RATE_LIMIT_DELAY_US, micros};
use crate::{RateSpec, RateVerb};

/// The smallest active pool, so that very high rates still get some slack for scheduling jitter.
const MIN_ACTIVE_POOL: Duration = Duration::from_millis(1);

/// How many operations worth of time the active pool may hold at most.
const ACTIVE_POOL_OPS: u32 = 5;

/// A blocking admission gate that enforces a target rate across any number of callers.
///
/// The limiter measures time in nanosecond tokens. Time that passes flows into an active pool,
/// each admitted operation takes one operation interval worth of tokens from it. Time that
/// arrives while the active pool is full overflows into a waiting pool, which measures how far
/// behind schedule the callers are. When callers fall behind, part of the backlog is moved back
/// into the active pool (up to the burst ratio), letting them temporarily run faster to catch up.
///
/// [`block()`][Self::block] returns the size of the waiting pool at the moment of admission.
/// That is the scheduling delay the admitted operation would have experienced if it had been
/// issued on time, which the motor adds to its service time measurements.
///
/// Reconfiguration with [`apply_rate_spec()`][Self::apply_rate_spec] is visible to all blocked
/// and future callers. A spec with [`RateVerb::Restart`] discards all accumulated state.
///
/// # Example
///
/// ```
/// use cycle_motor::{RateLimiter, RateSpec};
///
/// let limiter = RateLimiter::new("example", RateSpec::new(1000.0));
///
/// // The first operation is admitted immediately.
/// let delay = limiter.block();
/// assert!(delay.as_millis() < 100);
/// ```
pub struct RateLimiter {
    label: String,
    pools: Mutex<TokenPools>,
    refilled: Condvar,

    blocks: AtomicU64,
    discarded_wait_nanos: AtomicU64,
}

impl RateLimiter {
    /// Creates a limiter that admits one operation immediately and then enforces `spec`.
    #[must_use]
    pub fn new(label: impl Into<String>, spec: RateSpec) -> Self {
        let label = label.into();

        debug!(%label, %spec, "rate limiter created");

        Self {
            label,
            pools: Mutex::new(TokenPools::new(spec, Instant::now())),
            refilled: Condvar::new(),
            blocks: AtomicU64::new(0),
            discarded_wait_nanos: AtomicU64::new(0),
        }
    }

    /// Blocks until the caller may perform one operation.
    ///
    /// Returns the scheduling delay accumulated by all callers of this limiter.
    pub fn block(&self) -> Duration {
        let mut pools = self.pools.lock();

        loop {
            pools.refill(Instant::now());

            if let Some(delay) = pools.take_op() {
                drop(pools);

                self.blocks.fetch_add(1, Ordering::Relaxed);
                RATE_LIMIT_DELAY_US.with(|e| e.observe(micros(delay)));
                return delay;
            }

            let shortfall = pools.shortfall();

            // A reconfiguration wakes us up early so that the new rate applies immediately.
            _ = self.refilled.wait_for(&mut pools, shortfall);
        }
    }

    /// Replaces the target rate, waking up all blocked callers.
    pub fn apply_rate_spec(&self, spec: RateSpec) {
        let mut pools = self.pools.lock();

        if pools.spec == spec && spec.verb() != RateVerb::Restart {
            return;
        }

        debug!(label = %self.label, old = %pools.spec, new = %spec, "rate limiter reconfigured");

        let now = Instant::now();
        pools.refill(now);

        if spec.verb() == RateVerb::Restart {
            let discarded = pools.restart(spec, now);
            self.discarded_wait_nanos
                .fetch_add(discarded, Ordering::Relaxed);
        } else {
            pools.reconfigure(spec);
        }

        drop(pools);
        self.refilled.notify_all();
    }

    /// The currently applied target rate.
    #[must_use]
    pub fn spec(&self) -> RateSpec {
        self.pools.lock().spec
    }

    /// The current scheduling delay: how far behind schedule the callers are.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        let mut pools = self.pools.lock();
        pools.refill(Instant::now());
        Duration::from_nanos(pools.waiting)
    }

    /// The scheduling delay accumulated over the lifetime of the limiter, including delay
    /// discarded by restarts.
    #[must_use]
    pub fn total_wait_time(&self) -> Duration {
        let discarded = self.discarded_wait_nanos.load(Ordering::Relaxed);
        self.wait_time()
            .saturating_add(Duration::from_nanos(discarded))
    }

    /// How many operations this limiter has admitted.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// The label given at creation, used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for RateLimiter {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.pools.lock();

        f.debug_struct("RateLimiter")
            .field("label", &self.label)
            .field("spec", &pools.spec)
            .field("active", &pools.active)
            .field("waiting", &pools.waiting)
            .field("blocks", &self.blocks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Token accounting, all values in nanoseconds.
#[derive(Debug)]
struct TokenPools {
    spec: RateSpec,

    op_nanos: u64,
    max_active: u64,
    max_active_and_burst: u64,

    active: u64,
    waiting: u64,

    last_refill: Instant,
}

impl TokenPools {
    fn new(spec: RateSpec, now: Instant) -> Self {
        let mut pools = Self {
            spec,
            op_nanos: 0,
            max_active: 0,
            max_active_and_burst: 0,
            active: 0,
            waiting: 0,
            last_refill: now,
        };

        pools.reconfigure(spec);
        pools.prime(now);
        pools
    }

    fn reconfigure(&mut self, spec: RateSpec) {
        self.spec = spec;
        self.op_nanos = duration_nanos(spec.op_interval());

        let active_pool = spec
            .op_interval()
            .saturating_mul(ACTIVE_POOL_OPS)
            .max(MIN_ACTIVE_POOL);
        self.max_active = duration_nanos(active_pool);

        #[expect(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "pool sizes are far below the range where f64 loses whole nanoseconds"
        )]
        let with_burst = (self.max_active as f64 * spec.burst_ratio()) as u64;
        self.max_active_and_burst = with_burst.max(self.max_active);

        self.active = self.active.min(self.max_active_and_burst);
    }

    /// Resets all accumulated state, returning the discarded backlog.
    fn restart(&mut self, spec: RateSpec, now: Instant) -> u64 {
        let discarded = self.waiting;

        self.active = 0;
        self.waiting = 0;
        self.reconfigure(spec);
        self.prime(now);

        discarded
    }

    /// Releases one operation worth of tokens so the first caller is not delayed.
    fn prime(&mut self, now: Instant) {
        self.active = self.op_nanos;
        self.last_refill = now;
    }

    fn refill(&mut self, now: Instant) {
        let new_tokens = duration_nanos(now.saturating_duration_since(self.last_refill));
        self.last_refill = now;

        if new_tokens == 0 {
            return;
        }

        let needed = self.max_active.saturating_sub(self.active);
        let to_active = new_tokens.min(needed);
        self.active = self.active.saturating_add(to_active);
        self.waiting = self
            .waiting
            .saturating_add(new_tokens.saturating_sub(to_active));

        if self.waiting == 0 {
            return;
        }

        // Backfill part of the backlog into the burst headroom, in proportion to how much time
        // has passed relative to the size of the active pool.
        #[expect(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "ratio of token counts, fractional nanoseconds are irrelevant"
        )]
        let burst_allowed = {
            let refill_factor = (new_tokens as f64 / self.max_active as f64).min(1.0);
            let max_burst = self.max_active_and_burst.saturating_sub(self.max_active);
            (refill_factor * max_burst as f64) as u64
        };

        let burst_fill = burst_allowed
            .min(self.max_active_and_burst.saturating_sub(self.active))
            .min(self.waiting);

        self.waiting = self.waiting.saturating_sub(burst_fill);
        self.active = self.active.saturating_add(burst_fill);

        trace!(
            new_tokens,
            active = self.active,
            waiting = self.waiting,
            burst_fill,
            "rate limiter refilled"
        );
    }

    fn take_op(&mut self) -> Option<Duration> {
        if self.active < self.op_nanos {
            return None;
        }

        self.active = self.active.saturating_sub(self.op_nanos);
        Some(Duration::from_nanos(self.waiting))
    }

    fn shortfall(&self) -> Duration {
        Duration::from_nanos(self.op_nanos.saturating_sub(self.active).max(1))
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(RateLimiter: Send, Sync);

    fn pools(rate: f64) -> (TokenPools, Instant) {
        let start = Instant::now();
        (TokenPools::new(RateSpec::new(rate), start), start)
    }

    #[test]
    fn first_op_is_free() {
        let (mut pools, _) = pools(1.0);

        assert_eq!(pools.take_op(), Some(Duration::ZERO));
        assert_eq!(pools.take_op(), None);
    }

    #[test]
    fn refill_admits_one_op_per_interval() {
        // 1000 ops/s: 1ms per op, 5ms active pool.
        let (mut pools, start) = pools(1000.0);
        pools.take_op().unwrap();

        pools.refill(start + Duration::from_micros(999));
        assert_eq!(pools.take_op(), None);

        pools.refill(start + Duration::from_millis(1));
        assert_eq!(pools.take_op(), Some(Duration::ZERO));
    }

    #[test]
    fn overflow_goes_to_waiting_pool() {
        let (mut pools, start) = pools(1000.0);
        pools.take_op().unwrap();

        // 20ms pass while nobody asks: 5ms fill the active pool, 15ms overflow and
        // 0.5ms of that is backfilled into the burst headroom.
        pools.refill(start + Duration::from_millis(20));

        assert_eq!(pools.active, 5_500_000);
        assert_eq!(pools.waiting, 14_500_000);

        let delay = pools.take_op().unwrap();
        assert_eq!(delay, Duration::from_nanos(14_500_000));
    }

    #[test]
    fn restart_discards_backlog() {
        let (mut pools, start) = pools(1000.0);
        pools.refill(start + Duration::from_millis(50));
        assert!(pools.waiting > 0);

        let discarded = pools.restart(
            RateSpec::new(10.0).with_verb(RateVerb::Restart),
            start + Duration::from_millis(50),
        );

        assert!(discarded > 0);
        assert_eq!(pools.waiting, 0);
        assert_eq!(pools.active, 100_000_000);
    }

    #[test]
    fn reconfigure_clamps_active_pool() {
        let (mut pools, start) = pools(10.0);
        pools.refill(start + Duration::from_secs(1));
        assert_eq!(pools.active, pools.max_active_and_burst);

        pools.reconfigure(RateSpec::new(10_000.0));

        assert_eq!(pools.max_active, 1_000_000);
        assert!(pools.active <= pools.max_active_and_burst);
    }

    #[test]
    #[cfg_attr(miri, ignore = "timing-sensitive")]
    fn block_paces_callers() {
        let limiter = RateLimiter::new("test", RateSpec::new(200.0));
        let start = Instant::now();

        for _ in 0..21 {
            limiter.block();
        }

        // 20 intervals of 5ms after the free first op.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
        assert_eq!(limiter.blocks(), 21);
    }

    #[test]
    #[cfg_attr(miri, ignore = "timing-sensitive")]
    fn slow_callers_accumulate_delay() {
        let limiter = RateLimiter::new("test", RateSpec::new(1000.0));
        let start = Instant::now();

        let mut last_delay = Duration::ZERO;
        for _ in 0..50 {
            last_delay = limiter.block();
            thread::sleep(Duration::from_millis(2));
        }

        // Callers need at least 100ms for work the schedule allots 50ms for. Most of the
        // difference must show up as delay, the rest is absorbed by the pools.
        let elapsed = start.elapsed();
        assert!(last_delay >= Duration::from_millis(30), "delay {last_delay:?}");
        assert!(last_delay <= elapsed);
        assert!(limiter.total_wait_time() >= last_delay);
    }

    #[test]
    #[cfg_attr(miri, ignore = "timing-sensitive")]
    fn reconfiguration_wakes_blocked_callers() {
        let limiter = Arc::new(RateLimiter::new("test", RateSpec::new(0.1)));
        limiter.block();

        let blocked = thread::spawn({
            let limiter = Arc::clone(&limiter);
            move || limiter.block()
        });

        // At 0.1 ops/s the waiter would sleep for 10 seconds without the update.
        thread::sleep(Duration::from_millis(20));
        limiter.apply_rate_spec(RateSpec::new(1000.0).with_verb(RateVerb::Restart));

        blocked.join().unwrap();
        assert_eq!(limiter.spec().ops_per_sec(), 1000.0);
    }

    #[test]
    fn identical_spec_is_ignored() {
        let limiter = RateLimiter::new("test", RateSpec::new(5.0));
        limiter.block();

        limiter.apply_rate_spec(RateSpec::new(5.0));

        assert_eq!(limiter.blocks(), 1);
        assert_eq!(limiter.label(), "test");
    }
}
