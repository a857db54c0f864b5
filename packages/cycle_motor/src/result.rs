use std::fmt;

/// The result code recorded for one cycle, as stored in result segments.
///
/// Zero means success. Actions return wider codes, which are narrowed by [`result_code()`].
pub type ResultCode = i8;

/// Recorded when an action completes a cycle without error and reports success.
pub const SUCCESS: ResultCode = 0;

/// Recorded for cycles that were reserved but never executed, e.g. because the motor stopped.
pub const SKIPPED: ResultCode = i8::MIN;

/// Recorded for asynchronous operations that completed with an error.
pub const FAILED: ResultCode = -127;

/// The smallest code an action can record, one above [`FAILED`].
const MIN_ACTION_CODE: i32 = -126;

/// Narrows an action's result code to the stored form.
///
/// Codes outside the storable range saturate to the nearest storable code, which is never one
/// of the reserved codes [`SKIPPED`] and [`FAILED`].
#[must_use]
pub fn result_code(raw: i32) -> ResultCode {
    let clamped = raw.clamp(MIN_ACTION_CODE, i32::from(i8::MAX));

    // Cannot fail after clamping.
    ResultCode::try_from(clamped).unwrap_or(i8::MAX)
}

/// The outcome of one cycle.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CycleResult {
    cycle: u64,
    result: ResultCode,
}

impl CycleResult {
    /// Creates a result for `cycle`.
    #[must_use]
    pub fn new(cycle: u64, result: ResultCode) -> Self {
        Self { cycle, result }
    }

    /// The cycle number.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// The recorded result code.
    #[must_use]
    pub fn result(&self) -> ResultCode {
        self.result
    }

    /// Whether the cycle was never executed.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.result == SKIPPED
    }
}

impl fmt::Display for CycleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.cycle, self.result)
    }
}
