use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// A type-erased error raised by a pluggable component (an action or an output).
///
/// The motor never inspects or wraps these beyond attaching context, so callers can downcast
/// the value they receive back to the concrete type their component raised.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur when configuring or running an activity.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An activity parameter was present but its value could not be interpreted.
    #[error("invalid value for activity parameter '{name}': '{invalid_value}' is invalid: {problem}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,

        /// The value that was rejected.
        invalid_value: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// A required activity parameter was not provided.
    #[error("activity parameter '{name}' is required but was not provided")]
    MissingParameter {
        /// The name of the missing parameter.
        name: String,
    },

    /// The combination of components and parameters cannot be executed.
    ///
    /// This is detected when a motor is constructed, before it ever enters `Running`.
    #[error("invalid activity configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The action failed to initialize before its first cycle.
    #[error("action failed to initialize")]
    ActionInit {
        /// The error raised by the action, unchanged.
        #[source]
        source: BoxError,
    },

    /// The action raised an error while executing a cycle.
    #[error("action failed on cycle {cycle}")]
    Action {
        /// The cycle that was being executed.
        cycle: u64,

        /// The error raised by the action, unchanged.
        #[source]
        source: BoxError,
    },

    /// The output rejected a completed result segment.
    #[error("output failed to accept the result segment starting at cycle {min_cycle}")]
    Output {
        /// The lowest cycle in the rejected segment.
        min_cycle: u64,

        /// The error raised by the output, unchanged.
        #[source]
        source: BoxError,
    },

    /// The output failed to flush or release its resources at the end of the activity.
    #[error("output failed to close")]
    OutputClose {
        /// The error raised by the output, unchanged.
        #[source]
        source: BoxError,
    },

    /// A cycle log could not be decoded.
    #[error("malformed cycle log: {problem}")]
    MalformedCycleLog {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// A motor thread panicked instead of returning.
    #[error("motor in slot {slot} panicked")]
    MotorPanicked {
        /// The worker slot of the motor.
        slot: usize,
    },

    /// An I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Consumes the error and returns the component error it carries, if any.
    ///
    /// Action and output failures carry the exact error value the component raised.
    #[must_use]
    pub fn into_component_error(self) -> Option<BoxError> {
        match self {
            Self::ActionInit { source }
            | Self::Action { source, .. }
            | Self::Output { source, .. }
            | Self::OutputClose { source } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn invalid_parameter(
        name: &str,
        invalid_value: &str,
        problem: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            invalid_value: invalid_value.to_string(),
            problem: problem.into(),
        }
    }

    pub(crate) fn invalid_configuration(problem: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for cycle motor operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
