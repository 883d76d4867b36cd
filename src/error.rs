//! Error types for pipeline setup and row processing.

use crate::buffer::BufferError;
use crate::limits::LimitExceeded;

/// Convenience result type used across the pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure reported by a caller-supplied pixel callback.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    /// Create an error with a human-readable reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The reason given by the callback.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Top-level error taxonomy for building and running a pipeline.
///
/// Every variant is fatal for the frame being written: the driver stops
/// scheduling work and returns the first error it sees.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The pixel callback refused to initialize.
    #[error("pixel callback initialization failed: {0}")]
    CallbackInit(#[source] CallbackError),

    /// The pixel callback aborted while receiving a batch.
    #[error("pixel callback failed at ({x}, {y}): {source}")]
    Callback {
        /// Output x coordinate of the batch.
        x: usize,
        /// Output y coordinate of the batch.
        y: usize,
        /// Error returned by the callback.
        #[source]
        source: CallbackError,
    },

    /// A buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation {
        /// What the allocation was for.
        what: &'static str,
        /// Requested size.
        bytes: usize,
    },

    /// A configured resource limit was exceeded.
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    /// A caller-supplied buffer is unusable.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Channels that must share dimensions do not.
    #[error("channel {channel} is {actual:?}, expected {expected:?}")]
    ChannelSizeMismatch {
        /// Offending channel index.
        channel: usize,
        /// Its (width, height).
        actual: (usize, usize),
        /// The (width, height) of channel 0.
        expected: (usize, usize),
    },

    /// A stage needs a channel the frame does not have.
    #[error("stage {stage} needs channel {channel}, but the frame has {available}")]
    MissingChannel {
        /// Stage name.
        stage: &'static str,
        /// Channel index the stage asked for.
        channel: usize,
        /// Number of channels in the frame.
        available: usize,
    },

    /// The stage sequence or options are inconsistent.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A stage was asked to process rows before its setup hooks ran.
    #[error("stage {0} processed a row before it was prepared")]
    NotPrepared(&'static str),

    /// The worker pool could not be created or misbehaved.
    #[error("worker pool error: {0}")]
    Pool(String),
}

impl PipelineError {
    /// Build a [`PipelineError::InvalidPipeline`] value.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidPipeline(msg.into())
    }

    /// Build a [`PipelineError::Pool`] value.
    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }
}
