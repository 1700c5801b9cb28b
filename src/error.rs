//! Error taxonomy for the playback core
//!
//! Every fallible operation in the pipeline returns [`PipelineError`]. Only a
//! few variants are faults: [`PipelineError::escalates`] tells the controller
//! which ones move it to the `Error` state. The rest are local signals the
//! caller is expected to handle (retry a packet, reposition a demuxer).

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the pipeline error.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors reported by the clock, the component graph, the stream pipelines
/// and the playback controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Unsupported codec, resolution or option at open time. Not retriable.
    #[error("unsupported configuration: {0}")]
    Configuration(String),

    /// Hardware buffers or components unavailable. Retriable after close/reopen.
    #[error("hardware resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Input buffer full; the packet was not enqueued.
    #[error("input buffer full ({used}/{capacity} slots in use)")]
    Backpressure { used: usize, capacity: usize },

    /// A flush or teardown did not complete within its bound.
    #[error("{stage} did not drain within {timeout:?}")]
    StallTimeout { stage: String, timeout: Duration },

    /// Tunnel wiring rule broken (occupied port, double activation,
    /// out-of-order teardown).
    #[error("tunnel violation: {0}")]
    TunnelViolation(String),

    /// The clock moved to a new epoch; the feeder must reposition before
    /// sending more packets.
    #[error("clock discontinuity (epoch {epoch})")]
    Discontinuity { epoch: u64 },

    /// Packet can never fit the input buffer, even when empty.
    #[error("packet of {size} bytes exceeds input capacity of {capacity} bytes")]
    Oversized { size: usize, capacity: usize },

    /// The pipeline is quiesced (seeking, changing rate, or closed).
    #[error("pipeline is not accepting packets")]
    Quiesced,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A blocking wait was interrupted by close.
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether this error moves the controller into the `Error` state.
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            PipelineError::ResourceExhausted(_)
                | PipelineError::StallTimeout { .. }
                | PipelineError::TunnelViolation(_)
        )
    }

    /// Whether the caller may simply retry the same operation later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PipelineError::Backpressure { .. }
                | PipelineError::Quiesced
                | PipelineError::Discontinuity { .. }
        )
    }

    pub(crate) fn invalid_state(operation: &'static str, state: impl ToString) -> Self {
        PipelineError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}
