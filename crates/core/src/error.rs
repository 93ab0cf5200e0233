//! Error types for the pipeline and compliance library.

use std::fmt;

use crate::pipeline::FrameState;

/// Errors that can occur in the pipeline and compliance library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Contract violation**: [`InvalidState`](Self::InvalidState),
///   [`ForeignHandle`](Self::ForeignHandle), [`Closed`](Self::Closed),
///   [`SlotOutOfRange`](Self::SlotOutOfRange): the caller or the transport
///   handed back a frame the pipeline does not expect. These indicate a bug
///   (double put, stale handle, app/transport desynchronization).
/// - **Configuration**: [`InvalidConfig`](Self::InvalidConfig), rejected at
///   construction time, never at runtime.
///
/// Running out of frames is not an error: `get_frame`/`next_frame` return
/// `None`. A `Wide` or `Failed` timing verdict is not an error either.
#[derive(Debug, thiserror::Error)]
pub enum St2110Error {
    /// A slot transition was requested from a state that does not allow it.
    #[error("{session}: frame {index} is {actual}, expected {expected}")]
    InvalidState {
        session: String,
        index: u16,
        expected: FrameState,
        actual: FrameState,
    },

    /// A handle minted by a different pipeline was handed to this one.
    #[error("{session}: frame handle belongs to another pipeline")]
    ForeignHandle { session: String },

    /// The pipeline has been closed with [`flush_and_close`](crate::TxPipeline::flush_and_close).
    #[error("{0}: pipeline closed")]
    Closed(String),

    /// A transport reported a frame index outside the pipeline's slot array.
    #[error("{session}: frame index {index} out of range (count {count})")]
    SlotOutOfRange {
        session: String,
        index: u16,
        count: u16,
    },

    /// Invalid geometry, sampling or buffer parameters.
    #[error("invalid configuration: {kind}")]
    InvalidConfig { kind: ConfigErrorKind },
}

/// Specific kind of configuration failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// The pipeline was created without any frame buffers.
    NoFrameBuffers,
    /// More frame buffers than a `u16` slot index can address.
    TooManyFrameBuffers(usize),
    /// Buffer count differs from the configured `framebuff_cnt`.
    BufferCountMismatch { configured: u16, supplied: usize },
    /// The geometry reports zero packets per frame.
    ZeroPacketsPerFrame,
    /// Width or height is zero.
    ZeroDimension,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFrameBuffers => write!(f, "no frame buffers"),
            Self::TooManyFrameBuffers(n) => write!(f, "{n} frame buffers exceed the u16 index range"),
            Self::BufferCountMismatch {
                configured,
                supplied,
            } => write!(f, "configured {configured} frame buffers, supplied {supplied}"),
            Self::ZeroPacketsPerFrame => write!(f, "zero packets per frame"),
            Self::ZeroDimension => write!(f, "zero width or height"),
        }
    }
}

impl St2110Error {
    pub(crate) fn config(kind: ConfigErrorKind) -> Self {
        Self::InvalidConfig { kind }
    }

    /// Whether this error reports a caller/transport contract violation.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, Self::InvalidConfig { .. })
    }
}

/// Convenience alias for `Result<T, St2110Error>`.
pub type Result<T> = std::result::Result<T, St2110Error>;
