//! Frame-exchange pipelines between an application and a packet transport.
//!
//! A pipeline owns a fixed array of frame slots. Each slot moves through a
//! small state machine and its payload buffer travels *with* the state: the
//! party that holds the state holds the buffer, by value.
//!
//! ## TX slot lifecycle
//!
//! ```text
//! get_frame       Free           -> InUser          (app owns payload)
//! put_frame       InUser         -> Ready           (pipeline owns payload)
//! next_frame      Ready          -> InTransmitting  (transport owns payload)
//! frame_done      InTransmitting -> Free
//! late drop       Ready          -> Free            (newer frame supersedes it)
//! ```
//!
//! ## RX slot lifecycle
//!
//! ```text
//! frame_ready     Free   -> Ready    (transport delivered a complete frame)
//! get_frame       Ready  -> InUser   (app owns payload)
//! put_frame       InUser -> Free     (payload handed back to the transport)
//! ```
//!
//! Any other transition is a contract violation and is reported as
//! [`St2110Error::InvalidState`](crate::St2110Error::InvalidState).
//! Running out of slots is never an error: the calls return `None`.

pub mod config;
pub mod meta;
pub mod notify;
pub mod rx;
pub mod stats;
pub mod tx;

mod slot;

use std::fmt;

pub use config::{PipelineConfig, RxPipelineConfig};
pub use meta::{PacingTimestamp, RxFrameMeta, TimestampFormat, TxDoneMeta, TxFrameMeta};
pub use notify::{ChannelObserver, FrameObserver, PipelineEvent};
pub use rx::{RxBusy, RxFrame, RxPipeline, RxTransport};
pub use stats::{PipelineStats, StateHistogram};
pub use tx::{FlushReport, FrameHandle, StuckFrame, TransmitFrame, TxPipeline};

/// Lifecycle state of a single frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Owned by the pipeline's free pool.
    Free,
    /// Handed to the application.
    InUser,
    /// Filled (TX) or received (RX), waiting for the other side.
    Ready,
    /// Handed to the transport for sending.
    InTransmitting,
}

impl FrameState {
    pub const ALL: [FrameState; 4] = [
        FrameState::Free,
        FrameState::InUser,
        FrameState::Ready,
        FrameState::InTransmitting,
    ];

    /// One-letter tag used in queue-depth reports (`F:2 U:1 R:0 T:1`).
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Free => "F",
            Self::InUser => "U",
            Self::Ready => "R",
            Self::InTransmitting => "T",
        }
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::InUser => "in_user",
            Self::Ready => "ready",
            Self::InTransmitting => "in_transmitting",
        })
    }
}

/// How the transport side picks the next Ready frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    /// Strict rotation: oldest Ready frame from the consumer cursor.
    /// Every produced frame is sent, in order.
    RoundRobin,
    /// Newest Ready frame by sequence number. Older Ready frames found in the
    /// same scan are returned to Free and counted as dropped, so a slow
    /// transport never sends stale data.
    NewestWins,
}

/// Media essence carried by a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// ST 2110-20 uncompressed video.
    Video,
    /// ST 2110-30 PCM audio.
    Audio,
    /// ST 2110-40 ancillary data.
    Ancillary,
}

impl MediaKind {
    /// Frame selection policy the transport uses by default for this essence.
    ///
    /// Audio and ancillary data are pacing-sensitive: a late buffer is worse
    /// than a skipped one.
    pub fn default_policy(self) -> SelectPolicy {
        match self {
            Self::Video => SelectPolicy::RoundRobin,
            Self::Audio | Self::Ancillary => SelectPolicy::NewestWins,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Ancillary => "ancillary",
        }
    }
}

/// Explicit session index, assigned by whoever creates the pipeline
/// (normally [`SessionRegistry`](crate::SessionRegistry)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
