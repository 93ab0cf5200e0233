//! Per-frame metadata exchanged alongside payloads.

use crate::compliance::FrameTiming;

/// Clock domain of a [`PacingTimestamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// PTP/TAI time in nanoseconds.
    Tai,
    /// Media clock ticks (90 kHz for video, sampling rate for audio).
    MediaClock,
}

/// Application-chosen transmit time for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingTimestamp {
    pub format: TimestampFormat,
    pub value: u64,
}

impl PacingTimestamp {
    pub fn tai(ns: u64) -> Self {
        Self {
            format: TimestampFormat::Tai,
            value: ns,
        }
    }

    pub fn media_clock(ticks: u64) -> Self {
        Self {
            format: TimestampFormat::MediaClock,
            value: ticks,
        }
    }
}

/// What the transport learns about a frame when it takes it with `next_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFrameMeta {
    /// Sequence number assigned at `get_frame` time.
    pub sequence: u32,
    /// Present only when user pacing is enabled and the app set a timestamp.
    pub pacing: Option<PacingTimestamp>,
}

/// Reported by the transport in `frame_done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxDoneMeta {
    /// Epoch index the frame was sent in.
    pub epoch: u64,
    /// RTP timestamp of the frame's packets.
    pub rtp_timestamp: u32,
    /// Transmit time of the first packet, TAI ns.
    pub timestamp: u64,
}

/// Delivered with every received frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RxFrameMeta {
    pub rtp_timestamp: u32,
    /// Sender time derived from the RTP timestamp, TAI ns.
    pub timestamp: u64,
    /// Arrival time of the first packet, TAI ns.
    pub receive_timestamp: u64,
    /// Payload bytes actually received.
    pub frame_size: usize,
    /// Compliance verdict, when the session runs the timing parser.
    pub timing: Option<FrameTiming>,
}
