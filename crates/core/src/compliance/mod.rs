//! Packet-timing compliance parsers.
//!
//! [`ComplianceEngine`] evaluates ST 2110-21 video senders: it replays every
//! packet arrival against a virtual receiver draining at the nominal packet
//! rate and classifies each frame. [`AudioComplianceEngine`] does the same
//! for ST 2110-30 audio with the delta-packet-vs-RTP model.
//!
//! A `Wide` or `Failed` verdict is a regular result, never an error.

pub mod audio;
pub mod geometry;
pub mod stat;
pub mod video;

use std::fmt;

pub use audio::{AudioComplianceEngine, AudioComplianceStat, AudioThresholds, AudioTiming};
pub use geometry::{AudioGeometry, AudioSampling, Fps, PacketTime, VIDEO_CLOCK_RATE, VideoGeometry};
pub use stat::{ComplianceStat, Metric, StatHandle, VerdictCounts};
pub use video::{ComplianceEngine, ComplianceSlot, ComplianceThresholds, FrameTiming};

/// Timing tier of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Within the narrow-sender (tightly paced) limits.
    Narrow,
    /// Within the wide-sender limits only.
    Wide,
    /// Outside the wide limits or misaligned with its epoch.
    Failed,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Narrow => "narrow",
            Self::Wide => "wide",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First criterion that decided a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComplianceCause {
    /// Every check passed.
    Narrow,
    FptExceedsTrOffset,
    RtpTsDeltaBelowMin,
    RtpTsDeltaAboveMax,
    RtpOffsetBelowMin,
    RtpOffsetAboveMax,
    LatencyBelowMin,
    LatencyAboveMax,
    VrxBelowMin,
    VrxAboveWide,
    CinstAboveWide,
    CinstAboveNarrow,
    VrxAboveNarrow,
    DpvrBelowMin,
    DpvrAboveWide,
    TsdfBelowMin,
    TsdfAboveWide,
    DpvrAboveNarrow,
    TsdfAboveNarrow,
}

impl ComplianceCause {
    pub fn classification(self) -> Classification {
        match self {
            Self::Narrow => Classification::Narrow,
            Self::CinstAboveNarrow
            | Self::VrxAboveNarrow
            | Self::DpvrAboveNarrow
            | Self::TsdfAboveNarrow => Classification::Wide,
            _ => Classification::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Narrow => "narrow",
            Self::FptExceedsTrOffset => "fpt exceed tr_offset",
            Self::RtpTsDeltaBelowMin => "rtp_ts_delta exceed min",
            Self::RtpTsDeltaAboveMax => "rtp_ts_delta exceed max",
            Self::RtpOffsetBelowMin => "rtp_offset exceed min",
            Self::RtpOffsetAboveMax => "rtp_offset exceed max",
            Self::LatencyBelowMin => "latency exceed min",
            Self::LatencyAboveMax => "latency exceed max",
            Self::VrxBelowMin => "vrx exceed min",
            Self::VrxAboveWide => "vrx exceed max",
            Self::CinstAboveWide => "cinst exceed max",
            Self::CinstAboveNarrow => "wide as cinst exceed narrow max",
            Self::VrxAboveNarrow => "wide as vrx exceed narrow max",
            Self::DpvrBelowMin => "dpvr exceed min",
            Self::DpvrAboveWide => "dpvr exceed max wide",
            Self::TsdfBelowMin => "tsdf exceed min",
            Self::TsdfAboveWide => "tsdf exceed max wide",
            Self::DpvrAboveNarrow => "dpvr exceed max narrow",
            Self::TsdfAboveNarrow => "tsdf exceed max narrow",
        }
    }
}

impl fmt::Display for ComplianceCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
