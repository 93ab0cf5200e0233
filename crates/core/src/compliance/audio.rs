//! ST 2110-30 timing parser for audio senders.
//!
//! Each packet is compared to the epoch of its own packet time: the delta
//! packet vs RTP (`dpvr`) is how late the packet arrived relative to the time
//! its RTP timestamp stands for. The spread of `dpvr` over a measurement
//! window is the timestamped delay factor (`tsdf`). Both are in microseconds.

use std::fmt;

use super::geometry::AudioGeometry;
use super::stat::{Metric, StatHandle, VerdictCounts};
use super::{Classification, ComplianceCause};

const NS_PER_US: f64 = 1_000.0;

/// Pass limits in microseconds, derived from the packet time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioThresholds {
    pub dpvr_narrow: i64,
    pub dpvr_wide: i64,
    pub tsdf_narrow: i64,
    pub tsdf_wide: i64,
}

impl AudioThresholds {
    pub fn new(geometry: &AudioGeometry) -> Self {
        let ptime = geometry.ptime.ns();
        Self {
            dpvr_narrow: (3.0 * ptime / NS_PER_US) as i64,
            dpvr_wide: (19.0 * ptime / NS_PER_US) as i64,
            tsdf_narrow: (ptime / NS_PER_US) as i64,
            tsdf_wide: (17.0 * ptime / NS_PER_US) as i64,
        }
    }

    pub fn evaluate(&self, dpvr: &Metric, tsdf: i64) -> ComplianceCause {
        use ComplianceCause::*;

        if dpvr.min < 0 {
            return DpvrBelowMin;
        }
        if dpvr.max > self.dpvr_wide {
            return DpvrAboveWide;
        }
        if tsdf < 0 {
            return TsdfBelowMin;
        }
        if tsdf > self.tsdf_wide {
            return TsdfAboveWide;
        }
        if dpvr.max > self.dpvr_narrow {
            return DpvrAboveNarrow;
        }
        if tsdf > self.tsdf_narrow {
            return TsdfAboveNarrow;
        }
        Narrow
    }
}

/// Verdict over one measurement window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTiming {
    pub classification: Classification,
    pub cause: ComplianceCause,
    pub packets: u64,
    /// Delta packet vs RTP, us.
    pub dpvr: Metric,
    /// Timestamped delay factor, us.
    pub tsdf: i64,
    /// Inter-packet time, ns.
    pub ipt: Metric,
}

/// Audio compliance aggregate since the last drain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioComplianceStat {
    pub verdicts: VerdictCounts,
    pub packets: u64,
    pub dpvr: Metric,
    pub tsdf: Metric,
    pub ipt: Metric,
}

impl AudioComplianceStat {
    fn fold(&mut self, timing: &AudioTiming) {
        self.verdicts.record(timing.classification);
        self.packets += timing.packets;
        self.dpvr.merge(&timing.dpvr);
        self.tsdf.record(timing.tsdf);
        self.ipt.merge(&timing.ipt);
    }
}

impl fmt::Display for AudioComplianceStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} pkts)", self.verdicts, self.packets)?;
        writeln!(f, "  dpvr(us) {}", self.dpvr)?;
        writeln!(f, "  tsdf(us) {}", self.tsdf)?;
        write!(f, "  ipt(ns)  {}", self.ipt)
    }
}

/// Timing parser for one audio stream.
#[derive(Debug)]
pub struct AudioComplianceEngine {
    geometry: AudioGeometry,
    thresholds: AudioThresholds,
    pkt_time: f64,
    pkt_time_sampling: f64,
    dpvr: Metric,
    ipt: Metric,
    prev_arrival: Option<u64>,
    stat: StatHandle<AudioComplianceStat>,
}

impl AudioComplianceEngine {
    pub fn new(geometry: &AudioGeometry) -> Self {
        let thresholds = AudioThresholds::new(geometry);
        tracing::info!(
            dpvr_narrow = thresholds.dpvr_narrow,
            dpvr_wide = thresholds.dpvr_wide,
            tsdf_narrow = thresholds.tsdf_narrow,
            tsdf_wide = thresholds.tsdf_wide,
            "audio timing parser ready (us)"
        );
        Self {
            geometry: *geometry,
            thresholds,
            pkt_time: geometry.ptime.ns(),
            pkt_time_sampling: geometry.samples_per_packet() as f64,
            dpvr: Metric::default(),
            ipt: Metric::default(),
            prev_arrival: None,
            stat: StatHandle::new(),
        }
    }

    pub fn geometry(&self) -> &AudioGeometry {
        &self.geometry
    }

    pub fn thresholds(&self) -> &AudioThresholds {
        &self.thresholds
    }

    /// Accounts one received packet.
    pub fn on_packet(&mut self, rtp_timestamp: u32, arrival_ns: u64) {
        let epoch = (arrival_ns as f64 / self.pkt_time) as u64;
        let epoch_ns = (epoch as f64 * self.pkt_time) as u64;
        let offset = arrival_ns as f64 - epoch_ns as f64;
        let expected = (epoch as f64 * self.pkt_time_sampling) as u64 as u32;
        let rtp_offset = rtp_timestamp.wrapping_sub(expected) as i32 as f64;
        let latency = offset - rtp_offset * self.pkt_time / self.pkt_time_sampling;
        self.dpvr.record((latency / NS_PER_US) as i64);

        if let Some(prev) = self.prev_arrival {
            self.ipt.record(arrival_ns as i64 - prev as i64);
        }
        self.prev_arrival = Some(arrival_ns);
    }

    /// Classifies the packets seen since the previous call and folds the
    /// result into the aggregate. `None` when no packet arrived.
    pub fn parse_result(&mut self) -> Option<AudioTiming> {
        if self.dpvr.is_empty() {
            return None;
        }
        let dpvr = std::mem::take(&mut self.dpvr);
        let ipt = std::mem::take(&mut self.ipt);
        let tsdf = dpvr.max - dpvr.min;
        let cause = self.thresholds.evaluate(&dpvr, tsdf);
        let timing = AudioTiming {
            classification: cause.classification(),
            cause,
            packets: dpvr.count,
            dpvr,
            tsdf,
            ipt,
        };

        tracing::trace!(verdict = %timing.classification, cause = %cause, tsdf, "audio timing parsed");
        self.stat.update(|s| s.fold(&timing));
        Some(timing)
    }

    pub fn drain_stat(&self) -> AudioComplianceStat {
        self.stat.drain()
    }

    pub fn stat_handle(&self) -> StatHandle<AudioComplianceStat> {
        self.stat.clone()
    }
}
