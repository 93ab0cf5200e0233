//! ST 2110-21 timing parser for video senders.

use super::geometry::{NS_PER_S, VideoGeometry};
use super::stat::{ComplianceStat, Metric, StatHandle};
use super::{Classification, ComplianceCause};
use crate::error::Result;

/// Scale applied to the expected drain when computing CINST.
const CINST_DRAIN_FACTOR: f64 = 1.1;
/// One tick of RTP timestamp jitter is tolerated below the epoch.
const RTP_OFFSET_MIN: i64 = -1;
const LATENCY_MAX_NS: i64 = 1_000_000;

/// Model parameters and pass limits derived from a stream geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceThresholds {
    /// Frame period, ns.
    pub frame_time: f64,
    /// Media clock ticks per frame.
    pub frame_time_sampling: f64,
    /// Active share of the frame period.
    pub reactive: f64,
    /// Nominal spacing of two packets, ns.
    pub trs: f64,
    /// Latest allowed first packet after the epoch, ns.
    pub tr_offset: f64,
    pub c_max_narrow: i64,
    pub c_max_wide: i64,
    pub vrx_full_narrow: i64,
    pub vrx_full_wide: i64,
    pub rtp_offset_min: i64,
    pub rtp_offset_max: i64,
    pub latency_max: i64,
    pub rtp_ts_delta_min: i32,
    pub rtp_ts_delta_max: i32,
}

impl ComplianceThresholds {
    pub fn new(geometry: &VideoGeometry) -> Result<Self> {
        geometry.validate()?;

        let fps = geometry.fps;
        let frame_time = fps.frame_time_ns();
        let frame_time_s = fps.frame_time_s();
        let frame_time_sampling = fps.frame_time_sampling(geometry.clock_rate);
        let pkts = geometry.packets_per_frame as f64;
        let height = geometry.height;

        let reactive = if geometry.interlaced && height <= 576 {
            if height == 480 { 487.0 / 525.0 } else { 576.0 / 625.0 }
        } else {
            1080.0 / 1125.0
        };
        let trs = frame_time * reactive / pkts;
        let tr_offset = if !geometry.interlaced {
            if height >= 1080 {
                frame_time * (43.0 / 1125.0)
            } else {
                frame_time * (28.0 / 750.0)
            }
        } else if height == 480 {
            frame_time * (20.0 / 525.0) * 2.0
        } else if height == 576 {
            frame_time * (26.0 / 625.0) * 2.0
        } else {
            frame_time * (22.0 / 1125.0) * 2.0
        };

        let sampling = frame_time_sampling as i32;
        Ok(Self {
            frame_time,
            frame_time_sampling,
            reactive,
            trs,
            tr_offset,
            c_max_narrow: (pkts / (43200.0 * reactive * frame_time_s)).max(4.0) as i64,
            c_max_wide: (pkts / (21600.0 * frame_time_s)).max(16.0) as i64,
            vrx_full_narrow: (pkts / (27000.0 * frame_time_s)).max(8.0) as i64,
            vrx_full_wide: (pkts / (300.0 * frame_time_s)).max(720.0) as i64,
            rtp_offset_min: RTP_OFFSET_MIN,
            rtp_offset_max: (tr_offset / NS_PER_S * geometry.clock_rate as f64).ceil() as i64 + 1,
            latency_max: LATENCY_MAX_NS,
            rtp_ts_delta_min: sampling,
            rtp_ts_delta_max: sampling + 1,
        })
    }

    /// First criterion a frame violates, or [`ComplianceCause::Narrow`].
    pub fn evaluate(&self, timing: &FrameTiming) -> ComplianceCause {
        use ComplianceCause::*;

        if timing.fpt as f64 > self.tr_offset {
            return FptExceedsTrOffset;
        }
        if let Some(delta) = timing.rtp_ts_delta {
            if delta < self.rtp_ts_delta_min {
                return RtpTsDeltaBelowMin;
            }
            if delta > self.rtp_ts_delta_max {
                return RtpTsDeltaAboveMax;
            }
        }
        if timing.rtp_offset < self.rtp_offset_min {
            return RtpOffsetBelowMin;
        }
        if timing.rtp_offset > self.rtp_offset_max {
            return RtpOffsetAboveMax;
        }
        if timing.latency < 0 {
            return LatencyBelowMin;
        }
        if timing.latency > self.latency_max {
            return LatencyAboveMax;
        }
        if timing.vrx.min < 0 {
            return VrxBelowMin;
        }
        if timing.vrx.max > self.vrx_full_wide {
            return VrxAboveWide;
        }
        if timing.cinst.max > self.c_max_wide {
            return CinstAboveWide;
        }
        if timing.cinst.max > self.c_max_narrow {
            return CinstAboveNarrow;
        }
        if timing.vrx.max > self.vrx_full_narrow {
            return VrxAboveNarrow;
        }
        Narrow
    }
}

#[derive(Debug, Clone, Copy)]
struct FirstPacket {
    epoch: u64,
    epoch_ns: u64,
    first_pkt_time: u64,
    fpt: i64,
    rtp_offset: i64,
    latency: i64,
    rtp_ts_delta: Option<i32>,
}

/// Per-frame accumulator fed by [`ComplianceEngine::on_packet`].
///
/// Starts empty and is reset by [`ComplianceEngine::parse_result`].
#[derive(Debug, Clone, Default)]
pub struct ComplianceSlot {
    first: Option<FirstPacket>,
    vrx_prev: i64,
    drained_prev: i64,
    prev_arrival: Option<u64>,
    vrx: Metric,
    cinst: Metric,
    ipt: Metric,
    packets: u32,
}

impl ComplianceSlot {
    pub fn packets(&self) -> u32 {
        self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Epoch index of the frame, once its first packet was seen.
    pub fn epoch(&self) -> Option<u64> {
        self.first.map(|f| f.epoch)
    }
}

/// Timing verdict and metrics of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTiming {
    pub classification: Classification,
    pub cause: ComplianceCause,
    /// Epoch index the first packet fell in.
    pub epoch: u64,
    pub packets: u32,
    /// First packet offset from the epoch, ns.
    pub fpt: i64,
    /// Offset of the RTP timestamp from the epoch's expected timestamp, ticks.
    pub rtp_offset: i64,
    /// `fpt` corrected by `rtp_offset`, ns.
    pub latency: i64,
    /// RTP timestamp step from the previous frame. `None` on the first frame.
    pub rtp_ts_delta: Option<i32>,
    pub vrx: Metric,
    pub cinst: Metric,
    /// Inter-packet time, ns.
    pub ipt: Metric,
}

impl FrameTiming {
    pub fn vrx_avg(&self) -> Option<f64> {
        self.vrx.avg()
    }

    pub fn cinst_avg(&self) -> Option<f64> {
        self.cinst.avg()
    }

    pub fn ipt_avg(&self) -> Option<f64> {
        self.ipt.avg()
    }
}

/// Timing parser for one video stream (one engine per session port).
///
/// `on_packet`/`parse_result` must be driven from a single receive context.
/// The aggregate behind [`stat_handle`](Self::stat_handle) can be drained
/// from any thread.
#[derive(Debug)]
pub struct ComplianceEngine {
    geometry: VideoGeometry,
    thresholds: ComplianceThresholds,
    prev_rtp_timestamp: Option<u32>,
    stat: StatHandle<ComplianceStat>,
}

impl ComplianceEngine {
    /// Derives the model for `geometry`. Fails on zero packets or dimensions.
    pub fn new(geometry: &VideoGeometry) -> Result<Self> {
        let thresholds = ComplianceThresholds::new(geometry)?;
        tracing::info!(
            geometry = %geometry,
            trs = thresholds.trs,
            tr_offset = thresholds.tr_offset,
            c_max_narrow = thresholds.c_max_narrow,
            c_max_wide = thresholds.c_max_wide,
            vrx_full_narrow = thresholds.vrx_full_narrow,
            vrx_full_wide = thresholds.vrx_full_wide,
            rtp_offset_max = thresholds.rtp_offset_max,
            "video timing parser ready"
        );
        Ok(Self {
            geometry: geometry.clone(),
            thresholds,
            prev_rtp_timestamp: None,
            stat: StatHandle::new(),
        })
    }

    pub fn geometry(&self) -> &VideoGeometry {
        &self.geometry
    }

    pub fn thresholds(&self) -> &ComplianceThresholds {
        &self.thresholds
    }

    /// Forgets the previous frame's RTP timestamp, e.g. after a stream restart.
    pub fn reset(&mut self) {
        self.prev_rtp_timestamp = None;
    }

    /// Accounts one packet of the frame accumulated in `slot`.
    ///
    /// `arrival_ns` is the TAI receive time, `pkt_idx` the packet's position
    /// in its frame.
    pub fn on_packet(
        &mut self,
        slot: &mut ComplianceSlot,
        rtp_timestamp: u32,
        arrival_ns: u64,
        pkt_idx: u32,
    ) {
        let th = &self.thresholds;
        let first = match slot.first {
            Some(first) => first,
            None => {
                let epoch = (arrival_ns as f64 / th.frame_time) as u64;
                let epoch_ns = (epoch as f64 * th.frame_time) as u64;
                // Project back to where packet 0 would have arrived, so a
                // frame whose leading packets were lost is judged on time.
                let first_pkt_time = (arrival_ns as f64 - th.trs * pkt_idx as f64).max(0.0);
                let fpt = first_pkt_time as i64 - epoch_ns as i64;
                let expected = (epoch as f64 * th.frame_time_sampling) as u64 as u32;
                let rtp_offset = rtp_timestamp.wrapping_sub(expected) as i32 as f64;
                let rtp_offset_ns = rtp_offset * th.frame_time / th.frame_time_sampling;
                let rtp_ts_delta = self
                    .prev_rtp_timestamp
                    .map(|prev| rtp_timestamp.wrapping_sub(prev) as i32);
                self.prev_rtp_timestamp = Some(rtp_timestamp);

                let first = FirstPacket {
                    epoch,
                    epoch_ns,
                    first_pkt_time: first_pkt_time as u64,
                    fpt,
                    rtp_offset: rtp_offset as i64,
                    latency: (fpt as f64 - rtp_offset_ns) as i64,
                    rtp_ts_delta,
                };
                slot.first = Some(first);
                first
            }
        };

        // Virtual receiver: one packet in, `drained` packets out since tvd.
        let tvd = first.epoch_ns as f64 + th.tr_offset;
        let drained = ((arrival_ns as f64 - tvd + th.trs) / th.trs).floor() as i64;
        let vrx = slot.vrx_prev + 1 - (drained - slot.drained_prev);
        slot.vrx.record(vrx);
        slot.vrx_prev = vrx;
        slot.drained_prev = drained;

        let elapsed = arrival_ns.saturating_sub(first.first_pkt_time) as f64;
        let expected_pkts = (elapsed / th.trs * CINST_DRAIN_FACTOR) as i64;
        slot.cinst.record((pkt_idx as i64 - expected_pkts).max(0));

        if let Some(prev) = slot.prev_arrival {
            slot.ipt.record(arrival_ns as i64 - prev as i64);
        }
        slot.prev_arrival = Some(arrival_ns);
        slot.packets += 1;
    }

    /// Classifies the frame in `slot`, folds it into the aggregate and resets
    /// the slot. Returns `None` for a slot that saw no packet.
    pub fn parse_result(&mut self, slot: &mut ComplianceSlot) -> Option<FrameTiming> {
        let first = slot.first?;
        let mut timing = FrameTiming {
            classification: Classification::Narrow,
            cause: ComplianceCause::Narrow,
            epoch: first.epoch,
            packets: slot.packets,
            fpt: first.fpt,
            rtp_offset: first.rtp_offset,
            latency: first.latency,
            rtp_ts_delta: first.rtp_ts_delta,
            vrx: slot.vrx,
            cinst: slot.cinst,
            ipt: slot.ipt,
        };
        timing.cause = self.thresholds.evaluate(&timing);
        timing.classification = timing.cause.classification();
        *slot = ComplianceSlot::default();

        tracing::trace!(
            epoch = timing.epoch,
            verdict = %timing.classification,
            cause = %timing.cause,
            cinst_max = timing.cinst.max,
            vrx_max = timing.vrx.max,
            "frame timing parsed"
        );
        self.stat.update(|s| s.fold(&timing));
        Some(timing)
    }

    /// Returns and resets the aggregate.
    pub fn drain_stat(&self) -> ComplianceStat {
        self.stat.drain()
    }

    /// Handle for draining the aggregate from another thread.
    pub fn stat_handle(&self) -> StatHandle<ComplianceStat> {
        self.stat.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::geometry::Fps;

    fn hd_engine() -> ComplianceEngine {
        ComplianceEngine::new(&VideoGeometry::progressive(1920, 1080, Fps::P59_94, 4320)).unwrap()
    }

    /// Feeds one frame of epoch `epoch` with the expected RTP timestamp.
    /// `arrival` maps (nominal first-packet time, packet index) to an arrival time.
    fn feed(
        engine: &mut ComplianceEngine,
        epoch: u64,
        arrival: impl Fn(f64, u32) -> f64,
    ) -> FrameTiming {
        let th = engine.thresholds().clone();
        let epoch_ns = (epoch as f64 * th.frame_time) as u64;
        let rtp = (epoch as f64 * th.frame_time_sampling) as u64 as u32;
        let start = epoch_ns as f64 + th.tr_offset;
        let mut slot = ComplianceSlot::default();
        for i in 0..engine.geometry().packets_per_frame {
            let t = arrival(start, i).floor() as u64;
            engine.on_packet(&mut slot, rtp, t, i);
        }
        let timing = engine.parse_result(&mut slot).unwrap();
        assert!(slot.is_empty());
        timing
    }

    #[test]
    fn hd_thresholds() {
        let th = hd_engine().thresholds().clone();
        assert!((th.frame_time - 16_683_333.333).abs() < 0.01);
        assert!((th.trs - 3707.407).abs() < 0.01);
        assert!((th.tr_offset - Fps::P59_94.frame_time_ns() * 43.0 / 1125.0).abs() < 1e-6);
        assert!((th.tr_offset - 637_674.07).abs() < 0.01);
        assert_eq!(th.c_max_narrow, 6);
        assert_eq!(th.c_max_wide, 16);
        assert_eq!(th.vrx_full_narrow, 9);
        assert_eq!(th.vrx_full_wide, 863);
        assert_eq!(th.rtp_offset_max, 59);
        assert_eq!((th.rtp_ts_delta_min, th.rtp_ts_delta_max), (1501, 1502));
    }

    #[test]
    fn interlaced_and_sd_offsets() {
        let ft = Fps::P59_94.frame_time_ns();
        let i1080 =
            ComplianceThresholds::new(&VideoGeometry::interlaced(1920, 1080, Fps::P59_94, 2160)).unwrap();
        assert_eq!(i1080.reactive, 1080.0 / 1125.0);
        assert!((i1080.tr_offset - ft * 22.0 / 1125.0 * 2.0).abs() < 1e-6);

        let i480 = ComplianceThresholds::new(&VideoGeometry::interlaced(720, 480, Fps::P59_94, 300)).unwrap();
        assert_eq!(i480.reactive, 487.0 / 525.0);
        assert!((i480.tr_offset - ft * 20.0 / 525.0 * 2.0).abs() < 1e-6);

        let i576 = ComplianceThresholds::new(&VideoGeometry::interlaced(720, 576, Fps::P50, 360)).unwrap();
        assert_eq!(i576.reactive, 576.0 / 625.0);

        let p720 = ComplianceThresholds::new(&VideoGeometry::progressive(1280, 720, Fps::P50, 2000)).unwrap();
        assert!((p720.tr_offset - Fps::P50.frame_time_ns() * 28.0 / 750.0).abs() < 1e-6);
    }

    #[test]
    fn zero_packets_is_a_config_error() {
        let err = ComplianceEngine::new(&VideoGeometry::progressive(1920, 1080, Fps::P50, 0)).unwrap_err();
        assert!(!err.is_contract_violation());
    }

    #[test]
    fn on_time_trace_is_narrow() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let timing = feed(&mut engine, 1000, |start, i| start + i as f64 * trs);

        assert_eq!(timing.classification, Classification::Narrow);
        assert_eq!(timing.cause, ComplianceCause::Narrow);
        assert_eq!(timing.packets, 4320);
        assert_eq!(timing.cinst.max, 0);
        assert!(timing.vrx.max <= 1);
        assert!(timing.vrx.min >= 0);
        assert_eq!(timing.rtp_offset, 0);
        assert_eq!(timing.rtp_ts_delta, None);
        assert!(timing.latency >= 0 && timing.latency < LATENCY_MAX_NS);
        assert!(timing.ipt_avg().is_some_and(|avg| (avg - trs).abs() < 1.0));
    }

    #[test]
    fn early_first_packet_fails() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let timing = feed(&mut engine, 1000, |start, i| {
            if i == 0 {
                start - 2_000_000.0
            } else {
                start + i as f64 * trs
            }
        });

        assert_eq!(timing.classification, Classification::Failed);
        assert_eq!(timing.cause, ComplianceCause::FptExceedsTrOffset);
        assert_eq!(timing.epoch, 999);
        assert!(timing.fpt as f64 > engine.thresholds().tr_offset);
    }

    #[test]
    fn frame_missing_leading_packets_keeps_first_packet_time() {
        let mut engine = hd_engine();
        let th = engine.thresholds().clone();
        let epoch = 1000u64;
        let epoch_ns = (epoch as f64 * th.frame_time) as u64;
        let rtp = (epoch as f64 * th.frame_time_sampling) as u64 as u32;
        let start = epoch_ns as f64 + th.tr_offset / 2.0;
        let mut slot = ComplianceSlot::default();
        // Packets 0..200 never arrive.
        for i in 200..4320u32 {
            let t = (start + i as f64 * th.trs) as u64;
            engine.on_packet(&mut slot, rtp, t, i);
        }
        let timing = engine.parse_result(&mut slot).unwrap();

        assert_eq!(timing.epoch, epoch);
        assert_eq!(timing.packets, 4120);
        assert!((timing.fpt as f64 - th.tr_offset / 2.0).abs() < 2.0);
        assert_ne!(timing.cause, ComplianceCause::FptExceedsTrOffset);
        assert_eq!(timing.cinst.max, 0);
    }

    #[test]
    fn bursts_are_wide() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let timing = feed(&mut engine, 1000, |start, i| start + (i / 10 * 10) as f64 * trs);

        assert_eq!(timing.classification, Classification::Wide);
        assert_eq!(timing.cause, ComplianceCause::CinstAboveNarrow);
        assert_eq!(timing.cinst.max, 9);
    }

    #[test]
    fn slow_sender_underflows_receiver() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let timing = feed(&mut engine, 1000, |start, i| start + 2.0 * i as f64 * trs);

        assert_eq!(timing.classification, Classification::Failed);
        assert_eq!(timing.cause, ComplianceCause::VrxBelowMin);
        assert!(timing.vrx.min < 0);
    }

    #[test]
    fn consecutive_frames_start_fresh() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let a = feed(&mut engine, 1000, |start, i| start + i as f64 * trs);
        let b = feed(&mut engine, 1001, |start, i| start + i as f64 * trs);

        assert_eq!(a.classification, b.classification);
        assert_eq!(a.cause, b.cause);
        assert_eq!(a.packets, b.packets);
        assert_eq!(a.cinst.max, b.cinst.max);
        assert_eq!(b.rtp_ts_delta, Some(1501));

        let stat = engine.drain_stat();
        assert_eq!(stat.verdicts.narrow, 2);
        assert_eq!(stat.frames, 2);
        assert_eq!(stat.packets, 8640);
        assert_eq!(stat.rtp_ts_delta.count, 1);
        assert_eq!(engine.drain_stat(), ComplianceStat::default());
    }

    #[test]
    fn skipped_frame_breaks_rtp_cadence() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        feed(&mut engine, 1000, |start, i| start + i as f64 * trs);
        let timing = feed(&mut engine, 1002, |start, i| start + i as f64 * trs);
        assert_eq!(timing.rtp_ts_delta, Some(3003));
        assert_eq!(timing.cause, ComplianceCause::RtpTsDeltaAboveMax);
    }

    #[test]
    fn rtp_timestamp_ahead_of_epoch_fails() {
        let mut engine = hd_engine();
        let th = engine.thresholds().clone();
        let epoch = 1000u64;
        let epoch_ns = (epoch as f64 * th.frame_time) as u64;
        let rtp = ((epoch as f64 * th.frame_time_sampling) as u64 as u32).wrapping_add(100);
        let mut slot = ComplianceSlot::default();
        for i in 0..4320u32 {
            let t = (epoch_ns as f64 + th.tr_offset + i as f64 * th.trs) as u64;
            engine.on_packet(&mut slot, rtp, t, i);
        }
        let timing = engine.parse_result(&mut slot).unwrap();
        assert_eq!(timing.rtp_offset, 100);
        assert_eq!(timing.cause, ComplianceCause::RtpOffsetAboveMax);
    }

    #[test]
    fn empty_slot_has_no_verdict() {
        let mut engine = hd_engine();
        let mut slot = ComplianceSlot::default();
        assert!(engine.parse_result(&mut slot).is_none());
        assert_eq!(engine.drain_stat().frames, 0);
    }

    #[test]
    fn stat_handle_drains_across_threads() {
        let mut engine = hd_engine();
        let trs = engine.thresholds().trs;
        let handle = engine.stat_handle();
        feed(&mut engine, 10, |start, i| start + i as f64 * trs);

        let stat = std::thread::spawn(move || handle.drain()).join().unwrap();
        assert_eq!(stat.verdicts.total(), 1);
        assert_eq!(engine.drain_stat().frames, 0);
    }
}
