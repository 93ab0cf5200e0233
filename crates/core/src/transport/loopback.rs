//! In-process stand-in for the packet transport.
//!
//! [`LoopbackTx`] owns a thread that drains a [`TxPipeline`] once per epoch,
//! the way a NIC transmit queue would. [`PacketTrace`] and [`LoopbackRx`]
//! play the receive side: a frame is expanded into per-packet arrival times,
//! replayed through a [`ComplianceEngine`] and delivered to an
//! [`RxPipeline`] together with its timing verdict.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::compliance::{
    ComplianceEngine, ComplianceSlot, ComplianceStat, ComplianceThresholds, StatHandle,
    VideoGeometry,
};
use crate::error::Result;
use crate::pipeline::{
    RxBusy, RxFrameMeta, RxPipeline, TimestampFormat, TxDoneMeta, TxFrameMeta, TxPipeline,
};

/// Loopback transport settings.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Stream the epochs and RTP timestamps are derived from.
    pub geometry: VideoGeometry,
    /// Wall-clock time of one epoch. Defaults to the frame period; tests and
    /// the simulator shrink it to run faster than real time.
    pub tick: Duration,
    /// Upper bound of one idle sleep, so `stop` is noticed quickly.
    pub poll_interval: Duration,
    /// Report epochs the thread woke up too late for through
    /// [`TxPipeline::drop_late_frame`].
    pub report_late: bool,
    /// Epoch index of the first tick.
    pub start_epoch: u64,
}

impl LoopbackConfig {
    pub fn for_geometry(geometry: VideoGeometry) -> Self {
        Self {
            tick: Duration::from_nanos(geometry.fps.frame_time_ns() as u64),
            geometry,
            poll_interval: Duration::from_millis(50),
            report_late: true,
            start_epoch: 0,
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::for_geometry(VideoGeometry::default())
    }
}

/// Counters of a stopped [`LoopbackTx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopbackSummary {
    /// Frames handed to the sink and returned with `frame_done`.
    pub sent: u64,
    /// Ticks that found no Ready frame.
    pub underruns: u64,
    /// Epochs skipped because the thread woke up late.
    pub late_epochs: u64,
    /// Frames the pipeline discarded on those late epochs.
    pub late_drops: u64,
    /// Last epoch the thread reached.
    pub last_epoch: u64,
}

/// One packet of a synthetic trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketArrival {
    pub rtp_timestamp: u32,
    /// TAI ns.
    pub arrival_ns: u64,
    pub pkt_idx: u32,
}

/// Expands a frame into the packet arrivals of an ideally paced sender.
///
/// Packet `i` of epoch `e` arrives at `epoch_ns(e) + tr_offset + i * trs`,
/// shifted by a caller-supplied jitter.
#[derive(Debug, Clone)]
pub struct PacketTrace {
    thresholds: ComplianceThresholds,
    packets: u32,
}

impl PacketTrace {
    pub fn new(geometry: &VideoGeometry) -> Result<Self> {
        Ok(Self {
            thresholds: ComplianceThresholds::new(geometry)?,
            packets: geometry.packets_per_frame,
        })
    }

    pub fn packets_per_frame(&self) -> u32 {
        self.packets
    }

    /// Start of `epoch`, TAI ns.
    pub fn epoch_ns(&self, epoch: u64) -> u64 {
        (epoch as f64 * self.thresholds.frame_time) as u64
    }

    /// RTP timestamp a sender stamps on frames of `epoch`.
    pub fn rtp_timestamp(&self, epoch: u64) -> u32 {
        (epoch as f64 * self.thresholds.frame_time_sampling) as u64 as u32
    }

    /// Nominal send time of the first packet of `epoch`, TAI ns.
    pub fn first_packet_ns(&self, epoch: u64) -> u64 {
        (self.epoch_ns(epoch) as f64 + self.thresholds.tr_offset) as u64
    }

    /// Epoch a TAI time falls in.
    pub fn epoch_of(&self, tai_ns: u64) -> u64 {
        (tai_ns as f64 / self.thresholds.frame_time) as u64
    }

    /// Arrivals of one frame. `jitter` maps a packet index to a signed
    /// offset in ns; arrivals never go below zero.
    pub fn frame(
        &self,
        epoch: u64,
        rtp_timestamp: u32,
        mut jitter: impl FnMut(u32) -> i64,
    ) -> Vec<PacketArrival> {
        let start = self.epoch_ns(epoch) as f64 + self.thresholds.tr_offset;
        (0..self.packets)
            .map(|i| {
                let nominal = start + i as f64 * self.thresholds.trs;
                let arrival = (nominal + jitter(i) as f64).max(0.0);
                PacketArrival {
                    rtp_timestamp,
                    arrival_ns: arrival as u64,
                    pkt_idx: i,
                }
            })
            .collect()
    }
}

/// Running transmit thread. Stopped on [`stop`](Self::stop) or drop.
pub struct LoopbackTx {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<LoopbackSummary>>,
    summary: LoopbackSummary,
}

impl LoopbackTx {
    /// Spawns the transmit thread.
    ///
    /// Once per tick the thread takes the next frame, hands it to `sink` with
    /// the metadata it stamps, and returns it with `frame_done`. A frame with
    /// a user pacing timestamp keeps that timestamp.
    pub fn start<T, F>(pipeline: TxPipeline<T>, config: LoopbackConfig, sink: F) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(&T, &TxDoneMeta) + Send + 'static,
    {
        let trace = PacketTrace::new(&config.geometry)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        tracing::info!(
            session = %pipeline.name(),
            geometry = %config.geometry,
            tick = ?config.tick,
            "loopback transmit started"
        );
        let handle = thread::spawn(move || transmit_loop(pipeline, config, trace, sink, flag));
        Ok(Self {
            running,
            handle: Some(handle),
            summary: LoopbackSummary::default(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the thread and waits for it. Idempotent.
    pub fn stop(&mut self) -> LoopbackSummary {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(summary) => self.summary = summary,
                Err(_) => tracing::warn!("loopback transmit thread panicked"),
            }
        }
        self.summary
    }
}

impl Drop for LoopbackTx {
    fn drop(&mut self) {
        self.stop();
    }
}

fn done_meta(trace: &PacketTrace, epoch: u64, frame: &TxFrameMeta) -> TxDoneMeta {
    match frame.pacing {
        Some(p) if p.format == TimestampFormat::Tai => TxDoneMeta {
            epoch: trace.epoch_of(p.value),
            rtp_timestamp: trace.rtp_timestamp(trace.epoch_of(p.value)),
            timestamp: p.value,
        },
        Some(p) => TxDoneMeta {
            epoch,
            rtp_timestamp: p.value as u32,
            timestamp: trace.first_packet_ns(epoch),
        },
        None => TxDoneMeta {
            epoch,
            rtp_timestamp: trace.rtp_timestamp(epoch),
            timestamp: trace.first_packet_ns(epoch),
        },
    }
}

fn transmit_loop<T, F>(
    pipeline: TxPipeline<T>,
    config: LoopbackConfig,
    trace: PacketTrace,
    mut sink: F,
    running: Arc<AtomicBool>,
) -> LoopbackSummary
where
    F: FnMut(&T, &TxDoneMeta),
{
    let mut summary = LoopbackSummary::default();
    let mut epoch = config.start_epoch;
    let mut deadline = Instant::now();
    let tick_ns = config.tick.as_nanos().max(1);

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < deadline {
            thread::sleep((deadline - now).min(config.poll_interval));
            continue;
        }

        let behind = ((now - deadline).as_nanos() / tick_ns) as u64;
        if behind > 0 {
            summary.late_epochs += behind;
            if config.report_late && pipeline.drop_late_frame(behind) {
                summary.late_drops += 1;
            }
            epoch += behind;
        }

        match pipeline.next_frame() {
            Some(frame) => {
                let meta = done_meta(&trace, epoch, frame.meta());
                sink(&*frame, &meta);
                if let Err(e) = pipeline.frame_done(frame, meta) {
                    tracing::warn!(session = %pipeline.name(), error = %e, "loopback transmit stopping");
                    break;
                }
                summary.sent += 1;
            }
            None => summary.underruns += 1,
        }

        summary.last_epoch = epoch;
        epoch += 1;
        deadline = next_deadline(deadline, config.tick, behind);
    }

    tracing::debug!(
        session = %pipeline.name(),
        sent = summary.sent,
        underruns = summary.underruns,
        late_epochs = summary.late_epochs,
        "loopback transmit exited"
    );
    summary
}

/// Deadline of the epoch following the current one and `behind` skipped ones.
fn next_deadline(deadline: Instant, tick: Duration, behind: u64) -> Instant {
    let epochs = u32::try_from(behind).unwrap_or(u32::MAX).saturating_add(1);
    deadline.checked_add(tick.saturating_mul(epochs)).unwrap_or(deadline)
}

/// Receive side: replays frames through the timing parser into an RX pipeline.
pub struct LoopbackRx<T> {
    pipeline: RxPipeline<T>,
    engine: ComplianceEngine,
    trace: PacketTrace,
    slot: ComplianceSlot,
}

impl<T: AsRef<[u8]>> LoopbackRx<T> {
    pub fn new(pipeline: RxPipeline<T>, geometry: &VideoGeometry) -> Result<Self> {
        Ok(Self {
            pipeline,
            engine: ComplianceEngine::new(geometry)?,
            trace: PacketTrace::new(geometry)?,
            slot: ComplianceSlot::default(),
        })
    }

    pub fn pipeline(&self) -> &RxPipeline<T> {
        &self.pipeline
    }

    pub fn trace(&self) -> &PacketTrace {
        &self.trace
    }

    /// Aggregate of every frame delivered so far.
    pub fn stat_handle(&self) -> StatHandle<ComplianceStat> {
        self.engine.stat_handle()
    }

    /// Receives a frame the sender stamped with `sent`.
    ///
    /// Each packet is shifted by `jitter(pkt_idx)` ns. The frame reaches the
    /// application with its [`FrameTiming`](crate::compliance::FrameTiming),
    /// or comes back as [`RxBusy`] when no slot is free.
    pub fn deliver(
        &mut self,
        payload: T,
        sent: &TxDoneMeta,
        jitter: impl FnMut(u32) -> i64,
    ) -> std::result::Result<u16, RxBusy<T>> {
        let packets = self.trace.frame(sent.epoch, sent.rtp_timestamp, jitter);
        for p in &packets {
            self.engine
                .on_packet(&mut self.slot, p.rtp_timestamp, p.arrival_ns, p.pkt_idx);
        }
        let timing = self.engine.parse_result(&mut self.slot);
        let meta = RxFrameMeta {
            rtp_timestamp: sent.rtp_timestamp,
            timestamp: self.trace.epoch_ns(sent.epoch),
            receive_timestamp: packets.first().map_or(0, |p| p.arrival_ns),
            frame_size: payload.as_ref().len(),
            timing,
        };
        self.pipeline.frame_ready(payload, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{Classification, ComplianceCause, Fps};
    use crate::pipeline::{
        ChannelObserver, FrameState, MediaKind, PacingTimestamp, PipelineConfig, PipelineEvent,
        RxPipelineConfig, RxTransport,
    };

    struct Discard;

    impl RxTransport<Vec<u8>> for Discard {
        fn release(&self, _payload: Vec<u8>) {}
    }

    #[test]
    fn deadline_skips_missed_epochs_without_overflow() {
        let tick = Duration::from_millis(1);
        let base = Instant::now();
        assert_eq!(next_deadline(base, tick, 0), base + tick);
        assert_eq!(next_deadline(base, tick, 2), base + tick * 3);

        let stalled = next_deadline(base, tick, u64::from(u32::MAX) + 5);
        assert_eq!(stalled, base + tick * u32::MAX);
        assert!(next_deadline(base, Duration::MAX, 1) >= base);
    }

    fn small_geometry() -> VideoGeometry {
        VideoGeometry::progressive(1280, 720, Fps::P50, 100)
    }

    fn fast_config() -> LoopbackConfig {
        LoopbackConfig {
            tick: Duration::from_millis(2),
            poll_interval: Duration::from_millis(1),
            report_late: false,
            start_epoch: 1000,
            ..LoopbackConfig::for_geometry(small_geometry())
        }
    }

    #[test]
    fn default_tick_is_frame_period() {
        let config = LoopbackConfig::for_geometry(VideoGeometry::progressive(1920, 1080, Fps::P50, 4320));
        assert_eq!(config.tick, Duration::from_millis(20));
        assert!(config.report_late);
    }

    #[test]
    fn trace_follows_nominal_cadence() {
        let trace = PacketTrace::new(&small_geometry()).unwrap();
        let rtp = trace.rtp_timestamp(10);
        assert_eq!(rtp, 18_000);
        let packets = trace.frame(10, rtp, |_| 0);
        assert_eq!(packets.len(), 100);
        assert_eq!(packets[0].arrival_ns, trace.first_packet_ns(10));
        assert!(packets.windows(2).all(|w| w[1].arrival_ns > w[0].arrival_ns));
        assert_eq!(trace.epoch_of(packets[99].arrival_ns), 10);

        let early = trace.frame(0, 0, |_| -1_000_000_000);
        assert!(early.iter().all(|p| p.arrival_ns == 0));
    }

    #[test]
    fn pacing_timestamp_overrides_stamp() {
        let trace = PacketTrace::new(&small_geometry()).unwrap();
        let plain = done_meta(&trace, 7, &TxFrameMeta::default());
        assert_eq!(plain.rtp_timestamp, trace.rtp_timestamp(7));

        let tai = TxFrameMeta {
            sequence: 0,
            pacing: Some(PacingTimestamp::tai(trace.epoch_ns(42) + 5)),
        };
        let meta = done_meta(&trace, 7, &tai);
        assert_eq!(meta.epoch, 42);
        assert_eq!(meta.timestamp, trace.epoch_ns(42) + 5);

        let clock = TxFrameMeta {
            sequence: 0,
            pacing: Some(PacingTimestamp::media_clock(1234)),
        };
        assert_eq!(done_meta(&trace, 7, &clock).rtp_timestamp, 1234);
    }

    #[test]
    fn transmits_ready_frames() {
        let pipeline = TxPipeline::new(
            PipelineConfig::for_media(MediaKind::Video, 3),
            vec![vec![0u8; 8]; 3],
        )
        .unwrap();
        let (observer, events) = ChannelObserver::bounded(64);
        pipeline.set_observer(Arc::new(observer));

        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = move |payload: &Vec<u8>, meta: &TxDoneMeta| {
            let _ = tx.send((payload[0], *meta));
        };
        let mut loopback = LoopbackTx::start(pipeline.clone(), fast_config(), sink).unwrap();

        for n in 1..=3u8 {
            let mut f = pipeline.get_frame().unwrap();
            f[0] = n;
            pipeline.put_frame(f).unwrap();
        }
        let mut sent = Vec::new();
        for _ in 0..3 {
            sent.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        let summary = loopback.stop();
        assert!(!loopback.is_running());

        assert_eq!(sent.iter().map(|(b, _)| *b).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(sent.windows(2).all(|w| w[1].1.epoch > w[0].1.epoch));
        assert!(sent.iter().all(|(_, m)| m.epoch >= 1000));
        assert_eq!(summary.sent, 3);
        assert!(
            events
                .try_iter()
                .any(|e| matches!(e, PipelineEvent::FrameDone(_, _)))
        );
        for i in 0..3 {
            assert_eq!(pipeline.frame_state(i).unwrap(), FrameState::Free);
        }
        assert_eq!(loopback.stop(), summary);
    }

    #[test]
    fn late_wakeup_drops_newest_ready_frame() {
        let config = PipelineConfig {
            drop_when_late: true,
            ..PipelineConfig::for_media(MediaKind::Audio, 2)
        };
        let pipeline = TxPipeline::new(config, vec![0u8; 2]).unwrap();
        let (observer, events) = ChannelObserver::bounded(64);
        pipeline.set_observer(Arc::new(observer));

        let (tx, rx) = crossbeam_channel::unbounded();
        let lp = LoopbackConfig {
            tick: Duration::from_millis(5),
            report_late: true,
            ..fast_config()
        };
        let mut loopback = LoopbackTx::start(pipeline.clone(), lp, move |_: &u8, _: &TxDoneMeta| {
            let _ = tx.send(());
            // Oversleep many ticks while the app queues another frame.
            thread::sleep(Duration::from_millis(60));
        })
        .unwrap();

        let f = pipeline.get_frame().unwrap();
        pipeline.put_frame(f).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let f = pipeline.get_frame().unwrap();
        pipeline.put_frame(f).unwrap();

        let late = std::iter::from_fn(|| events.recv_timeout(Duration::from_secs(2)).ok())
            .find(|e| matches!(e, PipelineEvent::FrameLate { index: Some(_), .. }))
            .unwrap();
        let summary = loopback.stop();

        let PipelineEvent::FrameLate { index, epoch_skipped } = late else {
            unreachable!()
        };
        assert_eq!(index, Some(1));
        assert!(epoch_skipped > 0);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.late_drops, 1);
        assert!(summary.late_epochs >= epoch_skipped);
        assert_eq!(pipeline.stats().dropped, 1);
    }

    #[test]
    fn rx_replay_attaches_timing() {
        let rx = RxPipeline::new(
            RxPipelineConfig {
                framebuff_cnt: 2,
                ..Default::default()
            },
            Arc::new(Discard),
        )
        .unwrap();
        let mut lrx = LoopbackRx::new(rx.clone(), &small_geometry()).unwrap();
        let trace = lrx.trace().clone();
        let sent = |epoch| TxDoneMeta {
            epoch,
            rtp_timestamp: trace.rtp_timestamp(epoch),
            timestamp: trace.first_packet_ns(epoch),
        };

        lrx.deliver(vec![0u8; 32], &sent(500), |_| 0).unwrap();
        lrx.deliver(vec![0u8; 16], &sent(501), |i| if i == 0 { -2_000_000 } else { 0 })
            .unwrap();
        let busy = lrx.deliver(vec![0u8; 4], &sent(502), |_| 0).unwrap_err();
        assert_eq!(busy.payload.len(), 4);

        let a = rx.get_frame().unwrap();
        assert_eq!(a.meta().frame_size, 32);
        assert_eq!(a.meta().rtp_timestamp, trace.rtp_timestamp(500));
        let timing = a.timing().unwrap();
        assert_eq!(timing.classification, Classification::Narrow);
        assert_eq!(timing.epoch, 500);

        let b = rx.get_frame().unwrap();
        assert_eq!(b.timing().unwrap().cause, ComplianceCause::FptExceedsTrOffset);
        rx.put_frame(a).unwrap();
        rx.put_frame(b).unwrap();

        let stat = lrx.stat_handle().drain();
        assert_eq!(stat.frames, 3);
        assert_eq!(stat.verdicts.narrow, 2);
        assert_eq!(stat.verdicts.failed, 1);
    }
}
