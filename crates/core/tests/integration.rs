//! Integration tests: pipelines driven by real threads and the loopback
//! transport, with the timing parser on the receive path.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use st2110::compliance::Fps;
use st2110::pipeline::TxDoneMeta;
use st2110::registry::{Direction, TimingReport};
use st2110::transport::{LoopbackConfig, LoopbackRx, LoopbackTx};
use st2110::{
    Classification, FrameState, MediaKind, PipelineConfig, RxPipelineConfig, RxTransport,
    SessionRegistry, TxPipeline, VideoGeometry,
};

/// Counts payloads handed back by the application.
#[derive(Default)]
struct Pool {
    released: AtomicUsize,
}

impl RxTransport<Vec<u8>> for Pool {
    fn release(&self, _payload: Vec<u8>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn geometry() -> VideoGeometry {
    VideoGeometry::progressive(1280, 720, Fps::P50, 100)
}

#[test]
fn app_and_transport_threads_hand_off_every_frame() {
    const FRAMES: u32 = 500;
    let config = PipelineConfig {
        block_get: true,
        ..PipelineConfig::for_media(MediaKind::Video, 4)
    };
    let tx = TxPipeline::new(config, vec![vec![0u8; 4]; 4]).expect("pipeline");
    assert_eq!(tx.stats().histogram.free, 4);

    let app = {
        let tx = tx.clone();
        thread::spawn(move || {
            let mut put = 0;
            while put < FRAMES {
                let Some(mut frame) = tx.get_frame() else {
                    continue;
                };
                frame[..].copy_from_slice(&put.to_le_bytes());
                tx.put_frame(frame).expect("put");
                put += 1;
            }
        })
    };

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut seen = Vec::with_capacity(FRAMES as usize);
    while seen.len() < FRAMES as usize {
        assert!(Instant::now() < deadline, "transport starved");
        match tx.next_frame() {
            Some(frame) => {
                let value = u32::from_le_bytes(frame[..].try_into().expect("4 bytes"));
                seen.push((frame.meta().sequence, value));
                let meta = TxDoneMeta {
                    epoch: seen.len() as u64,
                    ..Default::default()
                };
                tx.frame_done(frame, meta).expect("done");
            }
            None => thread::yield_now(),
        }
    }
    app.join().expect("app thread");

    // Strict rotation keeps the put order end to end.
    for (n, &(sequence, value)) in seen.iter().enumerate() {
        assert_eq!(sequence, n as u32);
        assert_eq!(value, n as u32);
    }
    let stats = tx.drain_stats();
    assert_eq!(stats.put, FRAMES as u64);
    assert_eq!(stats.get_success, FRAMES as u64);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.histogram.free, 4);
    assert!(tx.flush_and_close().is_clean());
}

#[test]
fn loopback_end_to_end_with_timing() {
    let registry = SessionRegistry::new();
    let tx = registry
        .create_tx(
            PipelineConfig {
                block_get: true,
                ..PipelineConfig::for_media(MediaKind::Video, 3)
            },
            vec![vec![0u8; 64]; 3],
        )
        .expect("tx session");
    let pool = Arc::new(Pool::default());
    let rx = registry
        .create_rx::<Vec<u8>>(
            RxPipelineConfig {
                framebuff_cnt: 8,
                block_get: true,
                ..Default::default()
            },
            pool.clone(),
        )
        .expect("rx session");

    let mut receiver = LoopbackRx::new(rx.clone(), &geometry()).expect("receiver");
    assert!(registry.attach_timing(rx.session(), receiver.stat_handle()));

    let busy = Arc::new(AtomicUsize::new(0));
    let sink_busy = busy.clone();
    let config = LoopbackConfig {
        tick: Duration::from_millis(2),
        poll_interval: Duration::from_millis(1),
        report_late: false,
        start_epoch: 10_000,
        ..LoopbackConfig::for_geometry(geometry())
    };
    let mut transmit = LoopbackTx::start(tx.clone(), config, move |payload: &Vec<u8>, sent: &TxDoneMeta| {
        if receiver.deliver(payload.clone(), sent, |_| 0).is_err() {
            sink_busy.fetch_add(1, Ordering::SeqCst);
        }
    })
    .expect("loopback");

    for n in 0..5u8 {
        let mut frame = tx.get_frame().expect("tx frame");
        frame[0] = n;
        tx.put_frame(frame).expect("put");
    }

    let sampling = Fps::P50.frame_time_sampling(90_000) as i32;
    for n in 0..5u8 {
        let frame = rx.get_frame().expect("rx frame");
        assert_eq!(frame[0], n);
        assert_eq!(frame.meta().frame_size, 64);
        let timing = frame.timing().expect("timing verdict");
        assert!(timing.epoch >= 10_000);
        match timing.rtp_ts_delta {
            None => assert_eq!(n, 0),
            Some(delta) if delta == sampling => {
                assert_eq!(timing.classification, Classification::Narrow)
            }
            Some(_) => assert_eq!(timing.classification, Classification::Failed),
        }
        rx.put_frame(frame).expect("rx put");
    }

    let summary = transmit.stop();
    assert_eq!(summary.sent, 5);
    assert_eq!(busy.load(Ordering::SeqCst), 0);
    assert_eq!(pool.released.load(Ordering::SeqCst), 5);

    let reports = registry.dump_stats();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].direction, Direction::Tx);
    assert_eq!(reports[0].pipeline.put, 5);
    assert_eq!(reports[1].direction, Direction::Rx);
    match &reports[1].timing {
        Some(TimingReport::Video(stat)) => {
            assert_eq!(stat.frames, 5);
            assert_eq!(stat.packets, 500);
            assert_eq!(stat.verdicts.total(), 5);
            assert!(stat.verdicts.narrow >= 1);
        }
        other => panic!("unexpected timing report {other:?}"),
    }

    assert!(tx.flush_and_close().is_clean());
    let rx_report = rx.flush_and_close();
    assert!(rx_report.is_clean());
    for i in 0..3 {
        assert_eq!(tx.frame_state(i).expect("slot"), FrameState::Free);
    }
}

#[test]
fn close_while_app_holds_frame_reports_it() {
    let config = PipelineConfig {
        flush_retries: 3,
        flush_interval: Duration::from_millis(1),
        ..PipelineConfig::for_media(MediaKind::Ancillary, 2)
    };
    let tx = TxPipeline::new(config, vec![0u8; 2]).expect("pipeline");
    let held = tx.get_frame().expect("frame");

    let report = tx.flush_and_close();
    assert!(!report.is_clean());
    assert_eq!(report.stuck.len(), 1);
    assert_eq!(report.stuck[0].state, FrameState::InUser);
    assert!(tx.get_frame().is_none());
    assert!(tx.put_frame(held).is_err());
}
