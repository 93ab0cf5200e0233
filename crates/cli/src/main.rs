use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rand::{Rng, RngExt};
use st2110::compliance::{AudioGeometry, AudioSampling, Fps, PacketTime};
use st2110::pipeline::TxDoneMeta;
use st2110::registry::TimingReport;
use st2110::transport::{LoopbackConfig, LoopbackRx, LoopbackTx, PacketTrace};
use st2110::{
    AudioComplianceEngine, ComplianceEngine, ComplianceSlot, MediaKind, PipelineConfig,
    RxPipelineConfig, RxTransport, SessionRegistry, St2110Error, VideoGeometry,
};

#[derive(Parser)]
#[command(
    name = "st2110-sim",
    about = "Simulate ST 2110 frame pipelines and check sender timing compliance"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a TX pipeline against the loopback transport and receive it back.
    Tx(TxArgs),
    /// Replay a synthetic video packet trace through the timing parser.
    Timing(TimingArgs),
    /// Replay a synthetic audio packet trace through the timing parser.
    AudioTiming(AudioArgs),
}

#[derive(Args, Clone)]
struct VideoArgs {
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Frame rate, e.g. 59.94, 50, p25
    #[arg(long, default_value = "59.94", value_parser = parse_fps)]
    fps: Fps,
    #[arg(long)]
    interlaced: bool,
    #[arg(long, default_value_t = 4320)]
    packets: u32,
}

impl VideoArgs {
    fn geometry(&self) -> VideoGeometry {
        if self.interlaced {
            VideoGeometry::interlaced(self.width, self.height, self.fps, self.packets)
        } else {
            VideoGeometry::progressive(self.width, self.height, self.fps, self.packets)
        }
    }
}

#[derive(Args)]
struct TxArgs {
    #[command(flatten)]
    video: VideoArgs,
    /// Number of frame buffers in each pipeline
    #[arg(long, default_value_t = 3)]
    buffers: u16,
    /// Frames the application sends
    #[arg(long, default_value_t = 120)]
    count: u32,
    /// Wall-clock epoch length in ms (defaults to the frame period)
    #[arg(long)]
    tick_ms: Option<u64>,
    /// Peak packet arrival jitter on the receive side, ns
    #[arg(long, default_value_t = 0)]
    jitter_ns: u32,
}

#[derive(Args)]
struct TimingArgs {
    #[command(flatten)]
    video: VideoArgs,
    #[arg(long, default_value_t = 60)]
    frames: u32,
    /// Peak packet arrival jitter, ns
    #[arg(long, default_value_t = 0)]
    jitter_ns: u32,
    /// Send packets in bursts of this size instead of evenly spaced
    #[arg(long, default_value_t = 1)]
    burst: u32,
}

#[derive(Args)]
struct AudioArgs {
    /// Packet time, e.g. 1ms, 125us
    #[arg(long, default_value = "1ms", value_parser = parse_ptime)]
    ptime: PacketTime,
    /// Sampling rate, 48k or 96k
    #[arg(long, default_value = "48k", value_parser = parse_sampling)]
    sampling: AudioSampling,
    /// Packets per measurement window
    #[arg(long, default_value_t = 1000)]
    packets: u64,
    #[arg(long, default_value_t = 10)]
    windows: u32,
    /// Peak extra delay per packet, ns
    #[arg(long, default_value_t = 0)]
    jitter_ns: u32,
}

fn parse_fps(s: &str) -> Result<Fps, String> {
    Fps::parse(s).ok_or_else(|| format!("unsupported frame rate: {s}"))
}

fn parse_ptime(s: &str) -> Result<PacketTime, String> {
    PacketTime::parse(s).ok_or_else(|| format!("unsupported packet time: {s}"))
}

fn parse_sampling(s: &str) -> Result<AudioSampling, String> {
    match s.trim() {
        "48k" | "48" | "48000" => Ok(AudioSampling::S48k),
        "96k" | "96" | "96000" => Ok(AudioSampling::S96k),
        _ => Err(format!("unsupported sampling rate: {s}")),
    }
}

/// Uniform offset in `[-peak, peak]` ns.
fn jitter(rng: &mut impl Rng, peak: u32) -> i64 {
    if peak == 0 {
        return 0;
    }
    ((rng.random::<f64>() * 2.0 - 1.0) * peak as f64) as i64
}

/// Receive buffers are dropped once the application is done with them.
struct Discard;

impl RxTransport<Vec<u8>> for Discard {
    fn release(&self, _payload: Vec<u8>) {}
}

fn run_tx(args: TxArgs) -> Result<(), St2110Error> {
    let geometry = args.video.geometry();
    let registry = SessionRegistry::new();
    let tx = registry.create_tx(
        PipelineConfig {
            block_get: true,
            ..PipelineConfig::for_media(MediaKind::Video, args.buffers)
        },
        vec![vec![0u8; 1024]; args.buffers as usize],
    )?;
    let rx = registry.create_rx::<Vec<u8>>(
        RxPipelineConfig {
            framebuff_cnt: args.buffers,
            ..Default::default()
        },
        Arc::new(Discard),
    )?;

    let mut receiver = LoopbackRx::new(rx.clone(), &geometry)?;
    registry.attach_timing(rx.session(), receiver.stat_handle());

    let mut config = LoopbackConfig::for_geometry(geometry);
    if let Some(ms) = args.tick_ms {
        config.tick = Duration::from_millis(ms);
    }
    let peak = args.jitter_ns;
    let mut transmit = LoopbackTx::start(tx.clone(), config, move |payload: &Vec<u8>, sent: &TxDoneMeta| {
        let mut rng = rand::rng();
        if let Err(busy) = receiver.deliver(payload.clone(), sent, |_| jitter(&mut rng, peak)) {
            tracing::debug!(rtp = busy.meta.rtp_timestamp, "receiver busy, frame lost");
        }
    })?;

    let mut received = 0u32;
    for n in 0..args.count {
        if let Some(mut frame) = tx.get_frame() {
            frame[..4].copy_from_slice(&n.to_le_bytes());
            tx.put_frame(frame)?;
        }
        while let Some(frame) = rx.get_frame() {
            received += 1;
            rx.put_frame(frame)?;
        }
    }
    let summary = transmit.stop();
    while let Some(frame) = rx.get_frame() {
        received += 1;
        rx.put_frame(frame)?;
    }

    println!(
        "sent {} underruns {} late epochs {} received {received}",
        summary.sent, summary.underruns, summary.late_epochs
    );
    for report in registry.dump_stats() {
        println!("{}", report.pipeline);
        match report.timing {
            Some(TimingReport::Video(stat)) => println!("{stat}"),
            Some(TimingReport::Audio(stat)) => println!("{stat}"),
            None => {}
        }
    }
    tx.flush_and_close();
    rx.flush_and_close();
    Ok(())
}

fn run_timing(args: TimingArgs) -> Result<(), St2110Error> {
    let geometry = args.video.geometry();
    let mut engine = ComplianceEngine::new(&geometry)?;
    let trace = PacketTrace::new(&geometry)?;
    let trs = engine.thresholds().trs;
    let burst = args.burst.max(1);
    let mut rng = rand::rng();
    let mut slot = ComplianceSlot::default();

    // Start far from zero so early jitter cannot underflow.
    let first_epoch = 100_000;
    for epoch in first_epoch..first_epoch + args.frames as u64 {
        let rtp = trace.rtp_timestamp(epoch);
        let packets = trace.frame(epoch, rtp, |i| {
            // Pull packets of a burst forward onto its first packet.
            let bursted = -((i % burst) as f64 * trs) as i64;
            bursted + jitter(&mut rng, args.jitter_ns)
        });
        for p in &packets {
            engine.on_packet(&mut slot, p.rtp_timestamp, p.arrival_ns, p.pkt_idx);
        }
        if let Some(timing) = engine.parse_result(&mut slot) {
            tracing::debug!(epoch, verdict = %timing.classification, cause = %timing.cause, "frame");
        }
    }

    println!("{geometry}");
    println!("{}", engine.drain_stat());
    Ok(())
}

fn run_audio(args: AudioArgs) -> Result<(), St2110Error> {
    let geometry = AudioGeometry {
        ptime: args.ptime,
        sampling: args.sampling,
    };
    let mut engine = AudioComplianceEngine::new(&geometry);
    let ptime = geometry.ptime.ns();
    let samples = geometry.samples_per_packet() as u64;
    let mut rng = rand::rng();

    let mut n = 1_000_000u64;
    for _ in 0..args.windows {
        for _ in 0..args.packets {
            let nominal = (n as f64 * ptime) as u64;
            let delay = jitter(&mut rng, args.jitter_ns).unsigned_abs();
            engine.on_packet((n * samples) as u32, nominal + delay);
            n += 1;
        }
        if let Some(timing) = engine.parse_result() {
            println!("{} ({}) tsdf {} us", timing.classification, timing.cause, timing.tsdf);
        }
    }
    println!("{}", engine.drain_stat());
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Tx(args) => run_tx(args),
        Command::Timing(args) => run_timing(args),
        Command::AudioTiming(args) => run_audio(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
