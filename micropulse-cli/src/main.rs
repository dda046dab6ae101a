use clap::Parser;
use micropulse_lib::{DeviceConfig, DigitisationRate, Frame, MicroPulse};
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Acquisition console for a Peak NDT MicroPulse/LTPA digitiser
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Instrument address
    #[arg(long, default_value = "10.1.1.2")]
    host: String,

    /// Instrument TCP port
    #[arg(long, default_value_t = 1067)]
    port: u16,

    /// MPS configuration file replayed to the instrument
    #[arg(short, long)]
    mps: PathBuf,

    /// Digitisation rate in MHz: 0 (instrument default), 10, 25, 50 or 100
    #[arg(short, long, default_value_t = 0)]
    rate: u32,

    /// Number of single-shot frames to acquire
    #[arg(short, long, default_value_t = 10)]
    count: u32,

    /// Stream continuously instead of issuing single-shot requests
    #[arg(long)]
    continuous: bool,

    /// Streaming duration in seconds
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Target frame rate while streaming, in frames per second
    #[arg(long)]
    fps: Option<f64>,

    /// Settle delay after RST, in seconds
    #[arg(long, default_value_t = 10)]
    settle: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let mut config = DeviceConfig::new(args.host.clone(), args.port, args.mps.clone())
        .with_rate(DigitisationRate::try_from(args.rate)?);
    if let Some(fps) = args.fps {
        if fps <= 0.0 {
            return Err("--fps must be positive".into());
        }
        config = config.with_target_period(Duration::from_secs_f64(1.0 / fps));
    }

    println!("Connecting to MicroPulse at {}:{}...", args.host, args.port);
    let mut device = MicroPulse::new(config);
    let status = device.setup(Duration::from_secs(args.settle)).await?;
    println!(
        "Instrument ready: {:?}, DOF {}, {} MHz",
        status.system_type, status.actual_format, status.actual_rate_mhz
    );

    if args.continuous {
        stream(&mut device, args.duration).await?;
    } else {
        single_shot(&mut device, args.count).await?;
    }

    Ok(())
}

async fn single_shot(device: &mut MicroPulse, count: u32) -> Result<(), Box<dyn Error>> {
    for i in 1..=count {
        device.acquire_once().await?;
        let frame = device.latest_frame().expect("frame just acquired");
        println!(
            "frame {i:>4}: {} A-scans, tests {}..{}, peak {}",
            frame.sub_frames.len(),
            frame.sub_frames.first().map(|sf| sf.header.test_number).unwrap_or(0),
            frame.sub_frames.last().map(|sf| sf.header.test_number).unwrap_or(0),
            frame.max_amplitude
        );
    }
    Ok(())
}

async fn stream(device: &mut MicroPulse, duration: u64) -> Result<(), Box<dyn Error>> {
    device.start_async(None)?;

    let start = Instant::now();
    let mut out = Frame::default();
    let mut frames = 0u64;
    while start.elapsed() < Duration::from_secs(duration) {
        if device.poll_frame(&mut out) {
            frames += 1;
            if frames % 10 == 1 {
                println!(
                    "frame {frames:>6}: {} A-scans, peak {}",
                    out.sub_frames.len(),
                    out.max_amplitude
                );
            }
        } else {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    device.stop_async().await?;

    let elapsed = start.elapsed().as_secs_f64();
    println!("Statistics:");
    println!("  Duration: {elapsed:.1}s");
    println!("  Frames taken: {frames}");
    println!("  Effective rate: {:.1} frames/s", frames as f64 / elapsed);

    Ok(())
}
