use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;

use thunderscope_bridge::{BridgeReader, DataType, Sample, WaitResult, WaveformServer};

#[derive(Parser)]
#[command(name = "thunderscope-monitor")]
#[command(about = "Watch the acquisitions of a ThunderScope data bridge")]
struct Args {
    /// Name of the bridge to open
    #[arg(short, long, default_value = "scope")]
    bridge: String,

    /// Serve waveforms over TCP on this address instead of printing acquisitions
    #[arg(short, long)]
    listen: Option<String>,

    /// How long to wait for each acquisition
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Consecutive timeouts after which the producer is considered gone
    #[arg(long, default_value_t = 5)]
    grace: u32,

    /// Change the edge trigger level before watching
    #[arg(long, allow_negative_numbers = true, conflicts_with = "set_level_volts")]
    set_level: Option<i32>,

    /// Change the edge trigger level before watching, in volts at the trigger channel's input
    #[arg(long, allow_negative_numbers = true)]
    set_level_volts: Option<f64>,

    /// Show debug information
    #[arg(short, long)]
    verbose: bool,
}

fn range<S: Sample>(samples: &[S]) -> (i32, i32) {
    let min = samples.iter().copied().min().map_or(0, Into::into);
    let max = samples.iter().copied().max().map_or(0, Into::into);
    (min, max)
}

fn watch(reader: &mut BridgeReader, timeout: Duration, grace: u32)
        -> thunderscope_bridge::Result<()> {
    let mut timeouts = 0;
    loop {
        match reader.request_and_wait_for_data(Some(timeout)) {
            WaitResult::Ready => {
                timeouts = 0;
                let region = reader.acquired_region_header()?;
                let (min, max) = match region.data_type {
                    DataType::I8 => range(reader.acquired_channel::<i8>(0)?),
                    DataType::I16 => range(reader.acquired_channel::<i16>(0)?),
                };
                println!("#{:<8} {:<11} {} x {} samples, ch0 {min}..{max}, missed {}",
                    region.sequence,
                    if region.triggered { "triggered" } else { "untriggered" },
                    region.processing.current_channel_count,
                    region.processing.current_channel_data_length,
                    reader.missed_regions());
            }
            WaitResult::Timeout => {
                timeouts += 1;
                log::debug!("no acquisition within {timeout:?} ({timeouts}/{grace})");
                if timeouts >= grace {
                    log::error!("producer of bridge {} is unavailable", reader.name());
                    return Ok(())
                }
            }
            WaitResult::InvalidHandle => {
                log::error!("bridge {} is no longer usable", reader.name());
                return Ok(())
            }
        }
    }
}

fn run(args: &Args) -> thunderscope_bridge::Result<()> {
    let mut reader: BridgeReader = BridgeReader::open(&args.bridge)?;
    let header = reader.header()?;
    println!("bridge {:?}: up to {} channel(s) x {} {:?} samples, {} acquisitions so far",
        args.bridge, header.bridge.max_channel_count, header.bridge.max_channel_data_length,
        header.bridge.channel_data_type, header.monitoring.total_acquisitions);

    let level = match (args.set_level, args.set_level_volts) {
        (Some(level), _) => Some(level),
        (None, Some(volts)) => {
            header.processing.validate(&header.bridge)?;
            let channel = header.processing.trigger_channel as usize;
            Some(header.hardware.volts_to_code(channel, volts)?)
        }
        (None, None) => None,
    };
    if let Some(level) = level {
        let mut processing = header.processing;
        processing.edge.level = level;
        reader.update_config(&header.hardware, &processing)?;
        println!("trigger level set to {level}");
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    match &args.listen {
        Some(addr) => {
            let mut server = WaveformServer::bind(addr.as_str())?.with_request_timeout(timeout);
            println!("serving waveforms on {}", server.local_addr()?);
            server.serve(&mut reader, &AtomicBool::new(false))
        }
        None => watch(&mut reader, timeout, args.grace),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            log::error!("{error}");
            ExitCode::FAILURE
        }
    }
}
