use std::f32::consts::PI;
use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use thunderscope_bridge::{
    BridgeConfig, BridgeWriter, BurstParameters, DataType, EdgeParameters, EnabledChannels,
    HardwareConfig, MAX_CHANNELS, Pipeline, PipelineConfig, ProcessingConfig, TriggerMode,
    TriggerType,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Stop,
    Normal,
    Single,
    Auto,
    Stream,
}

impl From<Mode> for TriggerMode {
    fn from(mode: Mode) -> TriggerMode {
        match mode {
            Mode::Stop => TriggerMode::Stop,
            Mode::Normal => TriggerMode::Normal,
            Mode::Single => TriggerMode::Single,
            Mode::Auto => TriggerMode::Auto,
            Mode::Stream => TriggerMode::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Slope {
    Rising,
    Falling,
    Any,
    Burst,
}

impl From<Slope> for TriggerType {
    fn from(slope: Slope) -> TriggerType {
        match slope {
            Slope::Rising => TriggerType::RisingEdge,
            Slope::Falling => TriggerType::FallingEdge,
            Slope::Any => TriggerType::AnyEdge,
            Slope::Burst => TriggerType::Burst,
        }
    }
}

#[derive(Parser)]
#[command(name = "thunderscope-producer")]
#[command(about = "Feed a ThunderScope data bridge from a synthetic sine source")]
struct Args {
    /// Name of the bridge to create
    #[arg(short, long, default_value = "scope")]
    bridge: String,

    /// Number of interleaved channels
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=4))]
    channels: u8,

    /// Samples per channel in each captured window
    #[arg(long, default_value_t = 1000)]
    length: u32,

    /// Largest window the bridge is sized for
    #[arg(long, default_value_t = 1_000_000)]
    max_length: u32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1_000_000_000)]
    rate: u64,

    /// Frequency of the generated sine in Hz
    #[arg(long, default_value_t = 1_000_000.0)]
    frequency: f32,

    /// Trigger level in ADC codes
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    level: i32,

    /// Trigger hysteresis in ADC codes
    #[arg(long, default_value_t = 5)]
    hysteresis: u32,

    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    #[arg(long, value_enum, default_value_t = Slope::Rising)]
    trigger: Slope,

    /// Position of the trigger within the window in nanoseconds
    #[arg(long, default_value_t = 0)]
    delay_ns: u64,

    /// Samples per channel consumed per cycle
    #[arg(long, default_value_t = 1 << 16)]
    chunk: usize,

    /// Number of chunks to generate; 0 runs forever
    #[arg(long, default_value_t = 0)]
    cycles: u64,

    /// Show debug information
    #[arg(short, long)]
    verbose: bool,
}

/// Interleaved sines, one per channel, a quarter period apart.
struct SineGenerator {
    channels: usize,
    next_channel: usize,
    phase: f32,
    step: f32,
    seconds_per_frame: f64,
}

impl SineGenerator {
    fn new(channels: usize, frequency: f32, rate: u64) -> SineGenerator {
        SineGenerator {
            channels,
            next_channel: 0,
            phase: 0.0,
            step: 2.0 * PI * frequency / rate as f32,
            seconds_per_frame: 1.0 / rate as f64,
        }
    }
}

impl Read for SineGenerator {
    fn read(&mut self, data: &mut [u8]) -> std::io::Result<usize> {
        for sample in data.iter_mut() {
            let phase = self.phase + self.next_channel as f32 * PI / 2.0;
            *sample = (phase.sin() * 100.0) as i8 as u8;
            self.next_channel += 1;
            if self.next_channel == self.channels {
                self.next_channel = 0;
                self.phase = (self.phase + self.step) % (2.0 * PI);
            }
        }
        // pace the output at the configured sample rate
        let frames = data.len() / self.channels;
        std::thread::sleep(Duration::from_secs_f64(frames as f64 * self.seconds_per_frame));
        Ok(data.len())
    }
}

fn main() -> thunderscope_bridge::Result<()> {
    let args = Args::parse();
    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let bridge = BridgeConfig {
        max_channel_count: MAX_CHANNELS as u8,
        max_channel_data_length: args.max_length,
        channel_data_type: DataType::I8,
    };
    let hardware = HardwareConfig {
        sample_rate_hz: args.rate,
        enabled_channels: (0..args.channels as usize).map(EnabledChannels::channel).collect(),
        ..Default::default()
    };
    let processing = ProcessingConfig {
        current_channel_count: args.channels,
        current_channel_data_length: args.length,
        trigger_mode: args.mode.into(),
        trigger_type: args.trigger.into(),
        trigger_delay_fs: args.delay_ns * 1_000_000,
        edge: EdgeParameters { level: args.level, hysteresis: args.hysteresis },
        burst: BurstParameters {
            window_high: args.level + args.hysteresis as i32,
            window_low: args.level - args.hysteresis as i32,
            ..ProcessingConfig::default().burst
        },
        channel_data_type: DataType::I8,
        ..Default::default()
    };

    let mut writer: BridgeWriter = BridgeWriter::create(&args.bridge, bridge)?;
    writer.update_config(&hardware, &processing)?;
    let config = PipelineConfig {
        chunk_samples: args.chunk,
        dma_segment_bytes: args.chunk * args.channels as usize,
    };
    let mut pipeline = Pipeline::<i8>::new(writer, config)?;
    println!("producing into bridge {:?}: {} channel(s) x {} samples, {:?} mode",
        args.bridge, args.channels, args.length, pipeline.mode());

    let mut generator = SineGenerator::new(args.channels as usize, args.frequency, args.rate);
    let stop = AtomicBool::new(false);
    let cycles = if args.cycles == 0 {
        pipeline.run(&mut generator, &stop)?
    } else {
        let bytes = args.cycles * (args.chunk * args.channels as usize) as u64;
        pipeline.run(&mut (&mut generator).take(bytes), &stop)?
    };

    let monitoring = pipeline.writer().monitoring();
    println!("{} cycles, {} acquisitions committed, {} dropped",
        cycles, monitoring.total_acquisitions, monitoring.dropped_acquisitions);
    Ok(())
}
