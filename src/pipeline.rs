//! Acquisition loop feeding a bridge.
//!
//! Each cycle reads one chunk of interleaved samples, appends every channel to its history, runs
//! the trigger engine over the trigger channel, and commits every capture window that has been
//! completely received. Configuration is re-read from the bridge every cycle; any change of it
//! starts a new session with fresh trigger state and history.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{Error, Result, Sample};
use crate::bridge::BridgeWriter;
use crate::capture::SampleHistory;
use crate::config::{HardwareConfig, ProcessingConfig, TriggerMode};
use crate::sys::{NativeSemaphore, NativeSharedMemory, SemaphoreDriver, SharedMemoryDriver};
use crate::trigger::{Horizontal, TriggerEngine, TriggerResults, build_engine};
use crate::wire::DataRegionHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Samples of each channel consumed per cycle.
    pub chunk_samples: usize,
    /// Size of one hardware transfer. The chunk of a single channel must divide it.
    pub dma_segment_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            chunk_samples: 1 << 16,
            dma_segment_bytes: 1 << 23,
        }
    }
}

impl PipelineConfig {
    fn check<S: Sample>(&self) -> Result<()> {
        let chunk_bytes = self.chunk_samples.saturating_mul(std::mem::size_of::<S>());
        if chunk_bytes == 0 || self.dma_segment_bytes % chunk_bytes != 0 {
            return Err(Error::Config(format!(
                "chunk of {} samples does not divide the DMA segment of {} bytes",
                self.chunk_samples, self.dma_segment_bytes)))
        }
        Ok(())
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cycle {
    pub triggers: usize,
    pub committed: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    start: u64,
    triggered: bool,
}

struct Session<S: Sample> {
    hardware: HardwareConfig,
    processing: ProcessingConfig,
    horizontal: Horizontal,
    engine: Box<dyn TriggerEngine<S>>,
    engine_base: u64, // absolute index of the engine's sample 0
    results: TriggerResults,
    histories: Vec<SampleHistory<S>>,
    interleaved: Vec<S>,
    pending: VecDeque<Capture>,
    next_stream_start: u64,
    last_commit: Instant,
}

impl<S: Sample> Session<S> {
    fn new(hardware: HardwareConfig, processing: ProcessingConfig, config: &PipelineConfig)
            -> Result<Session<S>> {
        if processing.channel_data_type != S::DATA_TYPE {
            return Err(Error::Config(format!("pipeline processes {:?} samples, not {:?}",
                S::DATA_TYPE, processing.channel_data_type)))
        }
        let channels = processing.current_channel_count as usize;
        if processing.trigger_channel as usize >= channels {
            return Err(Error::Config(format!("trigger channel {} is not one of {} channels",
                processing.trigger_channel, channels)))
        }
        let horizontal = processing.horizontal(&hardware)?;
        let engine = build_engine::<S>(&processing, horizontal, hardware.resolution::<S>()?)?;

        // consecutive triggers are at least one capture (window tail plus holdoff) apart
        let spacing = (horizontal.window_width() - horizontal.window_trigger_position()
            + horizontal.additional_holdoff()).saturating_add(1);
        let capacity = (config.chunk_samples as u64 / spacing) as usize + 2;
        let history_len = (horizontal.window_width() as usize) + config.chunk_samples;
        let histories = (0..channels)
            .map(|_| SampleHistory::new(history_len))
            .collect::<Result<Vec<_>>>()?;

        Ok(Session {
            hardware,
            processing,
            horizontal,
            engine,
            engine_base: 0,
            results: TriggerResults::with_capacity(capacity),
            histories,
            interleaved: vec![bytemuck::Zeroable::zeroed(); config.chunk_samples * channels],
            pending: VecDeque::new(),
            next_stream_start: 0,
            last_commit: Instant::now(),
        })
    }

    fn end(&self) -> u64 {
        self.histories[0].end()
    }

    fn oldest(&self) -> u64 {
        self.histories[0].oldest()
    }

    /// Reads one chunk and splits it into the channel histories.
    fn fill(&mut self, source: &mut impl Read, chunk_samples: usize) -> Result<()> {
        source.read_exact(bytemuck::cast_slice_mut(&mut self.interleaved[..]))?;
        let channels = self.histories.len();
        let interleaved = &self.interleaved;
        for (channel, history) in self.histories.iter_mut().enumerate() {
            history.append_with(chunk_samples, |samples| {
                for (sample, frame) in samples.iter_mut().zip(interleaved.chunks_exact(channels)) {
                    *sample = frame[channel];
                }
            })?;
        }
        Ok(())
    }

    /// Runs the trigger over the chunk at `start` and queues the resulting captures.
    fn trigger(&mut self, start: u64, chunk_samples: usize, cycle: &mut Cycle) -> Result<()> {
        let channel = self.processing.trigger_channel as usize;
        let samples = self.histories[channel].read(start, chunk_samples)
            .ok_or_else(|| Error::InvalidParameter(format!("chunk at {start} is not retained")))?;
        let offset = start - self.engine_base;
        let overflow = match self.engine.process(samples, offset, &mut self.results) {
            Ok(()) => false,
            Err(error @ Error::ResultsFull { .. }) => {
                warn!("pipeline: {error}; restarting trigger at {}", start + chunk_samples as u64);
                true
            }
            Err(error) => return Err(error),
        };
        // triggers recorded before an overflow are still valid
        for &trigger in self.results.trigger_indices() {
            let trigger = self.engine_base + trigger;
            cycle.triggers += 1;
            match self.horizontal.window_start(trigger) {
                Some(start) => self.pending.push_back(Capture { start, triggered: true }),
                None => {
                    debug!("pipeline: window of trigger at {trigger} starts before the stream");
                    cycle.dropped += 1;
                }
            }
        }
        if overflow {
            if let Some(trigger) = self.results.lost_trigger() {
                debug!("pipeline: no room for trigger at {}", self.engine_base + trigger);
                cycle.triggers += 1;
                cycle.dropped += 1;
            }
            self.engine.reset();
            self.engine_base = start + chunk_samples as u64;
        }
        Ok(())
    }

    fn schedule_stream(&mut self) {
        let width = self.horizontal.window_width();
        while self.next_stream_start + width <= self.end() {
            self.pending.push_back(Capture { start: self.next_stream_start, triggered: false });
            self.next_stream_start += width;
        }
    }

    fn commit<M: SharedMemoryDriver, D: SemaphoreDriver>(&mut self,
            writer: &mut BridgeWriter<M, D>, capture: Capture) -> Result<u64> {
        let width = self.horizontal.window_width() as usize;
        let region = writer.begin_region();
        for (channel, history) in self.histories.iter().enumerate() {
            let samples = history.read(capture.start, width).ok_or_else(|| Error::InvalidParameter(
                format!("capture at {} is not retained", capture.start)))?;
            let bytes: &[u8] = bytemuck::cast_slice(samples);
            region[channel * bytes.len()..][..bytes.len()].copy_from_slice(bytes);
        }
        let sequence = writer.commit_region(DataRegionHeader {
            hardware: self.hardware,
            processing: self.processing,
            triggered: capture.triggered,
            data_type: S::DATA_TYPE,
            sequence: 0,
        })?;
        self.last_commit = Instant::now();
        debug!("pipeline: committed {} capture at {} as #{sequence}",
            if capture.triggered { "triggered" } else { "untriggered" }, capture.start);
        Ok(sequence)
    }
}

/// Acquisition pipeline producing into a bridge.
pub struct Pipeline<S: Sample, M: SharedMemoryDriver = NativeSharedMemory,
                    D: SemaphoreDriver = NativeSemaphore> {
    writer: BridgeWriter<M, D>,
    config: PipelineConfig,
    session: Session<S>,
    rejected: Option<(HardwareConfig, ProcessingConfig)>,
}

impl<S: Sample, M: SharedMemoryDriver, D: SemaphoreDriver> Pipeline<S, M, D> {
    /// Starts a session with the configuration currently stored in the bridge.
    pub fn new(writer: BridgeWriter<M, D>, config: PipelineConfig) -> Result<Pipeline<S, M, D>> {
        config.check::<S>()?;
        if writer.config().channel_data_type != S::DATA_TYPE {
            return Err(Error::Config(format!("bridge holds {:?} samples, not {:?}",
                writer.config().channel_data_type, S::DATA_TYPE)))
        }
        let session = Session::new(writer.hardware_config()?, writer.processing_config()?,
            &config)?;
        info!("pipeline: started in {:?} mode, {} samples per chunk",
            session.processing.trigger_mode, config.chunk_samples);
        Ok(Pipeline { writer, config, session, rejected: None })
    }

    pub fn writer(&self) -> &BridgeWriter<M, D> {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut BridgeWriter<M, D> {
        &mut self.writer
    }

    pub fn into_writer(self) -> BridgeWriter<M, D> {
        self.writer
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    pub fn mode(&self) -> TriggerMode {
        self.session.processing.trigger_mode
    }

    pub fn horizontal(&self) -> Horizontal {
        self.session.horizontal
    }

    /// Switches to the configuration in the bridge if it changed and is valid.
    fn refresh(&mut self) {
        let (hardware, processing) =
            match (self.writer.hardware_config(), self.writer.processing_config()) {
                (Ok(hardware), Ok(processing)) => (hardware, processing),
                (Err(error), _) | (_, Err(error)) => {
                    warn!("pipeline: cannot read configuration: {error}");
                    return
                }
            };
        if hardware == self.session.hardware && processing == self.session.processing {
            return
        }
        if self.rejected == Some((hardware, processing)) {
            return
        }
        let session = processing.validate(&self.writer.config())
            .and_then(|()| Session::new(hardware, processing, &self.config));
        match session {
            Ok(session) => {
                info!("pipeline: switching to {:?} mode, {:?} trigger on channel {}, {:?}",
                    processing.trigger_mode, processing.trigger_type, processing.trigger_channel,
                    session.horizontal);
                self.session = session;
                self.rejected = None;
            }
            Err(error) => {
                warn!("pipeline: keeping previous configuration: {error}");
                self.rejected = Some((hardware, processing));
            }
        }
    }

    /// Consumes exactly one chunk from `source`.
    pub fn run_cycle(&mut self, source: &mut impl Read) -> Result<Cycle> {
        self.refresh();
        let chunk_samples = self.config.chunk_samples;
        let mut cycle = Cycle::default();
        let session = &mut self.session;
        let start = session.end();
        session.fill(source, chunk_samples)?;
        let end = session.end();

        let mode = session.processing.trigger_mode;
        match mode {
            TriggerMode::Stop => (),
            TriggerMode::Stream => session.schedule_stream(),
            TriggerMode::Normal | TriggerMode::Single | TriggerMode::Auto =>
                session.trigger(start, chunk_samples, &mut cycle)?,
        }

        let width = session.horizontal.window_width();
        let oldest = session.oldest();
        while let Some(&capture) = session.pending.front() {
            if capture.start + width > end {
                break
            }
            session.pending.pop_front();
            if capture.start < oldest {
                cycle.dropped += 1;
                continue
            }
            session.commit(&mut self.writer, capture)?;
            cycle.committed += 1;
            if mode == TriggerMode::Single {
                let processing = ProcessingConfig { trigger_mode: TriggerMode::Stop,
                    ..session.processing };
                self.writer.update_config(&session.hardware, &processing)?;
                session.pending.clear();
                info!("pipeline: single capture done, stopping");
                break
            }
        }

        let auto_timeout = Duration::from_millis(session.processing.auto_timeout_ms as u64);
        // a trigger still waiting for its window tail counts as activity
        if mode == TriggerMode::Auto && cycle.committed == 0 && session.pending.is_empty() &&
                end >= width && session.last_commit.elapsed() >= auto_timeout {
            session.commit(&mut self.writer, Capture { start: end - width, triggered: false })?;
            cycle.committed += 1;
        }

        if cycle.dropped > 0 {
            warn!("pipeline: dropped {} captures", cycle.dropped);
            for _ in 0..cycle.dropped {
                self.writer.record_dropped()?;
            }
        }
        Ok(cycle)
    }

    /// Runs cycles until `stop` is set or `source` is exhausted, and returns the number of cycles.
    pub fn run(&mut self, source: &mut impl Read, stop: &AtomicBool) -> Result<u64> {
        let mut cycles = 0;
        let mut totals = Cycle::default();
        while !stop.load(Ordering::Relaxed) {
            match self.run_cycle(source) {
                Ok(cycle) => {
                    cycles += 1;
                    totals.triggers += cycle.triggers;
                    totals.committed += cycle.committed;
                    totals.dropped += cycle.dropped;
                }
                Err(Error::Io(error)) if error.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("pipeline: source exhausted");
                    break
                }
                Err(error) => return Err(error),
            }
        }
        info!("pipeline: stopped after {cycles} cycles ({} triggers, {} committed, {} dropped)",
            totals.triggers, totals.committed, totals.dropped);
        Ok(cycles)
    }
}
