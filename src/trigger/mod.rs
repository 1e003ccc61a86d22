//! Streaming trigger detectors with hysteresis re-arm, holdoff, and capture window placement.
//!
//! Every detector follows the same three-state machine:
//!
//! * `Unarmed → Armed` when the signal satisfies the detector's arm condition. For an edge trigger
//!   this is leaving the hysteresis band on the side opposite to the edge; this is the debounce
//!   that prevents re-triggering on noise around the level.
//! * `Armed → Capturing` at the sample that satisfies the trigger condition. The absolute index of
//!   that sample is recorded, together with the capture end index
//!   `trigger + window_width - window_trigger_position + additional_holdoff`.
//! * `Capturing → Unarmed` once the stream position reaches the capture end index. Samples before
//!   that are not examined at all, so a second pulse inside the window never re-triggers.
//!
//! All indices are absolute: they count samples since the last reset, and state carries across
//! chunk boundaries exactly as if the whole stream had been passed as a single chunk.

mod edge;
mod any_edge;
mod burst;

use crate::{Error, Result};
use crate::config::{ProcessingConfig, TriggerType};
use crate::sample::{Resolution, Sample};

pub use edge::EdgeDetector;
pub use any_edge::AnyEdgeDetector;
pub use burst::BurstDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising  = 0b01,
    Falling = 0b10,
}

/// Level and hysteresis of an edge trigger, in the same scale as the compared samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeParameters {
    pub level: i32,
    pub hysteresis: u32,
}

/// A burst trigger fires when the signal leaves `window_low..=window_high` after having stayed
/// inside it for at least `min_in_range_period` consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BurstParameters {
    pub window_high: i32,
    pub window_low: i32,
    pub min_in_range_period: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unarmed,
    Armed,
    Capturing,
}

/// Placement of the capture window around each trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizontal {
    window_width: u64,
    window_trigger_position: u64,
    additional_holdoff: u64,
}

impl Horizontal {
    /// Validates the window placement. `window_trigger_position` is the offset of the trigger
    /// sample within the window (0 puts the trigger at the window start) and must be less than
    /// `window_width`. The distance from a trigger to its capture end must fit in a `u64`.
    pub fn new(window_width: u64, window_trigger_position: u64, additional_holdoff: u64)
            -> Result<Horizontal> {
        if window_trigger_position >= window_width {
            return Err(Error::InvalidHorizontal {
                width: window_width,
                trigger_position: window_trigger_position,
            })
        }
        if (window_width - window_trigger_position).checked_add(additional_holdoff).is_none() {
            return Err(Error::InvalidParameter(format!(
                "additional holdoff of {} samples is out of range", additional_holdoff)))
        }
        Ok(Horizontal { window_width, window_trigger_position, additional_holdoff })
    }

    pub fn window_width(&self) -> u64 {
        self.window_width
    }

    pub fn window_trigger_position(&self) -> u64 {
        self.window_trigger_position
    }

    pub fn additional_holdoff(&self) -> u64 {
        self.additional_holdoff
    }

    /// Absolute index at which the trigger re-enters `Unarmed` after firing at `trigger`.
    pub fn capture_end(&self, trigger: u64) -> u64 {
        let span = self.window_width - self.window_trigger_position + self.additional_holdoff;
        trigger.saturating_add(span)
    }

    /// Absolute index of the first sample of the window for a trigger at `trigger`, or `None`
    /// if the window would start before the stream did.
    pub fn window_start(&self, trigger: u64) -> Option<u64> {
        trigger.checked_sub(self.window_trigger_position)
    }
}

/// Caller-allocated, fixed-capacity storage for the events of one `process` call.
#[derive(Debug, Clone)]
pub struct TriggerResults {
    arm_indices: Box<[u64]>,
    arm_count: usize,
    trigger_indices: Box<[u64]>,
    trigger_count: usize,
    capture_end_indices: Box<[u64]>,
    capture_end_count: usize,
    lost_trigger: Option<u64>,
}

impl TriggerResults {
    pub fn with_capacity(capacity: usize) -> TriggerResults {
        TriggerResults {
            arm_indices: vec![0; capacity].into_boxed_slice(),
            arm_count: 0,
            trigger_indices: vec![0; capacity].into_boxed_slice(),
            trigger_count: 0,
            capture_end_indices: vec![0; capacity].into_boxed_slice(),
            capture_end_count: 0,
            lost_trigger: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.trigger_indices.len()
    }

    pub fn arm_indices(&self) -> &[u64] {
        &self.arm_indices[..self.arm_count]
    }

    pub fn trigger_indices(&self) -> &[u64] {
        &self.trigger_indices[..self.trigger_count]
    }

    pub fn capture_end_indices(&self) -> &[u64] {
        &self.capture_end_indices[..self.capture_end_count]
    }

    /// Absolute index of the trigger that found no room, after `Error::ResultsFull`. The
    /// triggers recorded before it are still valid.
    pub fn lost_trigger(&self) -> Option<u64> {
        self.lost_trigger
    }

    pub fn clear(&mut self) {
        self.arm_count = 0;
        self.trigger_count = 0;
        self.capture_end_count = 0;
        self.lost_trigger = None;
    }

    fn append(slots: &mut [u64], count: &mut usize, index: u64) -> Result<()> {
        match slots.get_mut(*count) {
            Some(slot) => {
                *slot = index;
                *count += 1;
                Ok(())
            }
            None => Err(Error::ResultsFull { capacity: slots.len() })
        }
    }

    fn push_arm(&mut self, index: u64) -> Result<()> {
        Self::append(&mut self.arm_indices, &mut self.arm_count, index)
    }

    fn push_trigger(&mut self, index: u64, capture_end: u64) -> Result<()> {
        // check both before writing either, so the two arrays stay parallel
        if self.trigger_count == self.trigger_indices.len() ||
                self.capture_end_count == self.capture_end_indices.len() {
            self.lost_trigger = Some(index);
            return Err(Error::ResultsFull { capacity: self.capacity() })
        }
        Self::append(&mut self.trigger_indices, &mut self.trigger_count, index)?;
        Self::append(&mut self.capture_end_indices, &mut self.capture_end_count, capture_end)
    }
}

/// The detector-specific half of a trigger: the arm and trigger predicates.
///
/// Detectors may keep state across calls (e.g. a run length); `disarm` is called every time the
/// engine re-enters `Unarmed` and `prime` when it is reset to the start of a session.
pub trait Detector<S: Sample>: Send {
    /// Whether a freshly reset engine starts out `Armed` rather than `Unarmed`.
    fn starts_armed(&self) -> bool;

    /// Returns the offset of the sample that arms the detector.
    fn find_arm(&mut self, samples: &[S]) -> Option<usize>;

    /// Returns the offset of the sample that fires the trigger. Only called while armed.
    fn find_trigger(&mut self, samples: &[S]) -> Option<usize>;

    fn disarm(&mut self);

    fn prime(&mut self);
}

/// A streaming trigger engine over samples of type `S`.
pub trait TriggerEngine<S: Sample>: Send {
    /// Replaces the window placement and resets the engine state.
    fn set_horizontal(&mut self, horizontal: Horizontal);

    /// Consumes `chunk` in full. `channel_offset` is the absolute index of `chunk[0]`, which must
    /// equal the number of samples consumed since the last reset.
    ///
    /// `results` is cleared on entry and describes the events of this call only. If it runs out
    /// of capacity, `Error::ResultsFull` is returned and the engine must be reset before use.
    fn process(&mut self, chunk: &[S], channel_offset: u64, results: &mut TriggerResults)
        -> Result<()>;

    /// Re-arms the engine at absolute position 0, keeping the window placement.
    fn reset(&mut self);

    /// Absolute index of the next sample the engine expects.
    fn position(&self) -> u64;

    fn state(&self) -> State;
}

/// Drives a [`Detector`] through the shared three-state machine.
#[derive(Debug, Clone)]
pub struct Trigger<D> {
    detector: D,
    horizontal: Option<Horizontal>,
    state: State,
    position: u64,
    capture_end: u64,
}

pub type EdgeTrigger<S> = Trigger<EdgeDetector<S>>;
pub type AnyEdgeTrigger<S> = Trigger<AnyEdgeDetector<S>>;
pub type BurstTrigger<S> = Trigger<BurstDetector<S>>;

impl<D> Trigger<D> {
    fn with_detector<S: Sample>(mut detector: D) -> Trigger<D> where D: Detector<S> {
        detector.prime();
        let state = if detector.starts_armed() { State::Armed } else { State::Unarmed };
        Trigger { detector, horizontal: None, state, position: 0, capture_end: 0 }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn horizontal(&self) -> Option<Horizontal> {
        self.horizontal
    }
}

impl<S: Sample, D: Detector<S>> TriggerEngine<S> for Trigger<D> {
    fn set_horizontal(&mut self, horizontal: Horizontal) {
        self.horizontal = Some(horizontal);
        self.reset();
    }

    fn process(&mut self, chunk: &[S], channel_offset: u64, results: &mut TriggerResults)
            -> Result<()> {
        results.clear();
        let horizontal = self.horizontal.ok_or(Error::HorizontalNotSet)?;
        if channel_offset != self.position {
            return Err(Error::Discontinuity { expected: self.position, found: channel_offset })
        }

        let base = self.position;
        let mut index = 0;
        while index < chunk.len() {
            match self.state {
                State::Capturing => {
                    let remaining = self.capture_end.saturating_sub(base + index as u64);
                    let available = (chunk.len() - index) as u64;
                    if remaining >= available {
                        index = chunk.len();
                    } else {
                        index += remaining as usize;
                        self.state = State::Unarmed;
                        self.detector.disarm();
                    }
                }
                State::Unarmed => match self.detector.find_arm(&chunk[index..]) {
                    Some(offset) => {
                        index += offset;
                        results.push_arm(base + index as u64)?;
                        self.state = State::Armed;
                        index += 1;
                    }
                    None => index = chunk.len(),
                },
                State::Armed => match self.detector.find_trigger(&chunk[index..]) {
                    Some(offset) => {
                        index += offset;
                        let trigger = base + index as u64;
                        let capture_end = horizontal.capture_end(trigger);
                        results.push_trigger(trigger, capture_end)?;
                        self.capture_end = capture_end;
                        self.state = State::Capturing;
                        index += 1;
                    }
                    None => index = chunk.len(),
                },
            }
        }
        self.position = base + chunk.len() as u64;
        Ok(())
    }

    fn reset(&mut self) {
        self.detector.prime();
        self.state = if self.detector.starts_armed() { State::Armed } else { State::Unarmed };
        self.position = 0;
        self.capture_end = 0;
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn state(&self) -> State {
        self.state
    }
}

/// Builds the engine selected by `config`, with the window placement already applied.
pub fn build_engine<S: Sample>(config: &ProcessingConfig, horizontal: Horizontal,
        resolution: Resolution) -> Result<Box<dyn TriggerEngine<S>>> {
    let mut engine: Box<dyn TriggerEngine<S>> = match config.trigger_type {
        TriggerType::RisingEdge =>
            Box::new(EdgeTrigger::<S>::new(Edge::Rising, config.edge, resolution)?),
        TriggerType::FallingEdge =>
            Box::new(EdgeTrigger::<S>::new(Edge::Falling, config.edge, resolution)?),
        TriggerType::AnyEdge =>
            Box::new(AnyEdgeTrigger::<S>::new(config.edge, resolution)?),
        TriggerType::Burst =>
            Box::new(BurstTrigger::<S>::new(config.burst, resolution)?),
    };
    engine.set_horizontal(horizontal);
    Ok(engine)
}
