//! Trigger on whichever edge comes first.

use crate::Result;
use crate::sample::{Resolution, Sample};
use super::{Detector, Edge, EdgeDetector, EdgeParameters, Trigger};

/// Runs a rising and a falling edge detector side by side. Once per re-arm cycle the first edge
/// of either direction fires the trigger.
#[derive(Debug, Clone, Copy)]
pub struct AnyEdgeDetector<S> {
    rising: EdgeDetector<S>,
    falling: EdgeDetector<S>,
    rising_armed: bool,
    falling_armed: bool,
    last_edge: Option<Edge>,
}

/// Picks the earlier of two candidate offsets, preferring the first on a tie.
fn earliest(first: Option<usize>, second: Option<usize>) -> Option<(usize, bool)> {
    match (first, second) {
        (Some(a), Some(b)) if b < a => Some((b, false)),
        (Some(a), _) => Some((a, true)),
        (None, Some(b)) => Some((b, false)),
        (None, None) => None,
    }
}

impl<S: Sample> AnyEdgeDetector<S> {
    pub fn new(params: EdgeParameters, resolution: Resolution) -> Result<AnyEdgeDetector<S>> {
        Ok(AnyEdgeDetector {
            rising: EdgeDetector::new(Edge::Rising, params, resolution)?,
            falling: EdgeDetector::new(Edge::Falling, params, resolution)?,
            rising_armed: false,
            falling_armed: false,
            last_edge: None,
        })
    }

    /// The edge that fired most recently.
    pub fn last_edge(&self) -> Option<Edge> {
        self.last_edge
    }
}

impl<S: Sample> Detector<S> for AnyEdgeDetector<S> {
    fn starts_armed(&self) -> bool {
        true
    }

    fn find_arm(&mut self, samples: &[S]) -> Option<usize> {
        let rising = self.rising.scan_arm(samples);
        let falling = self.falling.scan_arm(samples);
        let (offset, is_rising) = earliest(rising, falling)?;
        // with zero hysteresis both may arm on the same sample
        self.rising_armed = is_rising || rising == Some(offset);
        self.falling_armed = !is_rising || falling == Some(offset);
        Some(offset)
    }

    fn find_trigger(&mut self, samples: &[S]) -> Option<usize> {
        let rising = if self.rising_armed { self.rising.scan_trigger(samples) } else { None };
        let falling = if self.falling_armed { self.falling.scan_trigger(samples) } else { None };
        let (offset, is_rising) = earliest(rising, falling)?;
        self.last_edge = Some(if is_rising { Edge::Rising } else { Edge::Falling });
        Some(offset)
    }

    fn disarm(&mut self) {
        self.rising_armed = false;
        self.falling_armed = false;
    }

    fn prime(&mut self) {
        self.rising_armed = true;
        self.falling_armed = true;
        self.last_edge = None;
    }
}

impl<S: Sample> Trigger<AnyEdgeDetector<S>> {
    pub fn new(params: EdgeParameters, resolution: Resolution)
            -> Result<Trigger<AnyEdgeDetector<S>>> {
        Ok(Trigger::with_detector::<S>(AnyEdgeDetector::new(params, resolution)?))
    }
}
