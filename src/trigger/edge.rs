//! Rising edge and falling edge triggers with hysteresis.

use crate::{Error, Result};
use crate::sample::{Resolution, Sample};
use super::{Detector, Edge, EdgeParameters, Trigger};

#[derive(Debug, Clone, Copy)]
pub struct EdgeDetector<S> {
    edge: Edge,
    level: S, // fires at `sample >= level` (rising) or `sample <= level` (falling)
    arm: S,   // arms at `sample <= arm` (rising) or `sample >= arm` (falling)
}

impl<S: Sample> EdgeDetector<S> {
    /// Create a detector for `edge` at `params.level`.
    ///
    /// A rising edge detector arms when it processes a sample at or below
    /// `level - hysteresis`, and fires at the first sample at or above `level` after that.
    /// A falling edge detector mirrors this: it arms at or above `level + hysteresis` and fires
    /// at or below `level`.
    ///
    /// For example, with `level` 50 and `hysteresis` 2, the rising edge detector processing
    /// `[60, 49, 48, 49, 50, 47]` from `Unarmed` arms at sample #2 (value 48) and fires at
    /// sample #4 (value 50).
    ///
    /// The arm level is clamped to one code inside the full scale of `resolution`, so that no
    /// matter what `level` and `hysteresis` are set to, some sequence of sample values short of
    /// the rail re-arms the detector.
    pub fn new(edge: Edge, params: EdgeParameters, resolution: Resolution)
            -> Result<EdgeDetector<S>> {
        resolution.check::<S>()?;
        if !resolution.contains(params.level as i64) {
            return Err(Error::InvalidParameter(format!(
                "trigger level {} is outside of the {}-bit range", params.level, resolution.bits())))
        }
        let arm = match edge {
            Edge::Rising  => resolution.clamp(params.level as i64 - params.hysteresis as i64)
                .max(resolution.min() + 1),
            Edge::Falling => resolution.clamp(params.level as i64 + params.hysteresis as i64)
                .min(resolution.max() - 1),
        };
        Ok(EdgeDetector {
            edge,
            level: S::saturate(params.level),
            arm: S::saturate(arm),
        })
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    pub fn level(&self) -> S {
        self.level
    }

    pub fn arm_level(&self) -> S {
        self.arm
    }

    pub(super) fn scan_arm(&self, samples: &[S]) -> Option<usize> {
        match self.edge {
            Edge::Rising  => S::find_at_most(samples, self.arm),
            Edge::Falling => S::find_at_least(samples, self.arm),
        }
    }

    pub(super) fn scan_trigger(&self, samples: &[S]) -> Option<usize> {
        match self.edge {
            Edge::Rising  => S::find_at_least(samples, self.level),
            Edge::Falling => S::find_at_most(samples, self.level),
        }
    }
}

impl<S: Sample> Detector<S> for EdgeDetector<S> {
    // A signal that begins past the level triggers at the very first sample.
    fn starts_armed(&self) -> bool {
        true
    }

    fn find_arm(&mut self, samples: &[S]) -> Option<usize> {
        self.scan_arm(samples)
    }

    fn find_trigger(&mut self, samples: &[S]) -> Option<usize> {
        self.scan_trigger(samples)
    }

    fn disarm(&mut self) {}

    fn prime(&mut self) {}
}

impl<S: Sample> Trigger<EdgeDetector<S>> {
    pub fn new(edge: Edge, params: EdgeParameters, resolution: Resolution)
            -> Result<Trigger<EdgeDetector<S>>> {
        Ok(Trigger::with_detector::<S>(EdgeDetector::new(edge, params, resolution)?))
    }

    pub fn rising(params: EdgeParameters, resolution: Resolution)
            -> Result<Trigger<EdgeDetector<S>>> {
        Self::new(Edge::Rising, params, resolution)
    }

    pub fn falling(params: EdgeParameters, resolution: Resolution)
            -> Result<Trigger<EdgeDetector<S>>> {
        Self::new(Edge::Falling, params, resolution)
    }
}
