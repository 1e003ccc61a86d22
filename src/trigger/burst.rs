//! Burst trigger: fires when a signal that has been quiet for a while leaves its quiet window.

use crate::{Error, Result};
use crate::sample::{Resolution, Sample};
use super::{BurstParameters, Detector, Trigger};

#[derive(Debug, Clone, Copy)]
pub struct BurstDetector<S> {
    window_high: S,
    window_low: S,
    above: Option<S>, // lowest code above the window, if representable
    below: Option<S>, // highest code below the window, if representable
    min_in_range_period: u64,
    in_range_run: u64,
}

impl<S: Sample> BurstDetector<S> {
    /// Create a detector that arms after `min_in_range_period` consecutive samples within
    /// `window_low..=window_high` and fires at the first sample outside of that window.
    pub fn new(params: BurstParameters, resolution: Resolution) -> Result<BurstDetector<S>> {
        resolution.check::<S>()?;
        if params.window_low > params.window_high {
            return Err(Error::InvalidParameter(format!("burst window {}..={} is empty",
                params.window_low, params.window_high)))
        }
        if !resolution.contains(params.window_low as i64) ||
                !resolution.contains(params.window_high as i64) {
            return Err(Error::InvalidParameter(format!(
                "burst window {}..={} is outside of the {}-bit range",
                params.window_low, params.window_high, resolution.bits())))
        }
        if params.min_in_range_period == 0 {
            return Err(Error::InvalidParameter("burst quiet period must not be zero".to_owned()))
        }
        let above = params.window_high as i64 + 1;
        let below = params.window_low as i64 - 1;
        Ok(BurstDetector {
            window_high: S::saturate(params.window_high),
            window_low: S::saturate(params.window_low),
            above: resolution.contains(above).then(|| S::saturate(above as i32)),
            below: resolution.contains(below).then(|| S::saturate(below as i32)),
            min_in_range_period: params.min_in_range_period,
            in_range_run: 0,
        })
    }

    /// Consecutive in-window samples seen while unarmed.
    pub fn in_range_run(&self) -> u64 {
        self.in_range_run
    }
}

impl<S: Sample> Detector<S> for BurstDetector<S> {
    // The quiet period has to be observed before the first burst can be accepted.
    fn starts_armed(&self) -> bool {
        false
    }

    fn find_arm(&mut self, samples: &[S]) -> Option<usize> {
        for (offset, &sample) in samples.iter().enumerate() {
            if sample >= self.window_low && sample <= self.window_high {
                self.in_range_run += 1;
                if self.in_range_run >= self.min_in_range_period {
                    return Some(offset)
                }
            } else {
                self.in_range_run = 0;
            }
        }
        None
    }

    fn find_trigger(&mut self, samples: &[S]) -> Option<usize> {
        let above = self.above.and_then(|bound| S::find_at_least(samples, bound));
        let below = self.below.and_then(|bound| S::find_at_most(samples, bound));
        match (above, below) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn disarm(&mut self) {
        self.in_range_run = 0;
    }

    fn prime(&mut self) {
        self.in_range_run = 0;
    }
}

impl<S: Sample> Trigger<BurstDetector<S>> {
    pub fn new(params: BurstParameters, resolution: Resolution)
            -> Result<Trigger<BurstDetector<S>>> {
        Ok(Trigger::with_detector::<S>(BurstDetector::new(params, resolution)?))
    }
}

#[cfg(test)]
mod test {
    use crate::Error;
    use crate::sample::Resolution;
    use crate::trigger::{
        BurstParameters, BurstTrigger, Horizontal, State, TriggerEngine, TriggerResults,
    };

    fn burst(period: u64, width: u64) -> BurstTrigger<i8> {
        let params = BurstParameters { window_high: 10, window_low: -10, min_in_range_period: period };
        let mut trig = BurstTrigger::new(params, Resolution::full::<i8>()).unwrap();
        trig.set_horizontal(Horizontal::new(width, 0, 0).unwrap());
        trig
    }

    #[test]
    fn test_requires_quiet_period() {
        let mut trig = burst(20, 10);
        let mut results = TriggerResults::with_capacity(4);
        assert_eq!(trig.state(), State::Unarmed);
        let mut data = vec![0i8; 100];
        data[10] = 100; // only 10 quiet samples so far
        data[50] = 100; // 39 quiet samples before this one
        trig.process(&data, 0, &mut results).unwrap();
        // the quiet tail after the window arms it again
        assert_eq!(results.arm_indices(), &[30, 79]);
        assert_eq!(results.trigger_indices(), &[50]);
        assert_eq!(results.capture_end_indices(), &[60]);
        assert_eq!(trig.state(), State::Armed);
    }

    #[test]
    fn test_run_spans_chunks() {
        let mut trig = burst(8, 4);
        let mut results = TriggerResults::with_capacity(4);
        trig.process(&[0; 5], 0, &mut results).unwrap();
        assert!(results.arm_indices().is_empty());
        trig.process(&[0, 0, 0, -50], 5, &mut results).unwrap();
        assert_eq!(results.arm_indices(), &[7]);
        assert_eq!(results.trigger_indices(), &[8]);
    }

    #[test]
    fn test_noisy_signal_never_arms() {
        let mut trig = burst(5, 4);
        let mut results = TriggerResults::with_capacity(4);
        let data: Vec<i8> = (0..200).map(|i| if i % 4 == 0 { 60 } else { 0 }).collect();
        trig.process(&data, 0, &mut results).unwrap();
        assert!(results.arm_indices().is_empty());
        assert!(results.trigger_indices().is_empty());
    }

    #[test]
    fn test_rearm_needs_new_quiet_period() {
        let mut trig = burst(5, 3);
        let mut results = TriggerResults::with_capacity(4);
        let mut data = vec![0i8; 26];
        data[6] = -60;  // fires, window closes at 9
        data[12] = 60;  // only 3 quiet samples since the window closed
        data[20] = 60;  // 7 quiet samples
        trig.process(&data, 0, &mut results).unwrap();
        assert_eq!(results.trigger_indices(), &[6, 20]);
        assert_eq!(results.arm_indices(), &[4, 17]);
    }

    #[test]
    fn test_full_scale_window() {
        let params = BurstParameters { window_high: 127, window_low: -20, min_in_range_period: 2 };
        let mut trig = BurstTrigger::<i8>::new(params, Resolution::full::<i8>()).unwrap();
        trig.set_horizontal(Horizontal::new(5, 0, 0).unwrap());
        let mut results = TriggerResults::with_capacity(4);
        trig.process(&[127, 127, 127, -100], 0, &mut results).unwrap();
        assert_eq!(results.trigger_indices(), &[3]);
    }

    #[test]
    fn test_invalid_parameters() {
        let resolution = Resolution::full::<i8>();
        let empty = BurstParameters { window_high: -1, window_low: 1, min_in_range_period: 4 };
        assert!(matches!(BurstTrigger::<i8>::new(empty, resolution), Err(Error::InvalidParameter(_))));
        let zero = BurstParameters { window_high: 1, window_low: -1, min_in_range_period: 0 };
        assert!(matches!(BurstTrigger::<i8>::new(zero, resolution), Err(Error::InvalidParameter(_))));
    }
}
