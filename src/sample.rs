//! Sample containers, their effective resolution, and vectorized threshold searches.

use crate::{Error, Result};
use crate::config::DataType;

/// A signed ADC code stored in an 8-bit or 16-bit container.
pub trait Sample: bytemuck::Pod + Ord + Into<i32> + Send + Sync + std::fmt::Debug + 'static {
    /// Width of the container in bits.
    const BITS: u32;
    /// Tag describing this container on the wire.
    const DATA_TYPE: DataType;

    /// Converts `value`, saturating it to the range of the container.
    fn saturate(value: i32) -> Self;

    /// Returns the index of the first sample that is greater than or equal to `bound`.
    fn find_at_least(samples: &[Self], bound: Self) -> Option<usize>;

    /// Returns the index of the first sample that is less than or equal to `bound`.
    fn find_at_most(samples: &[Self], bound: Self) -> Option<usize>;
}

macro_rules! find_impl {
    { $ty:ty, $vector:ident, $lanes:literal, $( $decl:tt )+ } => {
        #[inline(never)] // makes assembly more readable; serves no other purpose
        $( $decl )+(samples: &[$ty], bound: $ty, at_least: bool) -> Option<usize> {
            use wide::{$vector, CmpEq, CmpGt, CmpLt};

            let hit = |sample: $ty| if at_least { sample >= bound } else { sample <= bound };
            let splat = $vector::splat(bound);
            let mut groups = samples.chunks_exact($lanes);
            let mut offset = 0;
            for group in &mut groups {
                let mut lanes: [$ty; $lanes] = [0; $lanes];
                lanes.copy_from_slice(group);
                let vector = $vector::new(lanes);
                let mask = if at_least {
                    vector.cmp_gt(splat) | vector.cmp_eq(splat)
                } else {
                    vector.cmp_lt(splat) | vector.cmp_eq(splat)
                };
                if mask.any() {
                    // the group is known to contain a hit; locate it within the lanes
                    return lanes.iter().position(|&sample| hit(sample)).map(|index| offset + index)
                }
                offset += $lanes;
            }
            groups.remainder().iter().position(|&sample| hit(sample)).map(|index| offset + index)
        }
    }
}

macro_rules! sample_impl {
    { $ty:ty, $vector:ident, $lanes:literal, $data_type:expr, $module:ident } => {
        mod $module {
            find_impl! { $ty, $vector, $lanes, pub(super) fn find_generic }

            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            find_impl! { $ty, $vector, $lanes,
                #[target_feature(enable = "avx2")] pub(super) unsafe fn find_avx2 }

            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            pub(super) fn find(samples: &[$ty], bound: $ty, at_least: bool) -> Option<usize> {
                // Dispatch to the most efficient implementation.
                if is_x86_feature_detected!("avx2") {
                    // SAFETY: The AVX2 function is called only if AVX2 is available, checked above.
                    unsafe { find_avx2(samples, bound, at_least) }
                } else {
                    find_generic(samples, bound, at_least)
                }
            }

            #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
            pub(super) fn find(samples: &[$ty], bound: $ty, at_least: bool) -> Option<usize> {
                find_generic(samples, bound, at_least)
            }
        }

        impl Sample for $ty {
            const BITS: u32 = <$ty>::BITS;
            const DATA_TYPE: DataType = $data_type;

            fn saturate(value: i32) -> Self {
                value.clamp(<$ty>::MIN as i32, <$ty>::MAX as i32) as $ty
            }

            fn find_at_least(samples: &[Self], bound: Self) -> Option<usize> {
                $module::find(samples, bound, true)
            }

            fn find_at_most(samples: &[Self], bound: Self) -> Option<usize> {
                $module::find(samples, bound, false)
            }
        }
    }
}

sample_impl! { i8,  i8x16, 16, DataType::I8,  scan_i8 }
sample_impl! { i16, i16x8, 8,  DataType::I16, scan_i16 }

/// Effective resolution of the ADC codes held in a container, e.g. 12-bit codes in an `i16`.
///
/// Trigger levels and hysteresis are expressed in the same scale as the codes, and thresholds
/// derived from them are clamped to the full scale of the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    bits: u32,
}

impl Resolution {
    pub fn new(bits: u32) -> Result<Resolution> {
        if !(2..=16).contains(&bits) {
            return Err(Error::InvalidParameter(format!("unsupported resolution of {bits} bits")))
        }
        Ok(Resolution { bits })
    }

    /// The resolution that uses the whole container.
    pub fn full<S: Sample>() -> Resolution {
        Resolution { bits: S::BITS }
    }

    pub fn bits(self) -> u32 {
        self.bits
    }

    pub fn min(self) -> i32 {
        -(1 << (self.bits - 1))
    }

    pub fn max(self) -> i32 {
        (1 << (self.bits - 1)) - 1
    }

    pub fn contains(self, code: i64) -> bool {
        code >= self.min() as i64 && code <= self.max() as i64
    }

    pub fn clamp(self, code: i64) -> i32 {
        code.clamp(self.min() as i64, self.max() as i64) as i32
    }

    /// Checks that codes of this resolution fit into the container `S`.
    pub fn check<S: Sample>(self) -> Result<()> {
        if self.bits > S::BITS {
            return Err(Error::InvalidParameter(format!(
                "{}-bit resolution does not fit into {:?} samples", self.bits, S::DATA_TYPE)))
        }
        Ok(())
    }
}
