//! Idempotent configuration shared between the acquisition pipeline and its consumers.
//!
//! Both [`HardwareConfig`] and [`ProcessingConfig`] are overwritten wholesale by whoever changes
//! them and re-read wholesale by the pipeline every cycle; there is no request/response exchange.

use bitflags::bitflags;

use crate::{Error, Result};
use crate::sample::{Resolution, Sample};
use crate::trigger::{BurstParameters, EdgeParameters, Horizontal};

pub const MAX_CHANNELS: usize = 4;

const FEMTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000;

code_enum! {
    /// Sample container stored in the bridge and sent to streaming clients.
    pub enum DataType {
        #[default]
        I8 = 1,
        I16 = 2,
    }
}

impl DataType {
    /// Size of one sample in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
        }
    }
}

code_enum! {
    /// Number of interleaved ADC channels delivered by the hardware.
    pub enum AdcChannelMode {
        Single = 1,
        Dual = 2,
        #[default]
        Quad = 4,
    }
}

impl AdcChannelMode {
    pub fn channel_count(self) -> usize {
        self.code() as usize
    }
}

code_enum! {
    pub enum Coupling {
        #[default]
        DC = 0,
        AC = 1,
    }
}

code_enum! {
    pub enum Termination {
        #[default]
        Ohm1M = 0,
        Ohm50 = 1,
    }
}

code_enum! {
    pub enum Bandwidth {
        #[default]
        Full = 0,
        MHz20 = 1,
        MHz100 = 2,
        MHz200 = 3,
        MHz350 = 4,
    }
}

code_enum! {
    pub enum TriggerMode {
        /// Samples are consumed but nothing is captured.
        Stop = 0,
        /// Only triggered windows are captured.
        #[default]
        Normal = 1,
        /// One triggered window is captured, then the mode switches to `Stop`.
        Single = 2,
        /// Like `Normal`, but an untriggered window is captured after the auto timeout.
        Auto = 3,
        /// Consecutive untriggered windows are captured.
        Stream = 4,
    }
}

code_enum! {
    pub enum TriggerType {
        #[default]
        RisingEdge = 0,
        FallingEdge = 1,
        AnyEdge = 2,
        Burst = 3,
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnabledChannels: u8 {
        const Ch1 = 1<<0;
        const Ch2 = 1<<1;
        const Ch3 = 1<<2;
        const Ch4 = 1<<3;
    }
}

impl EnabledChannels {
    pub fn channel(index: usize) -> Self {
        match index {
            0 => EnabledChannels::Ch1,
            1 => EnabledChannels::Ch2,
            2 => EnabledChannels::Ch3,
            3 => EnabledChannels::Ch4,
            _ => EnabledChannels::empty(),
        }
    }

    /// Indices of the enabled channels, in ascending order.
    pub fn indices(self) -> impl Iterator<Item = usize> {
        (0..MAX_CHANNELS).filter(move |&index| self.contains(Self::channel(index)))
    }
}

impl Default for EnabledChannels {
    fn default() -> Self {
        EnabledChannels::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelFrontend {
    /// Voltage spanned by the full ADC code range, at the input connector.
    pub volt_full_scale: f64,
    pub volt_offset: f64,
    /// Probe attenuation in dB. For a 1X probe, `0.0`; for a 10X probe, `20.0`.
    pub probe_attenuation: f64,
    pub coupling: Coupling,
    pub termination: Termination,
    pub bandwidth: Bandwidth,
}

impl Default for ChannelFrontend {
    fn default() -> Self {
        Self {
            volt_full_scale: 0.8,
            volt_offset: 0.0,
            probe_attenuation: 20.0, // 10X probe
            coupling: Default::default(),
            termination: Default::default(),
            bandwidth: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelCalibration {
    /// Measured gain error of the channel in dB.
    pub gain_db: f64,
    /// Measured offset error of the channel at the input connector.
    pub offset_volts: f64,
    /// ADC code observed for a grounded input.
    pub adc_trim_offset: i16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareConfig {
    pub adc_channel_mode: AdcChannelMode,
    pub enabled_channels: EnabledChannels,
    /// Per-channel sample rate.
    pub sample_rate_hz: u64,
    /// Effective ADC resolution; codes wider than 8 bits are stored as `i16`.
    pub resolution_bits: u8,
    pub frontend: [ChannelFrontend; MAX_CHANNELS],
    pub calibration: [ChannelCalibration; MAX_CHANNELS],
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            adc_channel_mode: AdcChannelMode::Quad,
            enabled_channels: EnabledChannels::all(),
            sample_rate_hz: 250_000_000,
            resolution_bits: 8,
            frontend: [ChannelFrontend::default(); MAX_CHANNELS],
            calibration: [ChannelCalibration::default(); MAX_CHANNELS],
        }
    }
}

impl HardwareConfig {
    /// Resolution of the ADC codes, checked to fit into samples of type `S`.
    pub fn resolution<S: Sample>(&self) -> Result<Resolution> {
        let resolution = Resolution::new(self.resolution_bits as u32)?;
        resolution.check::<S>()?;
        Ok(resolution)
    }

    /// Sample period in femtoseconds, or 0 if no sample rate is configured.
    pub fn fs_per_sample(&self) -> u64 {
        if self.sample_rate_hz == 0 {
            0
        } else {
            FEMTOSECONDS_PER_SECOND / self.sample_rate_hz
        }
    }

    pub fn volts_per_code(&self, channel: usize) -> f64 {
        let frontend = &self.frontend[channel];
        let calibration = &self.calibration[channel];
        let codes = (1u64 << self.resolution_bits.min(32)) as f64;
        let gain = 10f64.powf((frontend.probe_attenuation - calibration.gain_db) / 20.0);
        frontend.volt_full_scale * gain / codes
    }

    pub fn code_to_volts(&self, channel: usize, code: i32) -> f64 {
        let code = code - self.calibration[channel].adc_trim_offset as i32;
        code as f64 * self.volts_per_code(channel)
            + self.frontend[channel].volt_offset + self.calibration[channel].offset_volts
    }

    /// Nearest ADC code for `volts`, saturated to the configured resolution.
    pub fn volts_to_code(&self, channel: usize, volts: f64) -> Result<i32> {
        let resolution = Resolution::new(self.resolution_bits as u32)?;
        let volts = volts
            - self.frontend[channel].volt_offset - self.calibration[channel].offset_volts;
        let code = (volts / self.volts_per_code(channel)).round() as i64
            + self.calibration[channel].adc_trim_offset as i64;
        Ok(resolution.clamp(code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingConfig {
    pub current_channel_count: u8,
    /// Samples per channel in each captured window.
    pub current_channel_data_length: u32,
    pub trigger_channel: u8,
    pub trigger_mode: TriggerMode,
    pub trigger_type: TriggerType,
    /// Position of the trigger within the window, from the window start.
    pub trigger_delay_fs: u64,
    /// Extra dead time after a captured window before the trigger re-arms.
    pub trigger_holdoff_fs: u64,
    pub auto_timeout_ms: u32,
    pub edge: EdgeParameters,
    pub burst: BurstParameters,
    pub boxcar_averaging: u32,
    pub channel_data_type: DataType,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            current_channel_count: MAX_CHANNELS as u8,
            current_channel_data_length: 1000,
            trigger_channel: 0,
            trigger_mode: TriggerMode::Normal,
            trigger_type: TriggerType::RisingEdge,
            trigger_delay_fs: 0,
            trigger_holdoff_fs: 0,
            auto_timeout_ms: 1000,
            edge: EdgeParameters { level: 0, hysteresis: 5 },
            burst: BurstParameters { window_high: 10, window_low: -10, min_in_range_period: 1000 },
            boxcar_averaging: 1,
            channel_data_type: DataType::I8,
        }
    }
}

impl ProcessingConfig {
    /// Converts the femtosecond trigger delay and holdoff into sample counts.
    pub fn horizontal(&self, hardware: &HardwareConfig) -> Result<Horizontal> {
        let fs_per_sample = hardware.fs_per_sample();
        if fs_per_sample == 0 {
            return Err(Error::Config("sample rate is not configured".to_owned()))
        }
        Horizontal::new(
            self.current_channel_data_length as u64,
            self.trigger_delay_fs / fs_per_sample,
            self.trigger_holdoff_fs / fs_per_sample,
        )
    }

    /// Checks the current geometry against the fixed memory layout of a bridge.
    pub fn validate(&self, bridge: &BridgeConfig) -> Result<()> {
        if self.current_channel_count == 0 || self.current_channel_count > bridge.max_channel_count {
            return Err(Error::Config(format!("channel count {} exceeds maximum of {}",
                self.current_channel_count, bridge.max_channel_count)))
        }
        if self.current_channel_data_length == 0 ||
                self.current_channel_data_length > bridge.max_channel_data_length {
            return Err(Error::Config(format!("channel data length {} exceeds maximum of {}",
                self.current_channel_data_length, bridge.max_channel_data_length)))
        }
        if self.channel_data_type != bridge.channel_data_type {
            return Err(Error::Config(format!("channel data type {:?} differs from bridge type {:?}",
                self.channel_data_type, bridge.channel_data_type)))
        }
        if self.trigger_channel as usize >= MAX_CHANNELS {
            return Err(Error::Config(format!("trigger channel {} does not exist",
                self.trigger_channel)))
        }
        Ok(())
    }

    /// Bytes occupied in a data region by the channels at their current length.
    pub fn data_bytes(&self) -> usize {
        self.current_channel_count as usize * self.current_channel_data_length as usize
            * self.channel_data_type.width()
    }
}

/// Memory layout contract of a bridge, fixed when the bridge is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub max_channel_count: u8,
    pub max_channel_data_length: u32,
    pub channel_data_type: DataType,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            max_channel_count: MAX_CHANNELS as u8,
            max_channel_data_length: 1_000_000,
            channel_data_type: DataType::I8,
        }
    }
}

impl BridgeConfig {
    /// Size of one data region in bytes.
    pub fn region_data_bytes(&self) -> Option<usize> {
        (self.max_channel_count as usize)
            .checked_mul(self.max_channel_data_length as usize)?
            .checked_mul(self.channel_data_type.width())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_enum_codes() {
        assert_eq!(TriggerMode::from_code(4).unwrap(), TriggerMode::Stream);
        assert_eq!(DataType::I16.code(), 2);
        assert!(matches!(Coupling::from_code(7),
            Err(Error::InvalidEnum { field: "Coupling", value: 7 })));
    }

    #[test]
    fn test_enabled_channels() {
        let channels = EnabledChannels::Ch1 | EnabledChannels::Ch3;
        assert_eq!(channels.indices().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(EnabledChannels::default().indices().count(), 4);
    }

    #[test]
    fn test_volts_code_conversion() {
        let mut hardware = HardwareConfig::default();
        hardware.frontend[0].probe_attenuation = 0.0;
        hardware.frontend[0].volt_full_scale = 2.56;
        assert!((hardware.volts_per_code(0) - 0.01).abs() < 1e-12);
        assert_eq!(hardware.volts_to_code(0, 0.5).unwrap(), 50);
        assert_eq!(hardware.volts_to_code(0, 5.0).unwrap(), 127);
        assert_eq!(hardware.volts_to_code(0, -5.0).unwrap(), -128);
        assert!((hardware.code_to_volts(0, -20) + 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_volts_to_code_checks_resolution() {
        let mut hardware = HardwareConfig::default();
        hardware.resolution_bits = 0;
        assert!(matches!(hardware.volts_to_code(0, 0.5), Err(Error::InvalidParameter(_))));
        hardware.resolution_bits = 40;
        assert!(matches!(hardware.volts_to_code(0, 0.5), Err(Error::InvalidParameter(_))));
        hardware.resolution_bits = 12;
        assert_eq!(hardware.volts_to_code(0, 1000.0).unwrap(), 2047);
    }

    #[test]
    fn test_resolution() {
        let mut hardware = HardwareConfig::default();
        assert_eq!(hardware.resolution::<i8>().unwrap().bits(), 8);
        hardware.resolution_bits = 12;
        assert!(hardware.resolution::<i8>().is_err());
        assert_eq!(hardware.resolution::<i16>().unwrap().max(), 2047);
    }

    #[test]
    fn test_horizontal_from_time() {
        let hardware = HardwareConfig { sample_rate_hz: 1_000_000_000, ..Default::default() };
        let processing = ProcessingConfig {
            current_channel_data_length: 1000,
            trigger_delay_fs: 250_000_000, // 250 ns
            trigger_holdoff_fs: 1_000_000_000, // 1 us
            ..Default::default()
        };
        let horizontal = processing.horizontal(&hardware).unwrap();
        assert_eq!(horizontal.window_width(), 1000);
        assert_eq!(horizontal.window_trigger_position(), 250);
        assert_eq!(horizontal.additional_holdoff(), 1000);
    }

    #[test]
    fn test_horizontal_rejects_delay_past_window() {
        let hardware = HardwareConfig { sample_rate_hz: 1_000_000_000, ..Default::default() };
        let processing = ProcessingConfig {
            current_channel_data_length: 100,
            trigger_delay_fs: 100_000_000,
            ..Default::default()
        };
        assert!(matches!(processing.horizontal(&hardware),
            Err(Error::InvalidHorizontal { width: 100, trigger_position: 100 })));
    }

    #[test]
    fn test_horizontal_rejects_unbounded_holdoff() {
        // one femtosecond per sample
        let hardware = HardwareConfig { sample_rate_hz: 1_000_000_000_000_000, ..Default::default() };
        let processing = ProcessingConfig {
            current_channel_data_length: 100,
            trigger_holdoff_fs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(processing.horizontal(&hardware), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_validate_against_bridge() {
        let bridge = BridgeConfig {
            max_channel_count: 2,
            max_channel_data_length: 1000,
            channel_data_type: DataType::I8,
        };
        let processing = ProcessingConfig { current_channel_count: 2, ..Default::default() };
        assert!(processing.validate(&bridge).is_ok());
        assert_eq!(processing.data_bytes(), 2000);
        assert!(ProcessingConfig { current_channel_count: 3, ..processing }
            .validate(&bridge).is_err());
        assert!(ProcessingConfig { current_channel_data_length: 1001, ..processing }
            .validate(&bridge).is_err());
        assert!(ProcessingConfig { channel_data_type: DataType::I16, ..processing }
            .validate(&bridge).is_err());
        assert_eq!(bridge.region_data_bytes(), Some(2000));
    }
}
