//! Fixed-layout binary encoding of the structures shared through the bridge and sent to streaming
//! clients.
//!
//! Every structure is encoded field by field in declaration order, little-endian, without padding.
//! Nothing is ever reinterpreted in place; the bridge and the TCP stream both go through
//! [`Wire::encode`] and [`Wire::decode`].

use crate::{Error, Result};
use crate::config::{
    AdcChannelMode, Bandwidth, BridgeConfig, ChannelCalibration, ChannelFrontend, Coupling,
    DataType, EnabledChannels, HardwareConfig, MAX_CHANNELS, ProcessingConfig, Termination,
    TriggerMode, TriggerType,
};
use crate::trigger::{BurstParameters, EdgeParameters};

/// Layout version of the bridge header and region headers.
pub const PROTOCOL_VERSION: u8 = 3;

/// Layout version of [`WaveformHeader`] and [`ChannelHeader`].
pub const WAVEFORM_VERSION: u8 = 1;

#[derive(Debug, Default)]
pub struct Encoder {
    bytes: Vec<u8>,
}

macro_rules! encode_impl {
    { $( $name:ident: $ty:ty ),+ } => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.bytes.extend_from_slice(&value.to_le_bytes());
            }
        )+
    }
}

impl Encoder {
    pub fn with_capacity(capacity: usize) -> Encoder {
        Encoder { bytes: Vec::with_capacity(capacity) }
    }

    encode_impl! {
        u8: u8, u16: u16, u32: u32, u64: u64,
        i16: i16, i32: i32,
        f32: f32, f64: f64
    }

    pub fn bool(&mut self, value: bool) {
        self.u8(value as u8)
    }

    pub fn bytes(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    position: usize,
}

macro_rules! decode_impl {
    { $( $name:ident: $ty:ty ),+ } => {
        $(
            pub fn $name(&mut self) -> Result<$ty> {
                let bytes = self.take(std::mem::size_of::<$ty>())?;
                let mut raw = [0; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )+
    }
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Decoder<'a> {
        Decoder { bytes, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.position..]
    }

    pub fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let available = self.bytes.len() - self.position;
        if count > available {
            return Err(Error::Truncated { needed: count, available })
        }
        let bytes = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    decode_impl! {
        u8: u8, u16: u16, u32: u32, u64: u64,
        i16: i16, i32: i32,
        f32: f32, f64: f64
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(Error::InvalidEnum { field: "bool", value: value as u64 }),
        }
    }
}

/// A structure with a fixed-size binary encoding.
pub trait Wire: Sized {
    /// Exact number of bytes produced by `encode`.
    const SIZE: usize;

    fn encode(&self, encoder: &mut Encoder);

    fn decode(decoder: &mut Decoder) -> Result<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(Self::SIZE);
        self.encode(&mut encoder);
        encoder.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut Decoder::new(bytes))
    }

    /// Encodes into the first `SIZE` bytes of `buffer`.
    fn write_to(&self, buffer: &mut [u8]) -> Result<()> {
        if buffer.len() < Self::SIZE {
            return Err(Error::Truncated { needed: Self::SIZE, available: buffer.len() })
        }
        buffer[..Self::SIZE].copy_from_slice(&self.to_bytes());
        Ok(())
    }
}

impl Wire for ChannelFrontend {
    const SIZE: usize = 3 * 8 + 3;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.f64(self.volt_full_scale);
        encoder.f64(self.volt_offset);
        encoder.f64(self.probe_attenuation);
        encoder.u8(self.coupling.code());
        encoder.u8(self.termination.code());
        encoder.u8(self.bandwidth.code());
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(ChannelFrontend {
            volt_full_scale: decoder.f64()?,
            volt_offset: decoder.f64()?,
            probe_attenuation: decoder.f64()?,
            coupling: Coupling::from_code(decoder.u8()?)?,
            termination: Termination::from_code(decoder.u8()?)?,
            bandwidth: Bandwidth::from_code(decoder.u8()?)?,
        })
    }
}

impl Wire for ChannelCalibration {
    const SIZE: usize = 2 * 8 + 2;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.f64(self.gain_db);
        encoder.f64(self.offset_volts);
        encoder.i16(self.adc_trim_offset);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(ChannelCalibration {
            gain_db: decoder.f64()?,
            offset_volts: decoder.f64()?,
            adc_trim_offset: decoder.i16()?,
        })
    }
}

impl Wire for HardwareConfig {
    const SIZE: usize = 1 + 1 + 8 + 1 +
        MAX_CHANNELS * ChannelFrontend::SIZE + MAX_CHANNELS * ChannelCalibration::SIZE;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.adc_channel_mode.code());
        encoder.u8(self.enabled_channels.bits());
        encoder.u64(self.sample_rate_hz);
        encoder.u8(self.resolution_bits);
        for frontend in &self.frontend {
            frontend.encode(encoder);
        }
        for calibration in &self.calibration {
            calibration.encode(encoder);
        }
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        let adc_channel_mode = AdcChannelMode::from_code(decoder.u8()?)?;
        let enabled_bits = decoder.u8()?;
        let enabled_channels = EnabledChannels::from_bits(enabled_bits)
            .ok_or(Error::InvalidEnum { field: "EnabledChannels", value: enabled_bits as u64 })?;
        let sample_rate_hz = decoder.u64()?;
        let resolution_bits = decoder.u8()?;
        let mut frontend = [ChannelFrontend::default(); MAX_CHANNELS];
        for channel in &mut frontend {
            *channel = ChannelFrontend::decode(decoder)?;
        }
        let mut calibration = [ChannelCalibration::default(); MAX_CHANNELS];
        for channel in &mut calibration {
            *channel = ChannelCalibration::decode(decoder)?;
        }
        Ok(HardwareConfig {
            adc_channel_mode,
            enabled_channels,
            sample_rate_hz,
            resolution_bits,
            frontend,
            calibration,
        })
    }
}

impl Wire for EdgeParameters {
    const SIZE: usize = 4 + 4;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.i32(self.level);
        encoder.u32(self.hysteresis);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(EdgeParameters { level: decoder.i32()?, hysteresis: decoder.u32()? })
    }
}

impl Wire for BurstParameters {
    const SIZE: usize = 4 + 4 + 8;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.i32(self.window_high);
        encoder.i32(self.window_low);
        encoder.u64(self.min_in_range_period);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(BurstParameters {
            window_high: decoder.i32()?,
            window_low: decoder.i32()?,
            min_in_range_period: decoder.u64()?,
        })
    }
}

impl Wire for ProcessingConfig {
    const SIZE: usize = 1 + 4 + 1 + 1 + 1 + 8 + 8 + 4 +
        EdgeParameters::SIZE + BurstParameters::SIZE + 4 + 1;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.current_channel_count);
        encoder.u32(self.current_channel_data_length);
        encoder.u8(self.trigger_channel);
        encoder.u8(self.trigger_mode.code());
        encoder.u8(self.trigger_type.code());
        encoder.u64(self.trigger_delay_fs);
        encoder.u64(self.trigger_holdoff_fs);
        encoder.u32(self.auto_timeout_ms);
        self.edge.encode(encoder);
        self.burst.encode(encoder);
        encoder.u32(self.boxcar_averaging);
        encoder.u8(self.channel_data_type.code());
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(ProcessingConfig {
            current_channel_count: decoder.u8()?,
            current_channel_data_length: decoder.u32()?,
            trigger_channel: decoder.u8()?,
            trigger_mode: TriggerMode::from_code(decoder.u8()?)?,
            trigger_type: TriggerType::from_code(decoder.u8()?)?,
            trigger_delay_fs: decoder.u64()?,
            trigger_holdoff_fs: decoder.u64()?,
            auto_timeout_ms: decoder.u32()?,
            edge: EdgeParameters::decode(decoder)?,
            burst: BurstParameters::decode(decoder)?,
            boxcar_averaging: decoder.u32()?,
            channel_data_type: DataType::from_code(decoder.u8()?)?,
        })
    }
}

impl Wire for BridgeConfig {
    const SIZE: usize = 1 + 4 + 1;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.max_channel_count);
        encoder.u32(self.max_channel_data_length);
        encoder.u8(self.channel_data_type.code());
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(BridgeConfig {
            max_channel_count: decoder.u8()?,
            max_channel_data_length: decoder.u32()?,
            channel_data_type: DataType::from_code(decoder.u8()?)?,
        })
    }
}

code_enum! {
    /// One of the two data regions of a bridge.
    pub enum Region {
        #[default]
        A = 0,
        B = 1,
    }
}

impl Region {
    pub fn other(self) -> Region {
        match self {
            Region::A => Region::B,
            Region::B => Region::A,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Acquisition counters maintained by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Monitoring {
    /// Regions committed since the bridge was created.
    pub total_acquisitions: u64,
    /// Captures discarded by the producer before they reached a region.
    pub dropped_acquisitions: u64,
    /// Sequence number of the most recently committed region.
    pub last_sequence: u64,
}

impl Wire for Monitoring {
    const SIZE: usize = 3 * 8;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u64(self.total_acquisitions);
        encoder.u64(self.dropped_acquisitions);
        encoder.u64(self.last_sequence);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(Monitoring {
            total_acquisitions: decoder.u64()?,
            dropped_acquisitions: decoder.u64()?,
            last_sequence: decoder.u64()?,
        })
    }
}

/// Snapshot written in front of a data region when it is committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRegionHeader {
    pub hardware: HardwareConfig,
    pub processing: ProcessingConfig,
    /// Whether the region holds a triggered capture, as opposed to an auto or stream capture.
    pub triggered: bool,
    pub data_type: DataType,
    /// Commit counter, starting at 1; stamped by the bridge writer.
    pub sequence: u64,
}

impl DataRegionHeader {
    pub const SEQUENCE_OFFSET: usize = HardwareConfig::SIZE + ProcessingConfig::SIZE + 1 + 1;
}

impl Wire for DataRegionHeader {
    const SIZE: usize = HardwareConfig::SIZE + ProcessingConfig::SIZE + 1 + 1 + 8;

    fn encode(&self, encoder: &mut Encoder) {
        self.hardware.encode(encoder);
        self.processing.encode(encoder);
        encoder.bool(self.triggered);
        encoder.u8(self.data_type.code());
        encoder.u64(self.sequence);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(DataRegionHeader {
            hardware: HardwareConfig::decode(decoder)?,
            processing: ProcessingConfig::decode(decoder)?,
            triggered: decoder.bool()?,
            data_type: DataType::from_code(decoder.u8()?)?,
            sequence: decoder.u64()?,
        })
    }
}

/// Header at the start of the shared memory segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeHeader {
    pub version: u8,
    /// Size of both data regions together.
    pub data_capacity_bytes: u64,
    pub bridge: BridgeConfig,
    pub acquiring_region: Region,
    pub hardware: HardwareConfig,
    pub processing: ProcessingConfig,
    pub monitoring: Monitoring,
}

impl BridgeHeader {
    pub const VERSION_OFFSET: usize = 0;
    pub const DATA_CAPACITY_OFFSET: usize = Self::VERSION_OFFSET + 1;
    pub const BRIDGE_CONFIG_OFFSET: usize = Self::DATA_CAPACITY_OFFSET + 8;
    pub const ACQUIRING_REGION_OFFSET: usize = Self::BRIDGE_CONFIG_OFFSET + BridgeConfig::SIZE;
    pub const HARDWARE_OFFSET: usize = Self::ACQUIRING_REGION_OFFSET + 1;
    pub const PROCESSING_OFFSET: usize = Self::HARDWARE_OFFSET + HardwareConfig::SIZE;
    pub const MONITORING_OFFSET: usize = Self::PROCESSING_OFFSET + ProcessingConfig::SIZE;
}

impl Wire for BridgeHeader {
    const SIZE: usize = Self::MONITORING_OFFSET + Monitoring::SIZE;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.version);
        encoder.u64(self.data_capacity_bytes);
        self.bridge.encode(encoder);
        encoder.u8(self.acquiring_region.code());
        self.hardware.encode(encoder);
        self.processing.encode(encoder);
        self.monitoring.encode(encoder);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(BridgeHeader {
            version: decoder.u8()?,
            data_capacity_bytes: decoder.u64()?,
            bridge: BridgeConfig::decode(decoder)?,
            acquiring_region: Region::from_code(decoder.u8()?)?,
            hardware: HardwareConfig::decode(decoder)?,
            processing: ProcessingConfig::decode(decoder)?,
            monitoring: Monitoring::decode(decoder)?,
        })
    }
}

/// Response header of the waveform streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WaveformHeader {
    pub version: u8,
    pub sequence: u32,
    pub channel_count: u16,
    pub fs_per_sample: u64,
    /// Position of the trigger within the waveform, 0 if the capture was not triggered.
    pub trigger_fs: u64,
    /// Waveforms committed per second.
    pub waveform_rate: f64,
}

impl Wire for WaveformHeader {
    const SIZE: usize = 1 + 4 + 2 + 8 + 8 + 8;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.version);
        encoder.u32(self.sequence);
        encoder.u16(self.channel_count);
        encoder.u64(self.fs_per_sample);
        encoder.u64(self.trigger_fs);
        encoder.f64(self.waveform_rate);
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(WaveformHeader {
            version: decoder.u8()?,
            sequence: decoder.u32()?,
            channel_count: decoder.u16()?,
            fs_per_sample: decoder.u64()?,
            trigger_fs: decoder.u64()?,
            waveform_rate: decoder.f64()?,
        })
    }
}

/// Per-channel header of the waveform streaming protocol, followed by `depth` samples.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelHeader {
    pub channel_index: u8,
    pub depth: u64,
    /// Volts per code.
    pub scale: f32,
    /// Volts at code 0.
    pub offset: f32,
    /// Sub-sample position of the trigger, in samples.
    pub trigger_phase: f32,
    /// Whether any sample is at the limit of the code range.
    pub clipping: bool,
    pub data_type: DataType,
}

impl ChannelHeader {
    /// Size of the samples following this header.
    pub fn data_bytes(&self) -> Option<usize> {
        usize::try_from(self.depth).ok()?.checked_mul(self.data_type.width())
    }
}

impl Wire for ChannelHeader {
    const SIZE: usize = 1 + 8 + 4 + 4 + 4 + 1 + 1;

    fn encode(&self, encoder: &mut Encoder) {
        encoder.u8(self.channel_index);
        encoder.u64(self.depth);
        encoder.f32(self.scale);
        encoder.f32(self.offset);
        encoder.f32(self.trigger_phase);
        encoder.bool(self.clipping);
        encoder.u8(self.data_type.code());
    }

    fn decode(decoder: &mut Decoder) -> Result<Self> {
        Ok(ChannelHeader {
            channel_index: decoder.u8()?,
            depth: decoder.u64()?,
            scale: decoder.f32()?,
            offset: decoder.f32()?,
            trigger_phase: decoder.f32()?,
            clipping: decoder.bool()?,
            data_type: DataType::from_code(decoder.u8()?)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    macro_rules! assert_size {
        ($ty:ty, $size:expr) => {
            assert_eq!(<$ty as Wire>::SIZE, $size, "declared size of {}", stringify!($ty));
            assert_eq!(<$ty>::default().to_bytes().len(), $size,
                "encoded size of {}", stringify!($ty));
        };
    }

    fn region_header() -> DataRegionHeader {
        DataRegionHeader {
            hardware: HardwareConfig::default(),
            processing: ProcessingConfig::default(),
            triggered: true,
            data_type: DataType::I8,
            sequence: 7,
        }
    }

    fn bridge_header() -> BridgeHeader {
        BridgeHeader {
            version: PROTOCOL_VERSION,
            data_capacity_bytes: 2 * 4000,
            bridge: BridgeConfig { max_channel_count: 4, max_channel_data_length: 1000,
                channel_data_type: DataType::I8 },
            acquiring_region: Region::B,
            hardware: HardwareConfig::default(),
            processing: ProcessingConfig::default(),
            monitoring: Monitoring { total_acquisitions: 3, dropped_acquisitions: 1,
                last_sequence: 3 },
        }
    }

    #[test]
    fn test_sizes() {
        assert_size!(ChannelFrontend, 27);
        assert_size!(ChannelCalibration, 18);
        assert_size!(HardwareConfig, 191);
        assert_size!(EdgeParameters, 8);
        assert_size!(BurstParameters, 16);
        assert_size!(ProcessingConfig, 57);
        assert_size!(BridgeConfig, 6);
        assert_size!(Monitoring, 24);
        assert_size!(WaveformHeader, 31);
        assert_size!(ChannelHeader, 23);
        assert_eq!(region_header().to_bytes().len(), DataRegionHeader::SIZE);
        assert_eq!(DataRegionHeader::SIZE, 258);
        assert_eq!(&region_header().to_bytes()[DataRegionHeader::SEQUENCE_OFFSET..],
            &7u64.to_le_bytes());
        assert_eq!(bridge_header().to_bytes().len(), BridgeHeader::SIZE);
        assert_eq!(BridgeHeader::SIZE, 288);
    }

    #[test]
    fn test_little_endian_layout() {
        let header = WaveformHeader {
            version: WAVEFORM_VERSION,
            sequence: 0x01020304,
            channel_count: 2,
            fs_per_sample: 4_000_000,
            trigger_fs: 0,
            waveform_rate: 0.0,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..7], &[WAVEFORM_VERSION, 0x04, 0x03, 0x02, 0x01, 0x02, 0x00]);
        assert_eq!(&bytes[7..15], &4_000_000u64.to_le_bytes());
    }

    #[test]
    fn test_bridge_header_offsets() {
        let header = bridge_header();
        let bytes = header.to_bytes();
        assert_eq!(bytes[BridgeHeader::ACQUIRING_REGION_OFFSET], Region::B.code());
        let hardware = &bytes[BridgeHeader::HARDWARE_OFFSET..][..HardwareConfig::SIZE];
        assert_eq!(HardwareConfig::from_bytes(hardware).unwrap(), header.hardware);
        let monitoring = &bytes[BridgeHeader::MONITORING_OFFSET..];
        assert_eq!(Monitoring::from_bytes(monitoring).unwrap(), header.monitoring);
        assert_eq!(BridgeHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_config_survives_encoding() {
        let mut hardware = HardwareConfig::default();
        hardware.enabled_channels = EnabledChannels::Ch1 | EnabledChannels::Ch3;
        hardware.frontend[2].coupling = Coupling::AC;
        hardware.frontend[2].volt_offset = -0.125;
        hardware.calibration[1].adc_trim_offset = -12;
        let processing = ProcessingConfig {
            trigger_type: TriggerType::Burst,
            trigger_mode: TriggerMode::Single,
            edge: EdgeParameters { level: -30, hysteresis: 3 },
            trigger_delay_fs: 123_456_789,
            ..Default::default()
        };
        assert_eq!(HardwareConfig::from_bytes(&hardware.to_bytes()).unwrap(), hardware);
        assert_eq!(ProcessingConfig::from_bytes(&processing.to_bytes()).unwrap(), processing);
    }

    #[test]
    fn test_truncated() {
        let bytes = region_header().to_bytes();
        assert!(matches!(DataRegionHeader::from_bytes(&bytes[..100]),
            Err(Error::Truncated { .. })));
        let mut buffer = [0u8; 10];
        assert!(matches!(Monitoring::default().write_to(&mut buffer),
            Err(Error::Truncated { needed: 24, available: 10 })));
    }

    #[test]
    fn test_invalid_codes() {
        let mut bytes = region_header().to_bytes();
        bytes[HardwareConfig::SIZE + ProcessingConfig::SIZE] = 2; // triggered flag
        assert!(matches!(DataRegionHeader::from_bytes(&bytes),
            Err(Error::InvalidEnum { field: "bool", value: 2 })));

        let mut bytes = bridge_header().to_bytes();
        bytes[BridgeHeader::ACQUIRING_REGION_OFFSET] = 5;
        assert!(matches!(BridgeHeader::from_bytes(&bytes),
            Err(Error::InvalidEnum { field: "Region", value: 5 })));

        let mut bytes = HardwareConfig::default().to_bytes();
        bytes[1] = 0x30;
        assert!(matches!(HardwareConfig::from_bytes(&bytes),
            Err(Error::InvalidEnum { field: "EnabledChannels", .. })));
    }

    #[test]
    fn test_region_other() {
        assert_eq!(Region::A.other(), Region::B);
        assert_eq!(Region::B.other().other(), Region::B);
        assert_eq!(Region::from_code(1).unwrap(), Region::B);
    }
}
