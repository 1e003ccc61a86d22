//! Double-buffered shared memory hand-off from one producer to any number of readers.
//!
//! The segment holds a [`BridgeHeader`] followed by two data regions, each prefixed with a
//! [`DataRegionHeader`]:
//!
//! ```text
//! [BridgeHeader | pad][DataRegionHeader A | pad][region A data][DataRegionHeader B | pad][region B data]
//! ```
//!
//! Every part starts on a 64-byte boundary. The producer fills the region named by the header's
//! acquiring region byte, stamps its region header, flips the byte and posts the semaphore. After a
//! successful wait, a reader consumes the region opposite to the acquiring one.

use std::slice;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::{Error, Result, Sample};
use crate::config::{BridgeConfig, HardwareConfig, MAX_CHANNELS, ProcessingConfig};
use crate::semaphore::Semaphore;
use crate::sys::{NativeSemaphore, NativeSharedMemory, SemaphoreDriver, SharedMemoryDriver};
use crate::wire::{
    BridgeHeader, DataRegionHeader, Monitoring, PROTOCOL_VERSION, Region, Wire,
};

const NAME_PREFIX: &str = "thunderscope";

const ALIGN: usize = 64;

fn check_bridge_name(bridge: &str) -> Result<()> {
    if bridge.is_empty() || bridge.contains('/') {
        return Err(Error::InvalidName(bridge.to_owned()))
    }
    Ok(())
}

/// Name of the semaphore signalling commits to a bridge.
pub fn semaphore_name(bridge: &str) -> Result<String> {
    check_bridge_name(bridge)?;
    Ok(format!("/{NAME_PREFIX}.{bridge}"))
}

/// Name of the shared memory segment backing a bridge.
pub fn shared_memory_name(bridge: &str) -> Result<String> {
    check_bridge_name(bridge)?;
    Ok(format!("/{NAME_PREFIX}.{bridge}.shm"))
}

/// Byte offsets of the parts of a bridge segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeLayout {
    region_data_bytes: usize,
}

impl BridgeLayout {
    pub fn new(config: &BridgeConfig) -> Result<BridgeLayout> {
        if config.max_channel_count == 0 || config.max_channel_count as usize > MAX_CHANNELS {
            return Err(Error::Config(format!("bridge cannot hold {} channels",
                config.max_channel_count)))
        }
        if config.max_channel_data_length == 0 {
            return Err(Error::Config("bridge channel length must not be zero".to_owned()))
        }
        let region_data_bytes = config.region_data_bytes()
            .filter(|bytes| bytes.checked_next_multiple_of(ALIGN).is_some())
            .ok_or_else(|| Error::Config("bridge regions are too large".to_owned()))?;
        Ok(BridgeLayout { region_data_bytes })
    }

    pub fn region_data_bytes(&self) -> usize {
        self.region_data_bytes
    }

    /// Size of both data regions together.
    pub fn data_capacity_bytes(&self) -> usize {
        2 * self.region_data_bytes
    }

    fn header_bytes() -> usize {
        BridgeHeader::SIZE.next_multiple_of(ALIGN)
    }

    fn region_stride(&self) -> usize {
        DataRegionHeader::SIZE.next_multiple_of(ALIGN) + self.region_data_bytes.next_multiple_of(ALIGN)
    }

    pub fn region_header_offset(&self, region: Region) -> usize {
        Self::header_bytes() + region.index() * self.region_stride()
    }

    pub fn region_data_offset(&self, region: Region) -> usize {
        self.region_header_offset(region) + DataRegionHeader::SIZE.next_multiple_of(ALIGN)
    }

    pub fn total_bytes(&self) -> usize {
        Self::header_bytes() + 2 * self.region_stride()
    }
}

/// A mapped segment, accessed by byte offset.
#[derive(Debug)]
struct Mapping<M> {
    memory: M,
}

impl<M: SharedMemoryDriver> Mapping<M> {
    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.memory.len()));
        // SAFETY: The range is within the mapping, which lives as long as `self`. Other processes
        // may write to it concurrently; the bridge protocol keeps them off the ranges being read.
        unsafe { slice::from_raw_parts(self.memory.as_ptr().add(offset), len) }
    }

    fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.memory.len()));
        // SAFETY: See `bytes`; `&mut self` excludes other borrows within this process.
        unsafe { slice::from_raw_parts_mut(self.memory.as_ptr().add(offset), len) }
    }

    fn read<T: Wire>(&self, offset: usize) -> Result<T> {
        T::from_bytes(self.bytes(offset, T::SIZE))
    }

    fn write<T: Wire>(&mut self, offset: usize, value: &T) -> Result<()> {
        value.write_to(self.bytes_mut(offset, T::SIZE))
    }

    fn acquiring_region(&self) -> &AtomicU8 {
        assert!(BridgeHeader::ACQUIRING_REGION_OFFSET < self.memory.len());
        // SAFETY: The byte is within the mapping and `AtomicU8` has the size and alignment of `u8`.
        unsafe {
            &*(self.memory.as_ptr().add(BridgeHeader::ACQUIRING_REGION_OFFSET) as *const AtomicU8)
        }
    }

    fn sequence(&self, layout: &BridgeLayout, region: Region) -> u64 {
        let offset = layout.region_header_offset(region) + DataRegionHeader::SEQUENCE_OFFSET;
        let mut raw = [0; 8];
        raw.copy_from_slice(self.bytes(offset, 8));
        u64::from_le_bytes(raw)
    }
}

/// Producer side of a bridge.
///
/// Dropping the writer unlinks the segment and the semaphore: readers that have the bridge open
/// keep timing out, and new readers fail to open it.
#[derive(Debug)]
pub struct BridgeWriter<M: SharedMemoryDriver = NativeSharedMemory,
                        D: SemaphoreDriver = NativeSemaphore> {
    name: String,
    mapping: Mapping<M>,
    semaphore: Semaphore<D>,
    config: BridgeConfig,
    layout: BridgeLayout,
    acquiring: Region,
    monitoring: Monitoring,
}

impl<M: SharedMemoryDriver, D: SemaphoreDriver> BridgeWriter<M, D> {
    /// Creates the bridge `name`, replacing any earlier bridge of that name.
    pub fn create(name: &str, config: BridgeConfig) -> Result<BridgeWriter<M, D>> {
        let layout = BridgeLayout::new(&config)?;
        let shm_name = shared_memory_name(name)?;
        let sem_name = semaphore_name(name)?;

        // a semaphore left behind by an earlier producer may still hold posts
        match D::unlink(&sem_name) {
            Ok(()) => debug!("bridge {name}: removed stale semaphore"),
            Err(Error::DoesNotExist(_)) => (),
            Err(error) => return Err(error),
        }
        let memory = M::create(&shm_name, layout.total_bytes())?;
        let semaphore = Semaphore::create_or_open(&sem_name)?;

        let hardware = HardwareConfig::default();
        let processing = ProcessingConfig {
            current_channel_count: config.max_channel_count,
            current_channel_data_length: ProcessingConfig::default().current_channel_data_length
                .min(config.max_channel_data_length),
            channel_data_type: config.channel_data_type,
            ..Default::default()
        };
        let mut writer = BridgeWriter {
            name: name.to_owned(),
            mapping: Mapping { memory },
            semaphore,
            config,
            layout,
            acquiring: Region::A,
            monitoring: Monitoring::default(),
        };
        for region in [Region::A, Region::B] {
            let region_header = DataRegionHeader {
                hardware,
                processing,
                triggered: false,
                data_type: config.channel_data_type,
                sequence: 0,
            };
            writer.mapping.write(layout.region_header_offset(region), &region_header)?;
        }
        writer.mapping.write(0, &BridgeHeader {
            version: PROTOCOL_VERSION,
            data_capacity_bytes: layout.data_capacity_bytes() as u64,
            bridge: config,
            acquiring_region: Region::A,
            hardware,
            processing,
            monitoring: Monitoring::default(),
        })?;
        info!("bridge {name}: created with {} bytes per region ({} channels of {} x {:?})",
            layout.region_data_bytes(), config.max_channel_count, config.max_channel_data_length,
            config.channel_data_type);
        Ok(writer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    pub fn layout(&self) -> BridgeLayout {
        self.layout
    }

    pub fn header(&self) -> Result<BridgeHeader> {
        self.mapping.read(0)
    }

    /// The hardware configuration as last written by any side.
    pub fn hardware_config(&self) -> Result<HardwareConfig> {
        self.mapping.read(BridgeHeader::HARDWARE_OFFSET)
    }

    /// The processing configuration as last written by any side.
    pub fn processing_config(&self) -> Result<ProcessingConfig> {
        self.mapping.read(BridgeHeader::PROCESSING_OFFSET)
    }

    /// Overwrites both configuration snapshots.
    pub fn update_config(&mut self, hardware: &HardwareConfig, processing: &ProcessingConfig)
            -> Result<()> {
        processing.validate(&self.config)?;
        self.mapping.write(BridgeHeader::HARDWARE_OFFSET, hardware)?;
        self.mapping.write(BridgeHeader::PROCESSING_OFFSET, processing)
    }

    pub fn acquiring_region(&self) -> Region {
        self.acquiring
    }

    /// Data area of the region currently open for writing.
    pub fn begin_region(&mut self) -> &mut [u8] {
        let offset = self.layout.region_data_offset(self.acquiring);
        self.mapping.bytes_mut(offset, self.layout.region_data_bytes())
    }

    /// Stamps `header` onto the acquiring region, hands the region over to readers and posts the
    /// semaphore once. Returns the sequence number assigned to the region.
    pub fn commit_region(&mut self, mut header: DataRegionHeader) -> Result<u64> {
        self.config.check_region(&header)?;
        let sequence = self.monitoring.last_sequence + 1;
        header.sequence = sequence;
        let region = self.acquiring;
        self.mapping.write(self.layout.region_header_offset(region), &header)?;

        self.acquiring = region.other();
        self.mapping.acquiring_region().store(self.acquiring.code(), Ordering::Release);

        self.monitoring.total_acquisitions += 1;
        self.monitoring.last_sequence = sequence;
        self.mapping.write(BridgeHeader::MONITORING_OFFSET, &self.monitoring)?;

        self.semaphore.release()?;
        trace!("bridge {}: committed region {:?} as #{}", self.name, region, sequence);
        Ok(sequence)
    }

    /// Counts a capture that was discarded before it reached a region.
    pub fn record_dropped(&mut self) -> Result<()> {
        self.monitoring.dropped_acquisitions += 1;
        self.mapping.write(BridgeHeader::MONITORING_OFFSET, &self.monitoring)
    }

    pub fn monitoring(&self) -> Monitoring {
        self.monitoring
    }
}

impl<M: SharedMemoryDriver, D: SemaphoreDriver> Drop for BridgeWriter<M, D> {
    fn drop(&mut self) {
        let unlink = |result: Result<()>, what: &str| match result {
            Ok(()) | Err(Error::DoesNotExist(_)) => (),
            Err(error) => warn!("bridge {}: cannot remove {what}: {error}", self.name),
        };
        if let Ok(name) = shared_memory_name(&self.name) {
            unlink(M::unlink(&name), "shared memory");
        }
        if let Ok(name) = semaphore_name(&self.name) {
            unlink(D::unlink(&name), "semaphore");
        }
        info!("bridge {}: closed after {} acquisitions", self.name,
            self.monitoring.total_acquisitions);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    Timeout,
    /// The semaphore can no longer be waited on.
    InvalidHandle,
}

/// Consumer side of a bridge.
#[derive(Debug)]
pub struct BridgeReader<M: SharedMemoryDriver = NativeSharedMemory,
                        D: SemaphoreDriver = NativeSemaphore> {
    name: String,
    mapping: Mapping<M>,
    semaphore: Semaphore<D>,
    config: BridgeConfig,
    layout: BridgeLayout,
    acquired: Option<Region>,
    last_sequence: Option<u64>,
    missed: u64,
}

impl<M: SharedMemoryDriver, D: SemaphoreDriver> BridgeReader<M, D> {
    /// Opens the bridge `name`, checking that its layout is the one this build understands.
    pub fn open(name: &str) -> Result<BridgeReader<M, D>> {
        let memory = M::open(&shared_memory_name(name)?)?;
        if memory.len() < BridgeHeader::SIZE {
            return Err(Error::LayoutMismatch(format!(
                "segment of {} bytes cannot hold a bridge header", memory.len())))
        }
        let mapping = Mapping { memory };
        let version = mapping.bytes(BridgeHeader::VERSION_OFFSET, 1)[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch { expected: PROTOCOL_VERSION, found: version })
        }
        let header: BridgeHeader = mapping.read(0)?;
        let layout = BridgeLayout::new(&header.bridge)?;
        if header.data_capacity_bytes != layout.data_capacity_bytes() as u64 {
            return Err(Error::LayoutMismatch(format!(
                "data capacity of {} bytes does not match {:?}",
                header.data_capacity_bytes, header.bridge)))
        }
        if mapping.memory.len() < layout.total_bytes() {
            return Err(Error::LayoutMismatch(format!(
                "segment of {} bytes is smaller than the {} bytes required",
                mapping.memory.len(), layout.total_bytes())))
        }
        let semaphore = Semaphore::create_or_open(&semaphore_name(name)?)?;
        info!("bridge {name}: opened, {} acquisitions so far",
            header.monitoring.total_acquisitions);
        Ok(BridgeReader {
            name: name.to_owned(),
            mapping,
            semaphore,
            config: header.bridge,
            layout,
            acquired: None,
            last_sequence: None,
            missed: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BridgeConfig {
        self.config
    }

    pub fn header(&self) -> Result<BridgeHeader> {
        self.mapping.read(0)
    }

    /// Overwrites both configuration snapshots; the producer picks them up on its next cycle.
    pub fn update_config(&mut self, hardware: &HardwareConfig, processing: &ProcessingConfig)
            -> Result<()> {
        processing.validate(&self.config)?;
        self.mapping.write(BridgeHeader::HARDWARE_OFFSET, hardware)?;
        self.mapping.write(BridgeHeader::PROCESSING_OFFSET, processing)
    }

    /// Waits up to `timeout` for a commit (`None` waits indefinitely). On `Ready`, the region
    /// committed most recently is available until the next call.
    pub fn request_and_wait_for_data(&mut self, timeout: Option<Duration>) -> WaitResult {
        match self.semaphore.wait(timeout) {
            Ok(true) => (),
            Ok(false) => return WaitResult::Timeout,
            Err(error) => {
                warn!("bridge {}: wait failed: {error}", self.name);
                return WaitResult::InvalidHandle
            }
        }
        let acquiring = self.mapping.acquiring_region().load(Ordering::Acquire);
        let region = match Region::from_code(acquiring) {
            Ok(region) => region.other(),
            Err(error) => {
                warn!("bridge {}: {error}", self.name);
                return WaitResult::InvalidHandle
            }
        };
        let sequence = self.mapping.sequence(&self.layout, region);
        if let Some(last_sequence) = self.last_sequence {
            if sequence > last_sequence + 1 {
                self.missed += sequence - last_sequence - 1;
                debug!("bridge {}: missed {} regions before #{}", self.name,
                    sequence - last_sequence - 1, sequence);
            }
        }
        if self.last_sequence.map_or(true, |last_sequence| sequence > last_sequence) {
            self.last_sequence = Some(sequence);
        }
        self.acquired = Some(region);
        WaitResult::Ready
    }

    /// The region acquired by the last successful wait.
    pub fn acquired_region(&self) -> Option<Region> {
        self.acquired
    }

    fn require_acquired(&self) -> Result<Region> {
        self.acquired.ok_or_else(|| Error::InvalidParameter("no region has been acquired".to_owned()))
    }

    pub fn acquired_region_header(&self) -> Result<DataRegionHeader> {
        let region = self.require_acquired()?;
        self.mapping.read(self.layout.region_header_offset(region))
    }

    /// The channel data of the acquired region, packed channel after channel at the geometry
    /// recorded in its header.
    pub fn acquired_region_data(&self) -> Result<&[u8]> {
        let region = self.require_acquired()?;
        let header = self.acquired_region_header()?;
        let len = header.processing.data_bytes().min(self.layout.region_data_bytes());
        Ok(self.mapping.bytes(self.layout.region_data_offset(region), len))
    }

    /// Samples of the `index`-th channel stored in the acquired region.
    pub fn acquired_channel<S: Sample>(&self, index: usize) -> Result<&[S]> {
        let header = self.acquired_region_header()?;
        if header.data_type != S::DATA_TYPE {
            return Err(Error::Config(format!("region holds {:?} samples, not {:?}",
                header.data_type, S::DATA_TYPE)))
        }
        let processing = header.processing;
        if index >= processing.current_channel_count as usize {
            return Err(Error::InvalidParameter(format!("region holds {} channels, not {}",
                processing.current_channel_count, index + 1)))
        }
        let channel_bytes = processing.current_channel_data_length as usize * S::DATA_TYPE.width();
        let data = self.acquired_region_data()?;
        let bytes = data.get(index * channel_bytes..(index + 1) * channel_bytes)
            .ok_or_else(|| Error::LayoutMismatch(format!("channel {index} exceeds the region")))?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|error| Error::LayoutMismatch(format!("channel {index}: {error}")))
    }

    /// Commits that were overwritten before this reader got to them.
    pub fn missed_regions(&self) -> u64 {
        self.missed
    }
}

impl BridgeConfig {
    /// Checks that a region header describes data this bridge can hold.
    pub fn check_region(&self, header: &DataRegionHeader) -> Result<()> {
        header.processing.validate(self)?;
        if header.data_type != self.channel_data_type {
            return Err(Error::Config(format!("region data type {:?} differs from {:?}",
                header.data_type, self.channel_data_type)))
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{DataType, TriggerMode};
    use crate::sys::local::{LocalSemaphore, LocalSharedMemory};
    use crate::trigger::EdgeParameters;

    type Writer = BridgeWriter<LocalSharedMemory, LocalSemaphore>;
    type Reader = BridgeReader<LocalSharedMemory, LocalSemaphore>;

    const SHORT: Option<Duration> = Some(Duration::from_millis(10));

    fn small_config() -> BridgeConfig {
        BridgeConfig { max_channel_count: 2, max_channel_data_length: 16,
            channel_data_type: DataType::I8 }
    }

    fn region_header(writer: &Writer, triggered: bool) -> DataRegionHeader {
        DataRegionHeader {
            hardware: writer.hardware_config().unwrap(),
            processing: writer.processing_config().unwrap(),
            triggered,
            data_type: writer.config().channel_data_type,
            sequence: 0,
        }
    }

    fn commit_filled(writer: &mut Writer, value: u8) -> u64 {
        writer.begin_region().fill(value);
        let header = region_header(writer, true);
        writer.commit_region(header).unwrap()
    }

    #[test]
    fn test_names() {
        assert_eq!(semaphore_name("scope").unwrap(), "/thunderscope.scope");
        assert_eq!(shared_memory_name("scope").unwrap(), "/thunderscope.scope.shm");
        assert!(matches!(semaphore_name(""), Err(Error::InvalidName(_))));
        assert!(matches!(shared_memory_name("a/b"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_layout() {
        let layout = BridgeLayout::new(&small_config()).unwrap();
        assert_eq!(layout.region_data_bytes(), 32);
        assert_eq!(layout.data_capacity_bytes(), 64);
        assert_eq!(layout.region_header_offset(Region::A), 320);
        assert_eq!(layout.region_data_offset(Region::A), 320 + 320);
        assert_eq!(layout.region_header_offset(Region::B), 320 + 320 + 64);
        assert_eq!(layout.total_bytes(), 320 + 2 * (320 + 64));
        for region in [Region::A, Region::B] {
            assert_eq!(layout.region_data_offset(region) % 64, 0);
        }
        let invalid = BridgeConfig { max_channel_count: 5, ..small_config() };
        assert!(matches!(BridgeLayout::new(&invalid), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_round_trip() {
        let mut writer = Writer::create("config-round-trip", small_config()).unwrap();
        let mut hardware = HardwareConfig::default();
        hardware.sample_rate_hz = 500_000_000;
        hardware.frontend[1].volt_offset = 0.25;
        let processing = ProcessingConfig {
            current_channel_count: 2,
            current_channel_data_length: 10,
            trigger_mode: TriggerMode::Auto,
            edge: EdgeParameters { level: 40, hysteresis: 2 },
            ..Default::default()
        };
        writer.update_config(&hardware, &processing).unwrap();

        let reader = Reader::open("config-round-trip").unwrap();
        let header = reader.header().unwrap();
        assert_eq!(header.hardware.to_bytes(), hardware.to_bytes());
        assert_eq!(header.processing.to_bytes(), processing.to_bytes());
        assert_eq!(header.hardware, hardware);
        assert_eq!(header.processing, processing);
        assert_eq!(header.bridge, small_config());
    }

    #[test]
    fn test_reader_writes_back_config() {
        let writer = Writer::create("write-back", small_config()).unwrap();
        let mut reader = Reader::open("write-back").unwrap();
        let mut processing = reader.header().unwrap().processing;
        processing.edge.level = -17;
        reader.update_config(&HardwareConfig::default(), &processing).unwrap();
        assert_eq!(writer.processing_config().unwrap().edge.level, -17);

        processing.current_channel_data_length = 17;
        assert!(matches!(reader.update_config(&HardwareConfig::default(), &processing),
            Err(Error::Config(_))));
        assert_eq!(writer.processing_config().unwrap().current_channel_data_length, 16);
    }

    #[test]
    fn test_regions_alternate() {
        let mut writer = Writer::create("regions-alternate", small_config()).unwrap();
        let mut reader = Reader::open("regions-alternate").unwrap();
        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Timeout);
        assert!(reader.acquired_region_data().is_err());

        for value in 1..=4u8 {
            let committed = writer.acquiring_region();
            assert_eq!(commit_filled(&mut writer, value), value as u64);
            assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Ready);

            let acquiring = reader.header().unwrap().acquiring_region;
            assert_eq!(acquiring, writer.acquiring_region());
            assert_eq!(reader.acquired_region(), Some(acquiring.other()));
            assert_eq!(reader.acquired_region(), Some(committed));

            let header = reader.acquired_region_header().unwrap();
            assert_eq!(header.sequence, value as u64);
            assert!(header.triggered);
            let data = reader.acquired_region_data().unwrap();
            assert_eq!(data.len(), 2 * 16);
            assert!(data.iter().all(|&byte| byte == value));
        }
        assert_eq!(reader.missed_regions(), 0);
        assert_eq!(writer.monitoring().total_acquisitions, 4);
        assert_eq!(reader.header().unwrap().monitoring.last_sequence, 4);
    }

    #[test]
    fn test_missed_regions_are_counted() {
        let mut writer = Writer::create("missed-regions", small_config()).unwrap();
        let mut reader = Reader::open("missed-regions").unwrap();
        commit_filled(&mut writer, 1);
        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Ready);
        for value in 2..=5 {
            commit_filled(&mut writer, value);
        }
        // every commit posts once, so the reader sees the newest region four times
        for _ in 0..4 {
            assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Ready);
            assert_eq!(reader.acquired_region_header().unwrap().sequence, 5);
        }
        assert_eq!(reader.missed_regions(), 3);
        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Timeout);
    }

    #[test]
    fn test_channels_are_packed() {
        let mut writer = Writer::create("channels-packed", small_config()).unwrap();
        let mut reader = Reader::open("channels-packed").unwrap();
        let processing = ProcessingConfig {
            current_channel_count: 2,
            current_channel_data_length: 4,
            ..writer.processing_config().unwrap()
        };
        writer.update_config(&HardwareConfig::default(), &processing).unwrap();
        writer.begin_region()[..8].copy_from_slice(&[1, 2, 3, 4, 0xfb, 0xfa, 0xf9, 0xf8]);
        let header = region_header(&writer, false);
        writer.commit_region(header).unwrap();

        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Ready);
        assert_eq!(reader.acquired_region_data().unwrap().len(), 8);
        assert_eq!(reader.acquired_channel::<i8>(0).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(reader.acquired_channel::<i8>(1).unwrap(), &[-5, -6, -7, -8]);
        assert!(matches!(reader.acquired_channel::<i8>(2), Err(Error::InvalidParameter(_))));
        assert!(matches!(reader.acquired_channel::<i16>(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_wide_samples() {
        let config = BridgeConfig { channel_data_type: DataType::I16, ..small_config() };
        let mut writer = Writer::create("wide-samples", config).unwrap();
        let mut reader = Reader::open("wide-samples").unwrap();
        let samples: Vec<i16> = (0..32).map(|i| i * 100 - 1600).collect();
        writer.begin_region().copy_from_slice(bytemuck::cast_slice(&samples));
        let header = region_header(&writer, true);
        assert_eq!(header.data_type, <i16 as Sample>::DATA_TYPE);
        writer.commit_region(header).unwrap();
        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Ready);
        assert_eq!(reader.acquired_channel::<i16>(1).unwrap(), &samples[16..]);
    }

    #[test]
    fn test_version_mismatch() {
        let _writer = Writer::create("version-mismatch", small_config()).unwrap();
        let memory = LocalSharedMemory::open(&shared_memory_name("version-mismatch").unwrap())
            .unwrap();
        // SAFETY: The segment is at least one header long.
        unsafe { *memory.as_ptr() = PROTOCOL_VERSION + 1 };
        assert!(matches!(Reader::open("version-mismatch"),
            Err(Error::VersionMismatch { expected: PROTOCOL_VERSION, found })
                if found == PROTOCOL_VERSION + 1));
    }

    #[test]
    fn test_producer_gone() {
        let mut writer = Writer::create("producer-gone", small_config()).unwrap();
        let mut reader = Reader::open("producer-gone").unwrap();
        writer.record_dropped().unwrap();
        assert_eq!(reader.header().unwrap().monitoring.dropped_acquisitions, 1);
        drop(writer);
        assert!(matches!(Reader::open("producer-gone"), Err(Error::DoesNotExist(_))));
        assert_eq!(reader.request_and_wait_for_data(SHORT), WaitResult::Timeout);
    }

    #[test]
    fn test_check_region() {
        let writer = Writer::create("check-region", small_config()).unwrap();
        let mut header = region_header(&writer, true);
        assert!(small_config().check_region(&header).is_ok());
        header.data_type = DataType::I16;
        assert!(small_config().check_region(&header).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_native_round_trip() {
        // the object names stay within the 31 byte limit of Darwin
        let name = format!("t{}n", std::process::id());
        let mut writer = BridgeWriter::<NativeSharedMemory, NativeSemaphore>::create(
            &name, small_config()).unwrap();
        let mut reader = BridgeReader::<NativeSharedMemory, NativeSemaphore>::open(&name).unwrap();
        writer.begin_region().fill(0x42);
        let header = DataRegionHeader {
            hardware: writer.hardware_config().unwrap(),
            processing: writer.processing_config().unwrap(),
            triggered: true,
            data_type: DataType::I8,
            sequence: 0,
        };
        writer.commit_region(header).unwrap();
        assert_eq!(reader.request_and_wait_for_data(Some(Duration::from_secs(1))),
            WaitResult::Ready);
        assert!(reader.acquired_channel::<i8>(1).unwrap().iter().all(|&sample| sample == 0x42));
    }
}
