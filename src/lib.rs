//! Acquisition-to-display data path of the ThunderScope: streaming trigger detection over sample
//! chunks, capture window extraction, and hand-off of captured windows to display processes
//! through a double-buffered shared memory bridge.

use std::io;

/// Declares a fieldless `repr(u8)` enum together with its wire code conversions.
macro_rules! code_enum {
    {
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $( $( #[$variant_meta:meta] )* $variant:ident = $code:literal ),+ $(,)?
        }
    } => {
        $( #[$meta] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        #[repr(u8)]
        pub enum $name {
            $( $( #[$variant_meta] )* $variant = $code ),+
        }

        impl $name {
            pub fn code(self) -> u8 {
                self as u8
            }

            pub fn from_code(code: u8) -> $crate::Result<Self> {
                match code {
                    $( $code => Ok(Self::$variant), )+
                    _ => Err($crate::Error::InvalidEnum {
                        field: stringify!($name),
                        value: code as u64,
                    }),
                }
            }
        }
    };
}

mod sys;
mod sample;
mod config;
mod wire;
mod trigger;
mod semaphore;
mod capture;
mod bridge;
mod pipeline;
mod stream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bridge protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("bridge layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("name {0:?} is too long")]
    NameTooLong(String),
    #[error("name {0:?} is not a valid object name")]
    InvalidName(String),
    #[error("permission denied for {0:?}")]
    PermissionDenied(String),
    #[error("resource limit exceeded for {0:?}")]
    ResourceLimit(String),
    #[error("{0:?} already exists with an incompatible mode")]
    AlreadyExists(String),
    #[error("{0:?} does not exist")]
    DoesNotExist(String),

    #[error("horizontal parameters must be set before processing")]
    HorizontalNotSet,
    #[error("window trigger position {trigger_position} is not within window width {width}")]
    InvalidHorizontal { width: u64, trigger_position: u64 },
    #[error("trigger results are full (capacity {capacity})")]
    ResultsFull { capacity: usize },
    #[error("chunk is out of stream order: expected offset {expected}, got {found}")]
    Discontinuity { expected: u64, found: u64 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("truncated data: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("invalid {field} value {value}")]
    InvalidEnum { field: &'static str, value: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(io_error) =>
                io_error,
            Error::DoesNotExist(_) =>
                Self::new(io::ErrorKind::NotFound, error),
            Error::PermissionDenied(_) =>
                Self::new(io::ErrorKind::PermissionDenied, error),
            Error::AlreadyExists(_) =>
                Self::new(io::ErrorKind::AlreadyExists, error),
            Error::Truncated { .. } | Error::InvalidEnum { .. } =>
                Self::new(io::ErrorKind::InvalidData, error),
            error =>
                Self::new(io::ErrorKind::Other, error),
        }
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use sample::{
    Sample,
    Resolution,
};

pub use config::{
    MAX_CHANNELS,
    DataType,
    AdcChannelMode,
    Coupling,
    Termination,
    Bandwidth,
    EnabledChannels,
    ChannelFrontend,
    ChannelCalibration,
    HardwareConfig,
    TriggerMode,
    TriggerType,
    ProcessingConfig,
    BridgeConfig,
};

pub use wire::{
    PROTOCOL_VERSION,
    WAVEFORM_VERSION,
    Wire,
    Encoder,
    Decoder,
    Region,
    Monitoring,
    BridgeHeader,
    DataRegionHeader,
    WaveformHeader,
    ChannelHeader,
};

pub use trigger::{
    Edge,
    EdgeParameters,
    BurstParameters,
    Horizontal,
    State,
    TriggerResults,
    TriggerEngine,
    Detector,
    Trigger,
    EdgeDetector,
    AnyEdgeDetector,
    BurstDetector,
    EdgeTrigger,
    AnyEdgeTrigger,
    BurstTrigger,
    build_engine,
};

pub use sys::{
    SemaphoreDriver,
    SharedMemoryDriver,
    NativeSemaphore,
    NativeSharedMemory,
    local::{LocalSemaphore, LocalSharedMemory},
};

pub use semaphore::Semaphore;

pub use capture::{
    RingBuffer,
    SampleHistory,
};

pub use bridge::{
    BridgeLayout,
    BridgeWriter,
    BridgeReader,
    WaitResult,
    semaphore_name,
    shared_memory_name,
};

pub use pipeline::{
    PipelineConfig,
    Pipeline,
    Cycle,
};

pub use stream::{
    Waveform,
    WaveformServer,
    request_waveform,
};
