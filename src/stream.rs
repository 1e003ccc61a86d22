//! Waveform streaming over TCP.
//!
//! A client sends the request line `S\n`; the server answers with a [`WaveformHeader`], then for
//! each channel a [`ChannelHeader`] followed by the raw samples. When no acquisition arrives within
//! the request timeout the answer is a header with no channels.

use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::{Error, Result, Resolution};
use crate::bridge::{BridgeReader, WaitResult};
use crate::config::DataType;
use crate::sys::{SemaphoreDriver, SharedMemoryDriver};
use crate::wire::{ChannelHeader, DataRegionHeader, WAVEFORM_VERSION, WaveformHeader, Wire};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_REQUEST_LEN: usize = 64;

/// One decoded response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Waveform {
    pub header: WaveformHeader,
    pub channels: Vec<(ChannelHeader, Vec<u8>)>,
}

impl Waveform {
    /// Samples of the `index`-th channel as sign-extended codes.
    pub fn codes(&self, index: usize) -> Option<Vec<i32>> {
        let (header, data) = self.channels.get(index)?;
        Some(codes(header.data_type, data).collect())
    }

    /// Samples of the `index`-th channel converted to volts.
    pub fn volts(&self, index: usize) -> Option<Vec<f64>> {
        let (header, _) = self.channels.get(index)?;
        let (scale, offset) = (header.scale as f64, header.offset as f64);
        Some(self.codes(index)?.into_iter().map(|code| code as f64 * scale + offset).collect())
    }
}

fn codes(data_type: DataType, data: &[u8]) -> Box<dyn Iterator<Item = i32> + '_> {
    match data_type {
        DataType::I8 => Box::new(data.iter().map(|&byte| byte as i8 as i32)),
        DataType::I16 => Box::new(data.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as i32)),
    }
}

/// Serves the latest acquisition of a bridge to one TCP client at a time.
#[derive(Debug)]
pub struct WaveformServer {
    listener: TcpListener,
    request_timeout: Duration,
    last_total: Option<(Instant, u64)>,
}

impl WaveformServer {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<WaveformServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("stream: listening on {}", listener.local_addr()?);
        Ok(WaveformServer { listener, request_timeout: Duration::from_secs(1), last_total: None })
    }

    /// How long a request waits for a new acquisition before it is answered with no channels.
    pub fn with_request_timeout(mut self, timeout: Duration) -> WaveformServer {
        self.request_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves clients until `stop` is set.
    pub fn serve<M: SharedMemoryDriver, D: SemaphoreDriver>(&mut self,
            reader: &mut BridgeReader<M, D>, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!("stream: client {peer} connected");
                    match self.serve_client(&stream, reader, stop) {
                        Ok(()) => info!("stream: client {peer} disconnected"),
                        Err(Error::DoesNotExist(name)) =>
                            return Err(Error::DoesNotExist(name)),
                        Err(error) => warn!("stream: client {peer} dropped: {error}"),
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock =>
                    thread::sleep(POLL_INTERVAL),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn serve_client<M: SharedMemoryDriver, D: SemaphoreDriver>(&mut self, stream: &TcpStream,
            reader: &mut BridgeReader<M, D>, stop: &AtomicBool) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let mut input = BufReader::new(stream);
        let mut request = Vec::new();
        let mut byte = [0; 1];
        while !stop.load(Ordering::Relaxed) {
            match input.read(&mut byte) {
                Ok(0) => return Ok(()),
                Ok(_) if byte[0] == b'\n' => {
                    self.answer(&request, stream, reader)?;
                    request.clear();
                }
                Ok(_) if request.len() < MAX_REQUEST_LEN => request.push(byte[0]),
                Ok(_) => return Err(Error::InvalidParameter("request line too long".to_owned())),
                Err(error) if matches!(error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut |
                    io::ErrorKind::Interrupted) => (),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    fn answer<M: SharedMemoryDriver, D: SemaphoreDriver>(&mut self, request: &[u8],
            mut stream: &TcpStream, reader: &mut BridgeReader<M, D>) -> Result<()> {
        let request = request.strip_suffix(b"\r").unwrap_or(request);
        if request != b"S" {
            debug!("stream: ignoring request {:?}", String::from_utf8_lossy(request));
            return Ok(())
        }
        let response = match reader.request_and_wait_for_data(Some(self.request_timeout)) {
            WaitResult::Ready => self.encode_acquisition(reader)?,
            WaitResult::Timeout => {
                debug!("stream: no acquisition within {:?}", self.request_timeout);
                WaveformHeader { version: WAVEFORM_VERSION, ..Default::default() }.to_bytes()
            }
            WaitResult::InvalidHandle => return Err(Error::DoesNotExist(reader.name().to_owned())),
        };
        stream.write_all(&response)?;
        Ok(())
    }

    fn waveform_rate(&mut self, total_acquisitions: u64) -> f64 {
        let now = Instant::now();
        let rate = match self.last_total {
            Some((then, before)) if now > then =>
                total_acquisitions.saturating_sub(before) as f64 / (now - then).as_secs_f64(),
            _ => 0.0,
        };
        self.last_total = Some((now, total_acquisitions));
        rate
    }

    fn encode_acquisition<M: SharedMemoryDriver, D: SemaphoreDriver>(&mut self,
            reader: &BridgeReader<M, D>) -> Result<Vec<u8>> {
        let region = reader.acquired_region_header()?;
        let data = reader.acquired_region_data()?;
        let rate = self.waveform_rate(reader.header()?.monitoring.total_acquisitions);
        encode_waveform(&region, data, rate)
    }
}

/// Encodes a committed region as a complete response.
fn encode_waveform(region: &DataRegionHeader, data: &[u8], waveform_rate: f64)
        -> Result<Vec<u8>> {
    let DataRegionHeader { hardware, processing, triggered, data_type, sequence } = *region;
    let fs_per_sample = hardware.fs_per_sample();
    let trigger_fs = if triggered {
        processing.horizontal(&hardware)?.window_trigger_position() * fs_per_sample
    } else {
        0
    };
    let resolution = Resolution::new(hardware.resolution_bits as u32)?;
    let depth = processing.current_channel_data_length as usize;
    let channel_bytes = depth * data_type.width();

    let mut response = WaveformHeader {
        version: WAVEFORM_VERSION,
        sequence: sequence as u32,
        channel_count: processing.current_channel_count as u16,
        fs_per_sample,
        trigger_fs,
        waveform_rate,
    }.to_bytes();
    // data channels are the enabled channels in ascending order
    let mut physical = hardware.enabled_channels.indices();
    for index in 0..processing.current_channel_count as usize {
        let channel = physical.next().unwrap_or(index);
        let samples = data.get(index * channel_bytes..(index + 1) * channel_bytes)
            .ok_or_else(|| Error::LayoutMismatch(format!("channel {index} exceeds the region")))?;
        let header = ChannelHeader {
            channel_index: channel as u8,
            depth: depth as u64,
            scale: hardware.volts_per_code(channel) as f32,
            offset: hardware.code_to_volts(channel, 0) as f32,
            trigger_phase: 0.0,
            clipping: codes(data_type, samples)
                .any(|code| code <= resolution.min() || code >= resolution.max()),
            data_type,
        };
        response.extend_from_slice(&header.to_bytes());
        response.extend_from_slice(samples);
    }
    Ok(response)
}

fn read_wire<T: Wire>(stream: &mut impl Read) -> Result<T> {
    let mut raw = vec![0; T::SIZE];
    stream.read_exact(&mut raw)?;
    T::from_bytes(&raw)
}

/// Sends one request and decodes the response.
pub fn request_waveform<T: Read + Write>(stream: &mut T) -> Result<Waveform> {
    stream.write_all(b"S\n")?;
    stream.flush()?;
    let header: WaveformHeader = read_wire(stream)?;
    if header.version != WAVEFORM_VERSION {
        return Err(Error::VersionMismatch { expected: WAVEFORM_VERSION, found: header.version })
    }
    let mut channels = Vec::with_capacity(header.channel_count as usize);
    for _ in 0..header.channel_count {
        let channel: ChannelHeader = read_wire(stream)?;
        let len = channel.data_bytes().ok_or_else(|| Error::InvalidParameter(
            format!("channel depth {} is not addressable", channel.depth)))?;
        let mut data = vec![0; len];
        stream.read_exact(&mut data)?;
        channels.push((channel, data));
    }
    Ok(Waveform { header, channels })
}
