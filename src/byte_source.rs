use std::collections::VecDeque;
use std::io::{self, Read};
use std::time::Duration;
use thiserror::Error;
use tokio_serial::SerialPort;
use tracing::info;

const SERIAL_BAUD_RATE: u32 = 9600;
const MAX_CHUNK_SIZE: usize = 512;

/// Failures raised by a [`ByteSource`]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error while reading from meter: {0}")]
    Io(#[from] io::Error),

    #[error("Meter device disconnected")]
    Disconnected,
}

/// Anything that yields the raw bytes the meter transmits
pub trait ByteSource {
    /// Reads one chunk of bytes, waiting at most `timeout`.
    /// An empty chunk means nothing arrived in time.
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Reads the meter's optical interface through a serial device
pub struct SerialByteSource {
    port: Box<dyn SerialPort>,
}

impl SerialByteSource {
    /// Opens the serial device with the settings the meter transmits at (9600 8N1)
    pub fn open(port_name: &str) -> Result<Self, TransportError> {
        let port = tokio_serial::new(port_name, SERIAL_BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_secs(1))
            .open()?;
        info!("Opened serial port {port_name} at {SERIAL_BAUD_RATE} baud");
        Ok(Self { port })
    }
}

impl ByteSource for SerialByteSource {
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.port.set_timeout(timeout)?;
        let mut buffer = [0u8; MAX_CHUNK_SIZE];
        match self.port.read(&mut buffer) {
            // A zero length read on a tty means the device went away
            Ok(0) => Err(TransportError::Disconnected),
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory byte source replaying scripted chunks, used instead of the serial device in tests
#[derive(Default)]
pub struct MemoryByteSource {
    chunks: VecDeque<Result<Vec<u8>, TransportError>>,
    read_count: usize,
}

impl MemoryByteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a whole byte stream, split into chunks of `chunk_size` bytes
    pub fn from_stream(data: &[u8], chunk_size: usize) -> Self {
        let mut source = Self::new();
        source.push_stream(data, chunk_size);
        source
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.chunks.push_back(Ok(chunk.to_vec()));
    }

    pub fn push_stream(&mut self, data: &[u8], chunk_size: usize) {
        for chunk in data.chunks(chunk_size.max(1)) {
            self.push_chunk(chunk);
        }
    }

    /// Queues a transport failure to be returned by the next read in line
    pub fn push_error(&mut self, error: TransportError) {
        self.chunks.push_back(Err(error));
    }

    /// Number of `read_chunk` calls served so far
    pub fn read_count(&self) -> usize {
        self.read_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ByteSource for MemoryByteSource {
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.read_count += 1;
        match self.chunks.pop_front() {
            Some(chunk) => chunk,
            None => {
                // Behave like a silent serial line
                std::thread::sleep(timeout);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_replays_chunks_in_order() {
        let mut source = MemoryByteSource::from_stream(&[1, 2, 3, 4, 5], 2);
        let timeout = Duration::from_millis(10);
        assert_eq!(source.read_chunk(timeout).unwrap(), vec![1, 2]);
        assert_eq!(source.read_chunk(timeout).unwrap(), vec![3, 4]);
        assert_eq!(source.read_chunk(timeout).unwrap(), vec![5]);
        assert!(source.is_exhausted());
        // Exhausted sources behave like a silent line
        assert!(source.read_chunk(timeout).unwrap().is_empty());
        assert_eq!(source.read_count(), 4);
    }

    #[test]
    fn test_memory_source_returns_queued_errors() {
        let mut source = MemoryByteSource::new();
        source.push_error(TransportError::Disconnected);
        source.push_chunk(&[0x1b]);

        let result = source.read_chunk(Duration::from_millis(10));
        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert_eq!(source.read_chunk(Duration::from_millis(10)).unwrap(), vec![0x1b]);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Disconnected;
        assert_eq!(err.to_string(), "Meter device disconnected");
    }
}
