use embedded_nvm::{BlockDevice, NvmError, NvmErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamError<E> {
    #[error("Device")]
    Device(E),
    #[error("End of stream")]
    EndOfStream,
}

impl<E: NvmError> NvmError for StreamError<E> {
    fn kind(&self) -> NvmErrorKind {
        match self {
            StreamError::Device(e) => e.kind(),
            StreamError::EndOfStream => NvmErrorKind::OutOfBounds,
        }
    }
}

/// Sequential byte access to a block device.
///
/// Writes append at the end of stream, reads consume from the read position. The read
/// position never passes the end of stream and the end of stream never passes the capacity
/// of the device. Each device access runs in its own [BlockDevice::transaction].
#[derive(Debug)]
pub struct NvmStream<D> {
    device: D,
    capacity: u32,
    eos: u32,
    position: u32,
}

impl<D: BlockDevice> NvmStream<D> {
    /// Create an empty stream over a started device
    pub fn new(mut device: D) -> Result<Self, StreamError<D::Error>> {
        let info = device.info().map_err(StreamError::Device)?;
        Ok(Self {
            device,
            capacity: info.capacity(),
            eos: 0,
            position: 0,
        })
    }

    /// Append as much of `bytes` as fits, returning the count written
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, StreamError<D::Error>> {
        let n = bytes.len().min((self.capacity - self.eos) as usize);
        if n == 0 {
            return Ok(0);
        }
        let offset = self.eos;
        self.device
            .transaction(|dev| dev.write(offset, &bytes[..n]))
            .map_err(StreamError::Device)?;
        self.eos += n as u32;
        Ok(n)
    }

    /// Read up to `bytes.len()` bytes before the end of stream, returning the count read
    pub fn read(&mut self, bytes: &mut [u8]) -> Result<usize, StreamError<D::Error>> {
        let n = bytes.len().min((self.eos - self.position) as usize);
        if n == 0 {
            return Ok(0);
        }
        let offset = self.position;
        self.device
            .transaction(|dev| dev.read(offset, &mut bytes[..n]))
            .map_err(StreamError::Device)?;
        self.position += n as u32;
        Ok(n)
    }

    pub fn put(&mut self, byte: u8) -> Result<(), StreamError<D::Error>> {
        match self.write(&[byte])? {
            0 => Err(StreamError::EndOfStream),
            _ => Ok(()),
        }
    }

    pub fn get(&mut self) -> Result<u8, StreamError<D::Error>> {
        let mut byte = [0];
        match self.read(&mut byte)? {
            0 => Err(StreamError::EndOfStream),
            _ => Ok(byte[0]),
        }
    }

    /// Move the read position back to the start
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Move the read position, clamped to the end of stream
    pub fn seek(&mut self, position: u32) {
        self.position = position.min(self.eos);
    }

    pub fn eos(&self) -> u32 {
        self.eos
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn into_inner(self) -> D {
        self.device
    }
}
