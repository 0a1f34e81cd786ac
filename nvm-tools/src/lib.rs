#![no_std]

//! Range helpers and a byte stream built only on [BlockDevice].
//!
//! The helpers write over existing data without erasing first. They suit devices where a
//! write replaces the old bytes, such as a flash emulated EEPROM or a byte overwritable NOR.

#[cfg(test)]
extern crate std;

mod fmt;

mod stream;
pub use stream::{NvmStream, StreamError};

use embedded_nvm::{BlockDevice, NvmError, NvmErrorKind};
use thiserror::Error;

/// Bytes moved per device call
const CHUNK: usize = 64;

/// Error of a helper working on two devices, tagged by argument position
#[derive(Debug, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ToolError<EA, EB> {
    #[error("First device")]
    First(EA),
    #[error("Second device")]
    Second(EB),
    #[error("Write alignment larger than the copy buffer")]
    AlignmentTooLarge,
}

impl<EA: NvmError, EB: NvmError> NvmError for ToolError<EA, EB> {
    fn kind(&self) -> NvmErrorKind {
        match self {
            ToolError::First(e) => e.kind(),
            ToolError::Second(e) => e.kind(),
            ToolError::AlignmentTooLarge => NvmErrorKind::NotAligned,
        }
    }
}

/// Largest multiple of `align` that fits the buffer
fn chunk_size(align: u32) -> Option<usize> {
    let align = align.max(1) as usize;
    match (CHUNK / align) * align {
        0 => None,
        size => Some(size),
    }
}

/// Compare the first `length` bytes of `a` and `b`.
///
/// Returns `Ok(true)` when they are equal.
pub fn cmp<A, B>(
    a: &mut A,
    b: &mut B,
    length: u32,
) -> Result<bool, ToolError<A::Error, B::Error>>
where
    A: BlockDevice,
    B: BlockDevice,
{
    let mut left = [0u8; CHUNK];
    let mut right = [0u8; CHUNK];
    let mut offset = 0;
    while offset < length {
        let n = CHUNK.min((length - offset) as usize);
        a.read(offset, &mut left[..n]).map_err(ToolError::First)?;
        b.read(offset, &mut right[..n]).map_err(ToolError::Second)?;
        if left[..n] != right[..n] {
            trace!("Devices differ in the chunk at {}", offset);
            return Ok(false);
        }
        offset += n as u32;
    }
    Ok(true)
}

/// Copy the first `length` bytes of `src` to `dst`.
///
/// Writes honour the write alignment of `dst`. When `length` is not a multiple of it the last
/// unit is padded with 0xFF. Stops at the first failure.
pub fn copy<D, S>(
    dst: &mut D,
    src: &mut S,
    length: u32,
) -> Result<(), ToolError<D::Error, S::Error>>
where
    D: BlockDevice,
    S: BlockDevice,
{
    let align = dst.info().map_err(ToolError::First)?.write_alignment.max(1);
    let size = chunk_size(align).ok_or(ToolError::AlignmentTooLarge)?;
    debug!("Copying {} bytes in chunks of {}", length, size);
    let mut buf = [0u8; CHUNK];
    let mut offset = 0;
    while offset < length {
        let n = size.min((length - offset) as usize);
        src.read(offset, &mut buf[..n]).map_err(ToolError::Second)?;
        let padded = n.next_multiple_of(align as usize);
        buf[n..padded].fill(0xFF);
        dst.write(offset, &buf[..padded]).map_err(ToolError::First)?;
        offset += n as u32;
    }
    Ok(())
}

/// Fill the first `length` bytes of `dst` with `pattern`.
///
/// The range is extended to the next multiple of the write alignment of `dst`.
pub fn set<D>(dst: &mut D, pattern: u8, length: u32) -> Result<(), D::Error>
where
    D: BlockDevice,
    D::Error: From<NvmErrorKind>,
{
    let align = dst.info()?.write_alignment.max(1);
    let size = chunk_size(align).ok_or(NvmErrorKind::NotAligned)?;
    let length = length.next_multiple_of(align);
    let buf = [pattern; CHUNK];
    let mut offset = 0;
    while offset < length {
        let n = size.min((length - offset) as usize);
        dst.write(offset, &buf[..n])?;
        offset += n as u32;
    }
    Ok(())
}
