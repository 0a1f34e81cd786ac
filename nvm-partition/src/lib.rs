#![no_std]

//! Split one block device into several smaller ones.
//!
//! A [Partition] is a window of whole sectors on a parent device. Every operation is bound
//! checked against the window and forwarded with the address shifted by the window start.
//! To put several partitions on one chip, give each a [embedded_nvm::SharedHandle] of the
//! same [embedded_nvm::SharedDevice]; operations on different partitions then contend for
//! the parent lock.

#[cfg(test)]
extern crate std;

mod fmt;

use embedded_nvm::{
    check_active, check_erase, check_read, check_ready, check_write, BlockDevice, DeviceInfo,
    DeviceState, ErrorType, NvmError, NvmErrorKind,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error<E> {
    /// Error from the parent device
    #[error("Parent device error")]
    Parent(E),
    /// The partition does not fit the parent
    #[error("Invalid configuration for partition")]
    InvalidConfig,
    #[error("Request not aligned")]
    NotAligned,
    #[error("Request out of bounds")]
    OutOfBounds,
    #[error("Partition not ready")]
    NotReady,
    #[error("Other Error")]
    Other,
}

impl<E: NvmError> NvmError for Error<E> {
    fn kind(&self) -> NvmErrorKind {
        match self {
            Error::Parent(e) => e.kind(),
            Error::InvalidConfig => NvmErrorKind::InvalidConfig,
            Error::NotAligned => NvmErrorKind::NotAligned,
            Error::OutOfBounds => NvmErrorKind::OutOfBounds,
            Error::NotReady => NvmErrorKind::InvalidState,
            Error::Other => NvmErrorKind::Other,
        }
    }
}

// This is for convenience, to convert from the NvmErrorKind to the Error
// when calling the check functions
impl<E> From<NvmErrorKind> for Error<E> {
    fn from(e: NvmErrorKind) -> Self {
        match e {
            NvmErrorKind::NotAligned => Error::NotAligned,
            NvmErrorKind::OutOfBounds => Error::OutOfBounds,
            NvmErrorKind::InvalidState => Error::NotReady,
            NvmErrorKind::InvalidConfig => Error::InvalidConfig,
            _ => Error::Other,
        }
    }
}

/// A range of whole sectors of a parent device, itself a [BlockDevice]
#[derive(Debug)]
pub struct Partition<P> {
    parent: P,
    /// First parent sector of the partition
    sector_offset: u32,
    /// Number of sectors in the partition
    sector_num: u32,
    state: DeviceState,
    /// Parent geometry, read on start
    parent_info: DeviceInfo,
}

impl<P: BlockDevice> Partition<P> {
    /// Create a stopped partition of `sector_num` sectors starting at parent sector
    /// `sector_offset`. The layout is checked against the parent on [BlockDevice::start]
    pub fn new(parent: P, sector_offset: u32, sector_num: u32) -> Self {
        Partition {
            parent,
            sector_offset,
            sector_num,
            state: DeviceState::Stopped,
            parent_info: DeviceInfo::default(),
        }
    }

    pub fn sector_offset(&self) -> u32 {
        self.sector_offset
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    /// Return the parent device
    pub fn into_inner(self) -> P {
        self.parent
    }

    /// Parent byte address of partition address 0
    fn base(&self) -> u32 {
        self.sector_offset * self.parent_info.sector_size
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            sector_num: self.sector_num,
            ..self.parent_info
        }
    }

    /// Forward to the parent in `busy` state, returning to Ready whatever the result.
    /// The caller checks the partition is Ready
    fn forward<R>(
        &mut self,
        busy: DeviceState,
        f: impl FnOnce(&mut P, u32) -> Result<R, P::Error>,
    ) -> Result<R, Error<P::Error>> {
        self.state = busy;
        let base = self.base();
        let result = f(&mut self.parent, base).map_err(Error::Parent);
        self.state = DeviceState::Ready;
        result
    }
}

impl<P: BlockDevice> ErrorType for Partition<P> {
    type Error = Error<P::Error>;
}

impl<P: BlockDevice> BlockDevice for Partition<P> {
    type Lock = P::Lock;

    fn state(&self) -> DeviceState {
        self.state
    }

    /// Starts the parent if needed, then checks the partition fits it
    fn start(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            return Ok(());
        }
        self.parent.start().map_err(Error::Parent)?;
        let info = self.parent.info().map_err(Error::Parent)?;
        let fits = self
            .sector_offset
            .checked_add(self.sector_num)
            .is_some_and(|end| end <= info.sector_num);
        if self.sector_num == 0 || !fits {
            error!(
                "Partition of {} sectors at {} does not fit parent of {} sectors",
                self.sector_num,
                self.sector_offset,
                info.sector_num
            );
            return Err(Error::InvalidConfig);
        }
        self.parent_info = info;
        self.state = DeviceState::Ready;
        debug!(
            "Started partition at sector {} with {} sectors",
            self.sector_offset,
            self.sector_num
        );
        Ok(())
    }

    /// Stops the partition only, the parent may be shared
    fn stop(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            self.parent.sync().map_err(Error::Parent)?;
            self.state = DeviceState::Stopped;
        }
        Ok(())
    }

    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        if !self.state.is_active() {
            self.parent_info = self.parent.info().map_err(Error::Parent)?;
        }
        Ok(self.device_info())
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_read(&self.device_info(), offset, bytes.len())?;
        self.forward(DeviceState::Reading, |parent, base| {
            parent.read(base + offset, bytes)
        })
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_write(&self.device_info(), offset, bytes.len())?;
        self.forward(DeviceState::Writing, |parent, base| {
            parent.write(base + offset, bytes)
        })
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_erase(&self.device_info(), offset, length)?;
        self.forward(DeviceState::Erasing, |parent, base| {
            parent.erase(base + offset, length)
        })
    }

    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        let capacity = self.device_info().capacity();
        self.forward(DeviceState::Erasing, |parent, base| {
            parent.erase(base, capacity)
        })
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.parent.sync().map_err(Error::Parent)
    }

    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_active(self.state)?;
        check_erase(&self.device_info(), offset, length)?;
        self.parent
            .write_protect(self.base() + offset, length)
            .map_err(Error::Parent)
    }

    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        let capacity = self.device_info().capacity();
        self.parent
            .write_protect(self.base(), capacity)
            .map_err(Error::Parent)
    }

    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_active(self.state)?;
        check_erase(&self.device_info(), offset, length)?;
        self.parent
            .write_unprotect(self.base() + offset, length)
            .map_err(Error::Parent)
    }

    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        let capacity = self.device_info().capacity();
        self.parent
            .write_unprotect(self.base(), capacity)
            .map_err(Error::Parent)
    }

    fn lock_handle(&self) -> Self::Lock {
        self.parent.lock_handle()
    }
}
