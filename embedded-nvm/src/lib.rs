#![no_std]

#[cfg(test)]
extern crate std;

mod fmt;

mod address;
pub mod iter;
mod shared;
pub mod test;
pub use address::{ByteAddress, SectorIndex};
pub use shared::{SharedDevice, SharedHandle};

pub trait NvmError: core::fmt::Debug {
    /// Convert a specific NVM error into a generic error kind
    fn kind(&self) -> NvmErrorKind;
}

impl NvmError for NvmErrorKind {
    fn kind(&self) -> NvmErrorKind {
        *self
    }
}

/// A trait that block device implementations can use to share an error type.
pub trait ErrorType {
    /// Errors returned by this block device.
    type Error: NvmError;
}

impl<T: ErrorType + ?Sized> ErrorType for &mut T {
    type Error = T::Error;
}

/// Block device error kinds.
///
/// Block device implementations must map their error to those generic error kinds through the
/// [`NvmError`] trait.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum NvmErrorKind {
    /// The arguments are not properly aligned.
    NotAligned,

    /// The arguments are out of bounds.
    OutOfBounds,

    /// The device is stopped or busy with another operation.
    InvalidState,

    /// The range is write protected.
    Protected,

    /// The bus (SPI, I2C) reported an error.
    Transport,

    /// Metadata on the medium does not match any known layout.
    CorruptMetadata,

    /// The configuration does not fit the underlying device.
    InvalidConfig,

    /// Power was removed during the operation. Only produced by simulators.
    PowerLoss,

    /// Error specific to the implementation.
    Other,
}

/// Geometry and identity of a block device.
///
/// The address space is `[0, sector_size * sector_num)` bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Smallest erasable unit in bytes
    pub sector_size: u32,
    /// Number of sectors
    pub sector_num: u32,
    /// Identification bytes, usually the JEDEC ID
    pub identification: [u8; 3],
    /// Smallest legal write chunk in bytes, 1 when the device has no constraint
    pub write_alignment: u32,
}

impl DeviceInfo {
    pub const fn new(sector_size: u32, sector_num: u32, identification: [u8; 3]) -> Self {
        DeviceInfo {
            sector_size,
            sector_num,
            identification,
            write_alignment: 1,
        }
    }

    pub const fn with_write_alignment(mut self, write_alignment: u32) -> Self {
        self.write_alignment = write_alignment;
        self
    }

    /// Size of the address space in bytes
    pub const fn capacity(&self) -> u32 {
        self.sector_size.saturating_mul(self.sector_num)
    }
}

/// Lifecycle of a block device handle.
///
/// A freshly constructed handle is [DeviceState::Stopped]. Mutating operations are only
/// accepted in [DeviceState::Ready] and pass through the matching busy state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    #[default]
    Stopped,
    Ready,
    Reading,
    Writing,
    Erasing,
}

impl DeviceState {
    pub fn is_ready(&self) -> bool {
        *self == DeviceState::Ready
    }

    /// Started and not yet stopped, possibly busy
    pub fn is_active(&self) -> bool {
        *self != DeviceState::Stopped
    }
}

/// Exclusive access to a device, held for the duration of a closure.
///
/// Owned devices are already exclusive through `&mut`, so they use [Unlocked].
/// Devices shared between several handles hold the shared lock.
pub trait AccessLock {
    fn hold<R>(&self, f: impl FnOnce() -> R) -> R;
}

/// Lock for devices that are not shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlocked;

impl AccessLock for Unlocked {
    fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

/// Sector oriented persistent storage.
///
/// Addresses are byte offsets into `[0, info().capacity())`. Reads and writes cross sector
/// boundaries transparently. Every operation either completes or returns an error, there is
/// no partial success.
pub trait BlockDevice: ErrorType {
    /// Lock taken by [BlockDevice::transaction]
    type Lock: AccessLock;

    /// Current lifecycle state
    fn state(&self) -> DeviceState;

    /// Bring the device from [DeviceState::Stopped] to [DeviceState::Ready].
    ///
    /// Starting a device that is already started is a no-op.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Return the device to [DeviceState::Stopped]. Outstanding writes are synced first.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Geometry and identity of the device
    fn info(&mut self) -> Result<DeviceInfo, Self::Error>;

    /// Read `bytes.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte lies outside the device or the medium fails. The
    /// implementation can use the [`check_read`] helper function.
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `bytes` starting at `offset`.
    ///
    /// Unless the medium supports overwriting, the range must have been erased since it was
    /// last written. Implementations may require `offset` and `bytes.len()` to be multiples
    /// of [DeviceInfo::write_alignment], see [`check_write`].
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Erase every sector that intersects `[offset, offset + length)`.
    ///
    /// The range is rounded outward to sector boundaries, so bytes outside the range in the
    /// first and last sector are erased as well. The erased range reads as all 1s afterwards.
    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error>;

    /// Erase the whole device in the fastest way the medium supports
    fn mass_erase(&mut self) -> Result<(), Self::Error>;

    /// Block until all pending writes and erases are committed
    fn sync(&mut self) -> Result<(), Self::Error>;

    /// Protect `[offset, offset + length)` against writes and erases.
    ///
    /// Fails without side effects when the range does not match a protectable region.
    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error>;

    /// Protect the whole device
    fn mass_write_protect(&mut self) -> Result<(), Self::Error>;

    /// Remove protection from `[offset, offset + length)`.
    ///
    /// Fails without side effects when the remaining protected range would not be a
    /// protectable region.
    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error>;

    /// Remove protection from the whole device
    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error>;

    /// Handle on the lock that serialises access to this device
    fn lock_handle(&self) -> Self::Lock;

    /// Run `f` with exclusive access to the device.
    ///
    /// No other handle on the same device observes the intermediate states of the sequence.
    /// Access is released on every exit path.
    fn transaction<R, F>(&mut self, f: F) -> Result<R, Self::Error>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<R, Self::Error>,
    {
        let lock = self.lock_handle();
        lock.hold(|| f(self))
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    type Lock = T::Lock;

    fn state(&self) -> DeviceState {
        T::state(self)
    }
    fn start(&mut self) -> Result<(), Self::Error> {
        T::start(self)
    }
    fn stop(&mut self) -> Result<(), Self::Error> {
        T::stop(self)
    }
    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        T::info(self)
    }
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        T::read(self, offset, bytes)
    }
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        T::write(self, offset, bytes)
    }
    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        T::erase(self, offset, length)
    }
    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        T::mass_erase(self)
    }
    fn sync(&mut self) -> Result<(), Self::Error> {
        T::sync(self)
    }
    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        T::write_protect(self, offset, length)
    }
    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        T::mass_write_protect(self)
    }
    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        T::write_unprotect(self, offset, length)
    }
    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        T::mass_write_unprotect(self)
    }
    fn lock_handle(&self) -> Self::Lock {
        T::lock_handle(self)
    }
}

/// Return whether the device accepts a read, write or erase
pub fn check_ready(state: DeviceState) -> Result<(), NvmErrorKind> {
    if state.is_ready() {
        Ok(())
    } else {
        Err(NvmErrorKind::InvalidState)
    }
}

/// Return whether the device accepts a sync or info request
pub fn check_active(state: DeviceState) -> Result<(), NvmErrorKind> {
    if state.is_active() {
        Ok(())
    } else {
        Err(NvmErrorKind::InvalidState)
    }
}

/// Return whether a read operation is within bounds.
pub fn check_read(info: &DeviceInfo, offset: u32, length: usize) -> Result<(), NvmErrorKind> {
    check_slice(info.capacity(), 1, offset, length)
}

/// Return whether a write operation is aligned and within bounds.
pub fn check_write(info: &DeviceInfo, offset: u32, length: usize) -> Result<(), NvmErrorKind> {
    check_slice(
        info.capacity(),
        info.write_alignment.max(1),
        offset,
        length,
    )
}

/// Return whether an erase operation is within bounds.
///
/// Erases are rounded outward to sector boundaries, so alignment is not checked.
pub fn check_erase(info: &DeviceInfo, offset: u32, length: u32) -> Result<(), NvmErrorKind> {
    check_slice(info.capacity(), 1, offset, length as usize)
}

pub fn check_slice(
    capacity: u32,
    align: u32,
    offset: u32,
    length: usize,
) -> Result<(), NvmErrorKind> {
    if length as u64 > capacity as u64 || offset > (capacity - (length as u32)) {
        return Err(NvmErrorKind::OutOfBounds);
    }
    if offset % align != 0 || length as u32 % align != 0 {
        return Err(NvmErrorKind::NotAligned);
    }
    Ok(())
}
