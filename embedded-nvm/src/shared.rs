use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::{AccessLock, BlockDevice, DeviceInfo, DeviceState, ErrorType};

/// A block device shared between several users, for example the partitions of one flash chip.
///
/// Each [SharedHandle] locks the device for the duration of a single operation.
/// [BlockDevice::transaction] on a handle, or on anything stacked on top of a handle,
/// holds the lock for the whole sequence.
///
/// The raw mutex `M` must tolerate nested locking from the same context. All the
/// embassy-sync raw mutexes do.
pub struct SharedDevice<M: RawMutex, D> {
    inner: Mutex<M, RefCell<D>>,
}

impl<M: RawMutex, D> SharedDevice<M, D> {
    pub const fn new(device: D) -> Self {
        SharedDevice {
            inner: Mutex::new(RefCell::new(device)),
        }
    }

    /// Create a new handle on the device
    pub fn handle(&self) -> SharedHandle<'_, M, D> {
        SharedHandle { shared: self }
    }

    /// Run `f` with the device locked.
    ///
    /// Must not be nested inside another call to `lock` on the same device.
    pub fn lock<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        self.inner.lock(|device| f(&mut device.borrow_mut()))
    }

    pub fn into_inner(self) -> D {
        self.inner.into_inner().into_inner()
    }
}

impl<M: RawMutex, D> AccessLock for &SharedDevice<M, D> {
    fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.lock(|_| f())
    }
}

/// Handle on a [SharedDevice], implementing [BlockDevice] by locking per operation.
pub struct SharedHandle<'a, M: RawMutex, D> {
    shared: &'a SharedDevice<M, D>,
}

// Clone without requiring the device to be Clone
impl<M: RawMutex, D> Clone for SharedHandle<'_, M, D> {
    fn clone(&self) -> Self {
        SharedHandle {
            shared: self.shared,
        }
    }
}

impl<M: RawMutex, D: ErrorType> ErrorType for SharedHandle<'_, M, D> {
    type Error = D::Error;
}

impl<'a, M: RawMutex, D: BlockDevice> BlockDevice for SharedHandle<'a, M, D> {
    type Lock = &'a SharedDevice<M, D>;

    fn state(&self) -> DeviceState {
        self.shared.inner.lock(|device| device.borrow().state())
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.start())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.stop())
    }

    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        self.shared.lock(|device| device.info())
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.read(offset, bytes))
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.write(offset, bytes))
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.erase(offset, length))
    }

    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.mass_erase())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.sync())
    }

    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.write_protect(offset, length))
    }

    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.mass_write_protect())
    }

    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.write_unprotect(offset, length))
    }

    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        self.shared.lock(|device| device.mass_write_unprotect())
    }

    fn lock_handle(&self) -> Self::Lock {
        self.shared
    }
}
