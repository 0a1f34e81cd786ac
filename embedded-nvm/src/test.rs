use crate::iter::SectorIter;
use crate::{
    check_active, check_erase, check_read, check_ready, check_write, BlockDevice, DeviceInfo,
    DeviceState, ErrorType, NvmErrorKind, Unlocked,
};

/// A virtual NOR flash implementation that can be used for testing purposes.
///
/// Writes can only clear bits (the stored byte becomes `old & new`), erases set whole sectors
/// back to 0xFF. Protection works at sector granularity.
///
/// A power budget can be set with [VirtualFlash::power_off_after]. Every programmed byte and
/// every erased sector consumes one unit. When the budget runs out the operation stops where it
/// is, returns [Error::PowerLoss] and every later operation fails until
/// [VirtualFlash::restore_power] is called. The storage is kept, modelling a device that was
/// unplugged mid write.
#[derive(Debug, Clone)]
pub struct VirtualFlash<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize> {
    storage: [[u8; SECTOR_SIZE]; SECTOR_COUNT],
    protected: [bool; SECTOR_COUNT],
    erase_count: [u32; SECTOR_COUNT],
    state: DeviceState,
    write_alignment: u32,
    identification: [u8; 3],
    power_budget: Option<usize>,
    powered: bool,
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize> Default
    for VirtualFlash<SECTOR_SIZE, SECTOR_COUNT>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize> VirtualFlash<SECTOR_SIZE, SECTOR_COUNT> {
    /// Creates a new, fully erased instance of the virtual flash.
    pub fn new() -> Self {
        Self {
            storage: [[0xFF; SECTOR_SIZE]; SECTOR_COUNT],
            protected: [false; SECTOR_COUNT],
            erase_count: [0; SECTOR_COUNT],
            state: DeviceState::Stopped,
            write_alignment: 1,
            identification: [0xBF, 0x25, 0x8E],
            power_budget: None,
            powered: true,
        }
    }

    /// Require writes to be multiples of `write_alignment`
    pub fn with_write_alignment(mut self, write_alignment: u32) -> Self {
        self.write_alignment = write_alignment;
        self
    }

    /// Contents of a sector
    pub fn sector(&self, sector: usize) -> &[u8; SECTOR_SIZE] {
        &self.storage[sector]
    }

    /// Contents of the whole device
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_flattened()
    }

    /// Number of times a sector has been erased
    pub fn erase_count(&self, sector: usize) -> u32 {
        self.erase_count[sector]
    }

    /// Lose power after `budget` more programmed bytes or erased sectors
    pub fn power_off_after(&mut self, budget: usize) {
        self.power_budget = Some(budget);
    }

    /// Units left in the power budget, [None] if unlimited
    pub fn power_budget(&self) -> Option<usize> {
        self.power_budget
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    /// Power the device back up. Contents are kept, the device is [DeviceState::Stopped].
    pub fn restore_power(&mut self) {
        self.powered = true;
        self.power_budget = None;
        self.state = DeviceState::Stopped;
    }

    fn capacity(&self) -> u32 {
        (SECTOR_SIZE * SECTOR_COUNT) as u32
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(SECTOR_SIZE as u32, SECTOR_COUNT as u32, self.identification)
            .with_write_alignment(self.write_alignment)
    }

    fn check_powered(&self) -> Result<(), Error> {
        if self.powered {
            Ok(())
        } else {
            Err(Error::PowerLoss)
        }
    }

    /// Consume one unit of the power budget, failing if there is none left
    fn consume(&mut self) -> Result<(), Error> {
        match self.power_budget {
            Some(0) => {
                debug!("Virtual flash lost power");
                self.powered = false;
                self.state = DeviceState::Stopped;
                Err(Error::PowerLoss)
            }
            Some(ref mut left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn check_unprotected(&self, offset: u32, length: u32) -> Result<(), Error> {
        if SectorIter::covering(SECTOR_SIZE as u32, offset, length)
            .any(|(sector, _)| self.protected[sector.as_u32() as usize])
        {
            return Err(Error::Protected);
        }
        Ok(())
    }

    /// Sectors covered by a protection request, which must be sector aligned
    fn protect_range(&self, offset: u32, length: u32) -> Result<SectorIter, Error> {
        check_erase(&self.device_info(), offset, length)?;
        if offset % SECTOR_SIZE as u32 != 0 || length % SECTOR_SIZE as u32 != 0 {
            return Err(Error::NotAligned);
        }
        Ok(SectorIter::covering(SECTOR_SIZE as u32, offset, length))
    }

    fn erase_sector(&mut self, sector: usize) -> Result<(), Error> {
        self.consume()?;
        self.storage[sector].fill(0xFF);
        self.erase_count[sector] += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Out of bounds
    #[error("Requested bytes out of bounds")]
    OutOfBounds,
    /// Not aligned
    #[error("Requested bytes not aligned")]
    NotAligned,
    /// Device not started
    #[error("Device not ready")]
    NotReady,
    /// Range is write protected
    #[error("Range is write protected")]
    Protected,
    /// Simulated power loss
    #[error("Power lost")]
    PowerLoss,
}

impl crate::NvmError for Error {
    fn kind(&self) -> NvmErrorKind {
        match self {
            Error::OutOfBounds => NvmErrorKind::OutOfBounds,
            Error::NotAligned => NvmErrorKind::NotAligned,
            Error::NotReady => NvmErrorKind::InvalidState,
            Error::Protected => NvmErrorKind::Protected,
            Error::PowerLoss => NvmErrorKind::PowerLoss,
        }
    }
}

impl From<NvmErrorKind> for Error {
    fn from(kind: NvmErrorKind) -> Self {
        match kind {
            NvmErrorKind::NotAligned => Error::NotAligned,
            NvmErrorKind::InvalidState => Error::NotReady,
            NvmErrorKind::Protected => Error::Protected,
            NvmErrorKind::PowerLoss => Error::PowerLoss,
            _ => Error::OutOfBounds,
        }
    }
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize> ErrorType
    for VirtualFlash<SECTOR_SIZE, SECTOR_COUNT>
{
    type Error = Error;
}

impl<const SECTOR_SIZE: usize, const SECTOR_COUNT: usize> BlockDevice
    for VirtualFlash<SECTOR_SIZE, SECTOR_COUNT>
{
    type Lock = Unlocked;

    fn state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        self.check_powered()?;
        if self.state == DeviceState::Stopped {
            self.state = DeviceState::Ready;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.state = DeviceState::Stopped;
        Ok(())
    }

    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        Ok(self.device_info())
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        check_ready(self.state)?;
        check_read(&self.device_info(), offset, bytes.len())?;
        trace!("Reading {} bytes from {}", bytes.len(), offset);
        let start = offset as usize;
        bytes.copy_from_slice(&self.storage.as_flattened()[start..start + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        check_ready(self.state)?;
        check_write(&self.device_info(), offset, bytes.len())?;
        self.check_unprotected(offset, bytes.len() as u32)?;
        trace!("Writing {} bytes to {}", bytes.len(), offset);
        self.state = DeviceState::Writing;
        let start = offset as usize;
        for (i, b) in bytes.iter().enumerate() {
            self.consume()?;
            self.storage.as_flattened_mut()[start + i] &= *b;
        }
        self.state = DeviceState::Ready;
        Ok(())
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        self.check_powered()?;
        check_ready(self.state)?;
        check_erase(&self.device_info(), offset, length)?;
        self.check_unprotected(offset, length)?;
        self.state = DeviceState::Erasing;
        for (sector, _) in SectorIter::covering(SECTOR_SIZE as u32, offset, length) {
            trace!("Erasing sector {}", sector.as_u32());
            self.erase_sector(sector.as_u32() as usize)?;
        }
        self.state = DeviceState::Ready;
        Ok(())
    }

    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        self.erase(0, self.capacity())
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.check_powered()?;
        check_active(self.state)?;
        Ok(())
    }

    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        for (sector, _) in self.protect_range(offset, length)? {
            self.protected[sector.as_u32() as usize] = true;
        }
        Ok(())
    }

    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        self.protected = [true; SECTOR_COUNT];
        Ok(())
    }

    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        for (sector, _) in self.protect_range(offset, length)? {
            self.protected[sector.as_u32() as usize] = false;
        }
        Ok(())
    }

    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        self.protected = [false; SECTOR_COUNT];
        Ok(())
    }

    fn lock_handle(&self) -> Self::Lock {
        Unlocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Adds logging to the test automatically
    // control with RUST_LOG="LEVEL"
    // requires --features log passed to cargo test
    use test_log::test;

    const SECTOR_SIZE: usize = 128;
    const SECTOR_COUNT: usize = 16;
    const CAPACITY: usize = SECTOR_SIZE * SECTOR_COUNT;

    fn started() -> VirtualFlash<SECTOR_SIZE, SECTOR_COUNT> {
        let mut flash = VirtualFlash::new();
        flash.start().unwrap();
        flash
    }

    /// Test read, write and erase of entire flash
    #[test]
    fn test_all_rwe() {
        let mut flash = started();
        let buffer = [0; CAPACITY];
        flash.write(0, &buffer).unwrap();
        let mut rbuffer = [1; CAPACITY];
        flash.read(0, &mut rbuffer).unwrap();
        assert_eq!(buffer, rbuffer);
        flash.mass_erase().unwrap();
        flash.read(0, &mut rbuffer).unwrap();
        assert_eq!(rbuffer, [0xFF; CAPACITY]);
    }

    /// Writes only clear bits
    #[test]
    fn test_write_is_and() {
        let mut flash = started();
        flash.write(5, &[0xF0]).unwrap();
        flash.write(5, &[0x3C]).unwrap();
        assert_eq!(flash.sector(0)[5], 0x30);
    }

    /// Erase rounds outward to sector boundaries
    #[test]
    fn test_erase_rounds_outward() {
        let mut flash = started();
        flash.write(0, &[0; CAPACITY]).unwrap();
        flash.erase(SECTOR_SIZE as u32 + 10, SECTOR_SIZE as u32).unwrap();
        assert!(flash.sector(0).iter().all(|&b| b == 0));
        assert!(flash.sector(1).iter().all(|&b| b == 0xFF));
        assert!(flash.sector(2).iter().all(|&b| b == 0xFF));
        assert!(flash.sector(3).iter().all(|&b| b == 0));
        assert_eq!(flash.erase_count(1), 1);
        assert_eq!(flash.erase_count(3), 0);
    }

    #[test]
    fn test_stopped_device_rejects_operations() {
        let mut flash = VirtualFlash::<SECTOR_SIZE, SECTOR_COUNT>::new();
        assert_eq!(flash.write(0, &[0]), Err(Error::NotReady));
        flash.start().unwrap();
        flash.stop().unwrap();
        let mut buf = [0; 1];
        assert_eq!(flash.read(0, &mut buf), Err(Error::NotReady));
        assert_eq!(flash.sync(), Err(Error::NotReady));
    }

    #[test]
    fn test_out_of_bounds_and_alignment() {
        let mut flash = started();
        assert_eq!(flash.write(CAPACITY as u32, &[0]), Err(Error::OutOfBounds));
        let mut flash = VirtualFlash::<SECTOR_SIZE, SECTOR_COUNT>::new().with_write_alignment(2);
        flash.start().unwrap();
        assert_eq!(flash.write(1, &[0, 0]), Err(Error::NotAligned));
        assert_eq!(flash.info().unwrap().write_alignment, 2);
    }

    #[test]
    fn test_protection() {
        let mut flash = started();
        assert_eq!(flash.write_protect(1, 10), Err(Error::NotAligned));
        flash.write_protect(SECTOR_SIZE as u32, SECTOR_SIZE as u32).unwrap();
        assert_eq!(flash.write(SECTOR_SIZE as u32, &[0]), Err(Error::Protected));
        assert_eq!(flash.erase(0, 2 * SECTOR_SIZE as u32), Err(Error::Protected));
        // nothing changed
        assert_eq!(flash.erase_count(0), 0);
        flash.write(0, &[0]).unwrap();
        flash.mass_write_unprotect().unwrap();
        flash.write(SECTOR_SIZE as u32, &[0]).unwrap();
    }

    /// Power loss stops a write part way through
    #[test]
    fn test_power_loss_truncates_write() {
        let mut flash = started();
        flash.power_off_after(3);
        assert_eq!(flash.write(0, &[0; 8]), Err(Error::PowerLoss));
        assert!(!flash.is_powered());
        assert_eq!(&flash.sector(0)[..4], &[0, 0, 0, 0xFF]);
        let mut buf = [0; 1];
        assert_eq!(flash.read(0, &mut buf), Err(Error::PowerLoss));
        flash.restore_power();
        assert_eq!(flash.state(), DeviceState::Stopped);
        flash.start().unwrap();
        flash.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0xFF]);
    }
}
