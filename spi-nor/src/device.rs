use core::fmt::Debug;
use core::ops::Range;

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use embedded_nvm::iter::SectorIter;
use embedded_nvm::{
    check_active, check_erase, check_read, check_ready, check_write, BlockDevice, ByteAddress,
    DeviceInfo, DeviceState, ErrorType, Unlocked,
};

use crate::error::SpiNorError;
use crate::protect::{self, bp_mask, bp_value};
use crate::{JedecConfig, JedecID, AAI_WORD_PROGRAM_COMMAND};

/// A [DelayNs] that returns immediately, for drivers that poll without sleeping
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// JEDEC SPI NOR flash device implementing [BlockDevice].
///
/// Generic over the SPI peripheral and a delay used to sleep between status polls when
/// [JedecConfig::nice_waiting] is set. Use [NoDelay] to always spin.
///
/// Access is exclusive through `&mut`. Wrap the device in an [embedded_nvm::SharedDevice]
/// to share it, for example between partitions.
pub struct JedecSpiFlash<SPI, DL> {
    pub spi: SPI,
    pub(crate) delay: DL,
    pub(crate) config: JedecConfig,
    state: DeviceState,
    id: JedecID,
}

// Manually implement Debug to avoid bounds on SPI and the delay
impl<SPI, DL> Debug for JedecSpiFlash<SPI, DL> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JedecSpiFlash")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("id", &self.id)
            .finish()
    }
}

impl<SPI, DL> JedecSpiFlash<SPI, DL> {
    /// Create a new stopped device. Nothing is sent until [BlockDevice::start]
    pub fn new(spi: SPI, delay: DL, config: JedecConfig) -> Self {
        JedecSpiFlash {
            spi,
            delay,
            config,
            state: DeviceState::Stopped,
            id: JedecID::default(),
        }
    }

    pub fn config(&self) -> &JedecConfig {
        &self.config
    }

    /// JEDEC ID read during [BlockDevice::start]
    pub fn jedec_id(&self) -> JedecID {
        self.id
    }

    /// Release the SPI peripheral and the delay
    pub fn release(self) -> (SPI, DL) {
        (self.spi, self.delay)
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(
            self.config.sector_size,
            self.config.sector_num,
            self.id.to_bytes(),
        )
        .with_write_alignment(self.config.write_alignment())
    }
}

impl<SPI: SpiDevice, DL: DelayNs> JedecSpiFlash<SPI, DL> {
    /// Run `f` in `busy` state, returning to Ready whatever the result
    fn busy<R>(
        &mut self,
        busy: DeviceState,
        f: impl FnOnce(&mut Self) -> Result<R, SpiNorError<SPI::Error>>,
    ) -> Result<R, SpiNorError<SPI::Error>> {
        check_ready(self.state)?;
        self.state = busy;
        let result = f(self);
        self.state = DeviceState::Ready;
        result
    }

    /// Byte range currently covered by the block protection bits
    pub fn protected_range(&mut self) -> Result<Range<u32>, SpiNorError<SPI::Error>> {
        let status = self.read_status_cmd()?;
        Ok(protect::protected_range(
            self.config.capacity(),
            self.config.bpbits_num,
            bp_value(status, self.config.bpbits_num),
        ))
    }

    fn check_unprotected(
        &mut self,
        offset: u32,
        length: u32,
    ) -> Result<(), SpiNorError<SPI::Error>> {
        if self.config.bpbits_num == 0 {
            return Ok(());
        }
        let region = self.protected_range()?;
        if protect::intersects(&region, offset, length) {
            warn!("Access to {} bytes at {} hits protected range", length, offset);
            return Err(SpiNorError::Protected);
        }
        Ok(())
    }

    /// Replace the block protection bits with `value`, keeping the other status bits
    fn set_protection(&mut self, value: u8) -> Result<(), SpiNorError<SPI::Error>> {
        let status = self.read_status_cmd()?;
        let mask = bp_mask(self.config.bpbits_num);
        let new = (status & !mask) | ((value << protect::BP_SHIFT) & mask);
        if new == status {
            return Ok(());
        }
        debug!("Setting block protection to {}", value);
        self.write_status(new & !crate::STATUS_WIP & !crate::STATUS_WEL)
    }

    fn current_protection(&mut self) -> Result<u8, SpiNorError<SPI::Error>> {
        Ok(bp_value(self.read_status_cmd()?, self.config.bpbits_num))
    }

    fn program(
        &mut self,
        mut offset: u32,
        mut bytes: &[u8],
    ) -> Result<(), SpiNorError<SPI::Error>> {
        if self.config.cmd_page_program == AAI_WORD_PROGRAM_COMMAND {
            return self.program_aai(offset, bytes);
        }
        // Split into runs that stay within one page
        while !bytes.is_empty() {
            let to_boundary = ByteAddress::new(offset).remaining_in(self.config.page_alignment);
            let len = (bytes.len() as u32)
                .min(self.config.page_size)
                .min(to_boundary) as usize;
            self.program_page(offset, &bytes[..len])?;
            offset += len as u32;
            bytes = &bytes[len..];
        }
        Ok(())
    }

    /// Fill the whole device with 0xFF, for devices without an erase command
    fn fill_erased(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        let blank = [0xFF; 64];
        let capacity = self.config.capacity();
        let mut offset = 0;
        while offset < capacity {
            let len = (capacity - offset).min(blank.len() as u32);
            self.program(offset, &blank[..len as usize])?;
            offset += len;
        }
        Ok(())
    }
}

impl<SPI: SpiDevice, DL> ErrorType for JedecSpiFlash<SPI, DL> {
    type Error = SpiNorError<SPI::Error>;
}

impl<SPI: SpiDevice, DL: DelayNs> BlockDevice for JedecSpiFlash<SPI, DL> {
    type Lock = Unlocked;

    fn state(&self) -> DeviceState {
        self.state
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            return Ok(());
        }
        if !self.config.validate() {
            error!("Invalid JEDEC configuration");
            return Err(SpiNorError::InvalidConfig);
        }
        self.id = self.read_jedec_id_cmd()?;
        debug!(
            "Started JEDEC flash {} {} {}",
            self.id.manufacturer(),
            self.id.device(),
            self.config.capacity()
        );
        self.state = DeviceState::Ready;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            self.wait_ready()?;
            self.state = DeviceState::Stopped;
            debug!("Stopped JEDEC flash");
        }
        Ok(())
    }

    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        Ok(self.device_info())
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(&self.device_info(), offset, bytes.len())?;
        trace!("Reading {} bytes from {}", bytes.len(), offset);
        self.busy(DeviceState::Reading, |dev| dev.read_cmd(offset, bytes))
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(&self.device_info(), offset, bytes.len())?;
        trace!("Writing {} bytes to {}", bytes.len(), offset);
        self.busy(DeviceState::Writing, |dev| {
            dev.check_unprotected(offset, bytes.len() as u32)?;
            dev.program(offset, bytes)
        })
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_erase(&self.device_info(), offset, length)?;
        trace!("Erasing {} bytes from {}", length, offset);
        self.busy(DeviceState::Erasing, |dev| {
            if !dev.config.needs_erase() {
                return Ok(());
            }
            let sectors = SectorIter::covering(dev.config.sector_size, offset, length);
            let bounds = sectors.clone().next().zip(sectors.clone().next_back());
            if let Some((first, last)) = bounds {
                let end = last.1.as_u32() + dev.config.sector_size;
                dev.check_unprotected(first.1.as_u32(), end - first.1.as_u32())?;
            }
            for (_, address) in sectors {
                dev.erase_sector(address.as_u32())?;
            }
            Ok(())
        })
    }

    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        self.busy(DeviceState::Erasing, |dev| {
            dev.check_unprotected(0, dev.config.capacity())?;
            if dev.config.needs_erase() {
                dev.erase_chip()
            } else {
                dev.fill_erased()
            }
        })
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.wait_ready()
    }

    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_erase(&self.device_info(), offset, length)?;
        check_active(self.state)?;
        let current = self.current_protection()?;
        let value = protect::protect(
            self.config.capacity(),
            self.config.bpbits_num,
            current,
            offset..offset + length,
        )
        .ok_or(SpiNorError::Unprotectable)?;
        self.set_protection(value)
    }

    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        if self.config.bpbits_num == 0 {
            return Err(SpiNorError::Unprotectable);
        }
        self.set_protection(protect::bp_max(self.config.bpbits_num))
    }

    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_erase(&self.device_info(), offset, length)?;
        check_active(self.state)?;
        let current = self.current_protection()?;
        let value = protect::unprotect(
            self.config.capacity(),
            self.config.bpbits_num,
            current,
            offset..offset + length,
        )
        .ok_or(SpiNorError::Unprotectable)?;
        self.set_protection(value)
    }

    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.set_protection(0)
    }

    fn lock_handle(&self) -> Self::Lock {
        Unlocked
    }
}
