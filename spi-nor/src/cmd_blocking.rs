use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Operation, SpiDevice};

use crate::error::SpiNorError;
use crate::protect::bp_mask;
use crate::utils::{command_with_address, spi_transaction, spi_transfer_in_place, spi_write};
use crate::{
    JedecSpiFlash, JedecID, AAI_WORD_PROGRAM_COMMAND, FAST_READ_COMMAND, JEDEC_COMMAND,
    READ_STATUS_COMMAND, STATUS_WIP, WRITE_DISABLE_COMMAND, WRITE_ENABLE_COMMAND,
    WRITE_STATUS_COMMAND,
};

/// Low level commands, mostly a single SPI transaction each.
///
/// The compound functions (program, erase, status write) include the required write enable
/// and wait for the device to finish before returning.
impl<SPI: SpiDevice, DL: DelayNs> JedecSpiFlash<SPI, DL> {
    // ============= Commands =============

    /// Read the JEDEC ID of the flash device
    pub fn read_jedec_id_cmd(&mut self) -> Result<JedecID, SpiNorError<SPI::Error>> {
        let mut buf = [JEDEC_COMMAND, 0, 0, 0];
        spi_transfer_in_place(&mut self.spi, &mut buf)?;
        Ok(JedecID::from_bytes([buf[1], buf[2], buf[3]]))
    }

    /// Read the status register
    pub fn read_status_cmd(&mut self) -> Result<u8, SpiNorError<SPI::Error>> {
        let mut buf = [READ_STATUS_COMMAND, 0];
        spi_transfer_in_place(&mut self.spi, &mut buf)?;
        Ok(buf[1])
    }

    /// Enable writing, erasing and status register writes
    pub fn write_enable_cmd(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        spi_write(&mut self.spi, &[WRITE_ENABLE_COMMAND])
    }

    /// Disable writing. Also ends an AAI sequence
    pub fn write_disable_cmd(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        spi_write(&mut self.spi, &[WRITE_DISABLE_COMMAND])
    }

    /// Read `buf.len()` bytes starting at `address` with the configured read command
    pub fn read_cmd(
        &mut self,
        address: u32,
        buf: &mut [u8],
    ) -> Result<(), SpiNorError<SPI::Error>> {
        let (mut header, mut len) =
            command_with_address(self.config.cmd_read, address, self.config.addrbytes_num);
        if self.config.cmd_read == FAST_READ_COMMAND {
            // One dummy byte
            header[len] = 0;
            len += 1;
        }
        spi_transaction(
            &mut self.spi,
            &mut [Operation::Write(&header[..len]), Operation::Read(buf)],
        )
    }

    /// Program command without write enable or waiting.
    /// The bytes must not cross a page boundary.
    pub fn page_program_cmd(
        &mut self,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), SpiNorError<SPI::Error>> {
        let (header, len) = command_with_address(
            self.config.cmd_page_program,
            address,
            self.config.addrbytes_num,
        );
        spi_transaction(
            &mut self.spi,
            &mut [Operation::Write(&header[..len]), Operation::Write(bytes)],
        )
    }

    /// Sector erase command without write enable or waiting
    pub fn sector_erase_cmd(&mut self, address: u32) -> Result<(), SpiNorError<SPI::Error>> {
        let (header, len) = command_with_address(
            self.config.cmd_sector_erase,
            address,
            self.config.addrbytes_num,
        );
        spi_write(&mut self.spi, &header[..len])
    }

    /// Chip erase command without write enable or waiting
    pub fn chip_erase_cmd(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        spi_write(&mut self.spi, &[self.config.cmd_chip_erase])
    }

    // ============= Compound functions =============

    /// Whether a program or erase is in progress
    pub fn is_busy(&mut self) -> Result<bool, SpiNorError<SPI::Error>> {
        Ok(self.read_status_cmd()? & STATUS_WIP != 0)
    }

    /// Poll the status register until the write in progress bit clears.
    ///
    /// Sleeps `poll_interval_us` between polls when nice waiting is configured.
    pub fn wait_ready(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        while self.is_busy()? {
            if self.config.nice_waiting {
                self.delay.delay_us(self.config.poll_interval_us);
            }
        }
        Ok(())
    }

    /// Write the status register and check the block protection bits took effect.
    ///
    /// Returns [SpiNorError::StatusWriteFailed] when the read back differs, which happens
    /// when the register is locked by the WP pin.
    pub fn write_status(&mut self, value: u8) -> Result<(), SpiNorError<SPI::Error>> {
        self.write_enable_cmd()?;
        spi_write(&mut self.spi, &[WRITE_STATUS_COMMAND, value])?;
        self.wait_ready()?;
        let mask = bp_mask(self.config.bpbits_num);
        let status = self.read_status_cmd()?;
        if status & mask != value & mask {
            warn!("Status register read back {} instead of {}", status, value);
            return Err(SpiNorError::StatusWriteFailed);
        }
        Ok(())
    }

    /// Program bytes within one page and wait for completion
    pub fn program_page(
        &mut self,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), SpiNorError<SPI::Error>> {
        trace!("Programming {} bytes at {}", bytes.len(), address);
        self.write_enable_cmd()?;
        self.page_program_cmd(address, bytes)?;
        self.wait_ready()
    }

    /// Program an even number of bytes with auto address increment word programming.
    ///
    /// The first word carries the address, the following words only the command.
    /// Write disable ends the sequence, also when a word fails.
    pub fn program_aai(
        &mut self,
        address: u32,
        bytes: &[u8],
    ) -> Result<(), SpiNorError<SPI::Error>> {
        trace!("AAI programming {} bytes at {}", bytes.len(), address);
        let mut words = bytes.chunks_exact(2);
        let Some(first) = words.next() else {
            return Ok(());
        };
        self.write_enable_cmd()?;
        let result = self.aai_words(address, first, words);
        let disabled = self.write_disable_cmd();
        result.and(disabled)
    }

    fn aai_words(
        &mut self,
        address: u32,
        first: &[u8],
        words: core::slice::ChunksExact<'_, u8>,
    ) -> Result<(), SpiNorError<SPI::Error>> {
        self.page_program_cmd(address, first)?;
        self.wait_ready()?;
        for word in words {
            spi_write(&mut self.spi, &[AAI_WORD_PROGRAM_COMMAND, word[0], word[1]])?;
            self.wait_ready()?;
        }
        Ok(())
    }

    /// Erase the sector containing `address` and wait for completion
    pub fn erase_sector(&mut self, address: u32) -> Result<(), SpiNorError<SPI::Error>> {
        trace!("Erasing sector at {}", address);
        self.write_enable_cmd()?;
        self.sector_erase_cmd(address)?;
        self.wait_ready()
    }

    /// Erase the whole chip and wait for completion
    pub fn erase_chip(&mut self) -> Result<(), SpiNorError<SPI::Error>> {
        debug!("Erasing chip");
        self.write_enable_cmd()?;
        self.chip_erase_cmd()?;
        self.wait_ready()
    }
}
