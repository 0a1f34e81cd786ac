#![no_std]

//! Driver for JEDEC compatible serial NOR flash over [embedded_hal::spi::SpiDevice].
//!
//! [JedecSpiFlash] implements [embedded_nvm::BlockDevice]. The command set is the
//! de facto standard shared by most 25-series parts: status read/write, write enable/disable,
//! (fast) read, page program or SST style AAI word program, sector and chip erase.
//! The geometry and command variants are described at runtime by a [JedecConfig].

#[cfg(test)]
extern crate std;

mod fmt;

pub mod cmd_blocking;
pub mod device;
pub mod error;
pub mod protect;
pub mod test;
pub mod utils;

pub use device::{JedecSpiFlash, NoDelay};
pub use error::SpiNorError;

/// Read status register
pub const READ_STATUS_COMMAND: u8 = 0x05;
/// Write status register
pub const WRITE_STATUS_COMMAND: u8 = 0x01;
/// Enable writing to the flash device, including erasing and status writes
pub const WRITE_ENABLE_COMMAND: u8 = 0x06;
/// Disable writing to the flash device, also terminates AAI mode
pub const WRITE_DISABLE_COMMAND: u8 = 0x04;
/// Read the 3 byte JEDEC ID
pub const JEDEC_COMMAND: u8 = 0x9F;
/// Read data
pub const READ_COMMAND: u8 = 0x03;
/// Read data with one dummy byte after the address
pub const FAST_READ_COMMAND: u8 = 0x0B;
/// Program up to a page of bytes
pub const PAGE_PROGRAM_COMMAND: u8 = 0x02;
/// Auto address increment word program
pub const AAI_WORD_PROGRAM_COMMAND: u8 = 0xAD;
/// Erase a 4 KiB sector on most parts
pub const SECTOR_ERASE_4K_COMMAND: u8 = 0x20;
/// Erase the whole chip
pub const CHIP_ERASE_COMMAND: u8 = 0xC7;
/// Alternative chip erase command
pub const CHIP_ERASE_ALT_COMMAND: u8 = 0x60;

/// Write in progress bit of the status register
pub const STATUS_WIP: u8 = 0x01;
/// Write enable latch bit of the status register
pub const STATUS_WEL: u8 = 0x02;

/// Layout and command set of a JEDEC SPI NOR device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JedecConfig {
    /// Size of the smallest erasable unit in bytes
    pub sector_size: u32,
    /// Number of sectors in the device
    pub sector_num: u32,
    /// Maximum number of bytes accepted by one page program
    pub page_size: u32,
    /// Programming must not cross a boundary aligned to this many bytes
    pub page_alignment: u32,
    /// Number of address bytes on the wire, 3 or 4
    pub addrbytes_num: u8,
    /// Number of block protection bits in the status register
    pub bpbits_num: u8,
    /// Sector erase command. 0 if the device can overwrite bytes without erasing
    pub cmd_sector_erase: u8,
    /// Chip erase command, [CHIP_ERASE_COMMAND] or [CHIP_ERASE_ALT_COMMAND]
    pub cmd_chip_erase: u8,
    /// [PAGE_PROGRAM_COMMAND] or [AAI_WORD_PROGRAM_COMMAND]
    pub cmd_page_program: u8,
    /// [READ_COMMAND] or [FAST_READ_COMMAND]
    pub cmd_read: u8,
    /// Sleep between status polls instead of spinning
    pub nice_waiting: bool,
    /// Sleep in microseconds between status polls when waiting nicely
    pub poll_interval_us: u32,
}

impl Default for JedecConfig {
    /// A 2 MiB part with 4 KiB sectors and 256 byte pages
    fn default() -> Self {
        JedecConfig {
            sector_size: 4096,
            sector_num: 512,
            page_size: 256,
            page_alignment: 256,
            addrbytes_num: 3,
            bpbits_num: 3,
            cmd_sector_erase: SECTOR_ERASE_4K_COMMAND,
            cmd_chip_erase: CHIP_ERASE_COMMAND,
            cmd_page_program: PAGE_PROGRAM_COMMAND,
            cmd_read: FAST_READ_COMMAND,
            nice_waiting: false,
            poll_interval_us: 10,
        }
    }
}

impl JedecConfig {
    /// Size of the address space in bytes
    pub fn capacity(&self) -> u32 {
        self.sector_size.saturating_mul(self.sector_num)
    }

    /// Smallest legal write chunk
    pub fn write_alignment(&self) -> u32 {
        if self.cmd_page_program == AAI_WORD_PROGRAM_COMMAND {
            2
        } else {
            1
        }
    }

    /// Whether erasing is needed before writing
    pub fn needs_erase(&self) -> bool {
        self.cmd_sector_erase != 0
    }

    /// Check the configuration describes a device the driver can talk to
    pub fn validate(&self) -> bool {
        let span = self.sector_size as u64 * self.sector_num as u64;
        let addressable = 1u64 << (8 * self.addrbytes_num as u64);
        matches!(self.addrbytes_num, 3 | 4)
            && self.sector_size != 0
            && self.sector_num != 0
            && span <= addressable
            && span <= u32::MAX as u64
            && self.page_size != 0
            && self.page_alignment != 0
            && self.bpbits_num <= 4
            && matches!(
                self.cmd_page_program,
                PAGE_PROGRAM_COMMAND | AAI_WORD_PROGRAM_COMMAND
            )
            && matches!(self.cmd_read, READ_COMMAND | FAST_READ_COMMAND)
    }
}

/// The JEDEC ID of a flash device: manufacturer, memory type and capacity.
/// See https://www.jedec.org/standards-documents/docs/jep-106ab for a list of JEDEC IDs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JedecID {
    /// First byte read from the Jedec command
    id: u8,
    /// The device id. MSB first on wire
    device: u16,
}

impl JedecID {
    pub fn new(id: u8, device: u16) -> Self {
        JedecID { id, device }
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        JedecID {
            id: bytes[0],
            device: u16::from_be_bytes([bytes[1], bytes[2]]),
        }
    }

    pub fn manufacturer(&self) -> u8 {
        self.id
    }

    pub fn device(&self) -> u16 {
        self.device
    }

    /// Bytes in wire order, as reported by [embedded_nvm::DeviceInfo::identification]
    pub fn to_bytes(&self) -> [u8; 3] {
        let d = self.device.to_be_bytes();
        [self.id, d[0], d[1]]
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for JedecID {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "JedecID(id: {:02X}, device: {:04X})",
            self.id,
            self.device
        );
    }
}
