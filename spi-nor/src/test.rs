//! Host side emulation of a JEDEC SPI NOR chip, for testing drivers without hardware.

use core::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{self, ErrorKind, Operation, SpiDevice};

use crate::protect::{bp_mask, bp_value, intersects, protected_range};
use crate::{
    JedecConfig, AAI_WORD_PROGRAM_COMMAND, FAST_READ_COMMAND, JEDEC_COMMAND, PAGE_PROGRAM_COMMAND,
    READ_COMMAND, READ_STATUS_COMMAND, STATUS_WEL, STATUS_WIP, WRITE_DISABLE_COMMAND,
    WRITE_ENABLE_COMMAND, WRITE_STATUS_COMMAND,
};

/// Identification returned by [VirtualSpiNor] unless changed
pub const DEFAULT_ID: [u8; 3] = [0xBF, 0x25, 0x41];

/// Error injected by [VirtualSpiNor::fail_next_transactions]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SimSpiError;

impl fmt::Display for SimSpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("simulated SPI failure")
    }
}

impl spi::Error for SimSpiError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// A RAM backed SPI NOR chip speaking the JEDEC command set.
///
/// Each [SpiDevice::transaction] is one chip select cycle. Bytes are decoded as they are
/// clocked: command, address, optional dummy byte, then data. Commands that change the array
/// or the status register take effect when chip select rises, like on real parts.
///
/// Modelled behaviour:
/// - program, erase and status writes need the write enable latch, which they clear
/// - programming only clears bits, unless the configuration has no erase command
/// - page program wraps inside the page instead of crossing into the next one
/// - AAI word programming keeps the chip in AAI mode until write disable
/// - block protection bits silently drop program and erase commands in their region
/// - the status register reports write in progress for a configurable number of polls
pub struct VirtualSpiNor<const SIZE: usize> {
    memory: [u8; SIZE],
    config: JedecConfig,
    id: [u8; 3],
    status: u8,
    status_locked: bool,
    aai_address: Option<u32>,
    busy_polls: u32,
    busy_left: u32,
    fail_transactions: u32,
    program_commands: u32,
    erase_commands: u32,
    cycle: Cycle,
}

/// Decoding state of the current chip select cycle
#[derive(Debug, Clone, Copy, Default)]
struct Cycle {
    position: usize,
    command: u8,
    address: u32,
    data: [u8; 2],
    data_len: usize,
}

impl<const SIZE: usize> VirtualSpiNor<SIZE> {
    /// Create an erased chip with the geometry and commands of `config`
    pub fn new(config: JedecConfig) -> Self {
        VirtualSpiNor {
            memory: [0xFF; SIZE],
            config,
            id: DEFAULT_ID,
            status: 0,
            status_locked: false,
            aai_address: None,
            busy_polls: 0,
            busy_left: 0,
            fail_transactions: 0,
            program_commands: 0,
            erase_commands: 0,
            cycle: Cycle::default(),
        }
    }

    pub fn with_id(mut self, id: [u8; 3]) -> Self {
        self.id = id;
        self
    }

    /// Report write in progress for `polls` status reads after every program or erase
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Ignore status register writes, as when the WP pin is asserted
    pub fn lock_status_register(&mut self, locked: bool) {
        self.status_locked = locked;
    }

    /// Fail the next `count` transactions without clocking any bytes
    pub fn fail_next_transactions(&mut self, count: u32) {
        self.fail_transactions = count;
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Number of program commands accepted, one per page or AAI word
    pub fn program_commands(&self) -> u32 {
        self.program_commands
    }

    /// Number of sector and chip erase commands accepted
    pub fn erase_commands(&self) -> u32 {
        self.erase_commands
    }

    pub fn in_aai(&self) -> bool {
        self.aai_address.is_some()
    }

    fn capacity(&self) -> u32 {
        self.config.capacity().min(SIZE as u32)
    }

    fn protected(&self, address: u32, length: u32) -> bool {
        let value = bp_value(self.status, self.config.bpbits_num);
        let region = protected_range(self.config.capacity(), self.config.bpbits_num, value);
        intersects(&region, address, length)
    }

    fn write_enabled(&self) -> bool {
        self.status & STATUS_WEL != 0
    }

    fn is_busy(&self) -> bool {
        self.busy_left > 0
    }

    /// End of a write or erase: clear the latch and start reporting busy
    fn finish_write(&mut self) {
        self.status &= !STATUS_WEL;
        self.busy_left = self.busy_polls;
    }

    fn address_bytes(&self) -> usize {
        self.config.addrbytes_num as usize
    }

    fn is_sector_erase(&self, command: u8) -> bool {
        self.config.cmd_sector_erase != 0 && command == self.config.cmd_sector_erase
    }

    fn program_byte(&mut self, address: u32, byte: u8) {
        let index = (address % self.capacity()) as usize;
        if self.config.needs_erase() {
            self.memory[index] &= byte;
        } else {
            self.memory[index] = byte;
        }
    }

    /// Clock one byte in, return the byte clocked out
    fn clock(&mut self, mosi: u8) -> u8 {
        let position = self.cycle.position;
        self.cycle.position += 1;
        if position == 0 {
            self.cycle.command = mosi;
            return 0xFF;
        }
        let command = self.cycle.command;
        let address_end = self.address_bytes();
        match command {
            READ_STATUS_COMMAND => {
                let mut status = self.status;
                if self.busy_left > 0 {
                    self.busy_left -= 1;
                    status |= STATUS_WIP;
                }
                status
            }
            JEDEC_COMMAND => self.id.get(position - 1).copied().unwrap_or(0xFF),
            WRITE_STATUS_COMMAND => {
                if position == 1 {
                    self.cycle.data[0] = mosi;
                    self.cycle.data_len = 1;
                }
                0xFF
            }
            READ_COMMAND | FAST_READ_COMMAND => {
                let dummy = usize::from(command == FAST_READ_COMMAND);
                if position <= address_end {
                    self.cycle.address = (self.cycle.address << 8) | mosi as u32;
                    0xFF
                } else if position <= address_end + dummy {
                    0xFF
                } else {
                    let index = self.cycle.address % self.capacity();
                    self.cycle.address = self.cycle.address.wrapping_add(1);
                    self.memory[index as usize]
                }
            }
            AAI_WORD_PROGRAM_COMMAND
                if self.config.cmd_page_program == AAI_WORD_PROGRAM_COMMAND =>
            {
                let header = if self.aai_address.is_some() { 0 } else { address_end };
                if position <= header {
                    self.cycle.address = (self.cycle.address << 8) | mosi as u32;
                } else if self.cycle.data_len < 2 {
                    self.cycle.data[self.cycle.data_len] = mosi;
                    self.cycle.data_len += 1;
                }
                0xFF
            }
            PAGE_PROGRAM_COMMAND if self.config.cmd_page_program == PAGE_PROGRAM_COMMAND => {
                if position <= address_end {
                    self.cycle.address = (self.cycle.address << 8) | mosi as u32;
                    if position == address_end {
                        self.begin_page_program();
                    }
                } else if self.cycle.data_len == 1 {
                    // Wrap inside the page
                    let start = self.cycle.address;
                    let page = self.config.page_alignment;
                    let column = (start % page + (position - address_end - 1) as u32) % page;
                    self.program_byte(start - start % page + column, mosi);
                }
                0xFF
            }
            _ => {
                if position <= address_end {
                    self.cycle.address = (self.cycle.address << 8) | mosi as u32;
                }
                0xFF
            }
        }
    }

    /// Decide once the address is known whether the page program is accepted.
    /// `data_len` doubles as the accepted flag.
    fn begin_page_program(&mut self) {
        let accepted = self.write_enabled()
            && !self.is_busy()
            && !self.protected(self.cycle.address, 1);
        self.cycle.data_len = usize::from(accepted);
    }

    /// Chip select rises: commit the command of the cycle
    fn end_cycle(&mut self) {
        let cycle = core::mem::take(&mut self.cycle);
        if cycle.position == 0 {
            return;
        }
        let command = cycle.command;
        let has_address = cycle.position > self.address_bytes();
        match command {
            WRITE_ENABLE_COMMAND if !self.is_busy() => self.status |= STATUS_WEL,
            WRITE_DISABLE_COMMAND => {
                self.status &= !STATUS_WEL;
                self.aai_address = None;
            }
            WRITE_STATUS_COMMAND if cycle.data_len == 1 => {
                if self.write_enabled() && !self.is_busy() && !self.status_locked {
                    let mask = bp_mask(self.config.bpbits_num);
                    self.status = (self.status & !mask) | (cycle.data[0] & mask);
                }
                self.finish_write();
            }
            PAGE_PROGRAM_COMMAND if has_address && cycle.data_len == 1 => {
                self.program_commands += 1;
                self.finish_write();
            }
            AAI_WORD_PROGRAM_COMMAND
                if self.config.cmd_page_program == AAI_WORD_PROGRAM_COMMAND
                    && cycle.data_len == 2 =>
            {
                self.aai_word(cycle.address, cycle.data);
            }
            command if self.is_sector_erase(command) && has_address => {
                let size = self.config.sector_size;
                let start = cycle.address - cycle.address % size;
                if self.write_enabled() && !self.is_busy() && !self.protected(start, size) {
                    let start = start as usize;
                    self.memory[start..start + size as usize].fill(0xFF);
                    self.erase_commands += 1;
                    self.finish_write();
                }
            }
            command if command == self.config.cmd_chip_erase => {
                let mask = bp_mask(self.config.bpbits_num);
                if self.write_enabled() && !self.is_busy() && self.status & mask == 0 {
                    self.memory.fill(0xFF);
                    self.erase_commands += 1;
                    self.finish_write();
                }
            }
            _ => {}
        }
    }

    fn aai_word(&mut self, address: u32, data: [u8; 2]) {
        if self.is_busy() {
            return;
        }
        let address = match self.aai_address {
            Some(next) => next,
            None if self.write_enabled() => address,
            None => return,
        };
        if !self.protected(address, 2) {
            self.program_byte(address, data[0]);
            self.program_byte(address + 1, data[1]);
        }
        self.program_commands += 1;
        self.aai_address = Some(address + 2);
        // The latch stays set for the rest of the sequence
        self.busy_left = self.busy_polls;
    }
}

impl<const SIZE: usize> spi::ErrorType for VirtualSpiNor<SIZE> {
    type Error = SimSpiError;
}

impl<const SIZE: usize> SpiDevice for VirtualSpiNor<SIZE> {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        if self.fail_transactions > 0 {
            self.fail_transactions -= 1;
            return Err(SimSpiError);
        }
        for operation in operations.iter_mut() {
            match operation {
                Operation::Read(buf) => {
                    for b in buf.iter_mut() {
                        *b = self.clock(0);
                    }
                }
                Operation::Write(buf) => {
                    for b in buf.iter() {
                        self.clock(*b);
                    }
                }
                Operation::Transfer(read, write) => {
                    for i in 0..read.len().max(write.len()) {
                        let miso = self.clock(write.get(i).copied().unwrap_or(0));
                        if let Some(r) = read.get_mut(i) {
                            *r = miso;
                        }
                    }
                }
                Operation::TransferInPlace(buf) => {
                    for b in buf.iter_mut() {
                        *b = self.clock(*b);
                    }
                }
                Operation::DelayNs(_) => {}
            }
        }
        self.end_cycle();
        Ok(())
    }
}

/// [DelayNs] that records the time it was asked to sleep
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingDelay {
    total_ns: u64,
}

impl CountingDelay {
    pub fn total_us(&self) -> u64 {
        self.total_ns / 1000
    }
}

impl DelayNs for CountingDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += ns as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECTOR_ERASE_4K_COMMAND;

    use test_log::test;

    const CONFIG: JedecConfig = JedecConfig {
        sector_size: 256,
        sector_num: 4,
        page_size: 16,
        page_alignment: 16,
        addrbytes_num: 3,
        bpbits_num: 2,
        cmd_sector_erase: SECTOR_ERASE_4K_COMMAND,
        cmd_chip_erase: crate::CHIP_ERASE_COMMAND,
        cmd_page_program: PAGE_PROGRAM_COMMAND,
        cmd_read: READ_COMMAND,
        nice_waiting: false,
        poll_interval_us: 0,
    };

    #[test]
    fn test_program_needs_write_enable() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG);
        chip.write(&[PAGE_PROGRAM_COMMAND, 0, 0, 0, 0x12]).unwrap();
        assert_eq!(chip.memory()[0], 0xFF);
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[PAGE_PROGRAM_COMMAND, 0, 0, 0, 0x12]).unwrap();
        assert_eq!(chip.memory()[0], 0x12);
        assert_eq!(chip.status() & STATUS_WEL, 0);
    }

    #[test]
    fn test_page_program_wraps() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG);
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[PAGE_PROGRAM_COMMAND, 0, 0, 14, 1, 2, 3, 4])
            .unwrap();
        assert_eq!(&chip.memory()[14..16], &[1, 2]);
        assert_eq!(&chip.memory()[0..2], &[3, 4]);
        assert_eq!(chip.memory()[16], 0xFF);
    }

    #[test]
    fn test_read_status_while_busy() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG).with_busy_polls(2);
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[SECTOR_ERASE_4K_COMMAND, 0, 0, 0]).unwrap();
        let mut buf = [READ_STATUS_COMMAND, 0];
        chip.transfer_in_place(&mut buf).unwrap();
        assert_eq!(buf[1] & STATUS_WIP, STATUS_WIP);
        let mut buf = [READ_STATUS_COMMAND, 0, 0];
        chip.transfer_in_place(&mut buf).unwrap();
        assert_eq!(buf[1] & STATUS_WIP, STATUS_WIP);
        assert_eq!(buf[2] & STATUS_WIP, 0);
    }

    #[test]
    fn test_protected_erase_is_dropped() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG);
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[PAGE_PROGRAM_COMMAND, 0, 3, 0, 0]).unwrap();
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        // top quarter
        chip.write(&[WRITE_STATUS_COMMAND, 1 << 2]).unwrap();
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[SECTOR_ERASE_4K_COMMAND, 0, 3, 0]).unwrap();
        assert_eq!(chip.memory()[0x300], 0);
        assert_eq!(chip.erase_commands(), 0);
    }

    #[test]
    fn test_fast_read_skips_dummy() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG);
        chip.write(&[WRITE_ENABLE_COMMAND]).unwrap();
        chip.write(&[PAGE_PROGRAM_COMMAND, 0, 0, 4, 0xA5, 0x5A]).unwrap();
        let mut out = [0; 2];
        chip.transaction(&mut [
            Operation::Write(&[FAST_READ_COMMAND, 0, 0, 4, 0]),
            Operation::Read(&mut out),
        ])
        .unwrap();
        assert_eq!(out, [0xA5, 0x5A]);
    }

    #[test]
    fn test_jedec_id() {
        let mut chip = VirtualSpiNor::<1024>::new(CONFIG).with_id([1, 2, 3]);
        let mut buf = [JEDEC_COMMAND, 0, 0, 0];
        chip.transfer_in_place(&mut buf).unwrap();
        assert_eq!(buf, [0xFF, 1, 2, 3]);
    }
}
