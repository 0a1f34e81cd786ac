use embedded_hal::spi::{Operation, SpiDevice};

use crate::error::SpiNorError;

/// Wrapper around [SpiDevice::write] that maps errors
pub fn spi_write<SPI: SpiDevice>(spi: &mut SPI, buf: &[u8]) -> Result<(), SpiNorError<SPI::Error>> {
    spi.write(buf).map_err(SpiNorError::SPI)
}

/// Wrapper around [SpiDevice::transfer_in_place] that maps errors
pub fn spi_transfer_in_place<SPI: SpiDevice>(
    spi: &mut SPI,
    buf: &mut [u8],
) -> Result<(), SpiNorError<SPI::Error>> {
    spi.transfer_in_place(buf).map_err(SpiNorError::SPI)
}

/// Wrapper around [SpiDevice::transaction] that maps errors
pub fn spi_transaction<SPI: SpiDevice>(
    spi: &mut SPI,
    operations: &mut [Operation<'_, u8>],
) -> Result<(), SpiNorError<SPI::Error>> {
    spi.transaction(operations).map_err(SpiNorError::SPI)
}

/// Encode a command byte followed by a big endian address of `addrbytes` bytes.
///
/// Returns the buffer and the number of bytes used.
pub fn command_with_address(cmd: u8, address: u32, addrbytes: u8) -> ([u8; 6], usize) {
    let mut buf = [0; 6];
    buf[0] = cmd;
    let be = address.to_be_bytes();
    let n = addrbytes as usize;
    buf[1..1 + n].copy_from_slice(&be[4 - n..]);
    (buf, 1 + n)
}
