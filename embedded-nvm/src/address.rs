/// Index of a sector in the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectorIndex(pub(crate) u32);

impl SectorIndex {
    pub fn new(index: u32) -> Self {
        SectorIndex(index)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_byte_address(&self, sector_size: u32) -> ByteAddress {
        ByteAddress(self.0 * sector_size)
    }
}

/// Address of a byte in the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ByteAddress(pub(crate) u32);

impl ByteAddress {
    pub fn new(address: u32) -> Self {
        ByteAddress(address)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Number of bytes from this address to the next multiple of `align`
    pub fn remaining_in(&self, align: u32) -> u32 {
        align - (self.0 % align)
    }
}
