use embedded_nvm::DeviceInfo;

use crate::header::{Arena, MARKERS};

/// Bytes of the little endian slot index at the start of every slot
pub const ADDRESS_SIZE: u32 = 4;

/// Geometry of the two arenas on the parent device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout {
    /// Parent sector size in bytes
    pub sector_size: u32,
    /// Parent sectors per arena
    pub arena_sectors: u32,
    /// Parent sectors at the start of each arena holding the header
    pub header_sectors: u32,
    /// Parent write alignment, the size of a header marker
    pub write_unit: u32,
    /// Bytes per slot, address plus payload
    pub slot_size: u32,
    /// Slots per arena
    pub slot_count: u32,
}

impl Layout {
    /// Fit two arenas onto the parent, [None] if it is not possible
    pub fn new(info: &DeviceInfo, header_sectors: u32, payload: usize) -> Option<Layout> {
        let write_unit = info.write_alignment.max(1);
        let payload = u32::try_from(payload).ok()?;
        if payload == 0
            || info.sector_num < 2
            || info.sector_num % 2 != 0
            || ADDRESS_SIZE % write_unit != 0
            || payload % write_unit != 0
            || info.sector_size % write_unit != 0
        {
            return None;
        }
        let arena_sectors = info.sector_num / 2;
        if header_sectors == 0 || header_sectors >= arena_sectors {
            return None;
        }
        if (MARKERS as u32) * write_unit > header_sectors * info.sector_size {
            return None;
        }
        let slot_size = ADDRESS_SIZE + payload;
        let slot_count = (arena_sectors - header_sectors) * info.sector_size / slot_size;
        if slot_count == 0 {
            return None;
        }
        Some(Layout {
            sector_size: info.sector_size,
            arena_sectors,
            header_sectors,
            write_unit,
            slot_size,
            slot_count,
        })
    }

    pub fn arena_size(&self) -> u32 {
        self.arena_sectors * self.sector_size
    }

    pub fn header_size(&self) -> u32 {
        self.header_sectors * self.sector_size
    }

    pub fn arena_base(&self, arena: Arena) -> u32 {
        arena.index() * self.arena_size()
    }

    /// Parent address of a header marker word
    pub fn marker_address(&self, arena: Arena, marker: usize) -> u32 {
        self.arena_base(arena) + marker as u32 * self.write_unit
    }

    /// Parent address of the first slot
    pub fn slots_base(&self, arena: Arena) -> u32 {
        self.arena_base(arena) + self.header_size()
    }

    /// Parent address of the slot at `position`
    pub fn slot_address(&self, arena: Arena, position: u32) -> u32 {
        self.slots_base(arena) + position * self.slot_size
    }

    /// Bytes of the virtual address space
    pub fn virtual_size(&self) -> u32 {
        self.slot_count * (self.slot_size - ADDRESS_SIZE)
    }
}
