#![no_std]

//! Flash emulated EEPROM.
//!
//! [Fee] turns a flash device that only supports aligned writes into erased bytes and whole
//! sector erases into a byte addressable, overwritable [BlockDevice]. The virtual address
//! space is split into slots of `SLOT_PAYLOAD` bytes. Every update of a slot appends a new
//! copy of it to a log in the active half (arena) of the parent. When the active arena is
//! full the live slots are compacted into the other arena and the roles swap.
//!
//! The arena headers carry a small state machine so that a power loss at any point is
//! repaired by [BlockDevice::start]: each slot then reads either its old or its new value.
//!
//! ```text
//! parent: | header A | slots A ...... | header B | slots B ...... |
//! slot:   | index (u32 LE) | payload (SLOT_PAYLOAD bytes) |
//! ```

#[cfg(test)]
extern crate std;

mod fmt;

mod engine;
pub mod header;
pub mod layout;

use embedded_nvm::{
    check_active, check_erase, check_read, check_ready, check_write, BlockDevice, DeviceInfo,
    DeviceState, ErrorType, NvmError, NvmErrorKind,
};
use thiserror::Error;

use engine::Engine;
pub use header::{Arena, ArenaState};
pub use layout::Layout;

#[derive(Debug, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Error from the parent device
    #[error("Parent device error")]
    Parent(E),
    /// Arena headers do not match any recoverable state
    #[error("Corrupt arena headers")]
    CorruptMetadata,
    /// The parent cannot hold two arenas with this slot size
    #[error("Invalid configuration for parent")]
    InvalidConfig,
    /// Only the whole device can be protected
    #[error("Range does not match a protectable region")]
    Unprotectable,
    #[error("Request not aligned")]
    NotAligned,
    #[error("Request out of bounds")]
    OutOfBounds,
    #[error("Device not ready")]
    NotReady,
    #[error("Other Error")]
    Other,
}

impl<E: NvmError> NvmError for Error<E> {
    fn kind(&self) -> NvmErrorKind {
        match self {
            Error::Parent(e) => e.kind(),
            Error::CorruptMetadata => NvmErrorKind::CorruptMetadata,
            Error::InvalidConfig => NvmErrorKind::InvalidConfig,
            Error::Unprotectable => NvmErrorKind::NotAligned,
            Error::NotAligned => NvmErrorKind::NotAligned,
            Error::OutOfBounds => NvmErrorKind::OutOfBounds,
            Error::NotReady => NvmErrorKind::InvalidState,
            Error::Other => NvmErrorKind::Other,
        }
    }
}

// This is for convenience, to convert from the NvmErrorKind to the Error
// when calling the check functions
impl<E> From<NvmErrorKind> for Error<E> {
    fn from(e: NvmErrorKind) -> Self {
        match e {
            NvmErrorKind::NotAligned => Error::NotAligned,
            NvmErrorKind::OutOfBounds => Error::OutOfBounds,
            NvmErrorKind::InvalidState => Error::NotReady,
            NvmErrorKind::InvalidConfig => Error::InvalidConfig,
            NvmErrorKind::CorruptMetadata => Error::CorruptMetadata,
            _ => Error::Other,
        }
    }
}

/// Flash emulated EEPROM over a parent [BlockDevice].
///
/// The parent is split in two equal arenas, each starting with `header_sectors` sectors
/// (1 by default) of header. The parent write alignment is the write unit and must divide
/// both 4 and `SLOT_PAYLOAD`.
///
/// The virtual device has one sector per slot, `SLOT_PAYLOAD` bytes each, and no write
/// alignment. Writes never need an erase first.
#[derive(Debug)]
pub struct Fee<P, const SLOT_PAYLOAD: usize = 8> {
    parent: P,
    state: DeviceState,
    header_sectors: u32,
    engine: Engine<SLOT_PAYLOAD>,
    /// An engine sequence failed part way, the medium may no longer match `engine`
    stale: bool,
}

impl<P: BlockDevice, const SLOT_PAYLOAD: usize> Fee<P, SLOT_PAYLOAD> {
    /// Create a stopped engine. The parent is only touched on [BlockDevice::start]
    pub fn new(parent: P) -> Self {
        Fee {
            parent,
            state: DeviceState::Stopped,
            header_sectors: 1,
            engine: Engine::new(Layout::default()),
            stale: false,
        }
    }

    /// Reserve `header_sectors` parent sectors for the header of each arena
    pub fn with_header_sectors(mut self, header_sectors: u32) -> Self {
        self.header_sectors = header_sectors;
        self
    }

    /// Return the parent device
    pub fn into_inner(self) -> P {
        self.parent
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn parent_mut(&mut self) -> &mut P {
        &mut self.parent
    }

    /// Arena layout, valid once started
    pub fn layout(&self) -> &Layout {
        &self.engine.layout
    }

    /// Slots per arena
    pub fn slot_count(&self) -> u32 {
        self.engine.layout.slot_count
    }

    /// Positions used in the active arena, including superseded copies
    pub fn used_slots(&self) -> u32 {
        self.engine.cursor
    }

    pub fn active_arena(&self) -> Arena {
        self.engine.active
    }

    /// Header states of both arenas as stored on the parent
    pub fn arena_states(&mut self) -> Result<(ArenaState, ArenaState), Error<P::Error>> {
        check_active(self.state)?;
        self.locked(|engine, parent| {
            Ok((
                engine.read_state(parent, Arena::A)?,
                engine.read_state(parent, Arena::B)?,
            ))
        })
    }

    /// Run `f` on the engine with the parent locked for the whole sequence
    fn locked<R>(
        &mut self,
        f: impl FnOnce(&mut Engine<SLOT_PAYLOAD>, &mut P) -> Result<R, Error<P::Error>>,
    ) -> Result<R, Error<P::Error>> {
        let engine = &mut self.engine;
        self.parent
            .transaction(|parent| Ok(f(engine, parent)))
            .map_err(Error::Parent)?
    }

    /// Run `f` in `busy` state, returning to Ready whatever the result.
    ///
    /// A failed run can leave a torn slot or a half done promotion behind, so the next run
    /// rebuilds the engine from the medium first.
    fn busy<R>(
        &mut self,
        busy: DeviceState,
        f: impl FnOnce(&mut Engine<SLOT_PAYLOAD>, &mut P) -> Result<R, Error<P::Error>>,
    ) -> Result<R, Error<P::Error>> {
        self.state = busy;
        let stale = self.stale;
        let result = self.locked(|engine, parent| {
            if stale {
                debug!("Rebuilding engine state after a failed operation");
                engine.recover(parent)?;
            }
            f(engine, parent)
        });
        self.stale = result.is_err();
        self.state = DeviceState::Ready;
        result
    }

    fn fit_layout(&mut self) -> Result<Layout, Error<P::Error>> {
        let info = self.parent.info().map_err(Error::Parent)?;
        Layout::new(&info, self.header_sectors, SLOT_PAYLOAD).ok_or_else(|| {
            error!(
                "Parent of {} sectors of {} bytes cannot hold two arenas",
                info.sector_num,
                info.sector_size
            );
            Error::InvalidConfig
        })
    }

    fn device_info(&self, identification: [u8; 3]) -> DeviceInfo {
        DeviceInfo::new(
            SLOT_PAYLOAD as u32,
            self.engine.layout.slot_count,
            identification,
        )
    }

    fn virtual_info(&mut self) -> Result<DeviceInfo, Error<P::Error>> {
        let identification = self.parent.info().map_err(Error::Parent)?.identification;
        Ok(self.device_info(identification))
    }

    /// Apply `fill` to every slot touched by `[offset, offset + length)`.
    ///
    /// `fill` gets the bytes of the slot inside the range and the number of bytes handled
    /// before them. Slots whose content does not change are not rewritten.
    fn update(
        &mut self,
        offset: u32,
        length: usize,
        mut fill: impl FnMut(&mut [u8], usize),
    ) -> Result<(), Error<P::Error>> {
        self.busy(DeviceState::Writing, |engine, parent| {
            let mut done = 0;
            while done < length {
                let address = offset as usize + done;
                let slot = (address / SLOT_PAYLOAD) as u32;
                let column = address % SLOT_PAYLOAD;
                let len = (SLOT_PAYLOAD - column).min(length - done);
                let current = engine.current(parent, slot)?;
                let mut merged = current;
                fill(&mut merged[column..column + len], done);
                if merged != current {
                    engine.store(parent, slot, &merged)?;
                }
                done += len;
            }
            Ok(())
        })
    }
}

impl<P: BlockDevice, const SLOT_PAYLOAD: usize> ErrorType for Fee<P, SLOT_PAYLOAD> {
    type Error = Error<P::Error>;
}

impl<P: BlockDevice, const SLOT_PAYLOAD: usize> BlockDevice for Fee<P, SLOT_PAYLOAD> {
    type Lock = P::Lock;

    fn state(&self) -> DeviceState {
        self.state
    }

    /// Start the parent, check the layout and repair the arenas.
    ///
    /// Fails with [Error::CorruptMetadata] when the headers match no recovery rule, leaving
    /// the engine stopped.
    fn start(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            return Ok(());
        }
        self.parent.start().map_err(Error::Parent)?;
        let layout = self.fit_layout()?;
        self.engine = Engine::new(layout);
        self.stale = false;
        self.locked(|engine, parent| engine.recover(parent))?;
        self.state = DeviceState::Ready;
        info!(
            "Started emulated EEPROM with {} slots of {} bytes",
            layout.slot_count,
            SLOT_PAYLOAD
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        if self.state.is_active() {
            self.parent.sync().map_err(Error::Parent)?;
            self.state = DeviceState::Stopped;
        }
        Ok(())
    }

    fn info(&mut self) -> Result<DeviceInfo, Self::Error> {
        if !self.state.is_active() {
            self.engine.layout = self.fit_layout()?;
        }
        self.virtual_info()
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_read(&self.device_info([0; 3]), offset, bytes.len())?;
        trace!("Reading {} bytes from {}", bytes.len(), offset);
        self.busy(DeviceState::Reading, |engine, parent| {
            let mut done = 0;
            while done < bytes.len() {
                let address = offset as usize + done;
                let slot = (address / SLOT_PAYLOAD) as u32;
                let column = address % SLOT_PAYLOAD;
                let len = (SLOT_PAYLOAD - column).min(bytes.len() - done);
                let current = engine.current(parent, slot)?;
                bytes[done..done + len].copy_from_slice(&current[column..column + len]);
                done += len;
            }
            Ok(())
        })
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_write(&self.device_info([0; 3]), offset, bytes.len())?;
        trace!("Writing {} bytes to {}", bytes.len(), offset);
        self.update(offset, bytes.len(), |slot, done| {
            slot.copy_from_slice(&bytes[done..done + slot.len()])
        })
    }

    /// Write 0xFF over every slot touching the range. Other slots are untouched
    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        check_erase(&self.device_info([0; 3]), offset, length)?;
        trace!("Erasing {} bytes from {}", length, offset);
        // Whole slots, like a sector erase
        let start = offset - offset % SLOT_PAYLOAD as u32;
        let end = if length == 0 {
            start
        } else {
            (offset + length).div_ceil(SLOT_PAYLOAD as u32) * SLOT_PAYLOAD as u32
        };
        self.update(start, (end - start) as usize, |slot, _| slot.fill(0xFF))
    }

    fn mass_erase(&mut self) -> Result<(), Self::Error> {
        check_ready(self.state)?;
        debug!("Mass erasing emulated EEPROM");
        // formatting rewrites both arenas, nothing on the medium needs recovering
        self.stale = false;
        self.busy(DeviceState::Erasing, |engine, parent| engine.format(parent))
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.parent.sync().map_err(Error::Parent)
    }

    /// Only the whole device can be protected, which protects both arenas
    fn write_protect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_active(self.state)?;
        if offset != 0 || length != self.engine.layout.virtual_size() {
            return Err(Error::Unprotectable);
        }
        self.mass_write_protect()
    }

    fn mass_write_protect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.parent.mass_write_protect().map_err(Error::Parent)
    }

    fn write_unprotect(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        check_active(self.state)?;
        if offset != 0 || length != self.engine.layout.virtual_size() {
            return Err(Error::Unprotectable);
        }
        self.mass_write_unprotect()
    }

    fn mass_write_unprotect(&mut self) -> Result<(), Self::Error> {
        check_active(self.state)?;
        self.parent.mass_write_unprotect().map_err(Error::Parent)
    }

    fn lock_handle(&self) -> Self::Lock {
        self.parent.lock_handle()
    }
}
