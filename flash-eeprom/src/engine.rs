//! Log structured slot store over the two arenas.
//!
//! A slot is written payload first, then the address. A torn write therefore leaves either a
//! blank slot or a slot whose address reads as at least `slot_count`, which every scan skips.
//! Appends are strictly sequential, so the first free position is just past the last slot
//! that is not blank.

use embedded_nvm::BlockDevice;

use crate::header::{Arena, ArenaState, MARKERS};
use crate::layout::{Layout, ADDRESS_SIZE};
use crate::Error;

/// Largest header read, four markers of at most four bytes
const MAX_HEADER: usize = MARKERS * ADDRESS_SIZE as usize;

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Volatile engine state, rebuilt by recovery on every start
#[derive(Debug, Clone, Copy)]
pub(crate) struct Engine<const P: usize> {
    pub layout: Layout,
    pub active: Arena,
    /// Next free position in the active arena
    pub cursor: u32,
}

impl<const P: usize> Engine<P> {
    pub fn new(layout: Layout) -> Self {
        Engine {
            layout,
            active: Arena::A,
            cursor: 0,
        }
    }

    // ============= Headers =============

    pub fn read_state<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<ArenaState, Error<D::Error>> {
        let len = MARKERS * self.layout.write_unit as usize;
        let mut header = [0xFF; MAX_HEADER];
        dev.read(self.layout.arena_base(arena), &mut header[..len])
            .map_err(Error::Parent)?;
        ArenaState::decode(&header[..len], self.layout.write_unit as usize).ok_or_else(|| {
            error!("Arena {} header is corrupt", arena.name());
            Error::CorruptMetadata
        })
    }

    /// Program the markers between `from` and `to`
    pub fn set_state<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        from: ArenaState,
        to: ArenaState,
    ) -> Result<(), Error<D::Error>> {
        debug!("Arena {}: {} -> {}", arena.name(), from.name(), to.name());
        let zeros = [0u8; ADDRESS_SIZE as usize];
        for marker in from.markers()..to.markers() {
            dev.write(
                self.layout.marker_address(arena, marker),
                &zeros[..self.layout.write_unit as usize],
            )
            .map_err(Error::Parent)?;
        }
        Ok(())
    }

    /// Erase an arena, slot sectors first so an interrupted erase keeps its header
    pub fn erase_arena<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<(), Error<D::Error>> {
        debug!("Erasing arena {}", arena.name());
        let layout = &self.layout;
        dev.erase(
            layout.slots_base(arena),
            layout.arena_size() - layout.header_size(),
        )
        .map_err(Error::Parent)?;
        dev.erase(layout.arena_base(arena), layout.header_size())
            .map_err(Error::Parent)
    }

    /// Whether the slot region of an arena reads all 0xFF
    pub fn slots_blank<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<bool, Error<D::Error>> {
        let mut buf = [0; 32];
        let start = self.layout.slots_base(arena);
        let end = self.layout.arena_base(arena) + self.layout.arena_size();
        let mut offset = start;
        while offset < end {
            let len = (end - offset).min(buf.len() as u32) as usize;
            dev.read(offset, &mut buf[..len]).map_err(Error::Parent)?;
            if !is_blank(&buf[..len]) {
                return Ok(false);
            }
            offset += len as u32;
        }
        Ok(true)
    }

    // ============= Slots =============

    /// Raw address field of the slot at `position`
    fn slot_index<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        position: u32,
    ) -> Result<u32, Error<D::Error>> {
        let mut raw = [0; ADDRESS_SIZE as usize];
        dev.read(self.layout.slot_address(arena, position), &mut raw)
            .map_err(Error::Parent)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn slot_payload<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        position: u32,
    ) -> Result<[u8; P], Error<D::Error>> {
        let mut payload = [0xFF; P];
        dev.read(
            self.layout.slot_address(arena, position) + ADDRESS_SIZE,
            &mut payload,
        )
        .map_err(Error::Parent)?;
        Ok(payload)
    }

    fn slot_blank<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        position: u32,
    ) -> Result<bool, Error<D::Error>> {
        if self.slot_index(dev, arena, position)? != u32::MAX {
            return Ok(false);
        }
        Ok(is_blank(&self.slot_payload(dev, arena, position)?))
    }

    /// First free position of an arena
    pub fn find_cursor<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<u32, Error<D::Error>> {
        for position in (0..self.layout.slot_count).rev() {
            if !self.slot_blank(dev, arena, position)? {
                return Ok(position + 1);
            }
        }
        Ok(0)
    }

    /// Latest value of `slot` among the first `cursor` positions of an arena
    fn latest<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        cursor: u32,
        slot: u32,
    ) -> Result<Option<[u8; P]>, Error<D::Error>> {
        let mut found = None;
        for position in 0..cursor {
            if self.slot_index(dev, arena, position)? == slot {
                found = Some(position);
            }
        }
        found
            .map(|position| self.slot_payload(dev, arena, position))
            .transpose()
    }

    /// Current value of a slot, all 0xFF if it was never written
    pub fn current<D: BlockDevice>(
        &self,
        dev: &mut D,
        slot: u32,
    ) -> Result<[u8; P], Error<D::Error>> {
        Ok(self
            .latest(dev, self.active, self.cursor, slot)?
            .unwrap_or([0xFF; P]))
    }

    /// Program a slot, payload then address
    fn program_slot<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        position: u32,
        slot: u32,
        payload: &[u8; P],
    ) -> Result<(), Error<D::Error>> {
        trace!("Slot {} to arena {} position {}", slot, arena.name(), position);
        let address = self.layout.slot_address(arena, position);
        dev.write(address + ADDRESS_SIZE, payload).map_err(Error::Parent)?;
        dev.write(address, &slot.to_le_bytes()).map_err(Error::Parent)
    }

    /// Copy the live slots of `src` missing from `dst`, appending from `cursor`.
    ///
    /// `except` is left out. Returns the new cursor, or [None] when `dst` ran out of room.
    fn migrate<D: BlockDevice>(
        &self,
        dev: &mut D,
        src: Arena,
        dst: Arena,
        except: Option<u32>,
        mut cursor: u32,
    ) -> Result<Option<u32>, Error<D::Error>> {
        let src_cursor = self.find_cursor(dev, src)?;
        for slot in 0..self.layout.slot_count {
            if except == Some(slot) {
                continue;
            }
            let Some(value) = self.latest(dev, src, src_cursor, slot)? else {
                continue;
            };
            if is_blank(&value) || self.latest(dev, dst, cursor, slot)?.is_some() {
                continue;
            }
            if cursor >= self.layout.slot_count {
                return Ok(None);
            }
            self.program_slot(dev, dst, cursor, slot, &value)?;
            cursor += 1;
        }
        Ok(Some(cursor))
    }

    // ============= Operations =============

    /// Store a new value for `slot`, promoting when the active arena is full
    pub fn store<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        slot: u32,
        payload: &[u8; P],
    ) -> Result<(), Error<D::Error>> {
        if self.cursor < self.layout.slot_count {
            self.program_slot(dev, self.active, self.cursor, slot, payload)?;
            self.cursor += 1;
            return Ok(());
        }
        self.promote(dev, slot, payload)
    }

    /// Compact the live slots into the sibling arena together with the new value
    fn promote<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        slot: u32,
        payload: &[u8; P],
    ) -> Result<(), Error<D::Error>> {
        let src = self.active;
        let dst = src.other();
        info!("Promoting arena {} to {}", src.name(), dst.name());
        self.set_state(dev, dst, ArenaState::Erased, ArenaState::Receiving)?;
        self.set_state(dev, src, ArenaState::Active, ArenaState::Copying)?;
        let mut cursor = self
            .migrate(dev, src, dst, Some(slot), 0)?
            .ok_or(Error::Other)?;
        if !is_blank(payload) {
            if cursor >= self.layout.slot_count {
                return Err(Error::Other);
            }
            self.program_slot(dev, dst, cursor, slot, payload)?;
            cursor += 1;
        }
        self.finish_promotion(dev, src, dst, cursor)
    }

    /// Make `dst` active and retire `src`
    fn finish_promotion<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        src: Arena,
        dst: Arena,
        cursor: u32,
    ) -> Result<(), Error<D::Error>> {
        self.set_state(dev, dst, ArenaState::Receiving, ArenaState::Active)?;
        self.active = dst;
        self.cursor = cursor;
        self.retire(dev, src, ArenaState::Copying)
    }

    /// Mark an arena dead and erase it
    fn retire<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
        state: ArenaState,
    ) -> Result<(), Error<D::Error>> {
        self.set_state(dev, arena, state, ArenaState::Dead)?;
        self.erase_arena(dev, arena)
    }

    /// Finish a promotion from `src` into `dst` that was interrupted.
    ///
    /// Slots already materialised in `dst` are kept. If `dst` has no room left for the rest
    /// it is wiped and the copy starts over.
    fn resume<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        src: Arena,
        src_state: ArenaState,
        dst_state: ArenaState,
    ) -> Result<(), Error<D::Error>> {
        let dst = src.other();
        info!("Resuming promotion of arena {} to {}", src.name(), dst.name());
        if dst_state == ArenaState::Erased {
            // lost power while wiping the sibling for a restart of the copy
            self.ensure_blank(dev, dst)?;
            self.set_state(dev, dst, ArenaState::Erased, ArenaState::Receiving)?;
        }
        if src_state == ArenaState::Active {
            self.set_state(dev, src, ArenaState::Active, ArenaState::Copying)?;
        }
        let start = self.find_cursor(dev, dst)?;
        let cursor = match self.migrate(dev, src, dst, None, start)? {
            Some(cursor) => cursor,
            None => {
                warn!("Arena {} full while resuming, restarting copy", dst.name());
                self.erase_arena(dev, dst)?;
                self.set_state(dev, dst, ArenaState::Erased, ArenaState::Receiving)?;
                self.migrate(dev, src, dst, None, 0)?.ok_or(Error::Other)?
            }
        };
        self.finish_promotion(dev, src, dst, cursor)
    }

    /// Format `arena` as a fresh empty active arena
    fn initialise<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<(), Error<D::Error>> {
        info!("Initialising arena {}", arena.name());
        self.set_state(dev, arena, ArenaState::Erased, ArenaState::Receiving)?;
        self.set_state(dev, arena, ArenaState::Receiving, ArenaState::Active)?;
        self.active = arena;
        self.cursor = 0;
        Ok(())
    }

    /// Erase an arena whose header reads ERASED if its slots are not blank
    fn ensure_blank<D: BlockDevice>(
        &self,
        dev: &mut D,
        arena: Arena,
    ) -> Result<(), Error<D::Error>> {
        if !self.slots_blank(dev, arena)? {
            warn!("Arena {} has stale slots, erasing", arena.name());
            self.erase_arena(dev, arena)?;
        }
        Ok(())
    }

    /// Bring both arenas back to one ACTIVE and one ERASED
    pub fn recover<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), Error<D::Error>> {
        let a = self.read_state(dev, Arena::A)?;
        let b = self.read_state(dev, Arena::B)?;
        debug!("Recovering with A {} B {}", a.name(), b.name());
        match plan(a, b) {
            Recovery::Normal(arena) => {
                self.ensure_blank(dev, arena.other())?;
                self.active = arena;
                self.cursor = self.find_cursor(dev, arena)?;
            }
            Recovery::Fresh => {
                self.ensure_blank(dev, Arena::A)?;
                self.ensure_blank(dev, Arena::B)?;
                self.initialise(dev, Arena::A)?;
            }
            Recovery::Resume { src } => {
                let (src_state, dst_state) = if src == Arena::A { (a, b) } else { (b, a) };
                self.resume(dev, src, src_state, dst_state)?;
            }
            Recovery::Retire { src } => {
                let state = if src == Arena::A { a } else { b };
                let dst = src.other();
                info!("Retiring arena {}", src.name());
                self.active = dst;
                self.cursor = self.find_cursor(dev, dst)?;
                self.retire(dev, src, state)?;
            }
            Recovery::Abandon { arena } => {
                let other = arena.other();
                info!("Abandoning arena {}", arena.name());
                self.erase_arena(dev, arena)?;
                if (if other == Arena::A { a } else { b }) == ArenaState::Erased {
                    self.ensure_blank(dev, other)?;
                } else {
                    self.erase_arena(dev, other)?;
                }
                self.initialise(dev, other)?;
            }
            Recovery::Corrupt => {
                error!("Unrecoverable arena states A {} B {}", a.name(), b.name());
                return Err(Error::CorruptMetadata);
            }
        }
        debug!(
            "Arena {} active with {} slots used",
            self.active.name(),
            self.cursor
        );
        Ok(())
    }

    /// Erase both arenas and start over in A
    pub fn format<D: BlockDevice>(&mut self, dev: &mut D) -> Result<(), Error<D::Error>> {
        self.erase_arena(dev, Arena::A)?;
        self.erase_arena(dev, Arena::B)?;
        self.initialise(dev, Arena::A)
    }
}

/// What recovery does for a pair of header states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Steady state, the arena is active
    Normal(Arena),
    /// Both erased, first use
    Fresh,
    /// Promotion out of `src` was interrupted before the sibling became active
    Resume { src: Arena },
    /// Promotion out of `src` completed but `src` was not erased
    Retire { src: Arena },
    /// A fresh initialisation of `arena` was interrupted
    Abandon { arena: Arena },
    Corrupt,
}

pub(crate) fn plan(a: ArenaState, b: ArenaState) -> Recovery {
    use ArenaState::*;
    match (a, b) {
        (Active, Erased) => Recovery::Normal(Arena::A),
        (Erased, Active) => Recovery::Normal(Arena::B),
        (Erased, Erased) => Recovery::Fresh,
        (Active | Copying, Receiving) | (Copying, Erased) => Recovery::Resume { src: Arena::A },
        (Receiving, Active | Copying) | (Erased, Copying) => Recovery::Resume { src: Arena::B },
        (Copying | Dead, Active) => Recovery::Retire { src: Arena::A },
        (Active, Copying | Dead) => Recovery::Retire { src: Arena::B },
        (Receiving, _) => Recovery::Abandon { arena: Arena::A },
        (_, Receiving) => Recovery::Abandon { arena: Arena::B },
        _ => Recovery::Corrupt,
    }
}
