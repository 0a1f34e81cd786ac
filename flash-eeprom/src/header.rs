//! Arena header state machine.
//!
//! The header starts with four marker words of `WRITE_UNIT` bytes. Each transition programs
//! the next marker to zeros, so moving forward never needs an erase. A marker counts as set
//! once any of its bytes is not 0xFF, which makes a torn marker write count as done.

/// One of the two halves of the parent device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arena {
    A,
    B,
}

impl Arena {
    pub fn other(self) -> Arena {
        match self {
            Arena::A => Arena::B,
            Arena::B => Arena::A,
        }
    }

    pub(crate) fn index(self) -> u32 {
        match self {
            Arena::A => 0,
            Arena::B => 1,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Arena::A => "A",
            Arena::B => "B",
        }
    }
}

/// Number of marker words in a header
pub const MARKERS: usize = 4;

/// State token stored in an arena header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArenaState {
    /// Header reads all 0xFF
    Erased,
    /// Target of a copy in progress
    Receiving,
    /// Authoritative store
    Active,
    /// Being drained into the sibling
    Copying,
    /// Garbage awaiting erase
    Dead,
}

impl ArenaState {
    /// Number of set markers encoding the state
    pub fn markers(self) -> usize {
        match self {
            ArenaState::Erased => 0,
            ArenaState::Receiving => 1,
            ArenaState::Active => 2,
            ArenaState::Copying => 3,
            ArenaState::Dead => 4,
        }
    }

    /// Decode a header. Set markers must form a prefix, anything else is corrupt
    pub fn from_markers(markers: [bool; MARKERS]) -> Option<ArenaState> {
        let count = markers.iter().take_while(|&&set| set).count();
        if markers[count..].iter().any(|&set| set) {
            return None;
        }
        Some(match count {
            0 => ArenaState::Erased,
            1 => ArenaState::Receiving,
            2 => ArenaState::Active,
            3 => ArenaState::Copying,
            _ => ArenaState::Dead,
        })
    }

    /// Decode the raw marker words of a header
    pub fn decode(header: &[u8], write_unit: usize) -> Option<ArenaState> {
        let mut markers = [false; MARKERS];
        for (marker, word) in markers.iter_mut().zip(header.chunks(write_unit)) {
            *marker = word.iter().any(|&b| b != 0xFF);
        }
        ArenaState::from_markers(markers)
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            ArenaState::Erased => "ERASED",
            ArenaState::Receiving => "RECEIVING",
            ArenaState::Active => "ACTIVE",
            ArenaState::Copying => "COPYING",
            ArenaState::Dead => "DEAD",
        }
    }
}
