use crate::{ByteAddress, SectorIndex};

/// Iterate over the sectors that intersect a byte range
#[derive(Debug, Clone)]
pub struct SectorIter {
    pub(crate) sector_size: u32,
    pub(crate) count: u32,
    pub(crate) end: u32,
}

impl SectorIter {
    /// Sectors touched by `[offset, offset + length)`, rounded outward.
    ///
    /// An empty range touches no sectors.
    pub fn covering(sector_size: u32, offset: u32, length: u32) -> Self {
        let (count, end) = if length == 0 {
            (0, 0)
        } else {
            (
                offset / sector_size,
                (offset + (length - 1)) / sector_size + 1,
            )
        };
        SectorIter {
            sector_size,
            count,
            end,
        }
    }

    /// All `sector_num` sectors of a device
    pub fn all(sector_size: u32, sector_num: u32) -> Self {
        SectorIter {
            sector_size,
            count: 0,
            end: sector_num,
        }
    }
}

impl Iterator for SectorIter {
    type Item = (SectorIndex, ByteAddress);

    fn next(&mut self) -> Option<Self::Item> {
        if self.count < self.end {
            let sector = SectorIndex::new(self.count);
            self.count += 1;
            Some((sector, sector.as_byte_address(self.sector_size)))
        } else {
            None
        }
    }
}

impl DoubleEndedIterator for SectorIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.count < self.end {
            self.end -= 1;
            let sector = SectorIndex::new(self.end);
            Some((sector, sector.as_byte_address(self.sector_size)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_covering_rounds_outward() {
        let sectors: Vec<u32> = SectorIter::covering(64, 60, 10)
            .map(|(s, _)| s.as_u32())
            .collect();
        assert_eq!(sectors, [0, 1]);
        assert_eq!(SectorIter::covering(64, 64, 64).count(), 1);
        assert_eq!(SectorIter::covering(64, 10, 0).count(), 0);
    }

    #[test]
    fn test_reverse() {
        let mut iter = SectorIter::all(64, 3).rev();
        assert_eq!(iter.next(), Some((SectorIndex::new(2), ByteAddress::new(128))));
        assert_eq!(iter.next(), Some((SectorIndex::new(1), ByteAddress::new(64))));
        assert_eq!(iter.next(), Some((SectorIndex::new(0), ByteAddress::new(0))));
        assert_eq!(iter.next(), None);
    }

}
