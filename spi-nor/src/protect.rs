//! Block protection maths.
//!
//! The status register carries `bpbits_num` block protection bits starting at bit 2. Their value
//! selects a region anchored at the top of the address space:
//!
//! - `0` protects nothing
//! - `2^n - 1` protects the whole device
//! - anything in between protects the top `capacity >> (2^n - 1 - value)` bytes
//!
//! Regions are nested, so a larger value always protects a superset of a smaller one.

use core::ops::Range;

/// Bit position of the first block protection bit in the status register
pub const BP_SHIFT: u8 = 2;

/// Mask of the block protection bits in the status register
pub fn bp_mask(bpbits_num: u8) -> u8 {
    (((1u16 << bpbits_num) - 1) as u8) << BP_SHIFT
}

/// Extract the block protection value from a status register
pub fn bp_value(status: u8, bpbits_num: u8) -> u8 {
    (status & bp_mask(bpbits_num)) >> BP_SHIFT
}

/// Largest block protection value, protecting the whole device
pub fn bp_max(bpbits_num: u8) -> u8 {
    ((1u16 << bpbits_num) - 1) as u8
}

/// Byte range protected by a block protection value.
///
/// An empty range is returned as `capacity..capacity`.
pub fn protected_range(capacity: u32, bpbits_num: u8, value: u8) -> Range<u32> {
    let max = bp_max(bpbits_num);
    if value == 0 || bpbits_num == 0 {
        return capacity..capacity;
    }
    if value >= max {
        return 0..capacity;
    }
    let shift = (max - value) as u32;
    let size = if shift >= 32 { 0 } else { capacity >> shift };
    (capacity - size)..capacity
}

/// Block protection value protecting exactly `range`, if there is one
pub fn value_for_range(capacity: u32, bpbits_num: u8, range: Range<u32>) -> Option<u8> {
    let range = if range.is_empty() {
        capacity..capacity
    } else {
        range
    };
    (0..=bp_max(bpbits_num)).find(|&v| protected_range(capacity, bpbits_num, v) == range)
}

/// Value after protecting `request` on top of the current value
pub fn protect(capacity: u32, bpbits_num: u8, current: u8, request: Range<u32>) -> Option<u8> {
    if request.is_empty() {
        return Some(current);
    }
    let requested = value_for_range(capacity, bpbits_num, request)?;
    Some(current.max(requested))
}

/// Value after removing protection from `request`.
///
/// Protected regions are anchored at the top, so the request must cover the bottom of the
/// current region and leave a protectable remainder.
pub fn unprotect(capacity: u32, bpbits_num: u8, current: u8, request: Range<u32>) -> Option<u8> {
    let region = protected_range(capacity, bpbits_num, current);
    if request.is_empty() || request.end <= region.start || request.start >= region.end {
        // Nothing protected in the request
        return Some(current);
    }
    if request.start > region.start {
        // Would split the region in two
        return None;
    }
    let remaining = request.end.max(region.start)..capacity;
    value_for_range(capacity, bpbits_num, remaining)
}

/// Whether `[offset, offset + length)` intersects the protected region
pub fn intersects(region: &Range<u32>, offset: u32, length: u32) -> bool {
    length != 0 && offset < region.end && offset + length > region.start
}
