//! Simple-8b integer packing
//!
//! Streams unsigned integers (with missing-value markers) into 64-bit
//! little-endian blocks. The low 4 bits of a block select a layout; the
//! remaining 60 bits hold `count` slots of `width` bits each, first slot in
//! the lowest bits. An all-ones slot marks a skipped (missing) value, so a
//! value that is exactly the all-ones pattern of its natural width needs
//! one extra bit of storage.
//!
//! The 128-bit flavor adds one extended layout for deltas with
//! nibble-aligned trailing zeros; anything it cannot represent is rejected
//! so the caller can fall back to a literal.

use std::collections::VecDeque;

const SELECTOR_BITS: u32 = 4;

/// `(slot count, slot width)` per selector 0..=13, widest count first
const LAYOUTS: [(u32, u32); 14] = [
    (60, 1),
    (30, 2),
    (20, 3),
    (15, 4),
    (12, 5),
    (10, 6),
    (8, 7),
    (7, 8),
    (6, 10),
    (5, 12),
    (4, 15),
    (3, 20),
    (2, 30),
    (1, 60),
];

/// Extended layout: `[selector:4][shift nibbles:4][payload:56]`,
/// value = payload << 4*shift. 128-bit builders only.
const EXTENDED_SELECTOR: u64 = 14;
const EXTENDED_PAYLOAD_BITS: u32 = 56;
const EXTENDED_PAYLOAD_MASK: u64 = (1 << EXTENDED_PAYLOAD_BITS) - 1;

/// Integer widths the packer accepts
pub trait Simple8bType: Copy + PartialEq {
    /// Whether the extended (shifted) layout is available
    const EXTENDED: bool;

    /// Bits needed to store the value in a slot, accounting for the
    /// all-ones skip sentinel
    fn storage_bits(self) -> u32;

    /// Trailing zero bits
    fn trailing_zeros(self) -> u32;

    /// Shift right
    fn shr(self, n: u32) -> Self;

    /// Low 64 bits
    fn low_u64(self) -> u64;
}

impl Simple8bType for u64 {
    const EXTENDED: bool = false;

    fn storage_bits(self) -> u32 {
        let bits = (64 - self.leading_zeros()).max(1);
        if bits < 64 && self == (1u64 << bits) - 1 {
            bits + 1
        } else if self == u64::MAX {
            65
        } else {
            bits
        }
    }

    fn trailing_zeros(self) -> u32 {
        self.trailing_zeros()
    }

    fn shr(self, n: u32) -> Self {
        self >> n
    }

    fn low_u64(self) -> u64 {
        self
    }
}

impl Simple8bType for u128 {
    const EXTENDED: bool = true;

    fn storage_bits(self) -> u32 {
        let bits = (128 - self.leading_zeros()).max(1);
        if bits < 128 && self == (1u128 << bits) - 1 {
            bits + 1
        } else if self == u128::MAX {
            129
        } else {
            bits
        }
    }

    fn trailing_zeros(self) -> u32 {
        self.trailing_zeros()
    }

    fn shr(self, n: u32) -> Self {
        self >> n
    }

    fn low_u64(self) -> u64 {
        self as u64
    }
}

/// Streaming Simple-8b packer.
///
/// Finalized blocks are pushed to the `out` vector handed to each call;
/// nothing is written anywhere else. When an append or skip no longer fits
/// into a single block together with everything pending, all previously
/// pending slots are drained to blocks first. The pending run's delta base
/// therefore always equals the last value committed to an emitted block,
/// which the double rescaling paths rely on.
#[derive(Debug, Clone)]
pub struct Simple8bBuilder<T> {
    pending: VecDeque<Option<T>>,
}

impl<T: Simple8bType> Simple8bBuilder<T> {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Append a value. Returns false (leaving all state untouched) when the
    /// value is not representable in any layout.
    pub fn append(&mut self, value: T, out: &mut Vec<u64>) -> bool {
        if value.storage_bits() <= 60 {
            self.pending.push_back(Some(value));
            self.rebalance(out);
            return true;
        }

        if T::EXTENDED {
            if let Some(block) = pack_extended(value) {
                self.drain(out);
                out.push(block);
                return true;
            }
        }
        false
    }

    /// Enqueue a missing-value marker
    pub fn skip(&mut self, out: &mut Vec<u64>) {
        self.pending.push_back(None);
        self.rebalance(out);
    }

    /// Drain every pending slot into exactly-full blocks
    pub fn flush(&mut self, out: &mut Vec<u64>) {
        self.drain(out);
    }

    /// Iterate the pending slots in append order; `None` marks skips
    pub fn pending(&self) -> impl Iterator<Item = Option<T>> + '_ {
        self.pending.iter().copied()
    }

    fn rebalance(&mut self, out: &mut Vec<u64>) {
        if self.fits_in_single_block() {
            return;
        }
        // Keep only the newest slot pending so the emitted blocks end at
        // the previously appended value.
        let newest = self.pending.pop_back();
        self.drain(out);
        if let Some(slot) = newest {
            self.pending.push_back(slot);
        }
    }

    fn fits_in_single_block(&self) -> bool {
        let len = self.pending.len();
        let max_bits = self
            .pending
            .iter()
            .map(|slot| slot.map_or(1, Simple8bType::storage_bits))
            .max()
            .unwrap_or(1);
        LAYOUTS
            .iter()
            .any(|&(count, width)| count as usize >= len && width >= max_bits)
    }

    fn drain(&mut self, out: &mut Vec<u64>) {
        while !self.pending.is_empty() {
            out.push(self.pack_one());
        }
    }

    /// Pack the longest representable prefix of pending into one block
    fn pack_one(&mut self) -> u64 {
        for (selector, &(count, width)) in LAYOUTS.iter().enumerate() {
            let count = count as usize;
            if count > self.pending.len() {
                continue;
            }
            let fits = self
                .pending
                .iter()
                .take(count)
                .all(|slot| slot.map_or(true, |v| v.storage_bits() <= width));
            if !fits {
                continue;
            }

            let mut block = selector as u64;
            for i in 0..count as u32 {
                let bits = match self.pending.pop_front() {
                    Some(Some(value)) => value.low_u64(),
                    Some(None) => slot_ones(width),
                    None => unreachable!("pending shorter than chosen layout"),
                };
                block |= bits << (SELECTOR_BITS + i * width);
            }
            return block;
        }
        unreachable!("a single pending slot always fits the widest layout")
    }
}

impl<T: Simple8bType> Default for Simple8bBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn slot_ones(width: u32) -> u64 {
    (1u64 << width) - 1
}

fn pack_extended<T: Simple8bType>(value: T) -> Option<u64> {
    let shift_nibbles = (value.trailing_zeros() / 4).min(15);
    let payload = value.shr(shift_nibbles * 4);
    if payload.storage_bits() > EXTENDED_PAYLOAD_BITS {
        return None;
    }
    let payload = payload.low_u64();
    // The all-ones 60-bit field is the skip sentinel
    if payload == EXTENDED_PAYLOAD_MASK && shift_nibbles == 15 {
        return None;
    }
    Some(EXTENDED_SELECTOR | (shift_nibbles as u64) << 4 | payload << 8)
}

/// Number of row elements (values and skips) one packed block represents
pub fn block_slot_count(block: u64) -> u32 {
    let selector = (block & 0xF) as usize;
    match selector {
        0..=13 => LAYOUTS[selector].0,
        14 => 1,
        _ => unreachable!("reserved selector in packed block"),
    }
}

#[cfg(test)]
pub(crate) fn decode_block_u64(block: u64, out: &mut Vec<Option<u64>>) {
    let selector = (block & 0xF) as usize;
    assert!(selector <= 13, "u64 blocks never use the extended selector");
    let (count, width) = LAYOUTS[selector];
    let mask = slot_ones(width);
    for i in 0..count {
        let slot = (block >> (SELECTOR_BITS + i * width)) & mask;
        out.push(if slot == mask { None } else { Some(slot) });
    }
}

#[cfg(test)]
pub(crate) fn decode_block_u128(block: u64, out: &mut Vec<Option<u128>>) {
    let selector = (block & 0xF) as usize;
    if selector == 14 {
        let shift = ((block >> 4) & 0xF) as u32 * 4;
        let payload = block >> 8;
        out.push(Some((payload as u128) << shift));
        return;
    }
    let (count, width) = LAYOUTS[selector];
    let mask = slot_ones(width);
    for i in 0..count {
        let slot = (block >> (SELECTOR_BITS + i * width)) & mask;
        out.push(if slot == mask { None } else { Some(slot as u128) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush_all(builder: &mut Simple8bBuilder<u64>) -> Vec<Option<u64>> {
        let mut blocks = Vec::new();
        builder.flush(&mut blocks);
        let mut slots = Vec::new();
        for block in blocks {
            decode_block_u64(block, &mut slots);
        }
        slots
    }

    #[test]
    fn test_single_value_uses_widest_layout() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        assert!(builder.append(5, &mut out));
        assert!(out.is_empty());

        builder.flush(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0] & 0xF, 13); // (1, 60)
        assert_eq!(block_slot_count(out[0]), 1);

        let mut slots = Vec::new();
        decode_block_u64(out[0], &mut slots);
        assert_eq!(slots, vec![Some(5)]);
    }

    #[test]
    fn test_sixteen_zeros_pack_into_two_blocks() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        for _ in 0..16 {
            assert!(builder.append(0, &mut out));
        }
        assert!(out.is_empty());

        builder.flush(&mut out);
        // 15 slots of 4 bits, then the leftover alone
        assert_eq!(out.len(), 2);
        assert_eq!(block_slot_count(out[0]), 15);
        assert_eq!(block_slot_count(out[1]), 1);

        let mut slots = Vec::new();
        decode_block_u64(out[0], &mut slots);
        decode_block_u64(out[1], &mut slots);
        assert_eq!(slots, vec![Some(0); 16]);
    }

    #[test]
    fn test_sixty_zeros_fill_one_block() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        for _ in 0..60 {
            assert!(builder.append(0, &mut out));
        }
        assert!(out.is_empty());
        builder.flush(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(block_slot_count(out[0]), 60);
    }

    #[test]
    fn test_overflow_drains_all_but_newest() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        for _ in 0..60 {
            builder.append(0, &mut out);
        }
        assert!(out.is_empty());

        builder.append(0, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(block_slot_count(out[0]), 60);
        assert_eq!(builder.pending().collect::<Vec<_>>(), vec![Some(0)]);
    }

    #[test]
    fn test_width_growth_drains_pending() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        for _ in 0..12 {
            builder.append(17, &mut out); // 5 bits
        }
        assert!(out.is_empty());

        builder.append(1 << 30, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(block_slot_count(out[0]), 12); // (12, 5)
        assert_eq!(builder.pending().count(), 1);
    }

    #[test]
    fn test_skips_decode_as_missing() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        builder.append(1, &mut out);
        builder.skip(&mut out);
        builder.append(2, &mut out);

        let slots = flush_all(&mut builder);
        assert_eq!(slots, vec![Some(1), None, Some(2)]);
    }

    #[test]
    fn test_skip_only_stream() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        for _ in 0..5 {
            builder.skip(&mut out);
        }
        let slots = flush_all(&mut builder);
        assert_eq!(slots, vec![None; 5]);
    }

    #[test]
    fn test_append_rejects_unrepresentable_u64() {
        let mut builder = Simple8bBuilder::<u64>::new();
        let mut out = Vec::new();
        builder.append(3, &mut out);

        // 61 significant bits
        assert!(!builder.append(1 << 60, &mut out));
        // all-ones of 60 bits collides with the skip sentinel
        assert!(!builder.append((1 << 60) - 1, &mut out));
        // rejections leave pending untouched
        assert!(out.is_empty());
        assert_eq!(builder.pending().collect::<Vec<_>>(), vec![Some(3)]);

        // one below the sentinel is representable; it cannot share a block
        // with the pending 3, so the 3 drains first
        assert!(builder.append((1 << 60) - 2, &mut out));
        assert_eq!(out.len(), 1);
        assert_eq!(builder.pending().collect::<Vec<_>>(), vec![Some((1 << 60) - 2)]);
    }

    #[test]
    fn test_sentinel_sized_values_get_extra_bit() {
        assert_eq!(0u64.storage_bits(), 1);
        assert_eq!(1u64.storage_bits(), 2); // 0b1 is all-ones at width 1
        assert_eq!(2u64.storage_bits(), 2);
        assert_eq!(3u64.storage_bits(), 3); // 0b11 is all-ones at width 2
        assert_eq!(u64::MAX.storage_bits(), 65);
    }

    #[test]
    fn test_u128_extended_layout_roundtrip() {
        let mut builder = Simple8bBuilder::<u128>::new();
        let mut out = Vec::new();
        let value = 1u128 << 100;
        assert!(builder.append(value, &mut out));
        // extended values emit immediately
        assert_eq!(out.len(), 1);
        assert_eq!(out[0] & 0xF, 14);
        assert_eq!(block_slot_count(out[0]), 1);

        let mut slots = Vec::new();
        decode_block_u128(out[0], &mut slots);
        assert_eq!(slots, vec![Some(value)]);
    }

    #[test]
    fn test_u128_extended_drains_pending_first() {
        let mut builder = Simple8bBuilder::<u128>::new();
        let mut out = Vec::new();
        builder.append(7, &mut out);
        builder.append(1u128 << 100, &mut out);

        // pending [7] drained to its own block, then the extended block
        assert_eq!(out.len(), 2);
        assert_eq!(out[0] & 0xF, 13);
        assert_eq!(out[1] & 0xF, 14);
        assert_eq!(builder.pending().count(), 0);
    }

    #[test]
    fn test_u128_rejects_wide_low_entropy_values() {
        let mut builder = Simple8bBuilder::<u128>::new();
        let mut out = Vec::new();
        // 101 significant bits with no trailing zeros
        assert!(!builder.append((1u128 << 100) | 1, &mut out));
        assert!(out.is_empty());
        assert_eq!(builder.pending().count(), 0);
    }
}
