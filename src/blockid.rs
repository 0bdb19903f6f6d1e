//! Blockid translator: 22-bit (3480/3490) <-> 32-bit (3590) tape block-id
//! conversions.
//!
//! The 22-bit layout, as bits of the encoded `u32` (spec.md §4.4):
//!
//! ```text
//! bit 0      : wrap
//! bits 1..=7 : segment number
//! bits 8..=9 : format mode
//! bits 10..=31: logical block number
//! ```
//!
//! The 32-bit layout is a plain linear block number.
//!
//! Conversion is bit-splitting, grounded on the teacher's packed-bitfield
//! struct style for hardware-defined layouts (`pbs-tape/src/sg_tape.rs`'s
//! `ReadPositionLongPage`), implemented here as pure functions since the
//! "struct" in this case is a 32-bit scalar, not a multi-byte record.

/// Encode an emulated block-id into its 22-bit on-the-wire representation
/// (still a `u32`, MSB-justified the way the 22-bit format is carried in
/// SENSE ID / READ BLOCK ID style fields).
pub fn encode_22bit(wrap: bool, segment: u8, format_mode: u8, logical_block: u32) -> u32 {
    let wrap_bit = if wrap { 1u32 } else { 0 };
    let segment = (segment & 0x7f) as u32;
    let format_mode = (format_mode & 0x3) as u32;
    let logical_block = logical_block & 0x003f_ffff; // 22 bits total budget

    (wrap_bit << 31) | (segment << 24) | (format_mode << 22) | logical_block
}

/// Decode a 22-bit block-id into (wrap, segment, format_mode, logical_block).
pub fn decode_22bit(value: u32) -> (bool, u8, u8, u32) {
    let wrap = (value >> 31) & 0x1 != 0;
    let segment = ((value >> 24) & 0x7f) as u8;
    let format_mode = ((value >> 22) & 0x3) as u8;
    let logical_block = value & 0x003f_ffff;
    (wrap, segment, format_mode, logical_block)
}

/// Convert a 22-bit block-id to its 32-bit equivalent.
///
/// Per spec.md §4.4: "take the high 8 bits of the 22-bit value (wrap +
/// segment#) and place them as the high 8 bits of a 30-bit low-order
/// field". The remaining 22 bits of that 30-bit field are the 22-bit
/// value's format-mode + logical-block bits, unchanged; the top two bits
/// of the 32-bit result are unused (zero).
pub fn blockid_22_to_32(value22: u32) -> u32 {
    let high8 = (value22 >> 24) & 0xff; // wrap(1) + segment(7)
    let low22 = value22 & 0x003f_ffff; // format_mode(2) + logical_block(22)
    (high8 << 22) | low22
}

/// Convert a 32-bit block-id back to its 22-bit equivalent.
///
/// Inverse of [`blockid_22_to_32`].
pub fn blockid_32_to_22(value32: u32) -> u32 {
    let high8 = (value32 >> 22) & 0xff;
    let low22 = value32 & 0x003f_ffff;
    (high8 << 24) | low22
}

/// Which block-id width a device (guest side) or media handler (backing
/// side) uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockidWidth {
    Bits22,
    Bits32,
}

/// Translate a block-id observed at the media-handler boundary into the
/// width the guest expects (entry point: *actual -> emulated*, used after
/// reading a block-id back from the backing store).
pub fn actual_to_emulated(value: u32, actual: BlockidWidth, emulated: BlockidWidth) -> u32 {
    match (actual, emulated) {
        (BlockidWidth::Bits22, BlockidWidth::Bits22) => value,
        (BlockidWidth::Bits32, BlockidWidth::Bits32) => value,
        (BlockidWidth::Bits22, BlockidWidth::Bits32) => blockid_22_to_32(value),
        (BlockidWidth::Bits32, BlockidWidth::Bits22) => blockid_32_to_22(value),
    }
}

/// Translate a guest-supplied block-id before issuing a locate against the
/// backing store (entry point: *emulated -> actual*).
pub fn emulated_to_actual(value: u32, emulated: BlockidWidth, actual: BlockidWidth) -> u32 {
    // The split/merge rule is its own inverse across the same two widths.
    actual_to_emulated(value, emulated, actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_22_to_32_all_combinations() {
        for width_a in [BlockidWidth::Bits22, BlockidWidth::Bits32] {
            for width_b in [BlockidWidth::Bits22, BlockidWidth::Bits32] {
                let sample: u32 = 0x1234_5678;
                let there = actual_to_emulated(sample, width_a, width_b);
                let back = actual_to_emulated(there, width_b, width_a);
                assert_eq!(back, sample, "{:?} -> {:?} -> {:?}", width_a, width_b, width_a);
            }
        }
    }

    #[test]
    fn spec_example_first_block() {
        // input 22-bit [0x01,0x00,0x00,0x00] (first block) -> 32-bit
        // [0x00,0x40,0x00,0x00] per the split rule.
        let value22 = u32::from_be_bytes([0x01, 0x00, 0x00, 0x00]);
        let value32 = blockid_22_to_32(value22);
        assert_eq!(value32.to_be_bytes(), [0x00, 0x40, 0x00, 0x00]);

        let back = blockid_32_to_22(value32);
        assert_eq!(back, value22);
    }

    #[test]
    fn decode22_encode22_roundtrip() {
        for logical_block in [0u32, 1, 12345, 0x003f_ffff] {
            let encoded = encode_22bit(true, 0x55, 0x2, logical_block);
            let (wrap, segment, format_mode, block) = decode_22bit(encoded);
            assert!(wrap);
            assert_eq!(segment, 0x55);
            assert_eq!(format_mode, 0x2);
            assert_eq!(block, logical_block);
        }
    }
}
