//! Channel unit-status bitfield.
//!
//! Grounded on the teacher's `bitflags!`-based device status types
//! (`pbs-tape/src/sg_tape/tape_alert_flags.rs`).

bitflags::bitflags! {
    /// Channel-returned unit status, as handed back to the channel subsystem
    /// alongside the CCW's residual count.
    #[derive(Default)]
    pub struct UnitStatus: u8 {
        /// Channel-end
        const CE  = 0b0000_0001;
        /// Device-end
        const DE  = 0b0000_0010;
        /// Unit check
        const UC  = 0b0000_0100;
        /// Unit exception
        const UX  = 0b0000_1000;
        /// Control-unit-end
        const CUE = 0b0001_0000;
        /// Attention
        const ATTN = 0b0010_0000;
    }
}

impl UnitStatus {
    /// Shorthand for the common successful-completion status.
    pub fn ce_de() -> Self {
        UnitStatus::CE | UnitStatus::DE
    }
}
