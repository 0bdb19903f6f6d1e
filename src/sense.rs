//! Sense Builder: translates an internal error kind plus the CCW opcode
//! being completed into guest-visible unit status and sense bytes.
//!
//! Grounded on `pbs-tape/src/sgutils2.rs`'s `SenseInfo` (sense-key/asc/ascq
//! decoding, `Display` formatting idiom) and `pbs-tape/src/sg_tape.rs`'s
//! sense-key matching inside `read_block`/`write_block`/`write_filemarks`.

use crate::unitstatus::UnitStatus;
use crate::validity::DeviceFamily;

/// Internal tape error kinds (spec.md §4.3). This is the vocabulary the
/// rest of the crate raises; the sense builder is the only place that
/// knows how each kind maps onto guest-visible bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeErrorKind {
    TapeUnloaded,
    RunSuccess,
    TapeLoadFail,
    ReadFail,
    WriteFail,
    BadCommand,
    Incompat,
    WriteProtect,
    EmptyTape,
    EndOfTape,
    LoadPtErr,
    Fenced,
    BadAlgorithm,
    LocateErr,
    BlockShort,
    ItfError,
    RewindFailed,
    ReadTm,
    Unsolicited,
    StatusOnly,
}

/// Which CCW classes participate in the "passed EOT -> UX" rule
/// (spec.md §4.3 step 4: write, erase-gap, write-mark).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcwClass {
    Write,
    EraseGap,
    WriteMark,
    Read,
    Other,
}

/// Whether the tape currently reports a medium loaded, used by the
/// post-fixup step (spec.md §4.3 step 3).
#[derive(Debug, Clone, Copy)]
pub struct TapeLoadState {
    pub loaded: bool,
    pub at_load_point: bool,
    pub write_protected: bool,
}

/// Result of a sense-builder pass: unit status plus a filled sense array.
#[derive(Debug, Clone)]
pub struct SenseResult {
    pub unit_status: UnitStatus,
    /// Sense bytes, 1 to 32 in length per spec.md §3.
    pub sense: Vec<u8>,
    /// Mirrors spec.md §4.3's `sns_pending` marker: set on any `UC`.
    pub sns_pending: bool,
}

// Sense byte layout (subset used by this builder, independent of family):
// byte 0: error-recovery-action-ish summary bits
// byte 1: tape-unit flags (load point, write-protect, tape-unit-available)
// byte 3: ERA (error recovery action) code
// byte 7: sense-format byte, where applicable

const SENSE_LEN: usize = 24;

mod byte1 {
    pub const LOAD_POINT: u8 = 0b0100_0000;
    pub const WRITE_PROTECT: u8 = 0b0010_0000;
    pub const TAPE_UNIT_AVAILABLE: u8 = 0b0000_0001;
}

mod byte0 {
    pub const COMMAND_REJECT: u8 = 0b1000_0000;
    pub const INTERVENTION_REQUIRED: u8 = 0b0000_0010;
    pub const DATA_CHECK: u8 = 0b0010_0000;
}

fn era_code(kind: TapeErrorKind) -> u8 {
    match kind {
        TapeErrorKind::TapeUnloaded => 0x00,
        TapeErrorKind::RunSuccess => 0x00,
        TapeErrorKind::TapeLoadFail => 0x01,
        TapeErrorKind::ReadFail => 0x02,
        TapeErrorKind::WriteFail => 0x03,
        TapeErrorKind::BadCommand => 0x04,
        TapeErrorKind::Incompat => 0x05,
        TapeErrorKind::WriteProtect => 0x06,
        TapeErrorKind::EmptyTape => 0x07,
        TapeErrorKind::EndOfTape => 0x08,
        TapeErrorKind::LoadPtErr => 0x09,
        TapeErrorKind::Fenced => 0x0A,
        TapeErrorKind::BadAlgorithm => 0x0B,
        TapeErrorKind::LocateErr => 0x0C,
        TapeErrorKind::BlockShort => 0x0D,
        TapeErrorKind::ItfError => 0x0E,
        TapeErrorKind::RewindFailed => 0x0F,
        TapeErrorKind::ReadTm => 0x10,
        TapeErrorKind::Unsolicited => 0x11,
        TapeErrorKind::StatusOnly => 0x00,
    }
}

/// Base unit-status bits for (family, kind), before the passed-EOT and
/// post-fixup rules are applied.
fn base_unit_status(_family: DeviceFamily, kind: TapeErrorKind) -> UnitStatus {
    use TapeErrorKind::*;
    match kind {
        RunSuccess | StatusOnly => UnitStatus::ce_de(),
        TapeUnloaded => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        TapeLoadFail => UnitStatus::CE | UnitStatus::UC,
        ReadFail => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        WriteFail => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        BadCommand => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        Incompat => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        WriteProtect => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        EmptyTape => UnitStatus::CE | UnitStatus::DE | UnitStatus::UX,
        EndOfTape => UnitStatus::CE | UnitStatus::DE | UnitStatus::UX,
        LoadPtErr => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        Fenced => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        BadAlgorithm => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        LocateErr => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        BlockShort => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        ItfError => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        RewindFailed => UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
        ReadTm => UnitStatus::CE | UnitStatus::DE | UnitStatus::UX,
        Unsolicited => UnitStatus::ATTN,
    }
}

fn base_sense_byte0(kind: TapeErrorKind) -> u8 {
    use TapeErrorKind::*;
    match kind {
        BadCommand => byte0::COMMAND_REJECT,
        TapeUnloaded | TapeLoadFail => byte0::INTERVENTION_REQUIRED,
        WriteFail | ReadFail | Fenced | ItfError => byte0::DATA_CHECK,
        _ => 0,
    }
}

/// Build unit status + sense bytes for one CCW completion, per spec.md
/// §4.3's four numbered steps.
pub fn build_sense(
    family: DeviceFamily,
    kind: TapeErrorKind,
    ccw_class: CcwClass,
    load: TapeLoadState,
    passed_eot: bool,
) -> SenseResult {
    // Step 1 + 2: base unit status and sense bytes keyed by error kind.
    let mut unit_status = base_unit_status(family, kind);
    let mut sense = vec![0u8; SENSE_LEN];
    sense[0] = base_sense_byte0(kind);
    sense[3] = era_code(kind);
    if SENSE_LEN > 7 {
        sense[7] = 0;
    }

    // Step 3: post-fixup based on load state.
    if !load.loaded {
        sense[0] |= byte0::INTERVENTION_REQUIRED;
        sense[1] |= byte1::WRITE_PROTECT;
    } else {
        if load.at_load_point {
            sense[1] |= byte1::LOAD_POINT;
        }
        if load.write_protected {
            sense[1] |= byte1::WRITE_PROTECT;
        }
    }
    sense[1] |= byte1::TAPE_UNIT_AVAILABLE;

    // Step 4: passed-EOT + data-bearing write + StatusOnly -> UX.
    let data_bearing_write = matches!(ccw_class, CcwClass::Write | CcwClass::EraseGap | CcwClass::WriteMark);
    if passed_eot && data_bearing_write && kind == TapeErrorKind::StatusOnly {
        unit_status |= UnitStatus::UX;
    }

    let sns_pending = unit_status.contains(UnitStatus::UC);

    SenseResult {
        unit_status,
        sense,
        sns_pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded() -> TapeLoadState {
        TapeLoadState {
            loaded: true,
            at_load_point: false,
            write_protected: false,
        }
    }

    fn unloaded() -> TapeLoadState {
        TapeLoadState {
            loaded: false,
            at_load_point: false,
            write_protected: false,
        }
    }

    #[test]
    fn unloaded_tape_sets_intervention_and_write_protect() {
        let r = build_sense(
            DeviceFamily::T3420,
            TapeErrorKind::TapeUnloaded,
            CcwClass::Other,
            unloaded(),
            false,
        );
        assert_ne!(r.sense[0] & byte0::INTERVENTION_REQUIRED, 0);
        assert_ne!(r.sense[1] & byte1::WRITE_PROTECT, 0);
        assert!(r.unit_status.contains(UnitStatus::UC));
        assert!(r.sns_pending);
    }

    #[test]
    fn passed_eot_on_write_adds_ux_only_for_status_only() {
        let r = build_sense(
            DeviceFamily::T3480,
            TapeErrorKind::StatusOnly,
            CcwClass::Write,
            loaded(),
            true,
        );
        assert!(r.unit_status.contains(UnitStatus::UX));

        let r2 = build_sense(
            DeviceFamily::T3480,
            TapeErrorKind::RunSuccess,
            CcwClass::Write,
            loaded(),
            true,
        );
        assert!(!r2.unit_status.contains(UnitStatus::UX));
    }

    #[test]
    fn passed_eot_on_read_never_adds_ux() {
        let r = build_sense(
            DeviceFamily::T3480,
            TapeErrorKind::StatusOnly,
            CcwClass::Read,
            loaded(),
            true,
        );
        assert!(!r.unit_status.contains(UnitStatus::UX));
    }

    #[test]
    fn loaded_tape_reports_available_and_load_point() {
        let mut state = loaded();
        state.at_load_point = true;
        let r = build_sense(DeviceFamily::T3590, TapeErrorKind::RunSuccess, CcwClass::Other, state, false);
        assert_ne!(r.sense[1] & byte1::TAPE_UNIT_AVAILABLE, 0);
        assert_ne!(r.sense[1] & byte1::LOAD_POINT, 0);
        assert!(!r.sns_pending);
    }

    #[test]
    fn bad_command_sets_command_reject_bit() {
        let r = build_sense(DeviceFamily::T3420, TapeErrorKind::BadCommand, CcwClass::Other, loaded(), false);
        assert_ne!(r.sense[0] & byte0::COMMAND_REJECT, 0);
    }
}
