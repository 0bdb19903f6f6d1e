//! Tape CCW Engine: executes one channel command word against a [`TapeState`]
//! (spec.md §4.7), producing the residual count, unit status and sense bytes
//! the channel subsystem reports back to the guest.
//!
//! Grounded on `pbs-tape/src/sg_tape.rs`'s per-command method style (one
//! method per SCSI command, status folded into the return value)
//! generalized here to per-CCW-opcode dispatch over the validity matrix,
//! media handler and sense builder this crate already defines.

use log::{info, warn};

use crate::blockid::{self, BlockidWidth};
use crate::device::{DeviceContext, DeviceKind};
use crate::error::BlockReadError;
use crate::media::{MediaHandler, ReadResult};
use crate::sense::{build_sense, CcwClass, SenseResult, TapeErrorKind, TapeLoadState};
use crate::tape::display::Fcb;
use crate::tape::TapeState;
use crate::unitstatus::UnitStatus;
use crate::validity::{
    build_command_table, device_family_info, family_for_device_type, opcode, residual_status,
    DeviceFamily, DeviceFamilyInfo, Validity,
};

/// One CCW as handed to a device by the channel subsystem (spec.md §4.7).
/// `chained` and `ccw_seq` are carried for tracing only -- this engine
/// does not model multi-CCW chaining, that belongs to the channel
/// subsystem the spec keeps out of scope (§1).
#[derive(Debug, Clone, Copy)]
pub struct CcwRequest {
    pub opcode: u8,
    pub chained: bool,
    pub count: u16,
    pub prev_opcode: u8,
    pub ccw_seq: u32,
}

/// Terminal status of one CCW execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct CcwResult {
    pub unit_status: UnitStatus,
    pub residual: u32,
    /// Whether the device still has more data to transfer for this CCW.
    /// Always `false` here: every branch below services the whole buffer
    /// in one call.
    pub more: bool,
}

/// Entry point: execute `req` against `ctx`'s tape state, updating
/// `ctx.buffer`/`ctx.sense`/`ctx.unit_status`/`ctx.residual` in place
/// (spec.md §4.7's "↔" bidirectional parameters).
pub fn execute(ctx: &mut DeviceContext, req: &CcwRequest) -> CcwResult {
    let DeviceContext {
        device_type,
        buffer,
        sense,
        device_id,
        kind,
        ..
    } = ctx;

    let result = match kind {
        DeviceKind::Tape(tape) => dispatch(tape, *device_type, req, buffer, sense, device_id),
        DeviceKind::Him(_) => {
            warn!("ccw: tape opcode {:#04x} issued against a HIM subchannel", req.opcode);
            CcwResult {
                unit_status: UnitStatus::CE | UnitStatus::DE | UnitStatus::UC,
                residual: req.count as u32,
                more: false,
            }
        }
    };

    ctx.unit_status = result.unit_status;
    ctx.residual = result.residual;
    result
}

/// Build the device-identifier block SENSE ID returns (spec.md §4.7 step
/// 4). Not wire-compatible with any real vendor node-descriptor format
/// (Non-goal §1: bug-for-bug vendor fidelity) -- a 7-byte classic form
/// (control-unit type, device type twice, model and feature byte) is all
/// this crate models, so the `legacysenseid` toggle named by the spec has
/// no effect to gate: every family already gets the short form.
pub fn build_device_id(device_type: u16) -> Vec<u8> {
    let hi = (device_type >> 8) as u8;
    let lo = device_type as u8;
    vec![0xFF, hi, lo, 0x01, hi, lo, 0x00]
}

fn dispatch(
    tape: &mut TapeState,
    device_type: u16,
    req: &CcwRequest,
    buffer: &mut Vec<u8>,
    sense: &mut Vec<u8>,
    device_id: &mut Vec<u8>,
) -> CcwResult {
    let family = family_for_device_type(device_type).unwrap_or_else(|| {
        warn!("ccw: unrecognized device type {device_type:#06x}, treating as 3480");
        DeviceFamily::T3480
    });
    let info = device_family_info(family);

    // Step 4: SENSE and SENSE ID read out of the buffers a previous CCW's
    // sense builder populated, independent of the validity matrix below.
    if req.opcode == opcode::SENSE {
        return complete_sense(sense, buffer, req.count);
    }
    if req.opcode == opcode::SENSE_ID {
        return complete_sense_id(device_id, &info, buffer, req.count);
    }

    let table = build_command_table(family);
    let validity = table.lookup(req.opcode);

    // Step 1: invalid opcode -> command-reject.
    if validity == Validity::Invalid {
        return command_reject(tape, family, req.count, sense);
    }

    // Step 2: no-op / virtual no-op -> immediate CE|DE, zero residual.
    if matches!(validity, Validity::NoOp | Validity::VirtualNoOp) {
        return CcwResult {
            unit_status: UnitStatus::ce_de(),
            residual: 0,
            more: false,
        };
    }

    // Step 3: dispatch to the media handler / display engine.
    let mut result = match req.opcode {
        opcode::READ_FORWARD | opcode::READ_BACKWARD => do_read(tape, family, buffer, req.count, sense),
        opcode::WRITE => do_write(tape, family, buffer, req.count, sense),
        opcode::REWIND => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::RewindFailed, |h| h.rewind()),
        opcode::REWIND_UNLOAD => do_rewind_unload(tape, family, sense),
        opcode::FORWARD_SPACE_BLOCK => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::LocateErr, |h| h.fsb()),
        opcode::BACKWARD_SPACE_BLOCK => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::LocateErr, |h| h.bsb()),
        opcode::FORWARD_SPACE_FILE => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::LocateErr, |h| h.fsf()),
        opcode::BACKWARD_SPACE_FILE => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::LocateErr, |h| h.bsf()),
        opcode::WRITE_TAPEMARK => do_write_guarded(tape, family, sense, CcwClass::WriteMark, TapeErrorKind::WriteFail, |h| h.write_mark()),
        opcode::ERASE_GAP => do_write_guarded(tape, family, sense, CcwClass::EraseGap, TapeErrorKind::WriteFail, |h| h.erg()),
        opcode::DATA_SECURITY_ERASE => do_write_guarded(tape, family, sense, CcwClass::Other, TapeErrorKind::WriteFail, |h| h.dse()),
        opcode::SYNC => do_motion(tape, family, sense, CcwClass::Other, TapeErrorKind::ItfError, |h| h.sync()),
        opcode::LOAD_DISPLAY => do_load_display(tape, family, buffer, req.count, sense),
        opcode::MODE_SET | opcode::ASSIGN | opcode::UNASSIGN | opcode::CONTROL_ACCESS => {
            // Accepted, not separately modeled: these CCWs configure
            // channel-level access/mode concerns the spec keeps out of
            // scope (§1 "the surrounding channel subsystem").
            finish(tape, family, TapeErrorKind::RunSuccess, CcwClass::Other, 0, sense)
        }
        _ => {
            // Every opcode the validity matrix marks valid-and-not-no-op
            // has an explicit arm above; this only guards against the
            // matrix and this dispatch drifting apart.
            warn!("ccw: opcode {:#04x} classified valid but has no dispatch arm", req.opcode);
            finish(tape, family, TapeErrorKind::BadCommand, CcwClass::Other, req.count as u32, sense)
        }
    };

    // Residual unit status contributed by the validity matrix itself
    // (only rewind-unload's family-dependent UC/CUE, spec.md §4.2).
    let rs = residual_status(&info, req.opcode);
    if rs.unit_check {
        result.unit_status |= UnitStatus::UC;
    }
    if rs.control_unit_end {
        result.unit_status |= UnitStatus::CUE;
    }

    result
}

fn load_state(tape: &TapeState) -> TapeLoadState {
    TapeLoadState {
        loaded: tape.is_loaded(),
        at_load_point: tape.is_loaded() && tape.curfilen <= 1 && tape.nxtblkpos == 0,
        write_protected: tape.read_only,
    }
}

fn passed_eot(tape: &TapeState) -> bool {
    tape.media_handler.as_ref().map(|h| h.passed_eot()).unwrap_or(false)
}

/// Run the sense builder for one completed CCW, store the resulting sense
/// bytes as the device's pending sense (delivered on a later SENSE CCW,
/// step 4), and fold the load-state/passed-EOT fixups (spec.md §4.3 steps
/// 3-4, recomputed fresh on every call).
fn finish(
    tape: &TapeState,
    family: DeviceFamily,
    kind: TapeErrorKind,
    ccw_class: CcwClass,
    residual: u32,
    sense: &mut Vec<u8>,
) -> CcwResult {
    let SenseResult { unit_status, sense: bytes, .. } = build_sense(family, kind, ccw_class, load_state(tape), passed_eot(tape));
    *sense = bytes;
    CcwResult { unit_status, residual, more: false }
}

fn command_reject(tape: &TapeState, family: DeviceFamily, count: u16, sense: &mut Vec<u8>) -> CcwResult {
    finish(tape, family, TapeErrorKind::BadCommand, CcwClass::Other, count as u32, sense)
}

fn guest_blockid_width(family: DeviceFamily) -> BlockidWidth {
    match family {
        DeviceFamily::T3590 => BlockidWidth::Bits32,
        _ => BlockidWidth::Bits22,
    }
}

fn backing_blockid_width(tape: &TapeState) -> BlockidWidth {
    if tape.params.blkid32 {
        BlockidWidth::Bits32
    } else {
        BlockidWidth::Bits22
    }
}

fn update_blockid(tape: &mut TapeState, family: DeviceFamily, actual: u32) {
    tape.blockid = blockid::actual_to_emulated(actual, backing_blockid_width(tape), guest_blockid_width(family));
}

fn do_read(tape: &mut TapeState, family: DeviceFamily, buffer: &mut Vec<u8>, count: u16, sense: &mut Vec<u8>) -> CcwResult {
    let handler = match tape.media_handler.as_mut() {
        Some(h) => h,
        None => {
            buffer.clear();
            return finish(tape, family, TapeErrorKind::TapeUnloaded, CcwClass::Read, count as u32, sense);
        }
    };

    buffer.resize(count as usize, 0);
    // READ BACKWARD shares this primitive: the direction a physical block
    // is fetched in is a backing-level detail the Media Handler Interface
    // (spec.md §4.1) does not expose separately.
    match handler.read_block(buffer) {
        Ok(ReadResult::Data(n)) => {
            buffer.truncate(n);
            let actual_blockid = handler.current_blockid();
            update_blockid(tape, family, actual_blockid);
            let residual = (count as u32).saturating_sub(n as u32);
            // spec.md §3: "every READ-type CCW that passes EOT sets the
            // 'passed EOT' sense bit" -- EndOfTape is the sense kind that
            // carries it (era_code + CE|DE|UX, sense.rs).
            let kind = if passed_eot(tape) { TapeErrorKind::EndOfTape } else { TapeErrorKind::RunSuccess };
            finish(tape, family, kind, CcwClass::Read, residual, sense)
        }
        Ok(ReadResult::Tapemark) => {
            buffer.clear();
            tape.curfilen += 1;
            finish(tape, family, TapeErrorKind::ReadTm, CcwClass::Read, count as u32, sense)
        }
        Err(BlockReadError::EndOfStream) | Err(BlockReadError::EndOfFile) => {
            buffer.clear();
            finish(tape, family, TapeErrorKind::EmptyTape, CcwClass::Read, count as u32, sense)
        }
        Err(BlockReadError::Error(e)) => {
            warn!("tape read failed: {e}");
            buffer.clear();
            finish(tape, family, TapeErrorKind::ReadFail, CcwClass::Read, count as u32, sense)
        }
    }
}

fn do_write(tape: &mut TapeState, family: DeviceFamily, buffer: &[u8], count: u16, sense: &mut Vec<u8>) -> CcwResult {
    if tape.read_only {
        return finish(tape, family, TapeErrorKind::WriteProtect, CcwClass::Write, count as u32, sense);
    }
    let handler = match tape.media_handler.as_mut() {
        Some(h) => h,
        None => return finish(tape, family, TapeErrorKind::TapeUnloaded, CcwClass::Write, count as u32, sense),
    };

    let payload = &buffer[..(count as usize).min(buffer.len())];
    match handler.write_block(payload) {
        Ok(()) => {
            let actual_blockid = handler.current_blockid();
            update_blockid(tape, family, actual_blockid);
            // spec.md §4.3 step 4: a successful data-bearing write that
            // crossed EOT completes as StatusOnly, the only kind the sense
            // builder ORs UX into for write/erase-gap/write-mark CCWs.
            let kind = if passed_eot(tape) { TapeErrorKind::StatusOnly } else { TapeErrorKind::RunSuccess };
            finish(tape, family, kind, CcwClass::Write, 0, sense)
        }
        Err(e) => {
            warn!("tape write failed: {e:#}");
            finish(tape, family, TapeErrorKind::WriteFail, CcwClass::Write, count as u32, sense)
        }
    }
}

/// Generic non-data-transfer motion CCW (rewind, space block/file, sync):
/// zero residual either way, success/failure mapped onto one fallback
/// sense kind.
fn do_motion(
    tape: &mut TapeState,
    family: DeviceFamily,
    sense: &mut Vec<u8>,
    ccw_class: CcwClass,
    fail_kind: TapeErrorKind,
    op: impl FnOnce(&mut dyn MediaHandler) -> Result<(), anyhow::Error>,
) -> CcwResult {
    let kind = match tape.media_handler.as_mut() {
        Some(h) => match op(h.as_mut()) {
            Ok(()) => TapeErrorKind::RunSuccess,
            Err(e) => {
                warn!("tape motion command failed: {e:#}");
                fail_kind
            }
        },
        None => TapeErrorKind::TapeUnloaded,
    };
    finish(tape, family, kind, ccw_class, 0, sense)
}

/// Like [`do_motion`] but for commands that write to the medium
/// (write-tapemark, erase-gap, data-security-erase): honors write-protect
/// before touching the media handler, and, on success, folds in the same
/// passed-EOT -> `StatusOnly` rule [`do_write`] uses (spec.md §4.3 step 4 --
/// write-tapemark and erase-gap are both data-bearing writes per
/// [`CcwClass`]).
fn do_write_guarded(
    tape: &mut TapeState,
    family: DeviceFamily,
    sense: &mut Vec<u8>,
    ccw_class: CcwClass,
    fail_kind: TapeErrorKind,
    op: impl FnOnce(&mut dyn MediaHandler) -> Result<(), anyhow::Error>,
) -> CcwResult {
    if tape.read_only {
        return finish(tape, family, TapeErrorKind::WriteProtect, ccw_class, 0, sense);
    }
    let outcome = match tape.media_handler.as_mut() {
        Some(h) => op(h.as_mut()),
        None => return finish(tape, family, TapeErrorKind::TapeUnloaded, ccw_class, 0, sense),
    };
    let kind = match outcome {
        Ok(()) => {
            if passed_eot(tape) {
                TapeErrorKind::StatusOnly
            } else {
                TapeErrorKind::RunSuccess
            }
        }
        Err(e) => {
            warn!("tape write command failed: {e:#}");
            fail_kind
        }
    };
    finish(tape, family, kind, ccw_class, 0, sense)
}

/// REWIND UNLOAD: rewind, then eject (close the media handler). If the
/// display was mid `UMOUNTMOUNT`, advance it to its second phase across
/// the close, since `TapeState::close` otherwise resets display state
/// unconditionally (spec.md §4.5 "two-phase: show msg1 until unmount,
/// then msg2 until next mount").
fn do_rewind_unload(tape: &mut TapeState, family: DeviceFamily, sense: &mut Vec<u8>) -> CcwResult {
    if let Some(handler) = tape.media_handler.as_mut() {
        if let Err(e) = handler.rewind() {
            warn!("tape rewind-unload: rewind failed: {e:#}");
        }
    }

    let had_autoloader = tape.autoloader.is_some();
    let mut display = tape.display.clone();
    if let Err(e) = tape.close() {
        warn!("tape rewind-unload: close failed: {e:#}");
    }
    if let Some(rendered) = display.notify_unmounted() {
        info!("Now Displays: {rendered}");
    }
    tape.display = display;

    if !had_autoloader {
        emit_mount_request_banner(tape);
    }

    finish(tape, family, TapeErrorKind::RunSuccess, CcwClass::Other, 0, sense)
}

fn do_load_display(tape: &mut TapeState, family: DeviceFamily, buffer: &[u8], count: u16, sense: &mut Vec<u8>) -> CcwResult {
    if buffer.len() < 17 {
        return finish(tape, family, TapeErrorKind::BadCommand, CcwClass::Other, count as u32, sense);
    }
    let fcb = Fcb::decode(buffer[0]);
    let mut msg1 = [0u8; 8];
    let mut msg2 = [0u8; 8];
    msg1.copy_from_slice(&buffer[1..9]);
    msg2.copy_from_slice(&buffer[9..17]);

    let loaded = tape.is_loaded();
    if let Some(rendered) = tape.display.apply_fcb(fcb, msg1, msg2, loaded) {
        info!("Now Displays: {rendered}");
    }
    // Step 5's "invoke the display/mount-request update" for the CCW that
    // can newly raise REQAUTOMNT.
    if tape.autoloader.is_none() {
        emit_mount_request_banner(tape);
    }

    finish(tape, family, TapeErrorKind::RunSuccess, CcwClass::Other, (count as u32).saturating_sub(17), sense)
}

fn emit_mount_request_banner(tape: &TapeState) {
    if let Some(banner) = tape.display.mount_request_banner() {
        info!("**********************************************");
        info!("{banner}");
        info!("**********************************************");
    }
}

fn complete_sense(sense: &mut Vec<u8>, buffer: &mut Vec<u8>, count: u16) -> CcwResult {
    let take = (count as usize).min(sense.len());
    buffer.clear();
    buffer.extend_from_slice(&sense[..take]);
    let residual = (count as u32).saturating_sub(take as u32);
    sense.iter_mut().for_each(|b| *b = 0);
    CcwResult {
        unit_status: UnitStatus::ce_de(),
        residual,
        more: false,
    }
}

fn complete_sense_id(device_id: &[u8], info: &DeviceFamilyInfo, buffer: &mut Vec<u8>, count: u16) -> CcwResult {
    let _ = info.legacy_sense_id_eligible; // see build_device_id's doc comment
    let take = (count as usize).min(device_id.len());
    buffer.clear();
    buffer.extend_from_slice(&device_id[..take]);
    let residual = (count as u32).saturating_sub(take as u32);
    CcwResult {
        unit_status: UnitStatus::ce_de(),
        residual,
        more: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::aws::{AwsHandler, AwsParams};

    fn mounted_device() -> DeviceContext {
        let mut tape = TapeState::new();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        std::mem::forget(tmp); // keep the backing file alive for the test
        let mut handler = Box::new(AwsHandler::new(AwsParams { max_size: None, strict_size: false }));
        handler.open(&path, false).unwrap();
        tape.media_handler = Some(handler);
        tape.media_kind = Some(crate::media::MediaKind::Aws);
        tape.filename = path;
        let mut ctx = DeviceContext::new_tape(0x3420, 0, tape);
        ctx.device_id = build_device_id(0x3420);
        ctx
    }

    fn req(op: u8, count: u16) -> CcwRequest {
        CcwRequest { opcode: op, chained: false, count, prev_opcode: 0, ccw_seq: 0 }
    }

    #[test]
    fn invalid_opcode_is_command_rejected() {
        let mut ctx = mounted_device();
        let result = execute(&mut ctx, &req(0x00, 0));
        assert!(result.unit_status.contains(UnitStatus::UC));
        assert_eq!(ctx.sense[0] & 0x80, 0x80);
    }

    #[test]
    fn noop_on_unloaded_drive_is_immediate_ce_de() {
        let mut ctx = DeviceContext::new_tape(0x3420, 0, TapeState::new());
        let result = execute(&mut ctx, &req(opcode::NOP, 0));
        assert_eq!(result.residual, 0);
        assert!(result.unit_status.contains(UnitStatus::CE));
        assert!(result.unit_status.contains(UnitStatus::DE));
        assert!(!result.unit_status.contains(UnitStatus::UC));
    }

    #[test]
    fn write_then_read_round_trips_a_block() {
        let mut ctx = mounted_device();
        ctx.buffer = b"hello world".to_vec();
        let result = execute(&mut ctx, &req(opcode::WRITE, 11));
        assert_eq!(result.residual, 0);
        assert!(!result.unit_status.contains(UnitStatus::UC));

        ctx.tape_mut().unwrap().media_handler.as_mut().unwrap().rewind().unwrap();
        ctx.buffer = vec![0; 64];
        let result = execute(&mut ctx, &req(opcode::READ_FORWARD, 64));
        assert_eq!(ctx.buffer, b"hello world");
        assert_eq!(result.residual, 64 - 11);
    }

    #[test]
    fn write_on_read_only_drive_is_write_protected() {
        let mut ctx = mounted_device();
        ctx.tape_mut().unwrap().read_only = true;
        ctx.buffer = b"nope".to_vec();
        let result = execute(&mut ctx, &req(opcode::WRITE, 4));
        assert!(result.unit_status.contains(UnitStatus::UC));
    }

    #[test]
    fn sense_drains_and_clears_pending_sense() {
        let mut ctx = mounted_device();
        execute(&mut ctx, &req(0x00, 0)); // command-reject populates sense
        assert_ne!(ctx.sense.iter().sum::<u8>(), 0);

        ctx.buffer = vec![0; 24];
        let result = execute(&mut ctx, &req(opcode::SENSE, 24));
        assert_eq!(result.residual, 0);
        assert_eq!(ctx.buffer[0] & 0x80, 0x80); // command-reject bit copied out
        assert_eq!(ctx.sense.iter().sum::<u8>(), 0); // cleared after the copy
    }

    #[test]
    fn sense_id_copies_device_id_block() {
        let mut ctx = mounted_device();
        ctx.buffer = vec![0; 7];
        let result = execute(&mut ctx, &req(opcode::SENSE_ID, 7));
        assert_eq!(result.residual, 0);
        assert_eq!(ctx.buffer[0], 0xFF);
    }

    #[test]
    fn rewind_unload_advances_umountmount_display() {
        let mut ctx = mounted_device();
        let fcb = Fcb::decode(0xE0); // UmountMount
        let mut msg1 = [b' '; 8];
        msg1[..7].copy_from_slice(b"KEEP001");
        let mut msg2 = [b' '; 8];
        msg2[..6].copy_from_slice(b"SCRTCH");
        ctx.tape_mut().unwrap().display.apply_fcb(fcb, msg1, msg2, true);

        let result = execute(&mut ctx, &req(opcode::REWIND_UNLOAD, 0));
        assert!(!result.unit_status.contains(UnitStatus::UC));
        assert_eq!(ctx.tape().unwrap().display.kind, crate::tape::display::DisplayKind::Mount);
    }

    #[test]
    fn him_subchannel_rejects_tape_opcodes() {
        let mut ctx = DeviceContext::new_him(0x3088, 0, crate::him::HimState::new(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false))));
        let result = execute(&mut ctx, &req(opcode::WRITE, 4));
        assert!(result.unit_status.contains(UnitStatus::UC));
    }

    /// Minimal media handler that always reports `passed_eot() == true`,
    /// for exercising the EOT wiring in `do_read`/`do_write`/
    /// `do_write_guarded` without depending on any backing's own
    /// eotmargin bookkeeping.
    struct AlwaysAtEot;

    impl MediaHandler for AlwaysAtEot {
        fn open(&mut self, _filename: &str, _read_only: bool) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn read_block(&mut self, buf: &mut [u8]) -> Result<ReadResult, BlockReadError> {
            let n = buf.len().min(4);
            buf[..n].fill(0xAB);
            Ok(ReadResult::Data(n))
        }
        fn write_block(&mut self, _buf: &[u8]) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn rewind(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn fsb(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn bsb(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn fsf(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn bsf(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn write_mark(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn sync(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn dse(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn erg(&mut self) -> Result<(), anyhow::Error> {
            Ok(())
        }
        fn is_loaded(&self) -> bool {
            true
        }
        fn passed_eot(&self) -> bool {
            true
        }
        fn current_blockid(&self) -> u32 {
            0
        }
    }

    fn at_eot_device() -> DeviceContext {
        let mut tape = TapeState::new();
        tape.media_handler = Some(Box::new(AlwaysAtEot));
        tape.media_kind = Some(crate::media::MediaKind::Aws);
        tape.filename = "/dev/null".to_string();
        let mut ctx = DeviceContext::new_tape(0x3480, 0, tape);
        ctx.device_id = build_device_id(0x3480);
        ctx
    }

    #[test]
    fn read_past_eot_sets_unit_exception() {
        let mut ctx = at_eot_device();
        ctx.buffer = vec![0; 16];
        let result = execute(&mut ctx, &req(opcode::READ_FORWARD, 16));
        assert!(!result.unit_status.contains(UnitStatus::UC));
        assert!(result.unit_status.contains(UnitStatus::UX));
    }

    #[test]
    fn write_past_eot_sets_unit_exception() {
        let mut ctx = at_eot_device();
        ctx.buffer = b"data".to_vec();
        let result = execute(&mut ctx, &req(opcode::WRITE, 4));
        assert!(!result.unit_status.contains(UnitStatus::UC));
        assert!(result.unit_status.contains(UnitStatus::UX));
    }

    #[test]
    fn write_tapemark_past_eot_sets_unit_exception() {
        let mut ctx = at_eot_device();
        let result = execute(&mut ctx, &req(opcode::WRITE_TAPEMARK, 0));
        assert!(!result.unit_status.contains(UnitStatus::UC));
        assert!(result.unit_status.contains(UnitStatus::UX));
    }
}
