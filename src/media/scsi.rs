//! SCSI media handler: wraps a real generic tape driver (spec.md §4.1,
//! §6 `/dev/...`/`\\.\Tape<N>` filename patterns).
//!
//! Targets the Linux `st` driver's `MTIOCTOP`/`MTIOCGET` ioctl interface
//! rather than raw SCSI command passthrough: the spec's own Non-goals rule
//! out "SCSI passthrough on platforms without a generic tape driver" and
//! "full 3590 feature parity", so the `st` ioctl surface -- space, rewind,
//! write-filemark, erase, status -- covers everything the CCW engine
//! needs without re-deriving the teacher's much larger raw-SCSI-command
//! machinery (`pbs-tape/src/sgutils2.rs`, `pbs-tape/src/sg_tape.rs`),
//! which exists there to reach LTO-specific features (MAM, encryption,
//! compression mode pages) this crate has no counterpart for.
//!
//! Grounded on the teacher workspace's `nix`-based blocking-ioctl style
//! (`pbs-tape/src/sg_tape.rs` uses `nix::fcntl` directly against an
//! already-open `File`; this module applies the same pattern to `mtio.h`
//! ioctls instead of `sg_io` passthrough).
//!
//! Resolves spec.md §9's "SCSI `passed_eot` overload" open question: this
//! handler implements `refresh_status` as a real `MTNOP` status refresh,
//! distinct from `passed_eot`, which reports the last-observed state.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Error};

use super::{MediaHandler, ReadResult};
use crate::error::BlockReadError;

#[allow(dead_code)]
mod mtio {
    pub const MTRESET: i16 = 0;
    pub const MTFSF: i16 = 1;
    pub const MTBSF: i16 = 2;
    pub const MTFSR: i16 = 3;
    pub const MTBSR: i16 = 4;
    pub const MTWEOF: i16 = 5;
    pub const MTREW: i16 = 6;
    pub const MTOFFL: i16 = 7;
    pub const MTNOP: i16 = 8;
    pub const MTERASE: i16 = 9;

    #[repr(C)]
    pub struct MtOp {
        pub mt_op: i16,
        pub mt_count: i32,
    }

    #[repr(C)]
    #[derive(Default)]
    pub struct MtGet {
        pub mt_type: i64,
        pub mt_resid: i64,
        pub mt_dsreg: i64,
        pub mt_gstat: i64,
        pub mt_erreg: i64,
        pub mt_fileno: i32,
        pub mt_blkno: i32,
    }

    /// end of data detected
    pub const GMT_EOD: i64 = 0x0800_0000;
    /// beginning of tape
    pub const GMT_BOT: i64 = 0x2000_0000;
    /// hardware write-protect
    pub const GMT_WR_PROT: i64 = 0x0400_0000;
    /// filemark just read/written
    pub const GMT_EOF: i64 = 0x8000_0000;
    /// drive online and tape loaded
    pub const GMT_ONLINE: i64 = 0x0001_0000;
}

nix::ioctl_write_ptr!(mtioctop, b'm', 1, mtio::MtOp);
nix::ioctl_read!(mtioctget, b'm', 2, mtio::MtGet);

fn do_op(file: &File, op: i16, count: i32) -> Result<(), Error> {
    let arg = mtio::MtOp { mt_op: op, mt_count: count };
    unsafe { mtioctop(file.as_raw_fd(), &arg) }.context("MTIOCTOP ioctl failed")?;
    Ok(())
}

fn do_get(file: &File) -> Result<mtio::MtGet, Error> {
    let mut get = mtio::MtGet::default();
    unsafe { mtioctget(file.as_raw_fd(), &mut get) }.context("MTIOCGET ioctl failed")?;
    Ok(get)
}

pub struct ScsiParams {
    /// `--blkid-32`: use full 32-bit block-ids instead of the 22-bit form.
    pub blkid_32: bool,
    /// `--no-erg`: suppress erase-gap CCWs entirely.
    pub no_erg: bool,
}

impl Default for ScsiParams {
    fn default() -> Self {
        ScsiParams {
            blkid_32: false,
            no_erg: false,
        }
    }
}

pub struct ScsiHandler {
    file: Option<File>,
    params: ScsiParams,
    read_only: bool,
    last_gstat: i64,
}

impl ScsiHandler {
    pub fn new(params: ScsiParams) -> Self {
        ScsiHandler {
            file: None,
            params,
            read_only: false,
            last_gstat: 0,
        }
    }

    fn file_ref(&self) -> Result<&File, Error> {
        self.file.as_ref().context("SCSI media handler: no device open")
    }

    pub fn blkid_32(&self) -> bool {
        self.params.blkid_32
    }
}

impl MediaHandler for ScsiHandler {
    fn open(&mut self, filename: &str, read_only: bool) -> Result<(), Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(filename)
            .with_context(|| format!("opening SCSI tape device {filename:?}"))?;
        self.last_gstat = do_get(&file).map(|g| g.mt_gstat).unwrap_or(0);
        self.file = Some(file);
        self.read_only = read_only;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.file = None;
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<ReadResult, BlockReadError> {
        let file = self.file.as_mut().ok_or(BlockReadError::EndOfStream)?;
        match file.read(buf) {
            Ok(0) => Ok(ReadResult::Tapemark),
            Ok(n) => Ok(ReadResult::Data(n)),
            Err(e) => Err(BlockReadError::Error(e)),
        }
    }

    fn write_block(&mut self, buf: &[u8]) -> Result<(), Error> {
        if self.read_only {
            return super::write_protected();
        }
        let file = self.file.as_mut().context("SCSI media handler: no device open")?;
        file.write_all(buf)?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), Error> {
        do_op(self.file_ref()?, mtio::MTREW, 1)
    }

    fn fsb(&mut self) -> Result<(), Error> {
        do_op(self.file_ref()?, mtio::MTFSR, 1)
    }

    fn bsb(&mut self) -> Result<(), Error> {
        do_op(self.file_ref()?, mtio::MTBSR, 1)
    }

    fn fsf(&mut self) -> Result<(), Error> {
        do_op(self.file_ref()?, mtio::MTFSF, 1)
    }

    fn bsf(&mut self) -> Result<(), Error> {
        do_op(self.file_ref()?, mtio::MTBSF, 1)
    }

    fn write_mark(&mut self) -> Result<(), Error> {
        if self.read_only {
            return super::write_protected();
        }
        do_op(self.file_ref()?, mtio::MTWEOF, 1)
    }

    fn sync(&mut self) -> Result<(), Error> {
        if let Some(file) = &self.file {
            file.sync_all().context("SCSI tape sync failed")?;
        }
        Ok(())
    }

    fn dse(&mut self) -> Result<(), Error> {
        if self.read_only {
            return super::write_protected();
        }
        // long erase: erase from current position to end of medium.
        do_op(self.file_ref()?, mtio::MTERASE, 1)
    }

    fn erg(&mut self) -> Result<(), Error> {
        if self.params.no_erg {
            return Ok(());
        }
        if self.read_only {
            return super::write_protected();
        }
        // short erase: a single erase gap.
        do_op(self.file_ref()?, mtio::MTERASE, 0)
    }

    fn is_loaded(&self) -> bool {
        self.file.is_some() && (self.last_gstat & mtio::GMT_ONLINE) != 0
    }

    fn passed_eot(&self) -> bool {
        self.last_gstat & mtio::GMT_EOD != 0
    }

    fn refresh_status(&mut self) -> Result<(), Error> {
        let file = match &self.file {
            Some(f) => f,
            None => bail!("SCSI media handler: no device open"),
        };
        do_op(file, mtio::MTNOP, 0)?;
        self.last_gstat = do_get(file)?.mt_gstat;
        Ok(())
    }

    fn current_blockid(&self) -> u32 {
        match &self.file {
            Some(file) => do_get(file).map(|g| g.mt_blkno as u32).unwrap_or(0),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No real `st` device is available in this environment, so these
    // tests stick to the handler's pure bookkeeping (blkid/no-erg flags,
    // unopened-device defaults) rather than ioctl behavior -- the same
    // scope the teacher gives hardware paths it cannot exercise in CI
    // (`pbs-tape/src/sg_tape.rs`'s cartridge-memory tests skip when no
    // drive is present).

    #[test]
    fn default_params_favor_22_bit_blockids_and_erase_gaps() {
        let params = ScsiParams::default();
        assert!(!params.blkid_32);
        assert!(!params.no_erg);
    }

    #[test]
    fn unopened_handler_reports_unloaded_and_at_bot() {
        let handler = ScsiHandler::new(ScsiParams::default());
        assert!(!handler.is_loaded());
        assert!(!handler.passed_eot());
        assert_eq!(handler.current_blockid(), 0);
    }

    #[test]
    fn blkid_32_accessor_reflects_params() {
        let handler = ScsiHandler::new(ScsiParams { blkid_32: true, no_erg: false });
        assert!(handler.blkid_32());
    }

    #[test]
    fn erg_is_a_noop_when_no_erg_is_set_even_without_a_device() {
        let mut handler = ScsiHandler::new(ScsiParams { blkid_32: false, no_erg: true });
        assert!(handler.erg().is_ok());
    }

    #[test]
    fn operations_against_an_unopened_device_fail() {
        let mut handler = ScsiHandler::new(ScsiParams::default());
        assert!(handler.rewind().is_err());
        assert!(handler.refresh_status().is_err());
    }
}
