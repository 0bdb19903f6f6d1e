//! Tape State: per-subchannel state for an emulated tape drive, its mount
//! procedure, and the autoloader/display sub-engines it owns (spec.md §3).
//!
//! Grounded on `pbs-tape/src/sg_tape.rs`'s struct-holds-open-handle style:
//! state lives in a plain struct the caller owns, never behind a global
//! singleton (Design Notes §9).

pub mod autoloader;
pub mod display;

use std::path::Path;

use anyhow::{bail, Context, Error};
use log::{info, warn};

use crate::media::aws::{AwsHandler, AwsParams};
use crate::media::het::{HetHandler, HetMethod, HetParams};
use crate::media::oma::OmaHandler;
use crate::media::scsi::{ScsiHandler, ScsiParams};
use crate::media::{detect_media_kind, MediaHandler, MediaKind};

use self::autoloader::{is_autoloader_reference, parse_description_file, Autoloader};
use self::display::DisplayState;

/// Sentinel filename meaning "no medium" (spec.md §3, §6 `TAPE_UNLOADED`).
pub const UNLOADED: &str = "UNLOADED";

/// Mount-time parameters carried on the argument vector (spec.md §6).
#[derive(Debug, Clone)]
pub struct MountParams {
    pub compression_on: bool,
    pub method: HetMethod,
    pub level: u32,
    pub chunksize: u32,
    pub max_size: Option<u64>,
    pub eot_margin: u64,
    pub strict_size: bool,
    pub deonirq: bool,
    pub readonly: bool,
    pub blkid32: bool,
    pub no_erg: bool,
}

/// `eotmargin=N` default: 128 KiB from hard EOT (spec.md §6).
pub const DEFAULT_EOT_MARGIN: u64 = 128 * 1024;

impl Default for MountParams {
    fn default() -> Self {
        MountParams {
            compression_on: true,
            method: HetMethod::Deflate,
            level: 6,
            chunksize: crate::media::het::DEFAULT_CHUNKSIZE,
            max_size: None,
            eot_margin: DEFAULT_EOT_MARGIN,
            strict_size: false,
            deonirq: false,
            readonly: false,
            blkid32: false,
            no_erg: false,
        }
    }
}

/// Per-subchannel tape device state (spec.md §3 "Tape State").
pub struct TapeState {
    pub media_kind: Option<MediaKind>,
    pub media_handler: Option<Box<dyn MediaHandler>>,
    pub filename: String,
    pub read_only: bool,

    pub curfilen: u32,
    pub nxtblkpos: u64,
    pub prvblkpos: u64,
    pub curblkrem: u32,
    pub curbufoff: u32,
    pub blockid: u32,

    pub display: DisplayState,
    pub params: MountParams,
    pub autoloader: Option<Autoloader>,
}

impl TapeState {
    pub fn new() -> Self {
        TapeState {
            media_kind: None,
            media_handler: None,
            filename: UNLOADED.to_string(),
            read_only: false,
            curfilen: 1,
            nxtblkpos: 0,
            prvblkpos: 0,
            curblkrem: 0,
            curbufoff: 0,
            blockid: 0,
            display: DisplayState::new(),
            params: MountParams::default(),
            autoloader: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.filename != UNLOADED
            && self
                .media_handler
                .as_ref()
                .map(|h| h.is_loaded())
                .unwrap_or(false)
    }

    /// The mount procedure (spec.md §6 "Mount argument vector"). Detects
    /// an autoloader description-file reference (`@...`) and, if so,
    /// bootstraps the slot list and mounts slot 0.
    pub fn mount(&mut self, argv: &[String]) -> Result<(), Error> {
        let arg0 = argv.first().context("mount: empty argument vector")?;
        if is_autoloader_reference(arg0) {
            let path = Path::new(&arg0[1..]);
            let mut loader = parse_description_file(path)
                .with_context(|| format!("autoloader description file {path:?}"))?;
            loader.current = 0;
            // Any mount arguments after the `@file` reference are global,
            // same as the description file's own `*`-prefixed lines
            // (`tapedev.c`'s `autoload_init`: `for(i=1;i<ac;i++)
            // autoload_global_parms(dev,av[i]);`, run before the file's own
            // lines are parsed -- so CLI-supplied globals come first).
            let mut global_args = argv[1..].to_vec();
            global_args.extend(loader.global_args.drain(..));
            loader.global_args = global_args;
            let first_argv = loader
                .current_argv()
                .context("autoloader description file names no slots")?;
            self.mount_plain(&first_argv)?;
            self.autoloader = Some(loader);
            info!("autoloader: mounted slot 0 ({})", first_argv[0]);
            Ok(())
        } else {
            self.autoloader = None;
            self.mount_plain(argv)
        }
    }

    /// Advance the autoloader to its next slot, the way the waiter
    /// (spec.md §4.6, §5) retries after an unload.
    pub fn autoloader_mount_next(&mut self) -> Result<(), Error> {
        let mut loader = self.autoloader.take().context("autoloader: not active")?;
        // `loader` was just removed from `self.autoloader`, so the closure's
        // borrow of `self` below never aliases it.
        let result = loader.mount_next(|argv| self.mount_plain(argv));
        if !loader.closed {
            self.autoloader = Some(loader);
        }
        result
    }

    fn mount_plain(&mut self, argv: &[String]) -> Result<(), Error> {
        let filename = argv.first().context("mount: missing filename")?.clone();
        if filename.eq_ignore_ascii_case(UNLOADED) || filename.eq_ignore_ascii_case("TAPE_UNLOADED") {
            return self.close();
        }

        let mut params = MountParams::default();
        let mut force_aws = false;

        for opt in &argv[1..] {
            if let Err(e) = apply_mount_option(opt, &mut params, &mut force_aws) {
                warn!("tape mount: {e} (option {opt:?} ignored)");
            }
        }

        let kind = if force_aws {
            MediaKind::Aws
        } else {
            detect_media_kind(&filename)
        };

        // spec.md §4.1: OMA is simply read-only, not read-only contingent
        // on the caller remembering `ro`/`readonly=1`/`noring`.
        if kind == MediaKind::Oma {
            params.readonly = true;
        }

        let mut handler: Box<dyn MediaHandler> = match kind {
            MediaKind::Aws => Box::new(AwsHandler::new(AwsParams {
                max_size: params.max_size,
                strict_size: params.strict_size,
            })),
            MediaKind::Het => Box::new(HetHandler::new(HetParams {
                method: if params.compression_on { params.method } else { HetMethod::None },
                level: params.level,
                chunksize: params.chunksize,
                max_size: params.max_size,
            })),
            MediaKind::Oma => Box::new(OmaHandler::new()),
            MediaKind::Scsi => Box::new(ScsiHandler::new(ScsiParams {
                blkid_32: params.blkid32,
                no_erg: params.no_erg,
            })),
        };

        handler
            .open(&filename, params.readonly)
            .with_context(|| format!("mounting tape image {filename:?}"))?;

        info!("tape mount: {filename:?} as {kind:?}, read_only={}", params.readonly);

        self.media_kind = Some(kind);
        self.media_handler = Some(handler);
        self.filename = filename;
        self.read_only = params.readonly;
        self.params = params;
        self.curfilen = 1;
        self.nxtblkpos = 0;
        self.prvblkpos = 0;
        self.curblkrem = 0;
        self.curbufoff = 0;
        self.blockid = 0;
        self.display = DisplayState::new();
        Ok(())
    }

    /// The close procedure (spec.md §3 lifecycle): releases the media
    /// handler, autoloader slots, and display message buffers.
    pub fn close(&mut self) -> Result<(), Error> {
        if let Some(handler) = self.media_handler.as_mut() {
            handler.close()?;
        }
        self.media_handler = None;
        self.media_kind = None;
        self.filename = UNLOADED.to_string();
        self.autoloader = None;
        self.display = DisplayState::new();
        Ok(())
    }
}

impl Default for TapeState {
    fn default() -> Self {
        Self::new()
    }
}

fn split_kv(opt: &str) -> (&str, Option<&str>) {
    match opt.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (opt, None),
    }
}

fn parse_bool(v: Option<&str>) -> bool {
    match v {
        Some(v) => !matches!(v, "0" | "no" | "off" | "false"),
        None => true,
    }
}

fn apply_mount_option(opt: &str, params: &mut MountParams, force_aws: &mut bool) -> Result<(), Error> {
    let (key, value) = split_kv(opt);
    match key {
        "awstape" => {
            *force_aws = true;
            params.compression_on = false;
            params.chunksize = 4096;
        }
        "idrc" | "compress" => params.compression_on = parse_bool(value),
        "method" => {
            let n: u32 = value.context("method= requires a value")?.parse()?;
            params.method = if n == 0 { HetMethod::None } else { HetMethod::Deflate };
        }
        "level" => params.level = value.context("level= requires a value")?.parse()?,
        "chunksize" => params.chunksize = value.context("chunksize= requires a value")?.parse()?,
        "maxsize" => params.max_size = Some(value.context("maxsize= requires a value")?.parse()?),
        "maxsizeK" => {
            let n: u64 = value.context("maxsizeK= requires a value")?.parse()?;
            params.max_size = Some(n * 1024);
        }
        "maxsizeM" => {
            let n: u64 = value.context("maxsizeM= requires a value")?.parse()?;
            params.max_size = Some(n * 1024 * 1024);
        }
        "eotmargin" => params.eot_margin = value.context("eotmargin= requires a value")?.parse()?,
        "strictsize" => params.strict_size = parse_bool(value),
        "deonirq" => params.deonirq = parse_bool(value),
        "readonly" => params.readonly = parse_bool(value),
        "ro" | "noring" => params.readonly = true,
        "rw" | "ring" => params.readonly = false,
        "--blkid-32" => params.blkid32 = true,
        "--no-erg" => params.no_erg = true,
        _ => bail!("unknown mount option"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unloaded_by_default() {
        let t = TapeState::new();
        assert!(!t.is_loaded());
        assert_eq!(t.filename, UNLOADED);
    }

    #[test]
    fn mount_unloaded_sentinel_closes() {
        let mut t = TapeState::new();
        t.mount(&["UNLOADED".to_string()]).unwrap();
        assert!(!t.is_loaded());
    }

    #[test]
    fn parses_readonly_aliases() {
        let mut params = MountParams::default();
        let mut force_aws = false;
        apply_mount_option("ro", &mut params, &mut force_aws).unwrap();
        assert!(params.readonly);
        apply_mount_option("rw", &mut params, &mut force_aws).unwrap();
        assert!(!params.readonly);
    }

    #[test]
    fn parses_maxsize_variants() {
        let mut params = MountParams::default();
        let mut force_aws = false;
        apply_mount_option("maxsizeM=2", &mut params, &mut force_aws).unwrap();
        assert_eq!(params.max_size, Some(2 * 1024 * 1024));
    }

    #[test]
    fn awstape_forces_no_compression() {
        let mut params = MountParams::default();
        let mut force_aws = false;
        apply_mount_option("awstape", &mut params, &mut force_aws).unwrap();
        assert!(force_aws);
        assert!(!params.compression_on);
    }

    #[test]
    fn autoloader_mount_folds_trailing_cli_args_ahead_of_file_globals() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "* rw").unwrap();
        // The sentinel filename mounts instantly with no backing file.
        writeln!(f, "UNLOADED").unwrap();
        f.flush().unwrap();

        let mut t = TapeState::new();
        let at_ref = format!("@{}", f.path().display());
        t.mount(&[at_ref, "eotmargin=4096".to_string()]).unwrap();

        let loader = t.autoloader.as_ref().unwrap();
        assert_eq!(loader.global_args, vec!["eotmargin=4096".to_string(), "rw".to_string()]);
    }

    #[test]
    fn oma_mount_is_read_only_without_an_explicit_flag() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let tdf_path = dir.path().join("vol001.tdf");
        let mut f = std::fs::File::create(&tdf_path).unwrap();
        writeln!(f, "constituent.aws AWS").unwrap();
        drop(f);
        std::fs::File::create(dir.path().join("constituent.aws")).unwrap();

        let mut t = TapeState::new();
        t.mount(&[tdf_path.to_str().unwrap().to_string()])
            .expect("a bare .tdf mount must not require an explicit ro/readonly/noring flag");
        assert!(t.is_loaded());
        assert!(t.read_only);
    }
}
