//! Display & Mount-Request Engine: the Load-Display CCW (opcode `0x9F`)
//! state machine and the operator mount/unmount/autoload banner it drives
//! (spec.md §4.5).
//!
//! Grounded on the original `tapedev.c`'s display routines
//! (`examples/original_source/tapedev.c`) for the Format Control Byte bit
//! semantics named in spec.md §4.5/§6, reimplemented here in the struct +
//! impl style the rest of this crate uses rather than translated line for
//! line from the C.

/// Display states the drive's message window can be in (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    Idle,
    WaitAct,
    Mount,
    Unmount,
    UmountMount,
    Erasing,
    Rewinding,
    Unloading,
    Clean,
}

bitflags::bitflags! {
    /// Flags carried alongside the display state (spec.md §3).
    #[derive(Default)]
    pub struct DisplayFlags: u8 {
        const ALTERNATE  = 0b0000_0001;
        const BLINKING   = 0b0000_0010;
        const MESSAGE2   = 0b0000_0100;
        const AUTOLOADER = 0b0000_1000;
        const REQAUTOMNT = 0b0001_0000;
    }
}

/// Format Control Byte mode (spec.md §4.5, the FCB's three high bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcbMode {
    ReadyGo,
    Unmount,
    Mount,
    Nop,
    ResetDisplay,
    UmountMount,
    Reserved,
}

impl FcbMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0b000 => FcbMode::ReadyGo,
            0b001 => FcbMode::Unmount,
            0b010 => FcbMode::Mount,
            0b011 => FcbMode::Nop,
            0b100 => FcbMode::ResetDisplay,
            0b111 => FcbMode::UmountMount,
            _ => FcbMode::Reserved,
        }
    }
}

/// Decoded Format Control Byte.
#[derive(Debug, Clone, Copy)]
pub struct Fcb {
    pub mode: FcbMode,
    pub alternate: bool,
    pub blinking: bool,
    pub message2: bool,
    pub autoloader: bool,
}

const FCB_AM: u8 = 0b0001_0000;
const FCB_BM: u8 = 0b0000_1000;
const FCB_M2: u8 = 0b0000_0100;
const FCB_AL: u8 = 0b0000_0010;

impl Fcb {
    pub fn decode(byte: u8) -> Self {
        let mode = FcbMode::from_bits(byte >> 5);
        let mut alternate = byte & FCB_AM != 0;
        let mut blinking = byte & FCB_BM != 0;
        let mut message2 = byte & FCB_M2 != 0;
        let autoloader = byte & FCB_AL != 0;

        // "If AM is set, BM and M2 are ignored."
        if alternate {
            blinking = false;
            message2 = false;
        }
        // "If AL is active, AM/BM/M2 are ignored in Mount/UmountMount and
        // only the relevant 8 characters display."
        if autoloader && matches!(mode, FcbMode::Mount | FcbMode::UmountMount) {
            alternate = false;
            blinking = false;
            message2 = false;
        }

        Fcb {
            mode,
            alternate,
            blinking,
            message2,
            autoloader,
        }
    }
}

/// Classification of a parsed operator mount-request message (spec.md
/// §4.5: "classify scratch vs. labeled, ASCII vs. EBCDIC").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRequestClass {
    /// First byte `'S'`: any scratch volume of the given label type will do
    /// (`tapedev.c`'s `scratch = ('S' == tapemsg[0])`, which is also why a
    /// literal "SCRTCH" message falls out of this case).
    Scratch { label: LabelKind },
    /// A specific labeled volume was named, with its 6-character volser
    /// (`tapemsg[1..7]`) and label type (`tapemsg[7]`).
    Labeled {
        action: LabeledAction,
        volser: String,
        label: LabelKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabeledAction {
    Mount,
    RewindUnload,
    UnmountKeep,
}

/// Last-byte classification of the requested volume (spec.md §4.5: "to
/// classify scratch vs. labeled, ASCII vs. EBCDIC").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    /// `tapemsg[7] == 'S'`: standard-labeled (SL), EBCDIC-labeled volume.
    StandardLabeled,
    /// `tapemsg[7] == 'A'`: standard-labeled, ASCII-labeled volume.
    Ascii,
    /// Anything else: unlabeled (UL) volume.
    Unlabeled,
}

impl LabelKind {
    fn from_suffix(byte: u8) -> Self {
        match byte.to_ascii_uppercase() {
            b'S' => LabelKind::StandardLabeled,
            b'A' => LabelKind::Ascii,
            _ => LabelKind::Unlabeled,
        }
    }

    fn short_code(self) -> &'static str {
        match self {
            LabelKind::StandardLabeled | LabelKind::Ascii => "SL",
            LabelKind::Unlabeled => "UL",
        }
    }

    fn ascii_marker(self) -> &'static str {
        match self {
            LabelKind::Ascii => "ASCII ",
            LabelKind::StandardLabeled | LabelKind::Unlabeled => "",
        }
    }
}

/// Parse an 8-character display message into an operator mount-request
/// classification (spec.md §4.5: `'M'`/`'R'`/`'K'`/`'S'` first-byte
/// conventions, `'S'`/`'A'`/other last-byte conventions), following
/// `tapedev.c`'s `ReqAutoMount` field layout: byte 0 is the action/scratch
/// prefix, bytes 1-6 are the volser, byte 7 is the label-type suffix.
pub fn classify_message(msg: &[u8; 8]) -> MountRequestClass {
    let prefix = msg[0].to_ascii_uppercase();
    let label = LabelKind::from_suffix(msg[7]);
    if prefix == b'S' {
        return MountRequestClass::Scratch { label };
    }
    let volser = String::from_utf8_lossy(&msg[1..7]).trim_end().to_string();
    let action = match prefix {
        b'M' => LabeledAction::Mount,
        b'R' => LabeledAction::RewindUnload,
        b'K' => LabeledAction::UnmountKeep,
        _ => LabeledAction::Mount,
    };
    MountRequestClass::Labeled { action, volser, label }
}

/// Render the bare one-line description of a mount-request classification,
/// with the `SL`/`UL`/`ASCII ` wording `tapedev.c`'s `ReqAutoMount` uses.
pub fn render_banner(class: &MountRequestClass) -> String {
    match class {
        MountRequestClass::Scratch { label } => {
            format!("Mount of {}{} scratch tape requested", label.ascii_marker(), label.short_code())
        }
        MountRequestClass::Labeled { action, volser, label } => {
            let marker = label.ascii_marker();
            let code = label.short_code();
            match action {
                LabeledAction::Mount => format!("Mount for {marker}{code} tape volume '{volser}' requested"),
                LabeledAction::RewindUnload => {
                    format!("Rewind and unload of {marker}{code} tape volume '{volser}' requested")
                }
                LabeledAction::UnmountKeep => {
                    format!("Unmount and keep of {marker}{code} tape volume '{volser}' requested")
                }
            }
        }
    }
}

/// Eye-catcher border line used around an operator mount-request banner
/// when the autoloader is not handling the request itself (spec.md §7).
const EYECATCHER: &str = "***********************************************************";

/// Bordered operator banner: requires a human to act (spec.md §7,
/// `tapedev.c`'s non-autoloader `logmsg` branch).
pub fn render_operator_banner(class: &MountRequestClass) -> String {
    format!("\n{EYECATCHER}\nAUTOMOUNT: {}\n{EYECATCHER}\n", render_banner(class))
}

/// Plain one-line "FYI" message used while the autoloader is actively
/// servicing the request itself (spec.md §4.6, `tapedev.c`'s autoload
/// `logmsg` branch -- no eye-catcher, nothing for an operator to do).
pub fn render_automount_info(class: &MountRequestClass) -> String {
    format!("AutoMount: {}", render_banner(class))
}

/// Display & Mount-Request Engine state (part of spec.md §3 "Tape State").
#[derive(Debug, Clone)]
pub struct DisplayState {
    pub kind: DisplayKind,
    pub flags: DisplayFlags,
    pub msg1: [u8; 8],
    pub msg2: [u8; 8],
    /// Cached rendered display string; a notification fires only when
    /// this changes (spec.md §4.5).
    rendered: Option<String>,
}

impl Default for DisplayState {
    fn default() -> Self {
        DisplayState {
            kind: DisplayKind::Idle,
            flags: DisplayFlags::default(),
            msg1: [b' '; 8],
            msg2: [b' '; 8],
            rendered: None,
        }
    }
}

impl DisplayState {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_message(&self, use_message2: bool) -> &[u8; 8] {
        if use_message2 {
            &self.msg2
        } else {
            &self.msg1
        }
    }

    fn render(&self) -> String {
        let msg = self.active_message(self.flags.contains(DisplayFlags::MESSAGE2));
        String::from_utf8_lossy(msg).trim_end().to_string()
    }

    /// Apply a decoded Load-Display CCW payload (spec.md §4.5). `loaded` is
    /// whether a tape is currently mounted, gating `Unmount`/`Mount`/
    /// `UmountMount` per `tapedev.c`'s `load_display()`: `Unmount` only
    /// takes effect with a cartridge present, `Mount` only with none, and
    /// `UmountMount` falls straight through to the plain `Mount`+message-2
    /// phase when nothing is loaded instead of showing the unmount phase
    /// first. Returns `Some(banner)` if the change requires an operator
    /// notification, i.e. `REQAUTOMNT` was newly set.
    pub fn apply_fcb(&mut self, fcb: Fcb, msg1: [u8; 8], msg2: [u8; 8], loaded: bool) -> Option<String> {
        let requires_action;
        match fcb.mode {
            FcbMode::ReadyGo => {
                self.msg1 = msg1;
                self.msg2 = msg2;
                self.kind = DisplayKind::WaitAct;
                requires_action = false;
            }
            FcbMode::Unmount => {
                // "If the drive does not contain a cartridge when the Load
                // Display command is received, the display will contain
                // the message that existed prior to receipt of the
                // command" -- a no-op with nothing mounted.
                if !loaded {
                    return None;
                }
                self.msg1 = msg1;
                self.kind = DisplayKind::Unmount;
                requires_action = true;
            }
            FcbMode::Mount => {
                // "If the drive is loaded when the Load Display command is
                // received, the display will contain the message that
                // existed prior to the receipt of the command" -- a no-op
                // while a tape is mounted.
                if loaded {
                    return None;
                }
                self.msg1 = msg1;
                self.kind = DisplayKind::Mount;
                requires_action = true;
            }
            FcbMode::Nop => {
                // "physically access drive without changing display."
                return None;
            }
            FcbMode::ResetDisplay => {
                self.kind = DisplayKind::Idle;
                self.flags.remove(DisplayFlags::REQAUTOMNT);
                requires_action = false;
            }
            FcbMode::UmountMount => {
                self.msg1 = msg1;
                self.msg2 = msg2;
                if loaded {
                    self.kind = DisplayKind::UmountMount;
                    self.flags.remove(DisplayFlags::MESSAGE2);
                } else {
                    // No cartridge present: skip straight to the plain
                    // Mount phase showing msg2 until the next load.
                    self.kind = DisplayKind::Mount;
                    self.flags.insert(DisplayFlags::MESSAGE2);
                }
                requires_action = true;
            }
            FcbMode::Reserved => {
                requires_action = false;
            }
        }

        self.flags.set(DisplayFlags::ALTERNATE, fcb.alternate);
        self.flags.set(DisplayFlags::BLINKING, fcb.blinking);
        self.flags.set(DisplayFlags::AUTOLOADER, fcb.autoloader);
        if !matches!(fcb.mode, FcbMode::UmountMount) {
            self.flags.set(DisplayFlags::MESSAGE2, fcb.message2);
        }

        if requires_action {
            self.flags.insert(DisplayFlags::REQAUTOMNT);
        }

        self.maybe_notify()
    }

    /// Called by the autoloader/CCW engine once a physical unmount has
    /// happened while in `UmountMount`'s first phase, advancing to the
    /// second phase (show `msg2` until next mount, spec.md §4.5).
    pub fn notify_unmounted(&mut self) -> Option<String> {
        if self.kind == DisplayKind::UmountMount {
            self.kind = DisplayKind::Mount;
            self.flags.insert(DisplayFlags::MESSAGE2);
            self.flags.insert(DisplayFlags::REQAUTOMNT);
        }
        self.maybe_notify()
    }

    /// Called after any tape motion clears a `WaitAct`/transient display
    /// back to idle.
    pub fn notify_motion(&mut self) {
        if self.kind == DisplayKind::WaitAct {
            self.kind = DisplayKind::Idle;
        }
    }

    fn maybe_notify(&mut self) -> Option<String> {
        let new_render = self.render();
        if self.rendered.as_deref() != Some(new_render.as_str()) {
            self.rendered = Some(new_render.clone());
            Some(new_render)
        } else {
            None
        }
    }

    /// Build the operator mount-request banner for the currently active
    /// message, honoring `REQAUTOMNT` (spec.md §4.5 last paragraph). Bordered
    /// by eye-catcher separators unless the autoloader is handling the
    /// request itself, in which case a plain informational line is emitted
    /// instead (spec.md §7, §4.6).
    pub fn mount_request_banner(&self) -> Option<String> {
        if !self.flags.contains(DisplayFlags::REQAUTOMNT) {
            return None;
        }
        let msg = self.active_message(self.flags.contains(DisplayFlags::MESSAGE2));
        let class = classify_message(msg);
        Some(if self.flags.contains(DisplayFlags::AUTOLOADER) {
            render_automount_info(&class)
        } else {
            render_operator_banner(&class)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &str) -> [u8; 8] {
        let mut out = [b' '; 8];
        let bytes = s.as_bytes();
        out[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        out
    }

    #[test]
    fn umountmount_then_unmount_shows_msg2_scratch_banner() {
        let mut d = DisplayState::new();
        // FCB 0xE0 = 0b111_00000 -> UmountMount, no AM/BM/M2/AL bits set.
        let fcb = Fcb::decode(0xE0);
        assert_eq!(fcb.mode, FcbMode::UmountMount);

        let changed = d.apply_fcb(fcb, msg("KEEP001"), msg("SCRTCH"), true);
        assert!(changed.is_some());
        assert_eq!(d.kind, DisplayKind::UmountMount);
        assert!(d.flags.contains(DisplayFlags::REQAUTOMNT));

        let banner = d.mount_request_banner().unwrap();
        assert!(banner.contains("Unmount and keep of UL tape volume 'EEP001'"), "{banner}");

        let changed = d.notify_unmounted();
        assert!(changed.is_some());
        assert_eq!(d.kind, DisplayKind::Mount);

        let banner = d.mount_request_banner().unwrap();
        assert!(banner.contains("scratch"), "{banner}");
    }

    #[test]
    fn unchanged_render_does_not_renotify() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b010_00000); // Mount
        let first = d.apply_fcb(fcb, msg("MVOL001"), msg(""), false);
        assert!(first.is_some());
        let second = d.apply_fcb(fcb, msg("MVOL001"), msg(""), false);
        assert!(second.is_none(), "identical render must not renotify");
    }

    #[test]
    fn am_set_suppresses_bm_and_m2() {
        let fcb = Fcb::decode(0b000_10100); // AM + BM + M2 all requested
        assert!(fcb.alternate);
        assert!(!fcb.blinking);
        assert!(!fcb.message2);
    }

    #[test]
    fn suffix_byte_classifies_label_type() {
        // "MVOL01A" -> prefix M, volser "VOL01", suffix 'A' -> ASCII-labeled.
        let class = classify_message(&msg("MVOL01A"));
        match class {
            MountRequestClass::Labeled { action, volser, label } => {
                assert_eq!(action, LabeledAction::Mount);
                assert_eq!(volser, "VOL01");
                assert_eq!(label, LabelKind::Ascii);
            }
            other => panic!("expected Labeled, got {other:?}"),
        }

        // "MVOL01S" -> standard-labeled.
        let class = classify_message(&msg("MVOL01S"));
        assert!(matches!(
            class,
            MountRequestClass::Labeled { label: LabelKind::StandardLabeled, .. }
        ));

        let banner = render_banner(&class);
        assert!(banner.contains("SL"), "{banner}");
    }

    #[test]
    fn scratch_prefix_byte_is_independent_of_rest_of_message() {
        // Any message with a leading 'S', not just the literal "SCRTCH".
        let class = classify_message(&msg("SXXXXXX"));
        assert!(matches!(class, MountRequestClass::Scratch { .. }));
    }

    #[test]
    fn autoloader_active_uses_plain_informational_line_not_bordered_banner() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b010_00010); // Mount, AL set
        assert!(fcb.autoloader);
        d.apply_fcb(fcb, msg("MVOL001"), msg(""), false);

        let banner = d.mount_request_banner().unwrap();
        assert!(banner.starts_with("AutoMount:"), "{banner}");
        assert!(!banner.contains('*'), "{banner}");
    }

    #[test]
    fn operator_banner_is_bordered_by_eyecatchers_when_autoloader_inactive() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b010_00000); // Mount, no AL
        d.apply_fcb(fcb, msg("MVOL001"), msg(""), false);

        let banner = d.mount_request_banner().unwrap();
        assert!(banner.starts_with("\n***"), "{banner}");
        assert!(banner.trim().starts_with('*') && banner.trim().ends_with('*'), "{banner}");
    }

    #[test]
    fn nop_never_touches_state() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b010_00000); // Mount, no AL
        d.apply_fcb(fcb, msg("MVOL001"), msg(""), false);
        let before = d.clone();

        let nop = Fcb::decode(0b011_00000); // Nop
        let changed = d.apply_fcb(nop, msg("IGNORED1"), msg("IGNORED2"), false);
        assert!(changed.is_none());
        assert_eq!(d.kind, before.kind);
        assert_eq!(d.msg1, before.msg1);
        assert_eq!(d.msg2, before.msg2);
        assert_eq!(d.flags, before.flags);
    }

    #[test]
    fn unmount_is_noop_when_nothing_loaded() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b001_00000); // Unmount
        let changed = d.apply_fcb(fcb, msg("BYE0001"), msg(""), false);
        assert!(changed.is_none());
        assert_eq!(d.kind, DisplayKind::Idle);
        assert!(!d.flags.contains(DisplayFlags::REQAUTOMNT));
    }

    #[test]
    fn mount_is_noop_when_already_loaded() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0b010_00000); // Mount
        let changed = d.apply_fcb(fcb, msg("MVOL001"), msg(""), true);
        assert!(changed.is_none());
        assert_eq!(d.kind, DisplayKind::Idle);
        assert!(!d.flags.contains(DisplayFlags::REQAUTOMNT));
    }

    #[test]
    fn umountmount_with_nothing_loaded_skips_straight_to_mount_phase() {
        let mut d = DisplayState::new();
        let fcb = Fcb::decode(0xE0); // UmountMount
        let changed = d.apply_fcb(fcb, msg("KEEP001"), msg("SCRTCH"), false);
        assert!(changed.is_some());
        assert_eq!(d.kind, DisplayKind::Mount);
        assert!(d.flags.contains(DisplayFlags::MESSAGE2));
        assert!(d.flags.contains(DisplayFlags::REQAUTOMNT));

        let banner = d.mount_request_banner().unwrap();
        assert!(banner.contains("scratch"), "{banner}");
    }
}
