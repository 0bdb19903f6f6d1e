//! Channel-attached device emulation for a subset of IBM-style mainframe
//! peripherals: magnetic tape drives (3410/3420/3480/3490/3590/9347-class,
//! §3) and the Host Interface Machine (HIM), a subchannel-addressable IP
//! tunnel device (§1, §3).
//!
//! # Devices
//!
//! A device is reached through a [`device::DeviceContext`], which pairs the
//! common channel-visible fields (device type, subchannel number, data
//! buffer, residual count, unit status, sense bytes) with a
//! [`device::DeviceKind`] carrying either [`tape::TapeState`] or
//! [`him::HimState`]. [`ccw::execute`] is the single entry point a channel
//! model drives: it dispatches a [`ccw::CcwRequest`] against whichever kind
//! the context holds and returns a [`ccw::CcwResult`].
//!
//! # Tape
//!
//! Tape commands are classified against a per-family
//! [`validity::CommandTable`] before anything touches the backing media;
//! [`sense::build_sense`] then turns an outcome into unit status and sense
//! bytes. The backing media itself is abstracted behind
//! [`media::MediaHandler`], implemented for AWS and HET flat-file formats,
//! read-only OMA multi-file volumes, and Linux SCSI tape devices. Cartridge
//! display and mount-request rendering lives in [`tape::display`], the
//! autoloader slot sequencer in [`tape::autoloader`], and guest/backing
//! blockid translation in [`blockid`].
//!
//! # HIM
//!
//! [`him::HimState`] implements the HIM control block's state machine
//! (§4.8); [`him::poller`] runs the background thread that turns socket
//! readability into a channel attention (§4.9); [`him::header`] and
//! [`him::config`] cover the wire header layouts and the EBCDIC
//! configuration-string grammar respectively.
//!
//! # Errors
//!
//! Fallible paths use [`anyhow::Error`] at call boundaries and narrow
//! [`thiserror`]-derived enums (see [`error`]) where callers need to match
//! on a specific failure kind.

pub mod blockid;
pub mod ccw;
pub mod device;
pub mod error;
pub mod him;
pub mod media;
pub mod sense;
pub mod tape;
pub mod unitstatus;
pub mod validity;

pub use ccw::{CcwRequest, CcwResult};
pub use device::{DeviceContext, DeviceKind, DeviceRegistry};
pub use unitstatus::UnitStatus;
