//! Host Interface Machine (HIM): an emulated subchannel-addressable IP
//! device tunneling TCP/UDP endpoints between the guest and the outside
//! network (spec.md §1, §3, §4.8, §4.9).

pub mod config;
pub mod connection;
pub mod header;
pub mod poller;

pub use connection::{HimConnState, HimEvent, HimProtocol, HimState};
