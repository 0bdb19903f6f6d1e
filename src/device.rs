//! Explicit system context and device registry (Design Notes §9: replace
//! the ambient "system block" with a context passed to every handler).
//!
//! Grounded on `pbs-tape/src/sg_tape.rs`'s `SgTape` struct-holds-state
//! style: state lives in a struct the caller owns and passes around, never
//! behind a global singleton.

use std::collections::HashMap;

use crate::him::connection::HimState;
use crate::tape::TapeState;

/// Either half of the two device families this crate emulates.
pub enum DeviceKind {
    Tape(TapeState),
    Him(HimState),
}

/// Per-subchannel device context (spec.md §3 "Device context").
pub struct DeviceContext {
    pub device_type: u16,
    pub subchannel: u16,
    pub buffer: Vec<u8>,
    pub residual: u32,
    pub unit_status: crate::unitstatus::UnitStatus,
    /// Sense array, 1-32 bytes.
    pub sense: Vec<u8>,
    /// Device-identifier block returned by SENSE ID.
    pub device_id: Vec<u8>,
    pub ccw_trace: bool,
    pub kind: DeviceKind,
}

impl DeviceContext {
    pub fn new_tape(device_type: u16, subchannel: u16, tape: TapeState) -> Self {
        DeviceContext {
            device_type,
            subchannel,
            buffer: Vec::new(),
            residual: 0,
            unit_status: crate::unitstatus::UnitStatus::default(),
            sense: Vec::new(),
            device_id: Vec::new(),
            ccw_trace: false,
            kind: DeviceKind::Tape(tape),
        }
    }

    pub fn new_him(device_type: u16, subchannel: u16, him: HimState) -> Self {
        DeviceContext {
            device_type,
            subchannel,
            buffer: Vec::new(),
            residual: 0,
            unit_status: crate::unitstatus::UnitStatus::default(),
            sense: Vec::new(),
            device_id: Vec::new(),
            ccw_trace: false,
            kind: DeviceKind::Him(him),
        }
    }

    pub fn tape(&self) -> Option<&TapeState> {
        match &self.kind {
            DeviceKind::Tape(t) => Some(t),
            _ => None,
        }
    }

    pub fn tape_mut(&mut self) -> Option<&mut TapeState> {
        match &mut self.kind {
            DeviceKind::Tape(t) => Some(t),
            _ => None,
        }
    }

    pub fn him(&self) -> Option<&HimState> {
        match &self.kind {
            DeviceKind::Him(h) => Some(h),
            _ => None,
        }
    }

    pub fn him_mut(&mut self) -> Option<&mut HimState> {
        match &mut self.kind {
            DeviceKind::Him(h) => Some(h),
            _ => None,
        }
    }
}

/// A factory that builds a fresh [`DeviceContext`] for one device-type
/// code. Held in the registry as a plain function pointer -- Design Notes
/// §9 replaces the original's dynamic-library resolver with a static
/// registration table built at startup.
pub type DeviceFactory = fn(device_type: u16, subchannel: u16) -> DeviceContext;

/// Process-wide device-type -> factory mapping, consulted only at
/// device-init time (spec.md §5: "no concurrent mutation during handler
/// execution").
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<u16, DeviceFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, device_type: u16, factory: DeviceFactory) {
        self.factories.insert(device_type, factory);
    }

    pub fn create(&self, device_type: u16, subchannel: u16) -> Option<DeviceContext> {
        self.factories.get(&device_type).map(|f| f(device_type, subchannel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tape(device_type: u16, subchannel: u16) -> DeviceContext {
        DeviceContext::new_tape(device_type, subchannel, TapeState::new())
    }

    #[test]
    fn registry_dispatches_to_registered_factory() {
        let mut registry = DeviceRegistry::new();
        registry.register(0x3420, make_tape);
        let ctx = registry.create(0x3420, 0).expect("registered");
        assert!(ctx.tape().is_some());
    }

    #[test]
    fn unregistered_device_type_yields_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.create(0x9999, 0).is_none());
    }
}
