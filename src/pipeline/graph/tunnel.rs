use serde::{Deserialize, Serialize};

use super::component::ComponentHandle;

/// Index of a tunnel inside the graph that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub(crate) usize);

impl TunnelId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Established,
    Active,
    Released,
}

/// Exclusive binding from one output port to one input port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    pub src: ComponentHandle,
    pub src_port: u32,
    pub dst: ComponentHandle,
    pub dst_port: u32,
    pub state: TunnelState,
}

impl Tunnel {
    /// A tunnel holds both of its ports until released
    pub fn is_live(&self) -> bool {
        self.state != TunnelState::Released
    }

    pub fn is_active(&self) -> bool {
        self.state == TunnelState::Active
    }

    pub fn touches(&self, component: ComponentHandle) -> bool {
        self.src == component || self.dst == component
    }

    pub fn uses_port(&self, component: ComponentHandle, port: u32) -> bool {
        (self.src == component && self.src_port == port)
            || (self.dst == component && self.dst_port == port)
    }
}

/// What to do when a wiring rule is broken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
    /// Abort on the spot
    Panic,
    /// Return `TunnelViolation` and let the controller escalate
    Report,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ViolationPolicy::Panic
        } else {
            ViolationPolicy::Report
        }
    }
}
