//! Graph nodes: typed ports, lifecycle and per-component unit queues

use std::collections::VecDeque;

use crate::error::{PipelineError, Result};
use crate::pipeline::catalog::ComponentBackend;
use crate::pipeline::types::{MediaKind, MediaUnit};

/// Index of a component inside the graph that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentHandle(pub(crate) usize);

impl ComponentHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

/// One port of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    /// Port number, unique within the component
    pub index: u32,
    pub direction: PortDirection,
    pub kind: MediaKind,
}

impl PortSpec {
    pub fn input(index: u32, kind: MediaKind) -> Self {
        Self {
            index,
            direction: PortDirection::Input,
            kind,
        }
    }

    pub fn output(index: u32, kind: MediaKind) -> Self {
        Self {
            index,
            direction: PortDirection::Output,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Idle,
    Enabled,
    Disabled,
    Destroyed,
}

/// A processing stage owned by a [`ComponentGraph`](super::ComponentGraph)
///
/// Units waiting for the backend sit in `input`; processed units wait in
/// `output` until a tunnel moves them on. A component without output ports is
/// a sink and its `output` queue is the presentation queue.
pub struct Component {
    name: String,
    ports: Vec<PortSpec>,
    state: ComponentState,
    backend: Box<dyn ComponentBackend>,
    capacity: usize,
    pub(super) input: VecDeque<MediaUnit>,
    pub(super) output: VecDeque<MediaUnit>,
}

impl Component {
    pub(super) fn new(
        name: impl Into<String>,
        ports: Vec<PortSpec>,
        backend: Box<dyn ComponentBackend>,
    ) -> Result<Self> {
        let name = name.into();
        for (i, port) in ports.iter().enumerate() {
            if ports[..i].iter().any(|p| p.index == port.index) {
                return Err(PipelineError::InvalidArgument(format!(
                    "{}: duplicate port {}",
                    name, port.index
                )));
            }
        }
        let capacity = backend.queue_depth().max(1);
        Ok(Self {
            name,
            ports,
            state: ComponentState::Idle,
            backend,
            capacity,
            input: VecDeque::with_capacity(capacity),
            output: VecDeque::with_capacity(capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &[PortSpec] {
        &self.ports
    }

    pub fn port(&self, index: u32) -> Option<&PortSpec> {
        self.ports.iter().find(|p| p.index == index)
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// Whether the component has no output port
    pub fn is_sink(&self) -> bool {
        !self
            .ports
            .iter()
            .any(|p| p.direction == PortDirection::Output)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queued(&self) -> usize {
        self.input.len() + self.output.len()
    }

    pub fn has_room(&self) -> bool {
        self.state == ComponentState::Enabled && self.input.len() < self.capacity
    }

    pub(super) fn enable(&mut self) {
        if matches!(self.state, ComponentState::Idle | ComponentState::Disabled) {
            self.state = ComponentState::Enabled;
        }
    }

    pub(super) fn disable(&mut self) {
        if self.state == ComponentState::Enabled {
            self.state = ComponentState::Disabled;
        }
    }

    pub(super) fn destroy(&mut self) {
        self.input.clear();
        self.output.clear();
        self.backend.flush();
        self.state = ComponentState::Destroyed;
    }

    /// Run queued input through the backend while the output queue has room
    ///
    /// Returns the number of units the backend rejected. Rejected units are
    /// dropped; escalating errors are returned immediately.
    pub(super) fn process(&mut self) -> Result<usize> {
        if self.state != ComponentState::Enabled {
            return Ok(0);
        }
        let mut failures = 0;
        while self.output.len() < self.capacity {
            let Some(unit) = self.input.pop_front() else {
                break;
            };
            match self.backend.process(unit) {
                Ok(Some(out)) => self.output.push_back(out),
                Ok(None) => {}
                Err(e) if e.escalates() => return Err(e),
                Err(e) => {
                    log::warn!("Component {}: dropped unit: {}", self.name, e);
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    pub(super) fn clear(&mut self) {
        self.input.clear();
        self.output.clear();
    }

    pub(super) fn flush_backend(&mut self) {
        if self.state != ComponentState::Destroyed {
            self.backend.flush();
        }
    }

    pub fn backend_drained(&self) -> bool {
        self.state == ComponentState::Destroyed || self.backend.is_drained()
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("role", &self.backend.role())
            .field("state", &self.state)
            .field("ports", &self.ports)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .finish()
    }
}
