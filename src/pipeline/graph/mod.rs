//! Component graph and tunnel management
//!
//! A [`ComponentGraph`] exclusively owns its components and the tunnels
//! between them. Handles are plain indices into the graph, so nothing can
//! reach a component except through the graph that created it.
//!
//! # Wiring rules
//!
//! - A port carries at most one live tunnel (Established or Active).
//! - Tunnels go from an output port to an input port of the same media kind.
//! - Activating an active tunnel is a violation.
//! - A component may only be destroyed once all its tunnels are released.
//!
//! Violations either panic or return [`PipelineError::TunnelViolation`],
//! depending on the graph's [`ViolationPolicy`].

mod component;
mod tunnel;

pub use component::{Component, ComponentHandle, ComponentState, PortDirection, PortSpec};
pub use tunnel::{Tunnel, TunnelId, TunnelState, ViolationPolicy};

use std::time::{Duration, Instant};

use super::catalog::ComponentBackend;
use super::types::MediaUnit;
use crate::error::{PipelineError, Result};
use crate::utils::sos::SignalOfStop;

/// How long flush sleeps between drain checks
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Outcome of one [`ComponentGraph::pump`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Units moved across tunnels
    pub transferred: usize,
    /// Units rejected by a backend
    pub failures: usize,
}

pub struct ComponentGraph {
    components: Vec<Component>,
    tunnels: Vec<Tunnel>,
    policy: ViolationPolicy,
    first_output_seen: bool,
}

impl ComponentGraph {
    pub fn new(policy: ViolationPolicy) -> Self {
        Self {
            components: Vec::new(),
            tunnels: Vec::new(),
            policy,
            first_output_seen: false,
        }
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    fn violation<T>(&self, message: String) -> Result<T> {
        log::error!("ComponentGraph: tunnel violation: {}", message);
        match self.policy {
            ViolationPolicy::Panic => panic!("tunnel violation: {}", message),
            ViolationPolicy::Report => Err(PipelineError::TunnelViolation(message)),
        }
    }

    fn get(&self, handle: ComponentHandle) -> Result<&Component> {
        self.components
            .get(handle.0)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("no component #{}", handle.0)))
    }

    fn get_mut(&mut self, handle: ComponentHandle) -> Result<&mut Component> {
        self.components
            .get_mut(handle.0)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("no component #{}", handle.0)))
    }

    fn get_tunnel(&self, id: TunnelId) -> Result<&Tunnel> {
        self.tunnels
            .get(id.0)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("no tunnel #{}", id.0)))
    }

    pub fn component(&self, handle: ComponentHandle) -> Option<&Component> {
        self.components.get(handle.0)
    }

    pub fn tunnel_info(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(id.0)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Register a new component in the Idle state
    pub fn add_component(
        &mut self,
        name: impl Into<String>,
        ports: Vec<PortSpec>,
        backend: Box<dyn ComponentBackend>,
    ) -> Result<ComponentHandle> {
        let component = Component::new(name, ports, backend)?;
        log::debug!(
            "ComponentGraph: added {} (#{})",
            component.name(),
            self.components.len()
        );
        self.components.push(component);
        Ok(ComponentHandle(self.components.len() - 1))
    }

    fn port_occupied(&self, component: ComponentHandle, port: u32) -> bool {
        self.tunnels
            .iter()
            .any(|t| t.is_live() && t.uses_port(component, port))
    }

    /// Bind `src`'s output port to `dst`'s input port
    pub fn tunnel(
        &mut self,
        src: ComponentHandle,
        src_port: u32,
        dst: ComponentHandle,
        dst_port: u32,
    ) -> Result<TunnelId> {
        let source = self.get(src)?;
        let sink = self.get(dst)?;

        if source.state() == ComponentState::Destroyed || sink.state() == ComponentState::Destroyed
        {
            return self.violation(format!(
                "{}:{} -> {}:{} touches a destroyed component",
                source.name(),
                src_port,
                sink.name(),
                dst_port
            ));
        }

        let (Some(out_port), Some(in_port)) = (source.port(src_port), sink.port(dst_port)) else {
            return Err(PipelineError::InvalidArgument(format!(
                "no such port {}:{} -> {}:{}",
                source.name(),
                src_port,
                sink.name(),
                dst_port
            )));
        };

        if out_port.direction != PortDirection::Output || in_port.direction != PortDirection::Input
        {
            return self.violation(format!(
                "{}:{} -> {}:{} must go from an output to an input",
                source.name(),
                src_port,
                sink.name(),
                dst_port
            ));
        }
        if out_port.kind != in_port.kind {
            return self.violation(format!(
                "{}:{} carries {} but {}:{} takes {}",
                source.name(),
                src_port,
                out_port.kind,
                sink.name(),
                dst_port,
                in_port.kind
            ));
        }
        if self.port_occupied(src, src_port) {
            return self.violation(format!("port {}:{} already tunneled", source.name(), src_port));
        }
        if self.port_occupied(dst, dst_port) {
            return self.violation(format!("port {}:{} already tunneled", sink.name(), dst_port));
        }

        log::debug!(
            "ComponentGraph: tunnel {}:{} -> {}:{}",
            source.name(),
            src_port,
            sink.name(),
            dst_port
        );
        self.tunnels.push(Tunnel {
            src,
            src_port,
            dst,
            dst_port,
            state: TunnelState::Established,
        });
        Ok(TunnelId(self.tunnels.len() - 1))
    }

    pub fn activate_tunnel(&mut self, id: TunnelId) -> Result<()> {
        let tunnel = *self.get_tunnel(id)?;
        match tunnel.state {
            TunnelState::Established => {
                self.tunnels[id.0].state = TunnelState::Active;
                Ok(())
            }
            TunnelState::Active => self.violation(format!("tunnel #{} already active", id.0)),
            TunnelState::Released => self.violation(format!("tunnel #{} was released", id.0)),
        }
    }

    /// Release a tunnel and free both of its ports. Releasing twice is a no-op.
    pub fn deactivate_tunnel(&mut self, id: TunnelId) -> Result<()> {
        self.get_tunnel(id)?;
        self.tunnels[id.0].state = TunnelState::Released;
        Ok(())
    }

    /// Enable every idle component, then activate every established tunnel
    pub fn activate_all(&mut self) -> Result<()> {
        for component in &mut self.components {
            component.enable();
        }
        for i in 0..self.tunnels.len() {
            if self.tunnels[i].state == TunnelState::Established {
                self.activate_tunnel(TunnelId(i))?;
            }
        }
        Ok(())
    }

    pub fn disable_component(&mut self, handle: ComponentHandle) -> Result<()> {
        self.get_mut(handle)?.disable();
        Ok(())
    }

    /// Destroy a component whose tunnels have all been released
    pub fn destroy_component(&mut self, handle: ComponentHandle) -> Result<()> {
        let name = self.get(handle)?.name().to_string();
        if let Some(live) = self
            .tunnels
            .iter()
            .position(|t| t.is_live() && t.touches(handle))
        {
            return self.violation(format!("{} destroyed while tunnel #{} is live", name, live));
        }
        let component = self.get_mut(handle)?;
        component.disable();
        component.destroy();
        log::debug!("ComponentGraph: destroyed {}", name);
        Ok(())
    }

    /// Release all tunnels, then disable and destroy all components, both in
    /// reverse creation order
    pub fn teardown(&mut self) -> Result<()> {
        for i in (0..self.tunnels.len()).rev() {
            if self.tunnels[i].is_live() {
                self.deactivate_tunnel(TunnelId(i))?;
            }
        }
        for i in (0..self.components.len()).rev() {
            if self.components[i].state() != ComponentState::Destroyed {
                self.destroy_component(ComponentHandle(i))?;
            }
        }
        log::debug!(
            "ComponentGraph: torn down {} components, {} tunnels",
            self.components.len(),
            self.tunnels.len()
        );
        Ok(())
    }

    /// Whether `handle` can take another unit on its input queue
    pub fn can_accept(&self, handle: ComponentHandle) -> bool {
        self.component(handle).is_some_and(|c| c.has_room())
    }

    /// Queue a unit on a component's input
    pub fn feed(&mut self, handle: ComponentHandle, unit: MediaUnit) -> Result<()> {
        let component = self.get_mut(handle)?;
        if component.state() != ComponentState::Enabled {
            return Err(PipelineError::invalid_state(
                "feed",
                format!("{} is {:?}", component.name(), component.state()),
            ));
        }
        if !component.has_room() {
            return Err(PipelineError::Backpressure {
                used: component.input.len(),
                capacity: component.capacity(),
            });
        }
        component.input.push_back(unit);
        Ok(())
    }

    /// Run every component once and move its output along its active
    /// tunnels, in creation order
    pub fn pump(&mut self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        for i in 0..self.components.len() {
            report.failures += self.components[i].process()?;

            if self.components[i].is_sink() {
                if !self.components[i].output.is_empty() {
                    self.first_output_seen = true;
                }
                continue;
            }

            for t in 0..self.tunnels.len() {
                let tunnel = self.tunnels[t];
                if !tunnel.is_active() || tunnel.src.0 != i {
                    continue;
                }
                let dst = tunnel.dst.0;
                while self.components[dst].has_room() {
                    let Some(unit) = self.components[i].output.pop_front() else {
                        break;
                    };
                    self.components[dst].input.push_back(unit);
                    report.transferred += 1;
                }
            }
        }
        Ok(report)
    }

    /// Next unit waiting in a sink's presentation queue
    pub fn front(&self, handle: ComponentHandle) -> Option<&MediaUnit> {
        self.component(handle).and_then(|c| c.output.front())
    }

    pub fn pop_output(&mut self, handle: ComponentHandle) -> Option<MediaUnit> {
        self.components
            .get_mut(handle.0)
            .and_then(|c| c.output.pop_front())
    }

    /// Whether any sink has produced a unit since the graph was built
    pub fn first_output_seen(&self) -> bool {
        self.first_output_seen
    }

    /// Units held anywhere in the graph
    pub fn queued_units(&self) -> usize {
        self.components.iter().map(|c| c.queued()).sum()
    }

    pub fn is_drained(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.queued() == 0 && c.backend_drained())
    }

    /// Discard every in-flight unit and wait for the backends to drain
    ///
    /// Returns `StallTimeout` naming the first component still busy after
    /// `timeout`, or `Cancelled` if `cancel` fires first.
    pub fn flush(&mut self, timeout: Duration, cancel: &SignalOfStop) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let discarded = self.queued_units();
        for component in &mut self.components {
            component.clear();
            component.flush_backend();
        }

        loop {
            let Some(busy) = self.components.iter().find(|c| !c.backend_drained()) else {
                log::trace!("ComponentGraph: flushed {} units", discarded);
                return Ok(());
            };
            if cancel.cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::StallTimeout {
                    stage: busy.name().to_string(),
                    timeout,
                });
            }
            cancel.wait_timeout(DRAIN_POLL);
        }
    }
}

impl Default for ComponentGraph {
    fn default() -> Self {
        Self::new(ViolationPolicy::default())
    }
}

impl std::fmt::Debug for ComponentGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentGraph")
            .field("components", &self.components)
            .field("tunnels", &self.tunnels)
            .field("policy", &self.policy)
            .finish()
    }
}
