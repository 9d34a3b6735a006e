//! Controller configuration.
//!
//! Timeouts, scheduling delays and the self-halt threshold are hardware-tuned values rather than
//! protocol constants, so they are exposed here instead of being baked into the workers.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::native::{PipeDirection, PipeId, PipeKind};

/// Upper bound on the interrupt worker pool.
pub const MAX_INTERRUPT_WORKERS: usize = 16;

/// Hubs describe at most 255 ports, but the tracker keeps a status word per port; 15 matches the
/// widest hub descriptor bitmap commonly seen in practice.
pub const MAX_HUB_PORTS: usize = 15;

const MAX_ENDPOINT: u8 = 15;

/// Delay a worker yields between scan passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Backoff {
    /// Delay when the last pass found nothing to do (or the class is parked).
    pub idle_ms: u64,
    /// Delay when the last pass executed a transfer.
    pub active_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            idle_ms: 10,
            active_ms: 1,
        }
    }
}

impl Backoff {
    pub fn delay(&self, active: bool) -> Duration {
        Duration::from_millis(if active { self.active_ms } else { self.idle_ms })
    }
}

/// Maps an (address, endpoint, direction) tuple onto a native pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipeBinding {
    pub pipe: PipeId,
    pub kind: PipeKind,
    pub endpoint: u8,
    pub direction: PipeDirection,
    /// Restricts the binding to one device address; `None` matches any device.
    #[serde(default)]
    pub address: Option<u8>,
}

impl PipeBinding {
    fn matches(&self, kind: PipeKind, address: u8, endpoint: u8, direction: PipeDirection) -> bool {
        self.kind == kind
            && self.endpoint == endpoint
            && self.direction == direction
            && self.address.map_or(true, |a| a == address)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OhciConfig {
    /// How long a control stage may wait for the native driver before the device is treated as
    /// not responding.
    pub control_timeout_ms: u64,
    /// How long a bulk transfer waits before it is stopped and left queued for a retry.
    pub bulk_timeout_ms: u64,
    pub backoff: Backoff,
    pub interrupt_workers: usize,
    /// Failed polls an interrupt worker tolerates before releasing its claimed ED.
    pub interrupt_idle_cycles: u32,
    /// Consecutive failed attempts after which an ED is halted.
    pub error_halt_threshold: u8,
    /// Ports tracked per downstream high-speed hub.
    pub hub_ports: usize,
    pub pipes: Vec<PipeBinding>,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: 1000,
            bulk_timeout_ms: 5,
            backoff: Backoff::default(),
            interrupt_workers: 4,
            interrupt_idle_cycles: 4,
            error_halt_threshold: 10,
            hub_ports: 4,
            pipes: Vec::new(),
        }
    }
}

impl OhciConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interrupt_workers == 0 || self.interrupt_workers > MAX_INTERRUPT_WORKERS {
            return Err(ConfigError::InterruptWorkers {
                got: self.interrupt_workers,
                max: MAX_INTERRUPT_WORKERS,
            });
        }
        if self.control_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("control_timeout_ms"));
        }
        if self.bulk_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("bulk_timeout_ms"));
        }
        if self.hub_ports == 0 || self.hub_ports > MAX_HUB_PORTS {
            return Err(ConfigError::HubPorts {
                got: self.hub_ports,
                max: MAX_HUB_PORTS,
            });
        }

        let mut seen = HashSet::new();
        for binding in &self.pipes {
            if binding.pipe == PipeId::CONTROL {
                return Err(ConfigError::ReservedPipe);
            }
            if binding.kind == PipeKind::Control {
                return Err(ConfigError::ControlBinding(binding.pipe.0));
            }
            if binding.endpoint == 0 || binding.endpoint > MAX_ENDPOINT {
                return Err(ConfigError::Endpoint(binding.endpoint));
            }
            if !seen.insert(binding.pipe) {
                return Err(ConfigError::DuplicatePipe(binding.pipe.0));
            }
        }
        Ok(())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    /// Finds the native pipe serving an endpoint. Bindings restricted to `address` win over
    /// wildcard bindings.
    pub fn resolve_pipe(
        &self,
        kind: PipeKind,
        address: u8,
        endpoint: u8,
        direction: PipeDirection,
    ) -> Option<&PipeBinding> {
        let mut candidates = self
            .pipes
            .iter()
            .filter(|b| b.matches(kind, address, endpoint, direction));
        let first = candidates.next()?;
        if first.address.is_some() {
            return Some(first);
        }
        Some(
            candidates
                .find(|b| b.address.is_some())
                .unwrap_or(first),
        )
    }
}
