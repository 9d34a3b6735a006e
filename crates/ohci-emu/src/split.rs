//! Hub routing inferred from control traffic to the root device.
//!
//! When the native link runs at high speed the device on the root port is normally a high-speed
//! hub, and full/low-speed devices behind it must be reached with split transactions. The native
//! peripheral needs the hub address, hub port and device speed for those; the OHCI host stack
//! never states them directly. The tracker recovers them by watching the hub enumeration the host
//! stack already performs:
//!
//! 1. `SET_ADDRESS` sent to address 0 while no root device is known names the root (hub) address.
//! 2. `SET_FEATURE(PORT_RESET)` to the root marks a hub port as being reset.
//! 3. `GET_STATUS` to the root arms a capture of the next IN data stage (the port status word).
//! 4. Once the reset port reports reset complete, its speed bits give the route of the device
//!    that now answers at address 0, which is also bound to its new address by the next
//!    `SET_ADDRESS`.
//!
//! Observation is passive: nothing here changes the traffic itself.

use std::collections::HashMap;

use tracing::debug;

use crate::native::{DeviceRoute, LinkSpeed};
use crate::usb::{SetupPacket, HUB_PORT_HIGH_SPEED, HUB_PORT_LOW_SPEED, HUB_PORT_RESET};

/// Route of the root device itself.
const ROOT_ROUTE: DeviceRoute = DeviceRoute::direct(LinkSpeed::High);

#[derive(Debug)]
pub struct SplitTracker {
    root_address: Option<u8>,
    pending_reset: Option<u16>,
    capture_port: Option<u16>,
    port_status: Vec<u16>,
    /// Route of the device currently answering at the default address.
    default_route: Option<DeviceRoute>,
    routes: HashMap<u8, DeviceRoute>,
}

impl SplitTracker {
    pub fn new(hub_ports: usize) -> Self {
        Self {
            root_address: None,
            pending_reset: None,
            capture_port: None,
            port_status: vec![0; hub_ports],
            default_route: None,
            routes: HashMap::new(),
        }
    }

    /// Forgets everything; called on every attach/detach transition.
    pub fn reset(&mut self) {
        *self = Self::new(self.port_status.len());
    }

    pub fn root_address(&self) -> Option<u8> {
        self.root_address
    }

    pub fn port_status(&self, port: u16) -> Option<u16> {
        let idx = usize::from(port).checked_sub(1)?;
        self.port_status.get(idx).copied()
    }

    fn port_in_range(&self, port: u16) -> bool {
        port >= 1 && usize::from(port) <= self.port_status.len()
    }

    /// Feeds a SETUP stage that completed successfully on `address`.
    pub fn observe_setup(&mut self, address: u8, setup: SetupPacket) {
        if address == 0 && setup.is_set_address() {
            // USB addresses are 7 bits wide.
            let new_address = (setup.value & 0x7f) as u8;
            match self.root_address {
                None => {
                    debug!(address = new_address, "root device addressed");
                    self.root_address = Some(new_address);
                    self.routes.insert(new_address, ROOT_ROUTE);
                }
                Some(_) => {
                    // The status stage still runs at the default address, so the default route
                    // stays until the next port reset replaces it.
                    if let Some(route) = self.default_route {
                        debug!(address = new_address, ?route, "downstream device addressed");
                        self.routes.insert(new_address, route);
                    }
                }
            }
            return;
        }

        if Some(address) != self.root_address {
            return;
        }
        if let Some(port) = setup.port_reset_target() {
            if self.port_in_range(port) {
                debug!(port, "hub port reset requested");
                self.pending_reset = Some(port);
                self.default_route = None;
            }
        } else if let Some(port) = setup.port_status_target() {
            if self.port_in_range(port) {
                self.capture_port = Some(port);
            }
        }
    }

    /// Feeds the data of a successful control IN stage on `address`.
    pub fn observe_in_data(&mut self, address: u8, data: &[u8]) {
        if Some(address) != self.root_address {
            return;
        }
        let Some(port) = self.capture_port.take() else {
            return;
        };
        let Some(bytes) = data.get(..2) else {
            return;
        };
        let status = u16::from_le_bytes([bytes[0], bytes[1]]);
        let idx = usize::from(port) - 1;
        self.port_status[idx] = status;

        if self.pending_reset == Some(port) && status & HUB_PORT_RESET == 0 {
            let speed = if status & HUB_PORT_HIGH_SPEED != 0 {
                LinkSpeed::High
            } else if status & HUB_PORT_LOW_SPEED != 0 {
                LinkSpeed::Low
            } else {
                LinkSpeed::Full
            };
            let route = DeviceRoute {
                speed,
                hub_address: self.root_address.unwrap_or(0),
                hub_port: port as u8,
            };
            debug!(port, ?route, "hub port reset resolved");
            self.default_route = Some(route);
            self.pending_reset = None;
        }
    }

    /// Routing for transfers to `address` on a high-speed link.
    pub fn route_for(&self, address: u8) -> DeviceRoute {
        if let Some(route) = self.routes.get(&address) {
            return *route;
        }
        if address == 0 {
            if let Some(route) = self.default_route {
                return route;
            }
        }
        ROOT_ROUTE
    }
}
