//! Single-port OHCI root hub backed by the native peripheral's port.

use crate::native::LinkSpeed;
use crate::regs::*;

/// Lifecycle of the device on the root port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Detached,
    /// A device is present but has not been through a bus reset yet.
    Attached,
    /// Bus reset done; the link runs at the negotiated speed.
    Operational(LinkSpeed),
}

/// What a `HcRhPortStatus` write asks the controller to do beyond updating the register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PortWrite {
    /// A bus reset must be driven on the native port.
    pub reset: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RootPort {
    reg: u32,
    state: PortState,
}

impl RootPort {
    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn link_speed(&self) -> Option<LinkSpeed> {
        match self.state {
            PortState::Operational(speed) => Some(speed),
            _ => None,
        }
    }

    pub fn read(&self) -> u32 {
        // No power switching: ports are always powered.
        self.reg | PORT_PPS
    }

    pub fn has_changes(&self) -> bool {
        self.reg & PORT_CHANGE_MASK != 0
    }

    fn set_connected(&mut self, connected: bool) {
        let was = self.reg & PORT_CCS != 0;
        if connected != was {
            self.reg |= PORT_CSC;
        }
        if connected {
            self.reg |= PORT_CCS;
        } else {
            self.reg &= !(PORT_CCS | PORT_LSDA);
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        let was = self.reg & PORT_PES != 0;
        if enabled != was {
            self.reg |= PORT_PESC;
        }
        if enabled {
            self.reg |= PORT_PES;
        } else {
            self.reg &= !(PORT_PES | PORT_PSS);
        }
    }

    /// Device attach reported by the native driver (or found by a probe).
    pub fn attach(&mut self) {
        self.set_connected(true);
        self.state = PortState::Attached;
    }

    pub fn detach(&mut self) {
        self.set_connected(false);
        // Losing the connection also disables the port, but OHCI reports that through CSC only.
        self.reg &= !(PORT_PES | PORT_PSS | PORT_PRS);
        self.state = PortState::Detached;
    }

    pub fn write(&mut self, value: u32) -> PortWrite {
        // Change bits are write-1-to-clear.
        self.reg &= !(value & PORT_CHANGE_MASK);

        if value & PORT_WRITE_CLEAR_ENABLE != 0 {
            self.set_enabled(false);
            self.reg &= !PORT_PESC;
        }
        let connected = self.reg & PORT_CCS != 0;
        if value & PORT_WRITE_SET_ENABLE != 0 {
            if connected {
                self.reg |= PORT_PES;
            } else {
                self.reg |= PORT_CSC;
            }
        }
        if value & PORT_WRITE_SET_SUSPEND != 0 {
            if connected {
                self.reg |= PORT_PSS;
            } else {
                self.reg |= PORT_CSC;
            }
        }
        if value & PORT_WRITE_CLEAR_SUSPEND != 0 && self.reg & PORT_PSS != 0 {
            self.reg &= !PORT_PSS;
            self.reg |= PORT_PSSC;
        }

        let mut out = PortWrite::default();
        if value & PORT_WRITE_SET_RESET != 0 {
            if connected {
                self.reg |= PORT_PRS;
                out.reset = true;
            } else {
                self.reg |= PORT_CSC;
            }
        }
        out
    }

    /// Completes a bus reset started by [`RootPort::write`].
    pub fn complete_reset(&mut self, speed: LinkSpeed) {
        self.reg &= !(PORT_PRS | PORT_PSS);
        if self.reg & PORT_CCS == 0 {
            // Device left during the reset.
            return;
        }
        self.reg |= PORT_PES | PORT_PRSC;
        if speed == LinkSpeed::Low {
            self.reg |= PORT_LSDA;
        } else {
            self.reg &= !PORT_LSDA;
        }
        self.state = PortState::Operational(speed);
    }
}
