//! USB request definitions needed to interpret control traffic.

/// Length of a SETUP stage payload.
pub const SETUP_PACKET_LEN: usize = 8;

// Standard requests (USB 2.0 table 9-4).
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;

// bmRequestType values used by hub class port requests (USB 2.0 section 11.24.2).
pub const REQUEST_TYPE_PORT_OUT: u8 = 0x23;
pub const REQUEST_TYPE_PORT_IN: u8 = 0xa3;

/// Hub class feature selector PORT_RESET.
pub const HUB_FEATURE_PORT_RESET: u16 = 4;

// wPortStatus bits (USB 2.0 table 11-21).
pub const HUB_PORT_CONNECTION: u16 = 1 << 0;
pub const HUB_PORT_ENABLE: u16 = 1 << 1;
pub const HUB_PORT_RESET: u16 = 1 << 4;
pub const HUB_PORT_LOW_SPEED: u16 = 1 << 9;
pub const HUB_PORT_HIGH_SPEED: u16 = 1 << 10;

/// An 8-byte control transfer SETUP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: [u8; SETUP_PACKET_LEN]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; SETUP_PACKET_LEN] {
        let mut out = [0u8; SETUP_PACKET_LEN];
        out[0] = self.request_type;
        out[1] = self.request;
        out[2..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..6].copy_from_slice(&self.index.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn is_device_to_host(self) -> bool {
        (self.request_type & 0x80) != 0
    }

    pub fn is_set_address(self) -> bool {
        self.request_type == 0x00 && self.request == REQUEST_SET_ADDRESS
    }

    /// Hub class SET_FEATURE(PORT_RESET); returns the 1-based port number.
    pub fn port_reset_target(self) -> Option<u16> {
        (self.request_type == REQUEST_TYPE_PORT_OUT
            && self.request == REQUEST_SET_FEATURE
            && self.value == HUB_FEATURE_PORT_RESET)
            .then_some(self.index)
    }

    /// Hub class GET_STATUS on a port; returns the 1-based port number.
    pub fn port_status_target(self) -> Option<u16> {
        (self.request_type == REQUEST_TYPE_PORT_IN && self.request == REQUEST_GET_STATUS)
            .then_some(self.index)
    }
}
