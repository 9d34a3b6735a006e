//! Boundary to the native (non-OHCI) USB host peripheral.
//!
//! The controller drives the peripheral through [`NativeHost`]: it starts transfers on native
//! pipes and then blocks the issuing worker until the driver posts a completion through the
//! [`EventSink`] it was handed. Attach/detach notifications travel through the same sink, so the
//! dispatcher observes them in order with transfer completions.
//!
//! Only one transfer per worker is ever in flight: a worker does not start another transfer on
//! its class until the previous completion (or timeout) has been observed.

use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::usb::SetupPacket;

/// Identifier of a native pipe (FIFO/endpoint slot in the peripheral).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipeId(pub u8);

impl PipeId {
    /// The default control pipe.
    pub const CONTROL: PipeId = PipeId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSpeed {
    Low,
    Full,
    High,
}

/// Per-device addressing the peripheral needs to reach a device, including the split-transaction
/// hub routing for full/low-speed devices behind a high-speed hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceRoute {
    pub speed: LinkSpeed,
    /// Address of the high-speed hub the device sits behind, or 0 for a root-port device.
    pub hub_address: u8,
    /// 1-based hub port, or 0 for a root-port device.
    pub hub_port: u8,
}

impl DeviceRoute {
    pub const fn direct(speed: LinkSpeed) -> Self {
        Self {
            speed,
            hub_address: 0,
            hub_port: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeKind {
    Control,
    Bulk,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeDirection {
    In,
    Out,
}

/// Native pipe programming for one transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeSetup {
    pub kind: PipeKind,
    pub address: u8,
    pub endpoint: u8,
    /// `None` for the bidirectional control pipe.
    pub direction: Option<PipeDirection>,
    pub max_packet_size: u16,
    /// Polling interval for interrupt pipes, in the peripheral's own units: frames on a
    /// full/low-speed link, the `bInterval` exponent (2^(n-1) microframes) on a high-speed link.
    pub interval: u8,
}

/// Result reported by the peripheral for one transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeStatus {
    Ok,
    Stall,
    Nak,
    /// FIFO or peripheral access error.
    Error,
    /// The device went away while the transfer was pending.
    DeviceGone,
    /// The controller abandoned the transfer (class disabled or shutting down).
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeCompletion {
    pub status: NativeStatus,
    /// Bytes actually moved on the bus.
    pub transferred: usize,
    /// Data received for IN transfers.
    pub data: Vec<u8>,
}

impl NativeCompletion {
    pub fn sent(transferred: usize) -> Self {
        Self {
            status: NativeStatus::Ok,
            transferred,
            data: Vec::new(),
        }
    }

    pub fn received(data: Vec<u8>) -> Self {
        Self {
            status: NativeStatus::Ok,
            transferred: data.len(),
            data,
        }
    }

    pub fn failed(status: NativeStatus) -> Self {
        Self {
            status,
            transferred: 0,
            data: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NativeError {
    #[error("native pipe {0:?} is busy")]
    Busy(PipeId),
    #[error("no device attached")]
    NotAttached,
    #[error("FIFO access failed: {0}")]
    Fifo(String),
}

pub(crate) enum NativeEvent {
    TransferComplete {
        pipe: PipeId,
        completion: NativeCompletion,
    },
    AttachChanged {
        attached: bool,
    },
    Shutdown,
}

/// Handle the native driver uses to report completions and attach changes.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<NativeEvent>,
}

impl std::fmt::Debug for NativeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransferComplete { pipe, completion } => f
                .debug_struct("TransferComplete")
                .field("pipe", pipe)
                .field("status", &completion.status)
                .field("transferred", &completion.transferred)
                .finish(),
            Self::AttachChanged { attached } => f
                .debug_struct("AttachChanged")
                .field("attached", attached)
                .finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<NativeEvent>) -> Self {
        Self { tx }
    }

    pub fn transfer_complete(&self, pipe: PipeId, completion: NativeCompletion) {
        // The dispatcher only goes away when the controller is dropped; late completions are
        // irrelevant at that point.
        let _ = self
            .tx
            .send(NativeEvent::TransferComplete { pipe, completion });
    }

    pub fn attach_changed(&self, attached: bool) {
        let _ = self.tx.send(NativeEvent::AttachChanged { attached });
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(NativeEvent::Shutdown);
    }
}

/// The native USB host peripheral driver.
pub trait NativeHost: Send {
    /// Called once when the controller starts; completions and attach changes are reported
    /// through `sink`.
    fn set_event_sink(&mut self, sink: EventSink);

    /// Probes the port for an attached device.
    fn probe_attach(&mut self) -> bool;

    /// Drives a bus reset and returns the negotiated link speed.
    fn bus_reset(&mut self) -> LinkSpeed;

    /// Programs the speed and hub routing used for transfers to `address`.
    fn configure_device(&mut self, address: u8, route: DeviceRoute);

    fn configure_pipe(&mut self, pipe: PipeId, setup: &PipeSetup) -> Result<(), NativeError>;

    /// Starts a SETUP stage on the control pipe.
    fn start_setup(&mut self, setup: SetupPacket) -> Result<(), NativeError>;

    fn start_send(&mut self, pipe: PipeId, data: &[u8]) -> Result<(), NativeError>;

    fn start_receive(&mut self, pipe: PipeId, len: usize) -> Result<(), NativeError>;

    /// Abandons any transfer in progress on `pipe`. No completion is expected afterwards.
    fn stop_transfer(&mut self, pipe: PipeId);

    fn toggle(&self, pipe: PipeId) -> bool;

    fn set_toggle(&mut self, pipe: PipeId, toggle: bool);
}
