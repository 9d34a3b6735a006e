//! OHCI host controller emulation on top of a native USB host peripheral.
//!
//! The host stack sees a standard OHCI register block (see [`OhciController::read`] /
//! [`OhciController::write`]) and builds ED/TD schedules in [`GuestMemory`] as it would for real
//! hardware. Behind the register facade:
//! - a control worker and a bulk worker walk their ED lists,
//! - a pool of interrupt workers claims and polls EDs from the HCCA interrupt tree,
//! - every TD becomes one transfer on a [`NativeHost`] pipe, and
//! - a dispatcher thread routes native completions back to the waiting worker, keeps the frame
//!   counter running and tracks attach/detach on the single root port.
//!
//! On a high-speed native link the controller additionally infers split-transaction routing for
//! devices behind a downstream hub from the host stack's own hub enumeration traffic.
#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod descriptor;
mod dispatch;
mod done;
pub mod error;
pub mod facade;
pub mod hcca;
pub mod memory;
pub mod native;
pub mod regs;
pub mod root_hub;
pub mod split;
mod transfer;
pub mod usb;
pub mod worker;

pub use config::{Backoff, OhciConfig, PipeBinding};
pub use controller::{InterruptLine, OhciController};
pub use error::{ConfigError, DescriptorError, MemoryError, OhciError};
pub use memory::{DescriptorRam, GuestMemory};
pub use native::{
    DeviceRoute, EventSink, LinkSpeed, NativeCompletion, NativeError, NativeHost, NativeStatus,
    PipeDirection, PipeId, PipeKind, PipeSetup,
};
pub use usb::SetupPacket;
pub use worker::{WorkerKind, WorkerStatus};
