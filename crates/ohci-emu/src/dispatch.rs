//! Completion dispatcher and root-port attach state machine.
//!
//! A single dispatcher thread drains the [`NativeEvent`] channel fed by the native driver. Transfer
//! completions are routed to the worker whose completion slot is armed for that pipe; attach
//! changes update the root port and force-complete every pending wait on detach. Between events
//! the dispatcher keeps the frame counter running.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::controller::{lock, Shared};
use crate::descriptor::TransferClass;
use crate::hcca::Hcca;
use crate::native::{NativeCompletion, NativeEvent, NativeStatus, PipeId};
use crate::regs::InterruptFlags;

const FRAME_PERIOD: Duration = Duration::from_millis(1);

/// Frames the dispatcher catches up on after a stall before it resynchronises.
const MAX_FRAME_CATCH_UP: u32 = 32;

#[derive(Debug)]
struct Slot {
    class: TransferClass,
    tx: Sender<NativeCompletion>,
}

#[derive(Debug, Default)]
struct RouterState {
    slots: HashMap<PipeId, Slot>,
    closed: Vec<TransferClass>,
    detached: bool,
}

/// One-shot completion slots, one per native pipe with a transfer in flight.
#[derive(Debug, Default)]
pub(crate) struct CompletionRouter {
    state: Mutex<RouterState>,
}

impl CompletionRouter {
    /// Arms the slot for `pipe`. Fails with the status to report when no transfer may start:
    /// the device is gone or the class is being shut down.
    pub fn arm(
        &self,
        pipe: PipeId,
        class: TransferClass,
    ) -> Result<Receiver<NativeCompletion>, NativeStatus> {
        let mut st = lock(&self.state);
        if st.detached {
            return Err(NativeStatus::DeviceGone);
        }
        if st.closed.contains(&class) {
            return Err(NativeStatus::Aborted);
        }
        let (tx, rx) = mpsc::channel();
        if st.slots.insert(pipe, Slot { class, tx }).is_some() {
            warn!(?pipe, "completion slot re-armed while still pending");
        }
        Ok(rx)
    }

    pub fn disarm(&self, pipe: PipeId) {
        lock(&self.state).slots.remove(&pipe);
    }

    /// Delivers a completion. Returns false when nobody was waiting on `pipe`.
    pub fn complete(&self, pipe: PipeId, completion: NativeCompletion) -> bool {
        let slot = lock(&self.state).slots.remove(&pipe);
        match slot {
            Some(slot) => slot.tx.send(completion).is_ok(),
            None => false,
        }
    }

    /// Closes `class` to new transfers and aborts its pending waits. Returns the pipes whose
    /// native transfers must be stopped.
    pub fn close_class(&self, class: TransferClass) -> Vec<PipeId> {
        let mut st = lock(&self.state);
        if !st.closed.contains(&class) {
            st.closed.push(class);
        }
        let pipes: Vec<PipeId> = st
            .slots
            .iter()
            .filter(|(_, slot)| slot.class == class)
            .map(|(pipe, _)| *pipe)
            .collect();
        for pipe in &pipes {
            if let Some(slot) = st.slots.remove(pipe) {
                let _ = slot.tx.send(NativeCompletion::failed(NativeStatus::Aborted));
            }
        }
        pipes
    }

    pub fn open_class(&self, class: TransferClass) {
        lock(&self.state).closed.retain(|c| *c != class);
    }

    /// Marks the device gone (or back) and force-completes every pending wait when it leaves.
    pub fn set_detached(&self, detached: bool) -> usize {
        let mut st = lock(&self.state);
        st.detached = detached;
        if !detached {
            return 0;
        }
        let slots: Vec<Slot> = st.slots.drain().map(|(_, slot)| slot).collect();
        drop(st);
        let count = slots.len();
        for slot in slots {
            let _ = slot.tx.send(NativeCompletion::failed(NativeStatus::DeviceGone));
        }
        count
    }

    /// Aborts everything and refuses new transfers; used on shutdown.
    pub fn close_all(&self) {
        for class in [
            TransferClass::Control,
            TransferClass::Bulk,
            TransferClass::Interrupt,
        ] {
            self.close_class(class);
        }
    }
}

/// Applies a native attach/detach notification.
pub(crate) fn attach_changed(ctx: &Shared, attached: bool) {
    let changed = ctx.with_regs(|regs| {
        let was = regs.port().read() & crate::regs::PORT_CCS != 0;
        if was == attached {
            return false;
        }
        if attached {
            regs.port_mut().attach();
        } else {
            regs.port_mut().detach();
        }
        regs.raise(InterruptFlags::RHSC);
        true
    });
    if !changed {
        trace!(attached, "attach notification without state change");
        return;
    }

    lock(&ctx.split).reset();
    ctx.ledger.reset();
    if attached {
        ctx.completions.set_detached(false);
        info!("USB device attached");
    } else {
        let released = ctx.completions.set_detached(true);
        info!(released, "USB device detached");
    }
}

fn advance_frame(ctx: &Shared) {
    let mem = &*ctx.mem;
    ctx.with_regs(|regs| {
        let Some(frame) = regs.advance_frame() else {
            return;
        };
        if let Some(hcca) = Hcca::at(mem, regs.hcca()) {
            if let Err(err) = hcca.write_frame_number(mem, frame) {
                warn!(%err, "failed to update HCCA frame number");
                regs.raise(InterruptFlags::UE);
            }
        }
    });
}

/// Thread body of the dispatcher.
pub(crate) fn run_dispatcher(ctx: Arc<Shared>, rx: Receiver<NativeEvent>) {
    debug!("dispatcher started");
    let mut next_frame = Instant::now() + FRAME_PERIOD;
    loop {
        let timeout = next_frame.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(NativeEvent::TransferComplete { pipe, completion }) => {
                trace!(?pipe, status = ?completion.status, "transfer complete");
                if !ctx.completions.complete(pipe, completion) {
                    debug!(?pipe, "completion for a pipe with no pending wait");
                }
            }
            Ok(NativeEvent::AttachChanged { attached }) => attach_changed(&ctx, attached),
            Ok(NativeEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let mut ticks = 0;
        while now >= next_frame {
            if ticks == MAX_FRAME_CATCH_UP {
                next_frame = now + FRAME_PERIOD;
                break;
            }
            advance_frame(&ctx);
            next_frame += FRAME_PERIOD;
            ticks += 1;
        }
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_reach_the_armed_slot_once() {
        let router = CompletionRouter::default();
        let rx = router.arm(PipeId(1), TransferClass::Bulk).unwrap();
        assert!(router.complete(PipeId(1), NativeCompletion::sent(4)));
        assert_eq!(rx.recv().unwrap().transferred, 4);
        assert!(!router.complete(PipeId(1), NativeCompletion::sent(4)));
    }

    #[test]
    fn detach_force_completes_every_wait() {
        let router = CompletionRouter::default();
        let control = router.arm(PipeId::CONTROL, TransferClass::Control).unwrap();
        let bulk = router.arm(PipeId(2), TransferClass::Bulk).unwrap();
        assert_eq!(router.set_detached(true), 2);
        assert_eq!(control.recv().unwrap().status, NativeStatus::DeviceGone);
        assert_eq!(bulk.recv().unwrap().status, NativeStatus::DeviceGone);
        assert_eq!(
            router.arm(PipeId(2), TransferClass::Bulk).unwrap_err(),
            NativeStatus::DeviceGone
        );
        router.set_detached(false);
        assert!(router.arm(PipeId(2), TransferClass::Bulk).is_ok());
    }

    #[test]
    fn closing_a_class_only_aborts_that_class() {
        let router = CompletionRouter::default();
        let int_rx = router.arm(PipeId(3), TransferClass::Interrupt).unwrap();
        let _bulk_rx = router.arm(PipeId(2), TransferClass::Bulk).unwrap();

        assert_eq!(router.close_class(TransferClass::Interrupt), vec![PipeId(3)]);
        assert_eq!(int_rx.recv().unwrap().status, NativeStatus::Aborted);
        assert_eq!(
            router.arm(PipeId(3), TransferClass::Interrupt).unwrap_err(),
            NativeStatus::Aborted
        );
        assert!(router.complete(PipeId(2), NativeCompletion::sent(0)));

        router.open_class(TransferClass::Interrupt);
        assert!(router.arm(PipeId(3), TransferClass::Interrupt).is_ok());
    }
}
