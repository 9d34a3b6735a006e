//! Done queue: retiring TDs and publishing them to the host stack.
//!
//! Both functions run with the register lock held. That lock is what serialises a worker's
//! completion path against the host stack clearing WDH (which republishes through [`publish`]).

use tracing::{trace, warn};

use crate::descriptor::{EndpointDescriptor, TransferDescriptor};
use crate::error::DescriptorError;
use crate::facade::OhciRegs;
use crate::hcca::Hcca;
use crate::memory::GuestMemory;
use crate::regs::{InterruptFlags, INTERRUPT_STATUS_MASK};

/// Head pointer update applied when a TD leaves its ED.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Retire {
    pub halt: bool,
    /// New toggle carry, or `None` to keep the ED's current value.
    pub toggle: Option<bool>,
}

/// Unlinks `td` from the head of the ED at `ed_addr` and pushes it onto the done chain.
///
/// The TD's control word and buffer pointer must already hold the final result; only `next` is
/// rewritten here.
pub(crate) fn retire(
    regs: &mut OhciRegs,
    mem: &dyn GuestMemory,
    ed_addr: u32,
    td_addr: u32,
    td: &TransferDescriptor,
    how: Retire,
) -> Result<(), DescriptorError> {
    let mut ed = EndpointDescriptor::read(mem, ed_addr)?;
    if ed.head.addr != td_addr {
        // The host stack dequeued the TD while it was in flight.
        warn!(
            ed = format_args!("{ed_addr:#x}"),
            td = format_args!("{td_addr:#x}"),
            "TD no longer at ED head; dropping completion"
        );
        return Ok(());
    }

    ed.head.addr = td.next;
    ed.head.halted |= how.halt;
    if let Some(toggle) = how.toggle {
        ed.head.toggle_carry = toggle;
    }

    let mut done = *td;
    done.next = regs.done_head();
    done.write(mem, td_addr)?;
    ed.write_head(mem, ed_addr)?;
    regs.set_done_head(td_addr);
    trace!(
        ed = format_args!("{ed_addr:#x}"),
        td = format_args!("{td_addr:#x}"),
        halted = ed.head.halted,
        "TD retired"
    );

    publish(regs, mem);
    Ok(())
}

/// Writes the pending done chain into the HCCA and raises WDH, unless WDH is still pending.
///
/// Returns true when a done head was published.
pub(crate) fn publish(regs: &mut OhciRegs, mem: &dyn GuestMemory) -> bool {
    let head = regs.done_head();
    if head == 0 || regs.interrupt_status().contains(InterruptFlags::WDH) {
        return false;
    }
    let Some(hcca) = Hcca::at(mem, regs.hcca()) else {
        // Keep the chain pending until the host stack programs an HCCA.
        warn!(hcca = regs.hcca(), "done head pending without a usable HCCA");
        return false;
    };

    // The LSB tells the host stack other enabled interrupts are pending as well.
    let others = regs.interrupt_status().bits()
        & regs.interrupt_enable().bits()
        & INTERRUPT_STATUS_MASK
        & !InterruptFlags::WDH.bits();
    let value = head | u32::from(others != 0);

    if let Err(err) = hcca.write_done_head(mem, value) {
        warn!(%err, "failed to write HCCA done head");
        regs.raise(InterruptFlags::UE);
        return false;
    }
    regs.set_done_head(0);
    regs.raise(InterruptFlags::WDH);
    true
}
