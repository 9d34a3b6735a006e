//! Shadow OHCI register block and its read/write semantics.
//!
//! [`OhciRegs`] holds every operational register. Writes that need more than a register update
//! (waking or parking workers, resetting the controller, driving a native bus reset) return a list
//! of [`SideEffect`]s; the controller runs them after releasing the register lock so that a
//! disabling write can block on the worker handshake without stalling completions.

use tracing::{debug, trace};

use crate::descriptor::TransferClass;
use crate::done;
use crate::memory::GuestMemory;
use crate::regs::*;
use crate::root_hub::RootPort;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SideEffect {
    EnableClass(TransferClass),
    DisableClass(TransferClass),
    /// A list-filled flag was set for the class.
    KickClass(TransferClass),
    HostControllerReset,
    PortReset,
}

pub(crate) type SideEffects = Vec<SideEffect>;

const CLASS_ENABLE_BITS: [(TransferClass, u32); 3] = [
    (TransferClass::Interrupt, CONTROL_PLE),
    (TransferClass::Control, CONTROL_CLE),
    (TransferClass::Bulk, CONTROL_BLE),
];

const LIST_PTR_MASK: u32 = !0xf;
const HCCA_PTR_MASK: u32 = !0xff;

#[derive(Clone, Debug)]
pub struct OhciRegs {
    initialized: bool,
    control: u32,
    command_status: u32,
    interrupt_status: u32,
    interrupt_enable: u32,
    hcca: u32,
    period_current_ed: u32,
    control_head_ed: u32,
    control_current_ed: u32,
    bulk_head_ed: u32,
    bulk_current_ed: u32,
    done_head: u32,
    fm_interval: u32,
    fm_remaining: u32,
    fm_number: u32,
    periodic_start: u32,
    ls_threshold: u32,
    rh_descriptor_a: u32,
    rh_descriptor_b: u32,
    rh_status: u32,
    port: RootPort,
}

impl Default for OhciRegs {
    fn default() -> Self {
        Self::new()
    }
}

impl OhciRegs {
    pub fn new() -> Self {
        Self {
            initialized: false,
            control: 0,
            command_status: 0,
            interrupt_status: 0,
            interrupt_enable: 0,
            hcca: 0,
            period_current_ed: 0,
            control_head_ed: 0,
            control_current_ed: 0,
            bulk_head_ed: 0,
            bulk_current_ed: 0,
            done_head: 0,
            fm_interval: FM_INTERVAL_DEFAULT,
            fm_remaining: 0,
            fm_number: 0,
            periodic_start: 0,
            ls_threshold: LS_THRESHOLD_DEFAULT,
            rh_descriptor_a: RH_DESCRIPTOR_A_DEFAULT,
            rh_descriptor_b: 0,
            rh_status: 0,
            port: RootPort::default(),
        }
    }

    /// Restores power-on values. The initialized flag survives.
    pub(crate) fn reset(&mut self) {
        let initialized = self.initialized;
        *self = Self::new();
        self.initialized = initialized;
    }

    pub(crate) fn set_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn read(&self, offset: u32) -> u32 {
        if !self.initialized {
            return 0;
        }
        match offset {
            REG_REVISION => OHCI_REVISION,
            REG_CONTROL => self.control,
            REG_COMMAND_STATUS => self.command_status,
            REG_INTERRUPT_STATUS => self.interrupt_status,
            REG_INTERRUPT_ENABLE | REG_INTERRUPT_DISABLE => self.interrupt_enable,
            REG_HCCA => self.hcca,
            REG_PERIOD_CURRENT_ED => self.period_current_ed,
            REG_CONTROL_HEAD_ED => self.control_head_ed,
            REG_CONTROL_CURRENT_ED => self.control_current_ed,
            REG_BULK_HEAD_ED => self.bulk_head_ed,
            REG_BULK_CURRENT_ED => self.bulk_current_ed,
            REG_DONE_HEAD => self.done_head,
            REG_FM_INTERVAL => self.fm_interval,
            REG_FM_REMAINING => self.fm_remaining,
            REG_FM_NUMBER => self.fm_number,
            REG_PERIODIC_START => self.periodic_start,
            REG_LS_THRESHOLD => self.ls_threshold,
            REG_RH_DESCRIPTOR_A => self.rh_descriptor_a,
            REG_RH_DESCRIPTOR_B => self.rh_descriptor_b,
            REG_RH_STATUS => self.rh_status,
            REG_RH_PORT_STATUS_BASE => self.port.read(),
            _ => 0,
        }
    }

    /// Applies a host-stack register write. `mem` is needed to republish a pending done head when
    /// WDH is cleared.
    pub(crate) fn write(&mut self, mem: &dyn GuestMemory, offset: u32, value: u32) -> SideEffects {
        let mut effects = SideEffects::new();
        if !self.initialized {
            debug!(offset, value, "dropping OHCI register write before init");
            return effects;
        }
        trace!(offset, value = format_args!("{value:#010x}"), "OHCI register write");

        match offset {
            REG_CONTROL => self.write_control(value, &mut effects),
            REG_COMMAND_STATUS => self.write_command_status(value, &mut effects),
            REG_INTERRUPT_STATUS => {
                self.interrupt_status &= !(value & INTERRUPT_STATUS_MASK);
                if value & InterruptFlags::WDH.bits() != 0 {
                    // New completions may have queued while WDH was pending.
                    done::publish(self, mem);
                }
            }
            REG_INTERRUPT_ENABLE => self.interrupt_enable |= value,
            REG_INTERRUPT_DISABLE => self.interrupt_enable &= !value,
            REG_HCCA => self.hcca = value & HCCA_PTR_MASK,
            REG_PERIOD_CURRENT_ED => {}
            REG_CONTROL_HEAD_ED => self.control_head_ed = value & LIST_PTR_MASK,
            REG_CONTROL_CURRENT_ED => self.control_current_ed = value & LIST_PTR_MASK,
            REG_BULK_HEAD_ED => self.bulk_head_ed = value & LIST_PTR_MASK,
            REG_BULK_CURRENT_ED => self.bulk_current_ed = value & LIST_PTR_MASK,
            REG_FM_INTERVAL => self.fm_interval = value,
            REG_PERIODIC_START => self.periodic_start = value,
            REG_LS_THRESHOLD => self.ls_threshold = value,
            REG_RH_DESCRIPTOR_A => self.rh_descriptor_a = value,
            REG_RH_DESCRIPTOR_B => self.rh_descriptor_b = value,
            REG_RH_STATUS => self.write_rh_status(value),
            REG_RH_PORT_STATUS_BASE => {
                if self.port.write(value).reset {
                    effects.push(SideEffect::PortReset);
                }
            }
            // Revision, DoneHead, FmRemaining and FmNumber are read-only.
            _ => {}
        }
        effects
    }

    fn write_control(&mut self, value: u32, effects: &mut SideEffects) {
        let prev = self.control;
        self.control = value;
        for (class, bit) in CLASS_ENABLE_BITS {
            match (prev & bit != 0, value & bit != 0) {
                (false, true) => effects.push(SideEffect::EnableClass(class)),
                (true, false) => effects.push(SideEffect::DisableClass(class)),
                _ => {}
            }
        }
        if (prev ^ value) & CONTROL_HCFS_MASK != 0 {
            debug!(
                from = (prev & CONTROL_HCFS_MASK) >> CONTROL_HCFS_SHIFT,
                to = (value & CONTROL_HCFS_MASK) >> CONTROL_HCFS_SHIFT,
                "HCFS transition"
            );
        }
    }

    fn write_command_status(&mut self, value: u32, effects: &mut SideEffects) {
        // Status bits are set-only from the host stack; SOC is owned by the controller.
        self.command_status |= value & !COMMAND_SOC_MASK;
        if value & COMMAND_HCR != 0 {
            effects.push(SideEffect::HostControllerReset);
            return;
        }
        if value & COMMAND_CLF != 0 {
            effects.push(SideEffect::KickClass(TransferClass::Control));
        }
        if value & COMMAND_BLF != 0 {
            effects.push(SideEffect::KickClass(TransferClass::Bulk));
        }
        if value & COMMAND_OCR != 0 {
            // No firmware owner to hand over from: grant ownership immediately.
            self.command_status &= !COMMAND_OCR;
            self.raise(InterruptFlags::OC);
        }
    }

    fn write_rh_status(&mut self, value: u32) {
        if value & RH_STATUS_OCIC != 0 {
            self.rh_status &= !RH_STATUS_OCIC;
        }
        if value & RH_STATUS_DRWE != 0 {
            self.rh_status |= RH_STATUS_DRWE;
        }
        if value & RH_STATUS_CRWE != 0 {
            self.rh_status &= !RH_STATUS_DRWE;
        }
        // LPS / LPSC are power switching commands; ports are always powered.
        let defined = RH_STATUS_LPS
            | RH_STATUS_OCI
            | RH_STATUS_DRWE
            | RH_STATUS_LPSC
            | RH_STATUS_OCIC
            | RH_STATUS_CRWE;
        self.rh_status = (self.rh_status & defined) | (value & !defined);
    }

    pub fn raise(&mut self, flags: InterruptFlags) {
        self.interrupt_status |= flags.bits() & INTERRUPT_STATUS_MASK;
    }

    pub fn interrupt_status(&self) -> InterruptFlags {
        InterruptFlags::from_bits_truncate(self.interrupt_status)
    }

    pub fn interrupt_enable(&self) -> InterruptFlags {
        InterruptFlags::from_bits_truncate(self.interrupt_enable)
    }

    /// Level of the emulated interrupt line.
    pub fn irq_level(&self) -> bool {
        self.interrupt_enable & InterruptFlags::MIE.bits() != 0
            && self.interrupt_status & self.interrupt_enable & INTERRUPT_STATUS_MASK != 0
    }

    pub fn class_enabled(&self, class: TransferClass) -> bool {
        let bit = match class {
            TransferClass::Interrupt => CONTROL_PLE,
            TransferClass::Control => CONTROL_CLE,
            TransferClass::Bulk => CONTROL_BLE,
        };
        self.control & bit != 0
    }

    pub fn operational(&self) -> bool {
        self.control & CONTROL_HCFS_MASK == CONTROL_HCFS_OPERATIONAL
    }

    pub fn hcca(&self) -> u32 {
        self.hcca
    }

    pub fn list_head(&self, class: TransferClass) -> u32 {
        match class {
            TransferClass::Control => self.control_head_ed,
            TransferClass::Bulk => self.bulk_head_ed,
            TransferClass::Interrupt => 0,
        }
    }

    pub fn current_ed(&self, class: TransferClass) -> u32 {
        match class {
            TransferClass::Control => self.control_current_ed,
            TransferClass::Bulk => self.bulk_current_ed,
            TransferClass::Interrupt => self.period_current_ed,
        }
    }

    pub(crate) fn set_current_ed(&mut self, class: TransferClass, ed: u32) {
        let ed = ed & LIST_PTR_MASK;
        match class {
            TransferClass::Control => self.control_current_ed = ed,
            TransferClass::Bulk => self.bulk_current_ed = ed,
            TransferClass::Interrupt => self.period_current_ed = ed,
        }
    }

    fn filled_bit(class: TransferClass) -> u32 {
        match class {
            TransferClass::Control => COMMAND_CLF,
            TransferClass::Bulk => COMMAND_BLF,
            TransferClass::Interrupt => 0,
        }
    }

    pub fn list_filled(&self, class: TransferClass) -> bool {
        self.command_status & Self::filled_bit(class) != 0
    }

    pub(crate) fn set_list_filled(&mut self, class: TransferClass, filled: bool) {
        let bit = Self::filled_bit(class);
        if filled {
            self.command_status |= bit;
        } else {
            self.command_status &= !bit;
        }
    }

    pub(crate) fn clear_reset_request(&mut self) {
        self.command_status &= !COMMAND_HCR;
    }

    pub fn done_head(&self) -> u32 {
        self.done_head
    }

    pub(crate) fn set_done_head(&mut self, td: u32) {
        self.done_head = td;
    }

    pub fn port(&self) -> &RootPort {
        &self.port
    }

    pub(crate) fn port_mut(&mut self) -> &mut RootPort {
        &mut self.port
    }

    /// Advances the frame counter by one frame. Returns the new frame number for the HCCA, or
    /// `None` while the controller is not operational.
    pub(crate) fn advance_frame(&mut self) -> Option<u16> {
        if !self.operational() {
            return None;
        }
        let prev = self.fm_number;
        let next = prev.wrapping_add(1) & FM_NUMBER_MASK;
        self.fm_number = next;
        self.raise(InterruptFlags::SF);
        if (prev ^ next) & 0x8000 != 0 {
            self.raise(InterruptFlags::FNO);
        }
        Some(next as u16)
    }
}
