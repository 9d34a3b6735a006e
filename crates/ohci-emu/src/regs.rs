//! OHCI register definitions.
//!
//! This module models the OHCI operational register block (OHCI 1.0a, section 7) as seen by a
//! host stack through word-sized MMIO accesses, plus the bit layouts of the registers whose writes
//! carry side effects.

use bitflags::bitflags;

/// Size of the OHCI MMIO register window.
pub const MMIO_SIZE: u32 = 0x100;

/// Revision reported through `HcRevision` (OHCI 1.0).
pub const OHCI_REVISION: u32 = 0x10;

// Operational registers (offsets from the register window base).
pub const REG_REVISION: u32 = 0x00;
pub const REG_CONTROL: u32 = 0x04;
pub const REG_COMMAND_STATUS: u32 = 0x08;
pub const REG_INTERRUPT_STATUS: u32 = 0x0c;
pub const REG_INTERRUPT_ENABLE: u32 = 0x10;
pub const REG_INTERRUPT_DISABLE: u32 = 0x14;
pub const REG_HCCA: u32 = 0x18;
pub const REG_PERIOD_CURRENT_ED: u32 = 0x1c;
pub const REG_CONTROL_HEAD_ED: u32 = 0x20;
pub const REG_CONTROL_CURRENT_ED: u32 = 0x24;
pub const REG_BULK_HEAD_ED: u32 = 0x28;
pub const REG_BULK_CURRENT_ED: u32 = 0x2c;
pub const REG_DONE_HEAD: u32 = 0x30;
pub const REG_FM_INTERVAL: u32 = 0x34;
pub const REG_FM_REMAINING: u32 = 0x38;
pub const REG_FM_NUMBER: u32 = 0x3c;
pub const REG_PERIODIC_START: u32 = 0x40;
pub const REG_LS_THRESHOLD: u32 = 0x44;
pub const REG_RH_DESCRIPTOR_A: u32 = 0x48;
pub const REG_RH_DESCRIPTOR_B: u32 = 0x4c;
pub const REG_RH_STATUS: u32 = 0x50;
pub const REG_RH_PORT_STATUS_BASE: u32 = 0x54;

/// Number of root hub ports exposed. The native peripheral drives a single port.
pub const ROOT_PORT_COUNT: usize = 1;

pub const fn reg_rh_port_status(port: usize) -> u32 {
    REG_RH_PORT_STATUS_BASE + (port as u32) * 4
}

// HcControl bits.
pub const CONTROL_CBSR_MASK: u32 = 0b11;
pub const CONTROL_PLE: u32 = 1 << 2;
pub const CONTROL_IE: u32 = 1 << 3;
pub const CONTROL_CLE: u32 = 1 << 4;
pub const CONTROL_BLE: u32 = 1 << 5;
pub const CONTROL_HCFS_SHIFT: u32 = 6;
pub const CONTROL_HCFS_MASK: u32 = 0b11 << CONTROL_HCFS_SHIFT;
pub const CONTROL_HCFS_RESET: u32 = 0b00 << CONTROL_HCFS_SHIFT;
pub const CONTROL_HCFS_RESUME: u32 = 0b01 << CONTROL_HCFS_SHIFT;
pub const CONTROL_HCFS_OPERATIONAL: u32 = 0b10 << CONTROL_HCFS_SHIFT;
pub const CONTROL_HCFS_SUSPEND: u32 = 0b11 << CONTROL_HCFS_SHIFT;
pub const CONTROL_IR: u32 = 1 << 8;
pub const CONTROL_RWC: u32 = 1 << 9;
pub const CONTROL_RWE: u32 = 1 << 10;

// HcCommandStatus bits.
pub const COMMAND_HCR: u32 = 1 << 0;
pub const COMMAND_CLF: u32 = 1 << 1;
pub const COMMAND_BLF: u32 = 1 << 2;
pub const COMMAND_OCR: u32 = 1 << 3;
/// Scheduling Overrun Count, read-only to the host stack.
pub const COMMAND_SOC_MASK: u32 = 0b11 << 16;

bitflags! {
    /// Interrupt sources shared by `HcInterruptStatus`, `HcInterruptEnable` and
    /// `HcInterruptDisable`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptFlags: u32 {
        /// SchedulingOverrun.
        const SO = 1 << 0;
        /// WritebackDoneHead.
        const WDH = 1 << 1;
        /// StartofFrame.
        const SF = 1 << 2;
        /// ResumeDetected.
        const RD = 1 << 3;
        /// UnrecoverableError.
        const UE = 1 << 4;
        /// FrameNumberOverflow.
        const FNO = 1 << 5;
        /// RootHubStatusChange.
        const RHSC = 1 << 6;
        /// OwnershipChange.
        const OC = 1 << 30;
        /// MasterInterruptEnable (enable/disable registers only).
        const MIE = 1 << 31;
    }
}

/// Status bits that can be latched in `HcInterruptStatus`.
pub const INTERRUPT_STATUS_MASK: u32 = InterruptFlags::all().bits() & !InterruptFlags::MIE.bits();

// HcFmInterval / HcFmNumber.
pub const FM_INTERVAL_DEFAULT: u32 = 0x2778_2edf;
pub const FM_NUMBER_MASK: u32 = 0xffff;
pub const LS_THRESHOLD_DEFAULT: u32 = 0x628;

// HcRhDescriptorA.
pub const RH_DESCRIPTOR_A_NDP_MASK: u32 = 0xff;
pub const RH_DESCRIPTOR_A_NPS: u32 = 1 << 9;
pub const RH_DESCRIPTOR_A_POTPGT_SHIFT: u32 = 24;
pub const RH_DESCRIPTOR_A_DEFAULT: u32 =
    (2 << RH_DESCRIPTOR_A_POTPGT_SHIFT) | RH_DESCRIPTOR_A_NPS | ROOT_PORT_COUNT as u32;

// HcRhStatus bits.
pub const RH_STATUS_LPS: u32 = 1 << 0;
pub const RH_STATUS_OCI: u32 = 1 << 1;
pub const RH_STATUS_DRWE: u32 = 1 << 15;
pub const RH_STATUS_LPSC: u32 = 1 << 16;
pub const RH_STATUS_OCIC: u32 = 1 << 17;
pub const RH_STATUS_CRWE: u32 = 1 << 31;

// HcRhPortStatus read bits.
pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PES: u32 = 1 << 1;
pub const PORT_PSS: u32 = 1 << 2;
pub const PORT_POCI: u32 = 1 << 3;
pub const PORT_PRS: u32 = 1 << 4;
pub const PORT_PPS: u32 = 1 << 8;
pub const PORT_LSDA: u32 = 1 << 9;
pub const PORT_CSC: u32 = 1 << 16;
pub const PORT_PESC: u32 = 1 << 17;
pub const PORT_PSSC: u32 = 1 << 18;
pub const PORT_OCIC: u32 = 1 << 19;
pub const PORT_PRSC: u32 = 1 << 20;

pub const PORT_CHANGE_MASK: u32 = PORT_CSC | PORT_PESC | PORT_PSSC | PORT_OCIC | PORT_PRSC;

// HcRhPortStatus write commands. These alias the read bits at the same positions.
pub const PORT_WRITE_CLEAR_ENABLE: u32 = 1 << 0;
pub const PORT_WRITE_SET_ENABLE: u32 = 1 << 1;
pub const PORT_WRITE_SET_SUSPEND: u32 = 1 << 2;
pub const PORT_WRITE_CLEAR_SUSPEND: u32 = 1 << 3;
pub const PORT_WRITE_SET_RESET: u32 = 1 << 4;
pub const PORT_WRITE_SET_POWER: u32 = 1 << 8;
pub const PORT_WRITE_CLEAR_POWER: u32 = 1 << 9;
