//! Endpoint and Transfer Descriptor model.
//!
//! EDs and TDs are owned by the host stack and live in [`GuestMemory`]. The controller decodes
//! them into plain structs, works on the decoded copy, and only writes back the fields it owns:
//! the ED head pointer word (halted / toggle-carry / head TD) and skip bit, and the TD control
//! word, buffer pointer and next link.
//!
//! Every pointer taken from host-stack memory is validated before it is dereferenced: null,
//! misaligned, out-of-arena and self-referential links are reported as [`DescriptorError`]s, and
//! list walks are bounded and cycle-checked.

use std::collections::HashSet;

use crate::error::DescriptorError;
use crate::memory::GuestMemory;

pub const ED_SIZE: usize = 16;
pub const TD_SIZE: usize = 16;

/// Max number of EDs visited in a single list walk.
///
/// Lists are host-stack controlled; this keeps a scan pass bounded even if a list is corrupt.
pub const MAX_ED_VISITS: usize = 1024;

/// Longest TD buffer: `cbp..=be` may cross at most one 4 KiB page boundary.
pub const MAX_TD_BUFFER: usize = 8192;

/// TD error count written back when a transfer attempt fails.
pub const TD_ERROR_COUNT_EXCEEDED: u8 = 0b11;

const DESCRIPTOR_ALIGN_MASK: u32 = 0xf;
const LINK_ADDR_MASK: u32 = !DESCRIPTOR_ALIGN_MASK;

// ED dword 0.
const ED_FA_MASK: u32 = 0x7f;
const ED_EN_SHIFT: u32 = 7;
const ED_EN_MASK: u32 = 0xf << ED_EN_SHIFT;
const ED_D_SHIFT: u32 = 11;
const ED_D_MASK: u32 = 0b11 << ED_D_SHIFT;
const ED_S: u32 = 1 << 13;
const ED_K: u32 = 1 << 14;
const ED_F: u32 = 1 << 15;
const ED_MPS_SHIFT: u32 = 16;
const ED_MPS_MASK: u32 = 0x7ff << ED_MPS_SHIFT;

// ED dword 2.
const ED_HEAD_HALTED: u32 = 1 << 0;
const ED_HEAD_TOGGLE_CARRY: u32 = 1 << 1;

// TD dword 0.
const TD_DP_SHIFT: u32 = 19;
const TD_DP_MASK: u32 = 0b11 << TD_DP_SHIFT;
const TD_T_DATA: u32 = 1 << 24;
const TD_T_FROM_TD: u32 = 1 << 25;
const TD_EC_SHIFT: u32 = 26;
const TD_EC_MASK: u32 = 0b11 << TD_EC_SHIFT;
const TD_CC_SHIFT: u32 = 28;
const TD_CC_MASK: u32 = 0xf << TD_CC_SHIFT;

/// The three transfer classes serviced by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferClass {
    Control,
    Bulk,
    Interrupt,
}

/// Logical direction of a single TD.
///
/// The discriminants match the OHCI `DP`/`D` encodings (SETUP 0, OUT 1, IN 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Setup = 0,
    Out = 1,
    In = 2,
}

impl TransferDirection {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0b00 => Some(Self::Setup),
            0b01 => Some(Self::Out),
            0b10 => Some(Self::In),
            _ => None,
        }
    }
}

/// ED `D` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdDirection {
    FromTd,
    Out,
    In,
}

/// OHCI TD condition codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    NoError,
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    DeviceNotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    NotAccessed,
    Reserved(u8),
}

impl ConditionCode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0xf {
            0 => Self::NoError,
            1 => Self::Crc,
            2 => Self::BitStuffing,
            3 => Self::DataToggleMismatch,
            4 => Self::Stall,
            5 => Self::DeviceNotResponding,
            6 => Self::PidCheckFailure,
            7 => Self::UnexpectedPid,
            8 => Self::DataOverrun,
            9 => Self::DataUnderrun,
            12 => Self::BufferOverrun,
            13 => Self::BufferUnderrun,
            14 | 15 => Self::NotAccessed,
            other => Self::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::Crc => 1,
            Self::BitStuffing => 2,
            Self::DataToggleMismatch => 3,
            Self::Stall => 4,
            Self::DeviceNotResponding => 5,
            Self::PidCheckFailure => 6,
            Self::UnexpectedPid => 7,
            Self::DataOverrun => 8,
            Self::DataUnderrun => 9,
            Self::BufferOverrun => 12,
            Self::BufferUnderrun => 13,
            Self::NotAccessed => 15,
            Self::Reserved(bits) => bits & 0xf,
        }
    }
}

/// Validates a descriptor pointer taken from host-stack memory.
pub fn check_descriptor_ptr(
    mem: &dyn GuestMemory,
    addr: u32,
    size: usize,
) -> Result<u32, DescriptorError> {
    if addr & DESCRIPTOR_ALIGN_MASK != 0 {
        return Err(DescriptorError::Misaligned(addr));
    }
    if addr == 0 || !mem.contains(addr, size) {
        return Err(DescriptorError::OutOfArena(addr));
    }
    Ok(addr)
}

/// ED dword 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdControl(pub u32);

impl EdControl {
    pub fn function_address(self) -> u8 {
        (self.0 & ED_FA_MASK) as u8
    }

    pub fn endpoint_number(self) -> u8 {
        ((self.0 & ED_EN_MASK) >> ED_EN_SHIFT) as u8
    }

    pub fn direction(self) -> EdDirection {
        match (self.0 & ED_D_MASK) >> ED_D_SHIFT {
            0b01 => EdDirection::Out,
            0b10 => EdDirection::In,
            _ => EdDirection::FromTd,
        }
    }

    pub fn low_speed(self) -> bool {
        self.0 & ED_S != 0
    }

    pub fn skip(self) -> bool {
        self.0 & ED_K != 0
    }

    pub fn isochronous(self) -> bool {
        self.0 & ED_F != 0
    }

    pub fn max_packet_size(self) -> u16 {
        ((self.0 & ED_MPS_MASK) >> ED_MPS_SHIFT) as u16
    }

    pub fn with_skip(self, skip: bool) -> Self {
        if skip {
            Self(self.0 | ED_K)
        } else {
            Self(self.0 & !ED_K)
        }
    }
}

/// ED head pointer word: TD pointer with the halted and toggle-carry flags packed into its low
/// bits. Kept unpacked everywhere except [`HeadPointer::decode`] / [`HeadPointer::encode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadPointer {
    pub addr: u32,
    pub halted: bool,
    pub toggle_carry: bool,
}

impl HeadPointer {
    pub fn decode(raw: u32) -> Self {
        Self {
            addr: raw & LINK_ADDR_MASK,
            halted: raw & ED_HEAD_HALTED != 0,
            toggle_carry: raw & ED_HEAD_TOGGLE_CARRY != 0,
        }
    }

    pub fn encode(self) -> u32 {
        let mut raw = self.addr & LINK_ADDR_MASK;
        if self.halted {
            raw |= ED_HEAD_HALTED;
        }
        if self.toggle_carry {
            raw |= ED_HEAD_TOGGLE_CARRY;
        }
        raw
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub control: EdControl,
    pub tail: u32,
    pub head: HeadPointer,
    pub next: u32,
}

impl EndpointDescriptor {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorError> {
        let addr = check_descriptor_ptr(mem, addr, ED_SIZE)?;
        let mut raw = [0u8; ED_SIZE];
        mem.read_physical(addr, &mut raw)?;
        let dword = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let ed = Self {
            control: EdControl(dword(0)),
            tail: dword(4) & LINK_ADDR_MASK,
            head: HeadPointer::decode(dword(8)),
            next: dword(12) & LINK_ADDR_MASK,
        };
        if ed.next == addr {
            return Err(DescriptorError::SelfLink(addr));
        }
        Ok(ed)
    }

    /// Writes back the head pointer word. This is the only ED dword (besides the skip bit) the
    /// controller ever modifies.
    pub fn write_head(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorError> {
        mem.write_u32(addr + 8, self.head.encode())?;
        Ok(())
    }

    pub fn write_skip(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorError> {
        mem.write_u32(addr, self.control.0)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.head.addr == self.tail
    }

    /// An ED is runnable when it is neither skipped nor halted and its TD queue is non-empty.
    pub fn runnable(&self) -> bool {
        !self.control.skip() && !self.head.halted && !self.is_empty()
    }

    /// Direction of `td` when executed on behalf of this ED.
    ///
    /// Control endpoints take the direction from each TD's PID field; for other classes the ED
    /// field is authoritative unless it defers to the TD.
    pub fn resolve_direction(
        &self,
        class: TransferClass,
        td: &TransferDescriptor,
    ) -> Option<TransferDirection> {
        if class == TransferClass::Control {
            return td.control.direction();
        }
        match self.control.direction() {
            EdDirection::Out => Some(TransferDirection::Out),
            EdDirection::In => Some(TransferDirection::In),
            EdDirection::FromTd => td.control.direction(),
        }
    }
}

/// TD dword 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TdControl(pub u32);

impl TdControl {
    pub fn direction(self) -> Option<TransferDirection> {
        TransferDirection::from_bits((self.0 & TD_DP_MASK) >> TD_DP_SHIFT)
    }

    /// Data toggle carried by the TD itself (`T` = 1x), if any.
    pub fn explicit_toggle(self) -> Option<bool> {
        (self.0 & TD_T_FROM_TD != 0).then_some(self.0 & TD_T_DATA != 0)
    }

    pub fn error_count(self) -> u8 {
        ((self.0 & TD_EC_MASK) >> TD_EC_SHIFT) as u8
    }

    pub fn condition_code(self) -> ConditionCode {
        ConditionCode::from_bits(((self.0 & TD_CC_MASK) >> TD_CC_SHIFT) as u8)
    }

    pub fn with_toggle(self, toggle: bool) -> Self {
        let mut raw = self.0 | TD_T_FROM_TD;
        if toggle {
            raw |= TD_T_DATA;
        } else {
            raw &= !TD_T_DATA;
        }
        Self(raw)
    }

    pub fn with_error_count(self, count: u8) -> Self {
        Self((self.0 & !TD_EC_MASK) | ((u32::from(count) << TD_EC_SHIFT) & TD_EC_MASK))
    }

    pub fn with_condition_code(self, cc: ConditionCode) -> Self {
        Self((self.0 & !TD_CC_MASK) | (u32::from(cc.bits()) << TD_CC_SHIFT))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub control: TdControl,
    /// Current buffer pointer; zero once the buffer has been fully consumed.
    pub cbp: u32,
    pub next: u32,
    /// Address of the last byte of the buffer.
    pub be: u32,
}

impl TransferDescriptor {
    pub fn read(mem: &dyn GuestMemory, addr: u32) -> Result<Self, DescriptorError> {
        let addr = check_descriptor_ptr(mem, addr, TD_SIZE)?;
        let mut raw = [0u8; TD_SIZE];
        mem.read_physical(addr, &mut raw)?;
        let dword = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let td = Self {
            control: TdControl(dword(0)),
            cbp: dword(4),
            next: dword(8) & LINK_ADDR_MASK,
            be: dword(12),
        };
        if td.next == addr {
            return Err(DescriptorError::SelfLink(addr));
        }
        Ok(td)
    }

    pub fn write(&self, mem: &dyn GuestMemory, addr: u32) -> Result<(), DescriptorError> {
        let mut raw = [0u8; TD_SIZE];
        raw[0..4].copy_from_slice(&self.control.0.to_le_bytes());
        raw[4..8].copy_from_slice(&self.cbp.to_le_bytes());
        raw[8..12].copy_from_slice(&self.next.to_le_bytes());
        raw[12..16].copy_from_slice(&self.be.to_le_bytes());
        mem.write_physical(addr, &raw)?;
        Ok(())
    }

    /// Number of bytes still to transfer: `be - cbp + 1`, or zero for a null buffer.
    pub fn length(&self) -> Result<usize, DescriptorError> {
        if self.cbp == 0 {
            return Ok(0);
        }
        // A buffer that has been consumed up to `be` leaves cbp one past it.
        if self.cbp == self.be.wrapping_add(1) {
            return Ok(0);
        }
        let bad_range = DescriptorError::BufferRange {
            cbp: self.cbp,
            be: self.be,
        };
        if self.be < self.cbp {
            return Err(bad_range);
        }
        let len = (self.be - self.cbp) as usize + 1;
        if len > MAX_TD_BUFFER {
            return Err(bad_range);
        }
        Ok(len)
    }
}

/// Walks an ED list starting at `head`, returning the ED addresses in link order.
pub fn walk_ed_list(mem: &dyn GuestMemory, head: u32) -> Result<Vec<u32>, DescriptorError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut addr = head;
    while addr != 0 {
        if out.len() >= MAX_ED_VISITS {
            return Err(DescriptorError::ListTooLong(MAX_ED_VISITS));
        }
        if !seen.insert(addr) {
            return Err(DescriptorError::Cycle(addr));
        }
        let ed = EndpointDescriptor::read(mem, addr)?;
        out.push(addr);
        addr = ed.next;
    }
    Ok(out)
}
