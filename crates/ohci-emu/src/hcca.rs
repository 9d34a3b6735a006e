//! Host Controller Communication Area.
//!
//! The HCCA is a 256-byte, 256-byte aligned block in host-stack memory holding the periodic
//! interrupt table, the current frame number and the done-queue head written back by the
//! controller.

use crate::descriptor::walk_ed_list;
use crate::error::DescriptorError;
use crate::memory::GuestMemory;

pub const HCCA_SIZE: usize = 256;
pub const HCCA_ALIGN_MASK: u32 = 0xff;

/// Number of heads in the periodic interrupt table.
pub const INTERRUPT_TABLE_LEN: usize = 32;

const HCCA_FRAME_NUMBER: u32 = 0x80;
const HCCA_DONE_HEAD: u32 = 0x84;

/// A view of the HCCA at a given base address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hcca {
    base: u32,
}

impl Hcca {
    /// Returns `None` when the host stack has not programmed a usable HCCA yet.
    pub fn at(mem: &dyn GuestMemory, base: u32) -> Option<Self> {
        (base != 0 && base & HCCA_ALIGN_MASK == 0 && mem.contains(base, HCCA_SIZE))
            .then_some(Self { base })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn interrupt_head(&self, mem: &dyn GuestMemory, slot: usize) -> Result<u32, DescriptorError> {
        let slot = (slot % INTERRUPT_TABLE_LEN) as u32;
        Ok(mem.read_u32(self.base + slot * 4)? & !0xf)
    }

    pub fn write_frame_number(&self, mem: &dyn GuestMemory, frame: u16) -> Result<(), DescriptorError> {
        mem.write_u16(self.base + HCCA_FRAME_NUMBER, frame)?;
        // Pad1 is cleared whenever the frame number is updated.
        mem.write_u16(self.base + HCCA_FRAME_NUMBER + 2, 0)?;
        Ok(())
    }

    pub fn frame_number(&self, mem: &dyn GuestMemory) -> Result<u16, DescriptorError> {
        Ok(mem.read_u16(self.base + HCCA_FRAME_NUMBER)?)
    }

    pub fn write_done_head(&self, mem: &dyn GuestMemory, value: u32) -> Result<(), DescriptorError> {
        mem.write_u32(self.base + HCCA_DONE_HEAD, value)?;
        Ok(())
    }

    pub fn done_head(&self, mem: &dyn GuestMemory) -> Result<u32, DescriptorError> {
        Ok(mem.read_u32(self.base + HCCA_DONE_HEAD)?)
    }

    /// Counts the interrupt table slots whose ED chain reaches `ed`.
    ///
    /// OHCI host stacks build the interrupt tree so that an endpoint polled every `n` frames is
    /// reachable from `32 / n` slots; this recovers that load factor from the table.
    pub fn reachable_slots(&self, mem: &dyn GuestMemory, ed: u32) -> Result<usize, DescriptorError> {
        let mut count = 0;
        for slot in 0..INTERRUPT_TABLE_LEN {
            let head = self.interrupt_head(mem, slot)?;
            if walk_ed_list(mem, head)?.contains(&ed) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DescriptorRam;

    #[test]
    fn rejects_unaligned_or_missing_hcca() {
        let mem = DescriptorRam::new(0x1000, 0x1000);
        assert!(Hcca::at(&mem, 0).is_none());
        assert!(Hcca::at(&mem, 0x1080).is_none());
        assert!(Hcca::at(&mem, 0x1f00).is_some());
        assert!(Hcca::at(&mem, 0x2000).is_none());
    }

    #[test]
    fn counts_reachable_slots_through_shared_tails() {
        let mem = DescriptorRam::new(0x1000, 0x1000);
        let hcca = Hcca::at(&mem, 0x1000).unwrap();

        // Two leaf EDs, each in half of the slots, both linking to a shared tail ED.
        let (left, right, tail) = (0x1100, 0x1110, 0x1120);
        mem.write_u32(left + 12, tail).unwrap();
        mem.write_u32(right + 12, tail).unwrap();
        for slot in 0..INTERRUPT_TABLE_LEN as u32 {
            let head = if slot % 2 == 0 { left } else { right };
            mem.write_u32(0x1000 + slot * 4, head).unwrap();
        }

        assert_eq!(hcca.reachable_slots(&mem, left).unwrap(), 16);
        assert_eq!(hcca.reachable_slots(&mem, tail).unwrap(), 32);
        assert_eq!(hcca.reachable_slots(&mem, 0x1130).unwrap(), 0);
    }
}
