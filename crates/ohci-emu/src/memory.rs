//! Descriptor memory shared between the host stack and the controller.
//!
//! OHCI descriptors (EDs, TDs, the HCCA) and transfer buffers live in memory owned by the host
//! stack. Every worker and the dispatcher access that memory concurrently, so accessors take
//! `&self` and implementations provide their own interior synchronisation.

use std::sync::{Mutex, MutexGuard};

use crate::error::MemoryError;

/// Physical memory as seen by the emulated controller.
pub trait GuestMemory: Send + Sync {
    fn read_physical(&self, paddr: u32, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn write_physical(&self, paddr: u32, buf: &[u8]) -> Result<(), MemoryError>;

    /// Returns true when `len` bytes starting at `paddr` are backed by this memory.
    fn contains(&self, paddr: u32, len: usize) -> bool;

    fn read_u16(&self, paddr: u32) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn write_u16(&self, paddr: u32, value: u16) -> Result<(), MemoryError> {
        self.write_physical(paddr, &value.to_le_bytes())
    }

    fn read_u32(&self, paddr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, paddr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &value.to_le_bytes())
    }
}

/// A contiguous RAM region starting at `base`.
///
/// This is the descriptor arena handed to the controller: every ED/TD/HCCA pointer the host stack
/// programs must fall inside it.
#[derive(Debug)]
pub struct DescriptorRam {
    base: u32,
    data: Mutex<Vec<u8>>,
}

impl DescriptorRam {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: Mutex::new(vec![0; size]),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn range(&self, paddr: u32, len: usize, size: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let err = MemoryError { addr: paddr, len };
        let start = paddr.checked_sub(self.base).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        if end > size {
            return Err(err);
        }
        Ok(start..end)
    }
}

impl GuestMemory for DescriptorRam {
    fn read_physical(&self, paddr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let data = self.lock();
        let range = self.range(paddr, buf.len(), data.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    fn write_physical(&self, paddr: u32, buf: &[u8]) -> Result<(), MemoryError> {
        let mut data = self.lock();
        let range = self.range(paddr, buf.len(), data.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }

    fn contains(&self, paddr: u32, len: usize) -> bool {
        let size = self.lock().len();
        self.range(paddr, len, size).is_ok()
    }
}
