//! Address Space - user memory regions of a process
//!
//! Regions are page-granular, never overlap and are backed by kernel heap
//! memory, so duplication on fork is a full copy.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::PAGE_SIZE;
use crate::error::{KernResult, KernelError};

// ============================================================================
// Protection
// ============================================================================

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmProt(u32);

impl VmProt {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1);
    pub const WRITE: Self = Self(2);
    pub const EXECUTE: Self = Self(4);
    /// READ | WRITE
    pub const DEFAULT: Self = Self(3);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

// ============================================================================
// Region
// ============================================================================

/// One contiguous mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    start: usize,
    prot: VmProt,
    data: Vec<u8>,
}

impl Region {
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.data.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn prot(&self) -> VmProt {
        self.prot
    }

    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.start < end
    }

    fn try_clone(&self) -> KernResult<Region> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())?;
        data.extend_from_slice(&self.data);
        Ok(Region {
            start: self.start,
            prot: self.prot,
            data,
        })
    }
}

pub(crate) fn page_round_up(len: usize) -> Option<usize> {
    len.checked_add(PAGE_SIZE - 1).map(|l| l & !(PAGE_SIZE - 1))
}

// ============================================================================
// Address Space
// ============================================================================

/// Set of mappings owned by one process
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: BTreeMap<usize, Region>,
}

impl AddressSpace {
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Map `len` zeroed bytes (rounded up to whole pages) at `start`
    pub fn map(&mut self, start: usize, len: usize, prot: VmProt) -> KernResult<()> {
        if len == 0 || start % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let size = page_round_up(len).ok_or(KernelError::InvalidArgument)?;
        let end = start.checked_add(size).ok_or(KernelError::InvalidArgument)?;
        if self.regions.values().any(|r| r.overlaps(start, end)) {
            return Err(KernelError::InvalidArgument);
        }

        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        self.regions.insert(start, Region { start, prot, data });
        Ok(())
    }

    /// Remove the region starting at `start`
    pub fn unmap(&mut self, start: usize) -> KernResult<()> {
        self.regions
            .remove(&start)
            .map(|_| ())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Lowest page-aligned gap of `len` bytes at or above `min`
    pub fn find_free(&self, min: usize, len: usize) -> Option<usize> {
        let size = page_round_up(len)?;
        let mut candidate = page_round_up(min)?;
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            if region.start() >= candidate.checked_add(size)? {
                break;
            }
            candidate = region.end();
        }
        candidate.checked_add(size).map(|_| candidate)
    }

    fn region_for(&self, addr: usize, len: usize) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains_range(addr, len))
    }

    fn region_for_mut(&mut self, addr: usize, len: usize) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains_range(addr, len))
    }

    /// Whether `[addr, addr + len)` lies inside a single mapping
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        self.region_for(addr, len.max(1)).is_some()
    }

    /// Copy `bytes` into user memory at `addr`
    pub fn write(&mut self, addr: usize, bytes: &[u8]) -> KernResult<()> {
        let region = self
            .region_for_mut(addr, bytes.len())
            .ok_or(KernelError::Fault)?;
        let offset = addr - region.start;
        region.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes of user memory at `addr`
    pub fn read(&self, addr: usize, len: usize) -> KernResult<Vec<u8>> {
        let region = self.region_for(addr, len).ok_or(KernelError::Fault)?;
        let offset = addr - region.start;
        let mut out = Vec::new();
        out.try_reserve_exact(len)?;
        out.extend_from_slice(&region.data[offset..offset + len]);
        Ok(out)
    }

    pub fn write_usize(&mut self, addr: usize, value: usize) -> KernResult<()> {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn read_usize(&self, addr: usize) -> KernResult<usize> {
        let bytes = self.read(addr, core::mem::size_of::<usize>())?;
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(raw))
    }

    /// Full copy for fork
    pub fn try_clone(&self) -> KernResult<AddressSpace> {
        let mut regions = BTreeMap::new();
        for (start, region) in &self.regions {
            regions.insert(*start, region.try_clone()?);
        }
        Ok(AddressSpace { regions })
    }

    /// Drop every mapping
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
