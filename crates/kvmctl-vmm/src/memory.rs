//! Guest physical memory.
//!
//! [`GuestMemoryManager`] allocates one `mmap`-backed range per recorded
//! memory slot and gives the rest of the crate bounds-checked physical
//! reads and writes plus whole-slot dump and restore for snapshots.
//!
//! ```no_run
//! use kvmctl_vmm::memory::GuestMemoryManager;
//! use kvmctl_vmm::record::MemoryRegionRecord;
//!
//! let slot0 = MemoryRegionRecord::new(0, 0, 0x10_0000);
//! let mem = GuestMemoryManager::new(&[slot0]).unwrap();
//! mem.write(0x1000, &[0x90, 0xf4]).unwrap();
//! let image = mem.dump_region(&slot0).unwrap();
//! mem.restore_region(&slot0, &image).unwrap();
//! ```

use crate::record::MemoryRegionRecord;
use log::{debug, info};
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to create guest memory ({size} bytes total)")]
    Create { size: u64 },

    #[error("Memory map is empty")]
    NoRegions,

    #[error("Memory slot {slot} runs past the top of the address space")]
    Wraps { slot: u32 },

    #[error("Memory slot {slot} overlaps slot {other}")]
    Overlap { slot: u32, other: u32 },

    #[error("Failed to read {len} bytes of guest memory at {address:#x}")]
    Read { address: u64, len: usize },

    #[error("Failed to write {len} bytes of guest memory at {address:#x}")]
    Write { address: u64, len: usize },

    #[error("Slot {slot} image is {actual} bytes, expected {expected}")]
    SizeMismatch {
        slot: u32,
        expected: u64,
        actual: usize,
    },

    #[error("No memory slot {slot}")]
    UnknownSlot { slot: u32 },

    #[error("Slot {slot} has no host mapping")]
    HostAddress { slot: u32 },
}

/// Owns the guest's physical memory and the slot layout it was built from.
///
/// `vm-memory` mappings use interior mutability, so writes take `&self`.
#[derive(Clone, Debug)]
pub struct GuestMemoryManager {
    memory: GuestMemoryMmap,
    regions: Vec<MemoryRegionRecord>,
}

impl GuestMemoryManager {
    /// Allocate zeroed memory for every region in `regions`.
    pub fn new(regions: &[MemoryRegionRecord]) -> Result<Self, MemoryError> {
        if regions.is_empty() {
            return Err(MemoryError::NoRegions);
        }
        if let Some(r) = regions
            .iter()
            .find(|r| r.guest_phys_addr.checked_add(r.memory_size).is_none())
        {
            return Err(MemoryError::Wraps { slot: r.slot });
        }
        for (i, a) in regions.iter().enumerate() {
            if let Some(b) = regions[i + 1..].iter().find(|b| {
                a.guest_phys_addr < b.end() && b.guest_phys_addr < a.end()
            }) {
                return Err(MemoryError::Overlap {
                    slot: a.slot,
                    other: b.slot,
                });
            }
        }

        let mut ranges: Vec<(GuestAddress, usize)> = regions
            .iter()
            .map(|r| (GuestAddress(r.guest_phys_addr), r.memory_size as usize))
            .collect();
        ranges.sort_by_key(|(addr, _)| addr.0);
        let total: u64 = regions.iter().map(|r| r.memory_size).sum();
        let memory =
            GuestMemoryMmap::from_ranges(&ranges).map_err(|_| MemoryError::Create { size: total })?;

        info!(
            "Guest memory created: {} slot(s), {} KiB",
            regions.len(),
            total / 1024
        );

        Ok(Self {
            memory,
            regions: regions.to_vec(),
        })
    }

    /// A single slot 0 region of `size` bytes at guest physical 0.
    pub fn flat(size: u64) -> Result<Self, MemoryError> {
        Self::new(&[MemoryRegionRecord::new(0, 0, size)])
    }

    pub fn read(&self, gpa: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.memory
            .read_slice(buf, GuestAddress(gpa))
            .map_err(|_| MemoryError::Read {
                address: gpa,
                len: buf.len(),
            })
    }

    pub fn write(&self, gpa: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.memory
            .write_slice(data, GuestAddress(gpa))
            .map_err(|_| MemoryError::Write {
                address: gpa,
                len: data.len(),
            })
    }

    /// Copy out the full contents of one slot.
    pub fn dump_region(&self, region: &MemoryRegionRecord) -> Result<Vec<u8>, MemoryError> {
        let mut data = vec![0u8; region.memory_size as usize];
        self.read(region.guest_phys_addr, &mut data)?;
        Ok(data)
    }

    /// Overwrite one slot with a previously dumped image.
    pub fn restore_region(
        &self,
        region: &MemoryRegionRecord,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        if data.len() as u64 != region.memory_size {
            return Err(MemoryError::SizeMismatch {
                slot: region.slot,
                expected: region.memory_size,
                actual: data.len(),
            });
        }
        self.write(region.guest_phys_addr, data)?;
        debug!(
            "Restored slot {} ({} bytes at {:#x})",
            region.slot, region.memory_size, region.guest_phys_addr
        );
        Ok(())
    }

    /// Host virtual address backing the start of `region`.
    pub fn host_address(&self, region: &MemoryRegionRecord) -> Result<u64, MemoryError> {
        self.memory
            .get_host_address(GuestAddress(region.guest_phys_addr))
            .map(|p| p as u64)
            .map_err(|_| MemoryError::HostAddress { slot: region.slot })
    }

    pub fn region(&self, slot: u32) -> Result<&MemoryRegionRecord, MemoryError> {
        self.regions
            .iter()
            .find(|r| r.slot == slot)
            .ok_or(MemoryError::UnknownSlot { slot })
    }

    /// The slot containing guest physical address `gpa`.
    pub fn region_for(&self, gpa: u64) -> Option<&MemoryRegionRecord> {
        self.regions.iter().find(|r| r.contains(gpa))
    }

    pub fn regions(&self) -> &[MemoryRegionRecord] {
        &self.regions
    }

    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    pub fn size(&self) -> u64 {
        self.regions.iter().map(|r| r.memory_size).sum()
    }
}
