//! VM-global hypervisor configuration records.
//!
//! A [`VmRecord`] describes everything that was configured on the VM file
//! descriptor, so that an equivalent VM can be rebuilt later.  Every field
//! is optional: `None` (or an absent [`RecordList`]) means "never
//! configured", which is distinct from a configured zero.
//!
//! Variable-length sub-lists are kept in [`RecordList`]s.  Recording an
//! entry marks the list present; unrecording the last entry clears it
//! again.

use crate::state::{bytes_of, read_state};
use kvm_bindings::kvm_irq_routing_entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;

/// `KVM_IOEVENTFD_FLAG_DATAMATCH`.
pub const IOEVENTFD_FLAG_DATAMATCH: u32 = 1 << 0;
/// `KVM_IOEVENTFD_FLAG_PIO`.
pub const IOEVENTFD_FLAG_PIO: u32 = 1 << 1;
/// `KVM_IOEVENTFD_FLAG_DEASSIGN`.
pub const IOEVENTFD_FLAG_DEASSIGN: u32 = 1 << 2;
/// `KVM_IRQFD_FLAG_DEASSIGN`.
pub const IRQFD_FLAG_DEASSIGN: u32 = 1 << 0;
/// `KVM_IRQFD_FLAG_RESAMPLE`.
pub const IRQFD_FLAG_RESAMPLE: u32 = 1 << 1;

// ═══════════════════════════════════════════════════════════════════════
//  RecordList
// ═══════════════════════════════════════════════════════════════════════

/// A presence-flagged, ordered list of owned entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordList<T>(Option<Vec<T>>);

impl<T> Default for RecordList<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> RecordList<T> {
    pub fn new() -> Self {
        Self(None)
    }

    /// Append an entry, marking the list present.
    pub fn record(&mut self, item: T) {
        self.0.get_or_insert_with(Vec::new).push(item);
    }

    /// Remove the first entry matching `pred`.
    ///
    /// `transform` runs on the entry before it is handed back (e.g. to set
    /// a deassign flag).  Removing the last entry clears the presence
    /// flag.
    pub fn unrecord<P, F>(&mut self, mut pred: P, transform: Option<F>) -> Option<T>
    where
        P: FnMut(&T) -> bool,
        F: FnOnce(&mut T),
    {
        let list = self.0.as_mut()?;
        let index = list.iter().position(|item| pred(item))?;
        let mut item = list.remove(index);
        if let Some(f) = transform {
            f(&mut item);
        }
        if list.is_empty() {
            self.0 = None;
        }
        Some(item)
    }

    /// Mark the list present without adding anything.
    pub fn mark_present(&mut self) {
        self.0.get_or_insert_with(Vec::new);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn as_slice(&self) -> &[T] {
        self.0.as_deref().unwrap_or(&[])
    }

    /// The underlying optional list.
    pub fn as_option(&self) -> Option<&Vec<T>> {
        self.0.as_ref()
    }
}

impl<T> From<Option<Vec<T>>> for RecordList<T> {
    fn from(list: Option<Vec<T>>) -> Self {
        Self(list)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Sub-records
// ═══════════════════════════════════════════════════════════════════════

/// `KVM_CREATE_PIT2` configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitConfig {
    pub flags: u32,
}

/// `KVM_XEN_HVM_CONFIG` parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XenHvmConfig {
    pub flags: u32,
    pub msr: u32,
    pub blob_addr_32: u64,
    pub blob_addr_64: u64,
    pub blob_size_32: u8,
    pub blob_size_64: u8,
}

/// A coalesced MMIO (or PIO) zone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescedMmioZone {
    pub addr: u64,
    pub size: u32,
    pub pio: bool,
}

/// A registered ioeventfd.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoEventFd {
    pub datamatch: u64,
    pub addr: u64,
    pub len: u32,
    pub fd: i32,
    pub flags: u32,
}

impl IoEventFd {
    pub fn is_pio(&self) -> bool {
        self.flags & IOEVENTFD_FLAG_PIO != 0
    }

    pub fn has_datamatch(&self) -> bool {
        self.flags & IOEVENTFD_FLAG_DATAMATCH != 0
    }
}

/// A registered irqfd.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqFd {
    pub fd: i32,
    pub gsi: u32,
    pub flags: u32,
    pub resamplefd: i32,
}

/// An in-kernel device created with `KVM_CREATE_DEVICE`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub type_: u32,
    pub fd: u32,
    pub flags: u32,
}

/// One guest physical memory slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegionRecord {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
}

impl MemoryRegionRecord {
    pub fn new(slot: u32, guest_phys_addr: u64, memory_size: u64) -> Self {
        Self {
            slot,
            flags: 0,
            guest_phys_addr,
            memory_size,
        }
    }

    pub fn end(&self) -> u64 {
        self.guest_phys_addr.saturating_add(self.memory_size)
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.guest_phys_addr && gpa < self.end()
    }
}

/// GSI routing table: an entry count followed by one flat block of
/// `kvm_irq_routing_entry` images.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IrqRoutingTable {
    count: u32,
    buf: Vec<u8>,
}

const ROUTING_ENTRY_SIZE: usize = size_of::<kvm_irq_routing_entry>();

impl IrqRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: &kvm_irq_routing_entry) {
        self.buf.extend_from_slice(bytes_of(entry));
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entries(&self) -> Vec<kvm_irq_routing_entry> {
        self.buf
            .chunks_exact(ROUTING_ENTRY_SIZE)
            .filter_map(read_state::<kvm_irq_routing_entry>)
            .collect()
    }

    /// Encode as a little-endian `u32` count followed by the entry block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.buf.len());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.buf);
        out
    }

    /// Decode the [`to_bytes`](Self::to_bytes) encoding.
    ///
    /// Returns `None` if the block length disagrees with the count.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let (head, buf) = bytes.split_at(4);
        let count = u32::from_le_bytes(head.try_into().ok()?);
        if buf.len() != count as usize * ROUTING_ENTRY_SIZE {
            return None;
        }
        Some(Self {
            count,
            buf: buf.to_vec(),
        })
    }
}

impl fmt::Debug for IrqRoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqRoutingTable")
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VmRecord
// ═══════════════════════════════════════════════════════════════════════

/// Optional VM-global hypervisor configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmRecord {
    pub boot_cpu_id: Option<u64>,
    pub tss_address: Option<u64>,
    pub identity_map_address: Option<u64>,
    /// In-kernel irqchip; the flag is the whole value.
    pub irqchip: bool,
    pub irq_routing: Option<IrqRoutingTable>,
    pub pit_config: Option<PitConfig>,
    pub pit_reinject: Option<u8>,
    pub xen_hvm_config: Option<XenHvmConfig>,
    pub coalesced_mmio: RecordList<CoalescedMmioZone>,
    pub ioeventfds: RecordList<IoEventFd>,
    pub irqfds: RecordList<IrqFd>,
    pub devices: RecordList<DeviceRecord>,
    pub memory_map: RecordList<MemoryRegionRecord>,
}

impl VmRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record with a single memory slot at guest physical address 0.
    pub fn with_flat_memory(memory_size: u64) -> Self {
        let mut record = Self::default();
        record
            .memory_map
            .record(MemoryRegionRecord::new(0, 0, memory_size));
        record
    }

    /// Whether any field is present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(addr: u64) -> CoalescedMmioZone {
        CoalescedMmioZone {
            addr,
            size: 0x1000,
            pio: false,
        }
    }

    #[test]
    fn new_record_has_nothing_present() {
        let record = VmRecord::new();
        assert!(record.boot_cpu_id.is_none());
        assert!(record.tss_address.is_none());
        assert!(record.identity_map_address.is_none());
        assert!(!record.irqchip);
        assert!(record.irq_routing.is_none());
        assert!(record.pit_config.is_none());
        assert!(record.pit_reinject.is_none());
        assert!(record.xen_hvm_config.is_none());
        assert!(!record.coalesced_mmio.is_present());
        assert!(!record.ioeventfds.is_present());
        assert!(!record.irqfds.is_present());
        assert!(!record.devices.is_present());
        assert!(!record.memory_map.is_present());
        assert_eq!(record.devices.len(), 0);
        assert!(record.is_empty());
    }

    #[test]
    fn record_then_unrecord_clears_presence() {
        for n in 1..=4u64 {
            let mut list = RecordList::new();
            for i in 0..n {
                list.record(zone(i * 0x1000));
            }
            assert!(list.is_present());
            assert_eq!(list.len(), n as usize);
            for i in 0..n {
                let removed =
                    list.unrecord(|z| z.addr == i * 0x1000, None::<fn(&mut CoalescedMmioZone)>);
                assert!(removed.is_some());
            }
            assert_eq!(list.len(), 0);
            assert!(!list.is_present());
        }
    }

    #[test]
    fn unrecord_applies_transform() {
        let mut list = RecordList::new();
        list.record(IrqFd {
            fd: 5,
            gsi: 4,
            flags: 0,
            resamplefd: -1,
        });
        let removed = list
            .unrecord(|i| i.gsi == 4, Some(|i: &mut IrqFd| i.flags |= IRQFD_FLAG_DEASSIGN))
            .unwrap();
        assert_eq!(removed.flags, IRQFD_FLAG_DEASSIGN);
        assert!(!list.is_present());
    }

    #[test]
    fn unrecord_missing_entry_keeps_list() {
        let mut list = RecordList::new();
        list.record(zone(0));
        let removed = list.unrecord(|z| z.addr == 0x9999, None::<fn(&mut CoalescedMmioZone)>);
        assert!(removed.is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn empty_but_present_differs_from_absent() {
        let mut a = RecordList::<DeviceRecord>::new();
        let b = RecordList::<DeviceRecord>::new();
        a.mark_present();
        assert!(a.is_present());
        assert_eq!(a.len(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn clone_is_structurally_equal() {
        let mut record = VmRecord::with_flat_memory(0x10_0000);
        record.boot_cpu_id = Some(0);
        record.tss_address = Some(0xfffb_d000);
        record.irqchip = true;
        record.pit_config = Some(PitConfig { flags: 1 });
        record.coalesced_mmio.record(zone(0xd000_0000));
        record.ioeventfds.record(IoEventFd {
            addr: 0x3f8,
            len: 1,
            fd: 9,
            flags: IOEVENTFD_FLAG_PIO,
            ..Default::default()
        });
        let mut routing = IrqRoutingTable::new();
        routing.push(&kvm_irq_routing_entry {
            gsi: 4,
            ..Default::default()
        });
        record.irq_routing = Some(routing);

        let copy = record.clone();
        assert_eq!(copy, record);

        let mut changed = copy.clone();
        changed.ioeventfds.clear();
        assert_ne!(changed, record);
    }

    #[test]
    fn routing_table_roundtrips_through_bytes() {
        let mut table = IrqRoutingTable::new();
        for gsi in 0..3 {
            table.push(&kvm_irq_routing_entry {
                gsi,
                ..Default::default()
            });
        }
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), 4 + 3 * ROUTING_ENTRY_SIZE);
        let back = IrqRoutingTable::from_bytes(&bytes).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.entries()[2].gsi, 2);
        assert!(IrqRoutingTable::from_bytes(&bytes[..bytes.len() - 1]).is_none());
    }
}
