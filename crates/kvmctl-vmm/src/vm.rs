//! The guest VM: hardware-control handle, vCPUs, guest memory, the VM
//! record, snapshots and instrumentation points.
//!
//! A [`Vm`] is built either from a [`VmConfig`] or from a [`VmSnapshot`].
//! Every hypervisor call made while building it is fatal: construction
//! either completes or returns an error with nothing half-initialised
//! handed back to the caller.
//!
//! # Example
//!
//! ```no_run
//! use kvmctl_vmm::vm::{Vm, VmConfig};
//!
//! let mut vm = Vm::with_kvm(VmConfig::default()).unwrap();
//! vm.write_phys(0x1000, &[0x90, 0xf4]).unwrap();
//! vm.take_snapshot(1).unwrap();
//! vm.restore_snapshot(1).unwrap();
//! ```

use crate::hypervisor::{ExitReason, HvError, VcpuControl, VmControl};
use crate::instrument::{
    DebugControl, HookFn, HookPoint, InstrumentError, PatchPoint, StopKind, StopPoint,
    HW_BREAKPOINT_SLOTS, INT3,
};
use crate::kvm::KvmVm;
use crate::memory::{GuestMemoryManager, MemoryError};
use crate::record::{
    CoalescedMmioZone, DeviceRecord, IoEventFd, IrqFd, MemoryRegionRecord, RecordList, VmRecord,
    IOEVENTFD_FLAG_DEASSIGN, IRQFD_FLAG_DEASSIGN,
};
use crate::snapshot::{
    EmuDeviceSnapshot, MemoryRegionSnapshot, SnapshotError, TimerState, VcpuSnapshot, VmSnapshot,
};
use kvm_bindings::kvm_regs;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const PAGE_SIZE: u64 = 0x1000;
const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[derive(Error, Debug)]
pub enum VmError {
    #[error("{op} failed: {source}")]
    Setup {
        op: &'static str,
        #[source]
        source: HvError,
    },

    #[error("No vCPU with id {0}")]
    NoSuchVcpu(u32),

    #[error("No snapshot with id {0}")]
    NoSuchSnapshot(u32),

    #[error("Snapshot {0} already exists")]
    DuplicateSnapshot(u32),

    #[error("Guest memory error: {0}")]
    GuestMemory(#[from] MemoryError),

    #[error("vCPU {vcpu} cannot translate {gva:#x}")]
    Translate { vcpu: u32, gva: u64 },

    #[error("No vCPU runs in address space {0:#x}")]
    UnknownAddressSpace(u64),

    #[error("No recorded {0} matches")]
    NotRecorded(&'static str),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

fn setup(op: &'static str) -> impl FnOnce(HvError) -> VmError {
    move |source| VmError::Setup { op, source }
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Parameters for building a fresh VM.
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub vcpu_count: u32,
    /// Size of the single slot-0 region used when `record` has no memory map.
    pub memory_size: u64,
    /// Per-vCPU TSC frequency to program, if any.
    pub tsc_khz: Option<u32>,
    /// VM-level configuration applied at creation.
    pub record: VmRecord,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            memory_size: 16 * 1024 * 1024,
            tsc_khz: None,
            record: VmRecord::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU
// ═══════════════════════════════════════════════════════════════════════

/// One virtual processor.
pub struct Vcpu {
    id: u32,
    control: Box<dyn VcpuControl>,
    /// Guest-debug state owned by the caller and plugins.  The engine
    /// merges stop and hook points into it on every entry.
    pub debug_control: DebugControl,
    last_exit: Option<ExitReason>,
}

impl Vcpu {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn control(&self) -> &dyn VcpuControl {
        self.control.as_ref()
    }

    pub fn control_mut(&mut self) -> &mut dyn VcpuControl {
        self.control.as_mut()
    }

    /// The exit returned by the most recent [`run`](Self::run).
    pub fn last_exit(&self) -> Option<&ExitReason> {
        self.last_exit.as_ref()
    }

    pub fn regs(&self) -> Result<kvm_regs, VmError> {
        self.control.get_regs().map_err(setup("KVM_GET_REGS"))
    }

    pub fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), VmError> {
        self.control.set_regs(regs).map_err(setup("KVM_SET_REGS"))
    }

    pub fn rip(&self) -> Result<u64, VmError> {
        Ok(self.regs()?.rip)
    }

    pub fn set_rip(&mut self, rip: u64) -> Result<(), VmError> {
        let mut regs = self.regs()?;
        regs.rip = rip;
        self.set_regs(&regs)
    }

    /// Page-table base (CR3) this vCPU currently translates through.
    pub fn address_space(&self) -> Result<u64, VmError> {
        let sregs = self.control.get_sregs().map_err(setup("KVM_GET_SREGS"))?;
        Ok(sregs.cr3 & PAGE_MASK)
    }

    /// Program `control` and enter the guest until the next exit.
    pub fn run(&mut self, control: &DebugControl) -> Result<ExitReason, HvError> {
        self.control.set_guest_debug(control)?;
        let exit = self.control.run()?;
        self.last_exit = Some(exit.clone());
        Ok(exit)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VM
// ═══════════════════════════════════════════════════════════════════════

pub struct Vm {
    control: Box<dyn VmControl>,
    vcpus: Vec<Vcpu>,
    memory: GuestMemoryManager,
    record: VmRecord,
    snapshots: Vec<VmSnapshot>,
    emu_devices: RecordList<EmuDeviceSnapshot>,
    patch_points: Vec<PatchPoint>,
    stop_points: Vec<StopPoint>,
    hook_points: Vec<HookPoint>,
    /// Outstanding guest-debug flag claims per vCPU, one entry per claim.
    debug_claims: BTreeMap<u32, Vec<u32>>,
}

impl Vm {
    /// Build a VM on `control` according to `config`.
    pub fn new(control: Box<dyn VmControl>, config: VmConfig) -> Result<Self, VmError> {
        let mut record = config.record;
        if record.memory_map.is_empty() {
            record
                .memory_map
                .record(MemoryRegionRecord::new(0, 0, config.memory_size));
        }
        let ids: Vec<u32> = (0..config.vcpu_count).collect();
        Self::build(control, record, &ids, config.tsc_khz)
    }

    /// Build a VM on a fresh `/dev/kvm` VM.
    pub fn with_kvm(config: VmConfig) -> Result<Self, VmError> {
        let control = KvmVm::new().map_err(setup("create KVM VM"))?;
        Self::new(Box::new(control), config)
    }

    /// Rebuild a VM from `snapshot` and restore its state.
    ///
    /// The snapshot is kept as the VM's first stored snapshot.
    pub fn from_snapshot(
        control: Box<dyn VmControl>,
        snapshot: VmSnapshot,
    ) -> Result<Self, VmError> {
        let ids: Vec<u32> = snapshot.vcpus.iter().map(|v| v.id).collect();
        let mut vm = Self::build(control, snapshot.record.clone(), &ids, None)?;
        vm.restore_from(&snapshot)?;
        info!(
            "VM rebuilt from snapshot {} ({} vCPUs, {} KiB)",
            snapshot.id,
            ids.len(),
            vm.memory.size() / 1024
        );
        vm.snapshots.push(snapshot);
        Ok(vm)
    }

    fn build(
        mut control: Box<dyn VmControl>,
        record: VmRecord,
        vcpu_ids: &[u32],
        tsc_khz: Option<u32>,
    ) -> Result<Self, VmError> {
        // Identity map and TSS must precede the irqchip, which must
        // precede vCPU creation.
        if let Some(addr) = record.identity_map_address {
            control
                .set_identity_map_address(addr)
                .map_err(setup("KVM_SET_IDENTITY_MAP_ADDR"))?;
        }
        if let Some(addr) = record.tss_address {
            control
                .set_tss_address(addr)
                .map_err(setup("KVM_SET_TSS_ADDR"))?;
        }
        if let Some(id) = record.boot_cpu_id {
            control
                .set_boot_cpu_id(id)
                .map_err(setup("KVM_SET_BOOT_CPU_ID"))?;
        }
        if record.irqchip {
            control
                .create_irq_chip()
                .map_err(setup("KVM_CREATE_IRQCHIP"))?;
        }
        if let Some(pit) = &record.pit_config {
            control.create_pit(pit).map_err(setup("KVM_CREATE_PIT2"))?;
        }
        if let Some(reinject) = record.pit_reinject {
            control
                .set_pit_reinject(reinject)
                .map_err(setup("KVM_REINJECT_CONTROL"))?;
        }
        if let Some(xen) = &record.xen_hvm_config {
            control
                .set_xen_hvm_config(xen)
                .map_err(setup("KVM_XEN_HVM_CONFIG"))?;
        }
        if let Some(table) = &record.irq_routing {
            control
                .set_gsi_routing(table)
                .map_err(setup("KVM_SET_GSI_ROUTING"))?;
        }
        for zone in record.coalesced_mmio.iter() {
            control
                .register_coalesced_mmio(zone)
                .map_err(setup("KVM_REGISTER_COALESCED_MMIO"))?;
        }
        for device in record.devices.iter() {
            control
                .create_device(device)
                .map_err(setup("KVM_CREATE_DEVICE"))?;
        }
        // Recorded descriptors belong to the process that captured them.
        for ioevent in record.ioeventfds.iter() {
            control
                .register_ioeventfd(&IoEventFd { fd: -1, ..*ioevent })
                .map_err(setup("KVM_IOEVENTFD"))?;
        }
        for irqfd in record.irqfds.iter() {
            control
                .register_irqfd(&IrqFd {
                    fd: -1,
                    resamplefd: -1,
                    ..*irqfd
                })
                .map_err(setup("KVM_IRQFD"))?;
        }

        let memory = GuestMemoryManager::new(record.memory_map.as_slice())?;
        for region in memory.regions() {
            control
                .set_memory_region(region, memory.inner())
                .map_err(setup("KVM_SET_USER_MEMORY_REGION"))?;
        }

        let mut vcpus = Vec::with_capacity(vcpu_ids.len());
        for &id in vcpu_ids {
            let mut vcpu = control.create_vcpu(id).map_err(setup("KVM_CREATE_VCPU"))?;
            if let Some(khz) = tsc_khz {
                vcpu.set_tsc_khz(khz).map_err(setup("KVM_SET_TSC_KHZ"))?;
            }
            vcpus.push(Vcpu {
                id,
                control: vcpu,
                debug_control: DebugControl::default(),
                last_exit: None,
            });
        }

        info!(
            "VM created: {} vCPU(s), {} KiB in {} slot(s)",
            vcpus.len(),
            memory.size() / 1024,
            memory.regions().len()
        );

        Ok(Self {
            control,
            vcpus,
            memory,
            record,
            snapshots: Vec::new(),
            emu_devices: RecordList::new(),
            patch_points: Vec::new(),
            stop_points: Vec::new(),
            hook_points: Vec::new(),
            debug_claims: BTreeMap::new(),
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn record(&self) -> &VmRecord {
        &self.record
    }

    pub fn memory(&self) -> &GuestMemoryManager {
        &self.memory
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn vcpus_mut(&mut self) -> &mut [Vcpu] {
        &mut self.vcpus
    }

    pub fn vcpu_ids(&self) -> Vec<u32> {
        self.vcpus.iter().map(|v| v.id).collect()
    }

    pub fn vcpu(&self, id: u32) -> Result<&Vcpu, VmError> {
        self.vcpus
            .iter()
            .find(|v| v.id == id)
            .ok_or(VmError::NoSuchVcpu(id))
    }

    pub fn vcpu_mut(&mut self, id: u32) -> Result<&mut Vcpu, VmError> {
        self.vcpus
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or(VmError::NoSuchVcpu(id))
    }

    pub fn emu_devices(&self) -> &RecordList<EmuDeviceSnapshot> {
        &self.emu_devices
    }

    pub fn patch_points(&self) -> &[PatchPoint] {
        &self.patch_points
    }

    pub fn stop_points(&self) -> &[StopPoint] {
        &self.stop_points
    }

    pub fn hook_points(&self) -> &[HookPoint] {
        &self.hook_points
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    /// Capture the current state without storing it.
    pub fn capture_snapshot(&self, id: u32) -> Result<VmSnapshot, VmError> {
        let vcpus = self
            .vcpus
            .iter()
            .map(|v| VcpuSnapshot::capture(v.id, v.control(), v.debug_control))
            .collect::<Result<Vec<_>, _>>()?;

        let memory = self
            .memory
            .regions()
            .iter()
            .map(|r| {
                Ok(MemoryRegionSnapshot {
                    slot: r.slot,
                    flags: r.flags,
                    guest_phys_addr: r.guest_phys_addr,
                    size: r.memory_size,
                    contents: self
                        .memory
                        .dump_region(r)
                        .map_err(|_| SnapshotError::ReadMemory { slot: r.slot })?,
                })
            })
            .collect::<Result<Vec<_>, SnapshotError>>()?;

        let timer = TimerState::capture(self.control.as_ref())?;

        Ok(VmSnapshot {
            id,
            record: self.record.clone(),
            vcpus,
            memory,
            emu_devices: self.emu_devices.clone(),
            patch_points: self.patch_points.clone(),
            stop_points: self.stop_points.clone(),
            hook_points: self.hook_points.clone(),
            timer,
        })
    }

    /// Capture and store a snapshot under `id`.
    pub fn take_snapshot(&mut self, id: u32) -> Result<&VmSnapshot, VmError> {
        if self.snapshots.iter().any(|s| s.id == id) {
            return Err(VmError::DuplicateSnapshot(id));
        }
        let snapshot = self.capture_snapshot(id)?;
        info!(
            "Snapshot {} taken: {} vCPU(s), {} KiB memory",
            id,
            snapshot.vcpus.len(),
            snapshot.memory_size() / 1024
        );
        self.snapshots.push(snapshot);
        Ok(&self.snapshots[self.snapshots.len() - 1])
    }

    /// Return the VM to the state stored under `id`.
    pub fn restore_snapshot(&mut self, id: u32) -> Result<(), VmError> {
        let snapshot = self
            .snapshot(id)
            .cloned()
            .ok_or(VmError::NoSuchSnapshot(id))?;
        self.restore_from(&snapshot)?;
        info!("Snapshot {} restored", id);
        Ok(())
    }

    fn restore_from(&mut self, snapshot: &VmSnapshot) -> Result<(), VmError> {
        for region in &snapshot.memory {
            let live = *self
                .memory
                .region(region.slot)
                .map_err(|_| SnapshotError::MissingRegion { slot: region.slot })?;
            self.memory
                .restore_region(&live, &region.contents)
                .map_err(|_| SnapshotError::WriteMemory { slot: region.slot })?;
        }

        // In-kernel devices first, so LAPIC and event state land on top.
        snapshot.timer.restore(self.control.as_mut())?;

        for state in &snapshot.vcpus {
            let vcpu = self.vcpu_mut(state.id)?;
            state.restore(vcpu.control.as_mut())?;
            vcpu.debug_control = state.debug_control.unwrap_or_default();
            vcpu.last_exit = None;
        }

        self.emu_devices = snapshot.emu_devices.clone();
        self.patch_points = snapshot.patch_points.clone();
        self.stop_points = snapshot.stop_points.clone();
        self.hook_points = snapshot.hook_points.clone();
        Ok(())
    }

    pub fn free_snapshot(&mut self, id: u32) -> Result<VmSnapshot, VmError> {
        let index = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or(VmError::NoSuchSnapshot(id))?;
        debug!("Snapshot {} freed", id);
        Ok(self.snapshots.remove(index))
    }

    pub fn snapshot(&self, id: u32) -> Option<&VmSnapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    pub fn snapshots(&self) -> &[VmSnapshot] {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut [VmSnapshot] {
        &mut self.snapshots
    }

    // ─── Guest-debug claims ─────────────────────────────────────────

    /// Arm `flags` on each of `vcpus`, live and in every stored snapshot.
    ///
    /// Claims stack: several holders may arm the same bits, and a bit only
    /// goes away once every claim on it has been released.  Each call must
    /// be balanced by one [`release_debug_flags`](Self::release_debug_flags)
    /// with the same arguments.
    pub fn claim_debug_flags(&mut self, flags: u32, vcpus: &[u32]) -> Result<(), VmError> {
        for &id in vcpus {
            self.vcpu(id)?;
        }
        for &id in vcpus {
            self.vcpu_mut(id)?.debug_control.set(flags);
            self.debug_claims.entry(id).or_default().push(flags);
            for snapshot in &mut self.snapshots {
                if let Some(state) = snapshot.vcpu_mut(id) {
                    state.debug_control.get_or_insert_with(Default::default).set(flags);
                }
            }
        }
        Ok(())
    }

    /// Drop one claim of `flags` on each of `vcpus`.  Bits still held by
    /// another claim stay armed.
    pub fn release_debug_flags(&mut self, flags: u32, vcpus: &[u32]) -> Result<(), VmError> {
        for &id in vcpus {
            self.vcpu(id)?;
        }
        for &id in vcpus {
            let held = self.debug_claims.entry(id).or_default();
            if let Some(pos) = held.iter().position(|&f| f == flags) {
                held.remove(pos);
            }
            let still = held.iter().fold(0, |acc, &f| acc | f);
            if held.is_empty() {
                self.debug_claims.remove(&id);
            }
            let clear = flags & !still;
            if clear == 0 {
                continue;
            }
            self.vcpu_mut(id)?.debug_control.clear(clear);
            for snapshot in &mut self.snapshots {
                if let Some(control) = snapshot
                    .vcpu_mut(id)
                    .and_then(|state| state.debug_control.as_mut())
                {
                    control.clear(clear);
                }
            }
        }
        Ok(())
    }

    // ─── Live record mutation ───────────────────────────────────────

    pub fn register_coalesced_mmio(&mut self, zone: CoalescedMmioZone) -> Result<(), VmError> {
        self.control
            .register_coalesced_mmio(&zone)
            .map_err(setup("KVM_REGISTER_COALESCED_MMIO"))?;
        self.record.coalesced_mmio.record(zone);
        Ok(())
    }

    /// Register `ioevent` and record it with the descriptor now backing it.
    pub fn register_ioeventfd(&mut self, mut ioevent: IoEventFd) -> Result<i32, VmError> {
        ioevent.fd = self
            .control
            .register_ioeventfd(&ioevent)
            .map_err(setup("KVM_IOEVENTFD"))?;
        self.record.ioeventfds.record(ioevent);
        Ok(ioevent.fd)
    }

    /// Deassign the ioeventfd at `addr` matching `datamatch`.
    pub fn unregister_ioeventfd(&mut self, addr: u64, datamatch: u64) -> Result<(), VmError> {
        let matches = |e: &IoEventFd| e.addr == addr && e.datamatch == datamatch;
        let mut target = *self
            .record
            .ioeventfds
            .iter()
            .find(|&e| matches(e))
            .ok_or(VmError::NotRecorded("ioeventfd"))?;
        target.flags |= IOEVENTFD_FLAG_DEASSIGN;
        self.control
            .unregister_ioeventfd(&target)
            .map_err(setup("KVM_IOEVENTFD"))?;
        self.record
            .ioeventfds
            .unrecord(matches, Some(|e: &mut IoEventFd| e.flags |= IOEVENTFD_FLAG_DEASSIGN));
        Ok(())
    }

    pub fn register_irqfd(&mut self, mut irqfd: IrqFd) -> Result<i32, VmError> {
        irqfd.fd = self
            .control
            .register_irqfd(&irqfd)
            .map_err(setup("KVM_IRQFD"))?;
        self.record.irqfds.record(irqfd);
        Ok(irqfd.fd)
    }

    /// Deassign the irqfd driving `gsi`.
    pub fn unregister_irqfd(&mut self, gsi: u32) -> Result<(), VmError> {
        let matches = |e: &IrqFd| e.gsi == gsi;
        let mut target = *self
            .record
            .irqfds
            .iter()
            .find(|&e| matches(e))
            .ok_or(VmError::NotRecorded("irqfd"))?;
        target.flags |= IRQFD_FLAG_DEASSIGN;
        self.control
            .unregister_irqfd(&target)
            .map_err(setup("KVM_IRQFD"))?;
        self.record
            .irqfds
            .unrecord(matches, Some(|e: &mut IrqFd| e.flags |= IRQFD_FLAG_DEASSIGN));
        Ok(())
    }

    /// Create an in-kernel device; returns its descriptor.
    pub fn create_device(&mut self, type_: u32, flags: u32) -> Result<u32, VmError> {
        let mut device = DeviceRecord {
            type_,
            fd: 0,
            flags,
        };
        device.fd = self
            .control
            .create_device(&device)
            .map_err(setup("KVM_CREATE_DEVICE"))?;
        self.record.devices.record(device);
        Ok(device.fd)
    }

    /// Attach opaque emulated-device state to the VM; it travels with
    /// every later snapshot.
    pub fn insert_emu_device(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.emu_devices.record(EmuDeviceSnapshot {
            name: name.into(),
            data,
        });
    }

    // ─── Guest access ───────────────────────────────────────────────

    pub fn translate(&self, vcpu_id: u32, gva: u64) -> Result<u64, VmError> {
        self.vcpu(vcpu_id)?
            .control()
            .translate(gva)
            .map_err(setup("KVM_TRANSLATE"))?
            .ok_or(VmError::Translate { vcpu: vcpu_id, gva })
    }

    pub fn read_phys(&self, gpa: u64, buf: &mut [u8]) -> Result<(), VmError> {
        Ok(self.memory.read(gpa, buf)?)
    }

    pub fn write_phys(&self, gpa: u64, data: &[u8]) -> Result<(), VmError> {
        Ok(self.memory.write(gpa, data)?)
    }

    /// Read guest virtual memory through `vcpu_id`'s page tables, one page
    /// at a time.
    pub fn read_virt(&self, vcpu_id: u32, gva: u64, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = gva
                .checked_add(done as u64)
                .ok_or(VmError::Translate { vcpu: vcpu_id, gva })?;
            let in_page = (PAGE_SIZE - (addr & !PAGE_MASK)) as usize;
            let chunk = in_page.min(buf.len() - done);
            let gpa = self.translate(vcpu_id, addr)?;
            self.read_phys(gpa, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    /// Read guest virtual memory in the address space whose page-table
    /// base is `asid`, using whichever vCPU currently runs in it.
    pub fn read_asid(&self, asid: u64, gva: u64, buf: &mut [u8]) -> Result<(), VmError> {
        let wanted = asid & PAGE_MASK;
        for vcpu in &self.vcpus {
            if vcpu.address_space()? == wanted {
                return self.read_virt(vcpu.id, gva, buf);
            }
        }
        Err(VmError::UnknownAddressSpace(asid))
    }

    // ─── Instrumentation ────────────────────────────────────────────

    fn overlapping(&self, gpa: u64, len: usize) -> Option<u64> {
        self.patch_points
            .iter()
            .chain(self.stop_points.iter().filter_map(|s| s.saved.as_ref()))
            .chain(self.hook_points.iter().map(|h| &h.patch))
            .find(|p| p.overlaps(gpa, len))
            .map(|p| p.gva)
    }

    /// Translate, check and write a patch; the caller files it.
    fn apply_patch(
        &mut self,
        vcpu_id: u32,
        gva: u64,
        bytes: &[u8],
    ) -> Result<PatchPoint, VmError> {
        if bytes.is_empty() {
            return Err(InstrumentError::EmptyPatch { addr: gva }.into());
        }
        let unmapped = |e: VmError| match e {
            VmError::Translate { gva, .. } => InstrumentError::Unmapped { gva }.into(),
            other => other,
        };
        let gpa = self.translate(vcpu_id, gva).map_err(unmapped)?;
        let span = bytes.len() as u64 - 1;
        let last = gva
            .checked_add(span)
            .ok_or(InstrumentError::Unmapped { gva })?;
        if Some(self.translate(vcpu_id, last).map_err(unmapped)?) != gpa.checked_add(span) {
            // Physically discontiguous; a patch is one physical range.
            return Err(InstrumentError::Unmapped { gva: last }.into());
        }
        if let Some(existing) = self.overlapping(gpa, bytes.len()) {
            return Err(InstrumentError::Overlap {
                addr: gva,
                existing,
            }
            .into());
        }

        let mut original = vec![0u8; bytes.len()];
        self.read_phys(gpa, &mut original)?;
        self.write_phys(gpa, bytes)?;
        debug!(
            "Patched {} byte(s) at {:#x} (gpa {:#x})",
            bytes.len(),
            gva,
            gpa
        );
        Ok(PatchPoint {
            gva,
            gpa,
            original,
            replacement: bytes.to_vec(),
        })
    }

    fn unapply_patch(&self, patch: &PatchPoint) -> Result<(), VmError> {
        self.write_phys(patch.gpa, &patch.original)
    }

    fn first_vcpu(&self) -> Result<u32, VmError> {
        self.vcpus
            .first()
            .map(|v| v.id)
            .ok_or(VmError::NoSuchVcpu(0))
    }

    /// Overwrite guest bytes at `gva` (translated through `vcpu_id`),
    /// keeping the originals for [`remove_patch`](Self::remove_patch).
    pub fn patch_vaddr(&mut self, vcpu_id: u32, gva: u64, bytes: &[u8]) -> Result<(), VmError> {
        let patch = self.apply_patch(vcpu_id, gva, bytes)?;
        self.patch_points.push(patch);
        Ok(())
    }

    pub fn remove_patch(&mut self, gva: u64) -> Result<(), VmError> {
        let index = self
            .patch_points
            .iter()
            .position(|p| p.gva == gva)
            .ok_or(InstrumentError::NotPatched { addr: gva })?;
        self.unapply_patch(&self.patch_points[index])?;
        self.patch_points.remove(index);
        Ok(())
    }

    pub fn remove_all_patches(&mut self) -> Result<(), VmError> {
        // Newest first, so stacked originals unwind in order.
        while let Some(patch) = self.patch_points.last() {
            self.unapply_patch(patch)?;
            self.patch_points.pop();
        }
        Ok(())
    }

    /// Halt the run loop whenever a vCPU reaches `addr`.
    pub fn add_stop_point(&mut self, addr: u64, kind: StopKind) -> Result<(), VmError> {
        if self.stop_points.iter().any(|s| s.addr == addr) {
            return Err(InstrumentError::DuplicateStopPoint { addr }.into());
        }
        let saved = match kind {
            StopKind::Hardware => {
                let armed = self
                    .stop_points
                    .iter()
                    .filter(|s| s.kind == StopKind::Hardware)
                    .count();
                if armed >= HW_BREAKPOINT_SLOTS {
                    return Err(InstrumentError::TooManyHardwareStopPoints.into());
                }
                None
            }
            StopKind::Software => {
                let vcpu = self.first_vcpu()?;
                Some(self.apply_patch(vcpu, addr, &[INT3])?)
            }
        };
        debug!("Stop point ({:?}) at {:#x}", kind, addr);
        self.stop_points.push(StopPoint { addr, kind, saved });
        Ok(())
    }

    /// Clear every stop point.  Plain patches are left alone.
    pub fn remove_all_stop_points(&mut self) -> Result<(), VmError> {
        while let Some(stop) = self.stop_points.last() {
            if let Some(patch) = &stop.saved {
                self.unapply_patch(patch)?;
            }
            self.stop_points.pop();
        }
        Ok(())
    }

    /// Run `callback` whenever a vCPU reaches `gva`.
    pub fn add_hook_point(
        &mut self,
        vcpu_id: u32,
        gva: u64,
        callback: Arc<HookFn>,
    ) -> Result<(), VmError> {
        let patch = self.apply_patch(vcpu_id, gva, &[INT3])?;
        self.hook_points.push(HookPoint { patch, callback });
        Ok(())
    }

    pub fn remove_hook_point(&mut self, gva: u64) -> Result<(), VmError> {
        let index = self
            .hook_points
            .iter()
            .position(|h| h.addr() == gva)
            .ok_or(InstrumentError::NotPatched { addr: gva })?;
        self.unapply_patch(&self.hook_points[index].patch)?;
        self.hook_points.remove(index);
        Ok(())
    }

    pub(crate) fn hook_point(&self, gva: u64) -> Option<HookPoint> {
        self.hook_points.iter().find(|h| h.addr() == gva).cloned()
    }

    pub(crate) fn stop_point_at(&self, addr: u64) -> bool {
        self.stop_points.iter().any(|s| s.addr == addr)
    }

    /// Put the original bytes back under a hook so it can be stepped over.
    pub(crate) fn disarm_hook(&self, gva: u64) -> Result<(), VmError> {
        match self.hook_points.iter().find(|h| h.addr() == gva) {
            Some(hook) => self.write_phys(hook.patch.gpa, &hook.patch.original),
            None => Ok(()),
        }
    }

    /// Re-write the hook's `int3`.  A hook removed in the meantime stays
    /// removed.
    pub(crate) fn rearm_hook(&self, gva: u64) -> Result<(), VmError> {
        match self.hook_points.iter().find(|h| h.addr() == gva) {
            Some(hook) => self.write_phys(hook.patch.gpa, &hook.patch.replacement),
            None => Ok(()),
        }
    }

    /// The debug control to enter `vcpu_id` with: its own word plus every
    /// armed stop and hook point.
    pub fn effective_debug_control(
        &self,
        vcpu_id: u32,
        force_step: bool,
    ) -> Result<DebugControl, VmError> {
        let own = self.vcpu(vcpu_id)?.debug_control;
        let hw: Vec<u64> = self
            .stop_points
            .iter()
            .filter(|s| s.kind == StopKind::Hardware)
            .map(|s| s.addr)
            .collect();
        let sw = !self.hook_points.is_empty()
            || self.stop_points.iter().any(|s| s.kind == StopKind::Software);
        Ok(own.with_breakpoints(&hw, sw, force_step))
    }
}
