//! [`VmControl`] / [`VcpuControl`] on top of `/dev/kvm`.
//!
//! Most operations go straight through `kvm-ioctls`.  The few VM ioctls it
//! does not wrap with the full flag set a [`VmRecord`](crate::record::VmRecord)
//! can carry (boot CPU id, PIT reinjection, Xen HVM config, GSI routing,
//! ioeventfd, irqfd) are issued with `vmm-sys-util`'s ioctl helpers.

use crate::hypervisor::{
    DebugExit, ExitReason, HvError, HvResult, IrqChip, MsrEntry, VcpuControl, VmControl,
};
use crate::instrument::DebugControl;
use crate::record::{
    CoalescedMmioZone, DeviceRecord, IoEventFd, IrqFd, IrqRoutingTable, MemoryRegionRecord,
    PitConfig, XenHvmConfig, IOEVENTFD_FLAG_DEASSIGN, IRQFD_FLAG_DEASSIGN, IRQFD_FLAG_RESAMPLE,
};
use crate::state::bytes_of;
use kvm_bindings::{
    kvm_clock_data, kvm_create_device, kvm_debugregs, kvm_fpu, kvm_guest_debug,
    kvm_guest_debug_arch, kvm_ioeventfd, kvm_irq_routing, kvm_irq_routing_entry, kvm_irqchip,
    kvm_irqfd, kvm_lapic_state, kvm_mp_state, kvm_msr_entry, kvm_pit_config, kvm_pit_state2,
    kvm_regs, kvm_reinject_control, kvm_sregs, kvm_userspace_memory_region, kvm_vcpu_events,
    kvm_xcrs, kvm_xen_hvm_config, kvm_xsave, Msrs, KVMIO, KVM_MAX_CPUID_ENTRIES,
    KVM_MAX_MSR_ENTRIES,
};
use kvm_ioctls::{DeviceFd, IoEventAddress, Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl_with_ptr, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::{ioctl_io_nr, ioctl_ioc_nr, ioctl_iow_nr};

ioctl_iow_nr!(KVM_SET_GSI_ROUTING, KVMIO, 0x6a, kvm_irq_routing);
ioctl_io_nr!(KVM_REINJECT_CONTROL, KVMIO, 0x71);
ioctl_iow_nr!(KVM_IRQFD, KVMIO, 0x76, kvm_irqfd);
ioctl_io_nr!(KVM_SET_BOOT_CPU_ID, KVMIO, 0x78);
ioctl_iow_nr!(KVM_IOEVENTFD, KVMIO, 0x79, kvm_ioeventfd);
ioctl_iow_nr!(KVM_XEN_HVM_CONFIG, KVMIO, 0x7a, kvm_xen_hvm_config);

fn check(op: &'static str, ret: i32) -> HvResult<()> {
    if ret < 0 {
        return Err(HvError::Kvm {
            op,
            source: kvm_ioctls::Error::last(),
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  VM
// ═══════════════════════════════════════════════════════════════════════

/// A KVM virtual machine.
pub struct KvmVm {
    kvm: Kvm,
    vm: VmFd,
    msr_indices: Vec<u32>,
    irqchip: bool,
    pit: bool,
    /// Eventfds this backend created for ioeventfds registered with a
    /// negative fd, keyed by (addr, datamatch, pio).
    ioevents: HashMap<(u64, u64, bool), EventFd>,
    /// Backend-created irqfd eventfds, keyed by GSI: (trigger, resample).
    irqfds: HashMap<u32, (EventFd, Option<EventFd>)>,
    devices: Vec<DeviceFd>,
}

impl KvmVm {
    /// Open `/dev/kvm` and create an empty VM.
    pub fn new() -> HvResult<Self> {
        let kvm = Kvm::new().map_err(HvError::kvm("open /dev/kvm"))?;
        let vm = kvm.create_vm().map_err(HvError::kvm("KVM_CREATE_VM"))?;
        let msr_indices = match kvm.get_msr_index_list() {
            Ok(list) => list.as_slice().to_vec(),
            Err(e) => {
                warn!("KVM_GET_MSR_INDEX_LIST failed ({}), MSRs will not be captured", e);
                Vec::new()
            }
        };
        info!(
            "KVM VM created (API version {}, {} MSRs tracked)",
            kvm.get_api_version(),
            msr_indices.len()
        );
        Ok(Self {
            kvm,
            vm,
            msr_indices,
            irqchip: false,
            pit: false,
            ioevents: HashMap::new(),
            irqfds: HashMap::new(),
            devices: Vec::new(),
        })
    }

    pub fn fd(&self) -> &VmFd {
        &self.vm
    }

    fn ioevent_address(ioevent: &IoEventFd) -> IoEventAddress {
        if ioevent.is_pio() {
            IoEventAddress::Pio(ioevent.addr)
        } else {
            IoEventAddress::Mmio(ioevent.addr)
        }
    }

    fn ioevent_key(ioevent: &IoEventFd) -> (u64, u64, bool) {
        (ioevent.addr, ioevent.datamatch, ioevent.is_pio())
    }

    fn ioeventfd_ioctl(&self, ioevent: &IoEventFd, fd: i32, flags: u32) -> HvResult<()> {
        let req = kvm_ioeventfd {
            datamatch: ioevent.datamatch,
            addr: ioevent.addr,
            len: ioevent.len,
            fd,
            flags,
            ..Default::default()
        };
        // SAFETY: `req` is a fully initialised kvm_ioeventfd the kernel only reads.
        check("KVM_IOEVENTFD", unsafe {
            ioctl_with_ref(&self.vm, KVM_IOEVENTFD(), &req)
        })
    }
}

impl VmControl for KvmVm {
    fn create_vcpu(&mut self, id: u32) -> HvResult<Box<dyn VcpuControl>> {
        let fd = self
            .vm
            .create_vcpu(u64::from(id))
            .map_err(HvError::kvm("KVM_CREATE_VCPU"))?;
        let cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(HvError::kvm("KVM_GET_SUPPORTED_CPUID"))?;
        fd.set_cpuid2(&cpuid).map_err(HvError::kvm("KVM_SET_CPUID2"))?;
        debug!("vCPU {} created", id);
        Ok(Box::new(KvmVcpu {
            fd,
            msr_indices: self.msr_indices.clone(),
            lapic: self.irqchip,
        }))
    }

    fn set_memory_region(
        &mut self,
        region: &MemoryRegionRecord,
        memory: &GuestMemoryMmap,
    ) -> HvResult<()> {
        let host = memory
            .get_host_address(GuestAddress(region.guest_phys_addr))
            .map_err(|e| HvError::Memory(e.to_string()))?;
        let mem_region = kvm_userspace_memory_region {
            slot: region.slot,
            flags: region.flags,
            guest_phys_addr: region.guest_phys_addr,
            memory_size: region.memory_size,
            userspace_addr: host as u64,
        };
        // SAFETY: the mapping is owned by the VM's guest memory, which
        // outlives every vCPU that can access it.
        unsafe { self.vm.set_user_memory_region(mem_region) }
            .map_err(HvError::kvm("KVM_SET_USER_MEMORY_REGION"))
    }

    fn remove_memory_region(&mut self, region: &MemoryRegionRecord) -> HvResult<()> {
        let mem_region = kvm_userspace_memory_region {
            slot: region.slot,
            flags: 0,
            guest_phys_addr: region.guest_phys_addr,
            memory_size: 0,
            userspace_addr: 0,
        };
        // SAFETY: a zero-sized region only deletes the slot.
        unsafe { self.vm.set_user_memory_region(mem_region) }
            .map_err(HvError::kvm("KVM_SET_USER_MEMORY_REGION"))
    }

    fn set_boot_cpu_id(&mut self, id: u64) -> HvResult<()> {
        // SAFETY: KVM_SET_BOOT_CPU_ID takes its argument by value.
        check("KVM_SET_BOOT_CPU_ID", unsafe {
            ioctl_with_val(&self.vm, KVM_SET_BOOT_CPU_ID(), id)
        })
    }

    fn set_tss_address(&mut self, addr: u64) -> HvResult<()> {
        self.vm
            .set_tss_address(addr as usize)
            .map_err(HvError::kvm("KVM_SET_TSS_ADDR"))
    }

    fn set_identity_map_address(&mut self, addr: u64) -> HvResult<()> {
        self.vm
            .set_identity_map_address(addr)
            .map_err(HvError::kvm("KVM_SET_IDENTITY_MAP_ADDR"))
    }

    fn create_irq_chip(&mut self) -> HvResult<()> {
        self.vm
            .create_irq_chip()
            .map_err(HvError::kvm("KVM_CREATE_IRQCHIP"))?;
        self.irqchip = true;
        Ok(())
    }

    fn create_pit(&mut self, config: &PitConfig) -> HvResult<()> {
        let pit_config = kvm_pit_config {
            flags: config.flags,
            ..Default::default()
        };
        self.vm
            .create_pit2(pit_config)
            .map_err(HvError::kvm("KVM_CREATE_PIT2"))?;
        self.pit = true;
        Ok(())
    }

    fn set_pit_reinject(&mut self, reinject: u8) -> HvResult<()> {
        let ctl = kvm_reinject_control {
            pit_reinject: reinject,
            ..Default::default()
        };
        // SAFETY: the kernel reads a kvm_reinject_control we own.
        check("KVM_REINJECT_CONTROL", unsafe {
            ioctl_with_ref(&self.vm, KVM_REINJECT_CONTROL(), &ctl)
        })
    }

    fn set_xen_hvm_config(&mut self, config: &XenHvmConfig) -> HvResult<()> {
        let xen = kvm_xen_hvm_config {
            flags: config.flags,
            msr: config.msr,
            blob_addr_32: config.blob_addr_32,
            blob_addr_64: config.blob_addr_64,
            blob_size_32: config.blob_size_32,
            blob_size_64: config.blob_size_64,
            ..Default::default()
        };
        // SAFETY: the kernel reads a kvm_xen_hvm_config we own.
        check("KVM_XEN_HVM_CONFIG", unsafe {
            ioctl_with_ref(&self.vm, KVM_XEN_HVM_CONFIG(), &xen)
        })
    }

    fn set_gsi_routing(&mut self, table: &IrqRoutingTable) -> HvResult<()> {
        let entries = table.entries();
        let header = size_of::<kvm_irq_routing>();
        let entry_size = size_of::<kvm_irq_routing_entry>();
        let total = header + entries.len() * entry_size;
        // u64 storage keeps the entry array 8-byte aligned.
        let mut storage = vec![0u64; total.div_ceil(8)];
        // SAFETY: `storage` spans at least `total` bytes.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(storage.as_mut_ptr() as *mut u8, total) };
        bytes[..4].copy_from_slice(&(entries.len() as u32).to_ne_bytes());
        for (i, entry) in entries.iter().enumerate() {
            let off = header + i * entry_size;
            bytes[off..off + entry_size].copy_from_slice(bytes_of(entry));
        }
        // SAFETY: header plus `nr` entries laid out contiguously, as the
        // ioctl expects.
        check("KVM_SET_GSI_ROUTING", unsafe {
            ioctl_with_ptr(
                &self.vm,
                KVM_SET_GSI_ROUTING(),
                storage.as_ptr() as *const kvm_irq_routing,
            )
        })
    }

    fn register_coalesced_mmio(&mut self, zone: &CoalescedMmioZone) -> HvResult<()> {
        let addr = if zone.pio {
            IoEventAddress::Pio(zone.addr)
        } else {
            IoEventAddress::Mmio(zone.addr)
        };
        self.vm
            .register_coalesced_mmio(addr, zone.size)
            .map_err(HvError::kvm("KVM_REGISTER_COALESCED_MMIO"))
    }

    fn register_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<i32> {
        let owned = if ioevent.fd < 0 {
            Some(EventFd::new(libc::EFD_NONBLOCK).map_err(|source| HvError::Io {
                op: "eventfd",
                source,
            })?)
        } else {
            None
        };
        let fd = owned.as_ref().map_or(ioevent.fd, |e| e.as_raw_fd());
        self.ioeventfd_ioctl(ioevent, fd, ioevent.flags & !IOEVENTFD_FLAG_DEASSIGN)?;
        debug!(
            "ioeventfd {} registered at {:?} len {}",
            fd,
            Self::ioevent_address(ioevent),
            ioevent.len
        );
        if let Some(evt) = owned {
            self.ioevents.insert(Self::ioevent_key(ioevent), evt);
        }
        Ok(fd)
    }

    fn unregister_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<()> {
        let key = Self::ioevent_key(ioevent);
        let fd = match self.ioevents.get(&key) {
            Some(evt) => evt.as_raw_fd(),
            None => ioevent.fd,
        };
        self.ioeventfd_ioctl(ioevent, fd, ioevent.flags | IOEVENTFD_FLAG_DEASSIGN)?;
        self.ioevents.remove(&key);
        Ok(())
    }

    fn register_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<i32> {
        let new_evt = || {
            EventFd::new(libc::EFD_NONBLOCK).map_err(|source| HvError::Io {
                op: "eventfd",
                source,
            })
        };
        let resampling = irqfd.flags & IRQFD_FLAG_RESAMPLE != 0;
        let owned = if irqfd.fd < 0 {
            let resample = if resampling { Some(new_evt()?) } else { None };
            Some((new_evt()?, resample))
        } else {
            None
        };
        let (fd, resamplefd) = match &owned {
            Some((trigger, resample)) => (
                trigger.as_raw_fd(),
                resample.as_ref().map_or(0, |e| e.as_raw_fd()),
            ),
            None => (irqfd.fd, irqfd.resamplefd),
        };
        let req = kvm_irqfd {
            fd: fd as u32,
            gsi: irqfd.gsi,
            flags: irqfd.flags & !IRQFD_FLAG_DEASSIGN,
            resamplefd: resamplefd as u32,
            ..Default::default()
        };
        // SAFETY: the kernel reads a kvm_irqfd we own.
        check("KVM_IRQFD", unsafe { ioctl_with_ref(&self.vm, KVM_IRQFD(), &req) })?;
        debug!("irqfd {} registered for GSI {}", fd, irqfd.gsi);
        if let Some(evts) = owned {
            self.irqfds.insert(irqfd.gsi, evts);
        }
        Ok(fd)
    }

    fn unregister_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<()> {
        let fd = match self.irqfds.get(&irqfd.gsi) {
            Some((evt, _)) => evt.as_raw_fd(),
            None => irqfd.fd,
        };
        let req = kvm_irqfd {
            fd: fd as u32,
            gsi: irqfd.gsi,
            flags: irqfd.flags | IRQFD_FLAG_DEASSIGN,
            ..Default::default()
        };
        // SAFETY: the kernel reads a kvm_irqfd we own.
        check("KVM_IRQFD", unsafe { ioctl_with_ref(&self.vm, KVM_IRQFD(), &req) })?;
        self.irqfds.remove(&irqfd.gsi);
        Ok(())
    }

    fn create_device(&mut self, device: &DeviceRecord) -> HvResult<u32> {
        let mut req = kvm_create_device {
            type_: device.type_,
            fd: 0,
            flags: device.flags,
        };
        let dev = self
            .vm
            .create_device(&mut req)
            .map_err(HvError::kvm("KVM_CREATE_DEVICE"))?;
        let fd = dev.as_raw_fd() as u32;
        self.devices.push(dev);
        Ok(fd)
    }

    fn get_pit_state(&self) -> HvResult<kvm_pit_state2> {
        if !self.pit {
            return Err(HvError::Unsupported("PIT state without a PIT"));
        }
        self.vm.get_pit2().map_err(HvError::kvm("KVM_GET_PIT2"))
    }

    fn set_pit_state(&mut self, state: &kvm_pit_state2) -> HvResult<()> {
        self.vm.set_pit2(state).map_err(HvError::kvm("KVM_SET_PIT2"))
    }

    fn get_clock(&self) -> HvResult<kvm_clock_data> {
        self.vm.get_clock().map_err(HvError::kvm("KVM_GET_CLOCK"))
    }

    fn set_clock(&mut self, clock: &kvm_clock_data) -> HvResult<()> {
        // The kernel rejects flags it did not hand out itself.
        let clock = kvm_clock_data {
            flags: 0,
            ..*clock
        };
        self.vm.set_clock(&clock).map_err(HvError::kvm("KVM_SET_CLOCK"))
    }

    fn get_irqchip(&self, chip: IrqChip) -> HvResult<kvm_irqchip> {
        if !self.irqchip {
            return Err(HvError::Unsupported("irqchip state without an irqchip"));
        }
        let mut state = kvm_irqchip {
            chip_id: chip.chip_id(),
            ..Default::default()
        };
        self.vm
            .get_irqchip(&mut state)
            .map_err(HvError::kvm("KVM_GET_IRQCHIP"))?;
        Ok(state)
    }

    fn set_irqchip(&mut self, state: &kvm_irqchip) -> HvResult<()> {
        self.vm
            .set_irqchip(state)
            .map_err(HvError::kvm("KVM_SET_IRQCHIP"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU
// ═══════════════════════════════════════════════════════════════════════

/// A KVM vCPU.
pub struct KvmVcpu {
    fd: VcpuFd,
    msr_indices: Vec<u32>,
    lapic: bool,
}

impl VcpuControl for KvmVcpu {
    fn get_regs(&self) -> HvResult<kvm_regs> {
        self.fd.get_regs().map_err(HvError::kvm("KVM_GET_REGS"))
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> HvResult<()> {
        self.fd.set_regs(regs).map_err(HvError::kvm("KVM_SET_REGS"))
    }

    fn get_sregs(&self) -> HvResult<kvm_sregs> {
        self.fd.get_sregs().map_err(HvError::kvm("KVM_GET_SREGS"))
    }

    fn set_sregs(&mut self, sregs: &kvm_sregs) -> HvResult<()> {
        self.fd.set_sregs(sregs).map_err(HvError::kvm("KVM_SET_SREGS"))
    }

    fn get_debug_regs(&self) -> HvResult<kvm_debugregs> {
        self.fd
            .get_debug_regs()
            .map_err(HvError::kvm("KVM_GET_DEBUGREGS"))
    }

    fn set_debug_regs(&mut self, regs: &kvm_debugregs) -> HvResult<()> {
        self.fd
            .set_debug_regs(regs)
            .map_err(HvError::kvm("KVM_SET_DEBUGREGS"))
    }

    fn get_vcpu_events(&self) -> HvResult<kvm_vcpu_events> {
        self.fd
            .get_vcpu_events()
            .map_err(HvError::kvm("KVM_GET_VCPU_EVENTS"))
    }

    fn set_vcpu_events(&mut self, events: &kvm_vcpu_events) -> HvResult<()> {
        self.fd
            .set_vcpu_events(events)
            .map_err(HvError::kvm("KVM_SET_VCPU_EVENTS"))
    }

    fn get_xsave(&self) -> HvResult<kvm_xsave> {
        self.fd.get_xsave().map_err(HvError::kvm("KVM_GET_XSAVE"))
    }

    #[allow(unused_unsafe)]
    fn set_xsave(&mut self, xsave: &kvm_xsave) -> HvResult<()> {
        // SAFETY: `xsave` was produced by KVM_GET_XSAVE on this host.
        unsafe { self.fd.set_xsave(xsave) }.map_err(HvError::kvm("KVM_SET_XSAVE"))
    }

    fn get_xcrs(&self) -> HvResult<kvm_xcrs> {
        self.fd.get_xcrs().map_err(HvError::kvm("KVM_GET_XCRS"))
    }

    fn set_xcrs(&mut self, xcrs: &kvm_xcrs) -> HvResult<()> {
        self.fd.set_xcrs(xcrs).map_err(HvError::kvm("KVM_SET_XCRS"))
    }

    fn get_fpu(&self) -> HvResult<kvm_fpu> {
        self.fd.get_fpu().map_err(HvError::kvm("KVM_GET_FPU"))
    }

    fn set_fpu(&mut self, fpu: &kvm_fpu) -> HvResult<()> {
        self.fd.set_fpu(fpu).map_err(HvError::kvm("KVM_SET_FPU"))
    }

    fn get_mp_state(&self) -> HvResult<kvm_mp_state> {
        self.fd
            .get_mp_state()
            .map_err(HvError::kvm("KVM_GET_MP_STATE"))
    }

    fn set_mp_state(&mut self, state: &kvm_mp_state) -> HvResult<()> {
        self.fd
            .set_mp_state(*state)
            .map_err(HvError::kvm("KVM_SET_MP_STATE"))
    }

    fn get_lapic(&self) -> HvResult<kvm_lapic_state> {
        if !self.lapic {
            return Err(HvError::Unsupported("LAPIC state without an irqchip"));
        }
        self.fd.get_lapic().map_err(HvError::kvm("KVM_GET_LAPIC"))
    }

    fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> HvResult<()> {
        self.fd.set_lapic(lapic).map_err(HvError::kvm("KVM_SET_LAPIC"))
    }

    fn get_tsc_khz(&self) -> HvResult<u32> {
        match self.fd.get_tsc_khz() {
            Ok(khz) => Ok(khz),
            Err(e) if e.errno() == libc::EIO => Err(HvError::Unsupported("TSC frequency")),
            Err(source) => Err(HvError::Kvm {
                op: "KVM_GET_TSC_KHZ",
                source,
            }),
        }
    }

    fn set_tsc_khz(&mut self, khz: u32) -> HvResult<()> {
        self.fd
            .set_tsc_khz(khz)
            .map_err(HvError::kvm("KVM_SET_TSC_KHZ"))
    }

    fn get_msrs(&self) -> HvResult<Vec<MsrEntry>> {
        if self.msr_indices.is_empty() {
            return Err(HvError::Unsupported("MSR index list"));
        }
        let mut out = Vec::with_capacity(self.msr_indices.len());
        for chunk in self.msr_indices.chunks(KVM_MAX_MSR_ENTRIES) {
            let entries: Vec<kvm_msr_entry> = chunk
                .iter()
                .map(|&index| kvm_msr_entry {
                    index,
                    ..Default::default()
                })
                .collect();
            let mut msrs =
                Msrs::from_entries(&entries).map_err(|_| HvError::TooManyMsrs(entries.len()))?;
            let read = self
                .fd
                .get_msrs(&mut msrs)
                .map_err(HvError::kvm("KVM_GET_MSRS"))?;
            out.extend(msrs.as_slice()[..read].iter().map(|e| MsrEntry {
                index: e.index,
                data: e.data,
            }));
        }
        Ok(out)
    }

    fn set_msrs(&mut self, msrs: &[MsrEntry]) -> HvResult<()> {
        for chunk in msrs.chunks(KVM_MAX_MSR_ENTRIES) {
            let entries: Vec<kvm_msr_entry> = chunk
                .iter()
                .map(|m| kvm_msr_entry {
                    index: m.index,
                    data: m.data,
                    ..Default::default()
                })
                .collect();
            let wrapper =
                Msrs::from_entries(&entries).map_err(|_| HvError::TooManyMsrs(entries.len()))?;
            let written = self
                .fd
                .set_msrs(&wrapper)
                .map_err(HvError::kvm("KVM_SET_MSRS"))?;
            if written != entries.len() {
                warn!(
                    "KVM_SET_MSRS stopped at MSR {:#x} ({} of {} written)",
                    entries[written].index,
                    written,
                    entries.len()
                );
            }
        }
        Ok(())
    }

    fn set_guest_debug(&mut self, control: &DebugControl) -> HvResult<()> {
        let dbg = kvm_guest_debug {
            control: control.control,
            pad: 0,
            arch: kvm_guest_debug_arch {
                debugreg: control.debugreg,
            },
        };
        self.fd
            .set_guest_debug(&dbg)
            .map_err(HvError::kvm("KVM_SET_GUEST_DEBUG"))
    }

    fn translate(&self, gva: u64) -> HvResult<Option<u64>> {
        let tr = self
            .fd
            .translate_gva(gva)
            .map_err(HvError::kvm("KVM_TRANSLATE"))?;
        Ok((tr.valid != 0).then_some(tr.physical_address))
    }

    fn run(&mut self) -> HvResult<ExitReason> {
        match self.fd.run() {
            Ok(exit) => Ok(match exit {
                VcpuExit::IoOut(port, _) => ExitReason::Io { port, write: true },
                VcpuExit::IoIn(port, data) => {
                    // Nothing is decoded on this bus; reads float high.
                    data.fill(0xff);
                    ExitReason::Io { port, write: false }
                }
                VcpuExit::MmioRead(addr, data) => {
                    data.fill(0);
                    ExitReason::Mmio { addr, write: false }
                }
                VcpuExit::MmioWrite(addr, _) => ExitReason::Mmio { addr, write: true },
                VcpuExit::Debug(arch) => ExitReason::Debug(DebugExit {
                    exception: arch.exception,
                    pc: arch.pc,
                    dr6: arch.dr6,
                    dr7: arch.dr7,
                }),
                VcpuExit::Hlt => ExitReason::Hlt,
                VcpuExit::Shutdown => ExitReason::Shutdown,
                VcpuExit::FailEntry(reason, _) => ExitReason::FailEntry { reason },
                VcpuExit::Intr => ExitReason::Interrupted,
                VcpuExit::InternalError => ExitReason::InternalError,
                other => ExitReason::Other(format!("{:?}", other)),
            }),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                Ok(ExitReason::Interrupted)
            }
            Err(source) => Err(HvError::Kvm {
                op: "KVM_RUN",
                source,
            }),
        }
    }
}
