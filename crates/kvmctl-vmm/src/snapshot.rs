//! Point-in-time snapshots of a VM.
//!
//! A [`VmSnapshot`] aggregates the VM record, the architectural state of
//! every vCPU, full copies of guest memory, emulated-device blobs,
//! instrumentation points and the in-kernel timer / interrupt-controller
//! state.  Every hardware sub-structure is optional: a backend that cannot
//! report a piece of state simply leaves it absent.

use crate::hypervisor::{HvError, HvResult, IrqChip, MsrEntry, VcpuControl, VmControl};
use crate::instrument::{DebugControl, HookPoint, PatchPoint, StopPoint};
use crate::record::{RecordList, VmRecord};
use crate::state::StateBlob;
use kvm_bindings::{
    kvm_clock_data, kvm_debugregs, kvm_fpu, kvm_irqchip, kvm_lapic_state, kvm_mp_state,
    kvm_pit_state2, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs, kvm_xsave,
};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `KVM_CLOCK_TSC_STABLE`: host-dependent, ignored by [`TimerState`]
/// equality.
pub const CLOCK_TSC_STABLE: u32 = 1 << 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to capture {what}: {source}")]
    Capture {
        what: &'static str,
        #[source]
        source: HvError,
    },

    #[error("Failed to restore {what}: {source}")]
    Restore {
        what: &'static str,
        #[source]
        source: HvError,
    },

    #[error("Failed to read guest memory region {slot}")]
    ReadMemory { slot: u32 },

    #[error("Failed to write guest memory region {slot}")]
    WriteMemory { slot: u32 },

    #[error("Snapshot has no memory region for slot {slot}")]
    MissingRegion { slot: u32 },
}

/// Unsupported state is captured as absent; anything else is fatal.
fn optional<T>(what: &'static str, result: HvResult<T>) -> Result<Option<T>, SnapshotError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unsupported() => {
            debug!("{} not available, leaving it out of the snapshot", what);
            Ok(None)
        }
        Err(source) => Err(SnapshotError::Capture { what, source }),
    }
}

fn restored(what: &'static str, result: HvResult<()>) -> Result<(), SnapshotError> {
    result.map_err(|source| SnapshotError::Restore { what, source })
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU state
// ═══════════════════════════════════════════════════════════════════════

/// Captured architectural state of one vCPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VcpuSnapshot {
    pub id: u32,
    pub regs: Option<StateBlob<kvm_regs>>,
    pub sregs: Option<StateBlob<kvm_sregs>>,
    pub debug_regs: Option<StateBlob<kvm_debugregs>>,
    pub events: Option<StateBlob<kvm_vcpu_events>>,
    pub xsave: Option<StateBlob<kvm_xsave>>,
    pub xcrs: Option<StateBlob<kvm_xcrs>>,
    pub fpu: Option<StateBlob<kvm_fpu>>,
    pub mp_state: Option<StateBlob<kvm_mp_state>>,
    pub lapic: Option<StateBlob<kvm_lapic_state>>,
    pub tsc_khz: Option<u32>,
    pub msrs: Option<Vec<MsrEntry>>,
    pub debug_control: Option<DebugControl>,
}

impl VcpuSnapshot {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Capture everything the backend can report.
    pub fn capture(
        id: u32,
        vcpu: &dyn VcpuControl,
        debug_control: DebugControl,
    ) -> Result<Self, SnapshotError> {
        Ok(Self {
            id,
            regs: optional("registers", vcpu.get_regs())?.map(|v| StateBlob::new(&v)),
            sregs: optional("special registers", vcpu.get_sregs())?.map(|v| StateBlob::new(&v)),
            debug_regs: optional("debug registers", vcpu.get_debug_regs())?
                .map(|v| StateBlob::new(&v)),
            events: optional("vCPU events", vcpu.get_vcpu_events())?.map(|v| StateBlob::new(&v)),
            xsave: optional("XSAVE", vcpu.get_xsave())?.map(|v| StateBlob::new(&v)),
            xcrs: optional("XCRs", vcpu.get_xcrs())?.map(|v| StateBlob::new(&v)),
            fpu: optional("FPU", vcpu.get_fpu())?.map(|v| StateBlob::new(&v)),
            mp_state: optional("MP state", vcpu.get_mp_state())?.map(|v| StateBlob::new(&v)),
            lapic: optional("LAPIC", vcpu.get_lapic())?.map(|v| StateBlob::new(&v)),
            tsc_khz: optional("TSC frequency", vcpu.get_tsc_khz())?,
            msrs: optional("MSRs", vcpu.get_msrs())?,
            debug_control: Some(debug_control),
        })
    }

    /// Write every present field back to `vcpu`.
    pub fn restore(&self, vcpu: &mut dyn VcpuControl) -> Result<(), SnapshotError> {
        if let Some(khz) = self.tsc_khz {
            restored("TSC frequency", vcpu.set_tsc_khz(khz))?;
        }
        if let Some(sregs) = &self.sregs {
            restored("special registers", vcpu.set_sregs(&sregs.get()))?;
        }
        if let Some(regs) = &self.regs {
            restored("registers", vcpu.set_regs(&regs.get()))?;
        }
        if let Some(fpu) = &self.fpu {
            restored("FPU", vcpu.set_fpu(&fpu.get()))?;
        }
        if let Some(xcrs) = &self.xcrs {
            restored("XCRs", vcpu.set_xcrs(&xcrs.get()))?;
        }
        if let Some(xsave) = &self.xsave {
            restored("XSAVE", vcpu.set_xsave(&xsave.get()))?;
        }
        if let Some(msrs) = &self.msrs {
            restored("MSRs", vcpu.set_msrs(msrs))?;
        }
        if let Some(debug_regs) = &self.debug_regs {
            restored("debug registers", vcpu.set_debug_regs(&debug_regs.get()))?;
        }
        if let Some(lapic) = &self.lapic {
            restored("LAPIC", vcpu.set_lapic(&lapic.get()))?;
        }
        if let Some(events) = &self.events {
            restored("vCPU events", vcpu.set_vcpu_events(&events.get()))?;
        }
        if let Some(mp_state) = &self.mp_state {
            restored("MP state", vcpu.set_mp_state(&mp_state.get()))?;
        }
        Ok(())
    }

    pub fn rip(&self) -> Option<u64> {
        self.regs.as_ref().map(|r| r.get().rip)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory and devices
// ═══════════════════════════════════════════════════════════════════════

/// A full copy of one guest memory slot.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegionSnapshot {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub size: u64,
    pub contents: Vec<u8>,
}

impl std::fmt::Debug for MemoryRegionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegionSnapshot")
            .field("slot", &self.slot)
            .field("flags", &self.flags)
            .field("guest_phys_addr", &format_args!("{:#x}", self.guest_phys_addr))
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Opaque state of one emulated device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmuDeviceSnapshot {
    pub name: String,
    pub data: Vec<u8>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Timer / interrupt-controller state
// ═══════════════════════════════════════════════════════════════════════

/// In-kernel PIT, kvmclock and irqchip state.
///
/// Equality ignores fields the host perturbs between otherwise identical
/// runs: each PIT channel's `count_load_time`, the PIC interrupt-request
/// registers and the clock's [`CLOCK_TSC_STABLE`] flag.
#[derive(Clone, Debug, Default)]
pub struct TimerState {
    pub pit: Option<StateBlob<kvm_pit_state2>>,
    pub clock: Option<StateBlob<kvm_clock_data>>,
    pub pic_master: Option<StateBlob<kvm_irqchip>>,
    pub pic_slave: Option<StateBlob<kvm_irqchip>>,
    pub ioapic: Option<StateBlob<kvm_irqchip>>,
}

impl TimerState {
    pub fn capture(vm: &dyn VmControl) -> Result<Self, SnapshotError> {
        Ok(Self {
            pit: optional("PIT", vm.get_pit_state())?.map(|v| StateBlob::new(&v)),
            clock: optional("clock", vm.get_clock())?.map(|v| StateBlob::new(&v)),
            pic_master: optional("PIC master", vm.get_irqchip(IrqChip::PicMaster))?
                .map(|v| StateBlob::new(&v)),
            pic_slave: optional("PIC slave", vm.get_irqchip(IrqChip::PicSlave))?
                .map(|v| StateBlob::new(&v)),
            ioapic: optional("IOAPIC", vm.get_irqchip(IrqChip::IoApic))?
                .map(|v| StateBlob::new(&v)),
        })
    }

    /// Restore in-kernel devices; must run before vCPU state.
    pub fn restore(&self, vm: &mut dyn VmControl) -> Result<(), SnapshotError> {
        if let Some(pit) = &self.pit {
            restored("PIT", vm.set_pit_state(&pit.get()))?;
        }
        if let Some(clock) = &self.clock {
            restored("clock", vm.set_clock(&clock.get()))?;
        }
        for (what, chip) in [
            ("PIC master", &self.pic_master),
            ("PIC slave", &self.pic_slave),
            ("IOAPIC", &self.ioapic),
        ] {
            if let Some(chip) = chip {
                restored(what, vm.set_irqchip(&chip.get()))?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pit.is_none()
            && self.clock.is_none()
            && self.pic_master.is_none()
            && self.pic_slave.is_none()
            && self.ioapic.is_none()
    }

    fn normalized_pit(pit: &StateBlob<kvm_pit_state2>) -> StateBlob<kvm_pit_state2> {
        let mut pit = pit.clone();
        pit.update(|p| {
            for channel in p.channels.iter_mut() {
                channel.count_load_time = 0;
            }
        });
        pit
    }

    fn normalized_clock(clock: &StateBlob<kvm_clock_data>) -> StateBlob<kvm_clock_data> {
        let mut clock = clock.clone();
        clock.update(|c| c.flags &= !CLOCK_TSC_STABLE);
        clock
    }

    fn normalized_pic(chip: &StateBlob<kvm_irqchip>) -> StateBlob<kvm_irqchip> {
        let mut chip = chip.clone();
        chip.update(|c| {
            // SAFETY: PIC chip ids always carry the `pic` member.
            let mut pic = unsafe { c.chip.pic };
            pic.irr = 0;
            c.chip.pic = pic;
        });
        chip
    }
}

fn eq_by<T: crate::state::KvmState>(
    a: &Option<StateBlob<T>>,
    b: &Option<StateBlob<T>>,
    normalize: fn(&StateBlob<T>) -> StateBlob<T>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize(a) == normalize(b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for TimerState {
    fn eq(&self, other: &Self) -> bool {
        eq_by(&self.pit, &other.pit, TimerState::normalized_pit)
            && eq_by(&self.clock, &other.clock, TimerState::normalized_clock)
            && eq_by(&self.pic_master, &other.pic_master, TimerState::normalized_pic)
            && eq_by(&self.pic_slave, &other.pic_slave, TimerState::normalized_pic)
            && self.ioapic == other.ioapic
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  VmSnapshot
// ═══════════════════════════════════════════════════════════════════════

/// A named, restorable checkpoint of a whole VM.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmSnapshot {
    pub id: u32,
    pub record: VmRecord,
    pub vcpus: Vec<VcpuSnapshot>,
    pub memory: Vec<MemoryRegionSnapshot>,
    pub emu_devices: RecordList<EmuDeviceSnapshot>,
    pub patch_points: Vec<PatchPoint>,
    pub stop_points: Vec<StopPoint>,
    /// Runtime-only: callbacks are never persisted.
    pub hook_points: Vec<HookPoint>,
    pub timer: TimerState,
}

impl VmSnapshot {
    /// An empty snapshot: nothing present, every list empty.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn insert_emu_device(&mut self, device: EmuDeviceSnapshot) {
        self.emu_devices.record(device);
    }

    pub fn vcpu(&self, id: u32) -> Option<&VcpuSnapshot> {
        self.vcpus.iter().find(|v| v.id == id)
    }

    pub fn vcpu_mut(&mut self, id: u32) -> Option<&mut VcpuSnapshot> {
        self.vcpus.iter_mut().find(|v| v.id == id)
    }

    pub fn region(&self, slot: u32) -> Option<&MemoryRegionSnapshot> {
        self.memory.iter().find(|r| r.slot == slot)
    }

    /// Total bytes of captured guest memory.
    pub fn memory_size(&self) -> u64 {
        self.memory.iter().map(|r| r.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::KVM_IRQCHIP_PIC_MASTER;

    #[test]
    fn new_snapshot_is_empty() {
        let snap = VmSnapshot::new(7);
        assert_eq!(snap.id, 7);
        assert!(snap.record.is_empty());
        assert!(snap.vcpus.is_empty());
        assert!(snap.memory.is_empty());
        assert!(!snap.emu_devices.is_present());
        assert_eq!(snap.emu_devices.len(), 0);
        assert!(snap.patch_points.is_empty());
        assert!(snap.stop_points.is_empty());
        assert!(snap.hook_points.is_empty());
        assert!(snap.timer.is_empty());
    }

    #[test]
    fn new_vcpu_snapshot_has_nothing_present() {
        let vcpu = VcpuSnapshot::new(3);
        assert_eq!(vcpu.id, 3);
        assert!(vcpu.regs.is_none());
        assert!(vcpu.sregs.is_none());
        assert!(vcpu.xsave.is_none());
        assert!(vcpu.msrs.is_none());
        assert!(vcpu.debug_control.is_none());
        assert_eq!(vcpu.rip(), None);
    }

    #[test]
    fn insert_emu_device_sets_presence() {
        let mut snap = VmSnapshot::new(0);
        snap.insert_emu_device(EmuDeviceSnapshot {
            name: "serial".into(),
            data: vec![1, 2, 3],
        });
        snap.insert_emu_device(EmuDeviceSnapshot {
            name: "rtc".into(),
            data: vec![],
        });
        assert!(snap.emu_devices.is_present());
        assert_eq!(snap.emu_devices.len(), 2);
    }

    #[test]
    fn memory_equality_is_bytewise() {
        let region = MemoryRegionSnapshot {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            size: 4,
            contents: vec![1, 2, 3, 4],
        };
        let mut other = region.clone();
        assert_eq!(region, other);
        other.contents[3] = 5;
        assert_ne!(region, other);
    }

    #[test]
    fn timer_equality_ignores_load_time_and_irr() {
        let mut pit = kvm_pit_state2::default();
        pit.channels[0].count = 0x1234;
        pit.channels[0].count_load_time = 100;
        let mut pit_later = pit;
        pit_later.channels[0].count_load_time = 999;

        let mut pic = kvm_irqchip {
            chip_id: KVM_IRQCHIP_PIC_MASTER,
            ..Default::default()
        };
        let mut pic_state = unsafe { pic.chip.pic };
        pic_state.imr = 0xfb;
        pic_state.irr = 0x01;
        pic.chip.pic = pic_state;
        let mut pic_later = pic;
        pic_state.irr = 0x10;
        pic_later.chip.pic = pic_state;

        let clock = kvm_clock_data {
            clock: 42,
            flags: CLOCK_TSC_STABLE,
            ..Default::default()
        };
        let clock_later = kvm_clock_data {
            flags: 0,
            ..clock
        };

        let a = TimerState {
            pit: Some(StateBlob::new(&pit)),
            clock: Some(StateBlob::new(&clock)),
            pic_master: Some(StateBlob::new(&pic)),
            ..Default::default()
        };
        let b = TimerState {
            pit: Some(StateBlob::new(&pit_later)),
            clock: Some(StateBlob::new(&clock_later)),
            pic_master: Some(StateBlob::new(&pic_later)),
            ..Default::default()
        };
        assert_eq!(a, b);
        // The raw data still differs.
        assert_ne!(a.pit, b.pit);

        let mut c = b.clone();
        c.pit.as_mut().unwrap().update(|p| p.channels[0].count = 1);
        assert_ne!(a, c);
    }

    #[test]
    fn timer_presence_matters() {
        let a = TimerState {
            clock: Some(StateBlob::new(&kvm_clock_data::default())),
            ..Default::default()
        };
        assert_ne!(a, TimerState::default());
    }
}
