//! The hardware-virtualization control seam.
//!
//! Everything above this module talks to the hypervisor through
//! [`VmControl`] and [`VcpuControl`].  The production implementation is
//! [`crate::kvm`]; tests use the scripted backend in `crate::mock`.

use crate::instrument::DebugControl;
use crate::record::{
    CoalescedMmioZone, DeviceRecord, IoEventFd, IrqFd, IrqRoutingTable, MemoryRegionRecord,
    PitConfig, XenHvmConfig,
};
use kvm_bindings::{
    kvm_clock_data, kvm_debugregs, kvm_fpu, kvm_irqchip, kvm_lapic_state, kvm_mp_state,
    kvm_pit_state2, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs, kvm_xsave,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::GuestMemoryMmap;

/// Errors from the hardware-virtualization control layer.
#[derive(Error, Debug)]
pub enum HvError {
    #[error("KVM {op} failed: {source}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    /// The backend cannot provide this piece of state.  Capture treats it
    /// as "absent" rather than as a failure.
    #[error("{0} is not supported by this hypervisor")]
    Unsupported(&'static str),

    #[error("Guest memory error: {0}")]
    Memory(String),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Too many MSRs for one request: {0}")]
    TooManyMsrs(usize),
}

impl HvError {
    pub fn kvm(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> Self {
        move |source| HvError::Kvm { op, source }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, HvError::Unsupported(_))
    }
}

pub type HvResult<T> = Result<T, HvError>;

/// One model-specific register value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsrEntry {
    pub index: u32,
    pub data: u64,
}

/// Which in-kernel interrupt controller a `kvm_irqchip` describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqChip {
    PicMaster,
    PicSlave,
    IoApic,
}

impl IrqChip {
    pub fn chip_id(self) -> u32 {
        match self {
            IrqChip::PicMaster => kvm_bindings::KVM_IRQCHIP_PIC_MASTER,
            IrqChip::PicSlave => kvm_bindings::KVM_IRQCHIP_PIC_SLAVE,
            IrqChip::IoApic => kvm_bindings::KVM_IRQCHIP_IOAPIC,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Exits
// ═══════════════════════════════════════════════════════════════════════

/// `KVM_EXIT_DEBUG` payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugExit {
    /// Vector that caused the exit: 1 (#DB) or 3 (#BP).
    pub exception: u32,
    /// Linear address of the instruction pointer at the exit.
    pub pc: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// DR6.BS: the #DB was raised by a single step.
pub const DR6_BS: u64 = 1 << 14;

impl DebugExit {
    pub fn is_single_step(&self) -> bool {
        self.exception == 1 && self.dr6 & DR6_BS != 0
    }

    pub fn is_breakpoint(&self) -> bool {
        self.exception == 3 || (self.exception == 1 && self.dr6 & 0xf != 0)
    }
}

/// Owned description of why `run` returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Debug(DebugExit),
    Hlt,
    Shutdown,
    Io { port: u16, write: bool },
    Mmio { addr: u64, write: bool },
    /// The run ioctl was interrupted by a signal.
    Interrupted,
    FailEntry { reason: u64 },
    InternalError,
    Other(String),
}

impl ExitReason {
    /// Whether the engine can simply re-enter the guest.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExitReason::Io { .. } | ExitReason::Mmio { .. } | ExitReason::Interrupted
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Control traits
// ═══════════════════════════════════════════════════════════════════════

/// VM-level hardware-virtualization operations.
pub trait VmControl {
    fn create_vcpu(&mut self, id: u32) -> HvResult<Box<dyn VcpuControl>>;

    /// Install `region`, backed by the matching range of `memory`.
    fn set_memory_region(
        &mut self,
        region: &MemoryRegionRecord,
        memory: &GuestMemoryMmap,
    ) -> HvResult<()>;
    fn remove_memory_region(&mut self, region: &MemoryRegionRecord) -> HvResult<()>;

    fn set_boot_cpu_id(&mut self, id: u64) -> HvResult<()>;
    fn set_tss_address(&mut self, addr: u64) -> HvResult<()>;
    fn set_identity_map_address(&mut self, addr: u64) -> HvResult<()>;
    fn create_irq_chip(&mut self) -> HvResult<()>;
    fn create_pit(&mut self, config: &PitConfig) -> HvResult<()>;
    fn set_pit_reinject(&mut self, reinject: u8) -> HvResult<()>;
    fn set_xen_hvm_config(&mut self, config: &XenHvmConfig) -> HvResult<()>;
    fn set_gsi_routing(&mut self, table: &IrqRoutingTable) -> HvResult<()>;
    fn register_coalesced_mmio(&mut self, zone: &CoalescedMmioZone) -> HvResult<()>;

    /// Register an ioeventfd and return the file descriptor now backing it.
    /// A negative `fd` asks the backend to create and own a fresh eventfd.
    fn register_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<i32>;
    fn unregister_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<()>;

    /// Register an irqfd and return the file descriptor now backing it.
    /// A negative `fd` asks the backend to create and own a fresh eventfd.
    fn register_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<i32>;
    fn unregister_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<()>;

    /// Create an in-kernel device and return its file descriptor.
    fn create_device(&mut self, device: &DeviceRecord) -> HvResult<u32>;

    fn get_pit_state(&self) -> HvResult<kvm_pit_state2>;
    fn set_pit_state(&mut self, state: &kvm_pit_state2) -> HvResult<()>;
    fn get_clock(&self) -> HvResult<kvm_clock_data>;
    fn set_clock(&mut self, clock: &kvm_clock_data) -> HvResult<()>;
    fn get_irqchip(&self, chip: IrqChip) -> HvResult<kvm_irqchip>;
    fn set_irqchip(&mut self, state: &kvm_irqchip) -> HvResult<()>;
}

/// vCPU-level hardware-virtualization operations.
pub trait VcpuControl {
    fn get_regs(&self) -> HvResult<kvm_regs>;
    fn set_regs(&mut self, regs: &kvm_regs) -> HvResult<()>;
    fn get_sregs(&self) -> HvResult<kvm_sregs>;
    fn set_sregs(&mut self, sregs: &kvm_sregs) -> HvResult<()>;
    fn get_debug_regs(&self) -> HvResult<kvm_debugregs>;
    fn set_debug_regs(&mut self, regs: &kvm_debugregs) -> HvResult<()>;
    fn get_vcpu_events(&self) -> HvResult<kvm_vcpu_events>;
    fn set_vcpu_events(&mut self, events: &kvm_vcpu_events) -> HvResult<()>;
    fn get_xsave(&self) -> HvResult<kvm_xsave>;
    fn set_xsave(&mut self, xsave: &kvm_xsave) -> HvResult<()>;
    fn get_xcrs(&self) -> HvResult<kvm_xcrs>;
    fn set_xcrs(&mut self, xcrs: &kvm_xcrs) -> HvResult<()>;
    fn get_fpu(&self) -> HvResult<kvm_fpu>;
    fn set_fpu(&mut self, fpu: &kvm_fpu) -> HvResult<()>;
    fn get_mp_state(&self) -> HvResult<kvm_mp_state>;
    fn set_mp_state(&mut self, state: &kvm_mp_state) -> HvResult<()>;
    fn get_lapic(&self) -> HvResult<kvm_lapic_state>;
    fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> HvResult<()>;
    fn get_tsc_khz(&self) -> HvResult<u32>;
    fn set_tsc_khz(&mut self, khz: u32) -> HvResult<()>;
    fn get_msrs(&self) -> HvResult<Vec<MsrEntry>>;
    fn set_msrs(&mut self, msrs: &[MsrEntry]) -> HvResult<()>;

    fn set_guest_debug(&mut self, control: &DebugControl) -> HvResult<()>;

    /// Translate a guest virtual address through the vCPU's current page
    /// tables.  `None` means the address is not mapped.
    fn translate(&self, gva: u64) -> HvResult<Option<u64>>;

    /// Enter the guest and block until the next exit.
    fn run(&mut self) -> HvResult<ExitReason>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_exit_classification() {
        let step = DebugExit {
            exception: 1,
            pc: 0x1001,
            dr6: DR6_BS,
            dr7: 0,
        };
        assert!(step.is_single_step());
        assert!(!step.is_breakpoint());

        let hw = DebugExit {
            exception: 1,
            pc: 0x1000,
            dr6: 0b0001,
            dr7: 0b01,
        };
        assert!(hw.is_breakpoint());

        let sw = DebugExit {
            exception: 3,
            pc: 0x2000,
            ..Default::default()
        };
        assert!(sw.is_breakpoint());
        assert!(!sw.is_single_step());
    }

    #[test]
    fn recoverable_exits() {
        assert!(ExitReason::Io {
            port: 0x3f8,
            write: true
        }
        .is_recoverable());
        assert!(ExitReason::Interrupted.is_recoverable());
        assert!(!ExitReason::Hlt.is_recoverable());
        assert!(!ExitReason::Shutdown.is_recoverable());
        assert!(!ExitReason::Debug(DebugExit::default()).is_recoverable());
    }
}
