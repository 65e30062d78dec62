//! Scripted in-process hypervisor for tests.
//!
//! [`MockHypervisor`] implements the control traits without `/dev/kvm`.
//! Its vCPUs interpret a tiny instruction set straight out of guest
//! memory, with guest virtual == guest physical:
//!
//! | Opcode | Instruction | Exit |
//! |--------|-------------|------|
//! | `0x90` | `nop` | none |
//! | `0xf4` | `hlt` | [`ExitReason::Hlt`] |
//! | `0xcc` | `int3` | `#BP` debug exit when software breakpoints are intercepted, otherwise shutdown |
//! | `0xe6 ib` | `out imm8, al` | [`ExitReason::Io`] |
//!
//! Anything else, or a fetch outside guest memory, is a triple fault
//! ([`ExitReason::Shutdown`]).  Guest-debug controls are honoured the way
//! KVM reports them: hardware execution breakpoints fire before the
//! instruction, single-step fires after it.

use crate::hypervisor::{
    DebugExit, ExitReason, HvError, HvResult, IrqChip, MsrEntry, VcpuControl, VmControl, DR6_BS,
};
use crate::instrument::DebugControl;
use crate::record::{
    CoalescedMmioZone, DeviceRecord, IoEventFd, IrqFd, IrqRoutingTable, MemoryRegionRecord,
    PitConfig, XenHvmConfig,
};
use kvm_bindings::{
    kvm_clock_data, kvm_debugregs, kvm_fpu, kvm_irqchip, kvm_lapic_state, kvm_mp_state,
    kvm_pit_state2, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs, kvm_xsave,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_HW_BP,
    KVM_GUESTDBG_USE_SW_BP,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

pub const NOP: u8 = 0x90;
pub const HLT: u8 = 0xf4;
pub const INT3: u8 = 0xcc;
pub const OUT_IMM8: u8 = 0xe6;

/// Default `IA32_TSC` style MSRs every mock vCPU starts with.
const DEFAULT_MSRS: [(u32, u64); 3] = [(0x10, 0), (0x1b, 0xfee0_0900), (0xc000_0080, 0)];

/// Observable calls made against the mock VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockLog {
    pub boot_cpu_id: Option<u64>,
    pub tss_address: Option<u64>,
    pub identity_map_address: Option<u64>,
    pub pit_reinject: Option<u8>,
    pub xen_hvm_config: Option<XenHvmConfig>,
    pub gsi_routes: usize,
    pub coalesced_mmio: Vec<CoalescedMmioZone>,
    pub ioeventfds: Vec<IoEventFd>,
    pub irqfds: Vec<IrqFd>,
    pub devices: Vec<DeviceRecord>,
    pub memory_regions: Vec<MemoryRegionRecord>,
}

#[derive(Default)]
struct Shared {
    memory: Option<GuestMemoryMmap>,
    log: MockLog,
}

/// The VM half of the scripted backend.
pub struct MockHypervisor {
    shared: Rc<RefCell<Shared>>,
    next_fd: i32,
    pit: Option<kvm_pit_state2>,
    clock: kvm_clock_data,
    irqchips: Option<[kvm_irqchip; 3]>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared::default())),
            next_fd: 100,
            pit: None,
            clock: kvm_clock_data::default(),
            irqchips: None,
        }
    }

    /// A handle for inspecting calls after the mock has been boxed.
    pub fn log_handle(&self) -> MockLogHandle {
        MockLogHandle(self.shared.clone())
    }

    fn fd(&mut self) -> i32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    fn chip_index(chip_id: u32) -> Option<usize> {
        [IrqChip::PicMaster, IrqChip::PicSlave, IrqChip::IoApic]
            .iter()
            .position(|c| c.chip_id() == chip_id)
    }
}

/// Shared view of a [`MockHypervisor`]'s call log.
#[derive(Clone)]
pub struct MockLogHandle(Rc<RefCell<Shared>>);

impl MockLogHandle {
    pub fn log(&self) -> MockLog {
        self.0.borrow().log.clone()
    }
}

impl VmControl for MockHypervisor {
    fn create_vcpu(&mut self, id: u32) -> HvResult<Box<dyn VcpuControl>> {
        Ok(Box::new(MockVcpu::new(
            id,
            self.shared.clone(),
            self.irqchips.is_some(),
        )))
    }

    fn set_memory_region(
        &mut self,
        region: &MemoryRegionRecord,
        memory: &GuestMemoryMmap,
    ) -> HvResult<()> {
        let mut shared = self.shared.borrow_mut();
        shared.memory = Some(memory.clone());
        shared.log.memory_regions.retain(|r| r.slot != region.slot);
        shared.log.memory_regions.push(*region);
        Ok(())
    }

    fn remove_memory_region(&mut self, region: &MemoryRegionRecord) -> HvResult<()> {
        self.shared
            .borrow_mut()
            .log
            .memory_regions
            .retain(|r| r.slot != region.slot);
        Ok(())
    }

    fn set_boot_cpu_id(&mut self, id: u64) -> HvResult<()> {
        self.shared.borrow_mut().log.boot_cpu_id = Some(id);
        Ok(())
    }

    fn set_tss_address(&mut self, addr: u64) -> HvResult<()> {
        self.shared.borrow_mut().log.tss_address = Some(addr);
        Ok(())
    }

    fn set_identity_map_address(&mut self, addr: u64) -> HvResult<()> {
        self.shared.borrow_mut().log.identity_map_address = Some(addr);
        Ok(())
    }

    fn create_irq_chip(&mut self) -> HvResult<()> {
        let chip = |c: IrqChip| kvm_irqchip {
            chip_id: c.chip_id(),
            ..Default::default()
        };
        self.irqchips = Some([
            chip(IrqChip::PicMaster),
            chip(IrqChip::PicSlave),
            chip(IrqChip::IoApic),
        ]);
        Ok(())
    }

    fn create_pit(&mut self, config: &PitConfig) -> HvResult<()> {
        self.pit = Some(kvm_pit_state2 {
            flags: config.flags,
            ..Default::default()
        });
        Ok(())
    }

    fn set_pit_reinject(&mut self, reinject: u8) -> HvResult<()> {
        self.shared.borrow_mut().log.pit_reinject = Some(reinject);
        Ok(())
    }

    fn set_xen_hvm_config(&mut self, config: &XenHvmConfig) -> HvResult<()> {
        self.shared.borrow_mut().log.xen_hvm_config = Some(*config);
        Ok(())
    }

    fn set_gsi_routing(&mut self, table: &IrqRoutingTable) -> HvResult<()> {
        self.shared.borrow_mut().log.gsi_routes = table.len();
        Ok(())
    }

    fn register_coalesced_mmio(&mut self, zone: &CoalescedMmioZone) -> HvResult<()> {
        self.shared.borrow_mut().log.coalesced_mmio.push(*zone);
        Ok(())
    }

    fn register_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<i32> {
        let fd = if ioevent.fd < 0 { self.fd() } else { ioevent.fd };
        self.shared
            .borrow_mut()
            .log
            .ioeventfds
            .push(IoEventFd { fd, ..*ioevent });
        Ok(fd)
    }

    fn unregister_ioeventfd(&mut self, ioevent: &IoEventFd) -> HvResult<()> {
        self.shared
            .borrow_mut()
            .log
            .ioeventfds
            .retain(|e| !(e.addr == ioevent.addr && e.datamatch == ioevent.datamatch));
        Ok(())
    }

    fn register_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<i32> {
        let fd = if irqfd.fd < 0 { self.fd() } else { irqfd.fd };
        self.shared
            .borrow_mut()
            .log
            .irqfds
            .push(IrqFd { fd, ..*irqfd });
        Ok(fd)
    }

    fn unregister_irqfd(&mut self, irqfd: &IrqFd) -> HvResult<()> {
        self.shared
            .borrow_mut()
            .log
            .irqfds
            .retain(|e| e.gsi != irqfd.gsi);
        Ok(())
    }

    fn create_device(&mut self, device: &DeviceRecord) -> HvResult<u32> {
        let fd = self.fd() as u32;
        self.shared
            .borrow_mut()
            .log
            .devices
            .push(DeviceRecord { fd, ..*device });
        Ok(fd)
    }

    fn get_pit_state(&self) -> HvResult<kvm_pit_state2> {
        self.pit.ok_or(HvError::Unsupported("PIT state without a PIT"))
    }

    fn set_pit_state(&mut self, state: &kvm_pit_state2) -> HvResult<()> {
        self.pit = Some(*state);
        Ok(())
    }

    fn get_clock(&self) -> HvResult<kvm_clock_data> {
        Ok(self.clock)
    }

    fn set_clock(&mut self, clock: &kvm_clock_data) -> HvResult<()> {
        self.clock = *clock;
        Ok(())
    }

    fn get_irqchip(&self, chip: IrqChip) -> HvResult<kvm_irqchip> {
        let chips = self
            .irqchips
            .as_ref()
            .ok_or(HvError::Unsupported("irqchip state without an irqchip"))?;
        Self::chip_index(chip.chip_id())
            .map(|i| chips[i])
            .ok_or(HvError::Unsupported("irqchip"))
    }

    fn set_irqchip(&mut self, state: &kvm_irqchip) -> HvResult<()> {
        let index = Self::chip_index(state.chip_id).ok_or(HvError::Unsupported("irqchip"))?;
        let chips = self
            .irqchips
            .as_mut()
            .ok_or(HvError::Unsupported("irqchip state without an irqchip"))?;
        chips[index] = *state;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU
// ═══════════════════════════════════════════════════════════════════════

/// The vCPU half of the scripted backend.
pub struct MockVcpu {
    id: u32,
    shared: Rc<RefCell<Shared>>,
    regs: kvm_regs,
    sregs: kvm_sregs,
    debug_regs: kvm_debugregs,
    events: kvm_vcpu_events,
    fpu: kvm_fpu,
    mp_state: kvm_mp_state,
    lapic: Option<kvm_lapic_state>,
    tsc_khz: u32,
    msrs: BTreeMap<u32, u64>,
    debug: DebugControl,
    /// Hardware breakpoint just reported at this address; RF semantics.
    resume_flag: Option<u64>,
    /// A single-step trap owed after an exit that completed an instruction.
    pending_step: bool,
}

impl MockVcpu {
    fn new(id: u32, shared: Rc<RefCell<Shared>>, lapic: bool) -> Self {
        Self {
            id,
            shared,
            regs: kvm_regs {
                rflags: 0x2,
                ..Default::default()
            },
            sregs: kvm_sregs::default(),
            debug_regs: kvm_debugregs::default(),
            events: kvm_vcpu_events::default(),
            fpu: kvm_fpu {
                fcw: 0x37f,
                mxcsr: 0x1f80,
                ..Default::default()
            },
            mp_state: kvm_mp_state::default(),
            lapic: lapic.then(kvm_lapic_state::default),
            tsc_khz: 2_000_000,
            msrs: DEFAULT_MSRS.into_iter().collect(),
            debug: DebugControl::default(),
            resume_flag: None,
            pending_step: false,
        }
    }

    fn fetch(&self, addr: u64) -> Option<u8> {
        let shared = self.shared.borrow();
        let memory = shared.memory.as_ref()?;
        memory.read_obj::<u8>(GuestAddress(addr)).ok()
    }

    fn stepping(&self) -> bool {
        self.debug
            .has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP)
    }

    fn step_exit(&self) -> ExitReason {
        ExitReason::Debug(DebugExit {
            exception: 1,
            pc: self.regs.rip,
            dr6: DR6_BS,
            dr7: self.debug.debugreg[7],
        })
    }

    fn hw_breakpoint_hit(&self, rip: u64) -> Option<usize> {
        if !self
            .debug
            .has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP)
        {
            return None;
        }
        (0..4).find(|&slot| {
            self.debug.debugreg[7] & (1 << (slot * 2)) != 0 && self.debug.debugreg[slot] == rip
        })
    }
}

impl VcpuControl for MockVcpu {
    fn get_regs(&self) -> HvResult<kvm_regs> {
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> HvResult<()> {
        self.regs = *regs;
        self.resume_flag = None;
        self.pending_step = false;
        Ok(())
    }

    fn get_sregs(&self) -> HvResult<kvm_sregs> {
        Ok(self.sregs)
    }

    fn set_sregs(&mut self, sregs: &kvm_sregs) -> HvResult<()> {
        self.sregs = *sregs;
        Ok(())
    }

    fn get_debug_regs(&self) -> HvResult<kvm_debugregs> {
        Ok(self.debug_regs)
    }

    fn set_debug_regs(&mut self, regs: &kvm_debugregs) -> HvResult<()> {
        self.debug_regs = *regs;
        Ok(())
    }

    fn get_vcpu_events(&self) -> HvResult<kvm_vcpu_events> {
        Ok(self.events)
    }

    fn set_vcpu_events(&mut self, events: &kvm_vcpu_events) -> HvResult<()> {
        self.events = *events;
        Ok(())
    }

    fn get_xsave(&self) -> HvResult<kvm_xsave> {
        Err(HvError::Unsupported("XSAVE"))
    }

    fn set_xsave(&mut self, _xsave: &kvm_xsave) -> HvResult<()> {
        Err(HvError::Unsupported("XSAVE"))
    }

    fn get_xcrs(&self) -> HvResult<kvm_xcrs> {
        Err(HvError::Unsupported("XCRs"))
    }

    fn set_xcrs(&mut self, _xcrs: &kvm_xcrs) -> HvResult<()> {
        Err(HvError::Unsupported("XCRs"))
    }

    fn get_fpu(&self) -> HvResult<kvm_fpu> {
        Ok(self.fpu)
    }

    fn set_fpu(&mut self, fpu: &kvm_fpu) -> HvResult<()> {
        self.fpu = *fpu;
        Ok(())
    }

    fn get_mp_state(&self) -> HvResult<kvm_mp_state> {
        Ok(self.mp_state)
    }

    fn set_mp_state(&mut self, state: &kvm_mp_state) -> HvResult<()> {
        self.mp_state = *state;
        Ok(())
    }

    fn get_lapic(&self) -> HvResult<kvm_lapic_state> {
        self.lapic
            .ok_or(HvError::Unsupported("LAPIC state without an irqchip"))
    }

    fn set_lapic(&mut self, lapic: &kvm_lapic_state) -> HvResult<()> {
        self.lapic = Some(*lapic);
        Ok(())
    }

    fn get_tsc_khz(&self) -> HvResult<u32> {
        Ok(self.tsc_khz)
    }

    fn set_tsc_khz(&mut self, khz: u32) -> HvResult<()> {
        self.tsc_khz = khz;
        Ok(())
    }

    fn get_msrs(&self) -> HvResult<Vec<MsrEntry>> {
        Ok(self
            .msrs
            .iter()
            .map(|(&index, &data)| MsrEntry { index, data })
            .collect())
    }

    fn set_msrs(&mut self, msrs: &[MsrEntry]) -> HvResult<()> {
        for m in msrs {
            self.msrs.insert(m.index, m.data);
        }
        Ok(())
    }

    fn set_guest_debug(&mut self, control: &DebugControl) -> HvResult<()> {
        self.debug = *control;
        Ok(())
    }

    fn translate(&self, gva: u64) -> HvResult<Option<u64>> {
        Ok(self.fetch(gva).map(|_| gva))
    }

    fn run(&mut self) -> HvResult<ExitReason> {
        if std::mem::take(&mut self.pending_step) && self.stepping() {
            return Ok(self.step_exit());
        }
        loop {
            let rip = self.regs.rip;
            if self.resume_flag.take() != Some(rip) {
                if let Some(slot) = self.hw_breakpoint_hit(rip) {
                    self.resume_flag = Some(rip);
                    return Ok(ExitReason::Debug(DebugExit {
                        exception: 1,
                        pc: rip,
                        dr6: 1 << slot,
                        dr7: self.debug.debugreg[7],
                    }));
                }
            }

            let Some(opcode) = self.fetch(rip) else {
                return Ok(ExitReason::Shutdown);
            };
            let exit = match opcode {
                NOP => {
                    self.regs.rip += 1;
                    None
                }
                HLT => {
                    self.regs.rip += 1;
                    return Ok(ExitReason::Hlt);
                }
                INT3 if self.debug.has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP) => {
                    return Ok(ExitReason::Debug(DebugExit {
                        exception: 3,
                        pc: rip,
                        dr6: 0,
                        dr7: self.debug.debugreg[7],
                    }));
                }
                OUT_IMM8 => {
                    let Some(port) = self.fetch(rip + 1) else {
                        return Ok(ExitReason::Shutdown);
                    };
                    self.regs.rip += 2;
                    Some(ExitReason::Io {
                        port: u16::from(port),
                        write: true,
                    })
                }
                _ => return Ok(ExitReason::Shutdown),
            };

            match exit {
                Some(exit) => {
                    self.pending_step = true;
                    return Ok(exit);
                }
                None if self.stepping() => return Ok(self.step_exit()),
                None => {}
            }
            log::trace!("mock vCPU {} executed {:#04x} at {:#x}", self.id, opcode, rip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SINGLE_STEP_FLAGS;

    fn vcpu_with_code(code: &[u8]) -> (MockHypervisor, Box<dyn VcpuControl>) {
        let memory = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        memory.write_slice(code, GuestAddress(0x100)).unwrap();
        let mut hv = MockHypervisor::new();
        hv.set_memory_region(&MemoryRegionRecord::new(0, 0, 0x1000), &memory)
            .unwrap();
        let mut vcpu = hv.create_vcpu(0).unwrap();
        let mut regs = vcpu.get_regs().unwrap();
        regs.rip = 0x100;
        vcpu.set_regs(&regs).unwrap();
        (hv, vcpu)
    }

    #[test]
    fn runs_to_hlt() {
        let (_hv, mut vcpu) = vcpu_with_code(&[NOP, NOP, HLT]);
        assert_eq!(vcpu.run().unwrap(), ExitReason::Hlt);
        assert_eq!(vcpu.get_regs().unwrap().rip, 0x103);
    }

    #[test]
    fn out_exits_with_port() {
        let (_hv, mut vcpu) = vcpu_with_code(&[OUT_IMM8, 0x80, HLT]);
        assert_eq!(
            vcpu.run().unwrap(),
            ExitReason::Io {
                port: 0x80,
                write: true
            }
        );
        assert_eq!(vcpu.run().unwrap(), ExitReason::Hlt);
    }

    #[test]
    fn single_step_reports_each_instruction() {
        let (_hv, mut vcpu) = vcpu_with_code(&[NOP, NOP, HLT]);
        let mut ctl = DebugControl::default();
        ctl.set(SINGLE_STEP_FLAGS);
        vcpu.set_guest_debug(&ctl).unwrap();

        for pc in [0x101, 0x102] {
            match vcpu.run().unwrap() {
                ExitReason::Debug(d) => {
                    assert!(d.is_single_step());
                    assert_eq!(d.pc, pc);
                }
                other => panic!("unexpected exit {:?}", other),
            }
        }
        assert_eq!(vcpu.run().unwrap(), ExitReason::Hlt);
    }

    #[test]
    fn hardware_breakpoint_fires_once_then_resumes() {
        let (_hv, mut vcpu) = vcpu_with_code(&[NOP, NOP, HLT]);
        let ctl = DebugControl::default().with_breakpoints(&[0x101], false, false);
        vcpu.set_guest_debug(&ctl).unwrap();

        match vcpu.run().unwrap() {
            ExitReason::Debug(d) => {
                assert!(d.is_breakpoint());
                assert_eq!(d.pc, 0x101);
            }
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(vcpu.run().unwrap(), ExitReason::Hlt);
    }

    #[test]
    fn int3_without_interception_shuts_down() {
        let (_hv, mut vcpu) = vcpu_with_code(&[INT3]);
        assert_eq!(vcpu.run().unwrap(), ExitReason::Shutdown);

        let (_hv, mut vcpu) = vcpu_with_code(&[INT3]);
        let ctl = DebugControl::default().with_breakpoints(&[], true, false);
        vcpu.set_guest_debug(&ctl).unwrap();
        match vcpu.run().unwrap() {
            ExitReason::Debug(d) => {
                assert_eq!(d.exception, 3);
                assert_eq!(d.pc, 0x100);
            }
            other => panic!("unexpected exit {:?}", other),
        }
    }

    #[test]
    fn unsupported_state_is_reported() {
        let (mut hv, vcpu) = vcpu_with_code(&[HLT]);
        assert!(vcpu.get_xsave().unwrap_err().is_unsupported());
        assert!(vcpu.get_lapic().unwrap_err().is_unsupported());
        assert!(hv.get_pit_state().unwrap_err().is_unsupported());
        hv.create_pit(&PitConfig { flags: 1 }).unwrap();
        assert_eq!(hv.get_pit_state().unwrap().flags, 1);
    }

    #[test]
    fn log_records_fds() {
        let mut hv = MockHypervisor::new();
        let handle = hv.log_handle();
        let fd = hv
            .register_irqfd(&IrqFd {
                fd: -1,
                gsi: 5,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(fd, 100);
        assert_eq!(handle.log().irqfds[0].fd, fd);
        hv.unregister_irqfd(&IrqFd {
            gsi: 5,
            ..Default::default()
        })
        .unwrap();
        assert!(handle.log().irqfds.is_empty());
    }
}
