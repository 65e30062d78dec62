//! Hardware single-step plugin.
//!
//! Turns on single-step with hardware-breakpoint use on every vCPU (and on
//! every stored vCPU snapshot, so a restore does not silently drop it) and
//! records the instruction pointer of every instruction each vCPU retires.

use crate::retire::InFlight;
use kvmctl_vmm::hypervisor::ExitReason;
use kvmctl_vmm::instrument::SINGLE_STEP_FLAGS;
use kvmctl_vmm::plugin::{Plugin, PluginError};
use kvmctl_vmm::vm::Vm;
use log::debug;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;

pub const NAME: &str = "single-step";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleStepConfig {
    /// Keep stepping inside one launch instead of yielding after each step.
    pub continuous: bool,
}

/// Instruction pointers observed per vCPU, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTrace {
    pub vcpus: BTreeMap<u32, Vec<u64>>,
}

impl StepTrace {
    pub fn vcpu(&self, id: u32) -> &[u64] {
        self.vcpus.get(&id).map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Default)]
pub struct SingleStepPlugin {
    config: SingleStepConfig,
    trace: StepTrace,
    in_flight: InFlight<u64>,
    /// vCPUs holding our step claim while enabled.
    armed: Option<Vec<u32>>,
}

impl SingleStepPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Plugin for SingleStepPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Single-steps every vCPU and records each instruction pointer"
    }

    fn reset_on_snapshot_restore(&self) -> bool {
        true
    }

    fn enable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
        let ids = vm.vcpu_ids();
        vm.claim_debug_flags(SINGLE_STEP_FLAGS, &ids)
            .map_err(|e| PluginError::hook(NAME, e))?;
        self.armed = Some(ids);
        Ok(())
    }

    fn disable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
        if let Some(ids) = self.armed.take() {
            vm.release_debug_flags(SINGLE_STEP_FLAGS, &ids)
                .map_err(|e| PluginError::hook(NAME, e))?;
        }
        self.in_flight.clear();
        Ok(())
    }

    fn configure(&mut self, _vm: &mut Vm, config: &dyn Any) -> Result<(), PluginError> {
        self.config = *config
            .downcast_ref::<SingleStepConfig>()
            .ok_or(PluginError::BadConfig {
                plugin: NAME.to_string(),
                expected: "SingleStepConfig",
            })?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), PluginError> {
        self.trace.vcpus.clear();
        self.in_flight.clear();
        Ok(())
    }

    fn extract_data(&mut self) -> Result<Box<dyn Any>, PluginError> {
        Ok(Box::new(self.trace.clone()))
    }

    fn vcpu_pre_launch(&mut self, vm: &mut Vm, vcpu_id: u32) -> Result<(), PluginError> {
        self.in_flight
            .enter(vm, vcpu_id, |vm| vm.vcpu(vcpu_id)?.rip())
            .map_err(|e| PluginError::hook(NAME, e))
    }

    fn vcpu_post_launch(
        &mut self,
        _vm: &mut Vm,
        vcpu_id: u32,
        exit: &ExitReason,
    ) -> Result<bool, PluginError> {
        if let Some(rip) = self.in_flight.retire(vcpu_id, exit) {
            debug!("vCPU {} retired {:#x}", vcpu_id, rip);
            self.trace.vcpus.entry(vcpu_id).or_default().push(rip);
        }
        Ok(self.config.continuous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TracePlugin;
    use kvmctl_vmm::engine::{Engine, StopReason, VcpuStop};
    use kvmctl_vmm::instrument::StopKind;
    use kvmctl_vmm::mock::{MockHypervisor, HLT, NOP, OUT_IMM8};
    use kvmctl_vmm::vm::VmConfig;

    const ENTRY: u64 = 0x2000;

    fn engine(vcpus: u32) -> Engine {
        let config = VmConfig {
            vcpu_count: vcpus,
            memory_size: 0x10000,
            ..Default::default()
        };
        let mut vm = Vm::new(Box::new(MockHypervisor::new()), config).unwrap();
        for id in 0..vcpus {
            vm.vcpu_mut(id).unwrap().set_rip(ENTRY).unwrap();
        }
        Engine::new(vm)
    }

    #[test]
    fn patched_nop_at_entry_is_the_only_step() {
        let mut engine = engine(1);
        engine.vm_mut().patch_vaddr(0, ENTRY, &[NOP]).unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();

        let stops = engine.launch_vm().unwrap();
        assert_eq!(
            stops,
            vec![VcpuStop {
                vcpu_id: 0,
                reason: StopReason::StepComplete(ENTRY + 1)
            }]
        );
        let trace: StepTrace = engine.extract_plugin_data_as(id).unwrap();
        assert_eq!(trace.vcpu(0), &[ENTRY]);
    }

    #[test]
    fn enable_and_disable_touch_vcpus_and_snapshots() {
        let mut engine = engine(2);
        engine.take_snapshot(1).unwrap();
        engine.take_snapshot(2).unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), false)
            .unwrap();

        engine.enable_plugin(id).unwrap();
        for vcpu in engine.vm().vcpus() {
            assert!(vcpu.debug_control.has(SINGLE_STEP_FLAGS));
        }
        for snapshot in engine.vm().snapshots() {
            for vcpu in &snapshot.vcpus {
                assert!(vcpu.debug_control.unwrap().has(SINGLE_STEP_FLAGS));
            }
        }

        engine.disable_plugin(id).unwrap();
        for vcpu in engine.vm().vcpus() {
            assert_eq!(vcpu.debug_control.control, 0);
        }
        for snapshot in engine.vm().snapshots() {
            for vcpu in &snapshot.vcpus {
                assert_eq!(vcpu.debug_control.unwrap().control, 0);
            }
        }
    }

    #[test]
    fn continuous_mode_steps_to_halt() {
        let mut engine = engine(1);
        engine
            .vm()
            .write_phys(ENTRY, &[NOP, NOP, NOP, HLT])
            .unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();
        engine
            .configure_plugin(id, &SingleStepConfig { continuous: true })
            .unwrap();

        let stops = engine.launch_vm().unwrap();
        assert_eq!(stops[0].reason, StopReason::Halted);
        let trace: StepTrace = engine.extract_plugin_data_as(id).unwrap();
        assert_eq!(trace.vcpu(0), &[ENTRY, ENTRY + 1, ENTRY + 2, ENTRY + 3]);
    }

    #[test]
    fn io_exit_records_each_instruction_once() {
        let mut engine = engine(1);
        engine
            .vm()
            .write_phys(ENTRY, &[OUT_IMM8, 0x80, NOP, HLT])
            .unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();
        engine
            .configure_plugin(id, &SingleStepConfig { continuous: true })
            .unwrap();

        let stops = engine.launch_vm().unwrap();
        assert_eq!(stops[0].reason, StopReason::Halted);
        let trace: StepTrace = engine.extract_plugin_data_as(id).unwrap();
        assert_eq!(trace.vcpu(0), &[ENTRY, ENTRY + 2, ENTRY + 3]);
    }

    #[test]
    fn parked_instruction_is_not_recorded() {
        let mut engine = engine(1);
        engine.vm().write_phys(ENTRY, &[NOP, NOP, NOP]).unwrap();
        engine
            .vm_mut()
            .add_stop_point(ENTRY + 1, StopKind::Hardware)
            .unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();
        engine
            .configure_plugin(id, &SingleStepConfig { continuous: true })
            .unwrap();

        let stops = engine.launch_vm().unwrap();
        assert_eq!(stops[0].reason, StopReason::StopPoint(ENTRY + 1));
        let trace: StepTrace = engine.extract_plugin_data_as(id).unwrap();
        assert_eq!(trace.vcpu(0), &[ENTRY]);
    }

    #[test]
    fn disabling_one_stepper_keeps_the_other_stepping() {
        let mut engine = engine(2);
        let trace = engine
            .register_plugin(Box::new(TracePlugin::new()), true)
            .unwrap();
        let step = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();

        engine.disable_plugin(step).unwrap();
        for vcpu in engine.vm().vcpus() {
            assert!(vcpu.debug_control.single_step());
        }
        engine.disable_plugin(trace).unwrap();
        for vcpu in engine.vm().vcpus() {
            assert_eq!(vcpu.debug_control.control, 0);
        }
    }

    #[test]
    fn restore_resets_trace() {
        let mut engine = engine(1);
        engine.vm().write_phys(ENTRY, &[NOP, NOP]).unwrap();
        engine.take_snapshot(1).unwrap();
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), true)
            .unwrap();

        engine.launch_vm().unwrap();
        engine.restore_snapshot(1).unwrap();
        let trace: StepTrace = engine.extract_plugin_data_as(id).unwrap();
        assert!(trace.vcpus.is_empty());

        // The snapshot was updated on enable, so stepping survives restore.
        assert!(engine.vm().vcpu(0).unwrap().debug_control.single_step());
    }

    #[test]
    fn rejects_foreign_config() {
        let mut engine = engine(1);
        let id = engine
            .register_plugin(Box::new(SingleStepPlugin::new()), false)
            .unwrap();
        assert!(engine.configure_plugin(id, &42u64).is_err());
    }
}
