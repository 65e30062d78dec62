//! Execution engine: owns a [`Vm`] and its plugins and drives the run loop.
//!
//! # Run loop
//!
//! [`Engine::launch_vm`] works in passes.  Each pass enters every
//! still-running vCPU once, bracketed by the hooks of every enabled plugin:
//!
//! ```text
//!   vm_pre_launch ─► vcpu_pre_launch ─► run ─► vcpu_post_launch ─► vm_post_launch ─► classify exit
//! ```
//!
//! Hooks run in plugin-load order.  A vCPU leaves the loop when it reaches a stop point, finishes a
//! single step nobody asked to continue, or takes a non-recoverable exit.
//! The call returns once every vCPU has left.

use crate::hypervisor::{DebugExit, ExitReason, HvError};
use crate::instrument::HookAction;
use crate::plugin::{load_library, Plugin, PluginError, PluginRecord, PluginState};
use crate::vm::{Vm, VmError};
use log::{debug, info, warn};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Hypervisor error: {0}")]
    Hv(#[from] HvError),
}

/// Why a vCPU left the run loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Reached a stop point (or a hook asked to stop) at this address.
    StopPoint(u64),
    /// Completed a single step; the payload is the next instruction pointer.
    StepComplete(u64),
    Halted,
    Shutdown,
    Fatal(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuStop {
    pub vcpu_id: u32,
    pub reason: StopReason,
}

pub struct Engine {
    vm: Vm,
    plugins: Vec<PluginRecord>,
    next_plugin_id: u32,
    /// vCPUs stepping over a hook's original instruction, by hook address.
    rearm: BTreeMap<u32, u64>,
    /// (plugin, vCPU) pairs whose post-launch hook failed this launch.
    step_vetoed: BTreeSet<(u32, u32)>,
}

impl Engine {
    pub fn new(vm: Vm) -> Self {
        Self {
            vm,
            plugins: Vec::new(),
            next_plugin_id: 0,
            rearm: BTreeMap::new(),
            step_vetoed: BTreeSet::new(),
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn into_vm(self) -> Vm {
        self.vm
    }

    // ─── Plugin lifecycle ───────────────────────────────────────────

    /// Load a plugin library and register it.  Returns the new plugin id.
    pub fn load_plugin(&mut self, path: &Path, enable_now: bool) -> Result<u32, EngineError> {
        let id = self.next_plugin_id;
        let record = load_library(id, path, &mut self.vm)?;
        self.insert_plugin(record, enable_now)
    }

    /// Register an in-process plugin.  Returns the new plugin id.
    pub fn register_plugin(
        &mut self,
        plugin: Box<dyn Plugin>,
        enable_now: bool,
    ) -> Result<u32, EngineError> {
        let id = self.next_plugin_id;
        info!("Registered plugin {} ({})", plugin.name(), id);
        self.insert_plugin(PluginRecord::new(id, plugin), enable_now)
    }

    fn insert_plugin(&mut self, record: PluginRecord, enable_now: bool) -> Result<u32, EngineError> {
        let id = record.id;
        self.next_plugin_id += 1;
        self.plugins.push(record);
        if enable_now {
            self.enable_plugin(id)?;
        }
        Ok(id)
    }

    fn plugin_mut(&mut self, id: u32) -> Result<&mut PluginRecord, PluginError> {
        self.plugins
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PluginError::NoSuchPlugin(id))
    }

    pub fn plugin(&self, id: u32) -> Option<&PluginRecord> {
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn plugins(&self) -> &[PluginRecord] {
        &self.plugins
    }

    pub fn enable_plugin(&mut self, id: u32) -> Result<(), EngineError> {
        let Self { vm, plugins, .. } = self;
        let record = find(plugins, id)?;
        if record.state == PluginState::Enabled {
            return Err(invalid(record, "enable").into());
        }
        record.plugin.enable(vm)?;
        record.state = PluginState::Enabled;
        info!("Plugin {} ({}) enabled", record.name(), id);
        Ok(())
    }

    pub fn disable_plugin(&mut self, id: u32) -> Result<(), EngineError> {
        let Self { vm, plugins, .. } = self;
        let record = find(plugins, id)?;
        if record.state != PluginState::Enabled {
            return Err(invalid(record, "disable").into());
        }
        record.plugin.disable(vm)?;
        record.state = PluginState::Disabled;
        info!("Plugin {} ({}) disabled", record.name(), id);
        Ok(())
    }

    pub fn configure_plugin(&mut self, id: u32, config: &dyn Any) -> Result<(), EngineError> {
        let Self { vm, plugins, .. } = self;
        let record = find(plugins, id)?;
        record.plugin.configure(vm, config)?;
        debug!("Plugin {} ({}) configured", record.name(), id);
        Ok(())
    }

    pub fn reset_plugin(&mut self, id: u32) -> Result<(), EngineError> {
        let record = self.plugin_mut(id)?;
        record.plugin.reset()?;
        debug!("Plugin {} ({}) reset", record.name(), id);
        Ok(())
    }

    /// Take ownership of whatever the plugin extracts.
    pub fn extract_plugin_data(&mut self, id: u32) -> Result<Box<dyn Any>, EngineError> {
        Ok(self.plugin_mut(id)?.plugin.extract_data()?)
    }

    /// [`extract_plugin_data`](Self::extract_plugin_data) downcast to `T`.
    pub fn extract_plugin_data_as<T: Any>(&mut self, id: u32) -> Result<T, EngineError> {
        let record = self.plugin_mut(id)?;
        let data = record.plugin.extract_data()?;
        data.downcast::<T>().map(|b| *b).map_err(|_| {
            PluginError::WrongDataType {
                plugin: record.name().to_string(),
                expected: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    /// Disable (if enabled) and drop the plugin.
    pub fn unload_plugin(&mut self, id: u32) -> Result<(), EngineError> {
        let index = self
            .plugins
            .iter()
            .position(|p| p.id == id)
            .ok_or(PluginError::NoSuchPlugin(id))?;
        if self.plugins[index].is_enabled() {
            self.disable_plugin(id)?;
        }
        let record = self.plugins.remove(index);
        info!("Plugin {} ({}) unloaded", record.name(), id);
        self.step_vetoed.retain(|&(p, _)| p != id);
        Ok(())
    }

    // ─── Snapshots ──────────────────────────────────────────────────

    pub fn take_snapshot(&mut self, id: u32) -> Result<(), EngineError> {
        self.vm.take_snapshot(id)?;
        Ok(())
    }

    /// Restore snapshot `id`, then reset every plugin that asks for it.
    pub fn restore_snapshot(&mut self, id: u32) -> Result<(), EngineError> {
        self.vm.restore_snapshot(id)?;
        // Restored memory carries the armed int3s again.
        self.rearm.clear();
        for record in &mut self.plugins {
            if record.plugin.reset_on_snapshot_restore() {
                record.plugin.reset()?;
                debug!("Plugin {} reset on snapshot restore", record.name());
            }
        }
        Ok(())
    }

    // ─── Guest memory ───────────────────────────────────────────────

    /// Read guest virtual memory in the address space `asid` (a page-table
    /// base), for decoders resolving instruction bytes.
    pub fn read_guest_memory(&self, asid: u64, gva: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        Ok(self.vm.read_asid(asid, gva, buf)?)
    }

    // ─── Run loop ───────────────────────────────────────────────────

    /// Run every vCPU until each has stopped.
    pub fn launch_vm(&mut self) -> Result<Vec<VcpuStop>, EngineError> {
        let mut running = self.vm.vcpu_ids();
        let mut stops = Vec::with_capacity(running.len());
        self.step_vetoed.clear();

        while !running.is_empty() {
            let mut still = Vec::with_capacity(running.len());
            for id in running {
                match self.run_vcpu_once(id)? {
                    Some(reason) => {
                        debug!("vCPU {} stopped: {:?}", id, reason);
                        stops.push(VcpuStop { vcpu_id: id, reason });
                    }
                    None => still.push(id),
                }
            }
            running = still;
        }

        Ok(stops)
    }

    fn vm_hooks(&mut self, pre: bool) {
        let Self { vm, plugins, .. } = self;
        for record in plugins.iter_mut().filter(|p| p.is_enabled()) {
            let result = if pre {
                record.plugin.vm_pre_launch(vm)
            } else {
                record.plugin.vm_post_launch(vm)
            };
            if let Err(e) = result {
                warn!("Plugin {} VM hook failed: {}", record.name(), e);
            }
        }
    }

    /// Enter `id` once.  `None` keeps it in the loop.
    fn run_vcpu_once(&mut self, id: u32) -> Result<Option<StopReason>, EngineError> {
        self.vm_hooks(true);
        {
            let Self { vm, plugins, .. } = self;
            for record in plugins.iter_mut().filter(|p| p.is_enabled()) {
                if let Err(e) = record.plugin.vcpu_pre_launch(vm, id) {
                    warn!("Plugin {} pre-launch hook on vCPU {} failed: {}", record.name(), id, e);
                }
            }
        }

        let stepping_over = self.rearm.remove(&id);
        let control = self
            .vm
            .effective_debug_control(id, stepping_over.is_some())?;
        let exit = match self.vm.vcpu_mut(id)?.run(&control) {
            Ok(exit) => exit,
            Err(e) => {
                warn!("vCPU {} run failed: {}", id, e);
                self.vm_hooks(false);
                return Ok(Some(StopReason::Fatal(e.to_string())));
            }
        };
        if let Some(addr) = stepping_over {
            self.vm.rearm_hook(addr)?;
        }

        let keep_stepping = self.vcpu_post_hooks(id, &exit);
        self.vm_hooks(false);

        let reason = match exit {
            ExitReason::Debug(debug) => {
                if stepping_over.is_some()
                    && debug.is_single_step()
                    && !self.vm.vcpu(id)?.debug_control.single_step()
                {
                    // Forced step over a hook; the caller never asked for it.
                    return Ok(None);
                }
                self.debug_exit(id, debug, keep_stepping)?
            }
            exit if exit.is_recoverable() => None,
            ExitReason::Hlt => Some(StopReason::Halted),
            ExitReason::Shutdown => Some(StopReason::Shutdown),
            ExitReason::FailEntry { reason } => Some(StopReason::Fatal(format!(
                "VM entry failed, hardware reason {:#x}",
                reason
            ))),
            ExitReason::InternalError => Some(StopReason::Fatal("KVM internal error".into())),
            other => Some(StopReason::Fatal(format!("unhandled exit {:?}", other))),
        };
        Ok(reason)
    }

    /// Run the post-launch hooks; `true` if any of them wants another step.
    fn vcpu_post_hooks(&mut self, id: u32, exit: &ExitReason) -> bool {
        let Self {
            vm,
            plugins,
            step_vetoed,
            ..
        } = self;
        let mut keep_stepping = false;
        for record in plugins.iter_mut().filter(|p| p.is_enabled()) {
            match record.plugin.vcpu_post_launch(vm, id, exit) {
                Ok(wants) => keep_stepping |= wants && !step_vetoed.contains(&(record.id, id)),
                Err(e) => {
                    warn!(
                        "Plugin {} post-launch hook on vCPU {} failed: {}",
                        record.name(),
                        id,
                        e
                    );
                    step_vetoed.insert((record.id, id));
                }
            }
        }
        keep_stepping
    }

    fn debug_exit(
        &mut self,
        id: u32,
        debug: DebugExit,
        keep_stepping: bool,
    ) -> Result<Option<StopReason>, EngineError> {
        let pc = debug.pc;
        if debug.is_breakpoint() {
            if self.vm.stop_point_at(pc) {
                return Ok(Some(StopReason::StopPoint(pc)));
            }
            if let Some(hook) = self.vm.hook_point(pc) {
                return match (hook.callback)(&mut self.vm, id) {
                    HookAction::Continue => {
                        self.vm.disarm_hook(pc)?;
                        self.rearm.insert(id, pc);
                        Ok(None)
                    }
                    HookAction::Stop => Ok(Some(StopReason::StopPoint(pc))),
                };
            }
            if !debug.is_single_step() {
                return Ok(Some(StopReason::Fatal(format!(
                    "unexpected breakpoint (vector {}) at {:#x}",
                    debug.exception, pc
                ))));
            }
        }
        if debug.is_single_step() {
            if keep_stepping {
                return Ok(None);
            }
            return Ok(Some(StopReason::StepComplete(pc)));
        }
        Ok(Some(StopReason::Fatal(format!(
            "unexpected debug exit (vector {}) at {:#x}",
            debug.exception, pc
        ))))
    }
}

fn find(plugins: &mut [PluginRecord], id: u32) -> Result<&mut PluginRecord, PluginError> {
    plugins
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or(PluginError::NoSuchPlugin(id))
}

fn invalid(record: &PluginRecord, op: &'static str) -> PluginError {
    PluginError::InvalidState {
        id: record.id,
        state: record.state,
        op,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{HookFn, StopKind, SINGLE_STEP_FLAGS};
    use crate::mock::{MockHypervisor, HLT, NOP, OUT_IMM8};
    use crate::vm::VmConfig;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const ENTRY: u64 = 0x1000;

    fn engine_with_code(code: &[u8]) -> Engine {
        let config = VmConfig {
            memory_size: 0x10000,
            ..Default::default()
        };
        let mut vm = Vm::new(Box::new(MockHypervisor::new()), config).unwrap();
        vm.write_phys(ENTRY, code).unwrap();
        vm.vcpu_mut(0).unwrap().set_rip(ENTRY).unwrap();
        Engine::new(vm)
    }

    fn stop(reason: StopReason) -> Vec<VcpuStop> {
        vec![VcpuStop { vcpu_id: 0, reason }]
    }

    /// Records every call so ordering and state transitions are visible.
    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        calls: Rc<RefCell<Vec<String>>>,
        steps: u32,
        fail_post: bool,
        reset_on_restore: bool,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn reset_on_snapshot_restore(&self) -> bool {
            self.reset_on_restore
        }

        fn enable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
            for vcpu in vm.vcpus_mut() {
                vcpu.debug_control.set(SINGLE_STEP_FLAGS);
            }
            self.calls.borrow_mut().push(format!("{}:enable", self.name));
            Ok(())
        }

        fn disable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
            for vcpu in vm.vcpus_mut() {
                vcpu.debug_control.clear(SINGLE_STEP_FLAGS);
            }
            self.calls.borrow_mut().push(format!("{}:disable", self.name));
            Ok(())
        }

        fn configure(&mut self, _vm: &mut Vm, config: &dyn Any) -> Result<(), PluginError> {
            let steps = config.downcast_ref::<u32>().ok_or(PluginError::BadConfig {
                plugin: self.name.to_string(),
                expected: "u32",
            })?;
            self.steps = *steps;
            Ok(())
        }

        fn reset(&mut self) -> Result<(), PluginError> {
            self.calls.borrow_mut().push(format!("{}:reset", self.name));
            Ok(())
        }

        fn extract_data(&mut self) -> Result<Box<dyn Any>, PluginError> {
            Ok(Box::new(self.steps))
        }

        fn vm_pre_launch(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
            self.calls.borrow_mut().push(format!("{}:vm_pre", self.name));
            Ok(())
        }

        fn vm_post_launch(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
            self.calls.borrow_mut().push(format!("{}:vm_post", self.name));
            Ok(())
        }

        fn vcpu_pre_launch(&mut self, _vm: &mut Vm, _vcpu_id: u32) -> Result<(), PluginError> {
            self.calls.borrow_mut().push(format!("{}:vcpu_pre", self.name));
            Ok(())
        }

        fn vcpu_post_launch(
            &mut self,
            _vm: &mut Vm,
            _vcpu_id: u32,
            _exit: &ExitReason,
        ) -> Result<bool, PluginError> {
            self.calls.borrow_mut().push(format!("{}:vcpu_post", self.name));
            if self.fail_post {
                return Err(PluginError::hook(self.name, "refused"));
            }
            if self.steps == 0 {
                return Ok(false);
            }
            self.steps -= 1;
            Ok(true)
        }
    }

    fn recorder(name: &'static str, calls: &Rc<RefCell<Vec<String>>>) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            calls: calls.clone(),
            ..Default::default()
        })
    }

    #[test]
    fn runs_to_halt_without_plugins() {
        let mut engine = engine_with_code(&[NOP, NOP, HLT]);
        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Halted));
        assert_eq!(engine.vm().vcpu(0).unwrap().rip().unwrap(), ENTRY + 3);
    }

    #[test]
    fn io_exits_are_reentered() {
        let mut engine = engine_with_code(&[OUT_IMM8, 0x80, OUT_IMM8, 0x81, HLT]);
        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Halted));
    }

    #[test]
    fn unknown_instruction_shuts_down() {
        let mut engine = engine_with_code(&[NOP, 0x0f]);
        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Shutdown));
    }

    #[test]
    fn hardware_stop_point_halts_before_instruction() {
        let mut engine = engine_with_code(&[NOP, NOP, NOP, HLT]);
        engine
            .vm_mut()
            .add_stop_point(ENTRY + 2, StopKind::Hardware)
            .unwrap();
        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StopPoint(ENTRY + 2))
        );
        assert_eq!(engine.vm().vcpu(0).unwrap().rip().unwrap(), ENTRY + 2);

        engine.vm_mut().remove_all_stop_points().unwrap();
        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Halted));
    }

    #[test]
    fn software_stop_point_halts_at_int3() {
        let mut engine = engine_with_code(&[NOP, NOP, HLT]);
        engine
            .vm_mut()
            .add_stop_point(ENTRY + 1, StopKind::Software)
            .unwrap();
        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StopPoint(ENTRY + 1))
        );
        engine.vm_mut().remove_all_stop_points().unwrap();
        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Halted));
    }

    #[test]
    fn single_step_yields_after_one_instruction() {
        let mut engine = engine_with_code(&[NOP, NOP, HLT]);
        engine
            .vm_mut()
            .vcpu_mut(0)
            .unwrap()
            .debug_control
            .set(SINGLE_STEP_FLAGS);
        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StepComplete(ENTRY + 1))
        );
    }

    #[test]
    fn post_hook_keeps_stepping() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine_with_code(&[NOP, NOP, NOP, HLT]);
        let id = engine.register_plugin(recorder("p", &calls), true).unwrap();
        engine.configure_plugin(id, &2u32).unwrap();

        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StepComplete(ENTRY + 3))
        );
        let passes = calls
            .borrow()
            .iter()
            .filter(|c| c.as_str() == "p:vcpu_pre")
            .count();
        assert_eq!(passes, 3);
    }

    #[test]
    fn hooks_run_in_load_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine_with_code(&[HLT]);
        engine.register_plugin(recorder("a", &calls), true).unwrap();
        engine.register_plugin(recorder("b", &calls), true).unwrap();
        calls.borrow_mut().clear();

        engine.launch_vm().unwrap();
        let got: Vec<String> = calls.borrow().clone();
        assert_eq!(
            got,
            [
                "a:vm_pre",
                "b:vm_pre",
                "a:vcpu_pre",
                "b:vcpu_pre",
                "a:vcpu_post",
                "b:vcpu_post",
                "a:vm_post",
                "b:vm_post"
            ]
        );
    }

    #[test]
    fn vm_hooks_bracket_every_vcpu_entry() {
        let config = VmConfig {
            vcpu_count: 2,
            memory_size: 0x10000,
            ..Default::default()
        };
        let mut vm = Vm::new(Box::new(MockHypervisor::new()), config).unwrap();
        vm.write_phys(ENTRY, &[NOP, NOP, HLT]).unwrap();
        for id in 0..2 {
            vm.vcpu_mut(id).unwrap().set_rip(ENTRY).unwrap();
        }
        let mut engine = Engine::new(vm);
        let calls = Rc::new(RefCell::new(Vec::new()));
        engine.register_plugin(recorder("a", &calls), true).unwrap();
        calls.borrow_mut().clear();

        let stops = engine.launch_vm().unwrap();
        assert_eq!(
            stops,
            vec![
                VcpuStop {
                    vcpu_id: 0,
                    reason: StopReason::StepComplete(ENTRY + 1)
                },
                VcpuStop {
                    vcpu_id: 1,
                    reason: StopReason::StepComplete(ENTRY + 1)
                },
            ]
        );
        let got: Vec<String> = calls.borrow().clone();
        let per_vcpu = ["a:vm_pre", "a:vcpu_pre", "a:vcpu_post", "a:vm_post"];
        assert_eq!(got, [per_vcpu, per_vcpu].concat());
    }

    #[test]
    fn failing_post_hook_loses_its_step_request_only() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine_with_code(&[NOP, NOP, NOP, HLT]);
        let failing = Box::new(Recorder {
            name: "bad",
            calls: calls.clone(),
            steps: 10,
            fail_post: true,
            ..Default::default()
        });
        engine.register_plugin(failing, true).unwrap();
        let good = engine.register_plugin(recorder("good", &calls), true).unwrap();
        engine.configure_plugin(good, &1u32).unwrap();

        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StepComplete(ENTRY + 2))
        );
        let good_posts = calls
            .borrow()
            .iter()
            .filter(|c| c.as_str() == "good:vcpu_post")
            .count();
        assert_eq!(good_posts, 2);
    }

    #[test]
    fn plugin_state_machine() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine_with_code(&[HLT]);
        let id = engine.register_plugin(recorder("p", &calls), false).unwrap();
        assert_eq!(engine.plugin(id).unwrap().state, PluginState::Loaded);

        assert!(matches!(
            engine.disable_plugin(id),
            Err(EngineError::Plugin(PluginError::InvalidState { .. }))
        ));
        engine.enable_plugin(id).unwrap();
        assert!(engine.vm().vcpu(0).unwrap().debug_control.single_step());
        assert!(matches!(
            engine.enable_plugin(id),
            Err(EngineError::Plugin(PluginError::InvalidState { .. }))
        ));
        engine.disable_plugin(id).unwrap();
        assert_eq!(engine.plugin(id).unwrap().state, PluginState::Disabled);
        engine.reset_plugin(id).unwrap();

        assert!(matches!(
            engine.configure_plugin(id, &"wrong"),
            Err(EngineError::Plugin(PluginError::BadConfig { .. }))
        ));
        engine.configure_plugin(id, &5u32).unwrap();
        assert_eq!(engine.extract_plugin_data_as::<u32>(id).unwrap(), 5);
        assert!(matches!(
            engine.extract_plugin_data_as::<String>(id),
            Err(EngineError::Plugin(PluginError::WrongDataType { .. }))
        ));

        engine.enable_plugin(id).unwrap();
        engine.unload_plugin(id).unwrap();
        assert!(engine.plugin(id).is_none());
        assert_eq!(
            calls.borrow().last().map(String::as_str),
            Some("p:disable")
        );
        assert!(matches!(
            engine.reset_plugin(id),
            Err(EngineError::Plugin(PluginError::NoSuchPlugin(_)))
        ));
    }

    #[test]
    fn restore_resets_flagged_plugins() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine_with_code(&[HLT]);
        let flagged = Box::new(Recorder {
            name: "flagged",
            calls: calls.clone(),
            reset_on_restore: true,
            ..Default::default()
        });
        engine.register_plugin(flagged, false).unwrap();
        engine.register_plugin(recorder("plain", &calls), false).unwrap();

        engine.take_snapshot(1).unwrap();
        engine.restore_snapshot(1).unwrap();
        let got: Vec<String> = calls.borrow().clone();
        assert_eq!(got, ["flagged:reset"]);
    }

    #[test]
    fn hook_point_continue_steps_over_and_rearms() {
        let mut engine = engine_with_code(&[NOP, NOP, HLT]);
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let hook: Arc<HookFn> = Arc::new(move |_vm: &mut Vm, _vcpu: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            HookAction::Continue
        });
        engine.vm_mut().add_hook_point(0, ENTRY + 1, hook).unwrap();

        assert_eq!(engine.launch_vm().unwrap(), stop(StopReason::Halted));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let mut byte = [0u8];
        engine.vm().read_phys(ENTRY + 1, &mut byte).unwrap();
        assert_eq!(byte, [crate::instrument::INT3]);

        engine.vm_mut().vcpu_mut(0).unwrap().set_rip(ENTRY).unwrap();
        engine.launch_vm().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hook_point_stop_halts() {
        let mut engine = engine_with_code(&[NOP, NOP, HLT]);
        let hook: Arc<HookFn> = Arc::new(|_vm: &mut Vm, _vcpu: u32| HookAction::Stop);
        engine.vm_mut().add_hook_point(0, ENTRY + 1, hook).unwrap();
        assert_eq!(
            engine.launch_vm().unwrap(),
            stop(StopReason::StopPoint(ENTRY + 1))
        );
    }

    #[test]
    fn guest_memory_reads_by_address_space() {
        let engine = engine_with_code(&[NOP, HLT]);
        let mut buf = [0u8; 2];
        engine.read_guest_memory(0, ENTRY, &mut buf).unwrap();
        assert_eq!(buf, [NOP, HLT]);
        assert!(engine.read_guest_memory(0x5000, ENTRY, &mut buf).is_err());
    }

    #[test]
    fn load_plugin_reports_missing_library() {
        let mut engine = engine_with_code(&[HLT]);
        assert!(matches!(
            engine.load_plugin(Path::new("/nonexistent/plugin.so"), true),
            Err(EngineError::Plugin(PluginError::Load { .. }))
        ));
        assert!(engine.plugins().is_empty());
    }
}
