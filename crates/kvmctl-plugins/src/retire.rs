//! Instruction retirement tracking shared by the stepping plugins.
//!
//! A vCPU entered at some instruction has not necessarily executed it when
//! it exits: a stop point parks it in front of the instruction, and after
//! an I/O exit the single-step trap owed for the completed instruction only
//! fires on the next entry, before anything else runs.  [`InFlight`] holds
//! the entry point until an exit proves the instruction retired.

use kvmctl_vmm::hypervisor::ExitReason;
use kvmctl_vmm::vm::{Vm, VmError};
use std::collections::BTreeMap;

#[derive(Debug)]
pub(crate) struct InFlight<T> {
    pending: BTreeMap<u32, T>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<T> InFlight<T> {
    /// Note what `vcpu_id` is about to execute.  An entry still owed its
    /// step trap from a recoverable exit is kept instead.
    pub(crate) fn enter(
        &mut self,
        vm: &Vm,
        vcpu_id: u32,
        at: impl FnOnce(&Vm) -> Result<T, VmError>,
    ) -> Result<(), VmError> {
        let owed = vm
            .vcpu(vcpu_id)?
            .last_exit()
            .is_some_and(ExitReason::is_recoverable);
        if owed && self.pending.contains_key(&vcpu_id) {
            return Ok(());
        }
        self.pending.insert(vcpu_id, at(vm)?);
        Ok(())
    }

    /// The entry `exit` shows to have executed, if any.
    pub(crate) fn retire(&mut self, vcpu_id: u32, exit: &ExitReason) -> Option<T> {
        let retired = match exit {
            ExitReason::Debug(debug) => debug.is_single_step(),
            ExitReason::Hlt => true,
            _ => false,
        };
        if retired {
            self.pending.remove(&vcpu_id)
        } else {
            None
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}
