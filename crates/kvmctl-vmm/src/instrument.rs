//! Instrumentation points: byte patches, stop points and hook points, plus
//! the per-vCPU guest-debug control word they are realised through.

use crate::vm::Vm;
use kvm_bindings::{
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_HW_BP, KVM_GUESTDBG_USE_SW_BP,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The x86 `int3` opcode written for software stop and hook points.
pub const INT3: u8 = 0xcc;

/// Number of hardware debug-address registers (DR0–DR3).
pub const HW_BREAKPOINT_SLOTS: usize = 4;

/// Guest-debug flags enabling single-step with hardware breakpoints.
pub const SINGLE_STEP_FLAGS: u32 =
    KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP | KVM_GUESTDBG_USE_HW_BP;

/// Errors from patch and stop-point manipulation.  The VM is left
/// unchanged whenever one of these is returned.
#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("Patch at {addr:#x} has no bytes")]
    EmptyPatch { addr: u64 },

    #[error("Patch at {addr:#x} overlaps an existing patch at {existing:#x}")]
    Overlap { addr: u64, existing: u64 },

    #[error("Stop point already set at {addr:#x}")]
    DuplicateStopPoint { addr: u64 },

    #[error("All four hardware breakpoint slots are in use")]
    TooManyHardwareStopPoints,

    #[error("No patch at {addr:#x}")]
    NotPatched { addr: u64 },

    #[error("Guest virtual address {gva:#x} is not mapped")]
    Unmapped { gva: u64 },
}

// ═══════════════════════════════════════════════════════════════════════
//  Patch points
// ═══════════════════════════════════════════════════════════════════════

/// A guest byte range whose original contents were overwritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPoint {
    /// Guest virtual address the patch was requested at.
    pub gva: u64,
    /// Guest physical address the bytes were written to.
    pub gpa: u64,
    /// Bytes saved before the patch was applied.
    pub original: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl PatchPoint {
    pub fn size(&self) -> usize {
        self.replacement.len()
    }

    /// Whether `[gpa, gpa + len)` intersects this patch.
    pub fn overlaps(&self, gpa: u64, len: usize) -> bool {
        let end = self.gpa.saturating_add(self.size() as u64);
        gpa < end && self.gpa < gpa.saturating_add(len as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Stop points
// ═══════════════════════════════════════════════════════════════════════

/// How a stop point is armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopKind {
    /// One of the DR0–DR3 execution breakpoints.
    Hardware,
    /// An `int3` written over the first byte of the instruction.
    Software,
}

/// An address at which the run loop halts and returns control.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPoint {
    pub addr: u64,
    pub kind: StopKind,
    /// The `int3` patch backing a software stop point.
    pub saved: Option<PatchPoint>,
}

// ═══════════════════════════════════════════════════════════════════════
//  Hook points
// ═══════════════════════════════════════════════════════════════════════

/// What the engine does after a hook callback returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookAction {
    /// Execute the original instruction and keep the hook armed.
    Continue,
    /// Halt the vCPU as if it had reached a stop point.
    Stop,
}

/// Callback fired when a vCPU reaches a hook point.
pub type HookFn = dyn Fn(&mut Vm, u32) -> HookAction;

/// A patch point with an attached callback.
#[derive(Clone)]
pub struct HookPoint {
    pub patch: PatchPoint,
    pub callback: Arc<HookFn>,
}

impl HookPoint {
    pub fn addr(&self) -> u64 {
        self.patch.gva
    }
}

impl PartialEq for HookPoint {
    fn eq(&self, other: &Self) -> bool {
        self.patch == other.patch && Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl fmt::Debug for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPoint")
            .field("patch", &self.patch)
            .field("callback", &Arc::as_ptr(&self.callback))
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Guest-debug control
// ═══════════════════════════════════════════════════════════════════════

/// The `KVM_SET_GUEST_DEBUG` state of one vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugControl {
    /// `KVM_GUESTDBG_*` flags.
    pub control: u32,
    /// DR0–DR7 as handed to the hypervisor.
    pub debugreg: [u64; 8],
}

impl DebugControl {
    pub fn set(&mut self, flags: u32) {
        self.control |= flags;
    }

    pub fn clear(&mut self, flags: u32) {
        self.control &= !flags;
        if self.control & !KVM_GUESTDBG_ENABLE == 0 {
            self.control = 0;
        }
    }

    pub fn has(&self, flags: u32) -> bool {
        self.control & flags == flags
    }

    pub fn single_step(&self) -> bool {
        self.has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP)
    }

    /// Merge the engine's stop and hook points into this control word.
    ///
    /// `hw_addrs` fill DR0–DR3 in order with local-enable execution
    /// breakpoints; `sw_points` turns on `int3` interception.
    pub fn with_breakpoints(&self, hw_addrs: &[u64], sw_points: bool, force_step: bool) -> Self {
        let mut merged = *self;
        if !hw_addrs.is_empty() {
            merged.control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP;
            let mut dr7 = merged.debugreg[7];
            for (slot, addr) in hw_addrs.iter().take(HW_BREAKPOINT_SLOTS).enumerate() {
                merged.debugreg[slot] = *addr;
                // L<n> enable; R/W and LEN stay 0 for instruction execution.
                dr7 |= 1 << (slot * 2);
            }
            merged.debugreg[7] = dr7;
        }
        if sw_points {
            merged.control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP;
        }
        if force_step {
            merged.control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP;
        }
        merged
    }

    /// DR0–DR3 addresses armed in DR7 as execution breakpoints.
    pub fn hw_breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        (0..HW_BREAKPOINT_SLOTS)
            .filter(|slot| self.debugreg[7] & (1 << (slot * 2)) != 0)
            .map(|slot| self.debugreg[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlap() {
        let patch = PatchPoint {
            gva: 0x1000,
            gpa: 0x1000,
            original: vec![0; 4],
            replacement: vec![0x90; 4],
        };
        assert!(patch.overlaps(0x1000, 1));
        assert!(patch.overlaps(0x0ffe, 3));
        assert!(patch.overlaps(0x1003, 8));
        assert!(!patch.overlaps(0x1004, 1));
        assert!(!patch.overlaps(0x0ffc, 4));
    }

    #[test]
    fn overlap_at_top_of_address_space() {
        let patch = PatchPoint {
            gva: u64::MAX - 1,
            gpa: u64::MAX - 1,
            original: vec![0; 2],
            replacement: vec![0x90; 2],
        };
        assert!(patch.overlaps(u64::MAX - 3, 8));
        assert!(patch.overlaps(0x1000, usize::MAX));
        assert!(!patch.overlaps(0x1000, 4));
    }

    #[test]
    fn single_step_flags_set_and_clear() {
        let mut ctl = DebugControl::default();
        ctl.set(SINGLE_STEP_FLAGS);
        assert!(ctl.single_step());
        assert!(ctl.has(KVM_GUESTDBG_USE_HW_BP));
        ctl.clear(SINGLE_STEP_FLAGS);
        assert_eq!(ctl.control, 0);
        assert!(!ctl.single_step());
    }

    #[test]
    fn clear_keeps_enable_while_other_flags_remain() {
        let mut ctl = DebugControl::default();
        ctl.set(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP | KVM_GUESTDBG_USE_SW_BP);
        ctl.clear(KVM_GUESTDBG_SINGLESTEP);
        assert!(ctl.has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP));
    }

    #[test]
    fn breakpoints_fill_debug_registers() {
        let ctl = DebugControl::default();
        let merged = ctl.with_breakpoints(&[0x1000, 0x2000], false, false);
        assert!(merged.has(KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP));
        assert_eq!(merged.debugreg[0], 0x1000);
        assert_eq!(merged.debugreg[1], 0x2000);
        assert_eq!(merged.debugreg[7] & 0xf, 0b0101);
        let armed: Vec<u64> = merged.hw_breakpoints().collect();
        assert_eq!(armed, vec![0x1000, 0x2000]);
        // The caller's own word is untouched.
        assert_eq!(ctl, DebugControl::default());
    }

    #[test]
    fn forced_step_and_sw_points() {
        let merged = DebugControl::default().with_breakpoints(&[], true, true);
        assert!(merged.single_step());
        assert!(merged.has(KVM_GUESTDBG_USE_SW_BP));
        assert_eq!(merged.hw_breakpoints().count(), 0);
    }
}
