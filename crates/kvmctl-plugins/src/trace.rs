//! Instruction-trace capture plugin.
//!
//! Every retired instruction on a traced vCPU is appended to that vCPU's
//! trace buffer as one fixed-size packet:
//!
//! ```text
//!   offset 0   u64 LE   address space (page-table base)
//!   offset 8   u64 LE   instruction pointer
//! ```
//!
//! Capture is driven by hardware single-step.  Packets are only written
//! once an exit proves the instruction actually executed, so a vCPU parked
//! on a stop point never contributes the instruction it stopped in front
//! of.  Buffers are decoded offline by [`crate::decode`].

use crate::retire::InFlight;
use kvmctl_vmm::hypervisor::ExitReason;
use kvmctl_vmm::instrument::SINGLE_STEP_FLAGS;
use kvmctl_vmm::plugin::{Plugin, PluginError};
use kvmctl_vmm::vm::{Vm, VmError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;

pub const NAME: &str = "trace";

/// Bytes per trace packet.
pub const PACKET_SIZE: usize = 16;

/// Packets kept per vCPU when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 1 << 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// vCPUs to trace; empty traces all of them.
    pub vcpus: Vec<u32>,
    /// Maximum packets kept per vCPU.
    pub capacity: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            vcpus: Vec::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// One vCPU's raw packet buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuTrace {
    pub vcpu_id: u32,
    pub data: Vec<u8>,
}

/// What [`TracePlugin`] hands out from `extract_data`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceData {
    pub vcpus: Vec<VcpuTrace>,
}

impl TraceData {
    pub fn vcpu(&self, id: u32) -> Option<&VcpuTrace> {
        self.vcpus.iter().find(|t| t.vcpu_id == id)
    }
}

pub fn encode_packet(asid: u64, ip: u64) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[..8].copy_from_slice(&asid.to_le_bytes());
    packet[8..].copy_from_slice(&ip.to_le_bytes());
    packet
}

#[derive(Debug, Default)]
pub struct TracePlugin {
    config: TraceConfig,
    /// The instruction each vCPU was entered at, pending its retirement.
    in_flight: InFlight<(u64, u64)>,
    buffers: BTreeMap<u32, Vec<u8>>,
    dropped: u64,
    /// vCPUs holding our step claim while enabled.
    armed: Option<Vec<u32>>,
}

impl TracePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn traces(&self, vcpu_id: u32) -> bool {
        self.config.vcpus.is_empty() || self.config.vcpus.contains(&vcpu_id)
    }

    fn selection(&self, vm: &Vm) -> Vec<u32> {
        if self.config.vcpus.is_empty() {
            vm.vcpu_ids()
        } else {
            self.config.vcpus.clone()
        }
    }

    fn arm(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        let ids = self.selection(vm);
        vm.claim_debug_flags(SINGLE_STEP_FLAGS, &ids)?;
        self.armed = Some(ids);
        Ok(())
    }

    fn disarm(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        if let Some(ids) = self.armed.take() {
            vm.release_debug_flags(SINGLE_STEP_FLAGS, &ids)?;
        }
        Ok(())
    }

    /// Packets dropped because a buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Plugin for TracePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Captures a per-vCPU instruction trace for offline decode"
    }

    fn enable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
        self.arm(vm).map_err(|e| PluginError::hook(NAME, e))
    }

    fn disable(&mut self, vm: &mut Vm) -> Result<(), PluginError> {
        self.disarm(vm).map_err(|e| PluginError::hook(NAME, e))?;
        self.in_flight.clear();
        Ok(())
    }

    fn configure(&mut self, vm: &mut Vm, config: &dyn Any) -> Result<(), PluginError> {
        let config = config
            .downcast_ref::<TraceConfig>()
            .ok_or(PluginError::BadConfig {
                plugin: NAME.to_string(),
                expected: "TraceConfig",
            })?;
        if config.capacity == 0 {
            return Err(PluginError::hook(NAME, "trace capacity must be non-zero"));
        }
        if let Some(missing) = config.vcpus.iter().find(|&&id| vm.vcpu(id).is_err()) {
            return Err(PluginError::hook(NAME, format!("no vCPU {}", missing)));
        }
        self.config = config.clone();
        self.buffers.clear();
        self.in_flight.clear();
        if self.armed.is_some() {
            // Enabled: move the step claim onto the new selection.
            self.disarm(vm).map_err(|e| PluginError::hook(NAME, e))?;
            self.arm(vm).map_err(|e| PluginError::hook(NAME, e))?;
        }
        debug!(
            "Tracing vCPUs {:?} with {} packets each",
            self.config.vcpus, self.config.capacity
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<(), PluginError> {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
        self.in_flight.clear();
        self.dropped = 0;
        Ok(())
    }

    fn extract_data(&mut self) -> Result<Box<dyn Any>, PluginError> {
        let vcpus = self
            .buffers
            .iter()
            .map(|(&vcpu_id, data)| VcpuTrace {
                vcpu_id,
                data: data.clone(),
            })
            .collect();
        Ok(Box::new(TraceData { vcpus }))
    }

    fn vcpu_pre_launch(&mut self, vm: &mut Vm, vcpu_id: u32) -> Result<(), PluginError> {
        if !self.traces(vcpu_id) {
            return Ok(());
        }
        self.in_flight
            .enter(vm, vcpu_id, |vm| {
                let vcpu = vm.vcpu(vcpu_id)?;
                Ok((vcpu.address_space()?, vcpu.rip()?))
            })
            .map_err(|e| PluginError::hook(NAME, e))
    }

    fn vcpu_post_launch(
        &mut self,
        _vm: &mut Vm,
        vcpu_id: u32,
        exit: &ExitReason,
    ) -> Result<bool, PluginError> {
        if !self.traces(vcpu_id) {
            return Ok(false);
        }
        if let Some((asid, ip)) = self.in_flight.retire(vcpu_id, exit) {
            let buffer = self.buffers.entry(vcpu_id).or_default();
            if buffer.len() / PACKET_SIZE < self.config.capacity {
                buffer.extend_from_slice(&encode_packet(asid, ip));
            } else {
                if self.dropped == 0 {
                    warn!("Trace buffer for vCPU {} is full, dropping packets", vcpu_id);
                }
                self.dropped += 1;
            }
        }
        Ok(true)
    }
}
