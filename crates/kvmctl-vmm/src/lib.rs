//! kvmctl VMM: KVM guest control, snapshots and execution instrumentation.
//!
//! This crate builds a single hardware-virtualized guest, captures and
//! restores its complete architectural and hypervisor-level state, patches
//! and breakpoints guest code, and drives execution through a plugin
//! capability table.
//!
//! # Architecture
//!
//! - [`state`]: Owned byte images of KVM ABI structures
//! - [`record`]: VM-global hypervisor configuration records
//! - [`hypervisor`]: The hardware-control seam ([`VmControl`](hypervisor::VmControl) / [`VcpuControl`](hypervisor::VcpuControl))
//! - [`kvm`]: `/dev/kvm` backend for the seam
//! - [`memory`]: Guest physical memory
//! - [`instrument`]: Patch, stop and hook points; guest-debug control
//! - [`snapshot`]: Point-in-time VM snapshots
//! - [`vm`]: VM and vCPU ownership
//! - [`plugin`]: Plugin capability table and loader
//! - [`engine`]: Run loop and plugin lifecycle
//! - [`serialize`]: On-disk snapshot directories

pub mod engine;
pub mod hypervisor;
pub mod instrument;
pub mod kvm;
pub mod memory;
pub mod plugin;
pub mod record;
pub mod serialize;
pub mod snapshot;
pub mod state;
pub mod vm;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
