//! Reference plugins for the kvmctl engine.
//!
//! - [`single_step`]: hardware single-step with a per-vCPU record of
//!   executed instruction pointers
//! - [`trace`]: per-vCPU instruction trace buffers
//! - [`decode`]: offline decode of trace buffers against guest memory
//!
//! Both plugins are plain [`Plugin`](kvmctl_vmm::plugin::Plugin)
//! implementations; register them with
//! [`Engine::register_plugin`](kvmctl_vmm::engine::Engine::register_plugin)
//! or build them into a shared object with
//! [`declare_plugin!`](kvmctl_vmm::declare_plugin).

pub mod decode;
mod retire;
pub mod single_step;
pub mod trace;

pub use decode::{decode_trace, DecodeError, GuestMemoryReader, Instruction};
pub use single_step::{SingleStepConfig, SingleStepPlugin, StepTrace};
pub use trace::{TraceConfig, TraceData, TracePlugin, VcpuTrace};
