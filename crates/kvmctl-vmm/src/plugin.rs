//! Plugin capability table and loader.
//!
//! A plugin is any [`Plugin`] implementor.  It is registered with an
//! [`Engine`](crate::engine::Engine) either statically or by loading a
//! shared library that exports the entry point generated by
//! [`declare_plugin!`](crate::declare_plugin).  The plugin object is its own
//! opaque state: the engine only ever drives it through the trait, and
//! dropping it at unload is the plugin's `free_state`.
//!
//! Per-plugin lifecycle:
//!
//! ```text
//!   Loaded ──enable──► Enabled ◄──enable── Disabled
//!                         └──────disable──────►┘
//!   reset / configure / extract_data: any state
//!   unload: drops the plugin exactly once
//! ```

use crate::hypervisor::ExitReason;
use crate::vm::Vm;
use libloading::Library;
use log::info;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Capability-table version this build of the engine speaks.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol every plugin library exports.
pub const PLUGIN_INIT_SYMBOL: &[u8] = b"kvmctl_plugin_init\0";

/// Signature of the exported entry point.
pub type PluginInit = fn(&mut Vm) -> Box<dyn Plugin>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Failed to load plugin library {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Plugin library {path} has no kvmctl_plugin_init: {source}")]
    MissingEntryPoint {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Plugin {name} speaks capability version {found}, engine speaks {expected}")]
    IncompatibleVersion {
        name: String,
        found: u32,
        expected: u32,
    },

    #[error("No plugin with id {0}")]
    NoSuchPlugin(u32),

    #[error("Plugin {id} cannot {op} while {state}")]
    InvalidState {
        id: u32,
        state: PluginState,
        op: &'static str,
    },

    #[error("Plugin {plugin} expects a {expected} configuration")]
    BadConfig {
        plugin: String,
        expected: &'static str,
    },

    #[error("Plugin {plugin} produced no {expected}")]
    WrongDataType {
        plugin: String,
        expected: &'static str,
    },

    #[error("Plugin {plugin}: {message}")]
    Hook { plugin: String, message: String },
}

impl PluginError {
    /// Wrap a failure inside a plugin's own capability.
    pub fn hook(plugin: &str, err: impl fmt::Display) -> Self {
        PluginError::Hook {
            plugin: plugin.to_string(),
            message: err.to_string(),
        }
    }
}

/// The fixed capability set.  Every capability has a no-op default.
pub trait Plugin {
    fn version(&self) -> u32 {
        PLUGIN_ABI_VERSION
    }

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Whether restoring a snapshot must reset this plugin.
    fn reset_on_snapshot_restore(&self) -> bool {
        false
    }

    fn enable(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
        Ok(())
    }

    fn disable(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
        Ok(())
    }

    /// Apply a plugin-defined configuration value.
    fn configure(&mut self, _vm: &mut Vm, _config: &dyn Any) -> Result<(), PluginError> {
        Ok(())
    }

    /// Reinitialise collected state without tearing the plugin down.
    fn reset(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Hand a plugin-defined buffer to the caller.
    fn extract_data(&mut self) -> Result<Box<dyn Any>, PluginError> {
        Ok(Box::new(()))
    }

    fn vm_pre_launch(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
        Ok(())
    }

    fn vm_post_launch(&mut self, _vm: &mut Vm) -> Result<(), PluginError> {
        Ok(())
    }

    fn vcpu_pre_launch(&mut self, _vm: &mut Vm, _vcpu_id: u32) -> Result<(), PluginError> {
        Ok(())
    }

    /// Returns `true` to keep single-stepping this vCPU without yielding
    /// to the caller.
    fn vcpu_post_launch(
        &mut self,
        _vm: &mut Vm,
        _vcpu_id: u32,
        _exit: &ExitReason,
    ) -> Result<bool, PluginError> {
        Ok(false)
    }
}

/// Export `kvmctl_plugin_init` from a plugin library.
///
/// `$ctor` is called with the engine's VM and must return the plugin.
///
/// ```ignore
/// kvmctl_vmm::declare_plugin!(|_vm: &mut Vm| MyPlugin::default());
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($ctor:expr) => {
        #[no_mangle]
        pub fn kvmctl_plugin_init(
            vm: &mut $crate::vm::Vm,
        ) -> ::std::boxed::Box<dyn $crate::plugin::Plugin> {
            ::std::boxed::Box::new(($ctor)(vm))
        }
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginState {
    Loaded,
    Enabled,
    Disabled,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginState::Loaded => "loaded",
            PluginState::Enabled => "enabled",
            PluginState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// A plugin owned by the engine.
pub struct PluginRecord {
    pub id: u32,
    pub state: PluginState,
    // Declared before `library` so the plugin drops while its code is
    // still mapped.
    pub(crate) plugin: Box<dyn Plugin>,
    library: Option<Library>,
    path: Option<PathBuf>,
}

impl PluginRecord {
    pub(crate) fn new(id: u32, plugin: Box<dyn Plugin>) -> Self {
        Self {
            id,
            state: PluginState::Loaded,
            plugin,
            library: None,
            path: None,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn description(&self) -> &str {
        self.plugin.description()
    }

    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }

    /// Library the plugin was loaded from, if it was loaded dynamically.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state)
            .field("path", &self.path)
            .finish()
    }
}

/// Open `path` and run its entry point against `vm`.
pub(crate) fn load_library(
    id: u32,
    path: &Path,
    vm: &mut Vm,
) -> Result<PluginRecord, PluginError> {
    // SAFETY: loading runs the library's initialisers; plugin libraries are
    // trusted code built against this crate.
    let library = unsafe { Library::new(path) }.map_err(|source| PluginError::Load {
        path: path.to_path_buf(),
        source,
    })?;

    // SAFETY: the symbol is generated by `declare_plugin!` with exactly the
    // `PluginInit` signature; `library` stays alive in the record for as
    // long as the returned plugin exists.
    let plugin = unsafe {
        let init: libloading::Symbol<PluginInit> =
            library
                .get(PLUGIN_INIT_SYMBOL)
                .map_err(|source| PluginError::MissingEntryPoint {
                    path: path.to_path_buf(),
                    source,
                })?;
        init(vm)
    };

    if plugin.version() != PLUGIN_ABI_VERSION {
        return Err(PluginError::IncompatibleVersion {
            name: plugin.name().to_string(),
            found: plugin.version(),
            expected: PLUGIN_ABI_VERSION,
        });
    }

    info!(
        "Loaded plugin {} ({}) from {}",
        plugin.name(),
        id,
        path.display()
    );
    let mut record = PluginRecord::new(id, plugin);
    record.library = Some(library);
    record.path = Some(path.to_path_buf());
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHypervisor;
    use crate::vm::VmConfig;

    struct Named;

    impl Plugin for Named {
        fn name(&self) -> &str {
            "named"
        }
    }

    crate::declare_plugin!(|_vm: &mut Vm| Named);

    fn vm() -> Vm {
        let config = VmConfig {
            memory_size: 0x1000,
            ..Default::default()
        };
        Vm::new(Box::new(MockHypervisor::new()), config).unwrap()
    }

    #[test]
    fn defaults_are_no_ops() {
        let mut vm = vm();
        let mut plugin = Named;
        assert_eq!(plugin.version(), PLUGIN_ABI_VERSION);
        assert_eq!(plugin.description(), "");
        assert!(!plugin.reset_on_snapshot_restore());
        plugin.enable(&mut vm).unwrap();
        plugin.reset().unwrap();
        assert!(!plugin
            .vcpu_post_launch(&mut vm, 0, &ExitReason::Hlt)
            .unwrap());
        assert!(plugin.extract_data().unwrap().is::<()>());
    }

    #[test]
    fn declared_entry_point_builds_plugin() {
        let mut vm = vm();
        let init: PluginInit = kvmctl_plugin_init;
        let record = PluginRecord::new(7, init(&mut vm));
        assert_eq!(record.name(), "named");
        assert_eq!(record.state, PluginState::Loaded);
        assert!(!record.is_dynamic());
    }

    #[test]
    fn missing_library_fails_to_load() {
        let mut vm = vm();
        let err = load_library(0, Path::new("/nonexistent/libnothing.so"), &mut vm).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
    }
}
