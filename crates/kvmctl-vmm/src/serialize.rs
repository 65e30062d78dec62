//! On-disk snapshot format.
//!
//! A snapshot directory holds one artifact per present field.  Whether an
//! optional field was captured is decided by whether its file exists, so
//! there is no separate presence bitmap to drift out of sync.  Small
//! configuration values are pretty-printed JSON, hypervisor structures are
//! their raw ABI bytes, and guest memory is written verbatim.
//!
//! ```text
//! manifest.json
//! vm/{boot_cpu_id,tss_address,...}.json    vm/irq_routing.bin
//! vcpu-<id>/{regs,sregs,...}.bin           vcpu-<id>/{tsc_khz,msrs,debug_control}.json
//! memory/region-<slot>.{json,bin}
//! devices/<index>.{json,bin}
//! instrument/{patch_points,stop_points}.json
//! timer/{pit,clock,pic_master,pic_slave,ioapic}.bin
//! ```
//!
//! Writing is deterministic: serialising equal snapshots produces
//! byte-identical file sets.  Hook points hold callbacks and are never
//! written.

use crate::hypervisor::{MsrEntry, VmControl};
use crate::instrument::{DebugControl, PatchPoint, StopPoint};
use crate::record::{
    CoalescedMmioZone, DeviceRecord, IoEventFd, IrqFd, IrqRoutingTable, MemoryRegionRecord,
    PitConfig, RecordList, VmRecord, XenHvmConfig,
};
use crate::snapshot::{EmuDeviceSnapshot, MemoryRegionSnapshot, TimerState, VcpuSnapshot, VmSnapshot};
use crate::state::{KvmState, StateBlob};
use crate::vm::{Vm, VmError};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumped whenever the artifact layout changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is {found} bytes, expected {expected}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Manifest lists {expected} {what} but {found} were found")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{path} describes slot {found}, expected slot {expected}")]
    SlotMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("{0} has no manifest.json")]
    MissingManifest(PathBuf),

    #[error("Snapshot format version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Target directory {0} is not empty")]
    NotEmpty(PathBuf),

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Top-level index of a snapshot directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub id: u32,
    pub vcpus: Vec<u32>,
    pub memory_slots: Vec<u32>,
    /// `None` when the snapshot carries no emulated-device list at all.
    pub emu_devices: Option<usize>,
}

impl Manifest {
    fn of(snapshot: &VmSnapshot) -> Self {
        Self {
            version: FORMAT_VERSION,
            id: snapshot.id,
            vcpus: snapshot.vcpus.iter().map(|v| v.id).collect(),
            memory_slots: snapshot.memory.iter().map(|r| r.slot).collect(),
            emu_devices: snapshot.emu_devices.as_option().map(Vec::len),
        }
    }
}

/// Memory region descriptor written next to its contents.
#[derive(Serialize, Deserialize)]
struct RegionHeader {
    slot: u32,
    flags: u32,
    guest_phys_addr: u64,
    size: u64,
}

#[derive(Serialize, Deserialize)]
struct DeviceHeader {
    name: String,
}

// ═══════════════════════════════════════════════════════════════════════
//  Artifact I/O
// ═══════════════════════════════════════════════════════════════════════

/// One directory of artifacts.
struct Artifacts {
    dir: PathBuf,
}

impl Artifacts {
    fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn sub(&self, name: &str) -> Self {
        Self::new(self.dir.join(name))
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> SerializeError + '_ {
        move |source| SerializeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    // ─── Writing ────────────────────────────────────────────────────

    fn write_bytes(&self, name: &str, data: &[u8]) -> Result<(), SerializeError> {
        fs::create_dir_all(&self.dir).map_err(Self::io(&self.dir))?;
        let path = self.path(name);
        fs::write(&path, data).map_err(Self::io(&path))
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), SerializeError> {
        let path = self.path(name);
        let mut json = serde_json::to_vec_pretty(value)
            .map_err(|source| SerializeError::Json { path, source })?;
        json.push(b'\n');
        self.write_bytes(name, &json)
    }

    fn write_opt_json<T: Serialize>(&self, name: &str, value: Option<&T>) -> Result<(), SerializeError> {
        match value {
            Some(v) => self.write_json(name, v),
            None => Ok(()),
        }
    }

    fn write_blob<T: KvmState>(
        &self,
        name: &str,
        blob: Option<&StateBlob<T>>,
    ) -> Result<(), SerializeError> {
        match blob {
            Some(b) => self.write_bytes(name, b.as_bytes()),
            None => Ok(()),
        }
    }

    /// Present lists are written even when empty.
    fn write_list<T: Serialize>(&self, name: &str, list: &RecordList<T>) -> Result<(), SerializeError> {
        self.write_opt_json(name, list.as_option())
    }

    // ─── Reading ────────────────────────────────────────────────────

    fn read_bytes(&self, name: &str) -> Result<Option<Vec<u8>>, SerializeError> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SerializeError::Io { path, source }),
        }
    }

    fn require_bytes(&self, name: &str) -> Result<Vec<u8>, SerializeError> {
        let path = self.path(name);
        fs::read(&path).map_err(Self::io(&path))
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SerializeError> {
        let Some(data) = self.read_bytes(name)? else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| SerializeError::Json {
                path: self.path(name),
                source,
            })
    }

    fn require_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, SerializeError> {
        let data = self.require_bytes(name)?;
        serde_json::from_slice(&data).map_err(|source| SerializeError::Json {
            path: self.path(name),
            source,
        })
    }

    fn read_blob<T: KvmState>(&self, name: &str) -> Result<Option<StateBlob<T>>, SerializeError> {
        let Some(data) = self.read_bytes(name)? else {
            return Ok(None);
        };
        let found = data.len();
        StateBlob::from_bytes(data)
            .map(Some)
            .ok_or_else(|| SerializeError::Truncated {
                path: self.path(name),
                expected: size_of::<T>(),
                found,
            })
    }

    fn read_list<T: DeserializeOwned>(&self, name: &str) -> Result<RecordList<T>, SerializeError> {
        Ok(self.read_json::<Vec<T>>(name)?.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Writing
// ═══════════════════════════════════════════════════════════════════════

/// Serialise snapshot `snapshot_id` of `vm` into `target/snapshot-<id>`.
///
/// With `live` the current state is captured under that id; otherwise the
/// previously taken snapshot is written.  Returns the snapshot directory.
pub fn serialize(
    vm: &Vm,
    target: &Path,
    snapshot_id: u32,
    live: bool,
) -> Result<PathBuf, SerializeError> {
    let dir = target.join(format!("snapshot-{}", snapshot_id));
    if live {
        let snapshot = vm.capture_snapshot(snapshot_id)?;
        write_snapshot(&snapshot, &dir)?;
    } else {
        let snapshot = vm
            .snapshot(snapshot_id)
            .ok_or(VmError::NoSuchSnapshot(snapshot_id))?;
        write_snapshot(snapshot, &dir)?;
    }
    Ok(dir)
}

/// Write `snapshot` into `dir`, which must be absent or empty.
pub fn write_snapshot(snapshot: &VmSnapshot, dir: &Path) -> Result<(), SerializeError> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(SerializeError::NotEmpty(dir.to_path_buf()));
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SerializeError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    }

    let root = Artifacts::new(dir);
    root.write_json(MANIFEST, &Manifest::of(snapshot))?;
    write_record(&root.sub("vm"), &snapshot.record)?;
    for vcpu in &snapshot.vcpus {
        write_vcpu(&root.sub(&format!("vcpu-{}", vcpu.id)), vcpu)?;
    }

    let memory = root.sub("memory");
    for region in &snapshot.memory {
        let header = RegionHeader {
            slot: region.slot,
            flags: region.flags,
            guest_phys_addr: region.guest_phys_addr,
            size: region.size,
        };
        memory.write_json(&format!("region-{}.json", region.slot), &header)?;
        memory.write_bytes(&format!("region-{}.bin", region.slot), &region.contents)?;
    }

    let devices = root.sub("devices");
    for (index, device) in snapshot.emu_devices.iter().enumerate() {
        let header = DeviceHeader {
            name: device.name.clone(),
        };
        devices.write_json(&format!("{}.json", index), &header)?;
        devices.write_bytes(&format!("{}.bin", index), &device.data)?;
    }

    let instrument = root.sub("instrument");
    if !snapshot.patch_points.is_empty() {
        instrument.write_json("patch_points.json", &snapshot.patch_points)?;
    }
    if !snapshot.stop_points.is_empty() {
        instrument.write_json("stop_points.json", &snapshot.stop_points)?;
    }

    write_timer(&root.sub("timer"), &snapshot.timer)?;

    info!(
        "Snapshot {} written to {} ({} vCPU(s), {} KiB memory)",
        snapshot.id,
        dir.display(),
        snapshot.vcpus.len(),
        snapshot.memory_size() / 1024
    );
    Ok(())
}

fn write_record(out: &Artifacts, record: &VmRecord) -> Result<(), SerializeError> {
    out.write_opt_json("boot_cpu_id.json", record.boot_cpu_id.as_ref())?;
    out.write_opt_json("tss_address.json", record.tss_address.as_ref())?;
    out.write_opt_json("identity_map_address.json", record.identity_map_address.as_ref())?;
    if record.irqchip {
        out.write_json("irqchip.json", &true)?;
    }
    if let Some(table) = &record.irq_routing {
        out.write_bytes("irq_routing.bin", &table.to_bytes())?;
    }
    out.write_opt_json("pit_config.json", record.pit_config.as_ref())?;
    out.write_opt_json("pit_reinject.json", record.pit_reinject.as_ref())?;
    out.write_opt_json("xen_hvm_config.json", record.xen_hvm_config.as_ref())?;
    out.write_list("coalesced_mmio.json", &record.coalesced_mmio)?;
    out.write_list("ioeventfds.json", &record.ioeventfds)?;
    out.write_list("irqfds.json", &record.irqfds)?;
    out.write_list("devices.json", &record.devices)?;
    out.write_list("memory_map.json", &record.memory_map)?;
    Ok(())
}

fn write_vcpu(out: &Artifacts, vcpu: &VcpuSnapshot) -> Result<(), SerializeError> {
    // Always create the directory so a vCPU with nothing captured still
    // round-trips through the manifest.
    fs::create_dir_all(&out.dir).map_err(Artifacts::io(&out.dir))?;
    out.write_blob("regs.bin", vcpu.regs.as_ref())?;
    out.write_blob("sregs.bin", vcpu.sregs.as_ref())?;
    out.write_blob("debug_regs.bin", vcpu.debug_regs.as_ref())?;
    out.write_blob("events.bin", vcpu.events.as_ref())?;
    out.write_blob("xsave.bin", vcpu.xsave.as_ref())?;
    out.write_blob("xcrs.bin", vcpu.xcrs.as_ref())?;
    out.write_blob("fpu.bin", vcpu.fpu.as_ref())?;
    out.write_blob("mp_state.bin", vcpu.mp_state.as_ref())?;
    out.write_blob("lapic.bin", vcpu.lapic.as_ref())?;
    out.write_opt_json("tsc_khz.json", vcpu.tsc_khz.as_ref())?;
    out.write_opt_json("msrs.json", vcpu.msrs.as_ref())?;
    out.write_opt_json("debug_control.json", vcpu.debug_control.as_ref())?;
    Ok(())
}

fn write_timer(out: &Artifacts, timer: &TimerState) -> Result<(), SerializeError> {
    out.write_blob("pit.bin", timer.pit.as_ref())?;
    out.write_blob("clock.bin", timer.clock.as_ref())?;
    out.write_blob("pic_master.bin", timer.pic_master.as_ref())?;
    out.write_blob("pic_slave.bin", timer.pic_slave.as_ref())?;
    out.write_blob("ioapic.bin", timer.ioapic.as_ref())?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Reading
// ═══════════════════════════════════════════════════════════════════════

/// Read the manifest of the snapshot directory `dir`.
pub fn read_manifest(dir: &Path) -> Result<Manifest, SerializeError> {
    let root = Artifacts::new(dir);
    let manifest: Manifest = match root.read_json(MANIFEST)? {
        Some(m) => m,
        None => return Err(SerializeError::MissingManifest(dir.to_path_buf())),
    };
    if manifest.version != FORMAT_VERSION {
        return Err(SerializeError::Version {
            found: manifest.version,
            expected: FORMAT_VERSION,
        });
    }
    Ok(manifest)
}

/// Read a snapshot directory back into a [`VmSnapshot`].
pub fn read_snapshot(dir: &Path) -> Result<VmSnapshot, SerializeError> {
    // Opening a directory that does not exist is fatal, not "empty".
    fs::metadata(dir).map_err(Artifacts::io(dir))?;
    let manifest = read_manifest(dir)?;
    let root = Artifacts::new(dir);

    let record = read_record(&root.sub("vm"))?;

    let vcpus = manifest
        .vcpus
        .iter()
        .map(|&id| read_vcpu(&root.sub(&format!("vcpu-{}", id)), id))
        .collect::<Result<Vec<_>, _>>()?;

    let memory_dir = root.sub("memory");
    let mut memory = Vec::with_capacity(manifest.memory_slots.len());
    for &slot in &manifest.memory_slots {
        let header_name = format!("region-{}.json", slot);
        let header: RegionHeader = memory_dir.require_json(&header_name)?;
        if header.slot != slot {
            return Err(SerializeError::SlotMismatch {
                path: memory_dir.path(&header_name),
                expected: slot,
                found: header.slot,
            });
        }
        let name = format!("region-{}.bin", slot);
        let contents = memory_dir.require_bytes(&name)?;
        if contents.len() as u64 != header.size {
            return Err(SerializeError::Truncated {
                path: memory_dir.path(&name),
                expected: header.size as usize,
                found: contents.len(),
            });
        }
        memory.push(MemoryRegionSnapshot {
            slot: header.slot,
            flags: header.flags,
            guest_phys_addr: header.guest_phys_addr,
            size: header.size,
            contents,
        });
    }

    let mut emu_devices = RecordList::new();
    if let Some(count) = manifest.emu_devices {
        emu_devices.mark_present();
        let devices_dir = root.sub("devices");
        for index in 0..count {
            let header: Option<DeviceHeader> = devices_dir.read_json(&format!("{}.json", index))?;
            let data = devices_dir.read_bytes(&format!("{}.bin", index))?;
            match (header, data) {
                (Some(header), Some(data)) => emu_devices.record(EmuDeviceSnapshot {
                    name: header.name,
                    data,
                }),
                _ => {
                    return Err(SerializeError::CountMismatch {
                        what: "emulated devices",
                        expected: count,
                        found: index,
                    })
                }
            }
        }
    }

    let instrument = root.sub("instrument");
    let patch_points: Vec<PatchPoint> = instrument
        .read_json("patch_points.json")?
        .unwrap_or_default();
    let stop_points: Vec<StopPoint> = instrument
        .read_json("stop_points.json")?
        .unwrap_or_default();

    let timer = read_timer(&root.sub("timer"))?;

    debug!(
        "Read snapshot {} from {} ({} vCPU(s), {} region(s))",
        manifest.id,
        dir.display(),
        vcpus.len(),
        memory.len()
    );

    Ok(VmSnapshot {
        id: manifest.id,
        record,
        vcpus,
        memory,
        emu_devices,
        patch_points,
        stop_points,
        hook_points: Vec::new(),
        timer,
    })
}

fn read_record(input: &Artifacts) -> Result<VmRecord, SerializeError> {
    let irq_routing = match input.read_bytes("irq_routing.bin")? {
        Some(bytes) => {
            let found = bytes.len();
            Some(IrqRoutingTable::from_bytes(&bytes).ok_or_else(|| {
                SerializeError::Truncated {
                    path: input.path("irq_routing.bin"),
                    expected: routing_size(&bytes),
                    found,
                }
            })?)
        }
        None => None,
    };

    Ok(VmRecord {
        boot_cpu_id: input.read_json("boot_cpu_id.json")?,
        tss_address: input.read_json("tss_address.json")?,
        identity_map_address: input.read_json("identity_map_address.json")?,
        irqchip: input.read_json::<bool>("irqchip.json")?.unwrap_or(false),
        irq_routing,
        pit_config: input.read_json::<PitConfig>("pit_config.json")?,
        pit_reinject: input.read_json("pit_reinject.json")?,
        xen_hvm_config: input.read_json::<XenHvmConfig>("xen_hvm_config.json")?,
        coalesced_mmio: input.read_list::<CoalescedMmioZone>("coalesced_mmio.json")?,
        ioeventfds: input.read_list::<IoEventFd>("ioeventfds.json")?,
        irqfds: input.read_list::<IrqFd>("irqfds.json")?,
        devices: input.read_list::<DeviceRecord>("devices.json")?,
        memory_map: input.read_list::<MemoryRegionRecord>("memory_map.json")?,
    })
}

/// Size a routing artifact should have according to its own count.
fn routing_size(bytes: &[u8]) -> usize {
    let count = bytes
        .get(..4)
        .and_then(|head| head.try_into().ok())
        .map_or(0, u32::from_le_bytes);
    4 + count as usize * size_of::<kvm_bindings::kvm_irq_routing_entry>()
}

fn read_vcpu(input: &Artifacts, id: u32) -> Result<VcpuSnapshot, SerializeError> {
    if !input.dir.is_dir() {
        return Err(SerializeError::Io {
            path: input.dir.clone(),
            source: ErrorKind::NotFound.into(),
        });
    }
    Ok(VcpuSnapshot {
        id,
        regs: input.read_blob("regs.bin")?,
        sregs: input.read_blob("sregs.bin")?,
        debug_regs: input.read_blob("debug_regs.bin")?,
        events: input.read_blob("events.bin")?,
        xsave: input.read_blob("xsave.bin")?,
        xcrs: input.read_blob("xcrs.bin")?,
        fpu: input.read_blob("fpu.bin")?,
        mp_state: input.read_blob("mp_state.bin")?,
        lapic: input.read_blob("lapic.bin")?,
        tsc_khz: input.read_json("tsc_khz.json")?,
        msrs: input.read_json::<Vec<MsrEntry>>("msrs.json")?,
        debug_control: input.read_json::<DebugControl>("debug_control.json")?,
    })
}

fn read_timer(input: &Artifacts) -> Result<TimerState, SerializeError> {
    Ok(TimerState {
        pit: input.read_blob("pit.bin")?,
        clock: input.read_blob("clock.bin")?,
        pic_master: input.read_blob("pic_master.bin")?,
        pic_slave: input.read_blob("pic_slave.bin")?,
        ioapic: input.read_blob("ioapic.bin")?,
    })
}

/// Rebuild a VM on `control` from the snapshot directory `dir`.
///
/// The VM holds the read snapshot as its only stored snapshot.
pub fn deserialize(control: Box<dyn VmControl>, dir: &Path) -> Result<Vm, SerializeError> {
    let snapshot = read_snapshot(dir)?;
    let id = snapshot.id;
    let vm = Vm::from_snapshot(control, snapshot)?;
    info!("VM deserialized from {} (snapshot {})", dir.display(), id);
    Ok(vm)
}

/// Relative paths of every file under `dir`, sorted.
pub fn artifact_files(dir: &Path) -> Result<Vec<PathBuf>, SerializeError> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SerializeError> {
        for entry in fs::read_dir(dir).map_err(Artifacts::io(dir))? {
            let entry = entry.map_err(Artifacts::io(dir))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
        Ok(())
    }
    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

/// Whether two snapshot directories hold the same files with the same
/// contents.  Returns the first differing relative path otherwise.
pub fn compare_dirs(a: &Path, b: &Path) -> Result<Option<PathBuf>, SerializeError> {
    let files_a = artifact_files(a)?;
    let files_b = artifact_files(b)?;
    for rel in files_a.iter().chain(files_b.iter()) {
        let left = Artifacts::new(a).read_bytes_at(rel)?;
        let right = Artifacts::new(b).read_bytes_at(rel)?;
        if left != right {
            return Ok(Some(rel.clone()));
        }
    }
    Ok(None)
}

impl Artifacts {
    fn read_bytes_at(&self, rel: &Path) -> Result<Option<Vec<u8>>, SerializeError> {
        let path = self.dir.join(rel);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SerializeError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{StopKind, SINGLE_STEP_FLAGS};
    use crate::mock::{MockHypervisor, HLT, NOP};
    use crate::record::IOEVENTFD_FLAG_PIO;
    use crate::vm::VmConfig;
    use kvm_bindings::kvm_irq_routing_entry;
    use tempfile::TempDir;

    fn sample_vm() -> Vm {
        let mut record = VmRecord::with_flat_memory(0x4000);
        record.tss_address = Some(0xfffb_d000);
        record.identity_map_address = Some(0xfffb_c000);
        record.irqchip = true;
        record.pit_config = Some(PitConfig { flags: 1 });
        record.devices.mark_present();
        let mut routing = IrqRoutingTable::new();
        routing.push(&kvm_irq_routing_entry {
            gsi: 4,
            ..Default::default()
        });
        record.irq_routing = Some(routing);

        let config = VmConfig {
            vcpu_count: 2,
            record,
            ..Default::default()
        };
        let mut vm = Vm::new(Box::new(MockHypervisor::new()), config).unwrap();
        vm.write_phys(0x100, &[NOP, NOP, HLT]).unwrap();
        vm.vcpu_mut(1).unwrap().set_rip(0x100).unwrap();
        vm.vcpu_mut(0).unwrap().debug_control.set(SINGLE_STEP_FLAGS);
        vm.register_ioeventfd(IoEventFd {
            addr: 0x80,
            len: 1,
            fd: -1,
            flags: IOEVENTFD_FLAG_PIO,
            ..Default::default()
        })
        .unwrap();
        vm.insert_emu_device("uart0", vec![0x60, 0x00, 0x03]);
        vm.patch_vaddr(0, 0x101, &[0xf4]).unwrap();
        vm.add_stop_point(0x102, StopKind::Hardware).unwrap();
        vm
    }

    fn file_set(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        artifact_files(dir)
            .unwrap()
            .into_iter()
            .map(|rel| {
                let data = fs::read(dir.join(&rel)).unwrap();
                (rel, data)
            })
            .collect()
    }

    #[test]
    fn round_trip_is_structurally_equal_and_byte_stable() {
        let vm = sample_vm();
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();

        let dir = serialize(&vm, first.path(), 5, true).unwrap();
        assert!(dir.join(MANIFEST).is_file());

        let restored = deserialize(Box::new(MockHypervisor::new()), &dir).unwrap();
        assert_eq!(
            restored.capture_snapshot(5).unwrap(),
            vm.capture_snapshot(5).unwrap()
        );
        assert_eq!(restored.record(), vm.record());

        let again = serialize(&restored, second.path(), 5, true).unwrap();
        assert_eq!(file_set(&dir), file_set(&again));
        assert_eq!(compare_dirs(&dir, &again).unwrap(), None);
    }

    #[test]
    fn absent_fields_have_no_artifact() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();

        assert!(dir.join("vm/tss_address.json").is_file());
        assert!(!dir.join("vm/boot_cpu_id.json").exists());
        assert!(!dir.join("vm/xen_hvm_config.json").exists());
        assert!(!dir.join("vm/irqfds.json").exists());
        // Mock vCPUs cannot report XSAVE.
        assert!(dir.join("vcpu-0/regs.bin").is_file());
        assert!(!dir.join("vcpu-0/xsave.bin").exists());
        assert!(dir.join("memory/region-0.bin").is_file());
        assert!(dir.join("devices/0.json").is_file());
        assert!(dir.join("instrument/patch_points.json").is_file());
    }

    #[test]
    fn empty_but_present_lists_survive() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();
        assert_eq!(fs::read(dir.join("vm/devices.json")).unwrap(), b"[]\n");

        let snapshot = read_snapshot(&dir).unwrap();
        assert!(snapshot.record.devices.is_present());
        assert_eq!(snapshot.record.devices.len(), 0);
        assert!(!snapshot.record.irqfds.is_present());
    }

    #[test]
    fn stored_snapshot_can_be_written() {
        let mut vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            serialize(&vm, tmp.path(), 2, false),
            Err(SerializeError::Vm(VmError::NoSuchSnapshot(2)))
        ));
        vm.take_snapshot(2).unwrap();
        let dir = serialize(&vm, tmp.path(), 2, false).unwrap();
        assert_eq!(read_manifest(&dir).unwrap().vcpus, vec![0, 1]);
    }

    #[test]
    fn refuses_non_empty_target() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        serialize(&vm, tmp.path(), 1, true).unwrap();
        assert!(matches!(
            serialize(&vm, tmp.path(), 1, true),
            Err(SerializeError::NotEmpty(_))
        ));
    }

    #[test]
    fn missing_directory_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let err = read_snapshot(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, SerializeError::Io { .. }));
        assert!(matches!(
            read_snapshot(tmp.path()),
            Err(SerializeError::MissingManifest(_))
        ));
    }

    #[test]
    fn truncated_artifact_is_fatal() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();

        let regs = dir.join("vcpu-1/regs.bin");
        let mut bytes = fs::read(&regs).unwrap();
        bytes.pop();
        fs::write(&regs, bytes).unwrap();
        assert!(matches!(
            read_snapshot(&dir),
            Err(SerializeError::Truncated { found, expected, .. }) if found + 1 == expected
        ));
    }

    #[test]
    fn truncated_memory_and_devices_are_fatal() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();

        fs::remove_file(dir.join("devices/0.bin")).unwrap();
        assert!(matches!(
            read_snapshot(&dir),
            Err(SerializeError::CountMismatch { expected: 1, found: 0, .. })
        ));

        fs::write(dir.join("memory/region-0.bin"), [0u8; 16]).unwrap();
        assert!(matches!(
            read_snapshot(&dir),
            Err(SerializeError::Truncated { found: 16, .. })
        ));
    }

    #[test]
    fn region_header_must_match_its_slot() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();

        let path = dir.join("memory/region-0.json");
        let mut header: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        header["slot"] = 4.into();
        fs::write(&path, serde_json::to_vec(&header).unwrap()).unwrap();
        assert!(matches!(
            read_snapshot(&dir),
            Err(SerializeError::SlotMismatch {
                expected: 0,
                found: 4,
                ..
            })
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let vm = sample_vm();
        let tmp = TempDir::new().unwrap();
        let dir = serialize(&vm, tmp.path(), 1, true).unwrap();
        fs::write(dir.join("vm/tss_address.json"), b"{not json").unwrap();
        assert!(matches!(
            read_snapshot(&dir),
            Err(SerializeError::Json { .. })
        ));
    }
}
