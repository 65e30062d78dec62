//! kvmctl-snapshot: inspect, compare and copy on-disk VM snapshots

use clap::{Parser, Subcommand};
use kvmctl_vmm::kvm::KvmVm;
use kvmctl_vmm::serialize::{
    artifact_files, compare_dirs, deserialize, read_manifest, read_snapshot, serialize,
    write_snapshot, SerializeError,
};
use kvmctl_vmm::snapshot::VmSnapshot;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("Failed to open /dev/kvm: {0}")]
    Kvm(#[from] kvmctl_vmm::hypervisor::HvError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "kvmctl-snapshot")]
#[command(about = "Inspect, compare and copy kvmctl snapshot directories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the manifest and every artifact of a snapshot
    Inspect {
        /// Snapshot directory
        dir: PathBuf,
    },

    /// Compare two snapshots structurally and file by file
    Diff {
        a: PathBuf,
        b: PathBuf,
    },

    /// Read a snapshot and write it back out under a new directory
    Copy {
        src: PathBuf,
        /// Parent directory; the copy lands in <dst>/snapshot-<id>
        dst: PathBuf,

        /// Rebuild a live KVM VM from the snapshot and serialize that
        #[arg(long)]
        through_kvm: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { dir } => cmd_inspect(&dir),
        Commands::Diff { a, b } => cmd_diff(&a, &b),
        Commands::Copy {
            src,
            dst,
            through_kvm,
        } => cmd_copy(&src, &dst, through_kvm),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

fn cmd_inspect(dir: &Path) -> Result<bool, CliError> {
    let manifest = read_manifest(dir)?;
    let snapshot = read_snapshot(dir)?;

    println!("=== Snapshot {} ===", manifest.id);
    println!("Format version: {}", manifest.version);
    println!("vCPUs: {:?}", manifest.vcpus);
    println!(
        "Memory: {} slot(s), {} KiB",
        manifest.memory_slots.len(),
        snapshot.memory_size() / 1024
    );
    match manifest.emu_devices {
        Some(n) => println!("Emulated devices: {}", n),
        None => println!("Emulated devices: none recorded"),
    }
    println!("Patch points: {}", snapshot.patch_points.len());
    println!("Stop points: {}", snapshot.stop_points.len());

    for vcpu in &snapshot.vcpus {
        match vcpu.rip() {
            Some(rip) => println!("  vCPU {}: rip={:#x}", vcpu.id, rip),
            None => println!("  vCPU {}: no registers captured", vcpu.id),
        }
    }

    println!("\n=== Artifacts ===");
    for rel in artifact_files(dir)? {
        let size = std::fs::metadata(dir.join(&rel))?.len();
        println!("  {:<40} {:>10} bytes", rel.display(), size);
    }
    Ok(true)
}

fn report_differences(a: &VmSnapshot, b: &VmSnapshot) {
    if a.id != b.id {
        println!("  id: {} vs {}", a.id, b.id);
    }
    if a.record != b.record {
        println!("  VM record differs");
    }
    for vcpu in &a.vcpus {
        match b.vcpu(vcpu.id) {
            Some(other) if other == vcpu => {}
            Some(_) => println!("  vCPU {} state differs", vcpu.id),
            None => println!("  vCPU {} only in first", vcpu.id),
        }
    }
    for vcpu in b.vcpus.iter().filter(|v| a.vcpu(v.id).is_none()) {
        println!("  vCPU {} only in second", vcpu.id);
    }
    for region in &a.memory {
        match b.region(region.slot) {
            Some(other) if other == region => {}
            Some(_) => println!("  memory slot {} differs", region.slot),
            None => println!("  memory slot {} only in first", region.slot),
        }
    }
    if a.emu_devices != b.emu_devices {
        println!("  emulated devices differ");
    }
    if a.patch_points != b.patch_points {
        println!("  patch points differ");
    }
    if a.stop_points != b.stop_points {
        println!("  stop points differ");
    }
    if a.timer != b.timer {
        println!("  timer / interrupt-controller state differs");
    }
}

fn cmd_diff(a: &Path, b: &Path) -> Result<bool, CliError> {
    let left = read_snapshot(a)?;
    let right = read_snapshot(b)?;

    let equal = left == right;
    if equal {
        println!("Structurally equal");
    } else {
        println!("Structural differences:");
        report_differences(&left, &right);
    }

    let first_diff = compare_dirs(a, b)?;
    match &first_diff {
        None => println!("File sets identical"),
        Some(rel) => println!("File sets differ, first at {}", rel.display()),
    }
    Ok(equal && first_diff.is_none())
}

fn cmd_copy(src: &Path, dst: &Path, through_kvm: bool) -> Result<bool, CliError> {
    let out = if through_kvm {
        let vm = deserialize(Box::new(KvmVm::new()?), src)?;
        let id = read_manifest(src)?.id;
        serialize(&vm, dst, id, true)?
    } else {
        let snapshot = read_snapshot(src)?;
        let out = dst.join(format!("snapshot-{}", snapshot.id));
        write_snapshot(&snapshot, &out)?;
        out
    };

    let same = compare_dirs(src, &out)?.is_none();
    println!(
        "Copied to {} ({})",
        out.display(),
        if same {
            "byte-identical"
        } else {
            "artifacts differ"
        }
    );
    Ok(true)
}
