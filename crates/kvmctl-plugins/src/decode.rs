//! Offline decode of [`TracePlugin`](crate::trace::TracePlugin) buffers.
//!
//! A trace packet only names an address space and an instruction pointer;
//! the instruction bytes are fetched back out of guest memory through a
//! [`GuestMemoryReader`], which for a live guest is the engine itself.

use crate::trace::{TraceData, PACKET_SIZE};
use kvmctl_vmm::engine::Engine;
use kvmctl_vmm::vm::{Vm, VmError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Trace of vCPU {vcpu} is {len} bytes, not a whole number of packets")]
    Truncated { vcpu: u32, len: usize },

    #[error("Cannot read instruction at {ip:#x} in address space {asid:#x}: {source}")]
    Memory {
        asid: u64,
        ip: u64,
        #[source]
        source: VmError,
    },
}

/// Memory-read capability handed to a decoder.
pub trait GuestMemoryReader {
    /// Fill `buf` from guest virtual address `gva` in address space `asid`.
    fn read_memory(&self, asid: u64, gva: u64, buf: &mut [u8]) -> Result<(), VmError>;
}

impl GuestMemoryReader for Vm {
    fn read_memory(&self, asid: u64, gva: u64, buf: &mut [u8]) -> Result<(), VmError> {
        self.read_asid(asid, gva, buf)
    }
}

impl GuestMemoryReader for Engine {
    fn read_memory(&self, asid: u64, gva: u64, buf: &mut [u8]) -> Result<(), VmError> {
        self.vm().read_asid(asid, gva, buf)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub vcpu_id: u32,
    pub asid: u64,
    pub ip: u64,
    pub opcode: u8,
}

impl Instruction {
    /// Mnemonic for the handful of one-byte opcodes worth naming.
    pub fn mnemonic(&self) -> Option<&'static str> {
        match self.opcode {
            0x90 => Some("nop"),
            0xf4 => Some("hlt"),
            0xcc => Some("int3"),
            0xe6 => Some("out"),
            0xc3 => Some("ret"),
            _ => None,
        }
    }
}

fn parse_packet(packet: &[u8]) -> (u64, u64) {
    let mut asid = [0u8; 8];
    let mut ip = [0u8; 8];
    asid.copy_from_slice(&packet[..8]);
    ip.copy_from_slice(&packet[8..PACKET_SIZE]);
    (u64::from_le_bytes(asid), u64::from_le_bytes(ip))
}

/// Decode every packet of every vCPU, in vCPU order then trace order.
pub fn decode_trace(
    data: &TraceData,
    reader: &dyn GuestMemoryReader,
) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    for trace in &data.vcpus {
        if trace.data.len() % PACKET_SIZE != 0 {
            return Err(DecodeError::Truncated {
                vcpu: trace.vcpu_id,
                len: trace.data.len(),
            });
        }
        for packet in trace.data.chunks_exact(PACKET_SIZE) {
            let (asid, ip) = parse_packet(packet);
            let mut opcode = [0u8; 1];
            reader
                .read_memory(asid, ip, &mut opcode)
                .map_err(|source| DecodeError::Memory { asid, ip, source })?;
            out.push(Instruction {
                vcpu_id: trace.vcpu_id,
                asid,
                ip,
                opcode: opcode[0],
            });
        }
    }
    Ok(out)
}
