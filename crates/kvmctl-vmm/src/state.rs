//! Owned byte images of hypervisor ABI structures.
//!
//! KVM hands register sets and in-kernel device state back as fixed-size
//! `#[repr(C)]` structures.  Several of them carry unions or flexible
//! array tails, so the generated bindings do not derive `PartialEq` or
//! even `Clone` uniformly.  [`StateBlob`] stores such a structure as its
//! exact byte image instead, which gives every captured field the same
//! clone, comparison and on-disk behaviour.

use kvm_bindings::{
    kvm_clock_data, kvm_debugregs, kvm_fpu, kvm_irq_routing_entry, kvm_irqchip, kvm_lapic_state,
    kvm_mp_state, kvm_pit_state2, kvm_regs, kvm_sregs, kvm_vcpu_events, kvm_xcrs, kvm_xsave,
};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

/// Marker for KVM ABI structures that are valid for any bit pattern.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` plain data with no pointers, no
/// references and no invariants on their bytes, so that reading an
/// arbitrary `size_of::<Self>()` byte buffer back as `Self` is sound.
pub unsafe trait KvmState: Sized {}

unsafe impl KvmState for kvm_regs {}
unsafe impl KvmState for kvm_sregs {}
unsafe impl KvmState for kvm_debugregs {}
unsafe impl KvmState for kvm_vcpu_events {}
unsafe impl KvmState for kvm_xsave {}
unsafe impl KvmState for kvm_xcrs {}
unsafe impl KvmState for kvm_fpu {}
unsafe impl KvmState for kvm_mp_state {}
unsafe impl KvmState for kvm_lapic_state {}
unsafe impl KvmState for kvm_pit_state2 {}
unsafe impl KvmState for kvm_clock_data {}
unsafe impl KvmState for kvm_irqchip {}
unsafe impl KvmState for kvm_irq_routing_entry {}

/// View a KVM structure as its raw bytes.
pub fn bytes_of<T: KvmState>(value: &T) -> &[u8] {
    // SAFETY: `T: KvmState` is plain data of exactly `size_of::<T>()` bytes.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

/// Read a KVM structure back from a byte buffer of exactly its size.
pub fn read_state<T: KvmState>(bytes: &[u8]) -> Option<T> {
    if bytes.len() != size_of::<T>() {
        return None;
    }
    // SAFETY: length checked above; `T: KvmState` accepts any bit pattern.
    Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// The captured byte image of one KVM structure.
pub struct StateBlob<T: KvmState> {
    bytes: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T: KvmState> StateBlob<T> {
    /// Capture `value`.
    pub fn new(value: &T) -> Self {
        Self {
            bytes: bytes_of(value).to_vec(),
            _marker: PhantomData,
        }
    }

    /// Rebuild a blob from bytes previously produced by [`as_bytes`].
    ///
    /// Returns `None` when the length does not match the structure size.
    ///
    /// [`as_bytes`]: Self::as_bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != size_of::<T>() {
            return None;
        }
        Some(Self {
            bytes,
            _marker: PhantomData,
        })
    }

    /// Decode the structure.
    pub fn get(&self) -> T {
        // SAFETY: `bytes` always has exactly `size_of::<T>()` bytes.
        unsafe { std::ptr::read_unaligned(self.bytes.as_ptr() as *const T) }
    }

    /// Replace the stored image with `value`.
    pub fn set(&mut self, value: &T) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes_of(value));
    }

    /// Decode, mutate and store back.
    pub fn update(&mut self, f: impl FnOnce(&mut T)) {
        let mut value = self.get();
        f(&mut value);
        self.set(&value);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T: KvmState> Clone for StateBlob<T> {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: KvmState> PartialEq for StateBlob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T: KvmState> Eq for StateBlob<T> {}

impl<T: KvmState> fmt::Debug for StateBlob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "StateBlob<{}>({} bytes)", short, self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrips_register_values() {
        let regs = kvm_regs {
            rip: 0x1000,
            rsp: 0x8ff0,
            rflags: 0x2,
            ..Default::default()
        };
        let blob = StateBlob::new(&regs);
        assert_eq!(blob.as_bytes().len(), size_of::<kvm_regs>());
        let back = blob.get();
        assert_eq!(back.rip, 0x1000);
        assert_eq!(back.rsp, 0x8ff0);
    }

    #[test]
    fn blob_rejects_wrong_length() {
        assert!(StateBlob::<kvm_regs>::from_bytes(vec![0u8; 3]).is_none());
        let ok = StateBlob::<kvm_regs>::from_bytes(vec![0u8; size_of::<kvm_regs>()]);
        assert!(ok.is_some());
    }

    #[test]
    fn blob_update_changes_equality() {
        let a = StateBlob::new(&kvm_regs::default());
        let mut b = a.clone();
        assert_eq!(a, b);
        b.update(|r| r.rax = 7);
        assert_ne!(a, b);
        assert_eq!(b.get().rax, 7);
    }

    #[test]
    fn read_state_checks_size() {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        let bytes = bytes_of(&fpu).to_vec();
        let back: kvm_fpu = read_state(&bytes).unwrap();
        assert_eq!(back.fcw, 0x37f);
        assert!(read_state::<kvm_fpu>(&bytes[1..]).is_none());
    }
}
