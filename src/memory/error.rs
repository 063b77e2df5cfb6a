use super::vm::VmError;
use thiserror::Error;

/// Every failure the block pools and the manager can report.
///
/// `InvalidAddress`, `DoubleFree` and `UnknownAddress` always mean the caller
/// misused an address. They are never recovered from internally.
#[derive(Debug, Error)]
pub enum MemError {
    /// Address lies outside the pool's arena or is not on a slot boundary.
    #[error("address {addr:#x} is outside the pool arena or not on a slot boundary")]
    InvalidAddress { addr: usize },

    /// Slot at this address is already free.
    #[error("double free of address {addr:#x} in the {block_size}-byte pool")]
    DoubleFree { addr: usize, block_size: usize },

    /// The pool serving this size class has no free slot left.
    #[error("the {block_size}-byte pool is exhausted")]
    Exhausted { block_size: usize },

    /// The fallback allocator failed, or exhaustion policy forbids fallback.
    #[error("out of memory for a {size}-byte request")]
    OutOfMemory { size: usize },

    /// No pool and no fallback entry claims this address.
    #[error("address {addr:#x} was never issued by this manager (or is already recycled)")]
    UnknownAddress { addr: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Integrity check found bookkeeping that disagrees with the bitmap.
    #[error("allocator state corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl MemError {
    /// True for the kinds that can only come from caller misuse.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            MemError::InvalidAddress { .. }
                | MemError::DoubleFree { .. }
                | MemError::UnknownAddress { .. }
        )
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_classification() {
        assert!(MemError::DoubleFree { addr: 0x10, block_size: 16 }.is_misuse());
        assert!(MemError::InvalidAddress { addr: 0x11 }.is_misuse());
        assert!(MemError::UnknownAddress { addr: 0x12 }.is_misuse());
        assert!(!MemError::Exhausted { block_size: 16 }.is_misuse());
        assert!(!MemError::OutOfMemory { size: 1 << 20 }.is_misuse());
    }

    #[test]
    fn test_messages_name_the_address() {
        let msg = MemError::DoubleFree { addr: 0x1000, block_size: 64 }.to_string();
        assert!(msg.contains("0x1000"));
        assert!(msg.contains("64-byte"));
    }

    #[test]
    fn test_vm_error_is_transparent() {
        let err: MemError = VmError::ReleaseFailed(std::io::Error::other("gone")).into();
        assert_eq!(err.to_string(), "VM release failed: gone");
    }
}
