//! Scratch arenas backing per-worker temporary allocations

use bumpalo::Bump;

/// Default scratch block handed to each worker thread.
pub const SCRATCH_ARENA_CAPACITY: usize = 256 * 1024;

/// Bump allocator for wave-scoped temporaries.
///
/// Each worker thread owns one arena. Allocations stay valid until the wave
/// barrier, where the owning worker calls [`ScratchArena::reset`]. Nothing
/// allocated here is dropped; only plain data belongs in a scratch arena.
pub struct ScratchArena {
    bump: Bump,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::with_capacity(SCRATCH_ARENA_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bump: Bump::with_capacity(capacity),
        }
    }

    /// Allocate a value for the remainder of the wave.
    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.bump.alloc(value)
    }

    /// Allocate a slice copied from `values`.
    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> &mut [T] {
        self.bump.alloc_slice_copy(values)
    }

    /// Allocate an uninitialized byte region of `len` bytes, zero-filled.
    pub fn alloc_bytes(&self, len: usize) -> &mut [u8] {
        self.bump.alloc_slice_fill_copy(len, 0u8)
    }

    /// Bytes handed out since the last reset.
    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Reclaim everything. Called at wave boundaries by the owning worker.
    pub fn reset(&mut self) {
        self.bump.reset();
    }
}

impl Default for ScratchArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_reset() {
        let mut arena = ScratchArena::with_capacity(1024);
        let slice = arena.alloc_slice_copy(&[1u32, 2, 3]);
        assert_eq!(slice, &[1, 2, 3]);
        assert!(arena.allocated_bytes() >= 12);

        arena.reset();
        let value = arena.alloc(7u64);
        assert_eq!(*value, 7);
    }

    #[test]
    fn test_alloc_bytes_zeroed() {
        let arena = ScratchArena::new();
        let bytes = arena.alloc_bytes(64);
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
