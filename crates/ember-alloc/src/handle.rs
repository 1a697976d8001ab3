//! Buffer handles.
//!
//! A [`BufferHandle`] is the descriptor the allocator hands to callers: a
//! raw byte view plus the identity the allocator needs to take the buffer
//! back in O(1). Handles start blank, are populated by
//! `BuddyAllocator::allocate_multiple`, and are consumed by value on
//! deallocation, so a populated handle cannot be freed twice without
//! `unsafe`.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

/// A descriptor for one allocated cache buffer.
///
/// The byte view stays valid until the handle is passed to
/// `BuddyAllocator::deallocate`; handles must not outlive the allocator
/// that populated them.
pub struct BufferHandle {
    /// Base of the allocated region; `None` while blank.
    ptr: Option<NonNull<u8>>,
    len: usize,
    /// Index of the owning arena.
    arena: u32,
    /// Byte offset inside the owning arena.
    offset: u32,
    /// Size class exponent; `len == 1 << log2`.
    log2: u8,
}

// SAFETY: a populated handle is the exclusive reference to its byte range;
// the allocator never hands out overlapping ranges.
unsafe impl Send for BufferHandle {}
unsafe impl Sync for BufferHandle {}

impl BufferHandle {
    /// Creates a blank handle for the allocator to populate.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            ptr: None,
            len: 0,
            arena: 0,
            offset: 0,
            log2: 0,
        }
    }

    /// Returns true once the handle references a live allocation.
    #[inline]
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.ptr.is_some()
    }

    /// Returns the usable length in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the handle holds no bytes (i.e. is blank).
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the arena that owns this buffer.
    #[inline]
    #[must_use]
    pub fn arena_index(&self) -> u32 {
        self.arena
    }

    /// Byte offset of this buffer inside its arena.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Size class exponent of this buffer.
    #[inline]
    #[must_use]
    pub fn size_class(&self) -> u8 {
        self.log2
    }

    /// Returns the buffer as a byte slice.
    ///
    /// # Panics
    ///
    /// Panics if the handle is blank.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.ptr.expect("buffer handle is not allocated");
        // SAFETY: ptr is valid for len bytes while the allocation is live
        unsafe { slice::from_raw_parts(ptr.as_ptr(), self.len) }
    }

    /// Returns the buffer as a mutable byte slice.
    ///
    /// # Panics
    ///
    /// Panics if the handle is blank.
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.ptr.expect("buffer handle is not allocated");
        // SAFETY: ptr is valid for len bytes and this handle is the only
        // reference to the range
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), self.len) }
    }

    /// Fills the buffer's identity. Called by the owning arena under its
    /// lock.
    pub(crate) fn populate(&mut self, ptr: NonNull<u8>, arena: u32, offset: u32, log2: u8) {
        self.ptr = Some(ptr);
        self.len = 1usize << log2;
        self.arena = arena;
        self.offset = offset;
        self.log2 = log2;
    }

    /// Resets the handle to blank. Used when rolling back a failed
    /// multi-buffer allocation.
    pub(crate) fn clear(&mut self) {
        self.ptr = None;
        self.len = 0;
        self.arena = 0;
        self.offset = 0;
        self.log2 = 0;
    }
}

impl std::ops::Deref for BufferHandle {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl std::ops::DerefMut for BufferHandle {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for BufferHandle {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for BufferHandle {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("allocated", &self.is_allocated())
            .field("len", &self.len)
            .field("arena", &self.arena)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Produces blank handles for the allocator to populate.
///
/// The cache layers its own buffer types on top of raw handles; the factory
/// seam lets them supply pre-wired instances without the allocator knowing
/// about them.
pub trait BufferFactory: Send + Sync {
    /// Creates one blank handle.
    fn create_blank(&self) -> BufferHandle;
}

/// The trivial factory: plain blank handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlankFactory;

impl BufferFactory for BlankFactory {
    fn create_blank(&self) -> BufferHandle {
        BufferHandle::blank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_handle() {
        let handle = BufferHandle::blank();
        assert!(!handle.is_allocated());
        assert!(handle.is_empty());
        assert_eq!(handle.len(), 0);
    }

    #[test]
    #[should_panic(expected = "buffer handle is not allocated")]
    fn test_blank_slice_panics() {
        let handle = BufferHandle::blank();
        let _ = handle.as_slice();
    }

    #[test]
    fn test_populate_and_clear() {
        let mut backing = [0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();

        let mut handle = BufferHandle::blank();
        handle.populate(ptr, 3, 128, 6);

        assert!(handle.is_allocated());
        assert_eq!(handle.len(), 64);
        assert_eq!(handle.arena_index(), 3);
        assert_eq!(handle.offset(), 128);
        assert_eq!(handle.size_class(), 6);

        handle.as_mut_slice()[0] = 0xAB;
        assert_eq!(handle[0], 0xAB);

        handle.clear();
        assert!(!handle.is_allocated());
    }

    #[test]
    fn test_blank_factory() {
        let factory = BlankFactory;
        assert!(!factory.create_blank().is_allocated());
    }
}
