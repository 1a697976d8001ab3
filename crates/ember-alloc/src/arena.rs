//! Arenas.
//!
//! An arena is one contiguous region of cache memory with buddy bookkeeping
//! on the side: a LIFO free list per size class, a free-block bitmap, and a
//! position table that lets coalescing pull a buddy out of the middle of
//! its list in O(1). All three live under a single mutex; the region bytes
//! themselves are never used for metadata.

use std::fmt;
use std::ptr::NonNull;

use ember_common::memory::AlignedBuffer;
use parking_lot::Mutex;

use crate::bitmap::ClassBitmap;
use crate::config::AllocatorConfig;
use crate::handle::BufferHandle;

/// Free-block bookkeeping for one arena. Guarded by the arena mutex.
struct FreeMap {
    /// Per-class free lists of block offsets, LIFO.
    lists: Box<[Vec<u32>]>,
    /// Per-class position of each free block within its list, indexed by
    /// `offset >> log2`. Valid only while the block's free bit is set.
    slots: Box<[Box<[u32]>]>,
    /// One free bit per block position per class.
    bits: ClassBitmap,
    min_log2: u32,
}

impl FreeMap {
    #[inline]
    fn log2_of(&self, class: usize) -> u32 {
        self.min_log2 + class as u32
    }

    #[inline]
    fn block_of(&self, class: usize, offset: u32) -> usize {
        (offset >> self.log2_of(class)) as usize
    }

    /// Pushes a block onto a class's free list.
    fn push(&mut self, class: usize, offset: u32) {
        let block = self.block_of(class, offset);
        debug_assert!(!self.bits.test(class, block));
        self.slots[class][block] = self.lists[class].len() as u32;
        self.lists[class].push(offset);
        self.bits.set(class, block);
    }

    /// Pops any block from a class's free list.
    fn pop(&mut self, class: usize) -> Option<u32> {
        let offset = self.lists[class].pop()?;
        let block = self.block_of(class, offset);
        self.bits.clear(class, block);
        Some(offset)
    }

    /// Removes a specific block from a class's free list in O(1) via the
    /// position table.
    fn remove(&mut self, class: usize, offset: u32) {
        let block = self.block_of(class, offset);
        debug_assert!(self.bits.test(class, block));
        let pos = self.slots[class][block] as usize;
        let last = self.lists[class].len() - 1;
        debug_assert_eq!(self.lists[class][pos], offset);
        self.lists[class].swap_remove(pos);
        if pos != last {
            let moved = self.lists[class][pos];
            let moved_block = self.block_of(class, moved);
            self.slots[class][moved_block] = pos as u32;
        }
        self.bits.clear(class, block);
    }

    /// Returns true if the block is free at this class.
    #[inline]
    fn is_free(&self, class: usize, offset: u32) -> bool {
        self.bits.test(class, self.block_of(class, offset))
    }

    /// Splits the smallest free block of a class above `class` down until
    /// `class` has a free block. Returns false when every larger class is
    /// empty too.
    fn split_to(&mut self, class: usize) -> bool {
        let mut source = None;
        for j in class + 1..self.lists.len() {
            if let Some(offset) = self.pop(j) {
                source = Some((j, offset));
                break;
            }
        }
        let Some((mut j, offset)) = source else {
            return false;
        };
        // Walk back down, leaving the upper buddy free at each level.
        while j > class {
            j -= 1;
            let buddy = offset + (1u32 << self.log2_of(j));
            self.push(j, buddy);
        }
        self.push(class, offset);
        true
    }
}

/// One contiguous cache memory region with buddy bookkeeping.
///
/// A fresh arena is the disjoint union of max-class free blocks; splitting
/// and coalescing never move bytes, only list and bitmap entries.
pub struct Arena {
    index: u32,
    min_log2: u32,
    max_log2: u32,
    region: AlignedBuffer,
    free: Mutex<FreeMap>,
}

impl Arena {
    /// Materializes an arena: allocates its region (aligned to the maximum
    /// block size) and seeds the top class's free list.
    pub(crate) fn new(index: u32, config: &AllocatorConfig) -> Self {
        let min_log2 = config.min_log2();
        let max_log2 = config.max_log2();
        let classes = config.classes();

        let lists: Box<[Vec<u32>]> = (0..classes).map(|_| Vec::new()).collect();
        let slots: Box<[Box<[u32]>]> = (0..classes)
            .map(|c| vec![0u32; config.arena_size >> (min_log2 + c as u32)].into_boxed_slice())
            .collect();
        let mut map = FreeMap {
            lists,
            slots,
            bits: ClassBitmap::new(config.arena_size, min_log2, max_log2),
            min_log2,
        };

        let top = classes - 1;
        let mut offset = 0usize;
        while offset < config.arena_size {
            map.push(top, offset as u32);
            offset += config.max_alloc;
        }

        Self {
            index,
            min_log2,
            max_log2,
            region: AlignedBuffer::new(config.arena_size, config.max_alloc),
            free: Mutex::new(map),
        }
    }

    /// Index of this arena within the allocator.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of the arena region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Returns true if the arena region is empty (never in practice).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Serves up to `out.len()` buffers of class `log2` from this arena.
    ///
    /// Pops free blocks, splitting larger ones as needed, and populates the
    /// handles in order. Returns how many buffers were produced; a short
    /// return means the arena ran out, which is not an error.
    pub(crate) fn allocate_into(&self, out: &mut [BufferHandle], log2: u32) -> usize {
        let class = (log2 - self.min_log2) as usize;
        let base = self.region.as_non_null();
        let mut produced = 0;

        let mut map = self.free.lock();
        while produced < out.len() {
            let offset = match map.pop(class) {
                Some(offset) => offset,
                None => {
                    if !map.split_to(class) {
                        break;
                    }
                    continue;
                }
            };
            // SAFETY: offset + (1 << log2) <= arena size, so the pointer
            // stays inside the region and is non-null.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };
            out[produced].populate(ptr, self.index, offset, log2 as u8);
            produced += 1;
        }
        produced
    }

    /// Returns a block to the arena, coalescing with its buddy as far up as
    /// the bitmap allows.
    ///
    /// # Panics
    ///
    /// Panics if the block is already free at its class, which means a
    /// corrupted handle or a buffer freed through two handles.
    pub(crate) fn deallocate(&self, offset: u32, log2: u32) {
        debug_assert_eq!(offset & ((1u32 << log2) - 1), 0, "misaligned block offset");

        let top = (self.max_log2 - self.min_log2) as usize;
        let mut class = (log2 - self.min_log2) as usize;
        let mut offset = offset;

        let mut map = self.free.lock();
        assert!(
            !map.is_free(class, offset),
            "block already free during deallocate: arena {} offset {} class {}",
            self.index,
            offset,
            log2,
        );
        while class < top {
            let buddy = offset ^ (1u32 << (self.min_log2 + class as u32));
            if !map.is_free(class, buddy) {
                break;
            }
            map.remove(class, buddy);
            offset = offset.min(buddy);
            class += 1;
        }
        map.push(class, offset);
    }

    /// Free-block count per size class, smallest class first.
    pub(crate) fn census(&self) -> Vec<(u32, usize)> {
        let map = self.free.lock();
        map.lists
            .iter()
            .enumerate()
            .map(|(c, list)| (self.min_log2 + c as u32, list.len()))
            .collect()
    }

    /// Total free bytes in this arena.
    pub fn free_bytes(&self) -> usize {
        let map = self.free.lock();
        map.lists
            .iter()
            .enumerate()
            .map(|(c, list)| list.len() << (self.min_log2 + c as u32))
            .sum()
    }

    /// Returns true if the arena is back in its initial state: nothing but
    /// max-class free blocks.
    pub fn is_fully_free(&self) -> bool {
        let map = self.free.lock();
        let top = map.lists.len() - 1;
        map.lists[top].len() == self.region.len() >> self.max_log2
            && map.lists[..top].iter().all(Vec::is_empty)
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("index", &self.index)
            .field("size", &self.region.len())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AllocatorConfig {
        AllocatorConfig::new()
            .with_min_alloc(8)
            .with_max_alloc(256)
            .with_arena_size(512)
            .with_max_total(1024)
    }

    fn blank_handles(n: usize) -> Vec<BufferHandle> {
        (0..n).map(|_| BufferHandle::blank()).collect()
    }

    #[test]
    fn test_initial_state() {
        let arena = Arena::new(0, &test_config());
        assert!(arena.is_fully_free());
        assert_eq!(arena.free_bytes(), 512);
        // Two top-class blocks, nothing else.
        assert_eq!(arena.census(), vec![(3, 0), (4, 0), (5, 0), (6, 0), (7, 0), (8, 2)]);
    }

    #[test]
    fn test_allocate_splits() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(1);

        assert_eq!(arena.allocate_into(&mut handles, 3), 1);
        assert!(handles[0].is_allocated());
        assert_eq!(handles[0].len(), 8);
        // One split per level from 256 down to 8 leaves one free buddy at
        // each class, plus the untouched second top block.
        assert_eq!(
            arena.census(),
            vec![(3, 1), (4, 1), (5, 1), (6, 1), (7, 1), (8, 1)]
        );
        assert_eq!(arena.free_bytes(), 512 - 8);

        arena.deallocate(handles[0].offset(), 3);
        assert!(arena.is_fully_free());
    }

    #[test]
    fn test_allocate_short_return() {
        let arena = Arena::new(0, &test_config());
        // 512 bytes hold exactly 2 max-class blocks.
        let mut handles = blank_handles(3);
        assert_eq!(arena.allocate_into(&mut handles, 8), 2);
        assert!(handles[0].is_allocated());
        assert!(handles[1].is_allocated());
        assert!(!handles[2].is_allocated());
    }

    #[test]
    fn test_fill_with_min_blocks() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(64);
        assert_eq!(arena.allocate_into(&mut handles, 3), 64);
        assert_eq!(arena.free_bytes(), 0);

        // Offsets are distinct and naturally aligned.
        let mut offsets: Vec<u32> = handles.iter().map(|h| h.offset()).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 64);
        assert!(offsets.iter().all(|o| o % 8 == 0));

        for handle in &handles {
            arena.deallocate(handle.offset(), 3);
        }
        assert!(arena.is_fully_free());
    }

    #[test]
    fn test_coalesce_out_of_order() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(8);
        assert_eq!(arena.allocate_into(&mut handles, 5), 8);

        // Free in a shuffled order; coalescing has to pull buddies out of
        // the middle of the class list.
        for &i in &[3usize, 0, 6, 1, 7, 2, 5, 4] {
            arena.deallocate(handles[i].offset(), 5);
        }
        assert!(arena.is_fully_free());
    }

    #[test]
    fn test_partial_coalesce() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(2);
        assert_eq!(arena.allocate_into(&mut handles, 3), 2);

        // The two blocks are buddies; freeing one must not coalesce.
        arena.deallocate(handles[0].offset(), 3);
        assert!(!arena.is_fully_free());

        arena.deallocate(handles[1].offset(), 3);
        assert!(arena.is_fully_free());
    }

    #[test]
    #[should_panic(expected = "block already free")]
    fn test_double_free_panics() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(2);
        arena.allocate_into(&mut handles, 4);

        // The buddy stays allocated so the first free cannot coalesce and
        // the block is still free at its own class on the second free.
        let offset = handles[0].offset();
        arena.deallocate(offset, 4);
        arena.deallocate(offset, 4);
    }

    #[test]
    fn test_buffer_bytes_are_writable() {
        let arena = Arena::new(0, &test_config());
        let mut handles = blank_handles(2);
        arena.allocate_into(&mut handles, 6);

        handles[0].as_mut_slice().fill(0xAA);
        handles[1].as_mut_slice().fill(0x55);

        assert!(handles[0].as_slice().iter().all(|&b| b == 0xAA));
        assert!(handles[1].as_slice().iter().all(|&b| b == 0x55));

        for handle in &handles {
            arena.deallocate(handle.offset(), 6);
        }
    }
}
