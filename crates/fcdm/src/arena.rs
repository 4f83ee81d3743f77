//! Shared memory arena for decrypted output.
//!
//! The worker owns a fixed-size memfd mapped read-write ([`Arena`]); the host
//! maps the same descriptor read-only ([`ArenaView`]). Both mappings start at
//! file offset 0 and are exactly `capacity` bytes long, so an offset into one
//! is valid in the other. Allocation is a bump pointer that is rewound at the
//! start of every output-producing call.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use fcdm_protocol::BufferRef;
use memmap2::{Mmap, MmapMut, MmapOptions};
use rustix::fs::MemfdFlags;
use thiserror::Error;

use crate::cdm::Buffer;
use crate::error::fatal;

/// Alignment of every allocation.
pub const ALIGNMENT: u32 = 8;

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("arena exhausted: {requested} bytes requested at offset {offset} of {capacity}")]
    OutOfMemory {
        requested: u32,
        offset: u32,
        capacity: u32,
    },

    #[error("address is outside the arena")]
    OutOfBounds,

    #[error("range {offset}+{size} exceeds arena capacity {capacity}")]
    RangeOutOfBounds {
        offset: u32,
        size: u32,
        capacity: u32,
    },

    #[error("destination holds {available} bytes, {needed} needed")]
    ShortBuffer { needed: u32, available: usize },

    #[error("arena capacity {0} must be a non-zero multiple of {ALIGNMENT}")]
    InvalidCapacity(u32),

    #[error("arena backing failed: {0}")]
    Io(#[from] io::Error),
}

/// A bounds-checked region of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlice {
    pub offset: u32,
    pub len: u32,
}

impl ArenaSlice {
    pub fn end(self) -> u32 {
        self.offset + self.len
    }
}

impl From<ArenaSlice> for BufferRef {
    fn from(slice: ArenaSlice) -> Self {
        BufferRef {
            offset: slice.offset,
            size: slice.len,
        }
    }
}

fn check_capacity(capacity: u32) -> Result<(), ArenaError> {
    if capacity == 0 || capacity % ALIGNMENT != 0 {
        return Err(ArenaError::InvalidCapacity(capacity));
    }
    Ok(())
}

fn check_range(range: BufferRef, capacity: u32) -> Result<(), ArenaError> {
    match range.end() {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(ArenaError::RangeOutOfBounds {
            offset: range.offset,
            size: range.size,
            capacity,
        }),
    }
}

/// Writable side of the arena, owned by the worker.
pub struct Arena {
    // Kept alive for `base`; never accessed through a reference.
    _map: MmapMut,
    memfd: Option<File>,
    base: NonNull<u8>,
    capacity: u32,
    cursor: AtomicU32,
}

// All access goes through `base` with explicit bounds checks, and callers
// serialize writers per call.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena backed by a fresh memfd that can be passed to a peer.
    pub fn create_shared(capacity: u32) -> Result<Self, ArenaError> {
        check_capacity(capacity)?;
        let fd = rustix::fs::memfd_create("fcdm-arena", MemfdFlags::CLOEXEC)
            .map_err(io::Error::from)?;
        rustix::fs::ftruncate(&fd, u64::from(capacity)).map_err(io::Error::from)?;
        let file = File::from(fd);
        let map = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };
        Ok(Self::from_map(map, Some(file), capacity))
    }

    /// Creates a process-private arena.
    pub fn anonymous(capacity: u32) -> Result<Self, ArenaError> {
        check_capacity(capacity)?;
        let map = MmapMut::map_anon(capacity as usize)?;
        Ok(Self::from_map(map, None, capacity))
    }

    fn from_map(mut map: MmapMut, memfd: Option<File>, capacity: u32) -> Self {
        let base = NonNull::new(map.as_mut_ptr())
            .unwrap_or_else(|| fatal("mmap returned a null mapping"));
        Self {
            _map: map,
            memfd,
            base,
            capacity,
            cursor: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes handed out since the last reset, including alignment padding.
    pub fn used(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    /// The backing memfd, if this arena is shareable.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.memfd.as_ref().map(|file| file.as_fd())
    }

    /// Bump-allocates `n` bytes. The returned offset is 8-byte aligned.
    pub fn allocate(&self, n: u32) -> Result<ArenaSlice, ArenaError> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let end = current
                .checked_add(n)
                .filter(|end| *end <= self.capacity)
                .ok_or(ArenaError::OutOfMemory {
                    requested: n,
                    offset: current,
                    capacity: self.capacity,
                })?;
            let next = end
                .checked_next_multiple_of(ALIGNMENT)
                .unwrap_or(self.capacity)
                .min(self.capacity);
            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(ArenaSlice {
                        offset: current,
                        len: n,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Rewinds the bump pointer. Every previously returned slice is dead.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Local address of `slice`.
    pub fn ptr(&self, slice: ArenaSlice) -> NonNull<u8> {
        if slice.offset > self.capacity {
            fatal(format!("arena slice {slice:?} out of range"));
        }
        // In bounds: offset <= capacity.
        unsafe { self.base.add(slice.offset as usize) }
    }

    /// Converts a local address into an arena offset.
    pub fn offset_of(&self, addr: *const u8) -> Result<u32, ArenaError> {
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + self.capacity as usize {
            return Err(ArenaError::OutOfBounds);
        }
        Ok((addr - base) as u32)
    }

    /// Locates a vendor-reported buffer of `size` bytes starting at `addr`.
    ///
    /// An empty buffer may sit at the very end of a full arena.
    pub fn locate(&self, addr: *const u8, size: u32) -> Result<BufferRef, ArenaError> {
        let end = self.base.as_ptr() as usize + self.capacity as usize;
        let offset = match self.offset_of(addr) {
            Ok(offset) => offset,
            Err(_) if size == 0 && addr as usize == end => self.capacity,
            Err(e) => return Err(e),
        };
        let range = BufferRef { offset, size };
        check_range(range, self.capacity)?;
        Ok(range)
    }
}

/// A vendor-visible buffer carved out of the arena. Starts out with its size
/// equal to its capacity.
///
/// Dropping it returns nothing to the arena; space is reclaimed only by
/// [`Arena::reset`].
pub struct ArenaBuffer {
    arena: Arc<Arena>,
    slice: ArenaSlice,
    size: u32,
}

impl ArenaBuffer {
    pub fn allocate(arena: &Arc<Arena>, capacity: u32) -> Result<Self, ArenaError> {
        let slice = arena.allocate(capacity)?;
        Ok(Self {
            arena: Arc::clone(arena),
            slice,
            size: capacity,
        })
    }

    pub fn slice(&self) -> ArenaSlice {
        self.slice
    }
}

impl Buffer for ArenaBuffer {
    fn capacity(&self) -> u32 {
        self.slice.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.arena.ptr(self.slice).as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.arena.ptr(self.slice).as_ptr()
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn set_size(&mut self, size: u32) {
        if size > self.slice.len {
            fatal(format!(
                "buffer size {size} exceeds capacity {}",
                self.slice.len
            ));
        }
        self.size = size;
    }
}

/// Read-only host mapping of a worker's arena.
pub struct ArenaView {
    map: Mmap,
    capacity: u32,
}

impl ArenaView {
    /// Maps `capacity` bytes of the received memfd. The descriptor is closed
    /// once the mapping exists.
    pub fn map(fd: OwnedFd, capacity: u32) -> Result<Self, ArenaError> {
        check_capacity(capacity)?;
        let file = File::from(fd);
        let map = unsafe { MmapOptions::new().len(capacity as usize).map(&file)? };
        Ok(Self { map, capacity })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn check(&self, range: BufferRef) -> Result<(), ArenaError> {
        check_range(range, self.capacity)
    }

    /// Copies `range` into the front of `dst`.
    ///
    /// The worker writes through its own mapping, so the bytes are only
    /// stable between the reply of the call that produced `range` and the
    /// next output-producing call, which rewinds the arena.
    pub fn copy_to(&self, range: BufferRef, dst: &mut [u8]) -> Result<(), ArenaError> {
        self.check(range)?;
        let len = range.size as usize;
        if dst.len() < len {
            return Err(ArenaError::ShortBuffer {
                needed: range.size,
                available: dst.len(),
            });
        }
        let start = range.offset as usize;
        dst[..len].copy_from_slice(&self.map[start..start + len]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CAPACITY: u32 = 4096;

    #[test]
    fn test_allocations_are_aligned() {
        let arena = Arena::anonymous(CAPACITY).unwrap();
        let a = arena.allocate(3).unwrap();
        let b = arena.allocate(10).unwrap();
        let c = arena.allocate(1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 8);
        assert_eq!(c.offset, 24);
    }

    #[test]
    fn test_exhaustion_is_rejected() {
        let arena = Arena::anonymous(64).unwrap();
        arena.allocate(60).unwrap();
        let err = arena.allocate(8).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::OutOfMemory {
                requested: 8,
                offset: 64,
                capacity: 64
            }
        ));
        // A failed request leaves the cursor alone.
        assert_eq!(arena.used(), 64);
    }

    #[test]
    fn test_last_byte_allocation() {
        let arena = Arena::anonymous(64).unwrap();
        let slice = arena.allocate(64).unwrap();
        assert_eq!(slice.end(), 64);
        assert!(arena.allocate(1).is_err());
        assert_eq!(arena.allocate(0).unwrap().offset, 64);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            Arena::anonymous(0),
            Err(ArenaError::InvalidCapacity(0))
        ));
        assert!(matches!(
            Arena::anonymous(100),
            Err(ArenaError::InvalidCapacity(100))
        ));
    }

    #[test]
    fn test_offset_of_bounds() {
        let arena = Arena::anonymous(CAPACITY).unwrap();
        let slice = arena.allocate(16).unwrap();
        let ptr = arena.ptr(slice).as_ptr();
        assert_eq!(arena.offset_of(ptr).unwrap(), slice.offset);

        let outside = [0u8; 4];
        assert!(matches!(
            arena.offset_of(outside.as_ptr()),
            Err(ArenaError::OutOfBounds)
        ));
        let end = unsafe { ptr.add(CAPACITY as usize) };
        assert!(matches!(arena.offset_of(end), Err(ArenaError::OutOfBounds)));
    }

    #[test]
    fn test_locate_rejects_overrun() {
        let arena = Arena::anonymous(CAPACITY).unwrap();
        let slice = arena.allocate(16).unwrap();
        let ptr = arena.ptr(slice).as_ptr();
        assert_eq!(
            arena.locate(ptr, 16).unwrap(),
            BufferRef {
                offset: 0,
                size: 16
            }
        );
        assert!(arena.locate(ptr, CAPACITY + 1).is_err());
    }

    #[test]
    fn test_buffer_writes_are_visible_through_view() {
        let arena = Arc::new(Arena::create_shared(CAPACITY).unwrap());
        let fd = arena.fd().unwrap().try_clone_to_owned().unwrap();
        let view = ArenaView::map(fd, CAPACITY).unwrap();

        arena.allocate(5).unwrap();
        let mut buffer = ArenaBuffer::allocate(&arena, 16).unwrap();
        let dst = unsafe { std::slice::from_raw_parts_mut(buffer.as_mut_ptr(), 16) };
        dst.copy_from_slice(b"0123456789abcdef");
        buffer.set_size(16);

        let range = arena.locate(buffer.as_ptr(), buffer.size()).unwrap();
        assert_eq!(range.offset, 8);
        let mut out = [0u8; 20];
        view.copy_to(range, &mut out).unwrap();
        assert_eq!(&out[..16], b"0123456789abcdef");
    }

    #[test]
    fn test_view_copy_is_bounds_checked() {
        let arena = Arena::create_shared(CAPACITY).unwrap();
        let fd = arena.fd().unwrap().try_clone_to_owned().unwrap();
        let view = ArenaView::map(fd, CAPACITY).unwrap();
        let mut out = [0u8; 8];
        let overrun = BufferRef {
            offset: CAPACITY - 4,
            size: 8,
        };
        assert!(matches!(
            view.copy_to(overrun, &mut out),
            Err(ArenaError::RangeOutOfBounds { .. })
        ));
        let wrapped = BufferRef {
            offset: u32::MAX,
            size: 2,
        };
        assert!(view.copy_to(wrapped, &mut out).is_err());
        let short = BufferRef {
            offset: 0,
            size: 16,
        };
        assert!(matches!(
            view.copy_to(short, &mut out),
            Err(ArenaError::ShortBuffer {
                needed: 16,
                available: 8
            })
        ));
    }

    #[test]
    fn test_empty_buffer_at_end_of_full_arena() {
        let arena = Arc::new(Arena::anonymous(64).unwrap());
        arena.allocate(64).unwrap();
        let buffer = ArenaBuffer::allocate(&arena, 0).unwrap();
        assert_eq!(
            arena.locate(buffer.as_ptr(), 0).unwrap(),
            BufferRef {
                offset: 64,
                size: 0
            }
        );
        // Only an empty buffer may start there.
        assert!(arena.locate(buffer.as_ptr(), 1).is_err());
    }

    #[test]
    #[should_panic(expected = "exceeds capacity")]
    fn test_set_size_beyond_capacity() {
        let arena = Arc::new(Arena::anonymous(CAPACITY).unwrap());
        let mut buffer = ArenaBuffer::allocate(&arena, 8).unwrap();
        buffer.set_size(9);
    }

    proptest! {
        #[test]
        fn prop_offsets_stay_in_bounds(sizes in prop::collection::vec(0u32..512, 0..64)) {
            let arena = Arena::anonymous(CAPACITY).unwrap();
            for size in sizes {
                match arena.allocate(size) {
                    Ok(slice) => {
                        prop_assert_eq!(slice.offset % ALIGNMENT, 0);
                        prop_assert!(slice.end() <= CAPACITY);
                    }
                    Err(ArenaError::OutOfMemory { offset, .. }) => {
                        prop_assert!(offset + size > CAPACITY);
                    }
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
            }
        }

        #[test]
        fn prop_reset_reproduces_offsets(sizes in prop::collection::vec(0u32..256, 0..32)) {
            let arena = Arena::anonymous(CAPACITY).unwrap();
            let first: Vec<_> = sizes.iter().map(|n| arena.allocate(*n).ok()).collect();
            arena.reset();
            let second: Vec<_> = sizes.iter().map(|n| arena.allocate(*n).ok()).collect();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_allocations_never_overlap(sizes in prop::collection::vec(1u32..300, 1..40)) {
            let arena = Arena::anonymous(CAPACITY).unwrap();
            let slices: Vec<_> = sizes.iter().filter_map(|n| arena.allocate(*n).ok()).collect();
            for pair in slices.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].offset);
            }
        }
    }
}
