//! # Block Memory Pool
//!
//! Fixed-size-class allocator backing task stacks and message buffers.
//!
//! ## Layout
//!
//! ```text
//! region:  | pad | hdr | payload (class 0) | hdr | payload (class 0) | ... | hdr | payload (class n) |
//!                  ▲
//!                  └─ BlockHeader { tag, class, allocated, size, len, link }
//! ```
//!
//! Every block carries its header in-band, immediately before the payload.
//! The header records the class the block was carved for, so `free` always
//! returns a block to its own class even when a larger class served a
//! smaller request. While a block is free, the header links it into its
//! class's free list; while it is allocated, the owner may use the same
//! links (the message queue threads its FIFO through them).
//!
//! `MemPool` itself is not synchronized. [`Kernel`](crate::Kernel) wraps every
//! call in a critical section.

use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::config::{MAX_POOL_CLASSES, MEM_CHECK_FLAG};
use crate::error::{Error, Result};
use crate::list::{Link, Links, ListHead};

/// Largest configurable block size.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// One size class of the pool layout passed to [`MemPool::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClass {
    /// Payload size of every block of the class. Must be a power of two.
    pub block_size: usize,
    /// Number of blocks carved at init.
    pub count: usize,
}

impl PoolClass {
    pub const fn new(block_size: usize, count: usize) -> Self {
        Self { block_size, count }
    }
}

/// Usage counters of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassStats {
    pub block_size: usize,
    pub total: usize,
    pub free: usize,
    /// High-water mark of simultaneously allocated blocks.
    pub max_used: usize,
}

impl ClassStats {
    #[inline]
    pub fn used(&self) -> usize {
        self.total - self.free
    }
}

#[repr(C)]
pub(crate) struct BlockHeader {
    tag: u32,
    class: u16,
    allocated: u16,
    size: u32,
    len: u32,
    link: Link<RawBlock>,
}

pub(crate) type RawBlock = NonNull<BlockHeader>;

const HEADER_LEN: usize = size_of::<BlockHeader>();
const BLOCK_ALIGN: usize = align_of::<BlockHeader>();

/// List accessor for block headers.
///
/// Only headers carved by a `MemPool` out of a `'static` region are ever
/// handed to a list, so dereferencing a node is always valid.
pub(crate) struct BlockLinks;

impl Links for BlockLinks {
    type Node = RawBlock;

    #[inline]
    fn link(&self, node: RawBlock) -> Link<RawBlock> {
        unsafe { (*node.as_ptr()).link }
    }

    #[inline]
    fn set_link(&mut self, node: RawBlock, link: Link<RawBlock>) {
        unsafe { (*node.as_ptr()).link = link };
    }
}

/// An allocated pool block. Ownership of the handle is ownership of the
/// memory; give it back with [`MemPool::free`] (or
/// [`Kernel::free`](crate::Kernel::free)).
#[must_use = "a dropped block is never returned to the pool"]
pub struct Block {
    header: RawBlock,
}

#[allow(clippy::len_without_is_empty)]
impl Block {
    /// The length requested at allocation.
    #[inline]
    pub fn len(&self) -> usize {
        unsafe { self.header.as_ref().len as usize }
    }

    /// Payload size of the class that served the request.
    #[inline]
    pub fn capacity(&self) -> usize {
        unsafe { self.header.as_ref().size as usize }
    }

    /// Start of the payload.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { (self.header.as_ptr() as *mut u8).add(HEADER_LEN) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.as_ptr(), self.len()) }
    }

    #[inline]
    pub(crate) fn into_raw(self) -> RawBlock {
        self.header
    }

    /// # Safety
    /// `raw` must come from [`Self::into_raw`] and not be owned elsewhere.
    #[inline]
    pub(crate) unsafe fn from_raw(raw: RawBlock) -> Self {
        Self { header: raw }
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.as_ptr())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[derive(Clone, Copy)]
struct SizeClass {
    block_size: usize,
    free_list: ListHead<RawBlock>,
    total: usize,
    free: usize,
    max_used: usize,
}

impl SizeClass {
    const EMPTY: Self = Self {
        block_size: 0,
        free_list: ListHead::new(),
        total: 0,
        free: 0,
        max_used: 0,
    };

    fn stats(&self) -> ClassStats {
        ClassStats {
            block_size: self.block_size,
            total: self.total,
            free: self.free,
            max_used: self.max_used,
        }
    }
}

/// The block pool.
pub struct MemPool {
    classes: [SizeClass; MAX_POOL_CLASSES],
    class_count: usize,
    initialized: bool,
}

// ---------------------------------------------------------------------------
// Layout helpers
// ---------------------------------------------------------------------------

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Bytes occupied by one block (header + payload) of the given size.
#[inline]
const fn stride(block_size: usize) -> usize {
    align_up(HEADER_LEN + block_size, BLOCK_ALIGN)
}

fn validate_layout(classes: &[PoolClass]) -> Result<()> {
    let first = classes.first().ok_or(Error::InvalidConfig)?;
    if classes.len() > MAX_POOL_CLASSES || first.count == 0 {
        return Err(Error::InvalidConfig);
    }
    if classes
        .iter()
        .any(|c| !c.block_size.is_power_of_two() || c.block_size > MAX_BLOCK_SIZE)
    {
        return Err(Error::InvalidConfig);
    }
    if classes.windows(2).any(|w| w[0].block_size >= w[1].block_size) {
        return Err(Error::InvalidConfig);
    }
    Ok(())
}

impl MemPool {
    pub const fn new() -> Self {
        Self {
            classes: [SizeClass::EMPTY; MAX_POOL_CLASSES],
            class_count: 0,
            initialized: false,
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of configured size classes.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Carve `region` into the blocks described by `classes`.
    ///
    /// Returns the number of region bytes consumed.
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`]: `classes` is empty, longer than
    ///   [`MAX_POOL_CLASSES`], not strictly ascending powers of two, or its
    ///   first class has no blocks.
    /// - [`Error::NoMem`]: `region` cannot hold every configured block.
    pub fn init(&mut self, region: &'static mut [u8], classes: &[PoolClass]) -> Result<usize> {
        validate_layout(classes)?;

        let base = region.as_mut_ptr() as usize;
        let pad = align_up(base, BLOCK_ALIGN) - base;
        let mut needed = pad;
        for class in classes {
            needed = stride(class.block_size)
                .checked_mul(class.count)
                .and_then(|bytes| bytes.checked_add(needed))
                .ok_or(Error::NoMem)?;
        }
        if needed > region.len() {
            return Err(Error::NoMem);
        }

        *self = Self::new();
        let mut cursor = base + pad;
        for (index, class) in classes.iter().enumerate() {
            self.classes[index].block_size = class.block_size;
            // SAFETY: `needed` bytes starting at `base + pad` lie within `region`.
            cursor = unsafe { self.carve(index, cursor, class.count) };
        }
        self.class_count = classes.len();
        self.initialized = true;

        log::debug!(
            "mem: pool at {:#x}, {} classes, {} of {} bytes used",
            base,
            classes.len(),
            needed,
            region.len()
        );
        Ok(needed)
    }

    /// Write `count` headers of class `index` starting at `start` and push
    /// them onto the free list. Returns the address past the last block.
    ///
    /// # Safety
    /// `start` is aligned to `BLOCK_ALIGN` and `count` blocks fit in
    /// `'static` memory owned by the pool.
    unsafe fn carve(&mut self, index: usize, start: usize, count: usize) -> usize {
        let class = &mut self.classes[index];
        let step = stride(class.block_size);
        let mut cursor = start;
        for _ in 0..count {
            let header = cursor as *mut BlockHeader;
            header.write(BlockHeader {
                tag: MEM_CHECK_FLAG,
                class: index as u16,
                allocated: 0,
                size: class.block_size as u32,
                len: 0,
                link: Link::UNLINKED,
            });
            class
                .free_list
                .push_back(&mut BlockLinks, NonNull::new_unchecked(header));
            cursor += step;
        }
        class.total += count;
        class.free += count;
        cursor
    }

    /// Allocate a block of at least `len` bytes.
    ///
    /// The request is rounded up to a power of two and served by the first
    /// class that large; when that class is exhausted the next larger ones
    /// are tried in order. Returns `None` for `len == 0`, before `init`, or
    /// when no class large enough has a free block.
    pub fn malloc(&mut self, len: usize) -> Option<Block> {
        if len == 0 || !self.initialized {
            return None;
        }
        let want = len.checked_next_power_of_two()?;
        let classes = &mut self.classes[..self.class_count];
        let first = classes.iter().position(|c| c.block_size >= want)?;

        for class in &mut classes[first..] {
            if let Some(raw) = class.free_list.pop_front(&mut BlockLinks) {
                class.free -= 1;
                class.max_used = class.max_used.max(class.total - class.free);
                // SAFETY: free-list nodes are headers carved by `carve`.
                unsafe {
                    let header = &mut *raw.as_ptr();
                    header.allocated = 1;
                    header.len = len as u32;
                }
                return Some(Block { header: raw });
            }
        }
        None
    }

    /// Return `block` to the free list of the class it was carved for.
    ///
    /// # Panics
    /// If the block header is corrupted or the block is not allocated.
    pub fn free(&mut self, block: Block) {
        let raw = block.into_raw();
        // SAFETY: a `Block` always points at a header carved by a pool.
        let class = unsafe {
            let header = &mut *raw.as_ptr();
            assert!(
                header.tag == MEM_CHECK_FLAG,
                "mem: corrupted block header at {:p} (tag {:#x})",
                raw,
                header.tag
            );
            assert!(header.allocated != 0, "mem: double free of block at {:p}", raw);
            header.allocated = 0;
            header.len = 0;
            usize::from(header.class)
        };
        assert!(
            class < self.class_count,
            "mem: block at {:p} belongs to unknown class {}",
            raw,
            class
        );

        let class = &mut self.classes[class];
        class.free_list.push_back(&mut BlockLinks, raw);
        class.free += 1;
    }

    /// Carve extra `'static` memory into blocks of the configured class
    /// `block_size`. Returns the number of blocks added.
    ///
    /// # Errors
    /// - [`Error::NotInit`]: the pool is not initialized.
    /// - [`Error::InvalidParam`]: no class has this block size, or the
    ///   region cannot hold a single block.
    pub fn add_pool(&mut self, region: &'static mut [u8], block_size: usize) -> Result<usize> {
        if !self.initialized {
            return Err(Error::NotInit);
        }
        let index = self.classes[..self.class_count]
            .iter()
            .position(|c| c.block_size == block_size)
            .ok_or(Error::InvalidParam)?;

        let base = region.as_mut_ptr() as usize;
        let pad = align_up(base, BLOCK_ALIGN) - base;
        let count = region.len().saturating_sub(pad) / stride(block_size);
        if count == 0 {
            return Err(Error::InvalidParam);
        }

        // SAFETY: `count` strides fit in `region` after the alignment pad.
        unsafe { self.carve(index, base + pad, count) };
        log::debug!("mem: added {} blocks of {} bytes", count, block_size);
        Ok(count)
    }

    /// Forget every size class. Outstanding blocks must not be freed
    /// afterwards.
    pub fn destroy(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInit);
        }
        *self = Self::new();
        Ok(())
    }

    pub fn stats(&self, class: usize) -> Option<ClassStats> {
        self.classes[..self.class_count].get(class).map(SizeClass::stats)
    }

    /// Log the counters of every class.
    pub fn report(&self, prompt: &str) {
        log::info!("{}: {} size classes", prompt, self.class_count);
        for class in &self.classes[..self.class_count] {
            let stats = class.stats();
            log::info!(
                "  {:>8} B: total {:>4}, used {:>4}, max used {:>4}",
                stats.block_size,
                stats.total,
                stats.used(),
                stats.max_used
            );
        }
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn region(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn pool(classes: &[PoolClass]) -> MemPool {
        let len: usize = classes.iter().map(|c| stride(c.block_size) * c.count).sum();
        let mut pool = MemPool::new();
        pool.init(region(len + BLOCK_ALIGN), classes).unwrap();
        pool
    }

    #[test]
    fn test_init_rejects_bad_layouts() {
        let bad: [&[PoolClass]; 5] = [
            &[],
            &[PoolClass::new(24, 4)],
            &[PoolClass::new(64, 4), PoolClass::new(32, 4)],
            &[PoolClass::new(32, 4), PoolClass::new(32, 4)],
            &[PoolClass::new(32, 0), PoolClass::new(64, 4)],
        ];
        for classes in bad {
            let mut pool = MemPool::new();
            assert_eq!(pool.init(region(4096), classes), Err(Error::InvalidConfig));
            assert!(!pool.is_initialized());
        }
    }

    #[test]
    fn test_init_too_small_region() {
        let mut pool = MemPool::new();
        let classes = [PoolClass::new(64, 4)];
        assert_eq!(pool.init(region(64 * 4), &classes), Err(Error::NoMem));
    }

    #[test]
    fn test_init_reports_bytes_used_and_allows_gaps() {
        let classes = [PoolClass::new(16, 2), PoolClass::new(256, 1)];
        let mut pool = MemPool::new();
        let used = pool.init(region(4096), &classes).unwrap();
        let blocks = 2 * stride(16) + stride(256);
        assert!(used >= blocks && used < blocks + BLOCK_ALIGN);
        assert_eq!(pool.class_count(), 2);
        assert_eq!(pool.stats(1).unwrap().total, 1);
        assert_eq!(pool.stats(2), None);
    }

    #[test]
    fn test_malloc_rounds_and_escalates() {
        let mut pool = pool(&[
            PoolClass::new(16, 1),
            PoolClass::new(32, 1),
            PoolClass::new(128, 1),
        ]);
        assert!(pool.malloc(0).is_none());
        assert!(pool.malloc(129).is_none());

        let a = pool.malloc(10).unwrap();
        assert_eq!((a.len(), a.capacity()), (10, 16));
        let b = pool.malloc(10).unwrap();
        assert_eq!(b.capacity(), 32);
        let c = pool.malloc(17).unwrap();
        assert_eq!(c.capacity(), 128);
        assert!(pool.malloc(1).is_none());

        pool.free(a);
        pool.free(b);
        pool.free(c);
    }

    #[test]
    fn test_free_returns_block_to_its_own_class() {
        let mut pool = pool(&[PoolClass::new(16, 1), PoolClass::new(32, 1)]);
        let small = pool.malloc(8).unwrap();
        let borrowed = pool.malloc(8).unwrap();
        assert_eq!(borrowed.capacity(), 32);
        assert_eq!(pool.stats(1).unwrap().used(), 1);

        pool.free(borrowed);
        assert_eq!(pool.stats(0).unwrap().free, 0);
        assert_eq!(pool.stats(1).unwrap().free, 1);
        assert_eq!(pool.stats(1).unwrap().max_used, 1);

        pool.free(small);
        assert_eq!(pool.stats(0).unwrap().free, 1);
    }

    #[test]
    fn test_payload_is_writable_and_disjoint() {
        let mut pool = pool(&[PoolClass::new(32, 2)]);
        let mut a = pool.malloc(32).unwrap();
        let mut b = pool.malloc(32).unwrap();
        a.as_bytes_mut().fill(0xaa);
        b.as_bytes_mut().fill(0x55);
        assert!(a.as_bytes().iter().all(|&x| x == 0xaa));
        assert!(b.as_bytes().iter().all(|&x| x == 0x55));
        assert_eq!(a.as_ptr() as usize % BLOCK_ALIGN, 0);
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_max_used_tracks_high_water() {
        let mut pool = pool(&[PoolClass::new(64, 4)]);
        let blocks: Vec<_> = (0..3).map(|_| pool.malloc(64).unwrap()).collect();
        for block in blocks {
            pool.free(block);
        }
        let one = pool.malloc(1).unwrap();
        let stats = pool.stats(0).unwrap();
        assert_eq!((stats.used(), stats.max_used), (1, 3));
        pool.free(one);
    }

    #[test]
    fn test_add_pool_grows_class() {
        let mut pool = pool(&[PoolClass::new(16, 1), PoolClass::new(32, 0)]);
        assert!(pool.malloc(32).is_none());

        let extra = region(3 * stride(32) + BLOCK_ALIGN - 1);
        assert_eq!(pool.add_pool(extra, 32), Ok(3));
        let stats = pool.stats(1).unwrap();
        assert_eq!((stats.total, stats.free), (3, 3));

        let block = pool.malloc(20).unwrap();
        assert_eq!(block.capacity(), 32);
        assert_eq!(pool.stats(1).unwrap().free, 2);
        pool.free(block);
        assert_eq!(pool.stats(1).unwrap().free, 3);
    }

    #[test]
    fn test_add_pool_errors() {
        let mut uninit = MemPool::new();
        assert_eq!(uninit.add_pool(region(1024), 32), Err(Error::NotInit));

        let mut pool = pool(&[PoolClass::new(32, 1)]);
        assert_eq!(pool.add_pool(region(1024), 64), Err(Error::InvalidParam));
        assert_eq!(pool.add_pool(region(8), 32), Err(Error::InvalidParam));
    }

    #[test]
    fn test_destroy() {
        let mut pool = pool(&[PoolClass::new(32, 1)]);
        assert_eq!(pool.destroy(), Ok(()));
        assert!(pool.malloc(1).is_none());
        assert_eq!(pool.destroy(), Err(Error::NotInit));
    }

    #[test]
    #[should_panic(expected = "corrupted block header")]
    fn test_corrupted_tag_is_fatal() {
        let mut pool = pool(&[PoolClass::new(32, 1)]);
        let block = pool.malloc(4).unwrap();
        unsafe { (*block.header.as_ptr()).tag = 0 };
        pool.free(block);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let mut pool = pool(&[PoolClass::new(32, 1)]);
        let block = pool.malloc(4).unwrap();
        let raw = block.into_raw();
        pool.free(unsafe { Block::from_raw(raw) });
        pool.free(unsafe { Block::from_raw(raw) });
    }

    /// For any `len` up to the largest class, the block is large enough.
    #[quickcheck]
    fn qc_malloc_never_smaller_than_requested(len: u16) -> bool {
        let mut pool = pool(&[
            PoolClass::new(32, 1),
            PoolClass::new(512, 1),
            PoolClass::new(4096, 1),
        ]);
        let len = usize::from(len) % 4096 + 1;
        let block = pool.malloc(len).unwrap();
        let ok = block.len() == len && block.capacity() >= len;
        pool.free(block);
        ok
    }

    /// Allocating and freeing any batch leaves every class as it was.
    #[quickcheck]
    fn qc_malloc_free_round_trip(lens: Vec<u8>) -> bool {
        let mut pool = pool(&[PoolClass::new(16, 4), PoolClass::new(64, 4), PoolClass::new(256, 4)]);
        let before: Vec<_> = (0..3).map(|i| pool.stats(i).unwrap().free).collect();

        let blocks: Vec<_> = lens
            .iter()
            .filter_map(|&len| pool.malloc(usize::from(len)))
            .collect();
        for block in blocks {
            pool.free(block);
        }

        (0..3).all(|i| pool.stats(i).unwrap().free == before[i])
    }
}
