//! Two-tier kernel heap.
//!
//! Tier one is a bump allocator over a statically-placed region: a cursor
//! that only moves forward, used during early bring-up and for memory that
//! lives forever (descriptor rings, DMA buffers, the slab carve-out itself).
//!
//! Tier two is a slab of size classes built on top of the bump tier at
//! `mem_init` time: nine classes doubling from 32 bytes to 8 KiB, each
//! owning a bounded FIFO of free chunks. Allocation scans the classes in
//! ascending order and takes the first chunk whose class fits; freeing
//! returns the chunk to the unique class whose bounds contain it. Both
//! operations are O(classes) worst case with no list walking, which keeps
//! allocation latency flat under interrupt load.
//!
//! Until the slab tier exists, everything transparently falls back to bump.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;

use crate::config::{ALLOC_MIN, ALLOC_NUM, ALLOC_STEPS, HEAP_SIZE};
use crate::sync::IrqMutex;

/// Chunks are handed out at this alignment; anything stricter bypasses the
/// slab and goes straight to the bump tier.
const CHUNK_ALIGN: usize = 8;

// ── Bump tier ───────────────────────────────────────────────────────────────

/// Forward-only allocator over `[base, base + size)`. Returns are aligned to
/// at least 4 bytes and are never reclaimed.
pub struct BumpRegion {
    base: AtomicUsize,
    size: AtomicUsize,
    cursor: AtomicUsize,
}

impl BumpRegion {
    pub const fn empty() -> Self {
        BumpRegion {
            base: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// # Safety
    ///
    /// `base..base + size` must be memory this region exclusively owns.
    pub unsafe fn init(&self, base: *mut u8, size: usize) {
        self.base.store(base as usize, Ordering::SeqCst);
        self.size.store(size, Ordering::SeqCst);
        self.cursor.store(0, Ordering::SeqCst);
    }

    pub fn initialized(&self) -> bool {
        self.base.load(Ordering::Relaxed) != 0
    }

    /// Advance the cursor by `size`, aligning the returned address to
    /// `align` (minimum 4). Null when the region is exhausted or not yet
    /// initialized.
    pub fn alloc(&self, size: usize, align: usize) -> *mut u8 {
        let base = self.base.load(Ordering::Relaxed);
        let limit = self.size.load(Ordering::Relaxed);
        if base == 0 || size == 0 {
            return core::ptr::null_mut();
        }

        let align = align.max(4);
        loop {
            let pos = self.cursor.load(Ordering::Relaxed);
            let aligned = (base + pos + align - 1) & !(align - 1);
            let new_pos = aligned - base + size;
            if new_pos > limit {
                return core::ptr::null_mut();
            }
            if self
                .cursor
                .compare_exchange(pos, new_pos, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return aligned as *mut u8;
            }
        }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

// ── Slab tier ───────────────────────────────────────────────────────────────

struct SizeClass {
    /// Chunk size for this class.
    size: usize,
    /// Bounds of the region the chunks were carved from, `[start, end)`.
    start: usize,
    end: usize,
    /// Fewest free chunks ever observed; exported through kstat.
    least_free: usize,
    /// Free chunk addresses. Most-recently-freed chunks sit at the front so
    /// they are reused first.
    chunks: crate::fifo::BoundedFifo<usize>,
}

pub struct SlabHeap {
    classes: Vec<SizeClass>,
}

impl SlabHeap {
    /// Carve `chunks_per_class` chunks for every size class out of the bump
    /// tier. Fails if the region runs out mid-carve.
    pub fn carve(bump: &BumpRegion, chunks_per_class: usize) -> Option<SlabHeap> {
        let mut classes = Vec::with_capacity(ALLOC_STEPS);

        for step in 0..ALLOC_STEPS {
            let size = ALLOC_MIN << step;
            let mut chunks = crate::fifo::BoundedFifo::with_capacity(chunks_per_class);
            let mut start = 0usize;
            let mut last = 0usize;

            for n in 0..chunks_per_class {
                let p = bump.alloc(size, CHUNK_ALIGN);
                if p.is_null() {
                    return None;
                }
                if n == 0 {
                    start = p as usize;
                }
                last = p as usize;
                // Capacity equals chunks_per_class, so this cannot fail.
                let _ = chunks.push(p as usize);
            }

            classes.push(SizeClass {
                size,
                start,
                end: last + size,
                least_free: chunks_per_class,
                chunks,
            });
        }

        Some(SlabHeap { classes })
    }

    /// First-fit over the size classes in ascending order. `None` when the
    /// request is zero, larger than the largest class, or every fitting
    /// class is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }

        for class in self.classes.iter_mut() {
            if class.size < size {
                continue;
            }

            if let Some(addr) = class.chunks.pop() {
                if class.chunks.len() < class.least_free {
                    class.least_free = class.chunks.len();
                }
                return Some(addr as *mut u8);
            }
        }

        None
    }

    /// Return `ptr` to the class whose bounds contain it. Pointers outside
    /// every class are ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let addr = ptr as usize;
        for class in self.classes.iter_mut() {
            if addr >= class.start && addr < class.end {
                let _ = class.chunks.push_front(addr);
                return;
            }
        }
    }

    pub fn contains(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        self.classes
            .iter()
            .any(|c| addr >= c.start && addr < c.end)
    }

    /// Per-class low-water marks, smallest class first.
    pub fn watermarks(&self) -> [u32; ALLOC_STEPS] {
        let mut w = [0u32; ALLOC_STEPS];
        for (i, class) in self.classes.iter().enumerate() {
            w[i] = class.least_free as u32;
        }
        w
    }
}

// ── Kernel heap globals ─────────────────────────────────────────────────────

#[repr(align(4096))]
struct AlignedHeap([u8; HEAP_SIZE]);

#[cfg(all(target_arch = "arm", not(test)))]
static mut HEAP: AlignedHeap = AlignedHeap([0; HEAP_SIZE]);

static BUMP: BumpRegion = BumpRegion::empty();
static SLAB: IrqMutex<Option<SlabHeap>> = IrqMutex::new(None);

/// Bring up both tiers. Must run before anything allocates; the slab
/// carve-out itself allocates through the bump tier, which is why the slab
/// is installed only once fully built.
#[cfg(all(target_arch = "arm", not(test)))]
pub fn mem_init() {
    unsafe {
        let base = core::ptr::addr_of_mut!(HEAP) as *mut u8;
        BUMP.init(base, HEAP_SIZE);
    }

    let heap = SlabHeap::carve(&BUMP, ALLOC_NUM);
    if heap.is_none() {
        crate::early_println!("mem_init: slab carve failed, bump tier only");
    }
    *SLAB.lock() = heap;
}

/// Allocate permanently from the bump tier (descriptor rings, DMA buffers).
pub fn early_alloc(size: usize) -> *mut u8 {
    BUMP.alloc(size, 4)
}

pub fn heap_used() -> usize {
    BUMP.used()
}

/// Slab low-water marks for kstat. All zeros before `mem_init`.
pub fn slab_watermarks() -> [u32; ALLOC_STEPS] {
    match SLAB.lock().as_ref() {
        Some(slab) => slab.watermarks(),
        None => [0; ALLOC_STEPS],
    }
}

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= CHUNK_ALIGN {
            if let Some(slab) = SLAB.lock().as_mut() {
                return match slab.alloc(layout.size()) {
                    Some(p) => p,
                    None => core::ptr::null_mut(),
                };
            }
        }
        // Slab not up yet, or over-aligned request.
        BUMP.alloc(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut slab = SLAB.lock();
        if let Some(slab) = slab.as_mut() {
            if slab.contains(ptr) {
                slab.free(ptr);
            }
            // Anything else came from the bump tier and stays allocated.
        }
    }
}

// The kernel heap backs every allocation in non-test builds; the test
// harness keeps the host allocator.
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
