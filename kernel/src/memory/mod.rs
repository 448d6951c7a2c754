//! Physical memory manager
//!
//! Zone discovery over the loader's memory map, with a chain of buddy
//! allocators per zone. All bookkeeping lives inside the managed memory
//! itself, addressed through the higher-half direct map: each usable region
//! gets a `MemoryZone` header at its base, followed by `BuddyAllocatorNode`
//! headers in front of the pools they manage. No external bitmaps, no heap.
//!
//! Interrupt handlers must not call into the PMM (they panic and never
//! allocate), so a single lock around the zone list is all the
//! synchronization this needs.

pub mod buddy;

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};

use heapless::String;
use spin::Mutex;

use crate::bootinfo::{MemoryRegion, RegionKind};
use crate::logger::{self, LogLevel, KERNEL_DEBUG_LOGGER};

pub use buddy::{order_for, BuddyAllocator, MAX_ORDER};

/// Base allocation granule.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Largest pool a single chained allocator manages.
const MAX_POOL_SIZE: usize = PAGE_SIZE << MAX_ORDER;

/// Round `addr` up to a multiple of `align` (a power of two).
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Intrusive chain link holding one buddy allocator of a zone.
#[repr(C)]
pub struct BuddyAllocatorNode {
    allocator: BuddyAllocator,
    next: *mut BuddyAllocatorNode,
}

/// A contiguous usable-memory region, addressed via HHDM.
#[repr(C)]
pub struct MemoryZone {
    start: usize,
    size: usize,
    allocators: *mut BuddyAllocatorNode,
    next: *mut MemoryZone,
}

/// Head of the global zone list. The pointers reference HHDM memory carved
/// out during `pmm_initialize`; they are only dereferenced under this lock.
struct ZoneList {
    head: *mut MemoryZone,
}

unsafe impl Send for ZoneList {}

static ZONES: Mutex<ZoneList> = Mutex::new(ZoneList {
    head: core::ptr::null_mut(),
});

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static TOTAL_MEMORY: AtomicU64 = AtomicU64::new(0);
static USABLE_MEMORY: AtomicU64 = AtomicU64::new(0);
static KERNEL_PHYS_BASE: AtomicU64 = AtomicU64::new(0);
static KERNEL_FOOTPRINT: AtomicU64 = AtomicU64::new(0);

/// The higher-half direct map offset reported by the loader.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Translate a physical address into its HHDM virtual alias.
pub fn phys_to_virt(phys: u64) -> usize {
    (phys + hhdm_offset()) as usize
}

pub fn pmm_total_memory() -> u64 {
    TOTAL_MEMORY.load(Ordering::Relaxed)
}

pub fn pmm_usable_memory() -> u64 {
    USABLE_MEMORY.load(Ordering::Relaxed)
}

/// Physical base and byte length of the kernel-and-modules region.
pub fn kernel_footprint() -> (u64, u64) {
    (
        KERNEL_PHYS_BASE.load(Ordering::Relaxed),
        KERNEL_FOOTPRINT.load(Ordering::Relaxed),
    )
}

/// Format a byte count the way the boot log reports sizes.
pub fn format_memory_size(size: u64) -> String<80> {
    use core::fmt::Write;
    let mut out = String::new();
    let kib = size / 1024;
    let mib = kib / 1024;
    let gib = mib / 1024;

    if gib > 0 {
        write!(out, "{} bytes ({} GiB + {} MiB)", size, gib, mib % 1024).ok();
    } else if mib > 0 {
        write!(out, "{} bytes ({} MiB + {} KiB)", size, mib, kib % 1024).ok();
    } else {
        write!(out, "{} bytes ({} KiB)", size, kib).ok();
    }
    out
}

/// Largest power-of-two chunk (capped at `MAX_POOL_SIZE`) that fits in
/// `available` bytes; 0 when not even a page fits.
fn chunk_size(available: usize) -> usize {
    if available < PAGE_SIZE {
        return 0;
    }
    let mut chunk = MAX_POOL_SIZE;
    while chunk > available {
        chunk >>= 1;
    }
    chunk
}

/// Construct a zone in place at `vaddr`, carving the region into a chain of
/// buddy allocators. Each node reserves a header page in front of its pool,
/// keeping the pool page-aligned. Returns null when the region is too small
/// to hold any pool.
unsafe fn build_zone(vaddr: usize, length: usize) -> *mut MemoryZone {
    if length < size_of::<MemoryZone>() {
        return core::ptr::null_mut();
    }
    let zone = vaddr as *mut MemoryZone;
    (*zone) = MemoryZone {
        start: vaddr,
        size: length,
        allocators: core::ptr::null_mut(),
        next: core::ptr::null_mut(),
    };

    let end = vaddr + length;
    let mut cursor = align_up(vaddr + size_of::<MemoryZone>(), PAGE_SIZE);
    let mut tail: *mut BuddyAllocatorNode = core::ptr::null_mut();

    while end.saturating_sub(cursor) >= 2 * PAGE_SIZE {
        let node = cursor as *mut BuddyAllocatorNode;
        let pool_start = cursor + PAGE_SIZE;
        let chunk = chunk_size(end - pool_start);
        if chunk == 0 {
            break;
        }

        (*node).allocator = BuddyAllocator::initialize(pool_start, chunk);
        (*node).next = core::ptr::null_mut();
        if tail.is_null() {
            (*zone).allocators = node;
        } else {
            (*tail).next = node;
        }
        tail = node;
        cursor = pool_start + chunk;
    }

    if (*zone).allocators.is_null() {
        core::ptr::null_mut()
    } else {
        zone
    }
}

/// Read the memory map and build the allocator chains for every usable
/// region.
///
/// # Safety
///
/// `hhdm_offset` must map all of physical memory described by `regions`, and
/// the usable regions must be unused by anything else from this point on.
/// Must be called once, before the first `pmm_alloc`.
pub unsafe fn pmm_initialize(regions: &[MemoryRegion], hhdm_offset: u64) {
    HHDM_OFFSET.store(hhdm_offset, Ordering::SeqCst);

    let mut total = 0u64;
    let mut usable = 0u64;

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Info,
        "pmm",
        format_args!("reading memory map: {} entries", regions.len()),
    );

    for region in regions {
        logger::log_message(
            &KERNEL_DEBUG_LOGGER,
            LogLevel::Debug,
            "pmm",
            format_args!(
                "{{base={:#018x}, length={}, type={}}}",
                region.base,
                format_memory_size(region.length),
                region.kind.as_str()
            ),
        );

        total += region.length;
        match region.kind {
            RegionKind::Usable => usable += region.length,
            RegionKind::KernelAndModules => {
                if KERNEL_FOOTPRINT.load(Ordering::Relaxed) == 0 {
                    KERNEL_PHYS_BASE.store(region.base, Ordering::Relaxed);
                    KERNEL_FOOTPRINT.store(region.length, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    TOTAL_MEMORY.store(total, Ordering::SeqCst);
    USABLE_MEMORY.store(usable, Ordering::SeqCst);

    let mut zones = ZONES.lock();
    for region in regions {
        if region.kind != RegionKind::Usable {
            continue;
        }
        let zone = build_zone(phys_to_virt(region.base), region.length as usize);
        if zone.is_null() {
            continue;
        }
        // Append so zones are walked in memory-map order.
        if zones.head.is_null() {
            zones.head = zone;
        } else {
            let mut cursor = zones.head;
            while !(*cursor).next.is_null() {
                cursor = (*cursor).next;
            }
            (*cursor).next = zone;
        }
    }
    drop(zones);

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Info,
        "pmm",
        format_args!("total system memory: {}", format_memory_size(total)),
    );
    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Info,
        "pmm",
        format_args!("usable system memory: {}", format_memory_size(usable)),
    );
}

/// Allocate a physical block of at least `size` bytes, returned as an HHDM
/// virtual address. Returns 0 when no zone can satisfy the request.
pub fn pmm_alloc(size: usize) -> usize {
    let zones = ZONES.lock();
    let mut zone = zones.head;
    while !zone.is_null() {
        unsafe {
            let mut node = (*zone).allocators;
            while !node.is_null() {
                if let Some(addr) = (*node).allocator.allocate(size) {
                    return addr;
                }
                node = (*node).next;
            }
            zone = (*zone).next;
        }
    }
    drop(zones);

    logger::log_message(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Error,
        "pmm",
        format_args!("allocation failed: {{size={}}}", size),
    );
    0
}

/// Free a block previously returned by `pmm_alloc`. Addresses owned by no
/// zone are ignored.
pub fn pmm_free(addr: usize) {
    let zones = ZONES.lock();
    let mut zone = zones.head;
    while !zone.is_null() {
        unsafe {
            if addr >= (*zone).start && addr < (*zone).start + (*zone).size {
                let mut node = (*zone).allocators;
                while !node.is_null() {
                    if (*node).allocator.contains(addr) {
                        (*node).allocator.free(addr);
                        return;
                    }
                    node = (*node).next;
                }
            }
            zone = (*zone).next;
        }
    }
}

/// Total free bytes across every zone's allocators.
pub fn pmm_free_memory() -> u64 {
    let zones = ZONES.lock();
    let mut total = 0u64;
    let mut zone = zones.head;
    while !zone.is_null() {
        unsafe {
            let mut node = (*zone).allocators;
            while !node.is_null() {
                total += (*node).allocator.free_bytes() as u64;
                node = (*node).next;
            }
            zone = (*zone).next;
        }
    }
    total
}

/// Emit the allocator state as one streamed JSON record: zones, their
/// allocator chains, and per-order free-block counts and addresses.
pub fn pmm_debug_print_state() {
    use core::fmt::Write;

    logger::stream_start(
        &KERNEL_DEBUG_LOGGER,
        LogLevel::Debug,
        "pmm",
        "buddy allocator state",
    );

    let zones = ZONES.lock();
    logger::stream_data(&KERNEL_DEBUG_LOGGER, "{\"zones\":[");
    let mut zone = zones.head;
    let mut first_zone = true;
    while !zone.is_null() {
        unsafe {
            let mut chunk: String<128> = String::new();
            write!(
                chunk,
                "{}{{\"start\":\"{:#x}\",\"size\":{},\"allocators\":[",
                if first_zone { "" } else { "," },
                (*zone).start,
                (*zone).size
            )
            .ok();
            logger::stream_data(&KERNEL_DEBUG_LOGGER, chunk.as_str());
            first_zone = false;

            let mut node = (*zone).allocators;
            let mut first_node = true;
            while !node.is_null() {
                let allocator = &(*node).allocator;
                let mut chunk: String<128> = String::new();
                write!(
                    chunk,
                    "{}{{\"pool_start\":\"{:#x}\",\"pool_size\":{},\"orders\":[",
                    if first_node { "" } else { "," },
                    allocator.start_address(),
                    allocator.pool_size()
                )
                .ok();
                logger::stream_data(&KERNEL_DEBUG_LOGGER, chunk.as_str());
                first_node = false;

                for order in 0..=MAX_ORDER {
                    let mut chunk: String<128> = String::new();
                    write!(
                        chunk,
                        "{}{{\"order\":{},\"block_size\":{},\"count\":{},\"free\":[",
                        if order == 0 { "" } else { "," },
                        order,
                        PAGE_SIZE << order,
                        allocator.count_free(order)
                    )
                    .ok();
                    logger::stream_data(&KERNEL_DEBUG_LOGGER, chunk.as_str());

                    let mut first_block = true;
                    allocator.for_each_free(order, |addr| {
                        let mut chunk: String<32> = String::new();
                        write!(
                            chunk,
                            "{}\"{:#x}\"",
                            if first_block { "" } else { "," },
                            addr
                        )
                        .ok();
                        logger::stream_data(&KERNEL_DEBUG_LOGGER, chunk.as_str());
                        first_block = false;
                    });
                    logger::stream_data(&KERNEL_DEBUG_LOGGER, "]}");
                }
                logger::stream_data(&KERNEL_DEBUG_LOGGER, "]}");
                node = (*node).next;
            }
            logger::stream_data(&KERNEL_DEBUG_LOGGER, "]}");
            zone = (*zone).next;
        }
    }
    logger::stream_data(&KERNEL_DEBUG_LOGGER, "]}");
    drop(zones);

    logger::stream_end(&KERNEL_DEBUG_LOGGER);
}

/// Exercise the allocator against live zones. Returns (passed, failed).
pub fn self_test() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    let mut check = |name: &str, ok: bool| {
        if ok {
            passed += 1;
            logger::log_message(
                &KERNEL_DEBUG_LOGGER,
                LogLevel::Debug,
                "pmm",
                format_args!("self test {}: pass", name),
            );
        } else {
            failed += 1;
            logger::log_message(
                &KERNEL_DEBUG_LOGGER,
                LogLevel::Error,
                "pmm",
                format_args!("self test {}: FAIL", name),
            );
        }
    };

    let free_before = pmm_free_memory();

    let a = pmm_alloc(PAGE_SIZE);
    check("alloc returns page-aligned block", a != 0 && a % PAGE_SIZE == 0);

    let b = pmm_alloc(PAGE_SIZE);
    check("second alloc is distinct", b != 0 && b != a);

    pmm_free(b);
    pmm_free(a);
    check("free restores byte total", pmm_free_memory() == free_before);

    let big = pmm_alloc(PAGE_SIZE << 3);
    check(
        "multi-page alloc is size-aligned",
        big != 0 && big % (PAGE_SIZE << 3) == 0,
    );
    pmm_free(big);

    pmm_free(0xdead_0000);
    check("freeing an unknown address is ignored", pmm_free_memory() == free_before);

    (passed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    const MIB: usize = 1024 * 1024;

    // The zone list is a process-wide static; run these tests one at a time.
    static PMM_TESTS: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        ZONES.lock().head = core::ptr::null_mut();
        TOTAL_MEMORY.store(0, Ordering::SeqCst);
        USABLE_MEMORY.store(0, Ordering::SeqCst);
        KERNEL_PHYS_BASE.store(0, Ordering::SeqCst);
        KERNEL_FOOTPRINT.store(0, Ordering::SeqCst);
    }

    struct Pool {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Pool {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, MAX_POOL_SIZE).unwrap();
            let ptr = unsafe { std::alloc::alloc(layout) };
            assert!(!ptr.is_null());
            Pool { ptr, layout }
        }

        fn addr(&self) -> usize {
            self.ptr as usize
        }
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn init_single_zone(pool: &Pool, length: usize) {
        let regions = [MemoryRegion {
            base: 0,
            length: length as u64,
            kind: RegionKind::Usable,
        }];
        unsafe { pmm_initialize(&regions, pool.addr() as u64) };
    }

    #[test]
    fn totals_and_kernel_footprint() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(16 * MIB);
        let regions = [
            MemoryRegion { base: 0, length: 16 * MIB as u64, kind: RegionKind::Usable },
            MemoryRegion { base: 16 * MIB as u64, length: MIB as u64, kind: RegionKind::Reserved },
            MemoryRegion { base: 17 * MIB as u64, length: 2 * MIB as u64, kind: RegionKind::KernelAndModules },
        ];
        unsafe { pmm_initialize(&regions, pool.addr() as u64) };

        assert_eq!(pmm_total_memory(), 19 * MIB as u64);
        assert_eq!(pmm_usable_memory(), 16 * MIB as u64);
        assert_eq!(kernel_footprint(), (17 * MIB as u64, 2 * MIB as u64));
    }

    #[test]
    fn alloc_free_round_trip() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(16 * MIB);
        init_single_zone(&pool, 16 * MIB);

        let free_initial = pmm_free_memory();
        assert!(free_initial > 0);

        let a = pmm_alloc(PAGE_SIZE);
        let b = pmm_alloc(PAGE_SIZE);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(a % PAGE_SIZE, 0);
        assert_eq!(b % PAGE_SIZE, 0);
        assert!(a >= pool.addr() && a < pool.addr() + 16 * MIB);
        assert!(b >= pool.addr() && b < pool.addr() + 16 * MIB);
        assert_eq!(pmm_free_memory(), free_initial - 2 * PAGE_SIZE as u64);

        pmm_free(b);
        pmm_free(a);
        assert_eq!(pmm_free_memory(), free_initial);
    }

    #[test]
    fn allocation_is_size_aligned_and_owned() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(16 * MIB);
        init_single_zone(&pool, 16 * MIB);

        for &size in &[PAGE_SIZE, 3 * PAGE_SIZE, 64 * 1024, MIB] {
            let addr = pmm_alloc(size);
            assert_ne!(addr, 0, "size {}", size);
            let order = order_for(size).unwrap();
            assert_eq!(addr & ((PAGE_SIZE << order) - 1), 0, "size {}", size);
            pmm_free(addr);
        }
    }

    #[test]
    fn chain_falls_through_to_later_allocators() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(32 * MIB);
        init_single_zone(&pool, 32 * MIB);

        // Drain with 1 MiB allocations; the first chunk alone cannot hold
        // them all, so later ones must come from further down the chain.
        let mut blocks = std::vec::Vec::new();
        loop {
            let addr = pmm_alloc(MIB);
            if addr == 0 {
                break;
            }
            blocks.push(addr);
        }
        assert!(blocks.len() >= 16, "expected most of 32 MiB in 1 MiB blocks");
        let second_chunk_floor = pool.addr() + MAX_POOL_SIZE;
        assert!(
            blocks.iter().any(|&addr| addr >= second_chunk_floor),
            "no allocation was served by a later allocator"
        );

        let free_mid = pmm_free_memory();
        for addr in blocks {
            pmm_free(addr);
        }
        assert!(pmm_free_memory() > free_mid);
    }

    #[test]
    fn oversized_and_unknown_operations_are_safe() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(16 * MIB);
        init_single_zone(&pool, 16 * MIB);

        // Above MAX_ORDER: must fail cleanly.
        assert_eq!(pmm_alloc(MAX_POOL_SIZE + 1), 0);

        // Freeing addresses nobody owns must be a no-op.
        let free_before = pmm_free_memory();
        pmm_free(0);
        pmm_free(pool.addr().wrapping_sub(PAGE_SIZE));
        pmm_free(pool.addr() + 16 * MIB + PAGE_SIZE);
        assert_eq!(pmm_free_memory(), free_before);
    }

    #[test]
    fn tiny_regions_grow_no_zone() {
        let _guard = PMM_TESTS.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        let pool = Pool::new(16 * MIB);
        // One page cannot hold zone header + node header + pool.
        let regions = [MemoryRegion {
            base: 0,
            length: PAGE_SIZE as u64,
            kind: RegionKind::Usable,
        }];
        unsafe { pmm_initialize(&regions, pool.addr() as u64) };
        assert_eq!(pmm_free_memory(), 0);
        assert_eq!(pmm_alloc(PAGE_SIZE), 0);
    }

    #[test]
    fn format_memory_size_breaks_down_units() {
        assert_eq!(format_memory_size(512).as_str(), "512 bytes (0 KiB)");
        assert_eq!(
            format_memory_size(5 * 1024 * 1024 + 256 * 1024).as_str(),
            "5505024 bytes (5 MiB + 256 KiB)"
        );
        assert_eq!(
            format_memory_size(3 * 1024 * 1024 * 1024u64 + 7 * 1024 * 1024).as_str(),
            "3228565504 bytes (3 GiB + 7 MiB)"
        );
    }
}
