//! Kernel heap
//!
//! A pool of frames carved from the physical allocator at boot and handed
//! to the global small-block allocator. Kernel structures (vnodes, process
//! objects, bounce buffers) live here.

#[cfg(target_os = "none")]
use super::{phys_to_virt, vm_alloc_frame, PAGE_SIZE};

/// Heap pool size: 8 MiB.
pub const KHEAP_POOL_SIZE: usize = 8 * 1024 * 1024;
#[cfg(target_os = "none")]
const KHEAP_POOL_PAGES: usize = KHEAP_POOL_SIZE / PAGE_SIZE;

/// Carve the heap pool out of the frame allocator and initialize the
/// global allocator with it. Boot-time allocation failure here is fatal.
#[cfg(target_os = "none")]
pub fn init() {
    let pool = vm_alloc_frame(KHEAP_POOL_PAGES);
    if pool == 0 {
        panic!("kheap: could not create pool");
    }

    let pool_va = phys_to_virt(pool);
    // SAFETY: the pool frames were just claimed for the heap's exclusive
    // use and are mapped through the higher-half physical mapping.
    unsafe {
        crate::ALLOCATOR.lock().init(pool_va, KHEAP_POOL_SIZE);
    }
    log::info!(
        "kheap: {} KiB pool at {:#x}",
        KHEAP_POOL_SIZE / 1024,
        pool
    );
}

/// Host builds use the system allocator; nothing to do.
#[cfg(not(target_os = "none"))]
pub fn init() {}
