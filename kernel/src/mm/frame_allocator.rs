//! Physical frame allocator
//!
//! One bit per page frame across the whole physical span: bit clear means
//! free, bit set means reserved or in use. Allocation scans forward from a
//! sliding cursor, wrapping to the start at most once per call. The bitmap
//! lives in kernel-image storage, so its own frames sit inside regions the
//! firmware already reports as reserved.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{align_up, phys_to_virt, PAGE_SIZE};

/// Largest physical span tracked: 64 GiB of 4 KiB frames.
const MAX_PHYS_FRAMES: usize = 1 << 24;

/// Backing storage for the frame bitmap. Lives in the kernel image, so the
/// frames holding it are inside firmware-reserved regions and stay set.
static mut BITMAP_STORAGE: [u8; MAX_PHYS_FRAMES / 8] = [0xFF; MAX_PHYS_FRAMES / 8];

/// Frame bitmap with a last-index allocation cursor.
///
/// The search and accounting logic is self-contained so it can be exercised
/// on the host with synthetic memory maps.
pub struct FrameMap {
    bitmap: Option<&'static mut [u8]>,
    highest_frame: usize,
    last_idx: usize,
    pages_total: usize,
    pages_free: usize,
    pages_used: usize,
}

impl FrameMap {
    pub const fn empty() -> Self {
        Self {
            bitmap: None,
            highest_frame: 0,
            last_idx: 0,
            pages_total: 0,
            pages_free: 0,
            pages_used: 0,
        }
    }

    /// Attach bitmap storage. Every bit starts set; usable regions are
    /// cleared afterwards with `add_region`.
    pub fn attach(&mut self, bitmap: &'static mut [u8], highest_frame: usize) {
        for byte in bitmap.iter_mut() {
            *byte = 0xFF;
        }
        self.highest_frame = highest_frame.min(bitmap.len() * 8);
        self.bitmap = Some(bitmap);
    }

    /// Account one firmware-reported region. Usable regions have their
    /// frames cleared; everything else stays set and counts as used.
    pub fn add_region(&mut self, base: u64, len: u64, usable: bool) {
        let pages = (len as usize) / PAGE_SIZE;
        self.pages_total += pages;

        if !usable {
            self.pages_used += pages;
            return;
        }

        let first = (base as usize) / PAGE_SIZE;
        for frame in first..first + pages {
            if frame < self.highest_frame {
                self.clear_bit(frame);
            }
        }
        self.pages_free += pages;
    }

    fn test_bit(&self, idx: usize) -> bool {
        let bitmap = self.bitmap.as_ref().expect("frame map not attached");
        bitmap[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, idx: usize) {
        let bitmap = self.bitmap.as_mut().expect("frame map not attached");
        bitmap[idx / 8] |= 1 << (idx % 8);
    }

    fn clear_bit(&mut self, idx: usize) {
        let bitmap = self.bitmap.as_mut().expect("frame map not attached");
        bitmap[idx / 8] &= !(1 << (idx % 8));
    }

    /// One forward scan from the cursor for `count` consecutive clear bits.
    fn scan(&mut self, count: usize) -> Option<usize> {
        let mut run = 0usize;
        let mut start = 0usize;

        for i in self.last_idx..self.highest_frame {
            if self.test_bit(i) {
                run = 0;
                continue;
            }
            if run == 0 {
                start = i;
            }
            run += 1;
            if run == count {
                return Some(start);
            }
        }
        None
    }

    /// Claim `count` contiguous frames, returning the physical base, or 0
    /// after a full sweep (cursor scan plus one wrapped retry) fails.
    /// The caller is responsible for zeroing.
    pub fn claim(&mut self, count: usize) -> u64 {
        if count == 0 || self.bitmap.is_none() {
            return 0;
        }

        let start = match self.scan(count) {
            Some(s) => Some(s),
            None => {
                self.last_idx = 0;
                self.scan(count)
            }
        };

        let Some(start) = start else {
            return 0;
        };

        for i in start..start + count {
            self.set_bit(i);
        }
        self.last_idx = start + count;
        self.pages_used += count;
        self.pages_free -= count;
        (start * PAGE_SIZE) as u64
    }

    /// Release `count` frames starting at `base` (rounded up to a page
    /// boundary). Releasing an already-free range is silent; only bits that
    /// were actually set move the counters, so the call is idempotent.
    pub fn release(&mut self, base: u64, count: usize) {
        if self.bitmap.is_none() {
            return;
        }

        let base = align_up(base, PAGE_SIZE as u64);
        let first = (base as usize) / PAGE_SIZE;
        let mut cleared = 0usize;

        for frame in first..first + count {
            if frame >= self.highest_frame {
                break;
            }
            if self.test_bit(frame) {
                self.clear_bit(frame);
                cleared += 1;
            }
        }

        self.pages_used -= cleared;
        self.pages_free += cleared;
    }

    /// (total, free, used) page counts.
    pub fn stats(&self) -> (usize, usize, usize) {
        (self.pages_total, self.pages_free, self.pages_used)
    }
}

/// Global frame map. Callers must not hold this across page-table edits
/// that may themselves allocate.
pub static FRAME_MAP: Mutex<FrameMap> = Mutex::new(FrameMap::empty());

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Build the bitmap from the boot-vars memory map.
pub fn init() {
    let bv = crate::bootvars::read();

    let mut highest = 0u64;
    for region in bv.regions {
        if crate::bootvars::region_usable(region) {
            highest = highest.max(region.end);
        }
    }

    let highest_frame = (highest as usize) / PAGE_SIZE;
    if highest_frame > MAX_PHYS_FRAMES {
        log::warn!(
            "sysmem: truncating physical span to {} frames ({} reported)",
            MAX_PHYS_FRAMES,
            highest_frame
        );
    }

    let mut map = FRAME_MAP.lock();

    // SAFETY: init runs exactly once, on the bootstrap processor, before
    // any other core is started; the exclusive reference is then owned by
    // the frame map behind its mutex.
    let storage: &'static mut [u8] = unsafe { &mut *core::ptr::addr_of_mut!(BITMAP_STORAGE) };
    map.attach(storage, highest_frame);

    for region in bv.regions {
        let base = region.start;
        let len = region.end - region.start;
        log::info!(
            "sysmem: [{:#x} -> {:#x}]: {}",
            region.start,
            region.end,
            crate::bootvars::region_kind_str(region)
        );
        map.add_region(base, len, crate::bootvars::region_usable(region));
    }

    let (total, free, used) = map.stats();
    log::info!(
        "sysmem: {} pages total, {} free, {} used",
        total,
        free,
        used
    );
    INITIALIZED.store(true, Ordering::Release);
}

/// Allocate `count` contiguous zeroed frames. Returns the physical base,
/// or 0 once a full sweep has failed. Panicking on exhaustion is a caller
/// policy decision, not the allocator's.
pub fn vm_alloc_frame(count: usize) -> u64 {
    let base = FRAME_MAP.lock().claim(count);
    if base != 0 {
        // Zero outside the lock: the frames are already claimed, nobody
        // else can hand them out.
        // SAFETY: `base` addresses `count` freshly claimed frames inside
        // the higher-half physical mapping.
        unsafe {
            core::ptr::write_bytes(phys_to_virt(base), 0, count * PAGE_SIZE);
        }
    }
    base
}

/// Release `count` frames starting at `base`.
pub fn vm_free_frame(base: u64, count: usize) {
    FRAME_MAP.lock().release(base, count);
}

/// Current (total, free, used) page counts.
pub fn stats() -> (usize, usize, usize) {
    FRAME_MAP.lock().stats()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    /// A frame map over a synthetic firmware map: one usable region
    /// [0x100000, 0x10000000), everything below reserved.
    fn boot_scenario_map() -> FrameMap {
        let storage = vec![0u8; 65536 / 8].leak();
        let mut map = FrameMap::empty();
        map.attach(storage, 65536);
        map.add_region(0, 0x100000, false);
        map.add_region(0x100000, 0x10000000 - 0x100000, true);
        map
    }

    #[test]
    fn boot_scenario_page_counts() {
        let map = boot_scenario_map();
        let (total, free, used) = map.stats();
        assert_eq!(free, 65280, "usable region is 65280 pages");
        assert_eq!(total, free + used);
    }

    #[test]
    fn conservation_invariant_across_alloc_free() {
        let mut map = boot_scenario_map();
        let (total, ..) = map.stats();

        let base = map.claim(12);
        assert_ne!(base, 0);
        let (t, f, u) = map.stats();
        assert_eq!(t, total);
        assert_eq!(f + u, t);

        map.release(base, 12);
        let (t, f, u) = map.stats();
        assert_eq!(f + u, t);
    }

    #[test]
    fn alloc_returns_page_aligned_previously_free_frames() {
        let mut map = boot_scenario_map();
        let base = map.claim(4);
        assert_eq!(base % PAGE_SIZE as u64, 0);
        assert!(base >= 0x100000);
        // The claimed frames are now set.
        let first = base as usize / PAGE_SIZE;
        for i in first..first + 4 {
            assert!(map.test_bit(i));
        }
    }

    #[test]
    fn free_after_alloc_restores_bitmap() {
        let mut map = boot_scenario_map();
        let snapshot: std::vec::Vec<u8> = map.bitmap.as_ref().unwrap().to_vec();

        let base = map.claim(7);
        assert_ne!(base, 0);
        map.release(base, 7);

        assert_eq!(
            &**map.bitmap.as_ref().unwrap(),
            snapshot.as_slice(),
            "free(alloc(n), n) must restore the bitmap bit for bit"
        );
    }

    #[test]
    fn oversized_request_returns_zero() {
        let mut map = boot_scenario_map();
        let (_, free, _) = map.stats();
        assert_eq!(map.claim(free + 1), 0);
    }

    #[test]
    fn zero_page_request_returns_zero() {
        // alloc(0) is implementation-defined; this kernel returns 0.
        let mut map = boot_scenario_map();
        assert_eq!(map.claim(0), 0);
    }

    #[test]
    fn cursor_wraps_to_reuse_freed_frames() {
        let storage = vec![0u8; 64 / 8].leak();
        let mut map = FrameMap::empty();
        map.attach(storage, 64);
        map.add_region(0, 64 * PAGE_SIZE as u64, true);

        // Exhaust the region, free the first half, then allocate again:
        // the scan must wrap and find the freed run.
        let first = map.claim(32);
        let _second = map.claim(32);
        assert_eq!(map.claim(1), 0, "region exhausted");

        map.release(first, 32);
        let again = map.claim(8);
        assert_eq!(again, first, "wrapped scan finds the freed frames");
    }

    #[test]
    fn double_free_is_idempotent() {
        let mut map = boot_scenario_map();
        let base = map.claim(3);
        map.release(base, 3);
        let (_, free_once, _) = map.stats();
        map.release(base, 3);
        let (_, free_twice, _) = map.stats();
        assert_eq!(free_once, free_twice);
    }
}
