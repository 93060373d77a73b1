//! Boot-variable cache
//!
//! Snapshot of the data the bootloader hands us: the higher-half physical
//! memory offset, the memory region map, the framebuffer descriptor, the
//! ACPI RSDP and the initrd module. Read once at entry, then served from
//! the cache for the rest of the kernel's life.

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use bootloader_api::BootInfo;
use spin::Once;

/// Framebuffer information
///
/// `base` is the virtual address the bootloader mapped the framebuffer at;
/// `pitch` is in bytes, `bpp` in bits per pixel.
#[derive(Debug, Clone, Copy)]
pub struct FbVars {
    pub base: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
}

impl FbVars {
    /// Largest mapping a client may request of this framebuffer.
    pub fn max_map_len(&self) -> usize {
        self.width as usize * self.pitch as usize
    }
}

/// Cached boot variables
pub struct BootVars {
    /// Offset of the full physical-memory mapping in the higher half
    pub phys_offset: u64,
    /// Firmware memory map as handed over by the bootloader
    pub regions: &'static [MemoryRegion],
    /// Framebuffer, if the bootloader set one up
    pub fb: Option<FbVars>,
    /// Physical address of the ACPI RSDP
    pub rsdp: Option<u64>,
    /// Initrd module (virtual base address, length)
    initrd: Option<(u64, usize)>,
}

impl BootVars {
    /// The initial ramdisk image, if one was loaded.
    pub fn initrd(&self) -> Option<&'static [u8]> {
        // SAFETY: the bootloader maps the ramdisk read-only for the kernel's
        // lifetime; the (addr, len) pair was captured verbatim from BootInfo.
        self.initrd
            .map(|(addr, len)| unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
    }
}

static BOOT_VARS: Once<BootVars> = Once::new();

/// Capture the bootloader handoff. Called exactly once from the entry point.
pub fn init(boot_info: &'static mut BootInfo) {
    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .unwrap_or_else(|| panic!("bootvars: no physical memory mapping from bootloader"));

    let rsdp = boot_info.rsdp_addr.into_option();
    let initrd = boot_info
        .ramdisk_addr
        .into_option()
        .map(|addr| (addr, boot_info.ramdisk_len as usize));

    let fb = boot_info.framebuffer.as_ref().map(|fb| {
        let info = fb.info();
        FbVars {
            base: fb.buffer().as_ptr() as u64,
            width: info.width as u32,
            height: info.height as u32,
            pitch: (info.stride * info.bytes_per_pixel) as u32,
            bpp: (info.bytes_per_pixel * 8) as u32,
        }
    });

    let regions: &'static [MemoryRegion] = &*boot_info.memory_regions;

    BOOT_VARS.call_once(|| BootVars {
        phys_offset,
        regions,
        fb,
        rsdp,
        initrd,
    });
}

/// Read the cached boot variables.
///
/// Panics if called before `init` -- a missing boot variable this early is
/// unrecoverable.
pub fn read() -> &'static BootVars {
    BOOT_VARS
        .get()
        .unwrap_or_else(|| panic!("bootvars: read before init"))
}

/// Whether a firmware-reported region may be handed to the frame allocator.
pub fn region_usable(region: &MemoryRegion) -> bool {
    matches!(region.kind, MemoryRegionKind::Usable)
}

/// Human-readable name for a memory region kind, for the boot log.
pub fn region_kind_str(region: &MemoryRegion) -> &'static str {
    match region.kind {
        MemoryRegionKind::Usable => "usable",
        MemoryRegionKind::Bootloader => "bootloader",
        MemoryRegionKind::UnknownUefi(_) => "uefi reserved",
        MemoryRegionKind::UnknownBios(_) => "bios reserved",
        _ => "reserved",
    }
}
