//! ELF64 program loading
//!
//! Verification plus segment loading for the executables spawn pulls out
//! of the VFS. Each loadable segment carries a virtual base, file offset,
//! in-file size, in-memory size and protection bits; segments are backed
//! by fresh frames, copied from the image, zero-padded, and mapped into
//! the target process.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::{self, MapSpec, Protection, PAGE_SIZE};
use crate::process::Process;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

/// One loadable segment of a program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub prot: Protection,
}

/// Parsed image: the entry point and its loadable segments.
#[derive(Debug)]
pub struct Image {
    pub entry: u64,
    pub segments: Vec<Segment>,
}

fn read_u16(b: &[u8], off: usize) -> KernelResult<u16> {
    let s = b.get(off..off + 2).ok_or(KernelError::ExecFormat)?;
    Ok(u16::from_le_bytes([s[0], s[1]]))
}

fn read_u32(b: &[u8], off: usize) -> KernelResult<u32> {
    let s = b.get(off..off + 4).ok_or(KernelError::ExecFormat)?;
    Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_u64(b: &[u8], off: usize) -> KernelResult<u64> {
    let s = b.get(off..off + 8).ok_or(KernelError::ExecFormat)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(s);
    Ok(u64::from_le_bytes(arr))
}

/// Verify the header and collect the PT_LOAD segments.
pub fn parse(image: &[u8]) -> KernelResult<Image> {
    if image.len() < 64 || image[0..4] != ELF_MAGIC {
        log::warn!("elf: bad ELF magic");
        return Err(KernelError::ExecFormat);
    }
    if image[4] != ELFCLASS64 || image[5] != ELFDATA2LSB {
        log::warn!("elf: not a little-endian 64-bit image");
        return Err(KernelError::ExecFormat);
    }
    if image[6] != EV_CURRENT {
        log::warn!("elf: bad version");
        return Err(KernelError::ExecFormat);
    }
    if read_u16(image, 18)? != EM_X86_64 {
        log::warn!("elf: bad target machine");
        return Err(KernelError::ExecFormat);
    }

    let entry = read_u64(image, 24)?;
    let phoff = read_u64(image, 32)? as usize;
    let phentsize = read_u16(image, 54)? as usize;
    let phnum = read_u16(image, 56)? as usize;

    let mut segments = Vec::new();
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        if read_u32(image, base)? != PT_LOAD {
            continue;
        }
        let flags = read_u32(image, base + 4)?;
        let seg = Segment {
            offset: read_u64(image, base + 8)?,
            vaddr: read_u64(image, base + 16)?,
            filesz: read_u64(image, base + 32)?,
            memsz: read_u64(image, base + 40)?,
            prot: {
                let mut prot = Protection::READ | Protection::USER;
                if flags & PF_W != 0 {
                    prot |= Protection::WRITE;
                }
                if flags & PF_X != 0 {
                    prot |= Protection::EXEC;
                }
                prot
            },
        };
        if seg.memsz == 0 && seg.filesz == 0 {
            continue;
        }
        if seg.filesz > seg.memsz {
            return Err(KernelError::ExecFormat);
        }
        segments.push(seg);
    }

    Ok(Image { entry, segments })
}

/// Load a verified image into `proc`'s address space. Returns the entry
/// point; the caller seeds the instruction pointer.
pub fn load(image: &[u8], proc: &Arc<Process>) -> KernelResult<u64> {
    let parsed = parse(image)?;
    let vas = proc.pcb.lock().vas;

    for seg in &parsed.segments {
        let len = mm::align_up(seg.memsz, PAGE_SIZE as u64) as usize;
        let npgs = (len / PAGE_SIZE).max(1);

        let frame = mm::vm_alloc_frame(npgs);
        if frame == 0 {
            log::warn!("elf: could not allocate segment frames");
            return Err(KernelError::OutOfMemory { requested: len });
        }

        // Copy the initialized part; the rest stays zero from the frame
        // allocator.
        let src = image
            .get(seg.offset as usize..(seg.offset + seg.filesz) as usize)
            .ok_or(KernelError::ExecFormat)?;
        // SAFETY: `frame` addresses `npgs` freshly claimed frames inside
        // the physical mapping, and `filesz <= memsz <= npgs * PAGE_SIZE`.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), mm::phys_to_virt(frame), src.len());
        }

        let mut spec = MapSpec::new(seg.vaddr, frame);
        mm::vas::vm_map_for(&vas, &mut spec, len, seg.prot, Some(proc))?;
    }

    Ok(parsed.entry)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    /// Minimal 3-segment ELF64 image: text r-x, rodata r--, data rw-.
    fn synthetic_image() -> std::vec::Vec<u8> {
        let phoff = 64usize;
        let phentsize = 56usize;
        let phnum = 3usize;

        let mut img = vec![0u8; phoff + phentsize * phnum + 0x100];
        img[0..4].copy_from_slice(&ELF_MAGIC);
        img[4] = ELFCLASS64;
        img[5] = ELFDATA2LSB;
        img[6] = EV_CURRENT;
        img[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        img[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        img[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
        img[54..56].copy_from_slice(&(phentsize as u16).to_le_bytes());
        img[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let segs = [
            (0x40_0000u64, 4096u64, PF_X),      // text
            (0x40_1000u64, 512u64, 0),          // rodata
            (0x40_2000u64, 1024u64, PF_W),      // data
        ];
        for (i, (vaddr, size, flags)) in segs.iter().enumerate() {
            let base = phoff + i * phentsize;
            img[base..base + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            img[base + 4..base + 8].copy_from_slice(&(4 | flags).to_le_bytes());
            img[base + 8..base + 16].copy_from_slice(&0u64.to_le_bytes()); // offset
            img[base + 16..base + 24].copy_from_slice(&vaddr.to_le_bytes());
            img[base + 32..base + 40].copy_from_slice(&0u64.to_le_bytes()); // filesz
            img[base + 40..base + 48].copy_from_slice(&size.to_le_bytes()); // memsz
        }
        img
    }

    #[test]
    fn parse_collects_load_segments_with_protections() {
        let img = synthetic_image();
        let parsed = parse(&img).expect("well-formed image should parse");
        assert_eq!(parsed.entry, 0x40_0000);
        assert_eq!(parsed.segments.len(), 3);

        assert!(parsed.segments[0].prot.contains(Protection::EXEC));
        assert!(!parsed.segments[0].prot.contains(Protection::WRITE));
        assert!(!parsed.segments[1].prot.contains(Protection::WRITE));
        assert!(parsed.segments[2].prot.contains(Protection::WRITE));
        for seg in &parsed.segments {
            assert!(seg.prot.contains(Protection::USER));
        }
    }

    #[test]
    fn parse_rejects_bad_magic_and_machine() {
        let mut img = synthetic_image();
        img[0] = 0;
        assert_eq!(parse(&img).unwrap_err(), KernelError::ExecFormat);

        let mut img = synthetic_image();
        img[18] = 40; // EM_ARM
        assert_eq!(parse(&img).unwrap_err(), KernelError::ExecFormat);
    }

    #[test]
    fn parse_rejects_filesz_beyond_memsz() {
        let mut img = synthetic_image();
        // First segment: filesz 8192 > memsz 4096.
        img[64 + 32..64 + 40].copy_from_slice(&8192u64.to_le_bytes());
        assert_eq!(parse(&img).unwrap_err(), KernelError::ExecFormat);
    }
}
