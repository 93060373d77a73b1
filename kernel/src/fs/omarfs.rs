//! Initrd image filesystem
//!
//! Read-only filesystem over the boot module image. The image is a
//! sequence of records: a 15-byte header (magic "OMAR", type, name
//! length, data length, revision, mode), the name bytes, then file data,
//! the whole record padded to a 512-byte boundary (directories occupy
//! exactly one block). A record whose magic reads "RAMO" ends the stream.
//!
//! The filesystem carries the image attribute: `lookup` takes the entire
//! remaining path in one shot rather than walking per component.

use alloc::sync::Arc;

use super::mount::FsInfo;
use super::{valloc, FsNode, Vattr, Vnode, VnodeType};
use crate::error::{KernelError, KernelResult};

const OMAR_MAGIC: &[u8; 4] = b"OMAR";
const OMAR_EOF: &[u8; 4] = b"RAMO";
const OMAR_REG: u8 = 0;
const OMAR_DIR: u8 = 1;
const BLOCK_SIZE: usize = 512;
const HDR_LEN: usize = 15;

/// One located image entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageEntry {
    pub data_off: usize,
    pub len: usize,
    pub mode: u32,
    pub is_dir: bool,
}

/// Find `path` (no leading slash) in an OMAR image.
pub fn image_lookup(image: &[u8], path: &str) -> KernelResult<ImageEntry> {
    let mut p = 0usize;

    loop {
        let hdr = image
            .get(p..p + HDR_LEN)
            .ok_or(KernelError::NotFound)?;
        if &hdr[0..4] == OMAR_EOF {
            return Err(KernelError::NotFound);
        }
        if &hdr[0..4] != OMAR_MAGIC {
            return Err(KernelError::InvalidArgument);
        }

        let ftype = hdr[4];
        let namelen = hdr[5] as usize;
        let len = u32::from_le_bytes([hdr[6], hdr[7], hdr[8], hdr[9]]) as usize;
        let mode = u32::from_le_bytes([hdr[11], hdr[12], hdr[13], hdr[14]]);

        let name = image
            .get(p + HDR_LEN..p + HDR_LEN + namelen)
            .ok_or(KernelError::InvalidArgument)?;

        if name == path.as_bytes() {
            return Ok(ImageEntry {
                data_off: p + HDR_LEN + namelen,
                len: if ftype == OMAR_REG { len } else { 0 },
                mode,
                is_dir: ftype == OMAR_DIR,
            });
        }

        // Stride to the next block-aligned record.
        p += if ftype == OMAR_DIR {
            BLOCK_SIZE
        } else {
            (HDR_LEN + namelen + len).div_ceil(BLOCK_SIZE) * BLOCK_SIZE
        };
    }
}

/// Filesystem-private data of an initrd vnode.
pub enum OmarNode {
    /// The mount root; lookups run over the whole image.
    Root { image: &'static [u8] },
    /// A located regular file.
    File { data: &'static [u8], mode: u32 },
    /// A located directory.
    Dir { mode: u32 },
}

impl OmarNode {
    pub fn lookup(&self, path: &str) -> KernelResult<Arc<Vnode>> {
        let OmarNode::Root { image } = self else {
            return Err(KernelError::NotSupported);
        };

        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(KernelError::NotFound);
        }

        let entry = image_lookup(image, path)?;
        if entry.is_dir {
            return Ok(valloc(
                VnodeType::Dir,
                FsNode::Omar(OmarNode::Dir { mode: entry.mode }),
            ));
        }
        Ok(valloc(
            VnodeType::File,
            FsNode::Omar(OmarNode::File {
                data: &image[entry.data_off..entry.data_off + entry.len],
                mode: entry.mode,
            }),
        ))
    }

    pub fn read(&self, buf: &mut [u8], off: usize) -> KernelResult<usize> {
        let OmarNode::File { data, .. } = self else {
            return Err(KernelError::NotSupported);
        };
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    pub fn getattr(&self) -> Vattr {
        match self {
            OmarNode::Root { image } => Vattr {
                size: image.len(),
                mode: 0o555,
            },
            OmarNode::File { data, mode } => Vattr {
                size: data.len(),
                mode: *mode,
            },
            OmarNode::Dir { mode } => Vattr { size: 0, mode: *mode },
        }
    }
}

/// Mount hook: root the filesystem on the boot initrd module.
pub fn mount(_fs: &'static FsInfo) -> KernelResult<Arc<Vnode>> {
    let image = crate::bootvars::read()
        .initrd()
        .ok_or(KernelError::NoDevice)?;
    Ok(valloc(
        VnodeType::Dir,
        FsNode::Omar(OmarNode::Root { image }),
    ))
}

/// Build a root vnode over an arbitrary image (host-test hook).
#[cfg(not(target_os = "none"))]
pub fn mount_image(image: &'static [u8]) -> Arc<Vnode> {
    valloc(
        VnodeType::Dir,
        FsNode::Omar(OmarNode::Root { image }),
    )
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;
    use std::vec::Vec;

    fn push_record(image: &mut Vec<u8>, ftype: u8, name: &str, data: &[u8], mode: u32) {
        let start = image.len();
        image.extend_from_slice(OMAR_MAGIC);
        image.push(ftype);
        image.push(name.len() as u8);
        image.extend_from_slice(&(data.len() as u32).to_le_bytes());
        image.push(1); // revision
        image.extend_from_slice(&mode.to_le_bytes());
        image.extend_from_slice(name.as_bytes());
        image.extend_from_slice(data);

        let end = if ftype == OMAR_DIR {
            start + BLOCK_SIZE
        } else {
            start + (image.len() - start).div_ceil(BLOCK_SIZE) * BLOCK_SIZE
        };
        image.resize(end, 0);
    }

    fn push_eof(image: &mut Vec<u8>) {
        image.extend_from_slice(OMAR_EOF);
        image.resize(image.len() + BLOCK_SIZE - 4, 0);
    }

    fn boot_image() -> Vec<u8> {
        let mut img = Vec::new();
        push_record(&mut img, OMAR_DIR, "bin", &[], 0o755);
        push_record(&mut img, OMAR_REG, "bin/init", &[0xC3; 12288], 0o755);
        push_record(&mut img, OMAR_REG, "etc/motd", b"welcome\n", 0o644);
        push_eof(&mut img);
        img
    }

    #[test]
    fn lookup_finds_files_by_full_path() {
        let img = boot_image();
        let entry = image_lookup(&img, "bin/init").expect("file present in image");
        assert_eq!(entry.len, 12288);
        assert!(!entry.is_dir);
        assert_eq!(entry.mode, 0o755);

        let dir = image_lookup(&img, "bin").expect("directory present in image");
        assert!(dir.is_dir);
    }

    #[test]
    fn lookup_misses_return_not_found() {
        let img = boot_image();
        assert_eq!(
            image_lookup(&img, "bin/missing"),
            Err(KernelError::NotFound)
        );
    }

    #[test]
    fn corrupt_magic_is_invalid() {
        let mut img = boot_image();
        img[0] = b'X';
        assert_eq!(
            image_lookup(&img, "bin/init"),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn root_vnode_resolves_and_reads() {
        let img: &'static [u8] = boot_image().leak();
        let root = mount_image(img);

        let vp = root.lookup("/bin/init").expect("image lookup via vnode");
        assert_eq!(vp.vtype(), VnodeType::File);
        assert_eq!(
            vp.getattr().expect("getattr on image file").size,
            12288,
            "size reported straight from the record header"
        );

        let motd = root.lookup("/etc/motd").expect("nested path in one shot");
        let mut buf = [0u8; 32];
        let n = motd.read(&mut buf, 0).expect("image read");
        assert_eq!(&buf[..n], b"welcome\n");

        // Offset reads clamp to the data length.
        let n = motd.read(&mut buf, 5).expect("offset read");
        assert_eq!(&buf[..n], b"me\n");
    }
}
