//! VFS core
//!
//! Vnodes are reference-counted handles to filesystem objects. The
//! concrete filesystems are a closed set (the initrd image, tmpfs and
//! devfs), so vnode operations dispatch over a tagged variant rather than
//! an open vtable; when the last reference to a vnode drops, the owning
//! filesystem's reclaim hook runs.

pub mod devfs;
pub mod file;
pub mod mount;
pub mod namei;
pub mod omarfs;
pub mod tmpfs;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};

/// Maximum length of one path component.
pub const NAME_MAX: usize = 128;
/// Maximum length of a full path.
pub const PATH_MAX: usize = 256;

/// Vnode types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    None,
    File,
    Dir,
    CharDev,
    Socket,
}

/// Vnode attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vattr {
    /// Object size in bytes.
    pub size: usize,
    /// Permission bits.
    pub mode: u32,
}

/// Filesystem-private side of a vnode.
pub enum FsNode {
    Omar(omarfs::OmarNode),
    Tmp(tmpfs::TmpfsNodeRef),
    Dev(devfs::DevNode),
}

/// Abstract handle to a referenced filesystem object. Reference counting
/// rides on `Arc`; while any file descriptor or mount entry holds a
/// clone, the vnode stays alive.
pub struct Vnode {
    vtype: VnodeType,
    node: FsNode,
}

impl Vnode {
    pub fn vtype(&self) -> VnodeType {
        self.vtype
    }

    /// Look up a child. For image filesystems `name` may be a full
    /// remaining path; everywhere else it is one component.
    pub fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        match &self.node {
            FsNode::Omar(n) => n.lookup(name),
            FsNode::Tmp(n) => tmpfs::lookup(n, name),
            FsNode::Dev(n) => n.lookup(name),
        }
    }

    /// Create a child entry in this directory.
    pub fn create(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        match &self.node {
            FsNode::Tmp(n) => tmpfs::create(n, name),
            _ => Err(KernelError::NotSupported),
        }
    }

    /// Read from the object at `off`.
    pub fn read(&self, buf: &mut [u8], off: usize) -> KernelResult<usize> {
        match &self.node {
            FsNode::Omar(n) => n.read(buf, off),
            FsNode::Tmp(n) => tmpfs::read(n, buf, off),
            FsNode::Dev(n) => n.read(buf),
        }
    }

    /// Write to the object at `off`.
    pub fn write(&self, buf: &[u8], off: usize) -> KernelResult<usize> {
        match &self.node {
            FsNode::Omar(_) => Err(KernelError::NotSupported),
            FsNode::Tmp(n) => tmpfs::write(n, buf, off),
            FsNode::Dev(n) => n.write(buf),
        }
    }

    /// Object attributes.
    pub fn getattr(&self) -> KernelResult<Vattr> {
        match &self.node {
            FsNode::Omar(n) => Ok(n.getattr()),
            FsNode::Tmp(n) => Ok(tmpfs::getattr(n)),
            FsNode::Dev(_) => Ok(Vattr::default()),
        }
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        // Reclaim hook: the last reference is gone.
        match &self.node {
            FsNode::Tmp(n) => tmpfs::reclaim(n),
            FsNode::Omar(_) | FsNode::Dev(_) => {}
        }
    }
}

/// Mint a vnode with one reference.
pub fn valloc(vtype: VnodeType, node: FsNode) -> Arc<Vnode> {
    Arc::new(Vnode { vtype, node })
}

/// Is this byte acceptable inside a path?
fn pathc_valid(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'/'
}

/// Validate a whole path: absolute, within limits, and only `[A-Za-z0-9/]`
/// bytes.
pub fn validate_path(path: &str) -> KernelResult<()> {
    if path.is_empty() || path.len() > PATH_MAX {
        return Err(KernelError::InvalidArgument);
    }
    if !path.starts_with('/') {
        return Err(KernelError::NotFound);
    }
    if !path.bytes().all(pathc_valid) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

/// First path component of an absolute path; empty for the root itself.
pub fn first_component(path: &str) -> &str {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
}

/// Iterate the non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Mount the boot filesystems: the initrd image at the root, tmpfs at
/// /tmp and devfs at /dev.
pub fn init() {
    devfs::register_console();

    if let Err(e) = mount::kmount("initrd", "/") {
        log::warn!("vfs: could not mount initrd root: {}", e);
    }
    if let Err(e) = mount::kmount("tmpfs", "/tmp") {
        log::warn!("vfs: could not mount tmpfs: {}", e);
    }
    if let Err(e) = mount::kmount("devfs", "/dev") {
        log::warn!("vfs: could not mount devfs: {}", e);
    }
    log::info!("vfs: mounts are [up]");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn path_character_validation() {
        assert!(validate_path("/bin/init").is_ok());
        assert!(validate_path("/tmp/abc123").is_ok());
        assert_eq!(
            validate_path("/tmp/read me"),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            validate_path("/etc/rc.conf"),
            Err(KernelError::InvalidArgument),
            "dots are outside the accepted alphabet"
        );
        assert_eq!(validate_path("relative"), Err(KernelError::NotFound));
    }

    #[test]
    fn component_helpers() {
        assert_eq!(first_component("/bin/init"), "bin");
        assert_eq!(first_component("/"), "");
        let comps: alloc::vec::Vec<&str> = components("/a/b/c").collect();
        assert_eq!(comps, ["a", "b", "c"]);
    }
}
