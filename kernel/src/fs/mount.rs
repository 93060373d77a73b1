//! Mount table
//!
//! Mount points are keyed by the first path component ("tmp", "dev", ""
//! for the root). Filesystems live in a static table; mounting resolves
//! the type by name, asks the filesystem for its root vnode, and inserts
//! the entry. Names in the mount list are unique.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::{first_component, validate_path, Vnode};
use crate::error::{KernelError, KernelResult};

/// Longest filesystem type name, terminator included.
pub const FSNAME_MAX: usize = 16;

bitflags! {
    /// Filesystem attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsAttr: u32 {
        /// `lookup` accepts a full remaining path instead of a single
        /// component; the walker short-circuits.
        const IMAGE = 1 << 0;
    }
}

/// One registered filesystem type.
pub struct FsInfo {
    pub name: &'static str,
    pub attr: FsAttr,
    /// Produce the root vnode for a new mount.
    pub mount: fn(&'static FsInfo) -> KernelResult<Arc<Vnode>>,
    /// Number of live mounts of this type.
    pub refcount: AtomicU32,
}

/// The closed set of filesystems this kernel knows.
static FS_TABLE: [FsInfo; 3] = [
    FsInfo {
        name: "initrd",
        attr: FsAttr::IMAGE,
        mount: super::omarfs::mount,
        refcount: AtomicU32::new(0),
    },
    FsInfo {
        name: "tmpfs",
        attr: FsAttr::empty(),
        mount: super::tmpfs::mount,
        refcount: AtomicU32::new(0),
    },
    FsInfo {
        name: "devfs",
        attr: FsAttr::empty(),
        mount: super::devfs::mount,
        refcount: AtomicU32::new(0),
    },
];

/// One mount point.
pub struct Mount {
    pub vp: Arc<Vnode>,
    pub name: String,
    pub fs: &'static FsInfo,
}

static MOUNTLIST: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Find a filesystem type by name.
pub fn fs_by_name(name: &str) -> Option<&'static FsInfo> {
    FS_TABLE.iter().find(|fs| fs.name == name)
}

/// Look up a mount point by its first-component key.
pub fn mount_lookup(name: &str) -> Option<(Arc<Vnode>, &'static FsInfo)> {
    let list = MOUNTLIST.lock();
    list.iter()
        .find(|m| m.name == name)
        .map(|m| (m.vp.clone(), m.fs))
}

/// Mount a filesystem of type `fstype` at `target`. The target must be
/// the root or a single first-level component; claiming a component that
/// is already mounted fails with busy.
pub fn kmount(fstype: &str, target: &str) -> KernelResult<()> {
    if fstype.is_empty() || fstype.len() >= FSNAME_MAX {
        return Err(KernelError::InvalidArgument);
    }
    validate_path(target)?;

    // Only first-level targets are mountable.
    let name = first_component(target);
    let rest = target.trim_start_matches('/');
    if rest.contains('/') {
        log::warn!("kmount: got bad path '{}'", target);
        return Err(KernelError::InvalidArgument);
    }

    let fs = fs_by_name(fstype).ok_or(KernelError::NotFound)?;

    let mut list = MOUNTLIST.lock();
    if list.iter().any(|m| m.name == name) {
        return Err(KernelError::Busy);
    }

    let vp = (fs.mount)(fs)?;
    fs.refcount.fetch_add(1, Ordering::Relaxed);
    list.push(Mount {
        vp,
        name: name.to_string(),
        fs,
    });
    Ok(())
}

/// Serializes host tests that touch the global mount list.
#[cfg(not(target_os = "none"))]
pub static VFS_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Drop every mount (test teardown helper).
#[cfg(not(target_os = "none"))]
pub fn clear_mounts() {
    let mut list = MOUNTLIST.lock();
    for m in list.drain(..) {
        m.fs.refcount.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn mount_then_lookup_returns_root_vnode() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();

        kmount("tmpfs", "/tmp").expect("mounting tmpfs on a free component succeeds");
        let (vp, fs) = mount_lookup("tmp").expect("mounted component must resolve");
        assert_eq!(fs.name, "tmpfs");
        assert_eq!(vp.vtype(), super::super::VnodeType::Dir);

        clear_mounts();
    }

    #[test]
    fn duplicate_first_component_is_busy() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();

        kmount("tmpfs", "/scratch").expect("first mount succeeds");
        assert_eq!(
            kmount("devfs", "/scratch"),
            Err(KernelError::Busy),
            "a second filesystem on the same component is refused"
        );

        clear_mounts();
    }

    #[test]
    fn unknown_fstype_and_nested_target_are_rejected() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();

        assert_eq!(kmount("xyzfs", "/x"), Err(KernelError::NotFound));
        assert_eq!(
            kmount("tmpfs", "/a/b"),
            Err(KernelError::InvalidArgument),
            "only first-level components are mountable"
        );

        clear_mounts();
    }
}
