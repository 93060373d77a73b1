//! Name resolution
//!
//! The walker keys the mount table with the first path component (falling
//! back to the root mount), short-circuits for image filesystems whose
//! lookup takes the whole remaining path, and otherwise resolves one
//! component at a time, creating along the way when asked to. The vnode
//! of the final resolved component is the result.

use alloc::sync::Arc;

use bitflags::bitflags;

use super::mount::{mount_lookup, FsAttr};
use super::{components, first_component, validate_path, Vnode};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Walk behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NameiFlags: u32 {
        /// Create missing entries as the walk proceeds.
        const CREATE = 1 << 0;
    }
}

/// Resolve `path` to a referenced vnode.
pub fn namei(path: &str, flags: NameiFlags) -> KernelResult<Arc<Vnode>> {
    validate_path(path)?;

    let first = first_component(path);

    // Mount keyed by the first component, else the root mount.
    let (root_vp, fs, matched_mount) = match mount_lookup(first) {
        Some((vp, fs)) => (vp, fs, true),
        None => {
            let (vp, fs) = mount_lookup("").ok_or_else(|| {
                log::warn!("namei: could not get mount {}", first);
                KernelError::NotFound
            })?;
            (vp, fs, false)
        }
    };

    // Image filesystems take the whole remaining path in one shot.
    if fs.attr.contains(FsAttr::IMAGE) {
        return root_vp.lookup(path);
    }

    // Per-component walk from the mount root. A mount matched by name
    // already consumed the first component.
    let mut dirvp = root_vp;
    let mut iter = components(path);
    if matched_mount {
        let _ = iter.next();
    }

    let mut vp = dirvp.clone();
    for comp in iter {
        if flags.contains(NameiFlags::CREATE) {
            dirvp.create(comp)?;
        }
        vp = dirvp.lookup(comp)?;
        dirvp = vp.clone();
    }

    Ok(vp)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::fs::mount::{clear_mounts, kmount, VFS_TEST_LOCK};

    #[test]
    fn walk_resolves_created_entries_and_is_deterministic() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();
        kmount("tmpfs", "/tmp").expect("mount tmpfs");

        // Create on the way down, then resolve it again without CREATE.
        let created = namei("/tmp/walkfile", NameiFlags::CREATE).expect("create walk");
        created.write(b"abc", 0).expect("write through the vnode");

        let again = namei("/tmp/walkfile", NameiFlags::empty())
            .expect("the final component resolves to the created vnode");
        let mut buf = [0u8; 3];
        again.read(&mut buf, 0).expect("read back");
        assert_eq!(&buf, b"abc");

        // Repeated resolution with no intervening mutation is stable.
        let a = namei("/tmp/walkfile", NameiFlags::empty()).expect("first");
        let b = namei("/tmp/walkfile", NameiFlags::empty()).expect("second");
        assert_eq!(
            a.getattr().unwrap().size,
            b.getattr().unwrap().size,
            "namei must be deterministic between mutations"
        );

        clear_mounts();
    }

    #[test]
    fn missing_component_reports_not_found() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();
        kmount("tmpfs", "/tmp").expect("mount tmpfs");

        assert_eq!(
            namei("/tmp/absent", NameiFlags::empty()).err(),
            Some(KernelError::NotFound)
        );

        clear_mounts();
    }

    #[test]
    fn invalid_characters_are_rejected_before_any_walk() {
        let _guard = VFS_TEST_LOCK.lock();
        assert_eq!(
            namei("/tmp/bad name", NameiFlags::empty()).err(),
            Some(KernelError::InvalidArgument)
        );
        assert_eq!(
            namei("/tmp/semi;colon", NameiFlags::empty()).err(),
            Some(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn mount_root_resolves_for_bare_mount_path() {
        let _guard = VFS_TEST_LOCK.lock();
        clear_mounts();
        kmount("tmpfs", "/tmp").expect("mount tmpfs");

        let vp = namei("/tmp", NameiFlags::empty()).expect("bare mount path");
        assert_eq!(vp.vtype(), crate::fs::VnodeType::Dir);

        clear_mounts();
    }
}
