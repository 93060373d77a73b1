//! tmpfs
//!
//! Flat in-memory filesystem: a registry of named nodes with growable
//! data. Lookup and create work one component at a time; writes extend
//! the backing storage on demand.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::mount::FsInfo;
use super::{valloc, FsNode, Vattr, Vnode, VnodeType};
use crate::error::{KernelError, KernelResult};

/// Longest tmpfs node name.
const TMPFS_NAMEMAX: usize = 128;

/// One tmpfs node.
pub struct TmpfsNode {
    name: String,
    vtype: VnodeType,
    data: Mutex<Vec<u8>>,
}

/// Shared handle to a node; vnodes and the registry both hold one.
pub type TmpfsNodeRef = Arc<TmpfsNode>;

/// Node registry; the whole filesystem shares one namespace.
pub struct TmpfsState {
    nodes: Mutex<Vec<TmpfsNodeRef>>,
}

impl TmpfsState {
    pub const fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    fn root_node(&self) -> TmpfsNodeRef {
        Arc::new(TmpfsNode {
            name: String::new(),
            vtype: VnodeType::Dir,
            data: Mutex::new(Vec::new()),
        })
    }

    fn by_name(&self, name: &str) -> Option<TmpfsNodeRef> {
        self.nodes.lock().iter().find(|n| n.name == name).cloned()
    }

    fn new_node(&self, name: &str, vtype: VnodeType) -> KernelResult<TmpfsNodeRef> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if name.len() > TMPFS_NAMEMAX {
            return Err(KernelError::NameTooLong);
        }

        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.iter().find(|n| n.name == name) {
            // Create is idempotent on an existing name.
            return Ok(existing.clone());
        }
        let node = Arc::new(TmpfsNode {
            name: name.to_string(),
            vtype,
            data: Mutex::new(Vec::new()),
        });
        nodes.push(node.clone());
        Ok(node)
    }
}

impl Default for TmpfsState {
    fn default() -> Self {
        Self::new()
    }
}

static TMPFS: TmpfsState = TmpfsState::new();

fn wrap(node: TmpfsNodeRef) -> Arc<Vnode> {
    valloc(node.vtype, FsNode::Tmp(node))
}

/// Mount hook: hand back a fresh root directory vnode.
pub fn mount(_fs: &'static FsInfo) -> KernelResult<Arc<Vnode>> {
    Ok(wrap(TMPFS.root_node()))
}

/// Per-component lookup.
pub fn lookup(dir: &TmpfsNodeRef, name: &str) -> KernelResult<Arc<Vnode>> {
    if dir.vtype != VnodeType::Dir {
        return Err(KernelError::NotSupported);
    }
    TMPFS.by_name(name).map(wrap).ok_or(KernelError::NotFound)
}

/// Create a regular file in the directory.
pub fn create(dir: &TmpfsNodeRef, name: &str) -> KernelResult<Arc<Vnode>> {
    if dir.vtype != VnodeType::Dir {
        return Err(KernelError::NotSupported);
    }
    TMPFS.new_node(name, VnodeType::File).map(wrap)
}

/// Read available bytes at `off`.
pub fn read(node: &TmpfsNodeRef, buf: &mut [u8], off: usize) -> KernelResult<usize> {
    let data = node.data.lock();
    if off >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - off);
    buf[..n].copy_from_slice(&data[off..off + n]);
    Ok(n)
}

/// Write at `off`, growing the node as needed.
pub fn write(node: &TmpfsNodeRef, buf: &[u8], off: usize) -> KernelResult<usize> {
    if node.vtype != VnodeType::File {
        return Err(KernelError::NotSupported);
    }
    let mut data = node.data.lock();
    let end = off + buf.len();
    if end > data.len() {
        data.resize(end, 0);
    }
    data[off..end].copy_from_slice(buf);
    Ok(buf.len())
}

pub fn getattr(node: &TmpfsNodeRef) -> Vattr {
    Vattr {
        size: node.data.lock().len(),
        mode: 0o644,
    }
}

/// Reclaim hook. Registry entries persist by design, so a vnode going
/// away leaves the node alone.
pub fn reclaim(_node: &TmpfsNodeRef) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_write_read_roundtrip() {
        let state = TmpfsState::new();
        let node = state
            .new_node("scratchfile", VnodeType::File)
            .expect("creation succeeds");

        assert!(state.by_name("scratchfile").is_some());
        assert!(state.by_name("other").is_none());

        write(&node, b"hello tmpfs", 0).expect("write");
        let mut buf = [0u8; 32];
        let n = read(&node, &mut buf, 0).expect("read");
        assert_eq!(&buf[..n], b"hello tmpfs");
    }

    #[test]
    fn sparse_write_grows_and_zero_fills() {
        let state = TmpfsState::new();
        let node = state.new_node("sparse", VnodeType::File).unwrap();

        write(&node, b"xy", 8).expect("offset write grows the node");
        assert_eq!(getattr(&node).size, 10);

        let mut buf = [0u8; 10];
        let n = read(&node, &mut buf, 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(&buf[8..], b"xy");
    }

    #[test]
    fn overlong_names_are_refused() {
        let state = TmpfsState::new();
        let long = alloc::string::String::from_utf8(alloc::vec![b'a'; 200]).unwrap();
        assert_eq!(
            state.new_node(&long, VnodeType::File).err(),
            Some(KernelError::NameTooLong)
        );
    }
}
