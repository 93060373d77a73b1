//! devfs
//!
//! Device filesystem: a registry of named character devices exposed as
//! vnodes. The kernel console registers here at boot and backs the three
//! standard streams of every process.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::mount::FsInfo;
use super::{valloc, FsNode, Vnode, VnodeType};
use crate::error::{KernelError, KernelResult};

/// Byte-oriented device operations.
pub trait CharDev: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, buf: &[u8]) -> KernelResult<usize>;
}

/// Filesystem-private data of a devfs vnode.
pub enum DevNode {
    /// The mount root.
    Root,
    /// A registered character device.
    Device { dev: &'static dyn CharDev },
}

struct DevEntry {
    name: String,
    dev: &'static dyn CharDev,
}

static DEVLIST: Mutex<Vec<DevEntry>> = Mutex::new(Vec::new());

/// Register a character device under `name`.
pub fn register(name: &str, dev: &'static dyn CharDev) -> KernelResult<()> {
    let mut list = DEVLIST.lock();
    if list.iter().any(|e| e.name == name) {
        return Err(KernelError::Busy);
    }
    list.push(DevEntry {
        name: name.to_string(),
        dev,
    });
    Ok(())
}

impl DevNode {
    pub fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        let DevNode::Root = self else {
            return Err(KernelError::NotSupported);
        };
        let list = DEVLIST.lock();
        let entry = list
            .iter()
            .find(|e| e.name == name)
            .ok_or(KernelError::NotFound)?;
        Ok(valloc(
            VnodeType::CharDev,
            FsNode::Dev(DevNode::Device { dev: entry.dev }),
        ))
    }

    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        match self {
            DevNode::Device { dev } => dev.read(buf),
            DevNode::Root => Err(KernelError::NotSupported),
        }
    }

    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        match self {
            DevNode::Device { dev } => dev.write(buf),
            DevNode::Root => Err(KernelError::NotSupported),
        }
    }
}

/// Mount hook.
pub fn mount(_fs: &'static FsInfo) -> KernelResult<Arc<Vnode>> {
    Ok(valloc(VnodeType::Dir, FsNode::Dev(DevNode::Root)))
}

// ---------------------------------------------------------------------------
// Console device
// ---------------------------------------------------------------------------

struct ConsoleDev;

impl CharDev for ConsoleDev {
    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        // No line discipline in the core; reads drain nothing.
        Ok(0)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        Ok(crate::console::write_bytes(buf))
    }
}

static CONSOLE_DEV: ConsoleDev = ConsoleDev;

/// Register the kernel console under "console".
pub fn register_console() {
    if register("console", &CONSOLE_DEV).is_err() {
        log::warn!("devfs: console already registered");
    }
}

/// A console vnode without going through the mount table. Process
/// creation uses this to wire the standard streams.
pub fn console_vnode() -> Arc<Vnode> {
    valloc(
        VnodeType::CharDev,
        FsNode::Dev(DevNode::Device { dev: &CONSOLE_DEV }),
    )
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn console_vnode_accepts_writes() {
        let vp = console_vnode();
        assert_eq!(vp.vtype(), VnodeType::CharDev);
        let _guard = crate::console::CONSOLE_TEST_LOCK.lock();
        let n = vp.write(b"devfs says hi", 0).expect("console write");
        assert_eq!(n, 13);
    }

    #[test]
    fn duplicate_device_names_are_refused() {
        static DUP: ConsoleDev = ConsoleDev;
        register("testdup", &DUP).expect("first registration");
        assert_eq!(register("testdup", &DUP), Err(KernelError::Busy));
    }
}
