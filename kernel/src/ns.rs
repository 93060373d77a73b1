//! System object namespace
//!
//! A chained open-addressed hash map keyed by FNV-1a of the object name.
//! Each map level has a fixed bucket array; when a bucket is taken the
//! entry spills into the next chained level.

use alloc::boxed::Box;
use alloc::string::{String, ToString};

use crate::error::{KernelError, KernelResult};

const NS_HM_ENTRIES: usize = 16;

/// Fowler-Noll-Vo (FNV-1a) hash.
pub fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for b in s.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

struct NsEntry<T> {
    name: String,
    data: T,
}

/// One level of the namespace map.
pub struct NsMap<T> {
    entries: [Option<NsEntry<T>>; NS_HM_ENTRIES],
    next: Option<Box<NsMap<T>>>,
}

impl<T> NsMap<T> {
    pub const fn new() -> Self {
        Self {
            entries: [const { None }; NS_HM_ENTRIES],
            next: None,
        }
    }

    /// Place an object under `name`. Duplicate names are refused.
    pub fn enter(&mut self, name: &str, data: T) -> KernelResult<()> {
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if self.lookup(name).is_some() {
            return Err(KernelError::Busy);
        }

        let key = (fnv1a(name) as usize) % NS_HM_ENTRIES;
        let mut level = self;
        loop {
            if level.entries[key].is_none() {
                level.entries[key] = Some(NsEntry {
                    name: name.to_string(),
                    data,
                });
                return Ok(());
            }
            level = &mut **level.next.get_or_insert_with(|| Box::new(NsMap::new()));
        }
    }

    /// Look an object up by name.
    pub fn lookup(&self, name: &str) -> Option<&T> {
        let key = (fnv1a(name) as usize) % NS_HM_ENTRIES;
        let mut level = Some(self);
        while let Some(map) = level {
            if let Some(entry) = &map.entries[key] {
                if entry.name == name {
                    return Some(&entry.data);
                }
            }
            level = map.next.as_deref();
        }
        None
    }
}

impl<T> Default for NsMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn enter_then_lookup() {
        let mut ns: NsMap<u32> = NsMap::new();
        ns.enter("input.kbd", 7).expect("fresh name enters");
        assert_eq!(ns.lookup("input.kbd"), Some(&7));
        assert_eq!(ns.lookup("input.mouse"), None);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut ns: NsMap<u32> = NsMap::new();
        ns.enter("fbdev", 1).expect("first");
        assert_eq!(ns.enter("fbdev", 2), Err(KernelError::Busy));
        assert_eq!(ns.lookup("fbdev"), Some(&1));
    }

    #[test]
    fn colliding_buckets_chain_to_the_next_level() {
        let mut ns: NsMap<u32> = NsMap::new();
        // More entries than buckets guarantees collisions somewhere.
        for i in 0..64u32 {
            let name = alloc::format!("obj{}", i);
            ns.enter(&name, i).expect("every distinct name fits");
        }
        for i in 0..64u32 {
            let name = alloc::format!("obj{}", i);
            assert_eq!(ns.lookup(&name), Some(&i));
        }
    }
}
