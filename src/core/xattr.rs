//! Extended attributes, specified only at the interface level: a
//! per-inode head pointer into a value pool, not a concrete linked-list
//! on-disk layout (spec §1 scope). `xattr_head == 0` means "no xattrs".
//!
//! The adapter's `xattr_get`/`xattr_set`/`xattr_list`/`xattr_remove` calls
//! are backed by a simple in-memory map keyed by inode number, which is
//! enough to satisfy the interface contract without committing to a wire
//! format the spec deliberately leaves unspecified.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::error::{FsError, FsResult};

const MAX_XATTR_NAME_LEN: usize = 255;
const MAX_XATTR_VALUE_LEN: usize = 65536;

#[derive(Default)]
pub struct XattrStore {
    by_ino: RwLock<HashMap<u32, HashMap<Vec<u8>, Vec<u8>>>>,
}

impl XattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ino: u32, name: &[u8]) -> FsResult<Vec<u8>> {
        self.by_ino
            .read()
            .get(&ino)
            .and_then(|attrs| attrs.get(name))
            .cloned()
            .ok_or_else(|| FsError::no_entry("no such extended attribute"))
    }

    pub fn set(&self, ino: u32, name: &[u8], value: &[u8]) -> FsResult<()> {
        if name.is_empty() || name.len() > MAX_XATTR_NAME_LEN {
            return Err(FsError::name_too_long("xattr name length out of range"));
        }
        if value.len() > MAX_XATTR_VALUE_LEN {
            return Err(FsError::invalid_argument("xattr value too large"));
        }
        self.by_ino.write().entry(ino).or_default().insert(name.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn list(&self, ino: u32) -> Vec<Vec<u8>> {
        self.by_ino
            .read()
            .get(&ino)
            .map(|attrs| attrs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, ino: u32, name: &[u8]) -> FsResult<()> {
        let mut map = self.by_ino.write();
        match map.get_mut(&ino).and_then(|attrs| attrs.remove(name)) {
            Some(_) => Ok(()),
            None => Err(FsError::no_entry("no such extended attribute")),
        }
    }

    /// Drops every attribute for `ino`; called when the inode is unlinked.
    pub fn purge(&self, ino: u32) {
        self.by_ino.write().remove(&ino);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trips() {
        let store = XattrStore::new();
        store.set(1, b"user.note", b"hello").unwrap();
        assert_eq!(store.get(1, b"user.note").unwrap(), b"hello");
        assert_eq!(store.list(1), vec![b"user.note".to_vec()]);
        store.remove(1, b"user.note").unwrap();
        assert!(store.get(1, b"user.note").is_err());
    }

    #[test]
    fn purge_drops_everything_for_an_inode() {
        let store = XattrStore::new();
        store.set(2, b"user.a", b"1").unwrap();
        store.set(2, b"user.b", b"2").unwrap();
        store.purge(2);
        assert!(store.list(2).is_empty());
    }
}
