//! C3 — Inode Table: a fixed-capacity record vector, an open-addressed
//! `ino -> slot` index, and a free-slot list (spec §3/§4.3).
//!
//! Per spec §4.3, individual record fields are *not* guarded by a
//! per-record lock; synchronization for content fields is provided by
//! whichever dentry lock the caller already holds, except for the link
//! count, which is atomic. The table's own `RwLock` guards only the
//! structural data (slot occupancy, the ino index, the free list), so two
//! operations on unrelated inodes never serialize against each other here.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::core::error::{FsError, FsResult};
use crate::core::extent::{Extent, StorageMode, INLINE_EXTENT_CAPACITY};
use crate::core::util::now_secs;

pub const ROOT_INO: u32 = 1;
pub const MAX_LINKS: u16 = u16::MAX;

/// The in-memory inode record. `link_count` is atomic; every other field
/// is mutated only while the caller holds the owning dentry's write lock.
pub struct InodeRecord {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub xattr_head: u32,
    link_count: AtomicU16,
    pub content: Vec<Extent>,
    pub inline_data: Vec<u8>,
    pub storage_mode: StorageMode,
}

impl InodeRecord {
    /// Builds a record for recovery redo, which must recreate an inode's
    /// starting attributes from a logged INSERT without going through the
    /// normal allocation path.
    pub(crate) fn new_for_recovery(mode: u16, uid: u32, gid: u32) -> Self {
        Self::new(mode, uid, gid)
    }

    fn new(mode: u16, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Self {
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            xattr_head: 0,
            link_count: AtomicU16::new(1),
            content: Vec::new(),
            inline_data: Vec::new(),
            storage_mode: StorageMode::InlineData,
        }
    }

    pub fn link_count(&self) -> u16 {
        self.link_count.load(Ordering::Acquire)
    }

    fn checked_link(&self) -> FsResult<()> {
        loop {
            let cur = self.link_count.load(Ordering::Acquire);
            if cur >= MAX_LINKS {
                return Err(FsError::too_many_links("inode link count at maximum"));
            }
            if self
                .link_count
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Decrements the link count and returns whether it reached zero.
    fn checked_unlink(&self) -> bool {
        self.link_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn refresh_storage_mode(&mut self) {
        self.storage_mode = if !self.inline_data.is_empty() {
            StorageMode::InlineData
        } else if self.content.len() <= INLINE_EXTENT_CAPACITY {
            StorageMode::InlineExtents
        } else {
            StorageMode::ExtentTree
        };
    }
}

const EMPTY: u32 = u32::MAX;

struct TableMeta {
    hash_slots: Vec<u32>,
    hash_inos: Vec<u32>,
    used: usize,
    free_list: Vec<u32>,
}

impl TableMeta {
    fn with_capacity(cap: usize) -> Self {
        let table_cap = cap.next_power_of_two().max(16);
        Self {
            hash_slots: vec![EMPTY; table_cap],
            hash_inos: vec![0; table_cap],
            used: 0,
            free_list: Vec::new(),
        }
    }

    fn mask(&self) -> usize {
        self.hash_slots.len() - 1
    }

    fn find(&self, ino: u32) -> Option<u32> {
        let mask = self.mask();
        let mut i = (ino as usize).wrapping_mul(0x9E3779B1) & mask;
        loop {
            let slot = self.hash_slots[i];
            if slot == EMPTY {
                return None;
            }
            if self.hash_inos[i] == ino {
                return Some(slot);
            }
            i = (i + 1) & mask;
        }
    }

    fn insert(&mut self, ino: u32, slot: u32) {
        if self.used * 4 >= self.hash_slots.len() * 3 {
            self.grow();
        }
        let mask = self.mask();
        let mut i = (ino as usize).wrapping_mul(0x9E3779B1) & mask;
        while self.hash_slots[i] != EMPTY {
            i = (i + 1) & mask;
        }
        self.hash_slots[i] = slot;
        self.hash_inos[i] = ino;
        self.used += 1;
    }

    fn remove(&mut self, ino: u32) {
        let mask = self.mask();
        let mut i = (ino as usize).wrapping_mul(0x9E3779B1) & mask;
        loop {
            if self.hash_slots[i] == EMPTY {
                return;
            }
            if self.hash_inos[i] == ino {
                self.hash_slots[i] = EMPTY;
                self.used -= 1;
                // Re-insert the probe chain tail so lookups for other keys
                // sharing this bucket still terminate correctly.
                let mut j = (i + 1) & mask;
                while self.hash_slots[j] != EMPTY {
                    let disp_ino = self.hash_inos[j];
                    let disp_slot = self.hash_slots[j];
                    self.hash_slots[j] = EMPTY;
                    self.used -= 1;
                    self.insert(disp_ino, disp_slot);
                    j = (j + 1) & mask;
                }
                return;
            }
            i = (i + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let old_slots = std::mem::replace(&mut self.hash_slots, vec![EMPTY; self.hash_slots.len() * 2]);
        let old_inos = std::mem::replace(&mut self.hash_inos, vec![0; old_slots.len() * 2]);
        self.used = 0;
        let mask = self.hash_slots.len() - 1;
        for (slot, ino) in old_slots.into_iter().zip(old_inos) {
            if slot == EMPTY {
                continue;
            }
            let mut i = (ino as usize).wrapping_mul(0x9E3779B1) & mask;
            while self.hash_slots[i] != EMPTY {
                i = (i + 1) & mask;
            }
            self.hash_slots[i] = slot;
            self.hash_inos[i] = ino;
            self.used += 1;
        }
    }
}

struct Slot {
    record: std::cell::UnsafeCell<Option<InodeRecord>>,
}

unsafe impl Sync for Slot {}

pub struct InodeTable {
    slots: RwLock<Vec<Slot>>,
    meta: RwLock<TableMeta>,
    capacity: usize,
    next_ino: AtomicU32,
}

impl InodeTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot { record: std::cell::UnsafeCell::new(None) });
        }
        Self {
            slots: RwLock::new(slots),
            meta: RwLock::new(TableMeta::with_capacity(capacity)),
            capacity,
            next_ino: AtomicU32::new(ROOT_INO + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocates a fresh inode, reserving `ino == ROOT_INO` only if the
    /// table is empty (used by mkfs to place the root directory).
    pub fn allocate(&self, mode: u16, uid: u32, gid: u32) -> FsResult<u32> {
        let mut meta = self.meta.write();
        let slot_index = if let Some(s) = meta.free_list.pop() {
            s
        } else if meta.used < self.capacity {
            meta.used as u32
        } else {
            return Err(FsError::capacity_exceeded("inode table is full"));
        };
        let ino = self.next_ino.fetch_add(1, Ordering::AcqRel);

        let slots = self.slots.read();
        unsafe {
            *slots[slot_index as usize].record.get() = Some(InodeRecord::new(mode, uid, gid));
        }
        drop(slots);

        meta.insert(ino, slot_index);
        Ok(ino)
    }

    /// Inserts a record at a specific `ino`, bypassing the normal counter.
    /// Used only by recovery redo, which must recreate the exact inode
    /// number a committed transaction logged rather than mint a new one.
    pub fn insert_at(&self, ino: u32, record: InodeRecord) -> FsResult<()> {
        let mut meta = self.meta.write();
        if meta.find(ino).is_some() {
            return Err(FsError::exists("inode already present"));
        }
        let slot_index = if let Some(s) = meta.free_list.pop() {
            s
        } else if meta.used < self.capacity {
            meta.used as u32
        } else {
            return Err(FsError::capacity_exceeded("inode table is full"));
        };
        let slots = self.slots.read();
        unsafe {
            *slots[slot_index as usize].record.get() = Some(record);
        }
        drop(slots);
        meta.insert(ino, slot_index);
        if ino >= self.next_ino.load(Ordering::Acquire) {
            self.next_ino.store(ino + 1, Ordering::Release);
        }
        Ok(())
    }

    /// Reserves `ROOT_INO` explicitly; called once during mkfs.
    pub fn allocate_root(&self, mode: u16) -> FsResult<u32> {
        let mut meta = self.meta.write();
        if meta.find(ROOT_INO).is_some() {
            return Err(FsError::exists("root inode already allocated"));
        }
        let slot_index = meta.free_list.pop().unwrap_or(0);
        let slots = self.slots.read();
        unsafe {
            let record = InodeRecord::new(mode, 0, 0);
            // No "." / ".." dentries in this model (invariant 2 counts only
            // referencing dentries); root has none, so nlink starts at 1.
            *slots[slot_index as usize].record.get() = Some(record);
        }
        drop(slots);
        meta.insert(ROOT_INO, slot_index);
        Ok(ROOT_INO)
    }

    fn slot_for(&self, ino: u32) -> FsResult<u32> {
        self.meta
            .read()
            .find(ino)
            .ok_or_else(|| FsError::no_entry(format!("no such inode {ino}")))
    }

    /// Runs `f` against the record for `ino`. Caller must already hold
    /// whatever dentry lock serializes writers for this inode.
    pub fn read<R>(&self, ino: u32, f: impl FnOnce(&InodeRecord) -> R) -> FsResult<R> {
        let slot = self.slot_for(ino)?;
        let slots = self.slots.read();
        let cell = unsafe { &*slots[slot as usize].record.get() };
        match cell {
            Some(rec) => Ok(f(rec)),
            None => Err(FsError::no_entry(format!("no such inode {ino}"))),
        }
    }

    pub fn write<R>(&self, ino: u32, f: impl FnOnce(&mut InodeRecord) -> R) -> FsResult<R> {
        let slot = self.slot_for(ino)?;
        let slots = self.slots.read();
        let cell = unsafe { &mut *slots[slot as usize].record.get() };
        match cell {
            Some(rec) => Ok(f(rec)),
            None => Err(FsError::no_entry(format!("no such inode {ino}"))),
        }
    }

    pub fn link(&self, ino: u32) -> FsResult<()> {
        self.read(ino, |rec| rec.checked_link())?
    }

    /// Decrements the link count; if it reaches zero, frees the slot and
    /// returns `true` to tell the caller the inode's storage should be
    /// reclaimed by the allocator.
    pub fn unlink(&self, ino: u32) -> FsResult<bool> {
        let freed = self.read(ino, |rec| rec.checked_unlink())?;
        if freed {
            let slot = self.slot_for(ino)?;
            let mut meta = self.meta.write();
            let slots = self.slots.read();
            unsafe {
                *slots[slot as usize].record.get() = None;
            }
            drop(slots);
            meta.remove(ino);
            meta.free_list.push(slot);
        }
        Ok(freed)
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.meta.read().used, self.capacity)
    }

    /// The next inode number that would be handed out by `allocate`; used
    /// to persist the counter across a checkpoint.
    pub fn next_ino(&self) -> u32 {
        self.next_ino.load(Ordering::Acquire)
    }

    /// Snapshots every live record for persistence. Called only while the
    /// table is quiescent (checkpoint/unmount), so the per-ino read lock
    /// a live caller would normally take is not needed here.
    pub fn snapshot(&self) -> Vec<(u32, InodeSnapshot)> {
        let meta = self.meta.read();
        let slots = self.slots.read();
        let mut out = Vec::with_capacity(meta.used);
        for i in 0..meta.hash_slots.len() {
            let slot = meta.hash_slots[i];
            if slot == EMPTY {
                continue;
            }
            let ino = meta.hash_inos[i];
            let rec = unsafe { (*slots[slot as usize].record.get()).as_ref().unwrap() };
            out.push((ino, InodeSnapshot::from_record(rec)));
        }
        out
    }

    /// Rebuilds a table from a prior `snapshot()`, used on mount after an
    /// attach. `next_ino` must be at least one past the highest `ino` seen,
    /// so inode numbers are never reused across a restart.
    pub fn restore(capacity: usize, next_ino: u32, entries: Vec<(u32, InodeSnapshot)>) -> Self {
        let table = Self::new(capacity);
        table.next_ino.store(next_ino, Ordering::Release);
        let mut meta = table.meta.write();
        let slots = table.slots.read();
        for (i, (ino, snap)) in entries.into_iter().enumerate() {
            unsafe {
                *slots[i].record.get() = Some(snap.into_record());
            }
            meta.insert(ino, i as u32);
        }
        drop(slots);
        drop(meta);
        table
    }
}

/// Plain-data mirror of `InodeRecord`, used as the wire shape for the
/// structural snapshot written to `meta.bin`; exists because the atomic
/// link count isn't `Clone`.
#[derive(Debug, Clone)]
pub struct InodeSnapshot {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub xattr_head: u32,
    pub link_count: u16,
    pub content: Vec<Extent>,
    pub inline_data: Vec<u8>,
    pub storage_mode: StorageMode,
}

impl InodeSnapshot {
    pub(crate) fn from_record(rec: &InodeRecord) -> Self {
        Self {
            mode: rec.mode,
            uid: rec.uid,
            gid: rec.gid,
            size: rec.size,
            atime: rec.atime,
            mtime: rec.mtime,
            ctime: rec.ctime,
            xattr_head: rec.xattr_head,
            link_count: rec.link_count(),
            content: rec.content.clone(),
            inline_data: rec.inline_data.clone(),
            storage_mode: rec.storage_mode,
        }
    }

    pub(crate) fn into_record(self) -> InodeRecord {
        InodeRecord {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            xattr_head: self.xattr_head,
            link_count: AtomicU16::new(self.link_count),
            content: self.content,
            inline_data: self.inline_data,
            storage_mode: self.storage_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_read_round_trips() {
        let t = InodeTable::new(16);
        let ino = t.allocate(0o100644, 1000, 1000).unwrap();
        t.read(ino, |r| assert_eq!(r.uid, 1000)).unwrap();
    }

    #[test]
    fn link_count_tracks_correctly() {
        let t = InodeTable::new(16);
        let ino = t.allocate(0o100644, 0, 0).unwrap();
        t.link(ino).unwrap();
        t.read(ino, |r| assert_eq!(r.link_count(), 2)).unwrap();
        assert!(!t.unlink(ino).unwrap());
        assert!(t.unlink(ino).unwrap());
        assert!(t.read(ino, |_| ()).is_err());
    }

    #[test]
    fn freed_slot_is_reused_but_ino_is_not() {
        let t = InodeTable::new(4);
        let a = t.allocate(0o100644, 0, 0).unwrap();
        t.unlink(a).unwrap();
        let b = t.allocate(0o100644, 0, 0).unwrap();
        assert_ne!(a, b, "inode numbers must never be reused");
    }

    #[test]
    fn table_full_is_capacity_exceeded() {
        let t = InodeTable::new(2);
        t.allocate(0o100644, 0, 0).unwrap();
        t.allocate(0o100644, 0, 0).unwrap();
        assert_eq!(
            t.allocate(0o100644, 0, 0).unwrap_err().kind,
            crate::core::error::ErrorKind::CapacityExceeded
        );
    }

    #[test]
    fn too_many_links_is_rejected() {
        let t = InodeTable::new(4);
        let ino = t.allocate(0o100644, 0, 0).unwrap();
        t.read(ino, |r| r.link_count.store(MAX_LINKS, Ordering::Release)).unwrap();
        assert_eq!(t.link(ino).unwrap_err().kind, crate::core::error::ErrorKind::TooManyLinks);
    }
}
