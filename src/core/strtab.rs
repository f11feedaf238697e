//! C1 — String Table: an FNV-1a open-addressed intern table over a
//! contiguous, length-prefixed byte arena (spec §4.1).
//!
//! The hash index is purely in-memory and rebuilt from the arena on attach;
//! only the arena itself is durable. Two arena backings are supported: an
//! owned, growable `Vec<u8>` for freestanding/test use, and a fixed-size
//! binder-owned region carved out of a mapped file, which fails with
//! `NoSpace` instead of reallocating.

use crate::core::error::{FsError, FsResult};
use crate::core::util::fnv1a;

pub const INVALID_HANDLE: u32 = u32::MAX;
pub const MAX_NAME_LEN: usize = 255;

/// Backing store for the interned-string bytes. `append` writes a new blob
/// and returns the offset it was written at.
pub trait ByteArena {
    fn as_slice(&self) -> &[u8];
    fn append(&mut self, bytes: &[u8]) -> FsResult<u32>;
}

/// Growable, heap-owned arena. Used when the string table is not bound to
/// a mapped file (tests, or a future non-mmap backend).
#[derive(Default)]
pub struct OwnedArena(Vec<u8>);

impl OwnedArena {
    pub fn new() -> Self {
        Self(Vec::new())
    }
}

impl ByteArena for OwnedArena {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn append(&mut self, bytes: &[u8]) -> FsResult<u32> {
        let offset = self.0.len();
        if offset + bytes.len() > u32::MAX as usize {
            return Err(FsError::no_space("string arena exceeds addressable range"));
        }
        self.0.extend_from_slice(bytes);
        Ok(offset as u32)
    }
}

/// Fixed-capacity arena over a binder-owned byte region (a mapped file's
/// bytes). Never grows; `append` past capacity is `NoSpace`.
///
/// Holds a raw pointer rather than a borrow, the same non-lifetime-tied
/// shape as `alloc::BlockRegion`, so it can be owned long-term by a
/// `StringTable` alongside the `memmap2::MmapMut` that actually owns the
/// bytes (kept alive elsewhere, by the persistence binder).
pub struct FixedArena {
    ptr: *mut u8,
    cap: usize,
    len: usize,
}

unsafe impl Send for FixedArena {}
unsafe impl Sync for FixedArena {}

impl FixedArena {
    /// `len` is the number of already-occupied bytes at the front of the
    /// region (nonzero when attaching to an existing image).
    pub fn from_mmap(mmap: &mut memmap2::MmapMut, len: usize) -> Self {
        Self { ptr: mmap.as_mut_ptr(), cap: mmap.len(), len }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl ByteArena for FixedArena {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn append(&mut self, bytes: &[u8]) -> FsResult<u32> {
        let end = self.len + bytes.len();
        if end > self.cap {
            return Err(FsError::no_space("string table region is full"));
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(self.len), bytes.len()) };
        dst.copy_from_slice(bytes);
        let offset = self.len;
        self.len = end;
        Ok(offset as u32)
    }
}

/// Open-addressed, linear-probed `hash -> handle` index, rebuilt on attach.
struct HashIndex {
    slots: Vec<u32>,
    count: usize,
}

impl HashIndex {
    fn with_capacity(cap: usize) -> Self {
        let cap = cap.next_power_of_two().max(16);
        Self { slots: vec![INVALID_HANDLE; cap], count: 0 }
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn needs_grow(&self) -> bool {
        self.count * 4 >= self.slots.len() * 3
    }
}

pub struct StringTable<A: ByteArena> {
    arena: A,
    index: HashIndex,
}

impl<A: ByteArena> StringTable<A> {
    pub fn new(arena: A) -> Self {
        Self { arena, index: HashIndex::with_capacity(64) }
    }

    /// Rebuilds the hash index by rescanning the arena; used when attaching
    /// to an arena that already holds entries (binder attach path).
    pub fn rebuild_index(&mut self) {
        let mut offset = 0u32;
        let mut handles = Vec::new();
        let slice = self.arena.as_slice();
        while (offset as usize) < slice.len() {
            let len = slice[offset as usize] as usize;
            handles.push(offset);
            offset += 1 + len as u32;
        }
        self.index = HashIndex::with_capacity(handles.len() * 2);
        for h in handles {
            let name = self.read_at(h);
            let hash = fnv1a(name);
            self.probe_insert(hash, h);
        }
    }

    fn read_at(&self, handle: u32) -> &[u8] {
        let slice = self.arena.as_slice();
        let off = handle as usize;
        let len = slice[off] as usize;
        &slice[off + 1..off + 1 + len]
    }

    fn probe_insert(&mut self, hash: u64, handle: u32) {
        let mask = self.index.mask();
        let mut i = (hash as usize) & mask;
        loop {
            if self.index.slots[i] == INVALID_HANDLE {
                self.index.slots[i] = handle;
                self.index.count += 1;
                return;
            }
            i = (i + 1) & mask;
        }
    }

    /// Interns `name`, returning its handle. Re-interning an existing name
    /// returns the same handle without writing to the arena again.
    pub fn intern(&mut self, name: &[u8]) -> FsResult<u32> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(FsError::name_too_long(format!(
                "name length {} exceeds {}",
                name.len(),
                MAX_NAME_LEN
            )));
        }
        let hash = fnv1a(name);
        let mask = self.index.mask();
        let mut i = (hash as usize) & mask;
        loop {
            let slot = self.index.slots[i];
            if slot == INVALID_HANDLE {
                break;
            }
            if self.read_at(slot) == name {
                return Ok(slot);
            }
            i = (i + 1) & mask;
        }

        let mut record = Vec::with_capacity(1 + name.len());
        record.push(name.len() as u8);
        record.extend_from_slice(name);
        let handle = self.arena.append(&record)?;

        if self.index.needs_grow() {
            self.index.grow_reinsert(&self.arena);
        }
        self.probe_insert(hash, handle);
        Ok(handle)
    }

    /// Looks up the bytes for a previously interned handle.
    pub fn lookup(&self, handle: u32) -> FsResult<&[u8]> {
        let slice = self.arena.as_slice();
        let off = handle as usize;
        if off >= slice.len() {
            return Err(FsError::invalid_argument("string handle out of range"));
        }
        Ok(self.read_at(handle))
    }

    pub fn stats(&self) -> StrtabStats {
        StrtabStats { entries: self.index.count, arena_bytes: self.arena.as_slice().len() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StrtabStats {
    pub entries: usize,
    pub arena_bytes: usize,
}

impl HashIndex {
    /// Doubles the table and reinserts every live handle, recomputing
    /// hashes from the arena (used instead of `grow`, which needs hashes
    /// it doesn't have).
    fn grow_reinsert<A: ByteArena>(&mut self, arena: &A) {
        let old = std::mem::replace(&mut self.slots, vec![INVALID_HANDLE; self.slots.len() * 2]);
        self.count = 0;
        let mask = self.slots.len() - 1;
        for h in old {
            if h == INVALID_HANDLE {
                continue;
            }
            let slice = arena.as_slice();
            let off = h as usize;
            let len = slice[off] as usize;
            let name = &slice[off + 1..off + 1 + len];
            let hash = fnv1a(name);
            let mut i = (hash as usize) & mask;
            loop {
                if self.slots[i] == INVALID_HANDLE {
                    self.slots[i] = h;
                    self.count += 1;
                    break;
                }
                i = (i + 1) & mask;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut t = StringTable::new(OwnedArena::new());
        let a = t.intern(b"README.md").unwrap();
        let b = t.intern(b"README.md").unwrap();
        assert_eq!(a, b);
        assert_eq!(t.lookup(a).unwrap(), b"README.md");
    }

    #[test]
    fn distinct_names_get_distinct_handles() {
        let mut t = StringTable::new(OwnedArena::new());
        let a = t.intern(b"foo").unwrap();
        let b = t.intern(b"bar").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn name_too_long_is_rejected() {
        let mut t = StringTable::new(OwnedArena::new());
        let name = vec![b'x'; MAX_NAME_LEN + 1];
        assert_eq!(t.intern(&name).unwrap_err().kind, crate::core::error::ErrorKind::NameTooLong);
    }

    #[test]
    fn fixed_arena_reports_no_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strtab.bin");
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path).unwrap();
        file.set_len(8).unwrap();
        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file).unwrap() };
        let mut t = StringTable::new(FixedArena::from_mmap(&mut mmap, 0));
        assert!(t.intern(b"this name does not fit").is_err());
    }

    #[test]
    fn survives_many_insertions_triggering_growth() {
        let mut t = StringTable::new(OwnedArena::new());
        let mut handles = Vec::new();
        for i in 0..500 {
            let name = format!("entry-{i}");
            handles.push((name.clone(), t.intern(name.as_bytes()).unwrap()));
        }
        for (name, handle) in handles {
            assert_eq!(t.lookup(handle).unwrap(), name.as_bytes());
        }
    }

    proptest::proptest! {
        #[test]
        fn intern_then_lookup_round_trips(name in proptest::collection::vec(1u8..=255, 1..MAX_NAME_LEN)) {
            let mut t = StringTable::new(OwnedArena::new());
            let handle = t.intern(&name).unwrap();
            proptest::prop_assert_eq!(t.lookup(handle).unwrap(), name.as_slice());
        }

        #[test]
        fn interning_the_same_bytes_twice_yields_the_same_handle(
            name in proptest::collection::vec(1u8..=255, 1..MAX_NAME_LEN)
        ) {
            let mut t = StringTable::new(OwnedArena::new());
            let a = t.intern(&name).unwrap();
            let b = t.intern(&name).unwrap();
            proptest::prop_assert_eq!(a, b);
        }
    }
}
