//! C5 — Directory Tree: an arena of dentry nodes, each carrying its own
//! reader/writer lock, with a sorted children-index for fast lookup (spec
//! §3/§4.5). Concurrency safety rests entirely on the global lock-ordering
//! rule from spec §5: acquire locks shallow-to-deep, and among siblings in
//! ascending name order, and — for two-parent operations like rename —
//! in ascending dentry-index order. This module enforces none of that by
//! construction; callers (the adapter layer) must follow the order.

use parking_lot::RwLock;

use crate::core::error::{FsError, FsResult};
use crate::core::strtab::{ByteArena, StringTable};

pub const ROOT_DENTRY: u32 = 0;
pub const DENTRY_NONE: u32 = u32::MAX;

/// Children are searched linearly below this count and by binary search
/// above it (spec §4.5 "linear search for small directories").
const LINEAR_SEARCH_THRESHOLD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

struct Child {
    name_handle: u32,
    dentry: u32,
}

/// A single node's mutable content, behind the node's own lock.
pub struct DentryNode {
    pub parent: u32,
    pub name_handle: u32,
    pub ino: u32,
    pub kind: FileKind,
    children: Vec<Child>,
}

impl DentryNode {
    fn new(parent: u32, name_handle: u32, ino: u32, kind: FileKind) -> Self {
        Self { parent, name_handle, ino, kind, children: Vec::new() }
    }

    fn find_index(&self, name_handle: u32, names: &dyn Fn(u32) -> FsResult<Vec<u8>>) -> FsResult<Result<usize, usize>> {
        if self.children.len() <= LINEAR_SEARCH_THRESHOLD {
            for (i, c) in self.children.iter().enumerate() {
                if c.name_handle == name_handle {
                    return Ok(Ok(i));
                }
            }
            // preserve sort order for the eventual switch to binary search
            let target = names(name_handle)?;
            let pos = self
                .children
                .iter()
                .position(|c| names(c.name_handle).map(|n| n > target).unwrap_or(false))
                .unwrap_or(self.children.len());
            return Ok(Err(pos));
        }
        let target = names(name_handle)?;
        let mut lo = 0usize;
        let mut hi = self.children.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_name = names(self.children[mid].name_handle)?;
            if mid_name == target {
                return Ok(Ok(mid));
            } else if mid_name < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(Err(lo))
    }
}

struct Node {
    lock: RwLock<()>,
    data: std::cell::UnsafeCell<Option<DentryNode>>,
}

unsafe impl Sync for Node {}

pub struct DentryLockGuard<'a> {
    _guard: parking_lot::RwLockReadGuard<'a, ()>,
    tree: &'a DentryTree,
    index: u32,
}

impl<'a> std::ops::Deref for DentryLockGuard<'a> {
    type Target = DentryNode;
    fn deref(&self) -> &DentryNode {
        unsafe { (*self.tree.nodes[self.index as usize].data.get()).as_ref().unwrap() }
    }
}

pub struct DentryWriteGuard<'a> {
    _guard: parking_lot::RwLockWriteGuard<'a, ()>,
    tree: &'a DentryTree,
    index: u32,
}

impl<'a> std::ops::Deref for DentryWriteGuard<'a> {
    type Target = DentryNode;
    fn deref(&self) -> &DentryNode {
        unsafe { (*self.tree.nodes[self.index as usize].data.get()).as_ref().unwrap() }
    }
}

impl<'a> std::ops::DerefMut for DentryWriteGuard<'a> {
    fn deref_mut(&mut self) -> &mut DentryNode {
        unsafe { (*self.tree.nodes[self.index as usize].data.get()).as_mut().unwrap() }
    }
}

pub struct DentryTree {
    /// Arena growth (new node push) is guarded by this tree-level lock,
    /// taken for reading on ordinary path walks and for writing only when
    /// the arena itself must grow (spec §4.5: "a tree-level lock guards
    /// arena growth, not per-node content").
    arena_lock: RwLock<()>,
    nodes: Vec<Node>,
    free_list: RwLock<Vec<u32>>,
}

impl DentryTree {
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            nodes.push(Node { lock: RwLock::new(()), data: std::cell::UnsafeCell::new(None) });
        }
        Self { arena_lock: RwLock::new(()), nodes, free_list: RwLock::new(Vec::new()) }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Places the root directory at index `ROOT_DENTRY`. Called once by
    /// mkfs.
    pub fn init_root(&self, ino: u32) -> FsResult<()> {
        let _arena = self.arena_lock.write();
        unsafe {
            *self.nodes[ROOT_DENTRY as usize].data.get() =
                Some(DentryNode::new(DENTRY_NONE, 0, ino, FileKind::Directory));
        }
        Ok(())
    }

    fn alloc_index(&self) -> FsResult<u32> {
        if let Some(i) = self.free_list.write().pop() {
            return Ok(i);
        }
        let _arena = self.arena_lock.write();
        // Re-check under the write lock: another thread may have freed a
        // node while we waited.
        if let Some(i) = self.free_list.write().pop() {
            return Ok(i);
        }
        for (i, n) in self.nodes.iter().enumerate() {
            if i == ROOT_DENTRY as usize {
                continue;
            }
            let data = unsafe { &*n.data.get() };
            if data.is_none() {
                return Ok(i as u32);
            }
        }
        Err(FsError::capacity_exceeded("directory node arena is full"))
    }

    pub fn lock_read(&self, index: u32) -> DentryLockGuard<'_> {
        let guard = self.nodes[index as usize].lock.read();
        DentryLockGuard { _guard: guard, tree: self, index }
    }

    pub fn lock_write(&self, index: u32) -> DentryWriteGuard<'_> {
        let guard = self.nodes[index as usize].lock.write();
        DentryWriteGuard { _guard: guard, tree: self, index }
    }

    /// Looks up `name` among `parent_node`'s children. Caller must hold at
    /// least a read lock on `parent_node`. Interns `name` first (interning
    /// is idempotent, so this is safe to call for names that may or may
    /// not already exist).
    pub fn lookup_child<A: ByteArena>(
        &self,
        parent_node: &DentryNode,
        strtab: &mut StringTable<A>,
        name: &[u8],
    ) -> FsResult<Option<u32>> {
        let name_handle = strtab.intern(name)?;
        let names = |h: u32| -> FsResult<Vec<u8>> { Ok(strtab.lookup(h)?.to_vec()) };
        match parent_node.find_index(name_handle, &names)? {
            Ok(i) => Ok(Some(parent_node.children[i].dentry)),
            Err(_) => Ok(None),
        }
    }

    /// Inserts a new child under a write-locked `parent`, given the child's
    /// already-interned `name_handle`. Returns the new child's dentry
    /// index.
    pub fn insert_child(
        &self,
        parent: &mut DentryWriteGuard<'_>,
        name_handle: u32,
        ino: u32,
        kind: FileKind,
        names: &dyn Fn(u32) -> FsResult<Vec<u8>>,
        parent_index: u32,
    ) -> FsResult<u32> {
        if let Ok(_) = parent.find_index(name_handle, names)? {
            return Err(FsError::exists("name already present in directory"));
        }
        let new_index = self.alloc_index()?;
        unsafe {
            *self.nodes[new_index as usize].data.get() =
                Some(DentryNode::new(parent_index, name_handle, ino, kind));
        }
        let pos = match parent.find_index(name_handle, names)? {
            Ok(i) | Err(i) => i,
        };
        parent.children.insert(pos, Child { name_handle, dentry: new_index });
        Ok(new_index)
    }

    /// Removes `name_handle` from a write-locked `parent`. Returns the
    /// removed child's dentry index so the caller can free the inode.
    pub fn remove_child(
        &self,
        parent: &mut DentryWriteGuard<'_>,
        name_handle: u32,
        names: &dyn Fn(u32) -> FsResult<Vec<u8>>,
    ) -> FsResult<u32> {
        let pos = match parent.find_index(name_handle, names)? {
            Ok(i) => i,
            Err(_) => return Err(FsError::no_entry("name not present in directory")),
        };
        let child = parent.children.remove(pos);
        self.free_list.write().push(child.dentry);
        unsafe {
            *self.nodes[child.dentry as usize].data.get() = None;
        }
        Ok(child.dentry)
    }

    /// Renames a child within a single write-locked directory, without
    /// touching its dentry index (so its own children, if any, stay valid).
    pub fn rename_within(
        &self,
        parent: &mut DentryWriteGuard<'_>,
        old_name_handle: u32,
        new_name_handle: u32,
        names: &dyn Fn(u32) -> FsResult<Vec<u8>>,
    ) -> FsResult<u32> {
        if old_name_handle != new_name_handle {
            if let Ok(_) = parent.find_index(new_name_handle, names)? {
                return Err(FsError::exists("rename target already exists"));
            }
        }
        let pos = match parent.find_index(old_name_handle, names)? {
            Ok(i) => i,
            Err(_) => return Err(FsError::no_entry("rename source does not exist")),
        };
        let moved = parent.children.remove(pos);
        unsafe {
            (*self.nodes[moved.dentry as usize].data.get()).as_mut().unwrap().name_handle = new_name_handle;
        }
        let ins_pos = match parent.find_index(new_name_handle, names)? {
            Ok(i) | Err(i) => i,
        };
        parent.children.insert(ins_pos, Child { name_handle: new_name_handle, dentry: moved.dentry });
        Ok(moved.dentry)
    }

    /// Moves a child from `old_parent` to `new_parent` under a new name.
    /// The moved node keeps its dentry index — only its `parent`/
    /// `name_handle` fields and both parents' children vectors change — so
    /// a directory being renamed keeps its own children intact.
    pub fn move_child(
        &self,
        old_parent: &mut DentryWriteGuard<'_>,
        new_parent: &mut DentryWriteGuard<'_>,
        old_name_handle: u32,
        new_name_handle: u32,
        new_parent_index: u32,
        names: &dyn Fn(u32) -> FsResult<Vec<u8>>,
    ) -> FsResult<u32> {
        if let Ok(_) = new_parent.find_index(new_name_handle, names)? {
            return Err(FsError::exists("rename target already exists"));
        }
        let pos = match old_parent.find_index(old_name_handle, names)? {
            Ok(i) => i,
            Err(_) => return Err(FsError::no_entry("rename source does not exist")),
        };
        let moved = old_parent.children.remove(pos);
        unsafe {
            let node = (*self.nodes[moved.dentry as usize].data.get()).as_mut().unwrap();
            node.parent = new_parent_index;
            node.name_handle = new_name_handle;
        }
        let ins_pos = match new_parent.find_index(new_name_handle, names)? {
            Ok(i) | Err(i) => i,
        };
        new_parent.children.insert(ins_pos, Child { name_handle: new_name_handle, dentry: moved.dentry });
        Ok(moved.dentry)
    }

    pub fn is_empty_dir(node: &DentryNode) -> bool {
        node.children.is_empty()
    }

    pub fn children_of(node: &DentryNode) -> Vec<(u32, u32)> {
        node.children.iter().map(|c| (c.name_handle, c.dentry)).collect()
    }

    /// Snapshots every live node for persistence. Called only while the
    /// tree is quiescent (checkpoint/unmount).
    pub fn snapshot(&self) -> Vec<(u32, DentrySnapshot)> {
        let mut out = Vec::new();
        for (i, n) in self.nodes.iter().enumerate() {
            let data = unsafe { &*n.data.get() };
            if let Some(node) = data {
                out.push((
                    i as u32,
                    DentrySnapshot {
                        parent: node.parent,
                        name_handle: node.name_handle,
                        ino: node.ino,
                        kind: node.kind,
                        children: node.children.iter().map(|c| (c.name_handle, c.dentry)).collect(),
                    },
                ));
            }
        }
        out
    }

    /// Rebuilds a tree from a prior `snapshot()`, placing each node back at
    /// its original arena index so existing dentry-index references (e.g.
    /// inside other nodes' `children`) stay valid.
    pub fn restore(capacity: usize, entries: Vec<(u32, DentrySnapshot)>) -> Self {
        let tree = Self::new(capacity);
        let occupied: std::collections::HashSet<u32> = entries.iter().map(|(i, _)| *i).collect();
        for (index, snap) in entries {
            let node = DentryNode {
                parent: snap.parent,
                name_handle: snap.name_handle,
                ino: snap.ino,
                kind: snap.kind,
                children: snap.children.into_iter().map(|(name_handle, dentry)| Child { name_handle, dentry }).collect(),
            };
            unsafe {
                *tree.nodes[index as usize].data.get() = Some(node);
            }
        }
        let free: Vec<u32> = (0..tree.nodes.len() as u32).filter(|i| !occupied.contains(i)).collect();
        *tree.free_list.write() = free;
        tree
    }
}

/// Plain-data mirror of `DentryNode`, used as the wire shape for the
/// structural snapshot written to `meta.bin`.
#[derive(Debug, Clone)]
pub struct DentrySnapshot {
    pub parent: u32,
    pub name_handle: u32,
    pub ino: u32,
    pub kind: FileKind,
    pub children: Vec<(u32, u32)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strtab::OwnedArena;

    fn names_fn<'a, A: ByteArena>(strtab: &'a StringTable<A>) -> impl Fn(u32) -> FsResult<Vec<u8>> + 'a {
        move |h: u32| Ok(strtab.lookup(h)?.to_vec())
    }

    #[test]
    fn insert_find_remove_round_trips() {
        let tree = DentryTree::new(16);
        let mut strtab = StringTable::new(OwnedArena::new());
        tree.init_root(1).unwrap();

        let name_handle = strtab.intern(b"foo.txt").unwrap();
        let names = names_fn(&strtab);
        let child_index = {
            let mut root = tree.lock_write(ROOT_DENTRY);
            tree.insert_child(&mut root, name_handle, 2, FileKind::Regular, &names, ROOT_DENTRY).unwrap()
        };

        {
            let root = tree.lock_read(ROOT_DENTRY);
            let found = root
                .find_index(name_handle, &names)
                .unwrap()
                .ok()
                .map(|i| root.children[i].dentry);
            assert_eq!(found, Some(child_index));
        }

        {
            let mut root = tree.lock_write(ROOT_DENTRY);
            let removed = tree.remove_child(&mut root, name_handle, &names).unwrap();
            assert_eq!(removed, child_index);
            assert!(DentryTree::is_empty_dir(&root));
        }
    }

    #[test]
    fn duplicate_insert_is_exists_error() {
        let tree = DentryTree::new(16);
        let mut strtab = StringTable::new(OwnedArena::new());
        tree.init_root(1).unwrap();
        let name_handle = strtab.intern(b"dup").unwrap();
        let names = names_fn(&strtab);
        {
            let mut root = tree.lock_write(ROOT_DENTRY);
            tree.insert_child(&mut root, name_handle, 2, FileKind::Regular, &names, ROOT_DENTRY).unwrap();
        }
        let mut root = tree.lock_write(ROOT_DENTRY);
        assert_eq!(
            tree.insert_child(&mut root, name_handle, 3, FileKind::Regular, &names, ROOT_DENTRY)
                .unwrap_err()
                .kind,
            crate::core::error::ErrorKind::Exists
        );
    }

    #[test]
    fn many_children_stay_sorted_for_binary_search() {
        let tree = DentryTree::new(64);
        let mut strtab = StringTable::new(OwnedArena::new());
        tree.init_root(1).unwrap();
        let mut handles = Vec::new();
        for i in 0..20 {
            let h = strtab.intern(format!("f{i:02}").as_bytes()).unwrap();
            handles.push(h);
        }
        let names = names_fn(&strtab);
        let mut root = tree.lock_write(ROOT_DENTRY);
        for (i, h) in handles.iter().enumerate() {
            tree.insert_child(&mut root, *h, i as u32 + 2, FileKind::Regular, &names, ROOT_DENTRY).unwrap();
        }
        let mut last = Vec::new();
        for c in &root.children {
            let n = strtab.lookup(c.name_handle).unwrap().to_vec();
            assert!(n >= last);
            last = n;
        }
    }

    #[test]
    fn rename_within_same_directory_preserves_index() {
        let tree = DentryTree::new(16);
        let mut strtab = StringTable::new(OwnedArena::new());
        tree.init_root(1).unwrap();
        let old_handle = strtab.intern(b"old.txt").unwrap();
        let new_handle = strtab.intern(b"new.txt").unwrap();
        let names = names_fn(&strtab);

        let mut root = tree.lock_write(ROOT_DENTRY);
        let child_index = tree.insert_child(&mut root, old_handle, 2, FileKind::Regular, &names, ROOT_DENTRY).unwrap();
        let moved = tree.rename_within(&mut root, old_handle, new_handle, &names).unwrap();
        assert_eq!(moved, child_index);
        assert!(root.find_index(old_handle, &names).unwrap().is_err());
        assert_eq!(root.find_index(new_handle, &names).unwrap().ok(), Some(0));
    }

    #[test]
    fn move_child_across_directories_preserves_grandchildren() {
        let tree = DentryTree::new(16);
        let mut strtab = StringTable::new(OwnedArena::new());
        tree.init_root(1).unwrap();
        let dir_name = strtab.intern(b"sub").unwrap();
        let other_name = strtab.intern(b"other").unwrap();
        let grandchild_name = strtab.intern(b"inner.txt").unwrap();
        let moved_name = strtab.intern(b"moved").unwrap();
        let names = names_fn(&strtab);

        let (sub_index, other_index) = {
            let mut root = tree.lock_write(ROOT_DENTRY);
            let sub = tree.insert_child(&mut root, dir_name, 2, FileKind::Directory, &names, ROOT_DENTRY).unwrap();
            let other = tree.insert_child(&mut root, other_name, 3, FileKind::Directory, &names, ROOT_DENTRY).unwrap();
            (sub, other)
        };
        {
            let mut sub = tree.lock_write(sub_index);
            tree.insert_child(&mut sub, grandchild_name, 4, FileKind::Regular, &names, sub_index).unwrap();
        }

        {
            let mut root = tree.lock_write(ROOT_DENTRY);
            let mut other = tree.lock_write(other_index);
            let moved = tree.move_child(&mut root, &mut other, dir_name, moved_name, other_index, &names).unwrap();
            assert_eq!(moved, sub_index);
        }

        let moved_node = tree.lock_read(sub_index);
        assert_eq!(moved_node.parent, other_index);
        assert_eq!(DentryTree::children_of(&moved_node).len(), 1);
    }
}
