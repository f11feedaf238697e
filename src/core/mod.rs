//! Core engine: ties the string table (C1), block allocator (C2), inode
//! table (C3), extent map (C4), directory tree (C5), write-ahead log (C6),
//! recovery engine (C7) and persistence binder (C8) into one mounted
//! filesystem instance. This module owns `mount`/`unmount`/mkfs and the
//! structural snapshot format the binder's `meta.bin` slot carries; the
//! POSIX-shaped operations themselves live in `adapter`.

pub mod adapter;
pub mod alloc;
pub mod binder;
pub mod dentry;
pub mod error;
pub mod extent;
pub mod inode;
pub mod recovery;
pub mod strtab;
pub mod util;
pub mod wal;
pub mod xattr;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::core::alloc::BlockAllocator;
use crate::core::binder::{Binder, Layout};
use crate::core::dentry::{DentryTree, FileKind, ROOT_DENTRY};
use crate::core::error::{FsError, FsResult};
use crate::core::inode::{InodeRecord, InodeSnapshot, InodeTable, ROOT_INO};
use crate::core::recovery::RecoveryEngine;
use crate::core::strtab::{FixedArena, StringTable};
use crate::core::wal::Wal;
use crate::core::xattr::XattrStore;

/// Mode bits for the root directory created at mkfs time.
const ROOT_MODE: u16 = 0o040_755;

/// Parameters for `mount`: backing directory plus the sizes to format with
/// on a fresh mkfs (ignored, in favor of the persisted superblock, when
/// attaching to an existing data directory).
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub data_dir: PathBuf,
    pub layout: Layout,
}

impl MountConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), layout: Layout::default() }
    }
}

/// A mounted filesystem instance. One per `mount()` call; `unmount`
/// consumes it.
pub struct RazorFs {
    pub(crate) strtab: Mutex<StringTable<FixedArena>>,
    pub(crate) alloc: BlockAllocator,
    pub(crate) inodes: InodeTable,
    pub(crate) dentries: DentryTree,
    pub(crate) wal: Wal,
    pub(crate) xattrs: XattrStore,
    /// Maps a directory's inode number to the dentry index that owns it.
    /// Directories are never hardlinked, so this is always one-to-one;
    /// `adapter` uses it to resolve the `parent_ino` the §6.1 API takes
    /// into the dentry index the tree actually operates on.
    pub(crate) dir_index: RwLock<HashMap<u32, u32>>,
    binder: Mutex<Binder>,
}

/// Scans every live directory dentry to rebuild the ino→index map; called
/// once at mount time, while the tree is still quiescent.
fn build_dir_index(dentries: &DentryTree) -> HashMap<u32, u32> {
    dentries
        .snapshot()
        .into_iter()
        .filter(|(_, snap)| snap.kind == FileKind::Directory)
        .map(|(index, snap)| (snap.ino, index))
        .collect()
}

impl RazorFs {
    /// Attaches to `cfg.data_dir` if it already holds a formatted image,
    /// otherwise formats a fresh one. Runs recovery before returning
    /// whenever the attached WAL has uncommitted content.
    pub fn mount(cfg: MountConfig) -> FsResult<Self> {
        if superblock_exists(&cfg.data_dir) {
            Self::mount_existing(&cfg.data_dir)
        } else {
            Self::mkfs(&cfg.data_dir, cfg.layout)
        }
    }

    fn mkfs(data_dir: &Path, layout: Layout) -> FsResult<Self> {
        log::info!("mkfs: formatting a fresh data directory at {data_dir:?}");
        let mut binder = Binder::create(data_dir, layout)?;

        let strtab = StringTable::new(binder.strtab_arena(0));
        let alloc = BlockAllocator::create(binder.block_region(), layout.block_size as usize, layout.total_blocks);
        let inodes = InodeTable::new(layout.inode_capacity as usize);
        let dentries = DentryTree::new(layout.dentry_capacity as usize);
        let wal = Wal::create(binder.wal_region())?;
        binder.save_wal_header(&wal.header_snapshot())?;

        inodes.allocate_root(ROOT_MODE)?;
        dentries.init_root(ROOT_INO)?;
        let dir_index = RwLock::new(HashMap::from([(ROOT_INO, ROOT_DENTRY)]));

        let fs = Self { strtab: Mutex::new(strtab), alloc, inodes, dentries, wal, xattrs: XattrStore::new(), dir_index, binder: Mutex::new(binder) };
        fs.checkpoint()?;
        Ok(fs)
    }

    fn mount_existing(data_dir: &Path) -> FsResult<Self> {
        log::info!("mount: attaching existing data directory at {data_dir:?}");
        let mut binder = Binder::attach(data_dir)?;
        let layout = binder.layout();

        let header = binder
            .load_wal_header()?
            .ok_or_else(|| FsError::corrupted("data directory is missing its WAL header snapshot"))?;
        let meta_bytes = binder.load_meta()?.ok_or_else(|| FsError::corrupted("data directory is missing its structural snapshot"))?;
        let snapshot = MetaSnapshot::decode(&meta_bytes)?;

        let mut strtab = StringTable::new(binder.strtab_arena(snapshot.strtab_len as usize));
        strtab.rebuild_index();
        let alloc = BlockAllocator::attach(
            binder.block_region(),
            layout.block_size as usize,
            layout.total_blocks,
            snapshot.bitmap,
            snapshot.bitmap_hint,
        )?;
        let inodes = InodeTable::restore(layout.inode_capacity as usize, snapshot.next_ino, snapshot.inodes);
        let dentries = DentryTree::restore(layout.dentry_capacity as usize, snapshot.dentries);
        let wal = Wal::attach(binder.wal_region(), header)?;
        let dir_index = RwLock::new(build_dir_index(&dentries));

        let fs = Self { strtab: Mutex::new(strtab), alloc, inodes, dentries, wal, xattrs: XattrStore::new(), dir_index, binder: Mutex::new(binder) };

        if fs.wal.needs_recovery() {
            let mut sink = CoreRedoSink { fs: &fs };
            match RecoveryEngine::new(&fs.wal).run(&mut sink) {
                Ok(stats) => log::info!(
                    "recovery: {} scanned, {} redone, {} skipped, {} undone",
                    stats.entries_scanned,
                    stats.ops_redone,
                    stats.ops_skipped,
                    stats.ops_undone
                ),
                Err(e) => {
                    fs.wal.mark_needs_fsck();
                    log::error!("recovery failed: {e}; filesystem is marked needs-fsck");
                    return Err(FsError::needs_fsck(format!("recovery failed: {e}")));
                }
            }
            fs.checkpoint()?;
        }
        Ok(fs)
    }

    /// Flushes every region, snapshots structural state, writes a
    /// CHECKPOINT WAL record, and persists the new WAL header. Called by
    /// `fsync`, by mkfs, and by `unmount`.
    pub fn checkpoint(&self) -> FsResult<()> {
        self.wal.checkpoint()?;
        let mut binder = self.binder.lock();
        let snapshot = MetaSnapshot::capture(self);
        binder.save_meta(&snapshot.encode())?;
        binder.save_wal_header(&self.wal.header_snapshot())?;
        binder.flush()?;
        Ok(())
    }

    /// Flushes payload and the WAL up to the latest LSN; does not write a
    /// full structural snapshot unless the WAL has crossed the checkpoint
    /// threshold (spec §4.8/§9 checkpoint cadence).
    pub fn fsync(&self) -> FsResult<()> {
        if self.wal.should_checkpoint() {
            self.checkpoint()
        } else {
            self.binder.lock().flush()
        }
    }

    /// Checkpoints, flushes, and detaches every backing region. Consumes
    /// the handle, matching spec §6.1's `unmount(h)`.
    pub fn unmount(self) -> FsResult<()> {
        self.checkpoint()?;
        self.binder.into_inner().detach()
    }
}

fn superblock_exists(data_dir: &Path) -> bool {
    data_dir.join("superblock.bin").is_file()
}

/// The structural snapshot written to `meta.bin`: everything that isn't
/// directly mmap'd (the inode table and directory tree hold locks, which
/// cannot live inside mapped memory) plus the allocator bitmap and the
/// string table's occupied length, which the mmap'd regions need restated
/// on attach. Hand-rolled little-endian encoding, in the same spirit as the
/// on-disk records elsewhere in the core — this blob is purely internal and
/// never interpreted outside this module.
struct MetaSnapshot {
    strtab_len: u64,
    next_ino: u32,
    inodes: Vec<(u32, InodeSnapshot)>,
    dentries: Vec<(u32, crate::core::dentry::DentrySnapshot)>,
    bitmap: Vec<u8>,
    bitmap_hint: u32,
}

impl MetaSnapshot {
    fn capture(fs: &RazorFs) -> Self {
        let (bitmap, bitmap_hint) = fs.alloc.snapshot_bitmap();
        let strtab = fs.strtab.lock();
        Self {
            strtab_len: strtab.stats().arena_bytes as u64,
            next_ino: fs.inodes.next_ino(),
            inodes: fs.inodes.snapshot(),
            dentries: fs.dentries.snapshot(),
            bitmap,
            bitmap_hint,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.strtab_len.to_le_bytes());
        out.extend_from_slice(&self.next_ino.to_le_bytes());

        out.extend_from_slice(&(self.inodes.len() as u32).to_le_bytes());
        for (ino, snap) in &self.inodes {
            out.extend_from_slice(&ino.to_le_bytes());
            out.extend_from_slice(&snap.mode.to_le_bytes());
            out.extend_from_slice(&snap.uid.to_le_bytes());
            out.extend_from_slice(&snap.gid.to_le_bytes());
            out.extend_from_slice(&snap.size.to_le_bytes());
            out.extend_from_slice(&snap.atime.to_le_bytes());
            out.extend_from_slice(&snap.mtime.to_le_bytes());
            out.extend_from_slice(&snap.ctime.to_le_bytes());
            out.extend_from_slice(&snap.xattr_head.to_le_bytes());
            out.extend_from_slice(&snap.link_count.to_le_bytes());
            out.push(storage_mode_tag(snap.storage_mode));
            out.extend_from_slice(&(snap.inline_data.len() as u32).to_le_bytes());
            out.extend_from_slice(&snap.inline_data);
            out.extend_from_slice(&(snap.content.len() as u32).to_le_bytes());
            for e in &snap.content {
                out.extend_from_slice(&e.logical_block.get().to_le_bytes());
                out.extend_from_slice(&e.first_block.get().to_le_bytes());
                out.extend_from_slice(&e.num_blocks.get().to_le_bytes());
                out.extend_from_slice(&e.flags.get().to_le_bytes());
            }
        }

        out.extend_from_slice(&(self.dentries.len() as u32).to_le_bytes());
        for (index, d) in &self.dentries {
            out.extend_from_slice(&index.to_le_bytes());
            out.extend_from_slice(&d.parent.to_le_bytes());
            out.extend_from_slice(&d.name_handle.to_le_bytes());
            out.extend_from_slice(&d.ino.to_le_bytes());
            out.push(file_kind_tag(d.kind));
            out.extend_from_slice(&(d.children.len() as u32).to_le_bytes());
            for (name_handle, dentry) in &d.children {
                out.extend_from_slice(&name_handle.to_le_bytes());
                out.extend_from_slice(&dentry.to_le_bytes());
            }
        }

        out.extend_from_slice(&(self.bitmap.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bitmap);
        out.extend_from_slice(&self.bitmap_hint.to_le_bytes());
        out
    }

    fn decode(buf: &[u8]) -> FsResult<Self> {
        let mut r = Cursor::new(buf);
        let strtab_len = r.u64()?;
        let next_ino = r.u32()?;

        let inode_count = r.u32()?;
        let mut inodes = Vec::with_capacity(inode_count as usize);
        for _ in 0..inode_count {
            let ino = r.u32()?;
            let mode = r.u16()?;
            let uid = r.u32()?;
            let gid = r.u32()?;
            let size = r.u64()?;
            let atime = r.u32()?;
            let mtime = r.u32()?;
            let ctime = r.u32()?;
            let xattr_head = r.u32()?;
            let link_count = r.u16()?;
            let storage_mode = storage_mode_from_tag(r.u8()?)?;
            let inline_len = r.u32()? as usize;
            let inline_data = r.bytes(inline_len)?.to_vec();
            let extent_count = r.u32()?;
            let mut content = Vec::with_capacity(extent_count as usize);
            for _ in 0..extent_count {
                let logical_block = r.u32()?;
                let first_block = r.u32()?;
                let num_blocks = r.u32()?;
                let flags = r.u32()?;
                let mut e = crate::core::extent::Extent::new(logical_block, first_block, num_blocks);
                e.flags = zerocopy::byteorder::little_endian::U32::new(flags);
                content.push(e);
            }
            inodes.push((
                ino,
                InodeSnapshot { mode, uid, gid, size, atime, mtime, ctime, xattr_head, link_count, content, inline_data, storage_mode },
            ));
        }

        let dentry_count = r.u32()?;
        let mut dentries = Vec::with_capacity(dentry_count as usize);
        for _ in 0..dentry_count {
            let index = r.u32()?;
            let parent = r.u32()?;
            let name_handle = r.u32()?;
            let ino = r.u32()?;
            let kind = file_kind_from_tag(r.u8()?)?;
            let child_count = r.u32()?;
            let mut children = Vec::with_capacity(child_count as usize);
            for _ in 0..child_count {
                children.push((r.u32()?, r.u32()?));
            }
            dentries.push((index, crate::core::dentry::DentrySnapshot { parent, name_handle, ino, kind, children }));
        }

        let bitmap_len = r.u32()? as usize;
        let bitmap = r.bytes(bitmap_len)?.to_vec();
        let bitmap_hint = r.u32()?;

        Ok(Self { strtab_len, next_ino, inodes, dentries, bitmap, bitmap_hint })
    }
}

fn storage_mode_tag(mode: crate::core::extent::StorageMode) -> u8 {
    use crate::core::extent::StorageMode::*;
    match mode {
        InlineData => 0,
        InlineExtents => 1,
        ExtentTree => 2,
    }
}

fn storage_mode_from_tag(tag: u8) -> FsResult<crate::core::extent::StorageMode> {
    use crate::core::extent::StorageMode::*;
    Ok(match tag {
        0 => InlineData,
        1 => InlineExtents,
        2 => ExtentTree,
        _ => return Err(FsError::corrupted("unknown storage mode tag in structural snapshot")),
    })
}

fn file_kind_tag(kind: FileKind) -> u8 {
    match kind {
        FileKind::Regular => 0,
        FileKind::Directory => 1,
        FileKind::Symlink => 2,
    }
}

fn file_kind_from_tag(tag: u8) -> FsResult<FileKind> {
    Ok(match tag {
        0 => FileKind::Regular,
        1 => FileKind::Directory,
        2 => FileKind::Symlink,
        _ => return Err(FsError::corrupted("unknown file kind tag in structural snapshot")),
    })
}

/// A tiny sequential reader over the snapshot blob, erroring out as
/// `Corrupted` rather than panicking on a short buffer.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> FsResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(FsError::corrupted("truncated structural snapshot"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> FsResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> FsResult<u16> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> FsResult<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> FsResult<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

/// Bridges the generic ARIES redo/undo engine into the live components.
/// Recovery only ever runs during `mount`, before any other thread can see
/// `fs`, so locking discipline here is "whatever each component already
/// enforces internally" rather than the adapter's shallow-to-deep rule.
struct CoreRedoSink<'a> {
    fs: &'a RazorFs,
}

/// Wire shape for INSERT/DELETE records: a dentry link plus the inode it
/// names. UPDATE/WRITE records carry the narrower ino/size/mtime shape.
/// `encode_link`/`decode_link` are shared by `adapter` (which logs these
/// ops) and recovery (which replays them).
pub(crate) fn encode_link(parent_dentry: u32, ino: u32, mode: u16, uid: u32, gid: u32, kind: FileKind, name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + name.len());
    out.push(file_kind_tag(kind));
    out.extend_from_slice(&parent_dentry.to_le_bytes());
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(&mode.to_le_bytes());
    out.extend_from_slice(&uid.to_le_bytes());
    out.extend_from_slice(&gid.to_le_bytes());
    out.extend_from_slice(name);
    out
}

struct LinkPayload {
    kind: FileKind,
    parent_dentry: u32,
    ino: u32,
    mode: u16,
    uid: u32,
    gid: u32,
    name: Vec<u8>,
}

fn decode_link(payload: &[u8]) -> FsResult<LinkPayload> {
    let mut r = Cursor::new(payload);
    let kind = file_kind_from_tag(r.u8()?)?;
    let parent_dentry = r.u32()?;
    let ino = r.u32()?;
    let mode = r.u16()?;
    let uid = r.u32()?;
    let gid = r.u32()?;
    let name = r.bytes(payload.len() - r.pos)?.to_vec();
    Ok(LinkPayload { kind, parent_dentry, ino, mode, uid, gid, name })
}

pub(crate) fn encode_attrs(ino: u32, size: u64, mtime: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&mtime.to_le_bytes());
    out
}

fn decode_attrs(payload: &[u8]) -> FsResult<(u32, u64, u32)> {
    let mut r = Cursor::new(payload);
    Ok((r.u32()?, r.u64()?, r.u32()?))
}

/// Wire shape for WRITE records (spec §4.6): the narrower ino/size/mtime
/// plus a CRC32 over the bytes this write touched, so redo can tell a torn
/// write from a clean one, *and* the post-write content mapping (inline
/// bytes or extent list) so the logical-to-physical mapping the write
/// produced survives a crash before the next checkpoint — without this,
/// redoing a WRITE would leave `size` updated but `content` empty.
pub(crate) fn encode_write(
    ino: u32,
    offset: u64,
    len: u32,
    data_crc32: u32,
    size: u64,
    mtime: u32,
    storage_mode: crate::core::extent::StorageMode,
    inline_data: &[u8],
    content: &[crate::core::extent::Extent],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(41 + inline_data.len() + content.len() * 16);
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data_crc32.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&mtime.to_le_bytes());
    out.push(storage_mode_tag(storage_mode));
    out.extend_from_slice(&(inline_data.len() as u32).to_le_bytes());
    out.extend_from_slice(inline_data);
    out.extend_from_slice(&(content.len() as u32).to_le_bytes());
    for e in content {
        out.extend_from_slice(&e.logical_block.get().to_le_bytes());
        out.extend_from_slice(&e.first_block.get().to_le_bytes());
        out.extend_from_slice(&e.num_blocks.get().to_le_bytes());
        out.extend_from_slice(&e.flags.get().to_le_bytes());
    }
    out
}

struct WritePayload {
    ino: u32,
    offset: u64,
    len: u32,
    data_crc32: u32,
    size: u64,
    mtime: u32,
    storage_mode: crate::core::extent::StorageMode,
    inline_data: Vec<u8>,
    content: Vec<crate::core::extent::Extent>,
}

fn decode_write(payload: &[u8]) -> FsResult<WritePayload> {
    let mut r = Cursor::new(payload);
    let ino = r.u32()?;
    let offset = r.u64()?;
    let len = r.u32()?;
    let data_crc32 = r.u32()?;
    let size = r.u64()?;
    let mtime = r.u32()?;
    let storage_mode = storage_mode_from_tag(r.u8()?)?;
    let inline_len = r.u32()? as usize;
    let inline_data = r.bytes(inline_len)?.to_vec();
    let extent_count = r.u32()?;
    let mut content = Vec::with_capacity(extent_count as usize);
    for _ in 0..extent_count {
        let logical_block = r.u32()?;
        let first_block = r.u32()?;
        let num_blocks = r.u32()?;
        let flags = r.u32()?;
        let mut e = crate::core::extent::Extent::new(logical_block, first_block, num_blocks);
        e.flags = zerocopy::byteorder::little_endian::U32::new(flags);
        content.push(e);
    }
    Ok(WritePayload { ino, offset, len, data_crc32, size, mtime, storage_mode, inline_data, content })
}

impl<'a> recovery::RedoSink for CoreRedoSink<'a> {
    fn insert_exists(&self, payload: &[u8]) -> bool {
        let Ok(link) = decode_link(payload) else { return true };
        let mut strtab = self.fs.strtab.lock();
        let guard = self.fs.dentries.lock_read(link.parent_dentry);
        self.fs.dentries.lookup_child(&guard, &mut strtab, &link.name).unwrap_or(None).is_some()
    }

    fn apply_insert(&mut self, payload: &[u8]) -> FsResult<()> {
        let link = decode_link(payload)?;
        if self.fs.inodes.read(link.ino, |_| ()).is_err() {
            self.fs.inodes.insert_at(link.ino, InodeRecord::new_for_recovery(link.mode, link.uid, link.gid))?;
        }
        let mut strtab = self.fs.strtab.lock();
        let name_handle = strtab.intern(&link.name)?;
        let names = {
            let strtab_ref = &*strtab;
            move |h: u32| -> FsResult<Vec<u8>> { Ok(strtab_ref.lookup(h)?.to_vec()) }
        };
        let mut parent = self.fs.dentries.lock_write(link.parent_dentry);
        self.fs
            .dentries
            .insert_child(&mut parent, name_handle, link.ino, link.kind, &names, link.parent_dentry)
            .map(|_| ())
            .or_else(|e| if e.kind == error::ErrorKind::Exists { Ok(()) } else { Err(e) })
    }

    fn delete_exists(&self, payload: &[u8]) -> bool {
        let Ok(link) = decode_link(payload) else { return false };
        let mut strtab = self.fs.strtab.lock();
        let guard = self.fs.dentries.lock_read(link.parent_dentry);
        self.fs.dentries.lookup_child(&guard, &mut strtab, &link.name).unwrap_or(None).is_some()
    }

    fn apply_delete(&mut self, payload: &[u8]) -> FsResult<()> {
        let link = decode_link(payload)?;
        let mut strtab = self.fs.strtab.lock();
        let name_handle = strtab.intern(&link.name)?;
        let names = {
            let strtab_ref = &*strtab;
            move |h: u32| -> FsResult<Vec<u8>> { Ok(strtab_ref.lookup(h)?.to_vec()) }
        };
        let mut parent = self.fs.dentries.lock_write(link.parent_dentry);
        self.fs.dentries.remove_child(&mut parent, name_handle, &names)?;
        self.fs.inodes.unlink(link.ino)?;
        Ok(())
    }

    fn update_is_newer(&self, payload: &[u8], timestamp: u32) -> bool {
        let Ok((ino, _, _)) = decode_attrs(payload) else { return false };
        self.fs.inodes.read(ino, |r| timestamp >= r.mtime).unwrap_or(true)
    }

    fn apply_update(&mut self, payload: &[u8], _timestamp: u32) -> FsResult<()> {
        let (ino, size, mtime) = decode_attrs(payload)?;
        self.fs.inodes.write(ino, |r| {
            r.size = size;
            r.mtime = mtime;
        })
    }

    fn apply_write(&mut self, payload: &[u8]) -> FsResult<()> {
        let w = decode_write(payload)?;
        self.fs.inodes.write(w.ino, |r| {
            r.size = w.size;
            r.mtime = w.mtime;
            r.storage_mode = w.storage_mode;
            r.inline_data = w.inline_data.clone();
            r.content = w.content.clone();
        })?;

        // The data itself isn't journalled (spec §4.6); validate the CRC
        // against whatever is actually resident rather than failing redo
        // outright, since a crash mid-write can legitimately leave a torn
        // block behind.
        let mut range = vec![0u8; w.len as usize];
        let resident = match w.storage_mode {
            crate::core::extent::StorageMode::InlineData => {
                let start = w.offset as usize;
                let end = (start + range.len()).min(w.inline_data.len());
                if end > start {
                    range[..end - start].copy_from_slice(&w.inline_data[start..end]);
                }
                true
            }
            _ => extent::read_extents(&self.fs.alloc, &w.content, w.offset, &mut range).is_ok(),
        };
        if resident {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&range);
            if hasher.finalize() != w.data_crc32 {
                log::warn!("write redo: ino {} data range [{}, {}) failed CRC check, torn write", w.ino, w.offset, w.offset + w.len as u64);
            }
        }
        Ok(())
    }

    fn undo_insert(&mut self, payload: &[u8]) -> FsResult<()> {
        self.apply_delete(payload).or_else(|e| if e.kind == error::ErrorKind::NoEntry { Ok(()) } else { Err(e) })
    }
}
