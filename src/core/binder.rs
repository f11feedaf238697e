//! C8 — Persistence Binder: attaches or creates every backing region a
//! mount needs (spec §4.8). Dynamic dispatch is deliberately confined to
//! this module (spec §9 design notes) — everywhere else in the core is
//! concrete types.
//!
//! The block-data region, string-table arena, and WAL are mapped live via
//! `memmap2` and used directly by their owning components (`alloc`,
//! `strtab`, `wal`) through the raw-pointer `BlockRegion`/`FixedArena`
//! views. The inode table and dentry tree hold `parking_lot` locks, which
//! cannot be placed inside a mapped region portably; instead, this module
//! serializes their live contents to a plain file on flush and restores
//! them on attach — the mapped regions carry payload bytes, this one
//! region carries structure.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::core::alloc::BlockRegion;
use crate::core::error::{FsError, FsResult};
use crate::core::strtab::FixedArena;
use crate::core::wal::{WalRegion, MIN_WAL_SIZE};

const SUPERBLOCK_MAGIC: u32 = 0x525A_4653; // "RZFS"
const SUPERBLOCK_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SuperblockRecord {
    magic: U32,
    version: U32,
    block_size: U32,
    total_blocks: U32,
    inode_capacity: U32,
    dentry_capacity: U32,
    strtab_capacity: U32,
    wal_capacity: U64,
}

/// On-disk layout knobs chosen at mkfs time; re-read from the superblock
/// on every subsequent attach.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub block_size: u32,
    pub total_blocks: u32,
    pub inode_capacity: u32,
    pub dentry_capacity: u32,
    pub strtab_capacity: u32,
    pub wal_capacity: u64,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            block_size: 4096,
            total_blocks: 65536, // 256 MiB of block-data region
            inode_capacity: 16384,
            dentry_capacity: 16384,
            strtab_capacity: 4 << 20, // 4 MiB
            wal_capacity: MIN_WAL_SIZE as u64 * 8,
        }
    }
}

/// Resolves the directory a fresh mkfs actually formats into. If
/// `preferred` can't be created (read-only mount, missing permissions, a
/// file sitting where a directory is expected), falls back to a directory
/// under the system temp path keyed by `preferred`'s own name, and emits a
/// warning (spec §4.8: "if the preferred storage path is not available,
/// fall back to a secondary path and emit a warning").
fn resolve_data_dir(preferred: PathBuf) -> PathBuf {
    if std::fs::create_dir_all(&preferred).is_ok() {
        return preferred;
    }
    let name = preferred.file_name().unwrap_or_else(|| std::ffi::OsStr::new("default"));
    let fallback = std::env::temp_dir().join("razorfs-fallback").join(name);
    log::warn!("binder: preferred data directory {preferred:?} is unavailable, falling back to {fallback:?}");
    fallback
}

fn file_names(data_dir: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf, PathBuf, PathBuf) {
    (
        data_dir.join("superblock.bin"),
        data_dir.join("wal.bin"),
        data_dir.join("strtab.bin"),
        data_dir.join("blocks.bin"),
        data_dir.join("meta.bin"),
        data_dir.join("wal_header.bin"),
    )
}

fn open_sized(path: &Path, len: u64) -> FsResult<File> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    file.set_len(len)?;
    Ok(file)
}

fn map_file(file: &File) -> FsResult<MmapMut> {
    // SAFETY: the backing file is exclusively owned by this mount (the
    // binder is the sole writer; no other process is expected to touch
    // the data directory while mounted).
    unsafe { MmapMut::map_mut(file).map_err(FsError::from) }
}

pub struct Binder {
    data_dir: PathBuf,
    layout: Layout,
    wal_mmap: MmapMut,
    strtab_mmap: MmapMut,
    block_mmap: MmapMut,
    meta_file: File,
    wal_header_file: File,
}

impl Binder {
    /// Formats a fresh set of backing files under `data_dir`.
    pub fn create(data_dir: impl Into<PathBuf>, layout: Layout) -> FsResult<Self> {
        let data_dir = resolve_data_dir(data_dir.into());
        std::fs::create_dir_all(&data_dir)?;
        let (sb_path, wal_path, strtab_path, blocks_path, meta_path, wal_header_path) = file_names(&data_dir);

        let sb_file = open_sized(&sb_path, std::mem::size_of::<SuperblockRecord>() as u64)?;
        let sb = SuperblockRecord {
            magic: U32::new(SUPERBLOCK_MAGIC),
            version: U32::new(SUPERBLOCK_VERSION),
            block_size: U32::new(layout.block_size),
            total_blocks: U32::new(layout.total_blocks),
            inode_capacity: U32::new(layout.inode_capacity),
            dentry_capacity: U32::new(layout.dentry_capacity),
            strtab_capacity: U32::new(layout.strtab_capacity),
            wal_capacity: U64::new(layout.wal_capacity),
        };
        write_record(&sb_file, &sb)?;

        let wal_file = open_sized(&wal_path, layout.wal_capacity)?;
        let wal_mmap = map_file(&wal_file)?;

        let strtab_file = open_sized(&strtab_path, layout.strtab_capacity as u64)?;
        let strtab_mmap = map_file(&strtab_file)?;

        let block_bytes = layout.block_size as u64 * layout.total_blocks as u64;
        let blocks_file = open_sized(&blocks_path, block_bytes)?;
        let block_mmap = map_file(&blocks_file)?;

        let meta_file = open_sized(&meta_path, 0)?;
        let wal_header_file = open_sized(&wal_header_path, 0)?;

        Ok(Self { data_dir, layout, wal_mmap, strtab_mmap, block_mmap, meta_file, wal_header_file })
    }

    /// Attaches to an existing data directory, reading the superblock to
    /// recover the layout that was chosen at mkfs time.
    pub fn attach(data_dir: impl Into<PathBuf>) -> FsResult<Self> {
        let data_dir = data_dir.into();
        let (sb_path, wal_path, strtab_path, blocks_path, meta_path, wal_header_path) = file_names(&data_dir);

        let mut sb_file = OpenOptions::new().read(true).write(true).open(&sb_path)
            .map_err(|e| FsError::io_failure(format!("opening superblock: {e}")))?;
        let sb: SuperblockRecord = read_record(&mut sb_file)?;
        if sb.magic.get() != SUPERBLOCK_MAGIC {
            return Err(FsError::corrupted("superblock magic mismatch"));
        }
        let layout = Layout {
            block_size: sb.block_size.get(),
            total_blocks: sb.total_blocks.get(),
            inode_capacity: sb.inode_capacity.get(),
            dentry_capacity: sb.dentry_capacity.get(),
            strtab_capacity: sb.strtab_capacity.get(),
            wal_capacity: sb.wal_capacity.get(),
        };

        let wal_file = OpenOptions::new().read(true).write(true).open(&wal_path)?;
        let wal_mmap = map_file(&wal_file)?;

        let strtab_file = OpenOptions::new().read(true).write(true).open(&strtab_path)?;
        let strtab_mmap = map_file(&strtab_file)?;

        let blocks_file = OpenOptions::new().read(true).write(true).open(&blocks_path)?;
        let block_mmap = map_file(&blocks_file)?;

        let meta_file = OpenOptions::new().read(true).write(true).open(&meta_path)?;
        let wal_header_file = OpenOptions::new().read(true).write(true).open(&wal_header_path)?;

        Ok(Self { data_dir, layout, wal_mmap, strtab_mmap, block_mmap, meta_file, wal_header_file })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn block_region(&mut self) -> BlockRegion {
        BlockRegion::from_mmap(&mut self.block_mmap)
    }

    pub fn strtab_arena(&mut self, occupied_len: usize) -> FixedArena {
        FixedArena::from_mmap(&mut self.strtab_mmap, occupied_len)
    }

    pub fn wal_region(&mut self) -> WalRegion {
        WalRegion::from_mmap(&mut self.wal_mmap)
    }

    /// Reads the persisted WAL header, or `None` on a fresh mkfs (the
    /// header file is created empty and only populated from `save_wal_header`).
    pub fn load_wal_header(&mut self) -> FsResult<Option<crate::core::wal::WalHeader>> {
        self.wal_header_file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.wal_header_file.read_to_end(&mut buf)?;
        if buf.len() < crate::core::wal::WalHeader::SIZE {
            return Ok(None);
        }
        crate::core::wal::WalHeader::read_from_bytes(&buf)
            .map(Some)
            .map_err(|_| FsError::corrupted("malformed WAL header snapshot"))
    }

    pub fn save_wal_header(&mut self, header: &crate::core::wal::WalHeader) -> FsResult<()> {
        self.wal_header_file.set_len(0)?;
        self.wal_header_file.seek(SeekFrom::Start(0))?;
        self.wal_header_file.write_all(header.as_bytes())?;
        self.wal_header_file.flush()?;
        Ok(())
    }

    /// Reads the structural snapshot (inode table + dentry tree images)
    /// written by the last `save_meta`, or `None` on a fresh mkfs.
    pub fn load_meta(&mut self) -> FsResult<Option<Vec<u8>>> {
        self.meta_file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.meta_file.read_to_end(&mut buf)?;
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    /// Overwrites the structural snapshot file with `bytes`. Called at
    /// checkpoint and unmount time; this is the "flush" primitive for the
    /// components that don't live directly in a mapped region.
    pub fn save_meta(&mut self, bytes: &[u8]) -> FsResult<()> {
        self.meta_file.set_len(0)?;
        self.meta_file.seek(SeekFrom::Start(0))?;
        self.meta_file.write_all(bytes)?;
        self.meta_file.flush()?;
        Ok(())
    }

    /// Flushes every mapped region to its backing file. Called on fsync
    /// and before unmount.
    pub fn flush(&mut self) -> FsResult<()> {
        self.wal_mmap.flush().map_err(FsError::from)?;
        self.strtab_mmap.flush().map_err(FsError::from)?;
        self.block_mmap.flush().map_err(FsError::from)?;
        self.meta_file.sync_all()?;
        Ok(())
    }

    /// Flushes and releases every mapped region. The §4.8 secondary-path
    /// fallback lives in `create`/`resolve_data_dir`, not here — by the
    /// time `detach` runs, the data directory is whatever was actually
    /// opened, so a flush failure here is a hard error, not a missing path.
    pub fn detach(mut self) -> FsResult<()> {
        if let Err(e) = self.flush() {
            log::warn!("binder: final flush failed during detach, data directory {:?}: {e}", self.data_dir);
            return Err(e);
        }
        Ok(())
    }
}

fn write_record<T: IntoBytes + Immutable>(mut file: &File, record: &T) -> FsResult<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(record.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn read_record<T: FromBytes + KnownLayout + Immutable>(file: &mut File) -> FsResult<T> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; std::mem::size_of::<T>()];
    file.read_exact(&mut buf)?;
    T::read_from_bytes(&buf).map_err(|_| FsError::corrupted("malformed fixed-size record"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_round_trips_layout() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout { total_blocks: 256, ..Layout::default() };
        {
            let _binder = Binder::create(dir.path(), layout).unwrap();
        }
        let binder = Binder::attach(dir.path()).unwrap();
        assert_eq!(binder.layout().total_blocks, 256);
    }

    #[test]
    fn create_falls_back_to_a_secondary_path_when_preferred_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let binder = Binder::create(&blocked, Layout { total_blocks: 8, ..Layout::default() }).unwrap();
        assert_ne!(binder.data_dir(), blocked.as_path());
        assert!(binder.data_dir().is_dir());
    }

    #[test]
    fn meta_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut binder = Binder::create(dir.path(), Layout::default()).unwrap();
        assert!(binder.load_meta().unwrap().is_none());
        binder.save_meta(b"snapshot-bytes").unwrap();
        assert_eq!(binder.load_meta().unwrap().unwrap(), b"snapshot-bytes");
    }
}
