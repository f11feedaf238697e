//! RazorFS: an in-memory, mmap-backed POSIX-style filesystem core with
//! WAL-based crash recovery. This crate is the core and its in-process
//! adapter API; the kernel-facing FUSE dispatcher, mount/unmount CLI
//! mechanics beyond a thin harness, compression, and offline fsck are out
//! of scope (see `core::adapter` for the operations this crate exposes).

pub mod core;

pub use crate::core::adapter::{Attrs, DirEntry, FileHandle, OpenFlags, SetAttrs};
pub use crate::core::binder::Layout;
pub use crate::core::error::{ErrorKind, FsError, FsResult};
pub use crate::core::{MountConfig, RazorFs};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_mkfs_and_unmount_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = MountConfig { data_dir: dir.path().to_path_buf(), layout: Layout { total_blocks: 64, ..Layout::default() } };
        let fs = RazorFs::mount(cfg).unwrap();
        fs.unmount().unwrap();
    }

    #[test]
    fn state_survives_a_simulated_restart() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout { total_blocks: 256, inode_capacity: 64, dentry_capacity: 64, ..Layout::default() };

        const ROOT_INO: u32 = 1;

        {
            let cfg = MountConfig { data_dir: dir.path().to_path_buf(), layout };
            let fs = RazorFs::mount(cfg).unwrap();

            let sub = fs.mkdir(ROOT_INO, b"docs", 0o755, 0, 0).unwrap();
            let file = fs.create(sub.ino, b"notes.txt", 0o644, 0, 0).unwrap();
            let handle = fs.open(file.ino, OpenFlags { read: true, write: true }).unwrap();
            fs.write(handle, b"hello after restart", 0).unwrap();
            fs.fsync().unwrap();
            fs.unmount().unwrap();
        }

        let cfg = MountConfig { data_dir: dir.path().to_path_buf(), layout };
        let fs = RazorFs::mount(cfg).unwrap();
        let sub = fs.lookup(ROOT_INO, b"docs").unwrap();
        let file = fs.lookup(sub.ino, b"notes.txt").unwrap();
        let handle = fs.open(file.ino, OpenFlags { read: true, write: false }).unwrap();
        let mut buf = vec![0u8; 20];
        let n = fs.read(handle, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello after restart");
        fs.unmount().unwrap();
    }
}
