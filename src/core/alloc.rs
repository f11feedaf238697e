//! C2 — Block Allocator: a bitmap first-fit allocator with a rotating
//! search hint (spec §4.2). `alloc`/`free` take the single writer lock;
//! `read`/`write` operate directly on the mapped block region and
//! deliberately do not, relying on the allocator's own bookkeeping (and the
//! caller discipline above it) to keep concurrent accesses disjoint.

use parking_lot::Mutex;

use crate::core::error::{FsError, FsResult};

pub const BLOCK_NONE: u32 = u32::MAX;

/// Raw, shared view over the mapped block-data region.
///
/// # Safety
/// `read`/`write` construct temporary slices from a raw pointer without
/// taking any lock. Callers (the allocator, and ultimately the directory
/// tree's locking discipline) must guarantee that no two callers ever
/// address overlapping byte ranges concurrently.
pub struct BlockRegion {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for BlockRegion {}
unsafe impl Sync for BlockRegion {}

impl BlockRegion {
    pub fn from_mmap(mmap: &mut memmap2::MmapMut) -> Self {
        Self { ptr: mmap.as_mut_ptr(), len: mmap.len() }
    }

    /// Owns nothing; for tests and freestanding use over a plain `Vec<u8>`.
    pub fn from_vec(buf: &mut Vec<u8>) -> Self {
        Self { ptr: buf.as_mut_ptr(), len: buf.len() }
    }

    fn check_range(&self, offset: usize, len: usize) -> FsResult<()> {
        let end = offset.checked_add(len).ok_or_else(|| FsError::invalid_argument("block offset overflow"))?;
        if end > self.len {
            return Err(FsError::invalid_argument("block access out of range"));
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> FsResult<()> {
        self.check_range(offset, buf.len())?;
        let src = unsafe { std::slice::from_raw_parts(self.ptr.add(offset), buf.len()) };
        buf.copy_from_slice(src);
        Ok(())
    }

    pub fn write(&self, offset: usize, buf: &[u8]) -> FsResult<()> {
        self.check_range(offset, buf.len())?;
        let dst = unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), buf.len()) };
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllocStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub fragmentation: f64,
}

struct BitmapState {
    /// One bit per block, 1 = in use.
    bits: Vec<u8>,
    hint: u32,
}

impl BitmapState {
    fn get(&self, i: u32) -> bool {
        (self.bits[(i / 8) as usize] >> (i % 8)) & 1 == 1
    }

    fn set(&mut self, i: u32, used: bool) {
        let byte = &mut self.bits[(i / 8) as usize];
        if used {
            *byte |= 1 << (i % 8);
        } else {
            *byte &= !(1 << (i % 8));
        }
    }
}

pub struct BlockAllocator {
    region: BlockRegion,
    block_size: usize,
    total_blocks: u32,
    state: Mutex<BitmapState>,
}

impl BlockAllocator {
    /// Formats a fresh, all-free bitmap.
    pub fn create(region: BlockRegion, block_size: usize, total_blocks: u32) -> Self {
        let bytes = total_blocks.div_ceil(8) as usize;
        Self {
            region,
            block_size,
            total_blocks,
            state: Mutex::new(BitmapState { bits: vec![0u8; bytes], hint: 0 }),
        }
    }

    /// Attaches to an existing bitmap image (binder attach path).
    pub fn attach(region: BlockRegion, block_size: usize, total_blocks: u32, bitmap: Vec<u8>, hint: u32) -> FsResult<Self> {
        let expected = total_blocks.div_ceil(8) as usize;
        if bitmap.len() != expected {
            return Err(FsError::corrupted("block bitmap length does not match block count"));
        }
        Ok(Self {
            region,
            block_size,
            total_blocks,
            state: Mutex::new(BitmapState { bits: bitmap, hint: hint % total_blocks.max(1) }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// A copy of the bitmap and hint, for checkpointing to the backing image.
    pub fn snapshot_bitmap(&self) -> (Vec<u8>, u32) {
        let st = self.state.lock();
        (st.bits.clone(), st.hint)
    }

    /// First-fit allocation of a `count`-block run, starting the scan at
    /// the rotating hint and wrapping around the bitmap exactly once.
    pub fn alloc(&self, count: u32) -> FsResult<u32> {
        if count == 0 {
            return Err(FsError::invalid_argument("alloc(0) is not meaningful"));
        }
        if count > self.total_blocks {
            return Err(FsError::no_space("requested run exceeds device size"));
        }
        let mut st = self.state.lock();
        let total = self.total_blocks;
        let start = st.hint.min(total.saturating_sub(1));

        for pass in 0..2 {
            let (from, to) = if pass == 0 { (start, total) } else { (0, start) };
            let mut i = from;
            while i < to {
                if st.get(i) {
                    i += 1;
                    continue;
                }
                let mut run = 1u32;
                while run < count && i + run < total && !st.get(i + run) {
                    run += 1;
                }
                if run == count {
                    for b in i..i + count {
                        st.set(b, true);
                    }
                    st.hint = if i + count >= total { 0 } else { i + count };
                    return Ok(i);
                }
                i += run;
            }
        }
        Err(FsError::no_space("block allocator exhausted"))
    }

    pub fn free(&self, first: u32, count: u32) -> FsResult<()> {
        let end = first.checked_add(count).ok_or_else(|| FsError::invalid_argument("free() overflow"))?;
        if end > self.total_blocks {
            return Err(FsError::invalid_argument("free() range out of bounds"));
        }
        let mut st = self.state.lock();
        for b in first..end {
            st.set(b, false);
        }
        Ok(())
    }

    fn check_block(&self, block: u32) -> FsResult<()> {
        if block >= self.total_blocks {
            return Err(FsError::invalid_argument("block id out of range"));
        }
        Ok(())
    }

    pub fn read(&self, block: u32, offset_in_block: usize, buf: &mut [u8]) -> FsResult<()> {
        self.check_block(block)?;
        self.region.read(block as usize * self.block_size + offset_in_block, buf)
    }

    pub fn write(&self, block: u32, offset_in_block: usize, buf: &[u8]) -> FsResult<()> {
        self.check_block(block)?;
        self.region.write(block as usize * self.block_size + offset_in_block, buf)
    }

    pub fn stats(&self) -> AllocStats {
        let st = self.state.lock();
        let mut free = 0u32;
        let mut run = 0u32;
        let mut largest_run = 0u32;
        for i in 0..self.total_blocks {
            if st.get(i) {
                run = 0;
            } else {
                free += 1;
                run += 1;
                largest_run = largest_run.max(run);
            }
        }
        let fragmentation = if free == 0 { 0.0 } else { 1.0 - (largest_run as f64 / free as f64) };
        AllocStats { total_blocks: self.total_blocks, free_blocks: free, fragmentation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator(total: u32) -> BlockAllocator {
        let mut buf = vec![0u8; total as usize * 512];
        let region = BlockRegion::from_vec(&mut buf);
        std::mem::forget(buf); // region borrows raw bytes; keep them alive for the test
        BlockAllocator::create(region, 512, total)
    }

    #[test]
    fn alloc_returns_disjoint_runs() {
        let a = test_allocator(16);
        let first = a.alloc(4).unwrap();
        let second = a.alloc(4).unwrap();
        assert_ne!(first, second);
        assert!(first + 4 <= second || second + 4 <= first);
    }

    #[test]
    fn free_then_alloc_reuses_space() {
        let a = test_allocator(4);
        let r1 = a.alloc(4).unwrap();
        assert!(a.alloc(1).is_err());
        a.free(r1, 4).unwrap();
        let r2 = a.alloc(4).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn exhaustion_is_no_space() {
        let a = test_allocator(2);
        a.alloc(2).unwrap();
        assert_eq!(a.alloc(1).unwrap_err().kind, crate::core::error::ErrorKind::NoSpace);
    }

    #[test]
    fn fragmentation_is_zero_when_all_free() {
        let a = test_allocator(8);
        assert_eq!(a.stats().fragmentation, 0.0);
    }

    #[test]
    fn read_write_round_trips() {
        let a = test_allocator(4);
        let b = a.alloc(1).unwrap();
        a.write(b, 0, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        a.read(b, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
