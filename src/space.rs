use crate::error::{Error, Result};
use crate::util::{read_i64, read_u32, read_u64, write_i64, write_u32, write_u64};
use fs2::FileExt;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;

pub const NIL_ADDR: i64 = -1;

const MAGIC: u64 = u64::from_be_bytes(*b"diskdict");
const VERSION: u32 = 1;

const HEADER_SIZE: usize = 4096;
const BLOCK_HEADER_SIZE: usize = 8;
const ALIGNMENT: usize = 4096;
const MIN_FILE_SIZE: u64 = 64 * 1024;

// capacity classes are powers of two, 2^4 (16 B) .. 2^31 (2 GiB)
const MIN_CLASS: u32 = 4;
const MAX_CLASS: u32 = 31;
const CLASS_COUNT: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

const H_MAGIC: usize = 0;
const H_VERSION: usize = 8;
const H_END: usize = 16;
const H_PRIMARY: usize = 24;
const H_ALLOCATED: usize = 32;
const H_BLOCKS: usize = 40;
const H_FREE_LISTS: usize = 48;
const H_ALIGNED_FREE_LISTS: usize = H_FREE_LISTS + 8 * CLASS_COUNT;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SpaceStats {
    pub file_size: u64,
    pub used_size: u64,
    /// sum of the payload sizes of live blocks
    pub allocated_size: u64,
    pub block_count: u64,
}

/// Free-space-managed file. Hands out variably sized and page-aligned byte
/// regions addressed by file offset, and carries a single persistent
/// "primary" address used as the root pointer of whatever index lives on top.
///
/// Views returned by `allocate`/`access` go stale on the next allocation or
/// free (the mapping may move when the file grows); the borrow checker makes
/// holding one across such a call impossible.
#[derive(Debug)]
pub struct Space {
    file: File,
    map: MmapMut,
}

fn size_class(size: usize) -> u32 {
    let size = size.max(1 << MIN_CLASS);
    usize::BITS - (size - 1).leading_zeros()
}

fn align_up(v: u64, alignment: u64) -> u64 {
    (v + alignment - 1) & !(alignment - 1)
}

impl Space {
    pub fn open(path: &Path, create_if_missing: bool) -> Result<Space> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)?;
        file.try_lock_exclusive()?;
        let fresh = file.metadata()?.len() == 0;
        if fresh {
            file.set_len(MIN_FILE_SIZE)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut space = Space { file, map };
        if fresh {
            write_u64(&mut space.map, H_MAGIC, MAGIC);
            write_u32(&mut space.map, H_VERSION, VERSION);
            write_u64(&mut space.map, H_END, HEADER_SIZE as u64);
            write_i64(&mut space.map, H_PRIMARY, NIL_ADDR);
            write_u64(&mut space.map, H_ALLOCATED, 0);
            write_u64(&mut space.map, H_BLOCKS, 0);
            for class in MIN_CLASS..=MAX_CLASS {
                write_i64(&mut space.map, free_list_offset(class, false), NIL_ADDR);
                write_i64(&mut space.map, free_list_offset(class, true), NIL_ADDR);
            }
        } else {
            if space.map.len() < HEADER_SIZE || read_u64(&space.map, H_MAGIC) != MAGIC {
                return Err(Error::Corruption("bad magic"));
            }
            if read_u32(&space.map, H_VERSION) != VERSION {
                return Err(Error::Corruption("unsupported version"));
            }
            if read_u64(&space.map, H_END) > space.map.len() as u64 {
                return Err(Error::Corruption("end offset past end of file"));
            }
        }
        Ok(space)
    }

    pub fn close(self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn primary(&self) -> i64 {
        read_i64(&self.map, H_PRIMARY)
    }

    pub fn set_primary(&mut self, addr: i64) {
        write_i64(&mut self.map, H_PRIMARY, addr);
    }

    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            file_size: self.map.len() as u64,
            used_size: self.end(),
            allocated_size: read_u64(&self.map, H_ALLOCATED),
            block_count: read_u64(&self.map, H_BLOCKS),
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        self.allocate_impl(size, false)
    }

    /// Like `allocate`, but the region starts on a page boundary. Regions
    /// allocated here must be released with `free_aligned`.
    pub fn allocate_aligned(&mut self, size: usize) -> Result<(i64, &mut [u8])> {
        self.allocate_impl(size, true)
    }

    pub fn free(&mut self, addr: i64) -> Result<()> {
        self.release(addr, false)
    }

    pub fn free_aligned(&mut self, addr: i64) -> Result<()> {
        debug_assert_eq!(addr as usize % ALIGNMENT, 0);
        self.release(addr, true)
    }

    /// Re-derives the view over a live region. The view length is exactly the
    /// size the region was allocated with.
    pub fn access(&mut self, addr: i64) -> Result<&mut [u8]> {
        let (_, size) = self.block_header(addr)?;
        let addr = addr as usize;
        Ok(&mut self.map[addr..addr + size])
    }

    fn allocate_impl(&mut self, size: usize, aligned: bool) -> Result<(i64, &mut [u8])> {
        assert!(size > 0);
        let class = size_class(size);
        assert!(class <= MAX_CLASS);
        let head_offset = free_list_offset(class, aligned);
        let head = read_i64(&self.map, head_offset);
        let addr = if head != NIL_ADDR {
            let next = read_i64(&self.map, head as usize);
            write_i64(&mut self.map, head_offset, next);
            head
        } else {
            self.carve(class, aligned)?
        };
        let header = (u64::from(class) << 56) | size as u64;
        write_u64(&mut self.map, addr as usize - BLOCK_HEADER_SIZE, header);
        let allocated = read_u64(&self.map, H_ALLOCATED) + size as u64;
        write_u64(&mut self.map, H_ALLOCATED, allocated);
        let blocks = read_u64(&self.map, H_BLOCKS) + 1;
        write_u64(&mut self.map, H_BLOCKS, blocks);
        let addr_usize = addr as usize;
        Ok((addr, &mut self.map[addr_usize..addr_usize + size]))
    }

    fn release(&mut self, addr: i64, aligned: bool) -> Result<()> {
        let (class, size) = self.block_header(addr)?;
        let head_offset = free_list_offset(class, aligned);
        let head = read_i64(&self.map, head_offset);
        write_i64(&mut self.map, addr as usize, head);
        write_i64(&mut self.map, head_offset, addr);
        let allocated = read_u64(&self.map, H_ALLOCATED) - size as u64;
        write_u64(&mut self.map, H_ALLOCATED, allocated);
        let blocks = read_u64(&self.map, H_BLOCKS) - 1;
        write_u64(&mut self.map, H_BLOCKS, blocks);
        Ok(())
    }

    fn carve(&mut self, class: u32, aligned: bool) -> Result<i64> {
        let capacity = 1u64 << class;
        let mut payload = self.end() + BLOCK_HEADER_SIZE as u64;
        if aligned {
            payload = align_up(payload, ALIGNMENT as u64);
        }
        let new_end = payload + capacity;
        self.ensure_len(new_end)?;
        write_u64(&mut self.map, H_END, new_end);
        Ok(payload as i64)
    }

    fn ensure_len(&mut self, needed: u64) -> Result<()> {
        let len = self.map.len() as u64;
        if needed <= len {
            return Ok(());
        }
        let mut new_len = len.max(MIN_FILE_SIZE);
        while new_len < needed {
            new_len *= 2;
        }
        tracing::debug!(new_len, "growing backing file");
        self.map.flush()?;
        self.file.set_len(new_len)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn end(&self) -> u64 {
        read_u64(&self.map, H_END)
    }

    fn block_header(&self, addr: i64) -> Result<(u32, usize)> {
        if addr < (HEADER_SIZE + BLOCK_HEADER_SIZE) as i64
            || addr as u64 > self.end()
        {
            return Err(Error::Corruption("address out of bounds"));
        }
        let header = read_u64(&self.map, addr as usize - BLOCK_HEADER_SIZE);
        let class = (header >> 56) as u32;
        let size = (header & ((1 << 56) - 1)) as usize;
        if !(MIN_CLASS..=MAX_CLASS).contains(&class)
            || size > 1usize << class
            || addr as u64 + size as u64 > self.end()
        {
            return Err(Error::Corruption("bad block header"));
        }
        Ok((class, size))
    }
}

fn free_list_offset(class: u32, aligned: bool) -> usize {
    let base = if aligned { H_ALIGNED_FREE_LISTS } else { H_FREE_LISTS };
    base + 8 * (class - MIN_CLASS) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp(dir: &TempDir) -> Space {
        Space::open(&dir.path().join("space"), true).unwrap()
    }

    #[test]
    fn allocate_access_free() {
        let dir = TempDir::new().unwrap();
        let mut space = open_temp(&dir);
        let baseline = space.stats();
        assert_eq!(baseline.allocated_size, 0);

        let (addr, view) = space.allocate(100).unwrap();
        assert_eq!(view.len(), 100);
        view.fill(0xab);
        assert!(space.access(addr).unwrap().iter().all(|&b| b == 0xab));
        assert_eq!(space.stats().allocated_size, 100);

        space.free(addr).unwrap();
        assert_eq!(space.stats().allocated_size, 0);
        assert_eq!(space.stats().block_count, 0);

        // a freed block of the same class is reused
        let (addr2, _) = space.allocate(80).unwrap();
        assert_eq!(addr2, addr);
    }

    #[test]
    fn aligned_blocks() {
        let dir = TempDir::new().unwrap();
        let mut space = open_temp(&dir);
        let (a, view) = space.allocate_aligned(8192).unwrap();
        assert_eq!(a as usize % ALIGNMENT, 0);
        assert_eq!(view.len(), 8192);
        let (b, _) = space.allocate_aligned(8192).unwrap();
        assert_eq!(b as usize % ALIGNMENT, 0);
        space.free_aligned(a).unwrap();
        let (c, _) = space.allocate_aligned(8192).unwrap();
        assert_eq!(c, a);
        space.free_aligned(b).unwrap();
        space.free_aligned(c).unwrap();
        assert_eq!(space.stats().allocated_size, 0);
    }

    #[test]
    fn growth_past_initial_mapping() {
        let dir = TempDir::new().unwrap();
        let mut space = open_temp(&dir);
        let mut addrs = Vec::new();
        for i in 0..40u8 {
            let (addr, view) = space.allocate(1 << 16).unwrap();
            view.fill(i);
            addrs.push(addr);
        }
        for (i, &addr) in addrs.iter().enumerate() {
            assert!(space.access(addr).unwrap().iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn primary_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("space");
        let mut space = Space::open(&path, true).unwrap();
        assert_eq!(space.primary(), NIL_ADDR);
        let (addr, _) = space.allocate(32).unwrap();
        space.set_primary(addr);
        space.close().unwrap();

        let space = Space::open(&path, false).unwrap();
        assert_eq!(space.primary(), addr);
        assert_eq!(space.stats().allocated_size, 32);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        match Space::open(&dir.path().join("nope"), false) {
            Err(Error::Io(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_address_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut space = open_temp(&dir);
        match space.access(12345678) {
            Err(Error::Corruption(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
