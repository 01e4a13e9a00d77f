// Buffer cache.
//
// The buffer cache is a fixed pool of NBUFS buffers holding cached
// copies of disk block contents. Caching disk blocks in memory reduces
// the number of disk reads and lets writes be deferred.
//
// Interface:
// * To get a buffer for a particular disk block, call read() and get a BufGuard.
// * After changing buffer data, call bwrite() to write it to disk now,
//     or bawrite() to leave it dirty until eviction or sync.
// * When done with the buffer, drop(BufGuard) or brelse() it.
// * Only one checkout of a block may exist at a time; asking for a block
//     that is already checked out is a kernel bug.
//
// A buffer that has to be reused goes to the least recently stamped
// one that is not checked out. Every hand-out advances a global clock
// and stamps the buffer with it.

use crate::error::{Error::*, Result};
use crate::file::DevSw;
use crate::param::{BSIZE, NBUFS};
use crate::spinlock::Mutex;
use array_macro::array;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

// How read() fills a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,    // read the block from the device on a miss
    Rewrite, // the caller overwrites it all; skip the device read
    Zero,    // like Rewrite, and clear the contents
}

#[derive(Clone, Copy, Debug, Default)]
struct Meta {
    dev: Option<u16>, // None if not bound to any block
    blk: u16,
    dirty: bool,
    busy: bool,
    time: u16, // last hand-out
}

#[derive(Debug)]
struct BufTable {
    clock: u16,
    bufs: [Meta; NBUFS],
}

pub struct BCache {
    devsw: Arc<DevSw>,
    data: [UnsafeCell<[u8; BSIZE]>; NBUFS],
    table: Mutex<BufTable>,
}

// data[i] is only touched through the BufGuard holding buffer i busy,
// or by the cache itself while buffer i is not busy.
unsafe impl Sync for BCache {}

impl BCache {
    pub fn new(devsw: Arc<DevSw>) -> Self {
        Self {
            devsw,
            data: array![_ => UnsafeCell::new([0; BSIZE]); NBUFS],
            table: Mutex::new(
                BufTable {
                    clock: 0,
                    bufs: [Meta::default(); NBUFS],
                },
                "bcache",
            ),
        }
    }

    pub fn read(&self, dev: u16, blk: u16, mode: Mode) -> Result<BufGuard<'_>> {
        let mut table = self.table.lock();

        // Is the block already cached?
        let hit = table
            .bufs
            .iter()
            .position(|b| b.dev == Some(dev) && b.blk == blk);
        let idx = match hit {
            Some(idx) => {
                if table.bufs[idx].busy {
                    panic!("want busy block");
                }
                if mode == Mode::Zero {
                    unsafe { (*self.data[idx].get()).fill(0) }
                }
                idx
            }
            None => {
                let idx = self.freebuf(&mut table);
                let b = &mut table.bufs[idx];
                b.dev = Some(dev);
                b.blk = blk;
                let data = unsafe { &mut *self.data[idx].get() };
                match mode {
                    Mode::Read => {
                        if let Err(e) = self.devsw.bdread(dev, blk, data) {
                            log::warn!("bread: dev {} blk {}: {}", dev, blk, e);
                            b.dev = None;
                            return Err(Io);
                        }
                    }
                    Mode::Rewrite => {}
                    Mode::Zero => data.fill(0),
                }
                idx
            }
        };
        table.clock = table.clock.wrapping_add(1);
        let now = table.clock;
        let b = &mut table.bufs[idx];
        b.busy = true;
        b.time = now;
        Ok(BufGuard { cache: self, idx })
    }

    // An anonymous zero-filled buffer bound to no block.
    pub fn zerobuf(&self) -> BufGuard<'_> {
        let mut table = self.table.lock();
        let idx = self.freebuf(&mut table);
        let b = &mut table.bufs[idx];
        b.dev = None;
        b.busy = true;
        unsafe { (*self.data[idx].get()).fill(0) }
        BufGuard { cache: self, idx }
    }

    // Pick the buffer to reuse, writing it out first if it is dirty.
    fn freebuf(&self, table: &mut BufTable) -> usize {
        let clock = table.clock;
        let mut oldest = None;
        let mut oldtime = 0;
        for (i, b) in table.bufs.iter().enumerate() {
            if !b.busy && clock.wrapping_sub(b.time) >= oldtime {
                oldest = Some(i);
                oldtime = clock.wrapping_sub(b.time);
            }
        }
        let Some(idx) = oldest else {
            log::error!("buffers: {:?}", table.bufs);
            panic!("no free buffers");
        };
        let b = &mut table.bufs[idx];
        if b.dirty {
            if let Some(dev) = b.dev {
                let data = unsafe { &*self.data[idx].get() };
                if let Err(e) = self.devsw.bdwrite(dev, b.blk, data) {
                    log::warn!("bdwrite: dev {} blk {}: {}", dev, b.blk, e);
                }
            }
            b.dirty = false;
        }
        idx
    }

    // Write out every dirty buffer. Buffers stay cached.
    pub fn sync(&self) {
        let mut table = self.table.lock();
        for (i, b) in table.bufs.iter_mut().enumerate() {
            let (Some(dev), true) = (b.dev, b.dirty) else {
                continue;
            };
            let data = unsafe { &*self.data[i].get() };
            match self.devsw.bdwrite(dev, b.blk, data) {
                Ok(_) => b.dirty = false,
                Err(e) => log::warn!("bufsync: dev {} blk {}: {}", dev, b.blk, e),
            }
        }
    }

    // Forget every cached block of `dev`. Only clean, idle buffers are
    // expected; callers sync first.
    pub fn invalidate(&self, dev: u16) {
        let mut table = self.table.lock();
        for b in table.bufs.iter_mut().filter(|b| b.dev == Some(dev)) {
            if !b.busy && !b.dirty {
                b.dev = None;
            }
        }
    }

    pub fn dump(&self) {
        let table = self.table.lock();
        for (i, b) in table.bufs.iter().enumerate() {
            log::debug!(
                "buf {}: dev {:?} blk {} dirty {} busy {} time {}",
                i,
                b.dev,
                b.blk,
                b.dirty,
                b.busy,
                b.time
            );
        }
    }
}

pub struct BufGuard<'a> {
    cache: &'a BCache,
    idx: usize,
}

impl<'a> BufGuard<'a> {
    pub fn blockno(&self) -> u16 {
        self.cache.table.lock().bufs[self.idx].blk
    }

    // Release without writing.
    pub fn brelse(self) {}

    // Deferred write: leave it dirty for eviction or sync.
    pub fn bawrite(self) {
        let mut table = self.cache.table.lock();
        let b = &mut table.bufs[self.idx];
        if b.dev.is_none() {
            panic!("bawrite: zero buffer");
        }
        b.dirty = true;
    }

    // Write through now. The buffer is clean afterwards even if the
    // write failed.
    pub fn bwrite(self) -> Result<()> {
        let mut table = self.cache.table.lock();
        let b = &mut table.bufs[self.idx];
        let Some(dev) = b.dev else {
            panic!("bwrite: zero buffer");
        };
        b.dirty = false;
        let data = unsafe { &*self.cache.data[self.idx].get() };
        match self.cache.devsw.bdwrite(dev, b.blk, data) {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("bwrite: dev {} blk {}: {}", dev, b.blk, e);
                Err(Io)
            }
        }
    }
}

impl<'a> Deref for BufGuard<'a> {
    type Target = [u8; BSIZE];
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.cache.data[self.idx].get() }
    }
}

impl<'a> DerefMut for BufGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.cache.data[self.idx].get() }
    }
}

impl<'a> Drop for BufGuard<'a> {
    fn drop(&mut self) {
        self.cache.table.lock().bufs[self.idx].busy = false;
    }
}

// Little-endian block number arrays in indirect and free-list blocks.
pub fn get_u16(buf: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([buf[2 * i], buf[2 * i + 1]])
}

pub fn put_u16(buf: &mut [u8], i: usize, v: u16) {
    buf[2 * i..2 * i + 2].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    fn cache() -> (Arc<RamDisk>, BCache) {
        let disk = Arc::new(RamDisk::new(32));
        let mut sw = DevSw::new();
        sw.set(0, 0, disk.clone()).unwrap();
        (disk, BCache::new(Arc::new(sw)))
    }

    #[test]
    fn hit_avoids_device() {
        let (disk, bc) = cache();
        bc.read(0, 5, Mode::Read).unwrap().brelse();
        bc.read(0, 5, Mode::Read).unwrap().brelse();
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    #[should_panic(expected = "want busy block")]
    fn double_checkout_panics() {
        let (_disk, bc) = cache();
        let _a = bc.read(0, 5, Mode::Read).unwrap();
        let _b = bc.read(0, 5, Mode::Read);
    }

    #[test]
    fn evicts_least_recently_used() {
        let (disk, bc) = cache();
        for blk in 1..=NBUFS as u16 {
            bc.read(0, blk, Mode::Read).unwrap().brelse();
        }
        // touch block 1 so block 2 becomes the oldest
        bc.read(0, 1, Mode::Read).unwrap().brelse();
        bc.read(0, 10, Mode::Read).unwrap().brelse();
        assert_eq!(disk.reads(), NBUFS + 1);

        // block 1 is still cached, block 2 is not
        bc.read(0, 1, Mode::Read).unwrap().brelse();
        assert_eq!(disk.reads(), NBUFS + 1);
        bc.read(0, 2, Mode::Read).unwrap().brelse();
        assert_eq!(disk.reads(), NBUFS + 2);
    }

    #[test]
    fn deferred_write_lands_on_eviction_or_sync() {
        let (disk, bc) = cache();
        let mut b = bc.read(0, 3, Mode::Zero).unwrap();
        b[0] = 0xaa;
        b.bawrite();
        assert_eq!(disk.writes(), 0);
        bc.sync();
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.image()[3 * BSIZE], 0xaa);
        bc.sync();
        assert_eq!(disk.writes(), 1);

        let mut b = bc.read(0, 4, Mode::Rewrite).unwrap();
        b[1] = 0xbb;
        b.bawrite();
        for blk in 10..10 + NBUFS as u16 {
            bc.read(0, blk, Mode::Read).unwrap().brelse();
        }
        assert_eq!(disk.image()[4 * BSIZE + 1], 0xbb);
    }

    #[test]
    fn failed_read_is_recoverable() {
        let (disk, bc) = cache();
        disk.fail_block(Some(6));
        assert_eq!(bc.read(0, 6, Mode::Read).err(), Some(Io));
        disk.fail_block(None);
        let b = bc.read(0, 6, Mode::Read).unwrap();
        assert_eq!(b[0], 0);
    }

    #[test]
    fn bwrite_clears_dirty_even_on_failure() {
        let (disk, bc) = cache();
        disk.fail_block(Some(7));
        let b = bc.read(0, 7, Mode::Zero).unwrap();
        assert_eq!(b.bwrite(), Err(Io));
        disk.fail_block(None);
        bc.sync();
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    #[should_panic(expected = "bawrite: zero buffer")]
    fn zero_buffer_cannot_be_dirtied() {
        let (_disk, bc) = cache();
        let z = bc.zerobuf();
        assert!(z.iter().all(|&c| c == 0));
        z.bawrite();
    }
}
