// Block device backed by host memory.
//
// Serves as the root disk, any other mountable disk, and the swap device.
// Transfers may be a single block, a run of blocks (swap), or an arbitrary
// byte range (character access). A block can be marked bad to make every
// transfer that touches it fail with an I/O error.

use crate::error::{Error::*, Result};
use crate::file::{Device, RawMode};
use crate::param::BSIZE;
use crate::spinlock::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct RamDisk {
    disk: Mutex<Disk>,
    reads: AtomicUsize,  // transfers from the disk
    writes: AtomicUsize, // transfers to the disk
}

struct Disk {
    data: Vec<u8>,
    bad: Option<u16>,
}

impl RamDisk {
    pub fn new(nblocks: u16) -> Self {
        Self::from_image(vec![0; nblocks as usize * BSIZE])
    }

    pub fn from_image(mut data: Vec<u8>) -> Self {
        let rem = data.len() % BSIZE;
        if rem != 0 {
            data.resize(data.len() + BSIZE - rem, 0);
        }
        Self {
            disk: Mutex::new(Disk { data, bad: None }, "ramdisk"),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn image(&self) -> Vec<u8> {
        self.disk.lock().data.clone()
    }

    pub fn nblocks(&self) -> usize {
        self.disk.lock().data.len() / BSIZE
    }

    // Make transfers touching `blk` fail; None heals the disk.
    pub fn fail_block(&self, blk: Option<u16>) {
        self.disk.lock().bad = blk;
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    // Byte range a transfer of `len` bytes covers.
    fn span(disk: &Disk, mode: RawMode, len: usize) -> Result<(usize, usize)> {
        let (start, len) = match mode {
            RawMode::Block(blk) => (blk as usize * BSIZE, BSIZE.min(len)),
            RawMode::Swap(blk) => (blk as usize * BSIZE, len),
            RawMode::Char(off) => {
                let off = off as usize;
                (off, len.min(disk.data.len().saturating_sub(off)))
            }
        };
        if start + len > disk.data.len() {
            return Err(Io);
        }
        if let Some(bad) = disk.bad {
            let bad = bad as usize * BSIZE;
            if len > 0 && start < bad + BSIZE && bad < start + len {
                return Err(Io);
            }
        }
        Ok((start, len))
    }

    fn rw(&self, mode: RawMode, dst: Option<&mut [u8]>, src: Option<&[u8]>) -> Result<usize> {
        let mut disk = self.disk.lock();
        match (dst, src) {
            (Some(dst), _) => {
                let (start, len) = Self::span(&disk, mode, dst.len())?;
                dst[..len].copy_from_slice(&disk.data[start..start + len]);
                self.reads.fetch_add(1, Ordering::Relaxed);
                Ok(len)
            }
            (None, Some(src)) => {
                let (start, len) = Self::span(&disk, mode, src.len())?;
                disk.data[start..start + len].copy_from_slice(&src[..len]);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(len)
            }
            (None, None) => Ok(0),
        }
    }
}

impl Device for RamDisk {
    fn read(&self, _minor: u16, mode: RawMode, dst: &mut [u8]) -> Result<usize> {
        self.rw(mode, Some(dst), None)
    }

    fn write(&self, _minor: u16, mode: RawMode, src: &[u8]) -> Result<usize> {
        self.rw(mode, None, Some(src))
    }

    fn name(&self) -> &'static str {
        "ramdisk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_and_swap_transfers() {
        let d = RamDisk::new(8);
        let blk = [7u8; BSIZE];
        assert_eq!(d.write(0, RawMode::Block(3), &blk), Ok(BSIZE));
        let two = [9u8; 2 * BSIZE];
        assert_eq!(d.write(0, RawMode::Swap(5), &two), Ok(2 * BSIZE));

        let mut out = [0u8; BSIZE];
        d.read(0, RawMode::Block(3), &mut out).unwrap();
        assert_eq!(out, blk);
        d.read(0, RawMode::Char(6 * BSIZE as u32 + 10), &mut out[..4])
            .unwrap();
        assert_eq!(&out[..4], &[9; 4]);
        assert_eq!(d.reads(), 2);
        assert_eq!(d.writes(), 2);

        assert_eq!(d.read(0, RawMode::Block(8), &mut out), Err(Io));
        assert_eq!(d.read(0, RawMode::Char(8 * BSIZE as u32), &mut out), Ok(0));
    }

    #[test]
    fn bad_block_fails() {
        let d = RamDisk::new(4);
        d.fail_block(Some(2));
        let mut out = [0u8; BSIZE];
        assert_eq!(d.read(0, RawMode::Block(2), &mut out), Err(Io));
        assert_eq!(d.read(0, RawMode::Block(1), &mut out), Ok(BSIZE));
        let mut run = [0u8; 3 * BSIZE];
        assert_eq!(d.read(0, RawMode::Swap(1), &mut run), Err(Io));
        d.fail_block(None);
        assert_eq!(d.read(0, RawMode::Swap(1), &mut run), Ok(3 * BSIZE));
    }
}
