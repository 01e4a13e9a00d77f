// File system image builder, shared by the mkfs tool and the tests.
//
// Disk layout:
// [ boot block | super block | inode blocks | data blocks ]
//   0            1             2..isize       isize..fsize
//
// Data blocks are handed out in order. finish() then threads every
// block that is left onto the free chain the same way the kernel frees
// blocks, and fills the superblock's inode cache.

use crate::bio::{get_u16, put_u16};
use crate::error::{Error::*, Result};
use crate::fs::*;
use crate::param::*;
use crate::stat::*;
use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes};

pub struct FsImg {
    img: Vec<u8>,
    sb: FileSys,
    freeinode: u16,
    freeblock: u16,
    dirs: Vec<u16>,
    time: Time,
}

impl FsImg {
    // An empty file system of `fsize` blocks whose data area starts at
    // block `isize`, with only the root directory in it.
    pub fn new(fsize: u16, isize: u16) -> Result<Self> {
        if isize < 3 || isize >= fsize {
            return Err(InvalidArgument);
        }
        let mut fs = Self {
            img: vec![0; fsize as usize * BSIZE],
            sb: FileSys {
                isize,
                fsize,
                ..Default::default()
            },
            freeinode: ROOTINODE,
            freeblock: isize,
            dirs: Vec::new(),
            time: Time::default(),
        };

        // Inode 0 is never handed out.
        fs.winode(
            0,
            &DInode {
                mode: F_REG,
                nlink: 1,
                ..Default::default()
            },
        );

        let root = fs.ialloc(F_DIR | 0o755)?;
        assert_eq!(root, ROOTINODE);
        fs.add_entry(root, ".", root)?;
        fs.add_entry(root, "..", root)?;
        fs.rinode_mut(root, |d| d.nlink = 2);
        fs.dirs.push(root);
        Ok(fs)
    }

    // Stamp every inode created from now on.
    pub fn set_time(&mut self, secs: u32) {
        self.time = Time::from_secs(secs);
    }

    fn wsect(&mut self, sec: u16, buf: &[u8]) {
        let at = sec as usize * BSIZE;
        self.img[at..at + buf.len()].copy_from_slice(buf);
    }

    fn rsect(&self, sec: u16) -> [u8; BSIZE] {
        let at = sec as usize * BSIZE;
        let mut buf = [0u8; BSIZE];
        buf.copy_from_slice(&self.img[at..at + BSIZE]);
        buf
    }

    fn winode(&mut self, inum: u16, ip: &DInode) {
        let at = iblock(inum) as usize * BSIZE + (inum as usize % IPB) * size_of::<DInode>();
        self.img[at..at + size_of::<DInode>()].copy_from_slice(ip.as_bytes());
    }

    pub fn rinode(&self, inum: u16) -> DInode {
        let at = iblock(inum) as usize * BSIZE + (inum as usize % IPB) * size_of::<DInode>();
        let mut din = DInode::default();
        din.as_bytes_mut()
            .copy_from_slice(&self.img[at..at + size_of::<DInode>()]);
        din
    }

    fn rinode_mut(&mut self, inum: u16, f: impl FnOnce(&mut DInode)) {
        let mut din = self.rinode(inum);
        f(&mut din);
        self.winode(inum, &din);
    }

    fn ninodes(&self) -> u16 {
        (self.sb.isize - 2) * IPB as u16
    }

    pub fn ialloc(&mut self, mode: u16) -> Result<u16> {
        if self.freeinode >= self.ninodes() {
            return Err(StorageFull);
        }
        let inum = self.freeinode;
        self.freeinode += 1;
        let din = DInode {
            mode,
            nlink: 1,
            atime: self.time,
            mtime: self.time,
            ctime: self.time,
            ..Default::default()
        };
        self.winode(inum, &din);
        Ok(inum)
    }

    fn balloc(&mut self) -> Result<u16> {
        if self.freeblock >= self.sb.fsize {
            return Err(StorageFull);
        }
        let b = self.freeblock;
        self.freeblock += 1;
        Ok(b)
    }

    // Block number in slot `i` of indirect block `blk`, allocated if empty.
    fn indirect(&mut self, blk: u16, i: usize) -> Result<u16> {
        let mut buf = self.rsect(blk);
        let mut x = get_u16(&buf, i);
        if x == 0 {
            x = self.balloc()?;
            put_u16(&mut buf, i, x);
            self.wsect(blk, &buf);
        }
        Ok(x)
    }

    fn addr(&mut self, din: &mut DInode, i: usize) -> Result<u16> {
        if din.addr[i] == 0 {
            din.addr[i] = self.balloc()?;
        }
        Ok(din.addr[i])
    }

    fn bmap(&mut self, din: &mut DInode, fbn: usize) -> Result<u16> {
        if fbn < NDIRECT {
            return self.addr(din, fbn);
        }
        let fbn = fbn - NDIRECT;
        if fbn < NINDIRECT {
            let ind = self.addr(din, NDIRECT)?;
            return self.indirect(ind, fbn);
        }
        let fbn = fbn - NINDIRECT;
        if fbn < NINDIRECT * NINDIRECT {
            let ind = self.addr(din, NDIRECT + 1)?;
            let ind2 = self.indirect(ind, fbn / NINDIRECT)?;
            return self.indirect(ind2, fbn % NINDIRECT);
        }
        Err(FileTooLarge)
    }

    pub fn iappend(&mut self, inum: u16, data: &[u8]) -> Result<()> {
        let mut din = self.rinode(inum);
        let mut off = din.size.bytes() as usize;
        let mut p = 0;
        while p < data.len() {
            let fbn = off / BSIZE;
            let x = self.bmap(&mut din, fbn)?;
            let n1 = (data.len() - p).min((fbn + 1) * BSIZE - off);
            let mut buf = self.rsect(x);
            buf[off - fbn * BSIZE..off - fbn * BSIZE + n1].copy_from_slice(&data[p..p + n1]);
            self.wsect(x, &buf);
            off += n1;
            p += n1;
        }
        din.size = Off::from_bytes(off as u32);
        self.winode(inum, &din);
        Ok(())
    }

    fn add_entry(&mut self, dir: u16, name: &str, inum: u16) -> Result<()> {
        let de = DirEnt::new(inum, name.as_bytes());
        self.iappend(dir, de.as_bytes())
    }

    pub fn lookup(&self, dir: u16, name: &str) -> Option<u16> {
        let din = self.rinode(dir);
        let size = din.size.bytes() as usize;
        let mut off = 0;
        while off < size {
            let fbn = off / BSIZE;
            let blk = match fbn {
                n if n < NDIRECT => din.addr[n],
                _ => return None,
            };
            let buf = self.rsect(blk);
            let at = off % BSIZE;
            let mut de = DirEnt::default();
            de.as_bytes_mut()
                .copy_from_slice(&buf[at..at + DIRENT_SIZE]);
            if de.ino != 0 && namecomp(name.as_bytes(), &de.name) {
                return Some(de.ino);
            }
            off += DIRENT_SIZE;
        }
        None
    }

    fn check_new(&self, parent: u16, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(InvalidArgument);
        }
        if self.lookup(parent, name).is_some() {
            return Err(AlreadyExists);
        }
        Ok(())
    }

    pub fn mkdir(&mut self, parent: u16, name: &str) -> Result<u16> {
        self.check_new(parent, name)?;
        let inum = self.ialloc(F_DIR | 0o755)?;
        self.add_entry(parent, name, inum)?;
        self.add_entry(inum, ".", inum)?;
        self.add_entry(inum, "..", parent)?;
        self.rinode_mut(inum, |d| d.nlink = 2);
        self.rinode_mut(parent, |d| d.nlink += 1);
        self.dirs.push(inum);
        Ok(inum)
    }

    pub fn add_file(&mut self, parent: u16, name: &str, mode: u16, data: &[u8]) -> Result<u16> {
        self.check_new(parent, name)?;
        let inum = self.ialloc(F_REG | (mode & MODE_MASK))?;
        self.add_entry(parent, name, inum)?;
        self.iappend(inum, data)?;
        Ok(inum)
    }

    pub fn mknod(&mut self, parent: u16, name: &str, mode: u16, dev: u16) -> Result<u16> {
        self.check_new(parent, name)?;
        let inum = self.ialloc(mode)?;
        self.add_entry(parent, name, inum)?;
        self.rinode_mut(inum, |d| d.addr[0] = dev);
        Ok(inum)
    }

    // An executable whose header names program `entry`, padded with
    // zeros to `len` bytes.
    pub fn add_exec(&mut self, parent: u16, name: &str, entry: u16, len: usize) -> Result<u16> {
        let mut data = vec![0u8; len.max(3)];
        data[0] = EMAGIC;
        data[1..3].copy_from_slice(&entry.to_le_bytes());
        self.add_file(parent, name, 0o755, &data)
    }

    pub fn blocks_used(&self) -> u16 {
        self.freeblock - self.sb.isize
    }

    // Put a block on the superblock's free list, spilling the cache
    // into the block itself when it is full.
    fn dofree(&mut self, blk: u16) {
        if self.sb.nfree as usize == NFREE {
            let mut buf = [0u8; BSIZE];
            put_u16(&mut buf, 0, self.sb.nfree as u16);
            for j in 0..NFREE {
                put_u16(&mut buf, j + 1, self.sb.free[j]);
            }
            self.wsect(blk, &buf);
            self.sb.nfree = 0;
        }
        self.sb.free[self.sb.nfree as usize] = blk;
        self.sb.nfree += 1;
        self.sb.tfree += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        // Directories always end on a block boundary.
        for dir in std::mem::take(&mut self.dirs) {
            self.rinode_mut(dir, |d| {
                if d.size.offset != 0 {
                    d.size.offset = 0;
                    d.size.blkno += 1;
                }
            });
        }

        // The chain ends in a zero entry.
        self.sb.nfree = 1;
        self.sb.free[0] = 0;
        for blk in (self.freeblock..self.sb.fsize).rev() {
            self.dofree(blk);
        }

        let mut cached = Vec::new();
        let mut tinode = 0;
        for inum in 2..self.ninodes() {
            let d = self.rinode(inum);
            if d.mode == 0 && d.nlink == 0 {
                tinode += 1;
                if cached.len() < NICACHE {
                    cached.push(inum);
                }
            }
        }
        cached.reverse();
        self.sb.ninode = cached.len() as i16;
        self.sb.inode[..cached.len()].copy_from_slice(&cached);
        self.sb.tinode = tinode;
        self.sb.time = self.time;
        self.sb.mounted = SMOUNTED;

        let sb = self.sb;
        self.wsect(SUPERBLOCK, sb.as_bytes());
        self.img
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock(img: &[u8]) -> FileSys {
        let mut sb = FileSys::default();
        sb.as_bytes_mut()
            .copy_from_slice(&img[BSIZE..BSIZE + size_of::<FileSys>()]);
        sb
    }

    #[test]
    fn fresh_image() {
        let fs = FsImg::new(100, 4).unwrap();
        assert_eq!(fs.lookup(ROOTINODE, "."), Some(ROOTINODE));
        assert_eq!(fs.lookup(ROOTINODE, ".."), Some(ROOTINODE));
        let img = fs.finish();
        let sb = superblock(&img);
        assert_eq!(sb.mounted, SMOUNTED);
        // one block for the root directory
        assert_eq!(sb.tfree, 100 - 4 - 1);
        assert_eq!(sb.tinode, 16 - 2);
        assert_eq!(sb.inode[sb.ninode as usize - 1], 2);
    }

    #[test]
    fn free_chain_links() {
        let img = FsImg::new(200, 4).unwrap().finish();
        let sb = superblock(&img);
        let total = 200 - 4 - 1;
        assert_eq!(sb.tfree as usize, total);
        // Walk the chain: every link block holds the next batch.
        let mut count = 0;
        let (mut nfree, mut free) = (sb.nfree as usize, sb.free);
        loop {
            count += nfree;
            if free[0] == 0 {
                count -= 1;
                break;
            }
            let link = free[0] as usize * BSIZE;
            nfree = get_u16(&img[link..], 0) as usize;
            for j in 0..NFREE {
                free[j] = get_u16(&img[link..], j + 1);
            }
        }
        assert_eq!(count, total);
    }

    #[test]
    fn large_files_use_indirect_blocks() {
        let mut fs = FsImg::new(600, 4).unwrap();
        let data: Vec<u8> = (0..(NDIRECT + NINDIRECT + 3) * BSIZE).map(|i| i as u8).collect();
        let ino = fs.add_file(ROOTINODE, "big", 0o644, &data).unwrap();
        let din = fs.rinode(ino);
        assert!(din.addr[NDIRECT] != 0);
        assert!(din.addr[NDIRECT + 1] != 0);
        assert_eq!(din.size.bytes() as usize, data.len());
        assert_eq!(fs.add_file(ROOTINODE, "big", 0o644, b"x"), Err(AlreadyExists));
    }
}
