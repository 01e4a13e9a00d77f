// File system implementation. Four layers:
//   - Blocks: allocator for raw disk blocks, through the superblock's
//     free list.
//   - Files: inode allocator, the in-core inode table, reading,
//     writing, metadata.
//   - Directories: inode with special contents (list of other inodes!)
//   - Names: paths like /usr/bin/sh for convenient naming.
//
// This file contains the low-level file system manipulation
// routines. The (higher-level) system call implementations
// are in sysfile.rs and file.rs.
//
// Disk layout:
// [ boot block | super block | inode blocks | data blocks ]
//   block 0      block 1       2..isize       isize..fsize
//
// Free blocks form a chain of link blocks. The superblock caches up to
// 50 free block numbers; when its cache runs dry, the last block
// handed out holds the next batch as [count, 50 numbers]. A zero entry
// ends the chain. Free inodes are cached the same way but are found
// again by scanning the inode blocks.

use crate::bio::{get_u16, put_u16, Mode};
use crate::error::{Error::*, Result};
use crate::param::*;
use crate::proc::Event;
use crate::start::Kernel;
use crate::stat::*;
use core::mem::size_of;
use std::ops::Deref;
use zerocopy::{AsBytes, FromBytes};

pub const NADDR: usize = 20; // block addresses per inode
pub const NDIRECT: usize = 18;
pub const NINDIRECT: usize = BSIZE / size_of::<u16>();
pub const DIRSIZ: usize = 14;
pub const NFREE: usize = 50; // superblock free block cache
pub const NICACHE: usize = 50; // superblock free inode cache
pub const IPB: usize = BSIZE / size_of::<DInode>(); // inodes per block
pub const DIRENT_SIZE: usize = size_of::<DirEnt>();
pub const SUPERBLOCK: u16 = 1;

// A pipe is a ring over the direct blocks of an unlinked inode.
pub const PIPE_BLOCKS: u16 = NDIRECT as u16;
pub const PIPE_SIZE: u32 = 16 * BSIZE as u32;

// setftime() flags
pub const A_TIME: u16 = 1;
pub const M_TIME: u16 = 2;
pub const C_TIME: u16 = 4;

// Inode number to the block holding it.
pub const fn iblock(ino: u16) -> u16 {
    (ino >> 3) + 2
}

// On-disk inode structure
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct DInode {
    pub mode: u16,
    pub nlink: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: Off,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
    pub addr: [u16; NADDR], // 18 direct, single indirect, double indirect
}

// Superblock, block 1 of every file system.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes)]
pub struct FileSys {
    pub mounted: i16, // SMOUNTED when healthy
    pub isize: u16,   // first data block
    pub fsize: u16,   // blocks in the file system
    pub nfree: i16,
    pub free: [u16; NFREE],
    pub ninode: i16,
    pub inode: [u16; NICACHE],
    pub fmod: i16, // modified since the last sync
    pub time: Time,
    pub tfree: u16, // free blocks, all told
    pub tinode: u16, // free inodes, all told
}

impl Default for FileSys {
    fn default() -> Self {
        Self {
            mounted: 0,
            isize: 0,
            fsize: 0,
            nfree: 0,
            free: [0; NFREE],
            ninode: 0,
            inode: [0; NICACHE],
            fmod: 0,
            time: Time::default(),
            tfree: 0,
            tinode: 0,
        }
    }
}

impl FileSys {
    fn baddev(&self) -> bool {
        self.mounted != SMOUNTED
    }

    // Inode numbers that may be handed out.
    fn inode_range(&self) -> core::ops::Range<u16> {
        2..(self.isize.saturating_sub(2)).saturating_mul(IPB as u16)
    }

    fn ninodes(&self) -> u16 {
        self.isize.saturating_sub(2).saturating_mul(IPB as u16)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct DirEnt {
    pub ino: u16,
    pub name: [u8; DIRSIZ],
}

impl DirEnt {
    pub fn new(ino: u16, name: &[u8]) -> Self {
        let mut ent = Self {
            ino,
            name: [0; DIRSIZ],
        };
        let len = name
            .iter()
            .take(DIRSIZ)
            .position(|&c| c == 0 || c == b'/')
            .unwrap_or(name.len().min(DIRSIZ));
        ent.name[..len].copy_from_slice(&name[..len]);
        ent
    }
}

// Mount table entry
#[derive(Clone, Copy, Debug, Default)]
pub struct FsEntry {
    pub sb: FileSys,
    pub mntpt: Option<usize>, // inode table index of the covered directory
}

// In-core inode
#[derive(Clone, Copy, Debug, Default)]
pub struct CInode {
    pub magic: u16,
    pub dev: u16,
    pub num: u16,
    pub node: DInode,
    pub refs: u8,
    pub dirty: bool,
}

impl CInode {
    pub fn isdevice(&self) -> bool {
        self.node.mode & 0o020000 != 0
    }

    pub fn devnum(&self) -> u16 {
        self.node.addr[0]
    }

    pub fn getmode(&self) -> u16 {
        self.node.mode & F_MASK
    }
}

#[derive(Debug)]
pub struct ITable {
    pub inodes: [CInode; ITABSIZE],
    nexti: usize,
}

impl Default for ITable {
    fn default() -> Self {
        Self {
            inodes: [CInode::default(); ITABSIZE],
            nexti: 0,
        }
    }
}

impl ITable {
    pub fn get(&self, idx: usize) -> &CInode {
        let c = &self.inodes[idx];
        if c.magic != CMAGIC {
            panic!("magic: Corrupt inode");
        }
        c
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut CInode {
        let c = &mut self.inodes[idx];
        if c.magic != CMAGIC {
            panic!("magic: Corrupt inode");
        }
        c
    }
}

// A counted reference to an in-core inode, given back on drop.
#[derive(Debug)]
pub struct Inode<'k> {
    k: &'k Kernel,
    idx: usize,
}

impl<'k> Inode<'k> {
    // Wrap a reference the caller already holds.
    pub(crate) fn new(k: &'k Kernel, idx: usize) -> Self {
        Self { k, idx }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    // Hand the reference over to whoever stores the index.
    pub fn leak(self) -> usize {
        let idx = self.idx;
        core::mem::forget(self);
        idx
    }

    pub fn dup(&self) -> Self {
        self.k.i_ref(self.idx);
        Self::new(self.k, self.idx)
    }

    pub fn node(&self) -> CInode {
        *self.k.itable.lock().get(self.idx)
    }
}

impl<'k> Drop for Inode<'k> {
    fn drop(&mut self) {
        self.k.i_deref(self.idx);
    }
}

// A path name.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq)]
pub struct Path {
    inner: str,
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl Deref for Path {
    type Target = str;
    fn deref(&self) -> &str {
        &self.inner
    }
}

impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    // The last component; empty if the path ends in a slash.
    pub fn file_name(&self) -> &str {
        match self.inner.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.inner,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    // Get next path element from path as name &str,
    // the element following the name as &Path
    //
    // Examples:
    //   skip_elem("a/bb/c") = Some(("a", "/bb/c")),
    //   skip_elem("///a//bb") = Some(("a", "//bb")),
    //   skip_elem("a") = Some(("a", ""))
    //   skip_elem("") = skip_elem("////") = None
    pub fn skip_elem(&self) -> Option<(&str, &Path)> {
        let rest = self.inner.trim_start_matches('/');
        if rest.is_empty() {
            return None;
        }
        let end = rest.find('/').unwrap_or(rest.len());
        Some((&rest[..end], Path::new(&rest[end..])))
    }
}

// Compare a path component with a directory entry name. Only the
// first DIRSIZ characters count; a component ends at NUL or '/'.
pub fn namecomp(n1: &[u8], n2: &[u8]) -> bool {
    let mut i = 0;
    while i < n1.len() && n1[i] != 0 && n1[i] != b'/' {
        if i >= n2.len() || n1[i] != n2[i] {
            return false;
        }
        i += 1;
        if i == DIRSIZ {
            return true;
        }
    }
    i >= n2.len() || n2[i] == 0 || n2[i] == b'/'
}

impl Kernel {
    // Blocks.

    // Put device `dev` in the mount table, covering `mntpt`.
    pub(crate) fn fmount(&self, dev: u16, mntpt: Option<usize>) -> Result<()> {
        if dev as usize >= NDEVS || self.devsw.d_open(dev).is_err() {
            panic!("fmount: Cant open filesystem");
        }
        let mut sb = FileSys::default();
        {
            let buf = self.bcache.read(dev, SUPERBLOCK, Mode::Read)?;
            sb.as_bytes_mut()
                .copy_from_slice(&buf[..size_of::<FileSys>()]);
        }
        if sb.mounted != SMOUNTED || sb.isize >= sb.fsize {
            log::warn!("fmount: no file system on dev {}", dev);
            return Err(InvalidArgument);
        }
        if let Some(m) = mntpt {
            self.i_ref(m);
        }
        log::info!(
            "mount dev {}: {} blocks, {} free, {} free inodes",
            dev,
            sb.fsize,
            sb.tfree,
            sb.tinode
        );
        self.fs.lock()[dev as usize] = FsEntry { sb, mntpt };
        Ok(())
    }

    // Superblock of a mounted device, stamped and marked modified.
    fn getdev<'a>(fs: &'a mut [FsEntry; NDEVS], dev: u16, now: Time) -> &'a mut FileSys {
        match fs.get_mut(dev as usize) {
            Some(e) if e.sb.mounted != 0 => {
                e.sb.time = now;
                e.sb.fmod = 1;
                &mut e.sb
            }
            _ => panic!("getdev: bad dev"),
        }
    }

    fn validblk(sb: &FileSys, num: u16) {
        if sb.mounted == 0 {
            panic!("validblk: not mounted");
        }
        if num < sb.isize || num >= sb.fsize {
            panic!("validblk: invalid block");
        }
    }

    // Allocate a zeroed block on `dev`.
    pub(crate) fn blk_alloc(&self, dev: u16) -> Result<u16> {
        let now = self.rdtime();
        let newno = {
            let mut fs = self.fs.lock();
            let sb = Self::getdev(&mut fs, dev, now);
            if sb.baddev() {
                return Err(StorageFull);
            }
            if sb.nfree <= 0 || sb.nfree as usize > NFREE {
                return Err(Self::corrupt_blocks(sb));
            }
            sb.nfree -= 1;
            let newno = sb.free[sb.nfree as usize];
            if newno == 0 {
                if sb.tfree != 0 {
                    return Err(Self::corrupt_blocks(sb));
                }
                sb.nfree += 1;
                return Err(StorageFull);
            }

            // See if we must refill the cache.
            if sb.nfree == 0 {
                let buf = match self.bcache.read(dev, newno, Mode::Read) {
                    Ok(buf) => buf,
                    Err(e) => {
                        sb.nfree += 1;
                        return Err(e);
                    }
                };
                sb.nfree = get_u16(&*buf, 0) as i16;
                for j in 0..NFREE {
                    sb.free[j] = get_u16(&*buf, j + 1);
                }
            }

            Self::validblk(sb, newno);

            if sb.tfree == 0 {
                return Err(Self::corrupt_blocks(sb));
            }
            sb.tfree -= 1;
            newno
        };

        self.bcache.read(dev, newno, Mode::Zero)?.bawrite();
        Ok(newno)
    }

    fn corrupt_blocks(sb: &mut FileSys) -> crate::error::Error {
        log::warn!("blk_alloc: corrupt");
        sb.mounted = 1;
        StorageFull
    }

    pub(crate) fn blk_free(&self, dev: u16, blk: u16) {
        if blk == 0 {
            return;
        }
        let now = self.rdtime();
        let mut fs = self.fs.lock();
        let sb = Self::getdev(&mut fs, dev, now);
        if sb.baddev() {
            return;
        }
        Self::validblk(sb, blk);

        if sb.nfree as usize == NFREE {
            // blk becomes a link holding the current cache.
            match self.bcache.read(dev, blk, Mode::Zero) {
                Ok(mut buf) => {
                    put_u16(&mut *buf, 0, sb.nfree as u16);
                    for j in 0..NFREE {
                        put_u16(&mut *buf, j + 1, sb.free[j]);
                    }
                    buf.bawrite();
                }
                Err(e) => log::warn!("blk_free: dev {} blk {}: {}", dev, blk, e),
            }
            sb.nfree = 0;
        }

        sb.tfree += 1;
        sb.free[sb.nfree as usize] = blk;
        sb.nfree += 1;
    }

    // Inodes.

    // Find an unused inode number on `dev`.
    pub(crate) fn i_alloc(&self, dev: u16) -> Result<u16> {
        let now = self.rdtime();
        loop {
            let isize = {
                let mut fs = self.fs.lock();
                let sb = Self::getdev(&mut fs, dev, now);
                if sb.baddev() {
                    return Err(Self::corrupt_inodes(sb));
                }
                if sb.ninode > 0 {
                    if sb.tinode == 0 {
                        return Err(Self::corrupt_inodes(sb));
                    }
                    sb.ninode -= 1;
                    let ino = sb.inode[sb.ninode as usize];
                    if !sb.inode_range().contains(&ino) {
                        return Err(Self::corrupt_inodes(sb));
                    }
                    sb.tinode -= 1;
                    return Ok(ino);
                }
                sb.isize
            };

            // We must scan the inodes, and fill up the cache.
            self.sync(); // make on-disk inodes consistent
            let mut found = Vec::with_capacity(NICACHE);
            'scan: for blk in 2..isize {
                let buf = self.bcache.read(dev, blk, Mode::Read)?;
                for j in 0..IPB {
                    let mut d = DInode::default();
                    d.as_bytes_mut()
                        .copy_from_slice(&buf[j * size_of::<DInode>()..(j + 1) * size_of::<DInode>()]);
                    if d.mode == 0 && d.nlink == 0 {
                        found.push((IPB * (blk as usize - 2) + j) as u16);
                        if found.len() == NICACHE {
                            break 'scan;
                        }
                    }
                }
            }

            let mut fs = self.fs.lock();
            let sb = Self::getdev(&mut fs, dev, now);
            if found.is_empty() {
                if sb.tinode != 0 {
                    return Err(Self::corrupt_inodes(sb));
                }
                return Err(StorageFull);
            }
            sb.ninode = found.len() as i16;
            sb.inode[..found.len()].copy_from_slice(&found);
        }
    }

    fn corrupt_inodes(sb: &mut FileSys) -> crate::error::Error {
        log::warn!("i_alloc: corrupt superblock");
        sb.mounted = 1;
        StorageFull
    }

    pub(crate) fn i_free(&self, dev: u16, ino: u16) {
        let now = self.rdtime();
        let mut fs = self.fs.lock();
        let sb = Self::getdev(&mut fs, dev, now);
        if sb.baddev() {
            return;
        }
        if !sb.inode_range().contains(&ino) {
            panic!("i_free: bad ino");
        }
        sb.tinode += 1;
        if (sb.ninode as usize) < NICACHE {
            sb.inode[sb.ninode as usize] = ino;
            sb.ninode += 1;
        }
    }

    // Bring inode `ino` of `dev` into the inode table, or allocate a
    // new one when `ino` is 0. The returned reference is counted.
    pub(crate) fn i_open(&self, dev: u16, ino: u16) -> Result<Inode<'_>> {
        if dev as usize >= NDEVS {
            panic!("i_open: Bad dev");
        }
        let new = ino == 0;
        let ino = if new { self.i_alloc(dev)? } else { ino };

        let ninodes = self.fs.lock()[dev as usize].sb.ninodes();
        if ino < ROOTINODE || ino >= ninodes {
            log::warn!("i_open: bad inode number");
            return Err(InvalidArgument);
        }

        let (idx, cached) = {
            let mut it = self.itable.lock();
            let mut free = None;
            let mut found = None;
            let mut j = it.nexti;
            for _ in 0..ITABSIZE {
                it.nexti = j;
                j = (j + 1) % ITABSIZE;
                let c = &it.inodes[j];
                if c.refs == 0 {
                    free = Some(j);
                }
                if c.magic == CMAGIC && c.dev == dev && c.num == ino {
                    found = Some(j);
                    break;
                }
            }
            match (found, free) {
                (Some(j), _) => (j, true),
                (None, Some(j)) => (j, false),
                (None, None) => return Err(FileTableOverflow),
            }
        };

        if !cached {
            let node = self.read_dinode(dev, ino)?;
            self.itable.lock().inodes[idx] = CInode {
                magic: CMAGIC,
                dev,
                num: ino,
                node,
                refs: 0,
                dirty: false,
            };
        }

        let mut it = self.itable.lock();
        let c = it.get_mut(idx);
        let ok = if new {
            c.node.nlink == 0 && c.node.mode & F_MASK == 0
        } else {
            c.node.nlink != 0 && c.node.mode & F_MASK != 0
        };
        if !ok {
            log::warn!("i_open: bad disk inode");
            return Err(InvalidArgument);
        }
        c.refs += 1;
        Ok(Inode::new(self, idx))
    }

    fn read_dinode(&self, dev: u16, ino: u16) -> Result<DInode> {
        let buf = self.bcache.read(dev, iblock(ino), Mode::Read)?;
        let off = (ino as usize % IPB) * size_of::<DInode>();
        let mut node = DInode::default();
        node.as_bytes_mut()
            .copy_from_slice(&buf[off..off + size_of::<DInode>()]);
        Ok(node)
    }

    pub(crate) fn magic(&self, idx: usize) {
        self.itable.lock().get(idx);
    }

    pub(crate) fn i_ref(&self, idx: usize) {
        let mut it = self.itable.lock();
        let c = it.get_mut(idx);
        c.refs += 1;
        if c.refs as usize == 2 * ITABSIZE {
            panic!("too many i-refs");
        }
    }

    // Drop a reference. The last reference to an unlinked inode frees
    // its blocks and the inode itself; a modified inode is written back.
    pub(crate) fn i_deref(&self, idx: usize) {
        let (pipe, refs, nlink) = {
            let mut it = self.itable.lock();
            let c = it.get_mut(idx);
            if c.refs == 0 {
                panic!("inode freed");
            }
            c.refs -= 1;
            (c.getmode() == F_PIPE, c.refs, c.node.nlink)
        };
        if pipe {
            self.wakeup(Event::Inode(idx));
        }
        if refs == 0 && nlink == 0 {
            self.f_trunc(idx);
        }
        if refs != 0 {
            return;
        }
        let release = {
            let mut it = self.itable.lock();
            let c = it.get_mut(idx);
            if !c.dirty {
                None
            } else if c.node.nlink == 0 {
                c.node.mode = 0;
                Some(Some((c.dev, c.num)))
            } else {
                Some(None)
            }
        };
        if let Some(unlinked) = release {
            if let Some((dev, num)) = unlinked {
                self.i_free(dev, num);
            }
            self.wr_inode(idx);
        }
    }

    // Copy an in-core inode to disk, now.
    pub(crate) fn wr_inode(&self, idx: usize) {
        let (dev, num, node) = {
            let mut it = self.itable.lock();
            let c = it.get_mut(idx);
            c.dirty = false;
            (c.dev, c.num, c.node)
        };
        match self.bcache.read(dev, iblock(num), Mode::Read) {
            Ok(mut buf) => {
                let off = (num as usize % IPB) * size_of::<DInode>();
                buf[off..off + size_of::<DInode>()].copy_from_slice(node.as_bytes());
                if let Err(e) = buf.bwrite() {
                    log::warn!("wr_inode: dev {} ino {}: {}", dev, num, e);
                }
            }
            Err(e) => log::warn!("wr_inode: dev {} ino {}: {}", dev, num, e),
        }
    }

    // Free every block of a disk file.
    pub(crate) fn f_trunc(&self, idx: usize) {
        let (dev, addr, isdev) = {
            let it = self.itable.lock();
            let c = it.get(idx);
            (c.dev, c.node.addr, c.isdevice())
        };
        // A device node's addr[0] is a device number, not a block.
        if !isdev {
            self.freeblk(dev, addr[NADDR - 1], 2);
            self.freeblk(dev, addr[NADDR - 2], 1);
            for &blk in addr[..NDIRECT].iter().rev() {
                self.freeblk(dev, blk, 0);
            }
        }
        let mut it = self.itable.lock();
        let c = it.get_mut(idx);
        if !isdev {
            c.node.addr = [0; NADDR];
        }
        c.node.size = Off::default();
        c.dirty = true;
    }

    fn freeblk(&self, dev: u16, blk: u16, level: u8) {
        if blk == 0 {
            return;
        }
        if level > 0 {
            let mut ptrs = [0u16; NINDIRECT];
            match self.bcache.read(dev, blk, Mode::Read) {
                Ok(buf) => {
                    for (j, p) in ptrs.iter_mut().enumerate() {
                        *p = get_u16(&*buf, j);
                    }
                }
                Err(e) => log::warn!("freeblk: dev {} blk {}: {}", dev, blk, e),
            }
            for &p in ptrs.iter().rev() {
                self.freeblk(dev, p, level - 1);
            }
        }
        self.blk_free(dev, blk);
    }

    // Return the disk block holding logical block `bn` of the file.
    // Unpopulated blocks are allocated (zeroed) when `alloc` is true;
    // otherwise they come back as None and nothing changes.
    pub(crate) fn bmap(&self, idx: usize, bn: u16, alloc: bool) -> Result<Option<u16>> {
        let (dev, mode) = {
            let it = self.itable.lock();
            let c = it.get(idx);
            (c.dev, c.getmode())
        };
        if mode == F_BDEV {
            return Ok(Some(bn));
        }

        // Blocks 0..17 are direct blocks.
        if (bn as usize) < NDIRECT {
            return self.bmap_slot(idx, dev, bn as usize, alloc);
        }

        // Addresses 18 and 19 have single and double indirect blocks.
        let mut bn = bn - NDIRECT as u16;
        let mut sh: i32 = 0;
        let mut j = 2;
        if bn & 0xff00 != 0 {
            // bn > 255, so double indirect
            sh = 8;
            bn -= NINDIRECT as u16;
            j = 1;
        }

        let Some(mut nb) = self.bmap_slot(idx, dev, NADDR - j, alloc)? else {
            return Ok(None);
        };

        // Fetch through the indirect blocks.
        while j <= 2 {
            let mut bp = self.bcache.read(dev, nb, Mode::Read)?;
            let i = ((bn >> sh) & 0xff) as usize;
            nb = get_u16(&*bp, i);
            if nb == 0 {
                if !alloc {
                    return Ok(None);
                }
                nb = self.blk_alloc(dev)?;
                put_u16(&mut *bp, i, nb);
                bp.bawrite();
            }
            sh -= 8;
            j += 1;
        }
        Ok(Some(nb))
    }

    fn bmap_slot(&self, idx: usize, dev: u16, slot: usize, alloc: bool) -> Result<Option<u16>> {
        let nb = self.itable.lock().get(idx).node.addr[slot];
        if nb != 0 {
            return Ok(Some(nb));
        }
        if !alloc {
            return Ok(None);
        }
        let nb = self.blk_alloc(dev)?;
        let mut it = self.itable.lock();
        let c = it.get_mut(idx);
        c.node.addr[slot] = nb;
        c.dirty = true;
        Ok(Some(nb))
    }

    // Read from an inode at `off`, advancing it. Pipes block while
    // empty as long as a writer remains.
    pub(crate) fn readi(&self, idx: usize, off: &mut Off, dst: &mut [u8]) -> Result<usize> {
        let c = *self.itable.lock().get(idx);
        let mut dev = c.dev;
        let pipe = c.getmode() == F_PIPE;
        let toread = match c.getmode() {
            F_DIR | F_REG => {
                let avail = c.node.size.bytes().saturating_sub(off.bytes());
                dst.len().min(avail as usize)
            }
            F_PIPE => {
                loop {
                    let (size, refs) = {
                        let it = self.itable.lock();
                        let c = it.get(idx);
                        (c.node.size.bytes(), c.refs)
                    };
                    if size != 0 || refs == 1 {
                        break dst.len().min(size as usize);
                    }
                    self.interrupted()?;
                    self.psleep(Some(Event::Inode(idx)));
                }
            }
            F_BDEV => {
                dev = c.devnum();
                dst.len()
            }
            F_CDEV => {
                let n = self.devsw.cdread(c.devnum(), off.bytes(), dst)?;
                off.addoff(n as i32);
                return Ok(n);
            }
            _ => return Err(NoSuchDevice),
        };

        let mut done = 0;
        while done < toread {
            let amount = (toread - done).min(BSIZE - off.offset as usize);
            let start = off.offset as usize;
            let bp = match self.bmap(idx, off.blkno, false)? {
                Some(pblk) => self.bcache.read(dev, pblk, Mode::Read)?,
                None => self.bcache.zerobuf(),
            };
            dst[done..done + amount].copy_from_slice(&bp[start..start + amount]);
            bp.brelse();
            off.addoff(amount as i32);
            done += amount;
            if pipe {
                if off.blkno >= PIPE_BLOCKS {
                    off.blkno = 0;
                }
                self.itable
                    .lock()
                    .get_mut(idx)
                    .node
                    .size
                    .addoff(-(amount as i32));
                self.wakeup(Event::Inode(idx));
            }
        }
        Ok(done)
    }

    // Wait for room in a pipe. A write the ring can hold goes in whole;
    // a longer one takes whatever is free. EPIPE (and SIGPIPE) once no
    // reader remains.
    fn pipe_room(&self, idx: usize, want: usize) -> Result<usize> {
        loop {
            let (size, refs) = {
                let it = self.itable.lock();
                let c = it.get(idx);
                (c.node.size.bytes(), c.refs)
            };
            let free = PIPE_SIZE.saturating_sub(size) as usize;
            let n = match want {
                w if w <= free => w,
                w if w > PIPE_SIZE as usize => free,
                _ => 0,
            };
            if n > 0 || want == 0 {
                return Ok(n);
            }
            if refs == 1 {
                self.ssig(self.curproc(), crate::signal::SIGPIPE);
                return Err(BrokenPipe);
            }
            self.interrupted()?;
            self.psleep(Some(Event::Inode(idx)));
        }
    }

    // Write to an inode at `off`, advancing it. A write that runs out of
    // space stops short, and so does a pipe write longer than the ring.
    pub(crate) fn writei(&self, idx: usize, off: &mut Off, mut src: &[u8]) -> Result<usize> {
        let c = *self.itable.lock().get(idx);
        let mut dev = c.dev;
        let pipe = c.getmode() == F_PIPE;
        match c.getmode() {
            F_BDEV => dev = c.devnum(),
            F_DIR | F_REG => {}
            F_PIPE => {
                let n = self.pipe_room(idx, src.len())?;
                src = &src[..n];
            }
            F_CDEV => {
                let n = self.devsw.cdwrite(c.devnum(), off.bytes(), src)?;
                off.addoff(n as i32);
                return Ok(n);
            }
            _ => return Err(NoSuchDevice),
        }

        let mut done = 0;
        let mut err = None;
        while done < src.len() {
            let start = off.offset as usize;
            let amount = (src.len() - done).min(BSIZE - start);
            let pblk = match self.bmap(idx, off.blkno, true) {
                Ok(Some(pblk)) => pblk,
                Ok(None) => break,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            };
            // A whole block is overwritten; its old contents do not matter.
            let mode = if amount == BSIZE {
                Mode::Rewrite
            } else {
                Mode::Read
            };
            let mut bp = match self.bcache.read(dev, pblk, mode) {
                Ok(bp) => bp,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            };
            bp[start..start + amount].copy_from_slice(&src[done..done + amount]);
            bp.bawrite();
            off.addoff(amount as i32);
            done += amount;
            if pipe {
                if off.blkno >= PIPE_BLOCKS {
                    off.blkno = 0;
                }
                self.itable
                    .lock()
                    .get_mut(idx)
                    .node
                    .size
                    .addoff(amount as i32);
                self.wakeup(Event::Inode(idx));
            }
        }

        // Update size if file grew
        if !pipe {
            let mut it = self.itable.lock();
            let c = it.get_mut(idx);
            if off.bytes() > c.node.size.bytes() {
                c.node.size = *off;
                c.dirty = true;
            }
        }
        match err {
            Some(e) if done == 0 => Err(e),
            _ => Ok(done),
        }
    }

    // Directories.

    // Look `name` up in directory `wd`.
    pub(crate) fn srch_dir(&self, wd: usize, name: &[u8]) -> Result<Option<Inode<'_>>> {
        let (dev, size) = {
            let it = self.itable.lock();
            let c = it.get(wd);
            (c.dev, c.node.size)
        };
        let nblocks = size.blkno + if size.offset != 0 { 1 } else { 0 };
        for curblock in 0..nblocks {
            let Some(pblk) = self.bmap(wd, curblock, false)? else {
                continue;
            };
            let inum = {
                let buf = self.bcache.read(dev, pblk, Mode::Read)?;
                buf.chunks(DIRENT_SIZE).find_map(|ent| {
                    let mut d = DirEnt::default();
                    d.as_bytes_mut().copy_from_slice(ent);
                    namecomp(name, &d.name).then_some(d.ino)
                })
            };
            if let Some(inum) = inum {
                return self.i_open(dev, inum).map(Some);
            }
        }
        Ok(None)
    }

    // If `ino` is covered by a mounted file system, trade it for that
    // file system's root.
    pub(crate) fn srch_mt<'a>(&'a self, ino: Inode<'a>) -> Result<Inode<'a>> {
        let dev = {
            let fs = self.fs.lock();
            fs.iter()
                .position(|e| e.sb.mounted == SMOUNTED && e.mntpt == Some(ino.idx()))
        };
        match dev {
            Some(dev) => {
                drop(ino);
                self.i_open(dev as u16, ROOTINODE)
            }
            None => Ok(ino),
        }
    }

    // Rename the entry `old` in directory `wd` to `new`, pointing at
    // inode number `nindex` (0 for none). An empty `old` takes a free
    // slot or extends the directory.
    pub(crate) fn ch_link(&self, wd: usize, old: &[u8], new: &[u8], nindex: u16) -> Result<()> {
        if !self.getperm(wd).contains(Perm::OTH_WR) {
            return Err(NotPermitted);
        }

        // Search the directory for the desired slot.
        let mut off = Off::default();
        let mut ent = DirEnt::default();
        let found = loop {
            let n = self.readi(wd, &mut off, ent.as_bytes_mut())?;
            if n == 0 {
                break false;
            }
            if namecomp(old, &ent.name) {
                break true;
            }
        };
        if !found && !old.is_empty() {
            return Err(NotFound);
        }

        // Reusing an existing slot: back up over it.
        if found {
            off.addoff(-(DIRENT_SIZE as i32));
        }
        let ent = DirEnt::new(nindex, new);
        self.writei(wd, &mut off, ent.as_bytes())?;

        self.setftime(wd, A_TIME | M_TIME | C_TIME);

        // Directories always end on a block boundary.
        let mut it = self.itable.lock();
        let c = it.get_mut(wd);
        if c.node.size.offset != 0 {
            c.node.size.offset = 0;
            c.node.size.blkno += 1;
        }
        Ok(())
    }

    // Create a regular file called `path`'s last component in `parent`.
    pub(crate) fn newfile<'k>(&'k self, parent: Inode<'k>, path: &Path) -> Result<Inode<'k>> {
        let dev = parent.node().dev;
        let nindex = self.i_open(dev, 0)?;
        let (euid, egid) = {
            let u = self.u.lock();
            (u.euid, u.egid)
        };
        let num = {
            let mut it = self.itable.lock();
            let c = it.get_mut(nindex.idx());
            c.node.mode = F_REG; // for the time being
            c.node.nlink = 1;
            c.node.uid = euid;
            c.node.gid = egid;
            c.node.size = Off::default();
            c.node.addr = [0; NADDR];
            c.num
        };
        self.wr_inode(nindex.idx());

        if let Err(e) = self.ch_link(parent.idx(), b"", path.file_name().as_bytes(), num) {
            // Nothing names it; let the last reference free it.
            self.itable.lock().get_mut(nindex.idx()).node.nlink = 0;
            return Err(e);
        }
        Ok(nindex)
    }

    // Names.

    // Look up `path`. Returns the inode, if it exists, and the directory
    // its last component was searched in.
    pub(crate) fn namex(&self, path: &Path) -> Result<(Option<Inode<'_>>, Inode<'_>)> {
        let start = if path.is_absolute() {
            self.root()
        } else {
            self.u.lock().cwd as usize
        };
        self.i_ref(start);
        let mut wd = Inode::new(self, start);
        let mut ninode = Some(wd.dup());

        let mut path = path;
        loop {
            // See if we are at a mount point.
            if let Some(n) = ninode.take() {
                ninode = Some(self.srch_mt(n)?);
            }
            let Some((name, rest)) = path.skip_elem() else {
                break;
            };
            let Some(n) = ninode.take() else {
                return Err(NotFound);
            };
            wd = n;
            if self.getmode(wd.idx()) != F_DIR {
                return Err(NotADirectory);
            }
            if !self.getperm(wd.idx()).contains(Perm::OTH_EX) {
                return Err(NotPermitted);
            }

            // See if we are going up through a mount point.
            let c = wd.node();
            if name == ".." && c.num == ROOTINODE && c.dev != self.rootdev {
                if let Some(m) = self.fs.lock()[c.dev as usize].mntpt {
                    self.i_ref(m);
                    wd = Inode::new(self, m);
                }
            }

            ninode = self.srch_dir(wd.idx(), name.as_bytes())?;
            path = rest;
        }
        Ok((ninode, wd))
    }

    pub(crate) fn n_open(&self, path: &Path) -> Result<Inode<'_>> {
        let (ninode, _wd) = self.namex(path)?;
        ninode.ok_or(NotFound)
    }

    // Permissions the current process has on an inode, as OTH_* bits.
    pub(crate) fn getperm(&self, idx: usize) -> Perm {
        let (euid, egid) = {
            let u = self.u.lock();
            (u.euid, u.egid)
        };
        if euid == 0 {
            return Perm::OTH_RD | Perm::OTH_WR | Perm::OTH_EX;
        }
        let node = self.itable.lock().get(idx).node;
        let mode = if node.uid == euid {
            node.mode >> 6
        } else if node.gid == egid {
            node.mode >> 3
        } else {
            node.mode
        };
        Perm::from_bits_truncate(mode & 0o7)
    }

    pub(crate) fn setftime(&self, idx: usize, flag: u16) {
        let now = self.rdtime();
        let mut it = self.itable.lock();
        let c = it.get_mut(idx);
        c.dirty = true;
        if flag & A_TIME != 0 {
            c.node.atime = now;
        }
        if flag & C_TIME != 0 {
            c.node.ctime = now;
        }
        if flag & M_TIME != 0 {
            c.node.mtime = now;
        }
    }

    pub(crate) fn getmode(&self, idx: usize) -> u16 {
        self.itable.lock().get(idx).getmode()
    }

    // Write back every modified inode, superblock and buffer.
    pub fn sync(&self) {
        let dirty: Vec<usize> = {
            let it = self.itable.lock();
            (0..ITABSIZE)
                .filter(|&i| it.inodes[i].refs > 0 && it.inodes[i].dirty)
                .collect()
        };
        for idx in dirty {
            self.wr_inode(idx);
        }

        for dev in 0..NDEVS as u16 {
            let sb = {
                let mut fs = self.fs.lock();
                let sb = &mut fs[dev as usize].sb;
                if sb.mounted == SMOUNTED && sb.fmod != 0 {
                    sb.fmod = 0;
                    Some(*sb)
                } else {
                    None
                }
            };
            let Some(sb) = sb else {
                continue;
            };
            match self.bcache.read(dev, SUPERBLOCK, Mode::Zero) {
                Ok(mut buf) => {
                    buf[..size_of::<FileSys>()].copy_from_slice(sb.as_bytes());
                    if let Err(e) = buf.bwrite() {
                        log::warn!("sync: superblock of dev {}: {}", dev, e);
                    }
                }
                Err(e) => log::warn!("sync: superblock of dev {}: {}", dev, e),
            }
        }

        self.bcache.sync();
    }

    pub(crate) fn stat_of(&self, idx: usize) -> Stat {
        let c = *self.itable.lock().get(idx);
        Stat {
            dev: c.dev as i16,
            ino: c.num,
            mode: c.node.mode,
            nlink: c.node.nlink,
            uid: c.node.uid,
            gid: c.node.gid,
            rdev: c.node.addr[0],
            size: c.node.size,
            atime: c.node.atime,
            mtime: c.node.mtime,
            ctime: c.node.ctime,
        }
    }

    pub fn idump(&self) {
        let it = self.itable.lock();
        for (i, c) in it.inodes.iter().enumerate().filter(|(_, c)| c.refs > 0) {
            log::debug!(
                "inode {}: dev {} num {} mode {:o} nlink {} refs {} dirty {} size {:?}",
                i,
                c.dev,
                c.num,
                c.node.mode,
                c.node.nlink,
                c.refs,
                c.dirty,
                c.node.size
            );
        }
        drop(it);
        self.bcache.dump();
        self.dump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::FsImg;
    use crate::ramdisk::RamDisk;
    use crate::Program;
    use std::sync::Arc;

    fn booted(init: Program) {
        let img = FsImg::new(400, 4).unwrap().finish();
        let k = Kernel::builder()
            .device(ROOTDEV, 0, Arc::new(RamDisk::from_image(img)))
            .device(SWAPDEV, 0, Arc::new(RamDisk::new(PTABSIZE as u16 * SWAP_SLOT + 1)))
            .build()
            .unwrap();
        assert_eq!(k.run(init), 0);
    }

    #[test]
    fn on_disk_sizes() {
        assert_eq!(size_of::<DInode>(), 64);
        assert_eq!(IPB, 8);
        assert_eq!(size_of::<DirEnt>(), 16);
        assert!(size_of::<FileSys>() <= BSIZE);
        assert_eq!(iblock(1), 2);
        assert_eq!(iblock(17), 4);
    }

    #[test]
    fn name_comparison() {
        let mut name = [0u8; DIRSIZ];
        name[..3].copy_from_slice(b"bin");
        assert!(namecomp(b"bin", &name));
        assert!(namecomp(b"bin/sh", &name));
        assert!(!namecomp(b"bi", &name));
        assert!(!namecomp(b"bins", &name));
        assert!(namecomp(b"", &[0u8; DIRSIZ]));

        let long = DirEnt::new(3, b"abcdefghijklmnopq");
        assert_eq!(&long.name, b"abcdefghijklmn");
        assert!(namecomp(b"abcdefghijklmnXYZ", &long.name));
    }

    #[test]
    fn path_elements() {
        let p = Path::new("///usr//bin/sh");
        let (a, rest) = p.skip_elem().unwrap();
        assert_eq!(a, "usr");
        let (b, rest) = rest.skip_elem().unwrap();
        assert_eq!(b, "bin");
        let (c, rest) = rest.skip_elem().unwrap();
        assert_eq!(c, "sh");
        assert!(rest.skip_elem().is_none());
        assert_eq!(p.file_name(), "sh");
        assert_eq!(Path::new("dir/").file_name(), "");
        assert_eq!(Path::new("plain").file_name(), "plain");
    }

    #[test]
    fn free_list_spills_and_refills() {
        booted(|ctx| {
            let k = ctx.kernel().clone();
            let before = ctx.getfsys(ROOTDEV as i16).unwrap();
            let n = 2 * NFREE + 7;
            let blks: Vec<u16> = (0..n).map(|_| k.blk_alloc(ROOTDEV).unwrap()).collect();

            let mid = ctx.getfsys(ROOTDEV as i16).unwrap();
            assert_eq!(mid.tfree as usize, before.tfree as usize - n);
            let mut uniq = blks.clone();
            uniq.sort();
            uniq.dedup();
            assert_eq!(uniq.len(), n);
            assert!(blks.iter().all(|&b| b >= mid.isize && b < mid.fsize));

            // Freed in reverse, so the chain ends up as it started.
            for &b in blks.iter().rev() {
                k.blk_free(ROOTDEV, b);
            }
            let after = ctx.getfsys(ROOTDEV as i16).unwrap();
            assert_eq!(after.tfree, before.tfree);
            assert_eq!(after.nfree, before.nfree);
            assert_eq!(after.free, before.free);

            // The link blocks written on the way down read back.
            let again: Vec<u16> = (0..n).map(|_| k.blk_alloc(ROOTDEV).unwrap()).collect();
            assert_eq!(again, blks);
        });
    }

    #[test]
    fn bmap_lookup_leaves_holes_alone() {
        booted(|ctx| {
            let k = ctx.kernel().clone();
            let fd = ctx.creat("/sparse", 0o644).unwrap();
            ctx.write(fd, b"x").unwrap();
            let ino = ctx.fstat(fd).unwrap().ino;
            let ip = k.i_open(ROOTDEV, ino).unwrap();
            k.wr_inode(ip.idx());
            let clean = ip.node();
            assert!(!clean.dirty);

            assert_eq!(k.bmap(ip.idx(), 0, false), Ok(Some(clean.node.addr[0])));
            assert_eq!(k.bmap(ip.idx(), 5, false), Ok(None));
            assert_eq!(k.bmap(ip.idx(), NDIRECT as u16 + 3, false), Ok(None));
            let after = ip.node();
            assert_eq!(after.node.addr, clean.node.addr);
            assert!(!after.dirty);

            // Allocating through the indirect block takes two blocks.
            let tfree = ctx.getfsys(ROOTDEV as i16).unwrap().tfree;
            let blk = k.bmap(ip.idx(), NDIRECT as u16 + 3, true).unwrap();
            assert!(blk.is_some());
            let grown = ip.node();
            assert_ne!(grown.node.addr[NDIRECT], 0);
            assert!(grown.dirty);
            assert_eq!(ctx.getfsys(ROOTDEV as i16).unwrap().tfree, tfree - 2);
        });
    }
}
