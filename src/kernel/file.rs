// Device switch and open files.
//
// A device number indexes the device switch; each entry names a driver
// and the minor number it is opened with. Block devices move whole
// 512-byte blocks (raw mode 0), character devices move byte ranges at an
// offset (1), and the swap device moves multi-block images (2).
//
// Open files are two-level: a process's descriptor table holds indexes
// into the system-wide open file table, whose entries carry the file
// position and access mode and own one inode reference. dup() and fork()
// share an entry.

use array_macro::array;
use crate::error::{Error::*, Result};
use crate::fcntl::{OMode, Whence};
use crate::param::{BSIZE, NDEVTAB, OFTSIZE, UFTSIZE};
use crate::stat::{Off, Perm, F_PIPE};
use crate::start::Kernel;
use std::fmt;
use std::sync::Arc;

// How a transfer addresses the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawMode {
    Block(u16), // one block
    Char(u32),  // bytes at an offset
    Swap(u16),  // consecutive blocks from here
}

// Device functions, map this trait using dyn
pub trait Device: Send + Sync {
    fn open(&self, _minor: u16) -> Result<()> {
        Ok(())
    }
    fn close(&self, _minor: u16) -> Result<()> {
        Ok(())
    }
    fn read(&self, minor: u16, mode: RawMode, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, minor: u16, mode: RawMode, src: &[u8]) -> Result<usize>;
    fn ioctl(&self, _minor: u16, _request: u16, _data: &mut [u8]) -> Result<()> {
        Err(InvalidArgument)
    }
    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device {}", self.name())
    }
}

#[derive(Clone, Debug)]
pub struct DevEntry {
    pub minor: u16,
    pub driver: Arc<dyn Device>,
}

pub struct DevSw {
    table: [Option<DevEntry>; NDEVTAB],
}

impl fmt::Debug for DevSw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (count, v) in self.table.iter().enumerate() {
            if count != 0 {
                write!(f, ", ")?;
            }
            match v {
                Some(e) => write!(f, "{:?}/{}", e.driver, e.minor)?,
                None => write!(f, "None")?,
            }
        }
        write!(f, "]")
    }
}

impl Default for DevSw {
    fn default() -> Self {
        Self::new()
    }
}

impl DevSw {
    pub fn new() -> Self {
        Self {
            table: array![None; NDEVTAB],
        }
    }

    pub fn set(&mut self, dev: u16, minor: u16, driver: Arc<dyn Device>) -> Result<()> {
        let slot = self.table.get_mut(dev as usize).ok_or(NoSuchNode)?;
        *slot = Some(DevEntry { minor, driver });
        Ok(())
    }

    fn get(&self, dev: u16) -> Option<&DevEntry> {
        self.table.get(dev as usize).and_then(|e| e.as_ref())
    }

    pub fn validdev(&self, dev: u16) -> bool {
        self.get(dev).is_some()
    }

    pub fn d_open(&self, dev: u16) -> Result<()> {
        let e = self.get(dev).ok_or(NoSuchNode)?;
        e.driver.open(e.minor).map_err(|_| NoSuchNode)
    }

    pub fn d_close(&self, dev: u16) {
        let Some(e) = self.get(dev) else {
            panic!("d_close: bad device");
        };
        if let Err(err) = e.driver.close(e.minor) {
            log::warn!("d_close: dev {}: {}", dev, err);
        }
    }

    pub fn d_ioctl(&self, dev: u16, request: u16, data: &mut [u8]) -> Result<()> {
        let e = self.get(dev).ok_or(NoSuchNode)?;
        e.driver
            .ioctl(e.minor, request, data)
            .map_err(|_| InvalidArgument)
    }

    fn entry(&self, dev: u16, what: &str) -> &DevEntry {
        match self.get(dev) {
            Some(e) => e,
            None => panic!("{}: invalid dev", what),
        }
    }

    pub fn bdread(&self, dev: u16, blk: u16, dst: &mut [u8]) -> Result<usize> {
        let e = self.entry(dev, "bdread");
        e.driver.read(e.minor, RawMode::Block(blk), dst)
    }

    pub fn bdwrite(&self, dev: u16, blk: u16, src: &[u8]) -> Result<usize> {
        let e = self.entry(dev, "bdwrite");
        e.driver.write(e.minor, RawMode::Block(blk), src)
    }

    pub fn cdread(&self, dev: u16, off: u32, dst: &mut [u8]) -> Result<usize> {
        let e = self.entry(dev, "cdread");
        e.driver.read(e.minor, RawMode::Char(off), dst)
    }

    pub fn cdwrite(&self, dev: u16, off: u32, src: &[u8]) -> Result<usize> {
        let e = self.entry(dev, "cdwrite");
        e.driver.write(e.minor, RawMode::Char(off), src)
    }

    pub fn swapread(&self, dev: u16, blk: u16, dst: &mut [u8]) -> Result<usize> {
        let e = self.entry(dev, "swapread");
        e.driver.read(e.minor, RawMode::Swap(blk), dst)
    }

    pub fn swapwrite(&self, dev: u16, blk: u16, src: &[u8]) -> Result<usize> {
        let e = self.entry(dev, "swapwrite");
        e.driver.write(e.minor, RawMode::Swap(blk), src)
    }
}

// Open file table entry
#[derive(Clone, Copy, Debug, Default)]
pub struct Oft {
    pub ptr: Off,              // file position
    pub inode: Option<usize>,  // inode table index
    pub access: u8,            // O_RDONLY, O_WRONLY or O_RDWR
    pub refs: u8,              // descriptors sharing this entry
}

pub type OfTable = [Oft; OFTSIZE];

impl Kernel {
    pub(crate) fn oft_alloc(&self) -> Result<usize> {
        let mut oft = self.oft.lock();
        for (j, of) in oft.iter_mut().enumerate() {
            if of.refs == 0 {
                *of = Oft {
                    refs: 1,
                    ..Default::default()
                };
                return Ok(j);
            }
        }
        Err(FileTableOverflow)
    }

    pub(crate) fn oft_deref(&self, of: usize) {
        let ino = {
            let mut oft = self.oft.lock();
            let entry = &mut oft[of];
            entry.refs -= 1;
            if entry.refs == 0 {
                entry.inode.take()
            } else {
                None
            }
        };
        if let Some(ino) = ino {
            self.i_deref(ino);
        }
    }

    // Find a free slot in the descriptor table.
    pub(crate) fn uf_alloc(&self) -> Result<usize> {
        let u = self.u.lock();
        u.files.iter().position(|&f| f < 0).ok_or(FileTableOverflow)
    }

    // Descriptor to open file table index.
    pub(crate) fn uf_get(&self, fd: usize) -> Result<usize> {
        let of = match self.u.lock().files.get(fd) {
            Some(&of) if of >= 0 => of as usize,
            _ => return Err(BadFileDescriptor),
        };
        if of >= OFTSIZE {
            panic!("getinode: bad descriptor table");
        }
        Ok(of)
    }

    // Descriptor to inode table index.
    pub(crate) fn getinode(&self, fd: usize) -> Result<usize> {
        let of = self.uf_get(fd)?;
        let Some(ino) = self.oft.lock()[of].inode else {
            panic!("getinode: bad OFT");
        };
        self.magic(ino);
        Ok(ino)
    }

    pub(crate) fn doclose(&self, fd: usize) -> Result<()> {
        let ino = self.getinode(fd)?;
        let (isdev, dev) = {
            let it = self.itable.lock();
            let c = it.get(ino);
            (c.isdevice(), c.devnum())
        };
        if isdev {
            self.devsw.d_close(dev);
        }
        let of = {
            let mut u = self.u.lock();
            let of = u.files[fd];
            u.files[fd] = -1;
            of as usize
        };
        self.oft_deref(of);
        Ok(())
    }

    // Common part of read() and write(): check the descriptor against
    // the transfer direction and hand back the inode and position.
    fn rwsetup(&self, fd: usize, write: bool) -> Result<(usize, usize, Off)> {
        let of = self.uf_get(fd)?;
        let (ino, ptr, access) = {
            let oft = self.oft.lock();
            let e = &oft[of];
            (e.inode, e.ptr, e.access)
        };
        let mode = OMode::from_bits(access as u16)?;
        let allowed = if write {
            mode.is_write()
        } else {
            mode.is_read()
        };
        if !allowed {
            return Err(BadFileDescriptor);
        }
        let Some(ino) = ino else {
            panic!("getinode: bad OFT");
        };
        self.magic(ino);
        let flags = if write {
            crate::fs::A_TIME | crate::fs::M_TIME | crate::fs::C_TIME
        } else {
            crate::fs::A_TIME
        };
        self.setftime(ino, flags);
        Ok((of, ino, ptr))
    }

    fn updoff(&self, of: usize, ptr: Off) {
        self.oft.lock()[of].ptr = ptr;
    }

    pub(crate) fn fd_read(&self, fd: usize, dst: &mut [u8]) -> Result<usize> {
        let (of, ino, mut ptr) = self.rwsetup(fd, false)?;
        let r = self.readi(ino, &mut ptr, dst);
        self.updoff(of, ptr);
        r
    }

    // A pipe takes a write longer than its ring a ringful at a time,
    // storing the offset between passes.
    pub(crate) fn fd_write(&self, fd: usize, src: &[u8]) -> Result<usize> {
        let mut done = 0;
        loop {
            let (of, ino, mut ptr) = self.rwsetup(fd, true)?;
            let r = self.writei(ino, &mut ptr, &src[done..]);
            self.updoff(of, ptr);
            match r {
                Ok(n) if n > 0 && done + n < src.len() && self.getmode(ino) == F_PIPE => {
                    done += n
                }
                Ok(n) => return Ok(done + n),
                Err(_) if done > 0 => return Ok(done),
                Err(e) => return Err(e),
            }
        }
    }

    // Returns the old offset field: bytes for whence 0..2, blocks for 3..5.
    pub(crate) fn fd_seek(&self, fd: usize, offset: i16, whence: u16) -> Result<i16> {
        let ino = self.getinode(fd)?;
        if self.getmode(ino) == F_PIPE {
            return Err(IllegalSeek);
        }
        let whence = Whence::from_u16(whence)?;
        let of = self.uf_get(fd)?;
        let size = self.itable.lock().get(ino).node.size;
        let mut oft = self.oft.lock();
        let ptr = &mut oft[of].ptr;
        let retval = match whence {
            Whence::Set | Whence::Cur | Whence::End => ptr.offset,
            _ => ptr.blkno as i16,
        };
        match whence {
            Whence::Set => {
                ptr.blkno = 0;
                ptr.offset = offset;
            }
            Whence::Cur => ptr.offset = ptr.offset.wrapping_add(offset),
            Whence::End => {
                ptr.blkno = size.blkno;
                ptr.offset = size.offset.wrapping_add(offset);
            }
            Whence::SetBlk => ptr.blkno = offset as u16,
            Whence::CurBlk => ptr.blkno = ptr.blkno.wrapping_add(offset as u16),
            Whence::EndBlk => ptr.blkno = size.blkno.wrapping_add(offset as u16),
        }
        // Bring the byte offset back into the block, borrowing for negative ones.
        let off = ptr.offset;
        ptr.offset = 0;
        ptr.addoff(off as i32);
        Ok(retval)
    }

    pub(crate) fn fd_dup(&self, oldd: usize) -> Result<usize> {
        self.getinode(oldd)?;
        let of = self.uf_get(oldd)?;
        let newd = self.uf_alloc()?;
        self.u.lock().files[newd] = of as i8;
        self.oft.lock()[of].refs += 1;
        Ok(newd)
    }

    pub(crate) fn fd_dup2(&self, oldd: usize, newd: usize) -> Result<()> {
        self.getinode(oldd)?;
        if newd >= UFTSIZE {
            return Err(BadFileDescriptor);
        }
        if oldd == newd {
            return Ok(());
        }
        if self.u.lock().files[newd] >= 0 {
            self.doclose(newd)?;
        }
        let of = self.uf_get(oldd)?;
        self.u.lock().files[newd] = of as i8;
        self.oft.lock()[of].refs += 1;
        Ok(())
    }

    // Allocate a descriptor and an open file entry for `ino`, taking over
    // the caller's inode reference. On failure the reference is dropped.
    pub(crate) fn fd_install(&self, ino: usize, mode: OMode) -> Result<usize> {
        let fd = match self.uf_alloc() {
            Ok(fd) => fd,
            Err(e) => {
                self.i_deref(ino);
                return Err(e);
            }
        };
        let of = match self.oft_alloc() {
            Ok(of) => of,
            Err(e) => {
                self.i_deref(ino);
                return Err(e);
            }
        };
        {
            let mut oft = self.oft.lock();
            oft[of].inode = Some(ino);
            oft[of].access = mode.bits();
        }
        self.u.lock().files[fd] = of as i8;
        Ok(fd)
    }

    pub(crate) fn fd_pipe(&self) -> Result<(usize, usize)> {
        let ino = self.i_open(self.rootdev, 0)?.leak();
        {
            let mut it = self.itable.lock();
            let c = it.get_mut(ino);
            c.refs += 1; // one per end
            c.node.mode = F_PIPE | 0o777;
            c.node.nlink = 0;
            c.dirty = true;
        }
        let rd = match self.fd_install(ino, *OMode::new().read(true)) {
            Ok(fd) => fd,
            Err(e) => {
                self.i_deref(ino);
                return Err(e);
            }
        };
        match self.fd_install(ino, *OMode::new().write(true)) {
            Ok(wr) => Ok((rd, wr)),
            Err(e) => {
                // fd_install dropped the writer's reference already.
                let _ = self.doclose(rd);
                Err(e)
            }
        }
    }

    pub(crate) fn fd_ioctl(&self, fd: usize, request: u16, data: &mut [u8]) -> Result<()> {
        let ino = self.getinode(fd)?;
        let (isdev, dev) = {
            let it = self.itable.lock();
            let c = it.get(ino);
            (c.isdevice(), c.devnum())
        };
        if !isdev {
            return Err(NotATty);
        }
        if !self.getperm(ino).contains(Perm::OTH_WR) {
            return Err(NotPermitted);
        }
        self.devsw.d_ioctl(dev, request, data)
    }

    // Release every open descriptor of the current process.
    pub(crate) fn close_all(&self) {
        for fd in 0..UFTSIZE {
            if self.u.lock().files[fd] >= 0 {
                let _ = self.doclose(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::null::Null;

    #[test]
    fn devsw_dispatch() {
        let mut sw = DevSw::new();
        sw.set(4, 0, Arc::new(Null)).unwrap();
        assert!(sw.validdev(4));
        assert!(!sw.validdev(2));
        assert_eq!(sw.d_open(2), Err(NoSuchNode));
        assert_eq!(sw.cdwrite(4, 0, b"gone"), Ok(4));
        let mut buf = [0u8; 8];
        assert_eq!(sw.cdread(4, 0, &mut buf), Ok(0));
        assert_eq!(sw.d_ioctl(4, 0, &mut buf), Err(InvalidArgument));
        assert_eq!(sw.set(NDEVTAB as u16, 0, Arc::new(Null)), Err(NoSuchNode));
    }

    #[test]
    #[should_panic(expected = "bdread: invalid dev")]
    fn block_io_on_missing_device_panics() {
        let sw = DevSw::new();
        let mut buf = [0u8; BSIZE];
        let _ = sw.bdread(1, 0, &mut buf);
    }
}
