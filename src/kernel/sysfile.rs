//
// File-system system calls.
// Mostly argument checking, since we don't trust
// user code, and calls into file.rs and fs.rs.
//

use crate::error::{Error::*, Result};
use crate::fcntl::{omode, OMode};
use crate::fs::{FileSys, Path, A_TIME, C_TIME, M_TIME};
use crate::param::{CMAGIC, NDEVS, ROOTINODE, SMOUNTED};
use crate::start::Kernel;
use crate::stat::*;

impl Kernel {
    fn super_user(&self) -> bool {
        self.u.lock().euid == 0
    }

    pub(crate) fn sys_open(&self, path: &str, flag: u16) -> Result<usize> {
        let mode = OMode::from_bits(flag)?;
        let ino = self.n_open(Path::new(path))?;

        let perm = self.getperm(ino.idx());
        if (mode.is_read() && !perm.contains(Perm::OTH_RD))
            || (mode.is_write() && !perm.contains(Perm::OTH_WR))
        {
            return Err(NotPermitted);
        }
        if self.getmode(ino.idx()) == F_DIR && mode.is_write() {
            return Err(IsADirectory);
        }
        let node = ino.node();
        if node.isdevice() && self.devsw.d_open(node.devnum()).is_err() {
            return Err(NoSuchNode);
        }
        self.fd_install(ino.leak(), mode)
    }

    pub(crate) fn sys_close(&self, fd: usize) -> Result<()> {
        self.doclose(fd)
    }

    pub(crate) fn sys_creat(&self, path: &str, mode: u16) -> Result<usize> {
        let path = Path::new(path);
        let (ino, parent) = self.namex(path)?;
        let ino = match ino {
            Some(ino) => {
                drop(parent);
                if self.getmode(ino.idx()) == F_DIR {
                    return Err(IsADirectory);
                }
                if !self.getperm(ino.idx()).contains(Perm::OTH_WR) {
                    return Err(PermissionDenied);
                }
                if self.getmode(ino.idx()) == F_REG {
                    // Truncate the file to zero length and rewind
                    // everybody who has it open.
                    self.f_trunc(ino.idx());
                    let mut oft = self.oft.lock();
                    for of in oft.iter_mut().filter(|of| of.inode == Some(ino.idx())) {
                        of.ptr = Off::default();
                    }
                }
                ino
            }
            None => {
                let ino = self.newfile(parent, path)?;
                let mask = self.u.lock().mask;
                self.itable.lock().get_mut(ino.idx()).node.mode =
                    F_REG | (mode & MODE_MASK & !mask);
                self.setftime(ino.idx(), A_TIME | M_TIME | C_TIME);
                self.wr_inode(ino.idx());
                ino
            }
        };
        self.fd_install(ino.leak(), OMode::from_bits(omode::WRONLY)?)
    }

    pub(crate) fn sys_link(&self, name1: &str, name2: &str) -> Result<()> {
        let ino = self.n_open(Path::new(name1))?;
        if self.getmode(ino.idx()) == F_DIR && !self.super_user() {
            return Err(NotPermitted);
        }

        let name2 = Path::new(name2);
        let (existing, parent) = self.namex(name2)?;
        if existing.is_some() {
            return Err(AlreadyExists);
        }
        let node = ino.node();
        if parent.node().dev != node.dev {
            return Err(CrossesDevices);
        }

        self.ch_link(parent.idx(), b"", name2.file_name().as_bytes(), node.num)?;

        self.itable.lock().get_mut(ino.idx()).node.nlink += 1;
        self.wr_inode(ino.idx());
        self.setftime(ino.idx(), C_TIME);
        Ok(())
    }

    pub(crate) fn sys_unlink(&self, path: &str) -> Result<()> {
        let path = Path::new(path);
        let (ino, pino) = self.namex(path)?;
        let ino = ino.ok_or(NotFound)?;

        if self.getmode(ino.idx()) == F_DIR && !self.super_user() {
            return Err(NotPermitted);
        }

        // Remove the directory entry.
        self.ch_link(pino.idx(), path.file_name().as_bytes(), b"", 0)?;

        // Decrease the link count of the inode.
        let bad = {
            let mut it = self.itable.lock();
            let c = it.get_mut(ino.idx());
            if c.node.nlink == 0 {
                c.node.nlink = 1;
                true
            } else {
                c.node.nlink -= 1;
                false
            }
        };
        if bad {
            log::warn!("_unlink: bad nlink");
        }
        self.setftime(ino.idx(), C_TIME);
        Ok(())
    }

    pub(crate) fn sys_chdir(&self, path: &str) -> Result<()> {
        let newcwd = self.n_open(Path::new(path))?;
        if self.getmode(newcwd.idx()) != F_DIR {
            return Err(NotADirectory);
        }
        let old = {
            let mut u = self.u.lock();
            std::mem::replace(&mut u.cwd, newcwd.leak() as u16)
        };
        self.i_deref(old as usize);
        Ok(())
    }

    pub(crate) fn sys_mknod(&self, path: &str, mode: u16, dev: u16) -> Result<()> {
        if !self.super_user() {
            return Err(NotPermitted);
        }
        let path = Path::new(path);
        let (ino, parent) = self.namex(path)?;
        if ino.is_some() {
            return Err(AlreadyExists);
        }

        let ino = self.newfile(parent, path)?;
        let mask = self.u.lock().mask;
        {
            let mut it = self.itable.lock();
            let c = it.get_mut(ino.idx());
            c.node.mode = mode & !mask;
            c.node.addr[0] = if c.isdevice() { dev } else { 0 };
        }
        self.setftime(ino.idx(), A_TIME | M_TIME | C_TIME);
        self.wr_inode(ino.idx());
        Ok(())
    }

    // Check `mode` (OTH_* bits) against the real rather than the
    // effective ids.
    pub(crate) fn sys_access(&self, path: &str, mode: u16) -> Result<()> {
        if mode & 0o7 != 0 && path.is_empty() {
            return Err(NotFound);
        }
        let me = self.curproc();
        let uid = self.ptab.lock().procs[me].uid;
        let (euid, egid) = {
            let mut u = self.u.lock();
            let saved = (u.euid, u.egid);
            u.euid = uid;
            u.egid = u.gid;
            saved
        };

        let r = self.n_open(Path::new(path)).and_then(|ino| {
            let missing = Perm::from_bits_truncate(mode & 0o7) - self.getperm(ino.idx());
            if missing.is_empty() {
                Ok(())
            } else {
                Err(NotPermitted)
            }
        });

        let mut u = self.u.lock();
        u.euid = euid;
        u.egid = egid;
        r
    }

    fn owned(&self, path: &str) -> Result<crate::fs::Inode<'_>> {
        let ino = self.n_open(Path::new(path))?;
        if ino.node().node.uid != self.u.lock().euid && !self.super_user() {
            return Err(NotPermitted);
        }
        Ok(ino)
    }

    pub(crate) fn sys_chmod(&self, path: &str, mode: u16) -> Result<()> {
        let ino = self.owned(path)?;
        {
            let mut it = self.itable.lock();
            let c = it.get_mut(ino.idx());
            c.node.mode = (mode & MODE_MASK) | (c.node.mode & F_MASK);
        }
        self.setftime(ino.idx(), C_TIME);
        Ok(())
    }

    pub(crate) fn sys_chown(&self, path: &str, owner: u16, group: u16) -> Result<()> {
        let ino = self.owned(path)?;
        {
            let mut it = self.itable.lock();
            let c = it.get_mut(ino.idx());
            c.node.uid = owner;
            c.node.gid = group;
        }
        self.setftime(ino.idx(), C_TIME);
        Ok(())
    }

    pub(crate) fn sys_stat(&self, path: &str) -> Result<Stat> {
        let ino = self.n_open(Path::new(path))?;
        Ok(self.stat_of(ino.idx()))
    }

    pub(crate) fn sys_fstat(&self, fd: usize) -> Result<Stat> {
        let ino = self.getinode(fd)?;
        Ok(self.stat_of(ino))
    }

    pub(crate) fn sys_umask(&self, mask: u16) -> u16 {
        let mut u = self.u.lock();
        std::mem::replace(&mut u.mask, mask & 0o777)
    }

    pub(crate) fn sys_getfsys(&self, dev: i16) -> Result<FileSys> {
        let fs = self.fs.lock();
        match fs.get(dev as usize) {
            Some(e) if dev >= 0 && e.sb.mounted == SMOUNTED => Ok(e.sb),
            _ => Err(NoSuchNode),
        }
    }

    // Mount the block device named by `spec` on directory `dir`.
    pub(crate) fn sys_mount(&self, spec: &str, dir: &str) -> Result<()> {
        if !self.super_user() {
            return Err(NotPermitted);
        }
        let sino = self.n_open(Path::new(spec))?;
        let dino = self.n_open(Path::new(dir))?;

        if self.getmode(sino.idx()) != F_BDEV {
            return Err(NotBlockDevice);
        }
        if self.getmode(dino.idx()) != F_DIR {
            return Err(NotADirectory);
        }

        let dev = sino.node().devnum();
        if dev as usize >= NDEVS || self.devsw.d_open(dev).is_err() {
            return Err(NoSuchNode);
        }

        let d = dino.node();
        if self.fs.lock()[dev as usize].sb.mounted != 0 || d.refs != 1 || d.num == ROOTINODE {
            return Err(ResourceBusy);
        }

        self.sync();

        self.fmount(dev, Some(dino.idx())).map_err(|_| ResourceBusy)
    }

    pub(crate) fn sys_umount(&self, spec: &str) -> Result<()> {
        if !self.super_user() {
            return Err(NotPermitted);
        }
        let sino = self.n_open(Path::new(spec))?;
        if self.getmode(sino.idx()) != F_BDEV {
            return Err(NotBlockDevice);
        }

        let dev = sino.node().devnum();
        if !self.devsw.validdev(dev) || dev as usize >= NDEVS {
            return Err(NoSuchNode);
        }
        if self.fs.lock()[dev as usize].sb.mounted == 0 {
            return Err(InvalidArgument);
        }
        {
            let it = self.itable.lock();
            if it.inodes.iter().any(|c| c.refs > 0 && c.dev == dev) {
                return Err(ResourceBusy);
            }
        }

        self.sync();
        let mntpt = {
            let mut fs = self.fs.lock();
            let e = &mut fs[dev as usize];
            e.sb.mounted = 0;
            e.mntpt.take()
        };
        if let Some(m) = mntpt {
            self.i_deref(m);
        }

        // Nothing cached for the device may outlive the mount.
        {
            let mut it = self.itable.lock();
            for c in it.inodes.iter_mut() {
                if c.magic == CMAGIC && c.dev == dev && c.refs == 0 {
                    c.magic = 0;
                }
            }
        }
        self.bcache.invalidate(dev);
        log::info!("umount dev {}", dev);
        Ok(())
    }
}
