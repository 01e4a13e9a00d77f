// System call entry.
//
// User programs are plain functions that get a UserCtx. Every call
// goes through UserCtx::syscall(), which plays the part of the trap
// handler: it marks the process as in the kernel, runs the call,
// records the result in the control block, acts on pending signals,
// gives up the CPU if the time slice is over, and finally runs the
// handler of a caught signal, if any, back in user mode.

use crate::error::{Error, Error::*, Result};
use crate::fs::FileSys;
use crate::param::*;
use crate::proc::ProcState;
use crate::signal::{SIG_DFL, SIG_IGN};
use crate::start::{Kernel, Trap};
use crate::stat::{Stat, Time, Tms};
use core::convert::Infallible;
use std::sync::Arc;

// A signal handler. Its "address" in u.sigvec is its index in the
// process's text table.
pub type SigHandler = fn(&mut UserCtx, u16);

#[derive(Clone, Copy, Debug)]
pub enum SigAction {
    Default,
    Ignore,
    Catch(SigHandler),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SysCalls {
    Exit = 0,
    Open = 1,
    Close = 2,
    Creat = 3,
    Mknod = 4,
    Link = 5,
    Unlink = 6,
    Read = 7,
    Write = 8,
    Seek = 9,
    Chdir = 10,
    Sync = 11,
    Access = 12,
    Chmod = 13,
    Chown = 14,
    Stat = 15,
    Fstat = 16,
    Dup = 17,
    Getpid = 18,
    Getppid = 19,
    Getuid = 20,
    Umask = 21,
    Getfsys = 22,
    Execve = 23,
    Wait = 24,
    Setuid = 25,
    Setgid = 26,
    Time = 27,
    Stime = 28,
    Ioctl = 29,
    Brk = 30,
    Sbrk = 31,
    Fork = 32,
    Mount = 33,
    Umount = 34,
    Signal = 35,
    Dup2 = 36,
    Pause = 37,
    Alarm = 38,
    Kill = 39,
    Pipe = 40,
    Getgid = 41,
    Times = 42,
}

// What ends up in u.retval.
pub trait Retval {
    fn retval(&self) -> i16;
}

impl Retval for () {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for usize {
    fn retval(&self) -> i16 {
        *self as i16
    }
}

impl Retval for u16 {
    fn retval(&self) -> i16 {
        *self as i16
    }
}

impl Retval for i16 {
    fn retval(&self) -> i16 {
        *self
    }
}

impl Retval for (usize, usize) {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for (u16, u16) {
    fn retval(&self) -> i16 {
        self.0 as i16
    }
}

impl Retval for Stat {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for FileSys {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for Time {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for Tms {
    fn retval(&self) -> i16 {
        0
    }
}

impl Retval for Infallible {
    fn retval(&self) -> i16 {
        match *self {}
    }
}

pub struct UserCtx {
    k: Arc<Kernel>,
    pub(crate) text: Vec<SigHandler>,
}

impl UserCtx {
    pub(crate) fn new(k: Arc<Kernel>, text: Vec<SigHandler>) -> Self {
        Self { k, text }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.k
    }

    fn syscall<T: Retval>(
        &mut self,
        call: SysCalls,
        f: impl FnOnce(&Arc<Kernel>) -> Result<T>,
    ) -> Result<T> {
        {
            let mut u = self.k.u.lock();
            u.insys = 1;
            u.callno = call as u8;
            u.error = 0;
        }
        let r = f(&self.k);
        {
            let mut u = self.k.u.lock();
            match &r {
                Ok(v) => u.retval = v.retval(),
                Err(e) => {
                    u.error = e.errno();
                    u.retval = -1;
                }
            }
            log::trace!(
                "slot {} {:?} = {} errno {}",
                u.ptab,
                call,
                u.retval,
                u.error
            );
        }

        // Check for signals, and end of time slice.
        self.k.chksigs();
        let expired = self.k.clock.lock().runticks >= MAXTICKS;
        if expired {
            let me = self.k.curproc();
            self.k.set_status(me, ProcState::Ready);
            self.k.swapout();
        }
        self.k.u.lock().insys = 0;
        self.calltrap();
        r
    }

    // Run the handler of a caught signal. The disposition goes back to
    // the default first.
    fn calltrap(&mut self) {
        let (sig, vec) = {
            let mut u = self.k.u.lock();
            if u.cursig == 0 {
                return;
            }
            let sig = u.cursig;
            let vec = u.sigvec[sig as usize];
            u.cursig = 0;
            u.sigvec[sig as usize] = SIG_DFL;
            (sig, vec)
        };
        match self.text.get((vec as usize).wrapping_sub(PROGBASE) / 2).copied() {
            Some(handler) => handler(self, sig),
            None => log::warn!("signal {}: no handler at {:#x}", sig, vec),
        }
    }

    // One clock interrupt, taken in user mode.
    pub fn tick(&mut self) {
        self.k.clk_int();
        self.calltrap();
    }

    // User memory.

    fn user_range(addr: u16, len: usize) -> Result<core::ops::Range<usize>> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if start >= PROGBASE && end <= UDATA_ADDR => Ok(start..end),
            _ => Err(BadAddress),
        }
    }

    pub fn poke(&mut self, addr: u16, data: &[u8]) -> Result<()> {
        let range = Self::user_range(addr, data.len())?;
        self.k.ram.lock()[range].copy_from_slice(data);
        Ok(())
    }

    pub fn peek(&self, addr: u16, len: usize) -> Result<Vec<u8>> {
        let range = Self::user_range(addr, len)?;
        Ok(self.k.ram.lock()[range].to_vec())
    }

    fn peek_u16(&self, addr: usize) -> u16 {
        let ram = self.k.ram.lock();
        u16::from_le_bytes([ram[addr], ram[addr + 1]])
    }

    fn peek_str(&self, addr: usize) -> String {
        if addr >= UDATA_ADDR {
            return String::new();
        }
        let ram = self.k.ram.lock();
        let end = ram[addr..UDATA_ADDR]
            .iter()
            .position(|&c| c == 0)
            .map_or(UDATA_ADDR, |n| addr + n);
        String::from_utf8_lossy(&ram[addr..end]).into_owned()
    }

    fn peek_vec(&self, mut addr: usize) -> Vec<String> {
        let mut v = Vec::new();
        while addr + 2 <= UDATA_ADDR {
            let p = self.peek_u16(addr) as usize;
            if p == 0 {
                break;
            }
            v.push(self.peek_str(p));
            addr += 2;
        }
        v
    }

    // The argument and environment vectors exec left at the top of
    // memory.
    pub fn args(&self) -> (Vec<String>, Vec<String>) {
        let isp = self.k.u.lock().isp as usize;
        if isp == 0 {
            return (Vec::new(), Vec::new());
        }
        let argv = self.peek_u16(isp) as usize;
        (self.peek_vec(argv), self.peek_vec(isp + 4))
    }

    pub fn brk_addr(&self) -> u16 {
        self.k.u.lock().brk
    }

    // Files.

    pub fn open(&mut self, path: &str, flag: u16) -> Result<usize> {
        self.syscall(SysCalls::Open, |k| k.sys_open(path, flag))
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        self.syscall(SysCalls::Close, |k| k.sys_close(fd))
    }

    pub fn creat(&mut self, path: &str, mode: u16) -> Result<usize> {
        self.syscall(SysCalls::Creat, |k| k.sys_creat(path, mode))
    }

    pub fn mknod(&mut self, path: &str, mode: u16, dev: u16) -> Result<()> {
        self.syscall(SysCalls::Mknod, |k| k.sys_mknod(path, mode, dev))
    }

    pub fn link(&mut self, name1: &str, name2: &str) -> Result<()> {
        self.syscall(SysCalls::Link, |k| k.sys_link(name1, name2))
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.syscall(SysCalls::Unlink, |k| k.sys_unlink(path))
    }

    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.syscall(SysCalls::Read, |k| k.fd_read(fd, buf))
    }

    pub fn write(&mut self, fd: usize, buf: &[u8]) -> Result<usize> {
        self.syscall(SysCalls::Write, |k| k.fd_write(fd, buf))
    }

    pub fn seek(&mut self, fd: usize, offset: i16, whence: u16) -> Result<i16> {
        self.syscall(SysCalls::Seek, |k| k.fd_seek(fd, offset, whence))
    }

    pub fn chdir(&mut self, path: &str) -> Result<()> {
        self.syscall(SysCalls::Chdir, |k| k.sys_chdir(path))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.syscall(SysCalls::Sync, |k| {
            k.sync();
            Ok(())
        })
    }

    pub fn access(&mut self, path: &str, mode: u16) -> Result<()> {
        self.syscall(SysCalls::Access, |k| k.sys_access(path, mode))
    }

    pub fn chmod(&mut self, path: &str, mode: u16) -> Result<()> {
        self.syscall(SysCalls::Chmod, |k| k.sys_chmod(path, mode))
    }

    pub fn chown(&mut self, path: &str, owner: u16, group: u16) -> Result<()> {
        self.syscall(SysCalls::Chown, |k| k.sys_chown(path, owner, group))
    }

    pub fn stat(&mut self, path: &str) -> Result<Stat> {
        self.syscall(SysCalls::Stat, |k| k.sys_stat(path))
    }

    pub fn fstat(&mut self, fd: usize) -> Result<Stat> {
        self.syscall(SysCalls::Fstat, |k| k.sys_fstat(fd))
    }

    pub fn dup(&mut self, fd: usize) -> Result<usize> {
        self.syscall(SysCalls::Dup, |k| k.fd_dup(fd))
    }

    pub fn dup2(&mut self, oldd: usize, newd: usize) -> Result<()> {
        self.syscall(SysCalls::Dup2, |k| k.fd_dup2(oldd, newd))
    }

    pub fn umask(&mut self, mask: u16) -> u16 {
        self.syscall(SysCalls::Umask, |k| Ok(k.sys_umask(mask)))
            .unwrap_or_default()
    }

    pub fn getfsys(&mut self, dev: i16) -> Result<FileSys> {
        self.syscall(SysCalls::Getfsys, |k| k.sys_getfsys(dev))
    }

    pub fn ioctl(&mut self, fd: usize, request: u16, data: &mut [u8]) -> Result<()> {
        self.syscall(SysCalls::Ioctl, |k| k.fd_ioctl(fd, request, data))
    }

    pub fn mount(&mut self, spec: &str, dir: &str) -> Result<()> {
        self.syscall(SysCalls::Mount, |k| k.sys_mount(spec, dir))
    }

    pub fn umount(&mut self, spec: &str) -> Result<()> {
        self.syscall(SysCalls::Umount, |k| k.sys_umount(spec))
    }

    pub fn pipe(&mut self) -> Result<(usize, usize)> {
        self.syscall(SysCalls::Pipe, |k| k.fd_pipe())
    }

    // Processes.

    pub fn getpid(&mut self) -> u16 {
        self.syscall(SysCalls::Getpid, |k| {
            let me = k.curproc();
            Ok(k.ptab.lock().procs[me].pid)
        })
        .unwrap_or_default()
    }

    pub fn getppid(&mut self) -> u16 {
        self.syscall(SysCalls::Getppid, |k| {
            let me = k.curproc();
            let pt = k.ptab.lock();
            Ok(pt.procs[me].pptr.map_or(0, |pp| pt.procs[pp].pid))
        })
        .unwrap_or_default()
    }

    pub fn getuid(&mut self) -> u16 {
        self.syscall(SysCalls::Getuid, |k| {
            let me = k.curproc();
            Ok(k.ptab.lock().procs[me].uid)
        })
        .unwrap_or_default()
    }

    pub fn getgid(&mut self) -> u16 {
        self.syscall(SysCalls::Getgid, |k| Ok(k.u.lock().gid))
            .unwrap_or_default()
    }

    pub fn setuid(&mut self, uid: u16) -> Result<()> {
        self.syscall(SysCalls::Setuid, |k| {
            let me = k.curproc();
            let mut u = k.u.lock();
            let mut pt = k.ptab.lock();
            if u.euid != 0 && pt.procs[me].uid != uid {
                return Err(NotPermitted);
            }
            pt.procs[me].uid = uid;
            u.euid = uid;
            Ok(())
        })
    }

    pub fn setgid(&mut self, gid: u16) -> Result<()> {
        self.syscall(SysCalls::Setgid, |k| {
            let mut u = k.u.lock();
            if u.euid != 0 && u.gid != gid {
                return Err(NotPermitted);
            }
            u.gid = gid;
            u.egid = gid;
            Ok(())
        })
    }

    pub fn time(&mut self) -> Result<Time> {
        self.syscall(SysCalls::Time, |k| Ok(k.rdtime()))
    }

    pub fn stime(&mut self, t: Time) -> Result<()> {
        self.syscall(SysCalls::Stime, |k| {
            if k.u.lock().euid != 0 {
                return Err(NotPermitted);
            }
            k.clock.lock().tod = t.secs();
            Ok(())
        })
    }

    pub fn times(&mut self) -> Result<Tms> {
        self.syscall(SysCalls::Times, |k| {
            let etime = k.clock.lock().ticks;
            let u = k.u.lock();
            Ok(Tms {
                utime: u.utime,
                stime: u.stime,
                cutime: u.cutime,
                cstime: u.cstime,
                etime,
            })
        })
    }

    pub fn execve(&mut self, path: &str, argv: &[&str], envp: &[&str]) -> Error {
        match self.syscall(SysCalls::Execve, |k| k.execve(path, argv, envp)) {
            Err(e) => e,
            Ok(never) => match never {},
        }
    }

    pub fn brk(&mut self, addr: u16) -> Result<()> {
        self.syscall(SysCalls::Brk, |k| k.sys_brk(addr))
    }

    // Returns the old break.
    pub fn sbrk(&mut self, incr: u16) -> Result<u16> {
        self.syscall(SysCalls::Sbrk, |k| {
            let old = k.u.lock().brk;
            k.sys_brk(old.checked_add(incr).ok_or(OutOfMemory)?)?;
            Ok(old)
        })
    }

    // Returns the pid and exit status of a dead child.
    pub fn wait(&mut self) -> Result<(u16, u16)> {
        self.syscall(SysCalls::Wait, |k| k.dowait())
    }

    pub fn exit(&mut self, val: u16) -> ! {
        self.k.u.lock().callno = SysCalls::Exit as u8;
        std::panic::resume_unwind(Box::new(Trap::Exit { val, sig: 0 }))
    }

    // Start a child running `child` on a copy of this memory image.
    // Returns the child's pid.
    pub fn fork<F>(&mut self, child: F) -> Result<u16>
    where
        F: FnOnce(&mut UserCtx) + Send + 'static,
    {
        let text = self.text.clone();
        self.syscall(SysCalls::Fork, |k| k.dofork(Box::new(child), text))
    }

    // Always comes back with EINTR.
    pub fn pause(&mut self) -> Result<()> {
        self.syscall(SysCalls::Pause, |k| {
            k.psleep(None);
            Err(Interrupted)
        })
    }

    pub fn signal(&mut self, sig: u16, action: SigAction) -> Result<u16> {
        let vec = match action {
            SigAction::Default => SIG_DFL,
            SigAction::Ignore => SIG_IGN,
            SigAction::Catch(handler) => {
                let idx = match self
                    .text
                    .iter()
                    .position(|&h| h as usize == handler as usize)
                {
                    Some(idx) => idx,
                    None => {
                        self.text.push(handler);
                        self.text.len() - 1
                    }
                };
                (PROGBASE + 2 * idx) as u16
            }
        };
        self.syscall(SysCalls::Signal, |k| k.sys_signal(sig, vec))
    }

    pub fn kill(&mut self, pid: i16, sig: i16) -> Result<()> {
        self.syscall(SysCalls::Kill, |k| k.kill(pid, sig))
    }

    pub fn alarm(&mut self, secs: u16) -> u16 {
        self.syscall(SysCalls::Alarm, |k| Ok(k.alarm(secs)))
            .unwrap_or_default()
    }

    // errno of the last failed call.
    pub fn errno(&self) -> i16 {
        self.k.u.lock().error
    }
}

impl Kernel {
    pub(crate) fn sys_brk(&self, addr: u16) -> Result<()> {
        let mut u = self.u.lock();
        // Stay clear of the initial stack.
        let stack = if u.isp != 0 { u.isp as usize } else { UDATA_ADDR };
        if (addr as usize) < PROGBASE || addr as usize + 64 >= stack {
            return Err(OutOfMemory);
        }
        u.brk = addr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_numbers() {
        assert_eq!(SysCalls::Exit as u8, 0);
        assert_eq!(SysCalls::Execve as u8, 23);
        assert_eq!(SysCalls::Times as u8, 42);
        assert_eq!((1u16, 7u16).retval(), 1);
        assert_eq!(().retval(), 0);
    }

    #[test]
    fn user_addresses() {
        assert!(UserCtx::user_range(PROGBASE as u16, 16).is_ok());
        assert_eq!(UserCtx::user_range(0x10, 4), Err(BadAddress));
        assert_eq!(
            UserCtx::user_range((UDATA_ADDR - 2) as u16, 4),
            Err(BadAddress)
        );
    }
}
