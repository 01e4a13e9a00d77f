// Signals.
//
// Each process has a pending set and an ignored set in its process
// table entry, and a vector of dispositions in its control block.
// Sending only marks the signal pending (and knocks the target out of
// an interruptible sleep). The target acts on it itself, in chksigs(),
// on the way out of every system call and every time it is about to
// be switched out: the default action terminates it, a caught signal
// is remembered in u.cursig and its handler runs when control returns
// to user code.

use crate::error::{Error::*, Result};
use crate::param::{NSIGS, PROGBASE, UDATA_ADDR};
use crate::proc::{ProcState, Wait};
use crate::start::{Kernel, Trap};
use bitflags::bitflags;

pub const SIGHUP: u16 = 1;
pub const SIGINT: u16 = 2;
pub const SIGQUIT: u16 = 3;
pub const SIGILL: u16 = 4;
pub const SIGTRAP: u16 = 5;
pub const SIGIOT: u16 = 6;
pub const SIGEMT: u16 = 7;
pub const SIGFPE: u16 = 8;
pub const SIGKILL: u16 = 9;
pub const SIGBUS: u16 = 10;
pub const SIGSEGV: u16 = 11;
pub const SIGSYS: u16 = 12;
pub const SIGPIPE: u16 = 13;
pub const SIGALRM: u16 = 14;
pub const SIGTERM: u16 = 15;

// Dispositions kept in u.sigvec; anything else is a handler address.
pub const SIG_DFL: u16 = 0;
pub const SIG_IGN: u16 = 1;

bitflags! {
    #[derive(Default)]
    pub struct SigSet: u16 {
        const HUP = 1 << SIGHUP;
        const INT = 1 << SIGINT;
        const QUIT = 1 << SIGQUIT;
        const ILL = 1 << SIGILL;
        const TRAP = 1 << SIGTRAP;
        const IOT = 1 << SIGIOT;
        const EMT = 1 << SIGEMT;
        const FPE = 1 << SIGFPE;
        const KILL = 1 << SIGKILL;
        const BUS = 1 << SIGBUS;
        const SEGV = 1 << SIGSEGV;
        const SYS = 1 << SIGSYS;
        const PIPE = 1 << SIGPIPE;
        const ALRM = 1 << SIGALRM;
        const TERM = 1 << SIGTERM;
    }
}

pub fn sigmask(sig: u16) -> SigSet {
    SigSet::from_bits_truncate(1 << (sig & 0xf))
}

impl Kernel {
    // Post `sig` to the process in `slot`.
    pub(crate) fn ssig(&self, slot: usize, sig: u16) {
        let mut pt = self.ptab.lock();
        let p = &mut pt.procs[slot];
        if matches!(p.status, ProcState::Empty | ProcState::Zombie) {
            return;
        }
        if p.ignored.contains(sigmask(sig)) {
            return;
        }
        if matches!(
            p.status,
            ProcState::Pause | ProcState::Wait | ProcState::Sleep
        ) {
            p.status = ProcState::Ready;
            p.wait = Wait::Clear;
        }
        p.pending.insert(sigmask(sig));
    }

    // Post `sig` to one process, or to every process with None.
    pub(crate) fn sendsig(&self, slot: Option<usize>, sig: u16) {
        match slot {
            Some(slot) => self.ssig(slot, sig),
            None => {
                let live: Vec<usize> = {
                    let pt = self.ptab.lock();
                    (0..pt.procs.len())
                        .filter(|&i| pt.procs[i].status != ProcState::Empty)
                        .collect()
                };
                for slot in live {
                    self.ssig(slot, sig);
                }
            }
        }
    }

    // Act on the current process's pending signals. A signal left at
    // its default action does not return from here.
    pub(crate) fn chksigs(&self) {
        let me = self.curproc();
        if self.ptab.lock().procs[me].pending.is_empty() {
            return;
        }
        for j in 1..NSIGS as u16 {
            let mask = sigmask(j);
            if !self.ptab.lock().procs[me].pending.contains(mask) {
                continue;
            }
            let vec = self.u.lock().sigvec[j as usize];
            match vec {
                SIG_DFL => {
                    log::debug!("slot {} killed by signal {}", me, j);
                    std::panic::resume_unwind(Box::new(Trap::Exit { val: 0, sig: j }));
                }
                SIG_IGN => self.ptab.lock().procs[me].pending.remove(mask),
                _ => {
                    // One caught signal at a time; the rest wait their turn.
                    let mut u = self.u.lock();
                    if u.cursig == 0 {
                        u.cursig = j;
                        self.ptab.lock().procs[me].pending.remove(mask);
                    }
                }
            }
        }
    }

    // EINTR once a caught signal is due. Blocking calls check this
    // before every sleep.
    pub(crate) fn interrupted(&self) -> Result<()> {
        self.chksigs();
        if self.u.lock().cursig != 0 {
            return Err(Interrupted);
        }
        Ok(())
    }

    // Set the disposition of `sig`; returns the old one.
    pub(crate) fn sys_signal(&self, sig: u16, vec: u16) -> Result<u16> {
        if sig < 1 || sig == SIGKILL || sig as usize >= NSIGS {
            return Err(InvalidArgument);
        }
        let me = self.curproc();
        if vec == SIG_IGN {
            self.ptab.lock().procs[me].ignored.insert(sigmask(sig));
        } else {
            if vec != SIG_DFL && ((vec as usize) < PROGBASE || vec as usize >= UDATA_ADDR) {
                return Err(BadAddress);
            }
            self.ptab.lock().procs[me].ignored.remove(sigmask(sig));
        }
        let mut u = self.u.lock();
        let old = u.sigvec[sig as usize];
        u.sigvec[sig as usize] = vec;
        Ok(old)
    }

    pub(crate) fn kill(&self, pid: i16, sig: i16) -> Result<()> {
        if sig <= 0 || sig > SIGTERM as i16 {
            return Err(InvalidArgument);
        }
        let slot = {
            let pt = self.ptab.lock();
            pt.procs
                .iter()
                .position(|p| p.status != ProcState::Empty && p.pid as i16 == pid)
        };
        match slot {
            Some(slot) => {
                self.sendsig(Some(slot), sig as u16);
                Ok(())
            }
            None => Err(InvalidArgument),
        }
    }

    // Arrange for SIGALRM in `secs` seconds; returns what was left of
    // the previous alarm.
    pub(crate) fn alarm(&self, secs: u16) -> u16 {
        let me = self.curproc();
        let mut pt = self.ptab.lock();
        std::mem::replace(&mut pt.procs[me].alarm, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(sigmask(SIGHUP).bits(), 2);
        assert_eq!(sigmask(SIGTERM), SigSet::TERM);
        let mut s = SigSet::default();
        s.insert(sigmask(SIGALRM) | sigmask(SIGINT));
        assert!(s.contains(SigSet::ALRM));
        s.remove(SigSet::ALRM);
        assert_eq!(s, SigSet::INT);
    }
}
