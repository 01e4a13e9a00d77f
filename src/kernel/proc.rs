use crate::error::{Error::*, Result};
use crate::param::*;
use crate::signal::SigSet;
use crate::start::{Entry, Kernel};
use crate::stat::Time;
use crate::swtch::Halt;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

// Per-CPU state. Every process thread carries its own copy, but only
// the thread holding the baton is "on the CPU".
#[derive(Debug, Default)]
pub struct Cpu {
    pub noff: usize,                // Depth of interrupts lock(lock_mycpu() depth).
    pub nest: Vec<&'static str>, // manage nest for debugging.
}

thread_local! {
    static CPU: RefCell<Cpu> = RefCell::new(Cpu::default());
}

pub struct Cpus;

impl Cpus {
    // mask the clock on mycpu().
    // if all `IntrLock` are dropped, the clock is unmasked again.
    pub fn lock_mycpu(name: &'static str) -> IntrLock {
        CPU.with(|c| c.borrow_mut().locked(name))
    }

    // Are clock interrupts enabled?
    pub fn intr_get() -> bool {
        CPU.with(|c| c.borrow().noff == 0)
    }
}

impl Cpu {
    fn locked(&mut self, name: &'static str) -> IntrLock {
        self.noff += 1;
        self.nest.push(name);
        IntrLock {
            _not_send: PhantomData,
        }
    }

    pub fn unlock(&mut self) {
        assert!(self.noff >= 1, "unlock");
        self.nest.pop();
        self.noff -= 1;
    }
}

// Proof that the clock is masked. Bound to the thread that took it.
#[derive(Debug)]
pub struct IntrLock {
    _not_send: PhantomData<*const ()>,
}

impl Drop for IntrLock {
    fn drop(&mut self) {
        CPU.with(|c| c.borrow_mut().unlock())
    }
}

// Process states, in the order the scheduler compares them:
// anything above Running is blocked on something.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcState {
    #[default]
    Empty,
    Running,
    Ready,
    Sleep,  // interruptible wait for an event
    Pause,
    Forking,
    Wait, // in wait() for a child
    Zombie,
}

// Things a process can sleep on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Proc(usize),  // a process table slot; wait() sleeps on its own
    Inode(usize), // an inode table slot; pipes
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Wait {
    #[default]
    Clear,
    On(Event),
    // A zombie keeps its CPU totals here until it is reaped.
    Ticks { utime: Time, stime: Time },
}

// Per-process state
#[derive(Clone, Copy, Debug, Default)]
pub struct Proc {
    pub status: ProcState,
    pub pid: u16,
    pub uid: u16,
    pub pptr: Option<usize>, // parent slot
    pub swap: u16,           // first block of the swap region
    pub alarm: u16,          // seconds until SIGALRM
    pub exitval: u16,        // (code << 8) | signal
    pub wait: Wait,
    pub pending: SigSet,
    pub ignored: SigSet,
}

#[derive(Debug)]
pub struct PTab {
    pub procs: [Proc; PTABSIZE],
    cursor: usize, // round-robin position of the scheduler
    nextpid: u16,
    pub initproc: usize,
}

impl PTab {
    pub fn new() -> Self {
        Self {
            procs: [Proc::default(); PTABSIZE],
            cursor: 0,
            nextpid: 0,
            initproc: 0,
        }
    }
}

impl Default for PTab {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Clock {
    pub ticks: Time,   // since boot
    pub sec: u16,      // ticks into the current second
    pub tod: u32,      // seconds, time of day
    pub runticks: u16, // ticks the running process has had
}

impl Kernel {
    pub(crate) fn curproc(&self) -> usize {
        self.u.lock().ptab as usize
    }

    pub(crate) fn set_status(&self, slot: usize, status: ProcState) {
        self.ptab.lock().procs[slot].status = status;
    }

    pub(crate) fn rdtime(&self) -> Time {
        Time::from_secs(self.clock.lock().tod)
    }

    // Take an empty slot and give it a pid nobody else is using.
    pub(crate) fn ptab_alloc(&self) -> Option<usize> {
        let mut pt = self.ptab.lock();
        let slot = pt.procs.iter().position(|p| p.status == ProcState::Empty)?;
        let pid = loop {
            let old = pt.nextpid;
            pt.nextpid = if old > MAXPID { 1 } else { old + 1 };
            let pid = pt.nextpid;
            if !pt
                .procs
                .iter()
                .any(|p| p.status != ProcState::Empty && p.pid == pid)
            {
                break pid;
            }
        };
        pt.procs[slot] = Proc {
            pid,
            status: ProcState::Forking,
            ..Default::default()
        };
        Some(slot)
    }

    // Turn the control block in self.u into the child's: it belongs to
    // slot p, starts with clean counters, and holds its own references
    // to the cwd and every open file.
    pub(crate) fn newproc(&self, p: usize) {
        let now = self.rdtime();
        let (parent, cwd, files) = {
            let mut u = self.u.lock();
            let parent = u.ptab as usize;
            u.ptab = p as u16;
            u.utime = Time::default();
            u.stime = Time::default();
            u.cutime = Time::default();
            u.cstime = Time::default();
            u.time = now;
            u.cursig = 0;
            u.error = 0;
            (parent, u.cwd, u.files)
        };
        {
            let mut pt = self.ptab.lock();
            let (ignored, uid) = (pt.procs[parent].ignored, pt.procs[parent].uid);
            let child = &mut pt.procs[p];
            child.swap = p as u16 * SWAP_SLOT + 1;
            child.pptr = Some(parent);
            child.ignored = ignored;
            child.uid = uid;
        }
        if self.itable.lock().inodes[cwd as usize].refs > 0 {
            self.i_ref(cwd as usize);
        }
        let mut oft = self.oft.lock();
        for &of in files.iter().filter(|&&of| of >= 0) {
            oft[of as usize].refs += 1;
        }
    }

    // The scheduler: round-robin over the table from where it stopped
    // last time, first READY wins. With nothing ready the clock keeps
    // ticking, in case an alarm is about to go off.
    pub(crate) fn getproc(&self) -> usize {
        loop {
            {
                let mut pt = self.ptab.lock();
                for _ in 0..PTABSIZE {
                    pt.cursor = (pt.cursor + 1) % PTABSIZE;
                    match pt.procs[pt.cursor].status {
                        ProcState::Running => panic!("getproc: extra running"),
                        ProcState::Ready => return pt.cursor,
                        _ => {}
                    }
                }
                let alarms = pt
                    .procs
                    .iter()
                    .any(|p| p.alarm > 0 && p.status > ProcState::Running && p.status != ProcState::Zombie);
                if !alarms {
                    log::error!("no process can run");
                    drop(pt);
                    self.dump();
                    panic!("getproc: no runnable process");
                }
            }
            self.clock_tick();
        }
    }

    // Block until wakeup(event). None means pause(): only a signal
    // ends it. Sleeping on one's own slot means wait().
    pub(crate) fn psleep(&self, event: Option<Event>) {
        assert!(Cpus::intr_get(), "psleep: interrupts masked");
        let me = self.curproc();
        {
            let mut pt = self.ptab.lock();
            let p = &mut pt.procs[me];
            if p.status != ProcState::Running {
                panic!("psleep: voodoo");
            }
            p.status = match event {
                None => ProcState::Pause,
                Some(Event::Proc(s)) if s == me => ProcState::Wait,
                Some(_) => ProcState::Sleep,
            };
            p.wait = event.map_or(Wait::Clear, Wait::On);
        }
        self.swapout();
    }

    // Make every process blocked on `event` runnable.
    pub(crate) fn wakeup(&self, event: Event) {
        let mut pt = self.ptab.lock();
        for p in pt.procs.iter_mut() {
            if p.status > ProcState::Running && p.wait == Wait::On(event) {
                p.status = ProcState::Ready;
                p.wait = Wait::Clear;
            }
        }
    }

    // Create a child that will run `entry` with a copy of the current
    // memory image. The parent carries on; the child becomes READY once
    // its image is on the swap device.
    pub(crate) fn dofork(self: &Arc<Self>, entry: Entry, text: Vec<crate::syscall::SigHandler>) -> Result<u16> {
        let Some(p) = self.ptab_alloc() else {
            return Err(WouldBlock);
        };
        let pid = self.ptab.lock().procs[p].pid;

        let parent = *self.u.lock();
        self.newproc(p);
        let child = *self.u.lock();
        self.swrite(p);
        *self.u.lock() = parent;

        if let Err(e) = self.spawn(p, pid, entry, text) {
            log::warn!("fork: cannot start pid {}: {}", pid, e);
            self.undo_newproc(&child);
            self.ptab.lock().procs[p] = Proc::default();
            return Err(WouldBlock);
        }
        self.set_status(p, ProcState::Ready);
        Ok(pid)
    }

    fn undo_newproc(&self, child: &crate::swap::UData) {
        if self.itable.lock().inodes[child.cwd as usize].refs > 0 {
            self.i_deref(child.cwd as usize);
        }
        for &of in child.files.iter().filter(|&&of| of >= 0) {
            self.oft_deref(of as usize);
        }
    }

    // The end of a process: release its files, hand its children to
    // init, leave the exit status and CPU totals for the parent, and
    // give the CPU away for good.
    pub(crate) fn doexit(&self, val: u16, sig: u16) {
        self.close_all();
        self.sync();

        let me = self.curproc();
        let (cwd, mut utime, mut stime, cutime, cstime) = {
            let u = self.u.lock();
            (u.cwd as usize, u.utime, u.stime, u.cutime, u.cstime)
        };
        let (initproc, pptr, exitval) = {
            let mut pt = self.ptab.lock();
            let initproc = pt.initproc;
            let exitval = (val << 8) | (sig & 0xff);
            pt.procs[me].exitval = exitval;
            for p in pt.procs.iter_mut() {
                if p.status != ProcState::Empty && p.pptr == Some(me) {
                    p.pptr = Some(initproc);
                }
            }
            (initproc, pt.procs[me].pptr, exitval)
        };
        self.i_deref(cwd);

        utime.addtick(cutime);
        stime.addtick(cstime);
        log::debug!("exit: slot {} status {:#x}", me, exitval);

        if me == initproc {
            self.sync();
            log::info!("init exited with status {:#x}, halting", exitval);
            self.cpu.halt(Halt::Shutdown(exitval));
            return;
        }

        if let Some(pp) = pptr {
            self.wakeup(Event::Proc(pp));
        }
        {
            let mut pt = self.ptab.lock();
            let p = &mut pt.procs[me];
            p.alarm = 0;
            p.status = ProcState::Zombie;
            p.wait = Wait::Ticks { utime, stime };
        }
        let newp = self.getproc();
        self.swapin(newp);
        self.cpu.handoff(newp);
    }

    // Reap a zombie child: its pid and exit status.
    pub(crate) fn dowait(&self) -> Result<(u16, u16)> {
        let me = self.curproc();
        {
            let pt = self.ptab.lock();
            let any = pt.procs.iter().enumerate().any(|(i, p)| {
                p.status != ProcState::Empty && p.pptr == Some(me) && i != me
            });
            if !any {
                return Err(NoChildProcesses);
            }
        }
        loop {
            self.interrupted()?;
            let reaped = {
                let mut pt = self.ptab.lock();
                pt.procs
                    .iter_mut()
                    .find(|p| p.status == ProcState::Zombie && p.pptr == Some(me))
                    .map(|p| {
                        p.status = ProcState::Empty;
                        (p.pid, p.exitval, p.wait)
                    })
            };
            if let Some((pid, exitval, wait)) = reaped {
                if let Wait::Ticks { utime, stime } = wait {
                    let mut u = self.u.lock();
                    u.cutime.addtick(utime);
                    u.cstime.addtick(stime);
                }
                return Ok((pid, exitval));
            }
            self.psleep(Some(Event::Proc(me)));
        }
    }

    // One clock interrupt taken while the current process runs.
    pub(crate) fn clk_int(&self) {
        assert!(Cpus::intr_get(), "clk_int: interrupts masked");
        let me = self.curproc();
        if self.ptab.lock().procs[me].status == ProcState::Running {
            let mut u = self.u.lock();
            if u.insys != 0 {
                u.stime.incrtick();
            } else {
                u.utime.incrtick();
            }
        }
        self.clock_tick();

        let preempt = {
            let mut clock = self.clock.lock();
            clock.runticks += 1;
            clock.runticks >= MAXTICKS && self.u.lock().insys == 0
        };
        if preempt {
            self.u.lock().insys = 1;
            self.set_status(me, ProcState::Ready);
            self.swapout();
            self.u.lock().insys = 0;
        }
    }

    // The part of a tick that does not depend on who is running.
    pub(crate) fn clock_tick(&self) {
        let second = {
            let mut clock = self.clock.lock();
            clock.ticks.incrtick();
            clock.sec += 1;
            if clock.sec == TICKSPERSEC {
                clock.sec = 0;
                clock.tod = clock.tod.wrapping_add(1);
                true
            } else {
                false
            }
        };
        if !second {
            return;
        }
        let mut expired = Vec::new();
        {
            let mut pt = self.ptab.lock();
            for (i, p) in pt.procs.iter_mut().enumerate() {
                if p.alarm > 0 {
                    p.alarm -= 1;
                    if p.alarm == 0 {
                        expired.push(i);
                    }
                }
            }
        }
        for slot in expired {
            self.sendsig(Some(slot), crate::signal::SIGALRM);
        }
    }

    // Copy of the process table, for inspection.
    pub fn ps(&self) -> Vec<Proc> {
        self.ptab.lock().procs.to_vec()
    }

    pub fn dump(&self) {
        let pt = self.ptab.lock();
        for (i, p) in pt.procs.iter().enumerate() {
            if p.status == ProcState::Empty {
                continue;
            }
            log::debug!(
                "slot {} pid {} {:?} parent {:?} wait {:?} pending {:?} alarm {}",
                i,
                p.pid,
                p.status,
                p.pptr,
                p.wait,
                p.pending,
                p.alarm
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intr_lock_nests() {
        assert!(Cpus::intr_get());
        let a = Cpus::lock_mycpu("a");
        let b = Cpus::lock_mycpu("b");
        drop(a);
        assert!(!Cpus::intr_get());
        drop(b);
        assert!(Cpus::intr_get());
    }

    #[test]
    fn blocked_states_sort_above_running() {
        for s in [
            ProcState::Sleep,
            ProcState::Pause,
            ProcState::Wait,
            ProcState::Ready,
        ] {
            assert!(s > ProcState::Running);
        }
        assert!(ProcState::Empty < ProcState::Running);
    }
}
