// Machine assembly and boot.
//
// A Kernel is the whole machine: device switch, buffer cache, mount
// table, inode table, open file table, process table, the control
// block of the running process, RAM, the clock and the CPU baton.
// KernelBuilder wires up devices and the programs that executables
// may name; Kernel::run() then does what the original start-up code
// does before the first process runs, and waits for the machine to
// stop.

use crate::bio::BCache;
use crate::error::{Error::*, Result};
use crate::file::{DevSw, Device, OfTable, Oft};
use crate::fs::{FsEntry, ITable};
use crate::param::*;
use crate::proc::{Clock, PTab, ProcState};
use crate::spinlock::Mutex;
use crate::swap::UData;
use crate::swtch::{Context, Halt};
use crate::syscall::{SigHandler, UserCtx};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;

// A user program.
pub type Program = fn(&mut UserCtx);

// What a new process thread starts with: a fork child's continuation,
// or the first process's program.
pub type Entry = Box<dyn FnOnce(&mut UserCtx) + Send>;

// Calls that never return unwind to the top of the process thread
// carrying one of these.
#[derive(Debug)]
pub enum Trap {
    Exit { val: u16, sig: u16 },
    Exec(Program),
}

pub struct Kernel {
    pub(crate) devsw: Arc<DevSw>,
    pub(crate) bcache: BCache,
    pub(crate) fs: Mutex<[FsEntry; NDEVS]>,
    pub(crate) itable: Mutex<ITable>,
    pub(crate) oft: Mutex<OfTable>,
    pub(crate) ptab: Mutex<PTab>,
    pub(crate) u: Mutex<UData>,
    pub(crate) ram: Mutex<Vec<u8>>,
    pub(crate) clock: Mutex<Clock>,
    pub(crate) cpu: Context,
    pub(crate) programs: BTreeMap<u16, Program>,
    pub(crate) rootdev: u16,
    root: OnceLock<usize>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("devsw", &self.devsw)
            .field("rootdev", &self.rootdev)
            .finish()
    }
}

#[derive(Default)]
pub struct KernelBuilder {
    devices: Vec<(u16, u16, Arc<dyn Device>)>,
    programs: BTreeMap<u16, Program>,
    rootdev: Option<u16>,
    time: u32,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, dev: u16, minor: u16, driver: Arc<dyn Device>) -> Self {
        self.devices.push((dev, minor, driver));
        self
    }

    // Make `prog` the program of executables whose header names `entry`.
    pub fn program(mut self, entry: u16, prog: Program) -> Self {
        self.programs.insert(entry, prog);
        self
    }

    pub fn rootdev(mut self, dev: u16) -> Self {
        self.rootdev = Some(dev);
        self
    }

    // Time of day at boot, in seconds.
    pub fn time(mut self, secs: u32) -> Self {
        self.time = secs;
        self
    }

    pub fn build(self) -> Result<Arc<Kernel>> {
        let mut devsw = DevSw::new();
        for (dev, minor, driver) in self.devices {
            devsw.set(dev, minor, driver)?;
        }
        let rootdev = self.rootdev.unwrap_or(ROOTDEV);
        if rootdev as usize >= NDEVS || !devsw.validdev(rootdev) {
            return Err(NoSuchDevice);
        }
        let devsw = Arc::new(devsw);
        Ok(Arc::new(Kernel {
            bcache: BCache::new(Arc::clone(&devsw)),
            devsw,
            fs: Mutex::new([FsEntry::default(); NDEVS], "fs"),
            itable: Mutex::new(ITable::default(), "itable"),
            oft: Mutex::new([Oft::default(); OFTSIZE], "oft"),
            ptab: Mutex::new(PTab::new(), "ptab"),
            u: Mutex::new(UData::default(), "udata"),
            ram: Mutex::new(vec![0; MEMTOP], "ram"),
            clock: Mutex::new(
                Clock {
                    tod: self.time,
                    ..Default::default()
                },
                "clock",
            ),
            cpu: Context::new(),
            programs: self.programs,
            rootdev,
            root: OnceLock::new(),
        }))
    }
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    // Inode table slot of the root directory.
    pub(crate) fn root(&self) -> usize {
        self.root.get().copied().unwrap_or(0)
    }

    pub(crate) fn spawn(
        self: &Arc<Self>,
        slot: usize,
        pid: u16,
        entry: Entry,
        text: Vec<SigHandler>,
    ) -> std::io::Result<()> {
        let k = Arc::clone(self);
        thread::Builder::new()
            .name(format!("pid {}", pid))
            .spawn(move || k.process_main(slot, entry, text))?;
        Ok(())
    }

    // Body of every process thread.
    fn process_main(self: Arc<Self>, slot: usize, entry: Entry, text: Vec<SigHandler>) {
        self.cpu.enter(slot);
        // A fork child wakes up on its way back to user mode.
        self.u.lock().insys = 0;
        let mut ctx = UserCtx::new(Arc::clone(&self), text);

        let mut f = entry;
        let (val, sig) = loop {
            match panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx))) {
                Ok(()) => break (0, 0),
                Err(payload) => match payload.downcast::<Trap>() {
                    Ok(trap) => match *trap {
                        Trap::Exit { val, sig } => break (val, sig),
                        Trap::Exec(prog) => {
                            ctx.text.clear();
                            f = Box::new(prog);
                        }
                    },
                    Err(payload) => {
                        log::error!("panic in slot {}", slot);
                        self.cpu.halt(Halt::Panic(payload));
                        return;
                    }
                },
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.doexit(val, sig))) {
            log::error!("panic in slot {} on its way out", slot);
            self.cpu.halt(Halt::Panic(payload));
        }
    }

    // Make the first process, mount the root file system and run `init`
    // in it until the machine stops. Returns init's exit status; a
    // kernel panic in any process is raised again here.
    pub fn run(self: &Arc<Self>, init: Program) -> u16 {
        let Some(slot) = self.ptab_alloc() else {
            panic!("init2: no process slot");
        };
        self.ptab.lock().initproc = slot;
        {
            let mut u = self.u.lock();
            u.ptab = slot as u16;
            u.files = [-1; UFTSIZE];
        }
        self.newproc(slot);
        self.set_status(slot, ProcState::Running);

        // Open the console tty device.
        if self.devsw.validdev(TTYDEV) {
            if let Err(e) = self.devsw.d_open(TTYDEV) {
                log::warn!("init2: tty: {}", e);
            }
        }

        log::info!("boot: mounting root dev {}", self.rootdev);
        if self.fmount(self.rootdev, None).is_err() {
            panic!("no filesys");
        }
        let root = match self.i_open(self.rootdev, ROOTINODE) {
            Ok(root) => root.leak(),
            Err(_) => panic!("no root"),
        };
        let _ = self.root.set(root);
        {
            let now = self.rdtime();
            let mut u = self.u.lock();
            u.cwd = root as u16;
            u.time = now;
        }
        self.i_ref(root);

        let pid = self.ptab.lock().procs[slot].pid;
        if let Err(e) = self.spawn(slot, pid, Box::new(init), Vec::new()) {
            panic!("init2: cannot start init: {}", e);
        }
        self.cpu.handoff(slot);

        match self.cpu.wait_halt() {
            Halt::Shutdown(status) => {
                log::info!("halted, init status {:#x}", status);
                status
            }
            Halt::Panic(payload) => panic::resume_unwind(payload),
        }
    }

    // Boot the way a real system does: init is /init.
    pub fn boot(self: &Arc<Self>) -> u16 {
        self.run(exec_init)
    }
}

fn exec_init(ctx: &mut UserCtx) {
    let e = ctx.execve("/init", &["init"], &[]);
    log::error!("exec /init: {}", e);
    ctx.exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    #[test]
    fn builder_wants_a_root_device() {
        assert_eq!(Kernel::builder().build().err(), Some(NoSuchDevice));
        let k = Kernel::builder()
            .device(ROOTDEV, 0, Arc::new(RamDisk::new(16)))
            .build()
            .unwrap();
        assert_eq!(k.rootdev, ROOTDEV);
        assert_eq!(k.ram.lock().len(), MEMTOP);
    }

    #[test]
    #[should_panic(expected = "no filesys")]
    fn blank_disk_has_no_filesys() {
        let k = Kernel::builder()
            .device(ROOTDEV, 0, Arc::new(RamDisk::new(16)))
            .build()
            .unwrap();
        k.run(|_| {});
    }
}
