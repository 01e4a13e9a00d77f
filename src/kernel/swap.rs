// Swapping.
//
// Only one process image is in RAM at a time. Switching processes
// writes the running one to its swap region and reads the next one
// back in:
//
//   swap block 0       the top block of RAM, which carries the control
//                      block packed against MEMTOP
//   swap blocks 1..    RAM from PROGBASE up to the control block, in
//                      whole blocks
//
// Every process table slot owns SWAP_SLOT blocks of the swap device,
// enough for the largest image, so regions never move or grow.

use crate::param::*;
use crate::proc::ProcState;
use crate::start::Kernel;
use crate::stat::Time;
use zerocopy::{AsBytes, FromBytes};

// Per-process control block. Lives in the kernel while the process
// runs and at the top of its image while it is swapped out.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
pub struct UData {
    pub ptab: u16,   // own process table slot
    pub insys: u8,   // inside a system call
    pub callno: u8,  // system call in progress
    pub retval: i16, // its result
    pub error: i16,  // its errno
    pub gid: u16,
    pub euid: u16,
    pub egid: u16,
    pub mask: u16, // umask
    pub time: Time, // start time
    pub files: [i8; UFTSIZE], // open file table indexes, -1 if closed
    pub cwd: u16,             // inode table index
    pub brk: u16,
    pub isp: u16,              // initial stack pointer, set by exec
    pub sigvec: [u16; NSIGS], // SIG_DFL, SIG_IGN or a handler address
    pub cursig: u16,           // caught signal awaiting its handler
    pub name: [u8; 8],         // command name
    pub utime: Time,
    pub stime: Time,
    pub cutime: Time, // reaped children's totals
    pub cstime: Time,
}

// Bytes of RAM that follow the first swap block.
const IMAGE: usize = (MEMTOP - PROGBASE) & !(BSIZE - 1);

impl Kernel {
    // Write RAM and the control block to the swap region of `slot`.
    pub(crate) fn swrite(&self, slot: usize) {
        let blk = self.ptab.lock().procs[slot].swap;
        let u = *self.u.lock();
        let mut ram = self.ram.lock();
        ram[UDATA_ADDR..MEMTOP].copy_from_slice(u.as_bytes());
        if let Err(e) = self
            .devsw
            .swapwrite(SWAPDEV, blk, &ram[MEMTOP - BSIZE..MEMTOP])
            .and_then(|_| self.devsw.swapwrite(SWAPDEV, blk + 1, &ram[PROGBASE..PROGBASE + IMAGE]))
        {
            log::error!("swapout of slot {}: {}", slot, e);
            panic!("swrite: i/o error");
        }
    }

    // Bring the image of `slot` into RAM and make it the running process.
    pub(crate) fn swapin(&self, slot: usize) {
        let blk = self.ptab.lock().procs[slot].swap;
        let mut u = UData::default();
        {
            let mut ram = self.ram.lock();
            if let Err(e) = self
                .devsw
                .swapread(SWAPDEV, blk + 1, &mut ram[PROGBASE..PROGBASE + IMAGE])
                .and_then(|_| self.devsw.swapread(SWAPDEV, blk, &mut ram[MEMTOP - BSIZE..MEMTOP]))
            {
                log::error!("swapin of slot {}: {}", slot, e);
                panic!("swapin: i/o error");
            }
            u.as_bytes_mut().copy_from_slice(&ram[UDATA_ADDR..MEMTOP]);
        }
        if u.ptab as usize != slot {
            panic!("mangled swapin");
        }
        *self.u.lock() = u;
        self.set_status(slot, ProcState::Running);
        self.clock.lock().runticks = 0;
    }

    // Give up the CPU. The caller has already set its own state; if it
    // is still the best choice it simply keeps running, otherwise this
    // returns only once somebody has swapped it back in.
    pub(crate) fn swapout(&self) {
        self.chksigs();

        let me = self.curproc();
        let newp = self.getproc();
        if newp == me {
            self.set_status(me, ProcState::Running);
            self.clock.lock().runticks = 0;
            return;
        }
        log::trace!("swtch {} -> {}", me, newp);
        self.swrite(me);
        self.swapin(newp);
        self.cpu.swtch(me, newp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn control_block_fits_one_block() {
        assert_eq!(size_of::<UData>(), 94);
        assert!(UDATA_ADDR > PROGBASE);
        assert_eq!(IMAGE % BSIZE, 0);
        assert!(IMAGE / BSIZE + 1 <= SWAP_SLOT as usize);
        assert!(PROGBASE + IMAGE >= MEMTOP - BSIZE);
    }
}
