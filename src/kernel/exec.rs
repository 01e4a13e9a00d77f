use crate::bio::{get_u16, Mode};
use crate::error::{Error::*, Result};
use crate::fs::{Path, A_TIME};
use crate::param::*;
use crate::signal::{SIG_DFL, SIG_IGN};
use crate::start::{Kernel, Trap};
use crate::stat::{Perm, F_MASK, F_REG};
use core::convert::Infallible;

// Strings of one argument vector must fit in a swap block, behind the
// two counts.
pub const ARGBUF: usize = 500;

// Executable header: EMAGIC, then the entry address.
pub fn entry_of(block: &[u8]) -> Option<u16> {
    (block[0] == EMAGIC).then(|| u16::from_le_bytes([block[1], block[2]]))
}

// An argument vector as staged on the swap device:
// [argc: u16][arglen: u16][NUL-terminated strings ...]
fn wargs(args: &[&str]) -> Result<[u8; BSIZE]> {
    let mut blk = [0u8; BSIZE];
    let mut len = 0;
    for arg in args {
        let bytes = arg.as_bytes();
        if len + bytes.len() + 1 >= ARGBUF {
            return Err(ArgumentListTooLong);
        }
        blk[4 + len..4 + len + bytes.len()].copy_from_slice(bytes);
        len += bytes.len() + 1;
    }
    blk[0..2].copy_from_slice(&(args.len() as u16).to_le_bytes());
    blk[2..4].copy_from_slice(&(len as u16).to_le_bytes());
    Ok(blk)
}

// Copy a staged vector into RAM just below `top`, followed (downwards)
// by its pointer array. Returns the address of the array and argc.
fn rargs(ram: &mut [u8], top: usize, blk: &[u8; BSIZE]) -> (usize, usize) {
    let argc = get_u16(blk, 0) as usize;
    let arglen = get_u16(blk, 1) as usize;

    let strings = top - arglen;
    ram[strings..top].copy_from_slice(&blk[4..4 + arglen]);

    let argv = strings - 2 * (argc + 1);
    let mut p = strings;
    for n in 0..argc {
        ram[argv + 2 * n..argv + 2 * n + 2].copy_from_slice(&(p as u16).to_le_bytes());
        while ram[p] != 0 {
            p += 1;
        }
        p += 1;
    }
    ram[argv + 2 * argc..argv + 2 * argc + 2].fill(0);
    (argv, argc)
}

fn staged_len(blk: &[u8; BSIZE]) -> usize {
    get_u16(blk, 1) as usize + 2 * (get_u16(blk, 0) as usize + 1)
}

impl Kernel {
    // Replace the current image with the program in `path`. Only comes
    // back on failure; success unwinds into the new program.
    pub(crate) fn execve(&self, path: &str, argv: &[&str], envp: &[&str]) -> Result<Infallible> {
        let ino = self.n_open(Path::new(path))?;
        let node = ino.node();

        if node.node.size.blkno as usize >= UDATA_ADDR / BSIZE {
            return Err(OutOfMemory);
        }
        if !(self.getperm(ino.idx()).contains(Perm::OTH_EX)
            && node.node.mode & F_MASK == F_REG
            && node.node.mode & 0o111 != 0)
        {
            return Err(PermissionDenied);
        }
        self.setftime(ino.idx(), A_TIME);

        // Gather the arguments and put them on the swap device,
        // the environment on the next block.
        let me = self.curproc();
        let swap = self.ptab.lock().procs[me].swap;
        let (abuf, ebuf) = (wargs(argv)?, wargs(envp)?);
        self.devsw.swapwrite(SWAPDEV, swap, &abuf)?;
        self.devsw.swapwrite(SWAPDEV, swap + 1, &ebuf)?;

        let first = match self.bmap(ino.idx(), 0, false)? {
            Some(pblk) => {
                let buf = self.bcache.read(node.dev, pblk, Mode::Read)?;
                [buf[0], buf[1], buf[2]]
            }
            None => [0; 3],
        };
        let prog = entry_of(&first)
            .and_then(|entry| self.programs.get(&entry).copied())
            .ok_or(ExecFileFormatError)?;

        let progend = PROGBASE + (node.node.size.blkno as usize + 1) * BSIZE;
        if progend + staged_len(&abuf) + staged_len(&ebuf) + 4 > UDATA_ADDR {
            return Err(OutOfMemory);
        }

        // Committed from here on.
        {
            let mut u = self.u.lock();
            if node.node.mode & Perm::SET_UID.bits() != 0 {
                u.euid = node.node.uid;
            }
            if node.node.mode & Perm::SET_GID.bits() != 0 {
                u.egid = node.node.gid;
            }
        }

        // Read in the program; holes read as zeros.
        for blk in 0..=node.node.size.blkno {
            let at = PROGBASE + blk as usize * BSIZE;
            match self.bmap(ino.idx(), blk, false)? {
                Some(pblk) => {
                    let buf = self.bcache.read(node.dev, pblk, Mode::Read)?;
                    self.ram.lock()[at..at + BSIZE].copy_from_slice(&buf[..]);
                }
                None => self.ram.lock()[at..at + BSIZE].fill(0),
            }
        }
        drop(ino);

        // Read back the arguments and the environment.
        let mut abuf = [0u8; BSIZE];
        let mut ebuf = [0u8; BSIZE];
        self.devsw.swapread(SWAPDEV, swap, &mut abuf)?;
        self.devsw.swapread(SWAPDEV, swap + 1, &mut ebuf)?;

        let (isp, name) = {
            let mut ram = self.ram.lock();
            // Zero out the free memory.
            ram[progend..UDATA_ADDR].fill(0);
            let (argv, argc) = rargs(&mut ram, UDATA_ADDR, &abuf);
            let (envp, _) = rargs(&mut ram, argv, &ebuf);

            // argc and the address of argv go just below envp.
            let isp = envp - 4;
            ram[isp..isp + 2].copy_from_slice(&(argv as u16).to_le_bytes());
            ram[isp + 2..isp + 4].copy_from_slice(&(argc as u16).to_le_bytes());

            let mut name = [0u8; 8];
            if argc > 0 {
                let a0 = get_u16(&ram[argv..], 0) as usize;
                let n = ram[a0..].iter().take(8).position(|&c| c == 0).unwrap_or(8);
                name[..n].copy_from_slice(&ram[a0..a0 + n]);
            }
            (isp, name)
        };

        {
            let mut u = self.u.lock();
            u.brk = progend as u16;
            u.isp = isp as u16;
            u.name = name;
            // Turn off caught signals.
            for v in u.sigvec.iter_mut().filter(|v| **v != SIG_IGN) {
                *v = SIG_DFL;
            }
            u.cursig = 0;
            u.insys = 0;
        }
        log::debug!(
            "exec {} as slot {}: {} bytes, entry {:#x}",
            path,
            me,
            progend - PROGBASE,
            u16::from_le_bytes([first[1], first[2]])
        );

        std::panic::resume_unwind(Box::new(Trap::Exec(prog)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_blocks() {
        let blk = wargs(&["sh", "-c", "ls"]).unwrap();
        assert_eq!(get_u16(&blk, 0), 3);
        assert_eq!(get_u16(&blk, 1), 9);
        assert_eq!(&blk[4..13], b"sh\0-c\0ls\0");

        let long = "x".repeat(ARGBUF);
        assert_eq!(wargs(&[long.as_str()]).err(), Some(ArgumentListTooLong));

        let mut ram = vec![0u8; 1024];
        let (argv, argc) = rargs(&mut ram, 1024, &blk);
        assert_eq!(argc, 3);
        assert_eq!(argv, 1024 - 9 - 8);
        assert_eq!(get_u16(&ram[argv..], 1) as usize, 1024 - 9 + 3);
        assert_eq!(get_u16(&ram[argv..], 3), 0);
    }

    #[test]
    fn header() {
        assert_eq!(entry_of(&[EMAGIC, 0x34, 0x12]), Some(0x1234));
        assert_eq!(entry_of(&[0x7f, b'E', b'L']), None);
    }
}
