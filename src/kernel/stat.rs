use crate::param::{BSIZE, TICKSPERSEC};
use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

// File types, the top four bits of a mode.
pub const F_REG: u16 = 0o100000;
pub const F_DIR: u16 = 0o040000;
pub const F_PIPE: u16 = 0o010000;
pub const F_BDEV: u16 = 0o060000;
pub const F_CDEV: u16 = 0o020000;
pub const F_MASK: u16 = 0o170000;
pub const MODE_MASK: u16 = 0o7777;

bitflags! {
    // Permission bits of a mode.
    #[derive(Default)]
    pub struct Perm: u16 {
        const OTH_EX = 0o0001;
        const OTH_WR = 0o0002;
        const OTH_RD = 0o0004;
        const GRP_EX = 0o0010;
        const GRP_WR = 0o0020;
        const GRP_RD = 0o0040;
        const OWN_EX = 0o0100;
        const OWN_WR = 0o0200;
        const OWN_RD = 0o0400;
        const STICKY = 0o1000;
        const SET_GID = 0o2000;
        const SET_UID = 0o4000;
    }
}

// Ticks as (ticks within the minute, minutes).
// The time of day uses the same pair for the low and high
// halves of a seconds counter.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct Time {
    pub t_time: u16,
    pub t_date: u16,
}

const TICKSPERMIN: u16 = 60 * TICKSPERSEC;

impl Time {
    pub fn incrtick(&mut self) {
        self.t_time += 1;
        if self.t_time == TICKSPERMIN {
            self.t_time = 0;
            self.t_date = self.t_date.wrapping_add(1);
        }
    }

    pub fn addtick(&mut self, other: Time) {
        self.t_time += other.t_time;
        self.t_date = self.t_date.wrapping_add(other.t_date);
        if self.t_time >= TICKSPERMIN {
            self.t_time -= TICKSPERMIN;
            self.t_date = self.t_date.wrapping_add(1);
        }
    }

    pub fn ticks(&self) -> u32 {
        self.t_date as u32 * TICKSPERMIN as u32 + self.t_time as u32
    }

    pub fn from_secs(secs: u32) -> Self {
        Self {
            t_time: secs as u16,
            t_date: (secs >> 16) as u16,
        }
    }

    pub fn secs(&self) -> u32 {
        (self.t_date as u32) << 16 | self.t_time as u32
    }
}

// A file position or size: whole blocks plus a byte offset in the last one.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct Off {
    pub blkno: u16,
    pub offset: i16,
}

impl Off {
    pub fn from_bytes(n: u32) -> Self {
        Self {
            blkno: (n / BSIZE as u32) as u16,
            offset: (n % BSIZE as u32) as i16,
        }
    }

    pub fn bytes(&self) -> u32 {
        self.blkno as u32 * BSIZE as u32 + self.offset as u32
    }

    pub fn addoff(&mut self, amount: i32) {
        let bsize = BSIZE as i32;
        if amount >= 0 {
            self.offset += (amount % bsize) as i16;
            if self.offset >= bsize as i16 {
                self.offset -= bsize as i16;
                self.blkno = self.blkno.wrapping_add(1);
            }
            self.blkno = self.blkno.wrapping_add((amount / bsize) as u16);
        } else {
            self.offset -= (-amount % bsize) as i16;
            if self.offset < 0 {
                self.offset += bsize as i16;
                self.blkno = self.blkno.wrapping_sub(1);
            }
            self.blkno = self.blkno.wrapping_sub((-amount / bsize) as u16);
        }
    }
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Stat {
    pub dev: i16,   // File system's disk device
    pub ino: u16,   // Inode number
    pub mode: u16,  // Type and permissions
    pub nlink: u16, // Number of links to file
    pub uid: u16,
    pub gid: u16,
    pub rdev: u16, // Device number for device nodes
    pub size: Off,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

impl Stat {
    pub fn file_type(&self) -> u16 {
        self.mode & F_MASK
    }
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Tms {
    pub utime: Time,
    pub stime: Time,
    pub cutime: Time,
    pub cstime: Time,
    pub etime: Time, // ticks since boot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_carry_into_minutes() {
        let mut t = Time {
            t_time: TICKSPERMIN - 1,
            t_date: 2,
        };
        t.incrtick();
        assert_eq!(t, Time { t_time: 0, t_date: 3 });

        let mut a = Time {
            t_time: TICKSPERMIN - 5,
            t_date: 1,
        };
        a.addtick(Time { t_time: 10, t_date: 1 });
        assert_eq!(a, Time { t_time: 5, t_date: 3 });
        assert_eq!(a.ticks(), 3 * TICKSPERMIN as u32 + 5);
    }

    #[test]
    fn offsets_move_both_ways() {
        let mut o = Off::default();
        o.addoff(700);
        assert_eq!(o, Off { blkno: 1, offset: 188 });
        o.addoff(-200);
        assert_eq!(o, Off { blkno: 0, offset: 500 });
        o.addoff(1024);
        assert_eq!(o.bytes(), 1524);
        assert_eq!(Off::from_bytes(1524), o);
    }
}
