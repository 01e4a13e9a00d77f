use core::mem::size_of;

pub const BSIZE: usize = 512; // block size
pub const NBUFS: usize = 4; // size of buffer cache
pub const UFTSIZE: usize = 10; // open files per process
pub const OFTSIZE: usize = 15; // open files per system
pub const ITABSIZE: usize = 20; // maximum number of active i-nodes
pub const PTABSIZE: usize = 20; // maximum number of processes
pub const NSIGS: usize = 16; // number of signals, bit 0 unused
pub const NDEVS: usize = 3; // devices that may carry a file system
pub const NDEVTAB: usize = 8; // entries in the device switch
pub const ROOTINODE: u16 = 1; // root inode of every mounted file system
pub const ROOTDEV: u16 = 0; // default device number of the root disk
pub const SWAPDEV: u16 = 3; // device used for swapping
pub const NULLDEV: u16 = 4; // bit bucket
pub const TTYDEV: u16 = 5; // console

pub const TICKSPERSEC: u16 = 10; // clock interrupts per second
pub const MAXTICKS: u16 = 10; // time slice in ticks

// Memory layout of the single process image in RAM:
// [ zero page | program, data, heap ... stack | udata ]
// 0x0000      PROGBASE                         UDATA_ADDR  MEMTOP
pub const PROGBASE: usize = 0x100;
pub const MEMTOP: usize = 0x8000;
pub const UDATA_ADDR: usize = MEMTOP - size_of::<crate::swap::UData>();

// Every process table slot owns SWAP_SLOT blocks on SWAPDEV,
// starting at block 1.
pub const SWAP_SLOT: u16 = 65;

pub const EMAGIC: u8 = 0xc3; // first byte of an executable
pub const CMAGIC: u16 = 24721; // in-core inode corruption tag
pub const SMOUNTED: i16 = 12742; // superblock mount magic

pub const MAXPID: u16 = 32000;
