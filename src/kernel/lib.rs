#![allow(clippy::new_without_default)]

pub mod bio;
pub mod console;
pub mod error;
pub mod exec;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod mkfs;
pub mod null;
pub mod param;
pub mod proc;
pub mod ramdisk;
pub mod signal;
pub mod spinlock;
pub mod start;
pub mod stat;
pub mod swap;
pub mod swtch;
pub mod syscall;
pub mod sysfile;

pub use start::{Kernel, KernelBuilder, Program, Trap};
pub use syscall::{SigAction, UserCtx};
