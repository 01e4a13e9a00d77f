#![allow(dead_code)]

use kernel::console::Console;
use kernel::mkfs::FsImg;
use kernel::null::Null;
use kernel::param::*;
use kernel::ramdisk::RamDisk;
use kernel::stat::*;
use kernel::{Kernel, Program};
use std::sync::Arc;

// Second disk, mountable on /mnt.
pub const DISK1: u16 = 1;

pub struct Machine {
    pub k: Arc<Kernel>,
    pub console: Arc<Console>,
    pub root: Arc<RamDisk>,
    pub swap: Arc<RamDisk>,
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Root file system: /dev/{tty,null,disk1}, /mnt and /tmp.
pub fn image() -> FsImg {
    let mut fsimg = FsImg::new(800, 12).unwrap();
    fsimg.set_time(1000);
    let dev = fsimg.mkdir(ROOTINODE, "dev").unwrap();
    fsimg.mknod(dev, "tty", F_CDEV | 0o666, TTYDEV).unwrap();
    fsimg.mknod(dev, "null", F_CDEV | 0o666, NULLDEV).unwrap();
    fsimg.mknod(dev, "disk1", F_BDEV | 0o644, DISK1).unwrap();
    fsimg.mkdir(ROOTINODE, "mnt").unwrap();
    fsimg.mkdir(ROOTINODE, "tmp").unwrap();
    fsimg
}

fn disk1() -> Vec<u8> {
    let mut fsimg = FsImg::new(200, 4).unwrap();
    fsimg
        .add_file(ROOTINODE, "readme", 0o644, b"on disk one\n")
        .unwrap();
    fsimg.finish()
}

pub fn machine_with(fsimg: FsImg, programs: &[(u16, Program)]) -> Machine {
    init_logger();
    let console = Arc::new(Console::new());
    let root = Arc::new(RamDisk::from_image(fsimg.finish()));
    let swap = Arc::new(RamDisk::new(PTABSIZE as u16 * SWAP_SLOT + 1));
    let mut b = Kernel::builder()
        .device(ROOTDEV, 0, root.clone())
        .device(DISK1, 0, Arc::new(RamDisk::from_image(disk1())))
        .device(SWAPDEV, 0, swap.clone())
        .device(NULLDEV, 0, Arc::new(Null))
        .device(TTYDEV, 0, console.clone())
        .time(1000);
    for &(entry, prog) in programs {
        b = b.program(entry, prog);
    }
    Machine {
        k: b.build().unwrap(),
        console,
        root,
        swap,
    }
}

pub fn machine() -> Machine {
    machine_with(image(), &[])
}
