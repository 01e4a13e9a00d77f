use clap::Parser;
use kernel::console::Console;
use kernel::fcntl::omode;
use kernel::mkfs::FsImg;
use kernel::null::Null;
use kernel::param::*;
use kernel::ramdisk::RamDisk;
use kernel::stat::F_CDEV;
use kernel::{Kernel, UserCtx};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

const INIT: u16 = 1;
const ECHO: u16 = 2;

/// Boot the kernel and run /init.
#[derive(Parser, Debug)]
#[command(name = "kernel", version)]
struct Args {
    /// Root file system image. Without one, a small image holding
    /// /init, /echo and /dev is made up.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Time of day at boot, in seconds.
    #[arg(long, default_value_t = 0)]
    time: u32,

    /// Console input, given to the console before boot.
    #[arg(long, default_value = "")]
    input: String,
}

// /init: set up the console as fds 0, 1 and 2, then echo a greeting in
// a child process and report how it went.
fn init(ctx: &mut UserCtx) {
    if ctx.open("/dev/tty", omode::RDWR).is_err() {
        ctx.exit(1);
    }
    let _ = ctx.dup(0);
    let _ = ctx.dup(0);

    let mut line = [0u8; 64];
    if let Ok(n @ 1..) = ctx.read(0, &mut line) {
        let _ = ctx.write(1, b"init: got ");
        let _ = ctx.write(1, &line[..n]);
    }

    let child = ctx.fork(|ctx| {
        let e = ctx.execve("/echo", &["echo", "hello", "from", "swapkern"], &[]);
        let _ = ctx.write(2, format!("exec /echo: {}\n", e).as_bytes());
        ctx.exit(1);
    });
    let Ok(child) = child else {
        ctx.exit(1);
    };
    match ctx.wait() {
        Ok((pid, status)) => {
            let msg = format!("init: pid {} of {} exited with {:#x}\n", pid, child, status);
            let _ = ctx.write(1, msg.as_bytes());
        }
        Err(e) => {
            let _ = ctx.write(2, format!("init: wait: {}\n", e).as_bytes());
        }
    }
    ctx.exit(0);
}

fn echo(ctx: &mut UserCtx) {
    let (argv, _) = ctx.args();
    let line = argv.get(1..).unwrap_or_default().join(" ") + "\n";
    let _ = ctx.write(1, line.as_bytes());
    ctx.exit(0);
}

fn default_image() -> kernel::error::Result<Vec<u8>> {
    let mut fsimg = FsImg::new(1000, 20)?;
    let dev = fsimg.mkdir(ROOTINODE, "dev")?;
    fsimg.mknod(dev, "tty", F_CDEV | 0o666, TTYDEV)?;
    fsimg.mknod(dev, "null", F_CDEV | 0o666, NULLDEV)?;
    fsimg.add_exec(ROOTINODE, "init", INIT, BSIZE)?;
    fsimg.add_exec(ROOTINODE, "echo", ECHO, BSIZE)?;
    Ok(fsimg.finish())
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let image = match &args.image {
        Some(path) => std::fs::read(path).unwrap_or_else(|e| {
            eprintln!("kernel: {}: {}", path.display(), e);
            process::exit(1);
        }),
        None => default_image().unwrap_or_else(|e| {
            eprintln!("kernel: making root image: {}", e);
            process::exit(1);
        }),
    };

    let console = Arc::new(Console::new());
    console.feed(args.input.as_bytes());

    let swap_blocks = PTABSIZE as u16 * SWAP_SLOT + 1;
    let k = Kernel::builder()
        .device(ROOTDEV, 0, Arc::new(RamDisk::from_image(image)))
        .device(SWAPDEV, 0, Arc::new(RamDisk::new(swap_blocks)))
        .device(NULLDEV, 0, Arc::new(Null))
        .device(TTYDEV, 0, console.clone())
        .program(INIT, init)
        .program(ECHO, echo)
        .time(args.time)
        .build();
    let k = match k {
        Ok(k) => k,
        Err(e) => {
            eprintln!("kernel: {}", e);
            process::exit(1);
        }
    };

    let status = k.boot();
    let _ = std::io::stdout().write_all(&console.output());
    if status != 0 {
        eprintln!("kernel: init exited with {:#x}", status);
        process::exit(1);
    }
}
