use clap::Parser;
use kernel::fs::DIRSIZ;
use kernel::mkfs::FsImg;
use kernel::param::*;
use kernel::stat::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process;

/// Make a file system image.
#[derive(Parser, Debug)]
#[command(name = "mkfs", version)]
struct Args {
    /// Image file to write.
    image: PathBuf,

    /// Host files to copy in. A file whose host directory has the name of
    /// one of the --dir directories goes there, the rest go to /.
    files: Vec<PathBuf>,

    /// Size of the file system in blocks.
    #[arg(long, default_value_t = 1000)]
    size: u16,

    /// First data block; blocks 2 up to it hold inodes.
    #[arg(long, default_value_t = 20)]
    isize: u16,

    /// Top-level directories to create.
    #[arg(long = "dir")]
    dirs: Vec<String>,

    /// Executables to create, as NAME=ENTRY.
    #[arg(long = "exec", value_parser = parse_exec)]
    execs: Vec<(String, u16)>,

    /// Create /dev with the console and the bit bucket.
    #[arg(long)]
    dev: bool,

    /// Creation time stamped on every inode, in seconds.
    #[arg(long, default_value_t = 0)]
    time: u32,
}

fn parse_exec(s: &str) -> Result<(String, u16), String> {
    let (name, entry) = s
        .split_once('=')
        .ok_or_else(|| format!("{}: want NAME=ENTRY", s))?;
    let entry = match entry.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => entry.parse(),
    }
    .map_err(|e| format!("{}: {}", s, e))?;
    Ok((name.to_string(), entry))
}

fn die(msg: &str) -> ! {
    eprintln!("mkfs: {}", msg);
    process::exit(1);
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut fsimg = match FsImg::new(args.size, args.isize) {
        Ok(fsimg) => fsimg,
        Err(e) => die(&format!("size {} isize {}: {}", args.size, args.isize, e)),
    };
    fsimg.set_time(args.time);

    let mut dirs = BTreeMap::new();
    for name in &args.dirs {
        match fsimg.mkdir(ROOTINODE, name) {
            Ok(ino) => {
                dirs.insert(name.as_str(), ino);
            }
            Err(e) => die(&format!("mkdir {}: {}", name, e)),
        }
    }

    if args.dev {
        let made = fsimg.mkdir(ROOTINODE, "dev").and_then(|dev| {
            fsimg.mknod(dev, "tty", F_CDEV | 0o666, TTYDEV)?;
            fsimg.mknod(dev, "null", F_CDEV | 0o666, NULLDEV)
        });
        if let Err(e) = made {
            die(&format!("/dev: {}", e));
        }
    }

    for (name, entry) in &args.execs {
        if let Err(e) = fsimg.add_exec(ROOTINODE, name, *entry, BSIZE) {
            die(&format!("{}: {}", name, e));
        }
    }

    for path in &args.files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            die(&format!("{}: bad file name", path.display()));
        };
        if name.len() > DIRSIZ {
            die(&format!("{}: name longer than {} bytes", name, DIRSIZ));
        }
        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| dirs.get(n).copied())
            .unwrap_or(ROOTINODE);
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) => die(&format!("{}: {}", path.display(), e)),
        };
        if let Err(e) = fsimg.add_file(parent, name, 0o644, &data) {
            die(&format!("{}: {}", path.display(), e));
        }
        log::info!("{}: {} bytes", name, data.len());
    }

    log::info!(
        "{} blocks, {} inode blocks, {} data blocks in use",
        args.size,
        args.isize - 2,
        fsimg.blocks_used()
    );
    if let Err(e) = fs::write(&args.image, fsimg.finish()) {
        die(&format!("{}: {}", args.image.display(), e));
    }
}
