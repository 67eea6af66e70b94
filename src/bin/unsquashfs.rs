use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use byte_unit::Byte;
use clap::Parser;
use console::Style;
use indicatif::ProgressBar;
use sqfs_extract::driver::ExtractStats;
use sqfs_extract::sink::{PosixSink, Sink};
use sqfs_extract::{extract, Squashfs, SquashfsError, SuperBlock};

/// Read-only extractor for SquashFS v4.0 filesystem images.
#[derive(Parser)]
#[command(author, version, name = "sqfs-extract", max_term_width = 98)]
struct Args {
    /// SquashFS image to extract.
    filesystem: PathBuf,

    /// Directory to extract into.
    #[arg(short, long, default_value = "squashfs_out", name = "DIR")]
    out: PathBuf,

    /// Skip chmod/chown/xattr application.
    #[arg(long)]
    no_meta: bool,

    /// Print each extracted path as it is written.
    #[arg(long)]
    info: bool,

    /// Silence progress output and the summary block.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !args.quiet {
        tracing_subscriber::fmt::init();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Wraps [`PosixSink`] to print each extracted path under `--info`, in the same
/// `{label:>16} {path}` layout `src/bin/unsquashfs.rs`'s `extracted`/`created` helpers use.
struct InfoSink {
    inner: PosixSink,
    info: bool,
    style: Style,
}

impl InfoSink {
    fn announce(&self, label: &str, path: &Path) {
        if self.info {
            println!("{:>16} {}", self.style.apply_to(label), path.display());
        }
    }
}

impl Sink for InfoSink {
    fn mkdir(&mut self, path: &Path) -> std::io::Result<()> {
        self.inner.mkdir(path)?;
        self.announce("Created", path);
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> std::io::Result<Box<dyn Write>> {
        self.announce("Extracted", path);
        self.inner.create_file(path)
    }

    fn symlink(&mut self, target: &[u8], path: &Path) -> std::io::Result<()> {
        self.inner.symlink(target, path)?;
        self.announce("Linked", path);
        Ok(())
    }

    fn write_placeholder(&mut self, path: &Path, contents: &str) -> std::io::Result<()> {
        self.inner.write_placeholder(path, contents)?;
        self.announce("Created", path);
        Ok(())
    }

    fn chmod(&mut self, path: &Path, mode: u32) {
        self.inner.chmod(path, mode);
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) {
        self.inner.chown(path, uid, gid);
    }

    fn setxattr(&mut self, path: &Path, key: &str, value: &[u8]) {
        self.inner.setxattr(path, key, value);
    }
}

fn run(args: &Args) -> Result<(), SquashfsError> {
    let blue_bold = Style::new().blue().bold();

    let file = BufReader::new(File::open(&args.filesystem)?);
    let squashfs = Squashfs::open(file)?;
    let superblock = *squashfs.superblock();

    if !args.quiet {
        println!(
            "[+] SquashFS v4.0 block_size={} comp_id={}({})",
            superblock.block_size, superblock.compressor as u16, superblock.compressor,
        );
    }

    let pb = ProgressBar::new_spinner();
    if !args.quiet {
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{:>14}", blue_bold.apply_to("Extracting")));
    }

    let mut sink = InfoSink {
        inner: PosixSink,
        info: args.info,
        style: blue_bold.clone(),
    };
    let stats = extract(&squashfs, &args.out, &mut sink, !args.no_meta)?;

    if !args.quiet {
        pb.finish_with_message(format!(
            "{:>14} {} entries to {}",
            blue_bold.apply_to("Extracted"),
            stats.total_entries(),
            args.out.display()
        ));
        print_summary(&args.out, &superblock, &stats);
    }

    Ok(())
}

fn print_summary(out_dir: &Path, sb: &SuperBlock, stats: &ExtractStats) {
    let total_bytes = human(stats.total_bytes);
    let avg_file = human(stats.avg_nonempty_file_size() as u64);

    println!();
    println!("===== SquashFS Extract Summary =====");
    println!("- Output dir            : {}", out_dir.display());
    println!("- Version               : 4.0");
    println!("- Block size            : {} bytes", sb.block_size);
    println!("- Compression           : {} ({})", sb.compressor as u16, sb.compressor);
    println!("- Inodes (super)        : {}", sb.inode_count);
    println!("- Fragment entries (SB) : {}", sb.frag_count);
    println!("- Entries extracted     : {}", stats.total_entries());
    println!("  - Directories         : {}", stats.dirs);
    println!("  - Files               : {}", stats.files);
    println!("  - Symlinks            : {}", stats.symlinks);
    println!("  - Other               : {}", stats.other);
    println!("- Total bytes written   : {} ({})", stats.total_bytes, total_bytes);
    println!("- Avg non-empty file    : {:.1} bytes ({})", stats.avg_nonempty_file_size(), avg_file);
    println!("- Unique tail fragments : {}", stats.fragments_used.len());
    println!("- Max directory depth   : {}", stats.max_depth);
    println!("====================================");
}

fn human(bytes: u64) -> String {
    Byte::from_bytes(u128::from(bytes)).get_appropriate_unit(false).to_string()
}
