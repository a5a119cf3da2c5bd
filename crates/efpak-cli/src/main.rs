//! Thin `clap`-derive front end over the `efpak` crate: every subcommand is
//! a parse-and-delegate, the same split the teacher draws between its own
//! CLI binary and the engine crate underneath it.

use clap::{Parser, Subcommand, ValueEnum};
use efpak::{FsId, HookExec, HookWhen, Installer, OutputStream, PackageFile, PartId};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "efpak", about = "Author, inspect and install efpak firmware update packages")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create an empty package
    Create { path: PathBuf },
    /// List every block in a package
    List { path: PathBuf },
    /// Add a whole-disk image block
    AddDisk { path: PathBuf, image: PathBuf },
    /// Add a partition image block
    AddPart {
        path: PathBuf,
        #[arg(value_enum)]
        part: PartArg,
        image: PathBuf,
        /// Defaults to the usual filesystem for the partition kind (vfat
        /// for boot, squashfs for root, ext3 for app) when omitted.
        #[arg(value_enum)]
        fs: Option<FsArg>,
    },
    /// Add a loose file block, installed at an absolute destination path
    AddFile { path: PathBuf, file: PathBuf, dest: String },
    /// Recursively add every regular file under a directory
    AddDir { path: PathBuf, dir: PathBuf, dest_prefix: String },
    /// Add a hook block
    AddHook {
        path: PathBuf,
        /// Comma-separated: now,prex,postx,compl,mbr
        #[arg(long, value_enum, value_delimiter = ',')]
        when: Vec<WhenArg>,
        #[arg(long)]
        execve: bool,
        exec_path: String,
        /// Payload to stage at `exec_path` at install time; omit when
        /// `exec_path` already exists on the target.
        data: Option<PathBuf>,
    },
    /// Extract every block's payload to `dir/%04x`
    Extract { path: PathBuf, dir: PathBuf },
    /// Install a package onto a device
    Install {
        path: PathBuf,
        /// Device name under /dev; omit to install onto the running root device
        device: Option<String>,
    },
    /// Send a package to a remote target over a transport this build
    /// doesn't implement
    Send { path: PathBuf, target: String },
}

#[derive(Copy, Clone, ValueEnum)]
enum PartArg {
    Boot,
    Root,
    App,
}

impl From<PartArg> for PartId {
    fn from(v: PartArg) -> Self {
        match v {
            PartArg::Boot => PartId::Boot,
            PartArg::Root => PartId::Root,
            PartArg::App => PartId::App,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum FsArg {
    Vfat,
    Squashfs,
    Ext2,
    Ext3,
}

impl From<FsArg> for FsId {
    fn from(v: FsArg) -> Self {
        match v {
            FsArg::Vfat => FsId::Vfat,
            FsArg::Squashfs => FsId::Squash,
            FsArg::Ext2 => FsId::Ext2,
            FsArg::Ext3 => FsId::Ext3,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum WhenArg {
    Now,
    Prex,
    Postx,
    Compl,
    Mbr,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => println!("success"),
        Err(e) => {
            eprintln!("failure: {e}");
            std::process::exit(1);
        }
    }
}

fn run(cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Create { path } => Ok(efpak::create(path)?),
        Cmd::List { path } => {
            for b in efpak::list(path)? {
                println!(
                    "{:04x} type={:?} comp={:?} header={} comp_data={} raw_data={} {}",
                    b.index, b.block_type, b.comp, b.header_size, b.comp_data_size, b.raw_data_size, b.detail
                );
            }
            Ok(())
        }
        Cmd::AddDisk { path, image } => {
            let mut stream = OutputStream::create_or_open(path)?;
            stream.add_disk(&image)?;
            Ok(())
        }
        Cmd::AddPart { path, part, image, fs } => {
            let part_id: PartId = part.into();
            let fs_id = fs.map(Into::into).unwrap_or_else(|| FsId::default_for(part_id));
            let mut stream = OutputStream::create_or_open(path)?;
            stream.add_part(&image, part_id, fs_id)?;
            Ok(())
        }
        Cmd::AddFile { path, file, dest } => {
            let mut stream = OutputStream::create_or_open(path)?;
            stream.add_file(&file, &dest)?;
            Ok(())
        }
        Cmd::AddDir { path, dir, dest_prefix } => Ok(efpak::add_dir(path, &dir, &dest_prefix)?),
        Cmd::AddHook { path, when, execve, exec_path, data } => {
            let mut flags = HookWhen::empty();
            for w in when {
                flags |= match w {
                    WhenArg::Now => HookWhen::NOW,
                    WhenArg::Prex => HookWhen::PREX,
                    WhenArg::Postx => HookWhen::POSTX,
                    WhenArg::Compl => HookWhen::COMPL,
                    WhenArg::Mbr => HookWhen::MBR,
                };
            }
            let exec = if execve { HookExec::EXECVE } else { HookExec::empty() };
            let mut stream = OutputStream::create_or_open(path)?;
            stream.add_hook(data.as_deref(), &exec_path, flags, exec)?;
            Ok(())
        }
        Cmd::Extract { path, dir } => Ok(efpak::extract(path, dir)?),
        Cmd::Install { path, device } => {
            let mut installer = match device {
                Some(name) => Installer::open_named(&name)?,
                None => Installer::open_root()?,
            };
            let file = PackageFile::open(&path)?;
            let mut reader = file.reader();
            installer.run(&mut reader)?;
            Ok(())
        }
        Cmd::Send { path: _, target } => Err(efpak::Error::Unsupported(format!(
            "sending to {target} requires a transport this build doesn't implement"
        ))
        .into()),
    }
}
