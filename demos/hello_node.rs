//! A minimal read-only filesystem exposing one file, built on `bridge::Node`/`File` instead of
//! the raw `Filesystem` trait. Compare with `examples/hello.rs` in the upstream `fuser` crate,
//! which implements the same filesystem directly against the kernel-facing trait.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use clap::Parser;

use nodefuse::bridge::{Context, File, Node, NodeFilesystem, NodeFsOptions, StatFs};
use nodefuse::{Errno, FileAttr, FileType, INodeNo, MountOption, OpenFlags};

const TTL: Duration = Duration::from_secs(1);
const HELLO_TXT_CONTENT: &str = "Hello World!\n";

#[derive(Parser)]
#[command(version, author = "Christopher Berner")]
struct Args {
    mount_point: PathBuf,

    /// Automatically unmount on process exit
    #[clap(long)]
    auto_unmount: bool,
}

fn dir_attr(ino: u64, nlink: u32) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o755,
        nlink,
        uid: 501,
        gid: 20,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn file_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: HELLO_TXT_CONTENT.len() as u64,
        blocks: 1,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0o644,
        nlink: 1,
        uid: 501,
        gid: 20,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// The one and only file in this filesystem.
struct HelloTxt;

impl File for HelloTxt {
    fn read(&self, _ctx: &Context, offset: i64, size: u32) -> Result<Vec<u8>, Errno> {
        let bytes = HELLO_TXT_CONTENT.as_bytes();
        let start = (offset as usize).min(bytes.len());
        let end = (start + size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }
}

/// Either the root directory or `hello.txt`; the root is the only node that ever has children.
enum HelloNode {
    Root,
    HelloTxt,
}

impl Node for HelloNode {
    type File = HelloTxt;

    fn lookup(&self, _ctx: &Context, name: &OsStr) -> Result<(Arc<Self>, FileAttr), Errno> {
        match self {
            HelloNode::Root if name == "hello.txt" => {
                Ok((Arc::new(HelloNode::HelloTxt), file_attr(2)))
            }
            HelloNode::Root => Err(Errno::ENOENT),
            HelloNode::HelloTxt => Err(Errno::ENOTDIR),
        }
    }

    fn getattr(&self, _ctx: &Context) -> Result<FileAttr, Errno> {
        Ok(match self {
            HelloNode::Root => dir_attr(1, 2),
            HelloNode::HelloTxt => file_attr(2),
        })
    }

    fn open(&self, _ctx: &Context, _flags: OpenFlags) -> Result<Self::File, Errno> {
        match self {
            HelloNode::Root => Err(Errno::EISDIR),
            HelloNode::HelloTxt => Ok(HelloTxt),
        }
    }

    fn readdir(&self, _ctx: &Context) -> Result<Vec<nodefuse::bridge::DirEntry>, Errno> {
        match self {
            HelloNode::Root => Ok(vec![nodefuse::bridge::DirEntry {
                name: "hello.txt".into(),
                ino: INodeNo(2),
                kind: FileType::RegularFile,
                attr: Some(file_attr(2)),
            }]),
            HelloNode::HelloTxt => Err(Errno::ENOTDIR),
        }
    }

    fn statfs(&self, _ctx: &Context) -> Result<StatFs, Errno> {
        Ok(StatFs::default())
    }
}

fn main() {
    let args = Args::parse();
    env_logger::init();

    let mut options = vec![MountOption::RO, MountOption::FSName("hello".to_string())];
    if args.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let fs_options = NodeFsOptions {
        entry_timeout: TTL,
        attr_timeout: TTL,
        ..NodeFsOptions::default()
    };
    let fs = NodeFilesystem::new(HelloNode::Root, true, fs_options);
    nodefuse::mount2(fs, &args.mount_point, &options).unwrap();
}
