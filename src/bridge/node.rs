//! User-facing contract: a caller implements [`Node`] (and [`File`] for open handles) instead
//! of the full `Filesystem` trait. [`dispatcher::NodeFilesystem`](super::dispatcher::NodeFilesystem)
//! is the adapter that turns kernel requests into calls on these traits.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::ll::TimeOrNow;
use crate::{AccessFlags, Errno, FileAttr, INodeNo};

use super::cancel::Cancel;

/// Caller identity plus a liveness signal for the in-flight request.
///
/// `cancel` is armed by an INTERRUPT for this request's unique id; long-running node/file
/// methods should poll [`Cancel::is_cancelled`] at natural suspension points (before or between
/// I/O syscalls) and return [`Errno::EINTR`] promptly when set.
#[derive(Debug, Clone)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub cancel: Cancel,
}

impl Context {
    pub(crate) fn new(uid: u32, gid: u32, pid: u32, cancel: Cancel) -> Self {
        Self {
            uid,
            gid,
            pid,
            cancel,
        }
    }
}

/// Per-mount node-layer options, distinct from the device-level [`crate::MountOption`]s.
#[derive(Debug, Clone)]
pub struct NodeFsOptions {
    /// TTL the kernel may cache a successful `Lookup` reply for.
    pub entry_timeout: Duration,
    /// TTL the kernel may cache a `GetAttr`/`SetAttr` reply for.
    pub attr_timeout: Duration,
    /// TTL attached to a negative (ENOENT) `Lookup` reply; `None` disables negative caching.
    pub negative_timeout: Option<Duration>,
    /// Report 32-bit-safe inode numbers (low 32 bits nonzero, avoids portability foot-guns
    /// on hosts that truncate `ino_t`).
    pub portable_inodes: bool,
    /// The directory entry listing already contains attributes for each child, so `Readdir`
    /// can synthesize `Lookup` results without a second round trip to the user node.
    pub lookup_known_children: bool,
    /// Override the reported uid/gid on every `GetAttr`, regardless of what the node returns.
    pub owner: Option<(u32, u32)>,
}

impl Default for NodeFsOptions {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_timeout: None,
            portable_inodes: false,
            lookup_known_children: false,
            owner: None,
        }
    }
}

/// A single child produced by [`Node::readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: std::ffi::OsString,
    pub ino: INodeNo,
    pub kind: crate::FileType,
    /// Attributes for this child, when the backing directory listing already carries them
    /// (lets `ReaddirPlus` and `LookupKnownChildren` skip a second `Lookup`).
    pub attr: Option<FileAttr>,
}

/// A request to change one or more `SetAttr`-able fields, skipping whatever the kernel's valid
/// mask did not request. Applied by the dispatcher in the order mandated by the wire protocol:
/// mode, owner, size, then times.
#[derive(Debug, Clone, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
}

/// A filesystem entity reachable through the inode tree: a directory, regular file, symlink,
/// or special file. One `Node` per distinct object; hardlinked names under the path adapter
/// share a `Node` instance (see [`super::path_adapter`]).
///
/// Every method may return `Errno::ENOSYS` to indicate "not supported"; the dispatcher recovers
/// by falling back to a path-based equivalent where one exists, or surfaces the error untouched
/// otherwise. Default bodies below all do exactly that.
pub trait Node: Send + Sync + 'static {
    /// The open-file object this node vends from `open`/`create`.
    type File: File;

    /// Look up `name` among this node's children. Returns the existing or freshly created
    /// child node plus its attributes. The kernel-facing nodeid is assigned by
    /// [`super::tree::InodeTree`], not by this call; `Node` only ever hands back the object
    /// that represents the child, never an id of its own.
    fn lookup(&self, ctx: &Context, name: &OsStr) -> Result<(Arc<Self>, FileAttr), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, name);
        Err(Errno::ENOENT)
    }

    fn getattr(&self, ctx: &Context) -> Result<FileAttr, Errno>;

    fn setattr(&self, ctx: &Context, req: &SetAttrRequest) -> Result<FileAttr, Errno> {
        let _ = (ctx, req);
        Err(Errno::ENOSYS)
    }

    fn readlink(&self, ctx: &Context) -> Result<std::ffi::OsString, Errno> {
        let _ = ctx;
        Err(Errno::EINVAL)
    }

    fn mknod(
        &self,
        ctx: &Context,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<(Arc<Self>, FileAttr), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, name, mode, umask, rdev);
        Err(Errno::ENOSYS)
    }

    fn mkdir(
        &self,
        ctx: &Context,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<(Arc<Self>, FileAttr), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, name, mode, umask);
        Err(Errno::ENOSYS)
    }

    fn unlink(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        let _ = (ctx, name);
        Err(Errno::ENOSYS)
    }

    fn rmdir(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        let _ = (ctx, name);
        Err(Errno::ENOSYS)
    }

    fn symlink(
        &self,
        ctx: &Context,
        link_name: &OsStr,
        target: &Path,
    ) -> Result<(Arc<Self>, FileAttr), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, link_name, target);
        Err(Errno::EPERM)
    }

    /// Rename `name` (a child of `self`) to `newname` under `newparent`. The dispatcher has
    /// already established that both parents belong to the same mount.
    fn rename(
        &self,
        ctx: &Context,
        name: &OsStr,
        newparent: &dyn Node<File = Self::File>,
        newname: &OsStr,
    ) -> Result<(), Errno> {
        let _ = (ctx, name, newparent, newname);
        Err(Errno::ENOSYS)
    }

    fn link(
        &self,
        ctx: &Context,
        newparent: &dyn Node<File = Self::File>,
        newname: &OsStr,
    ) -> Result<(Arc<Self>, FileAttr), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, newparent, newname);
        Err(Errno::EPERM)
    }

    fn open(&self, ctx: &Context, flags: crate::OpenFlags) -> Result<Self::File, Errno> {
        let _ = (ctx, flags);
        Err(Errno::ENOSYS)
    }

    fn create(
        &self,
        ctx: &Context,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(Arc<Self>, FileAttr, Self::File), Errno>
    where
        Self: Sized,
    {
        let _ = (ctx, name, mode, umask, flags);
        Err(Errno::ENOSYS)
    }

    /// Snapshot this directory's entries for a fresh `OpenDir`/`Readdir` cycle.
    fn readdir(&self, ctx: &Context) -> Result<Vec<DirEntry>, Errno> {
        let _ = ctx;
        Err(Errno::ENOTDIR)
    }

    fn statfs(&self, ctx: &Context) -> Result<StatFs, Errno> {
        let _ = ctx;
        Ok(StatFs::default())
    }

    fn access(&self, ctx: &Context, mask: AccessFlags) -> Result<(), Errno> {
        let _ = (ctx, mask);
        Err(Errno::ENOSYS)
    }

    fn getxattr(&self, ctx: &Context, name: &OsStr, size: u32) -> Result<Vec<u8>, Errno> {
        let _ = (ctx, name, size);
        Err(Errno::ENOSYS)
    }

    fn setxattr(
        &self,
        ctx: &Context,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<(), Errno> {
        let _ = (ctx, name, value, flags, position);
        Err(Errno::ENOSYS)
    }

    fn listxattr(&self, ctx: &Context, size: u32) -> Result<Vec<u8>, Errno> {
        let _ = (ctx, size);
        Err(Errno::ENOSYS)
    }

    fn removexattr(&self, ctx: &Context, name: &OsStr) -> Result<(), Errno> {
        let _ = (ctx, name);
        Err(Errno::ENOSYS)
    }

    /// Whether this node may be reclaimed once its lookup count reaches zero and it has no
    /// live children. Nodes backing something that must outlive kernel references (e.g. a
    /// pinned root) should return `false`.
    fn deletable(&self) -> bool {
        true
    }

    /// Called once the inode tree has dropped its last reference, after `deletable` allowed it.
    fn on_forget(&self) {}
}

/// An open file or directory handle vended by [`Node::open`]/[`Node::create`].
pub trait File: Send + Sync + 'static {
    fn read(&self, ctx: &Context, offset: i64, size: u32) -> Result<Vec<u8>, Errno> {
        let _ = (ctx, offset, size);
        Err(Errno::ENOSYS)
    }

    fn write(&self, ctx: &Context, offset: i64, data: &[u8]) -> Result<u32, Errno> {
        let _ = (ctx, offset, data);
        Err(Errno::ENOSYS)
    }

    fn flush(&self, ctx: &Context) -> Result<(), Errno> {
        let _ = ctx;
        Ok(())
    }

    fn release(&self, ctx: &Context) -> Result<(), Errno> {
        let _ = ctx;
        Ok(())
    }

    fn fsync(&self, ctx: &Context, datasync: bool) -> Result<(), Errno> {
        let _ = (ctx, datasync);
        Err(Errno::ENOSYS)
    }

    fn getattr(&self, ctx: &Context) -> Result<FileAttr, Errno> {
        let _ = ctx;
        Err(Errno::ENOSYS)
    }

    fn setattr(&self, ctx: &Context, req: &SetAttrRequest) -> Result<FileAttr, Errno> {
        let _ = (ctx, req);
        Err(Errno::ENOSYS)
    }

    fn getlk(
        &self,
        ctx: &Context,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
    ) -> Result<(u64, u64, i32, u32), Errno> {
        let _ = (ctx, start, end, typ, pid);
        Err(Errno::ENOSYS)
    }

    fn setlk(
        &self,
        ctx: &Context,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
    ) -> Result<(), Errno> {
        let _ = (ctx, start, end, typ, pid, sleep);
        Err(Errno::ENOSYS)
    }

    fn fallocate(&self, ctx: &Context, offset: i64, length: i64, mode: i32) -> Result<(), Errno> {
        let _ = (ctx, offset, length, mode);
        Err(Errno::ENOSYS)
    }
}

/// Result of [`Node::statfs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}
