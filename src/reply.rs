//! Filesystem operation reply
//!
//! A reply is passed to filesystem operation implementations and must be used to send back the
//! result of an operation. The implementation should use the `reply.ok(...)` method to send the
//! result, or `reply.error(...)` if the request couldn't be completed.

use std::ffi::OsStr;
use std::fmt;
use std::io::IoSlice;
use std::time::Duration;
use std::time::SystemTime;

use log::warn;

use crate::FileAttr;
use crate::Generation;
use crate::INodeNo;
use crate::ll;
use crate::ll::Errno;
use crate::ll::FileHandle;
use crate::ll::RequestId;
use crate::ll::flags::fopen_flags::FopenFlags;
use crate::ll::flags::poll_flags::PollEvents;
use crate::ll::reply::Attr as AttrOut;
use crate::ll::reply::DirEntList;
use crate::ll::reply::DirEntOffset;
use crate::ll::reply::DirEntry;
#[cfg(feature = "abi-7-21")]
use crate::ll::reply::DirEntPlusList;
#[cfg(feature = "abi-7-21")]
use crate::ll::reply::DirEntryPlus;

/// Generic reply callback to send data
pub(crate) trait ReplySender: Send + Sync + Unpin + 'static {
    /// Send data.
    fn send(&self, data: &[IoSlice<'_>]) -> std::io::Result<()>;
}

impl fmt::Debug for Box<dyn ReplySender> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Box<ReplySender>")
    }
}

/// Generic reply trait
pub(crate) trait Reply {
    /// Create a new reply for the given request id that uses the given sender
    /// to send the reply
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self;
}

///
#[derive(Debug)]
pub(crate) struct ReplyRaw<'a, T> {
    /// Unique id of the request to reply to
    unique: RequestId,
    /// Closure to call for sending the reply
    sender: Option<Box<dyn ReplySender>>,
    marker: std::marker::PhantomData<&'a T>,
}

impl<'a, T> Reply for ReplyRaw<'a, T> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        let sender = Box::new(sender);
        Self {
            unique: RequestId(unique),
            sender: Some(sender),
            marker: std::marker::PhantomData,
        }
    }
}

impl<'a, T> ReplyRaw<'a, T> {
    /// Reply to a request with the given error code and data. Can only be called once
    /// (the `self` argument is consumed).
    fn send_ll(mut self, response: &ll::Response<'_>) {
        assert!(self.sender.is_some());
        let sender = self.sender.take().unwrap();
        let res = response.with_iovec(self.unique, |iov| sender.send(iov));
        if let Err(err) = res {
            warn!("Failed to send FUSE reply: {}", err);
        }
    }

    /// Reply to a request with the given error code
    pub(crate) fn error(self, err: Errno) {
        self.send_ll(&ll::Response::new_error(err));
    }
}

impl<'a, T> Drop for ReplyRaw<'a, T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!(
                "Reply not sent for operation {}, replying with I/O error",
                self.unique.0
            );
            let error = ll::Response::new_error(Errno::EIO);
            self.send_ll_from_drop(&error);
        }
    }
}

impl<'a, T> ReplyRaw<'a, T> {
    fn send_ll_from_drop(&mut self, response: &ll::Response<'_>) {
        if let Some(sender) = self.sender.take() {
            let res = response.with_iovec(self.unique, |iov| sender.send(iov));
            if let Err(err) = res {
                warn!("Failed to send FUSE reply: {}", err);
            }
        }
    }
}

/// Empty reply
#[derive(Debug)]
pub struct ReplyEmpty<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyEmpty<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyEmpty<'a> {
    /// Reply to a request with nothing
    pub fn ok(self) {
        self.reply.send_ll(&ll::Response::new_empty());
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Data reply
#[derive(Debug)]
pub struct ReplyData<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyData<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyData<'a> {
    /// Reply to a request with the given data
    pub fn data(self, data: &[u8]) {
        self.reply.send_ll(&ll::Response::new_slice(data));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Entry reply
#[derive(Debug)]
pub struct ReplyEntry<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyEntry<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyEntry<'a> {
    /// Reply to a request with the given entry
    pub fn entry(self, ttl: &Duration, attr: &FileAttr, generation: u64) {
        self.reply.send_ll(&ll::Response::new_entry(
            attr.ino,
            Generation(generation),
            &AttrOut::from(attr),
            *ttl,
            *ttl,
        ));
    }

    /// Reply to a request with the given entry, using distinct entry/attr timeouts
    pub fn entry_with_timeouts(
        self,
        entry_ttl: &Duration,
        attr_ttl: &Duration,
        attr: &FileAttr,
        generation: u64,
    ) {
        self.reply.send_ll(&ll::Response::new_entry(
            attr.ino,
            Generation(generation),
            &AttrOut::from(attr),
            *attr_ttl,
            *entry_ttl,
        ));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Attr reply
#[derive(Debug)]
pub struct ReplyAttr<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyAttr<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyAttr<'a> {
    /// Reply to a request with the given attribute
    pub fn attr(self, ttl: &Duration, attr: &FileAttr) {
        self.reply
            .send_ll(&ll::Response::new_attr(ttl, &AttrOut::from(attr)));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// XTimes reply, for macOS only
#[cfg(target_os = "macos")]
#[derive(Debug)]
pub struct ReplyXTimes<'a> {
    reply: ReplyRaw<'a, ()>,
}

#[cfg(target_os = "macos")]
impl<'a> Reply for ReplyXTimes<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

#[cfg(target_os = "macos")]
impl<'a> ReplyXTimes<'a> {
    /// Reply to a request with the given xtimes
    pub fn xtimes(self, bkuptime: SystemTime, crtime: SystemTime) {
        self.reply
            .send_ll(&ll::Response::new_xtimes(bkuptime, crtime));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Open reply
#[derive(Debug)]
pub struct ReplyOpen<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyOpen<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyOpen<'a> {
    /// Reply to a request with the given open result
    pub fn opened(self, fh: FileHandle, flags: FopenFlags) {
        self.reply
            .send_ll(&ll::Response::new_open(fh, flags, 0));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Write reply
#[derive(Debug)]
pub struct ReplyWrite<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyWrite<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyWrite<'a> {
    /// Reply to a request with the given open result
    pub fn written(self, size: u32) {
        self.reply.send_ll(&ll::Response::new_write(size));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Statfs reply
#[derive(Debug)]
pub struct ReplyStatfs<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyStatfs<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyStatfs<'a> {
    /// Reply to a request with the given open result
    #[allow(clippy::too_many_arguments)]
    pub fn statfs(
        self,
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) {
        self.reply.send_ll(&ll::Response::new_statfs(
            blocks, bfree, bavail, files, ffree, bsize, namelen, frsize,
        ));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Create reply
#[derive(Debug)]
pub struct ReplyCreate<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyCreate<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyCreate<'a> {
    /// Reply to a request with the given entry
    pub fn created(
        self,
        ttl: &Duration,
        attr: &FileAttr,
        generation: u64,
        fh: FileHandle,
        flags: FopenFlags,
    ) {
        self.reply.send_ll(&ll::Response::new_create(
            ttl,
            &AttrOut::from(attr),
            Generation(generation),
            fh,
            flags,
            0,
        ));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Lock reply
#[derive(Debug)]
pub struct ReplyLock<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyLock<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyLock<'a> {
    /// Reply to a request with the given lock
    pub fn locked(self, start: u64, end: u64, typ: i32, pid: u32) {
        self.reply.send_ll(&ll::Response::new_lock(&ll::Lock {
            range: (start, end),
            typ,
            pid,
        }));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Bmap reply
#[derive(Debug)]
pub struct ReplyBmap<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyBmap<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyBmap<'a> {
    /// Reply to a request with the given bmap block
    pub fn bmap(self, block: u64) {
        self.reply.send_ll(&ll::Response::new_bmap(block));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Xattr reply
#[derive(Debug)]
pub struct ReplyXattr<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyXattr<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyXattr<'a> {
    /// Reply to a request with the size of the xattr.
    pub fn size(self, size: u32) {
        self.reply.send_ll(&ll::Response::new_xattr_size(size));
    }

    /// Reply to a request with the data in the xattr.
    pub fn data(self, data: &[u8]) {
        self.reply.send_ll(&ll::Response::new_slice(data));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Ioctl reply
#[derive(Debug)]
pub struct ReplyIoctl<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyIoctl<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyIoctl<'a> {
    /// Reply to a request with the given ioctl result
    pub fn ioctl(self, result: i32, data: &[u8]) {
        self.reply
            .send_ll(&ll::Response::new_ioctl(result, &[IoSlice::new(data)]));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Poll reply
#[derive(Debug)]
pub struct ReplyPoll<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyPoll<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyPoll<'a> {
    /// Reply to a request with the given poll result
    pub fn poll(self, revents: PollEvents) {
        self.reply.send_ll(&ll::Response::new_poll(revents));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Lseek reply
#[derive(Debug)]
pub struct ReplyLseek<'a> {
    reply: ReplyRaw<'a, ()>,
}

impl<'a> Reply for ReplyLseek<'a> {
    fn new<S: ReplySender>(unique: u64, sender: S) -> Self {
        Self {
            reply: Reply::new(unique, sender),
        }
    }
}

impl<'a> ReplyLseek<'a> {
    /// Reply to a request with the given offset
    pub fn offset(self, offset: i64) {
        self.reply.send_ll(&ll::Response::new_lseek(offset));
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

/// Directory reply
#[derive(Debug)]
pub struct ReplyDirectory<'a> {
    reply: ReplyRaw<'a, ()>,
    buf: DirEntList,
}

impl<'a> ReplyDirectory<'a> {
    /// Creates a new [`ReplyDirectory`] with a specific size to reply
    pub(crate) fn new<S: ReplySender>(unique: u64, sender: S, size: usize) -> Self {
        Self {
            reply: Reply::new(unique, sender),
            buf: DirEntList::new(size),
        }
    }

    /// Add an entry to the directory reply buffer. Returns true if the buffer is full.
    /// A transparent offset value can be provided for each entry. The kernel uses these
    /// value to request the next entries in further readdir calls
    #[must_use]
    pub fn add<T: AsRef<OsStr>>(
        &mut self,
        ino: INodeNo,
        offset: i64,
        kind: crate::FileType,
        name: T,
    ) -> bool {
        let name = std::path::Path::new(name.as_ref());
        self.buf.push(&DirEntry::new(
            ino,
            DirEntOffset(offset as u64),
            kind,
            name,
        ))
    }

    /// Reply to a request with the filled directory buffer
    pub fn ok(self) {
        self.reply.send_ll(&self.buf.into());
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

impl<'a> fmt::Debug for DirEntList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntList").finish_non_exhaustive()
    }
}

/// Directory-plus reply (`readdirplus`)
#[cfg(feature = "abi-7-21")]
#[derive(Debug)]
pub struct ReplyDirectoryPlus<'a> {
    reply: ReplyRaw<'a, ()>,
    buf: DirEntPlusList,
}

#[cfg(feature = "abi-7-21")]
impl<'a> ReplyDirectoryPlus<'a> {
    /// Creates a new [`ReplyDirectoryPlus`] with a specific size to reply
    pub(crate) fn new<S: ReplySender>(unique: u64, sender: S, size: usize) -> Self {
        Self {
            reply: Reply::new(unique, sender),
            buf: DirEntPlusList::new(size),
        }
    }

    /// Add an entry to the directory reply buffer. Returns true if the buffer is full.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn add<T: AsRef<OsStr>>(
        &mut self,
        ino: INodeNo,
        generation: u64,
        offset: i64,
        name: T,
        entry_ttl: &Duration,
        attr: &FileAttr,
        attr_ttl: &Duration,
    ) -> bool {
        let name = std::path::Path::new(name.as_ref());
        self.buf.push(&DirEntryPlus::new(
            ino,
            Generation(generation),
            DirEntOffset(offset as u64),
            name,
            *entry_ttl,
            AttrOut::from(attr),
            *attr_ttl,
        ))
    }

    /// Reply to a request with the filled directory buffer
    pub fn ok(self) {
        self.reply.send_ll(&self.buf.into());
    }

    /// Reply to a request with the given error code
    pub fn error(self, err: Errno) {
        self.reply.error(err);
    }
}

#[cfg(feature = "abi-7-21")]
impl<'a> fmt::Debug for DirEntPlusList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntPlusList").finish_non_exhaustive()
    }
}
