//! Translates kernel requests into calls on a [`Node`]/[`File`] implementation.
//!
//! [`NodeFilesystem`] implements [`crate::Filesystem`] by driving [`tree::InodeTree`] (inode
//! identity and lookup counts) and [`file_table::FileHandleTable`] (open file/directory
//! handles), wrapping each dispatched request in a [`cancel::CancelTable`] entry so long-running
//! `Node`/`File` methods can observe an `INTERRUPT` via [`Context::cancel`].
//!
//! Lock order: this type never holds a tree or file-table lock while calling into user code —
//! every `Node`/`File` call happens either before any lock is taken or after it has been
//! released. See `DESIGN.md` for the full ordering invariant.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::ll::TimeOrNow;
use crate::forget_one::ForgetOne;
use crate::{
    AccessFlags, BsdFileFlags, CopyFileRangeFlags, Errno, FileAttr, FileHandle, FileType,
    FopenFlags, INodeNo, IoctlFlags, KernelConfig, LockOwner, OpenFlags, ReadFlags, RenameFlags,
    Request, WriteFlags,
};
use crate::reply::{
    ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty,
    ReplyEntry, ReplyIoctl, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
};

use super::cancel::CancelTable;
use super::file_table::FileHandleTable;
use super::handle::HandleMapKind;
use super::node::{Context, DirEntry, File, Node, NodeFsOptions, SetAttrRequest};
use super::notify_pending::{PendingRetrieves, RetrieveWaiter};
use super::tree::InodeTree;

struct CancelGuard<'a> {
    table: &'a CancelTable,
    unique: crate::RequestId,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.table.end(self.unique);
    }
}

fn zero_attr() -> FileAttr {
    FileAttr {
        ino: INodeNo(0),
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

/// Adapts a [`Node`] tree into a full [`crate::Filesystem`].
pub struct NodeFilesystem<N: Node> {
    options: NodeFsOptions,
    tree: InodeTree<N>,
    files: FileHandleTable<N::File>,
    cancel: CancelTable,
    /// Outstanding `RetrieveCache` notifications this filesystem has sent, waiting on a
    /// matching `NOTIFY_REPLY`. See [`super::notify_pending`].
    retrieves: PendingRetrieves,
    /// Directory listing snapshots, keyed by `Fh`. Populated on the first `Readdir`/
    /// `Readdirplus` at offset 0 after `OpenDir`, reused for later pages, dropped at
    /// `ReleaseDir`.
    dir_snapshots: Mutex<HashMap<u64, Vec<super::node::DirEntry>>>,
}

impl<N: Node> NodeFilesystem<N> {
    /// Builds a filesystem rooted at `root`, allocating nodeids and file handles through the
    /// default (recycling) [`super::handle::HandleMap`] implementation.
    pub fn new(root: N, root_is_dir: bool, options: NodeFsOptions) -> Self {
        Self::with_handle_map(root, root_is_dir, options, HandleMapKind::default())
    }

    /// Like [`Self::new`], but selects the nodeid/Fh allocation strategy explicitly. The same
    /// `HandleMapKind` backs both the inode tree's nodeids and the file-handle table's `Fh`s.
    pub fn with_handle_map(
        root: N,
        root_is_dir: bool,
        options: NodeFsOptions,
        handle_kind: HandleMapKind,
    ) -> Self {
        Self {
            options,
            tree: InodeTree::new(Arc::new(root), root_is_dir, handle_kind),
            files: FileHandleTable::with_handle_map(handle_kind),
            cancel: CancelTable::new(),
            retrieves: PendingRetrieves::new(),
            dir_snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Sends a `RetrieveCache` notification for `size` bytes of `ino`'s data starting at
    /// `offset`, returning a waiter that resolves once the kernel's matching `NOTIFY_REPLY`
    /// arrives through [`crate::Filesystem::notify_reply`] (or `None` if the filesystem
    /// unmounts first). `notifier` is typically obtained from `BackgroundSession::notifier()`.
    /// # Errors
    /// Returns an error if the kernel rejects the notification.
    pub fn retrieve_cache(
        &self,
        notifier: &crate::Notifier,
        ino: INodeNo,
        offset: u64,
        size: u32,
    ) -> io::Result<RetrieveWaiter> {
        let (unique, waiter) = self.retrieves.begin();
        notifier.retrieve(unique, ino, offset, size)?;
        Ok(waiter)
    }

    fn begin(&self, req: &Request) -> (Context, CancelGuard<'_>) {
        let cancel = self.cancel.begin(req.unique());
        let guard = CancelGuard {
            table: &self.cancel,
            unique: req.unique(),
        };
        (Context::new(req.uid(), req.gid(), req.pid(), cancel), guard)
    }

    fn node(&self, ino: INodeNo) -> Result<Arc<N>, Errno> {
        self.tree.node(ino).ok_or(Errno::ENOENT)
    }

    /// Applies `NodeFsOptions::owner`, if set, overriding the uid/gid a `Node` reported, and
    /// rewrites a reported `nlink` of `0` to `1` — the kernel treats a zero link count as
    /// "already unlinked" and will refuse further opens against the inode, which a `Node` that
    /// simply never bothered to compute a real link count should not trigger.
    fn fixup_attr(&self, mut attr: FileAttr) -> FileAttr {
        if let Some((uid, gid)) = self.options.owner {
            attr.uid = uid;
            attr.gid = gid;
        }
        if attr.nlink == 0 {
            attr.nlink = 1;
        }
        attr
    }

    /// Resolves the `File` a request should operate through: the handle on `fh` if the kernel
    /// sent one, otherwise any live handle open on `ino` (the `SetAttr`-without-`Fh` case
    /// described by [`super::node::SetAttrRequest`]'s call sites).
    fn file_for(&self, ino: INodeNo, fh: Option<FileHandle>) -> Option<Arc<N::File>> {
        fh.and_then(|fh| self.files.get(fh.0))
            .or_else(|| self.files.any_handle_for_inode(ino))
    }

    /// Builds the synthesized `.` and `..` entries every directory listing is prefixed with,
    /// per the snapshot taken at the first `Readdir`/`Readdirplus` of an `OpenDir` session.
    /// `..` targets the parent tracked by the inode tree, falling back to `ino` itself at the
    /// root (which has no parent). Either entry is silently omitted if its attributes can't be
    /// fetched; the bulk of the listing still comes through.
    fn dot_entries(&self, ctx: &Context, ino: INodeNo) -> Vec<DirEntry> {
        let parent = self.tree.parent_of(ino).unwrap_or(ino);
        let mut dots = Vec::with_capacity(2);
        if let Ok(attr) = self.node(ino).and_then(|n| n.getattr(ctx)) {
            dots.push(DirEntry {
                name: std::ffi::OsString::from("."),
                ino,
                kind: FileType::Directory,
                attr: Some(attr),
            });
        }
        if let Ok(attr) = self.node(parent).and_then(|n| n.getattr(ctx)) {
            dots.push(DirEntry {
                name: std::ffi::OsString::from(".."),
                ino: parent,
                kind: FileType::Directory,
                attr: Some(attr),
            });
        }
        dots
    }

    fn open_common(
        &self,
        ctx: &Context,
        node: &N,
        is_dir: bool,
        ino: INodeNo,
        flags: OpenFlags,
        file: Option<N::File>,
    ) -> (FileHandle, FopenFlags) {
        let _ = node;
        let fh = self
            .files
            .register(ino, is_dir, file.map(Arc::new), flags, FopenFlags::empty());
        self.tree.note_handle_opened(ino);
        let _ = ctx;
        (FileHandle(fh), FopenFlags::empty())
    }
}

impl<N: Node> crate::Filesystem for NodeFilesystem<N> {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.retrieves.abort_all();
    }

    fn interrupt(&self, _req: &Request, unique: crate::RequestId) {
        self.cancel.interrupt(unique);
    }

    fn notify_reply(&self, _req: &Request, unique: u64, data: &[u8]) {
        self.retrieves.complete(unique, data.to_vec());
    }

    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let (ctx, _guard) = self.begin(req);
        let name = name.to_os_string();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let result = self.tree.lookup(parent, &name, |parent_node| {
            let (child, attr) = parent_node.lookup(&ctx, &name)?;
            let is_dir = attr.kind == FileType::Directory;
            attr_slot.set(Some(attr));
            Ok((child, is_dir))
        });
        match result {
            Ok((ino, _is_dir, created)) => {
                let mount = self.tree.mount_of(ino);
                let trust_cached = created && mount.as_ref().map(|m| m.attrs_fresh()).unwrap_or(true);
                let attr = match attr_slot.take() {
                    Some(a) if trust_cached => a,
                    _ => match self.node(ino).and_then(|n| n.getattr(&ctx)) {
                        Ok(a) => a,
                        Err(e) => {
                            reply.error(e);
                            return;
                        }
                    },
                };
                if let Some(mount) = mount {
                    mount.mark_attrs_fresh();
                }
                self.tree.note_lookup_reply(ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = ino;
                reply.entry_with_timeouts(
                    &self.options.entry_timeout,
                    &self.options.attr_timeout,
                    &attr,
                    self.tree.generation(ino),
                );
            }
            Err(Errno::ENOENT) => {
                if let Some(neg_ttl) = self.options.negative_timeout {
                    reply.entry_with_timeouts(&neg_ttl, &Duration::ZERO, &zero_attr(), 0);
                } else {
                    reply.error(Errno::ENOENT);
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        self.tree.forget(ino, nlookup);
    }

    fn batch_forget(&self, _req: &Request, nodes: &[ForgetOne]) {
        for node in nodes {
            self.tree.forget(node.nodeid(), node.nlookup());
        }
    }

    fn getattr(&self, req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        let (ctx, _guard) = self.begin(req);
        let result = match self.file_for(ino, fh) {
            Some(file) => file.getattr(&ctx).or_else(|e| {
                if e == Errno::ENOSYS {
                    self.node(ino).and_then(|n| n.getattr(&ctx))
                } else {
                    Err(e)
                }
            }),
            None => self.node(ino).and_then(|n| n.getattr(&ctx)),
        };
        match result {
            Ok(attr) => reply.attr(&self.options.attr_timeout, &self.fixup_attr(attr)),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let (ctx, _guard) = self.begin(req);
        let setattr_req = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            ctime,
        };
        let result = match self.file_for(ino, fh) {
            Some(file) => file.setattr(&ctx, &setattr_req).or_else(|e| {
                if e == Errno::ENOSYS {
                    self.node(ino).and_then(|n| n.setattr(&ctx, &setattr_req))
                } else {
                    Err(e)
                }
            }),
            None => self.node(ino).and_then(|n| n.setattr(&ctx, &setattr_req)),
        };
        match result {
            Ok(attr) => reply.attr(&self.options.attr_timeout, &self.fixup_attr(attr)),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&self, req: &Request, ino: INodeNo, reply: ReplyData) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.readlink(&ctx)) {
            Ok(target) => reply.data(target.as_encoded_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let (ctx, _guard) = self.begin(req);
        let name = name.to_os_string();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let result = self.tree.lookup(parent, &name, |parent_node| {
            let (child, attr) = parent_node.mknod(&ctx, &name, mode, umask, rdev)?;
            let is_dir = attr.kind == FileType::Directory;
            attr_slot.set(Some(attr));
            Ok((child, is_dir))
        });
        match result {
            Ok((ino, _is_dir, _created)) => {
                let Some(attr) = attr_slot.take() else {
                    reply.error(Errno::EEXIST);
                    return;
                };
                self.tree.note_lookup_reply(ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = ino;
                reply.entry_with_timeouts(&self.options.entry_timeout, &self.options.attr_timeout, &attr, self.tree.generation(ino));
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let (ctx, _guard) = self.begin(req);
        let name = name.to_os_string();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let result = self.tree.lookup(parent, &name, |parent_node| {
            let (child, attr) = parent_node.mkdir(&ctx, &name, mode, umask)?;
            attr_slot.set(Some(attr));
            Ok((child, true))
        });
        match result {
            Ok((ino, _is_dir, _created)) => {
                let Some(attr) = attr_slot.take() else {
                    reply.error(Errno::EEXIST);
                    return;
                };
                self.tree.note_lookup_reply(ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = ino;
                reply.entry_with_timeouts(&self.options.entry_timeout, &self.options.attr_timeout, &attr, self.tree.generation(ino));
            }
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        let Some(parent_node) = self.tree.node(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match parent_node.unlink(&ctx, name) {
            Ok(()) => {
                self.tree.unlink_name(parent, name);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        let Some(parent_node) = self.tree.node(parent) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match parent_node.rmdir(&ctx, name) {
            Ok(()) => {
                self.tree.unlink_name(parent, name);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn symlink(
        &self,
        req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (ctx, _guard) = self.begin(req);
        let name = link_name.to_os_string();
        let target = target.to_path_buf();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let result = self.tree.lookup(parent, &name, |parent_node| {
            let (child, attr) = parent_node.symlink(&ctx, &name, &target)?;
            attr_slot.set(Some(attr));
            Ok((child, false))
        });
        match result {
            Ok((ino, _is_dir, _created)) => {
                let Some(attr) = attr_slot.take() else {
                    reply.error(Errno::EEXIST);
                    return;
                };
                self.tree.note_lookup_reply(ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = ino;
                reply.entry_with_timeouts(&self.options.entry_timeout, &self.options.attr_timeout, &attr, self.tree.generation(ino));
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let (ctx, _guard) = self.begin(req);
        let (Some(parent_node), Some(newparent_node)) =
            (self.tree.node(parent), self.tree.node(newparent))
        else {
            reply.error(Errno::ENOENT);
            return;
        };
        // Reject a cross-mount or mountpoint-source rename before the user's `Node::rename`
        // ever runs, so a rename the tree is always going to refuse can't first execute
        // against the backing node and only then be reported to the kernel as failed.
        if let Err(e) = self.tree.check_rename(parent, name, newparent) {
            reply.error(e);
            return;
        }
        match parent_node.rename(&ctx, name, &*newparent_node, newname) {
            Ok(()) => match self.tree.rename(parent, name, newparent, newname) {
                Ok(_) => reply.ok(),
                Err(e) => reply.error(e),
            },
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &self,
        req: &Request,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (ctx, _guard) = self.begin(req);
        let (Some(source_node), Some(newparent_node)) =
            (self.tree.node(ino), self.tree.node(newparent))
        else {
            reply.error(Errno::ENOENT);
            return;
        };
        let name = newname.to_os_string();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let result = self.tree.lookup(newparent, &name, |_| {
            let (child, attr) = source_node.link(&ctx, &*newparent_node, &name)?;
            attr_slot.set(Some(attr));
            Ok((child, false))
        });
        match result {
            Ok((new_ino, _is_dir, _created)) => {
                let Some(attr) = attr_slot.take() else {
                    reply.error(Errno::EEXIST);
                    return;
                };
                self.tree.note_lookup_reply(new_ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = new_ino;
                reply.entry_with_timeouts(&self.options.entry_timeout, &self.options.attr_timeout, &attr, self.tree.generation(new_ino));
            }
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let (ctx, _guard) = self.begin(req);
        let Ok(node) = self.node(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match node.open(&ctx, flags) {
            Ok(file) => {
                let (fh, fuse_flags) = self.open_common(&ctx, &node, false, ino, flags, Some(file));
                reply.opened(fh, fuse_flags);
            }
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _read_flags: ReadFlags,
        _flags: u32,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let (ctx, _guard) = self.begin(req);
        let _ = ino;
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.read(&ctx, offset as i64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let (ctx, _guard) = self.begin(req);
        let _ = ino;
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.write(&ctx, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&self, req: &Request, _ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.flush(&ctx) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let (ctx, _guard) = self.begin(req);
        if let Some(entry) = self.files.unregister(fh.0) {
            if let Some(file) = &entry.file {
                let _ = file.release(&ctx);
            }
        }
        self.tree.note_handle_closed(ino);
        reply.ok();
    }

    fn fsync(&self, req: &Request, _ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.fsync(&ctx, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let (ctx, _guard) = self.begin(req);
        let Ok(node) = self.node(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let fh = self.files.register(ino, true, None, flags, FopenFlags::empty());
        self.tree.note_handle_opened(ino);
        let _ = (ctx, node);
        reply.opened(FileHandle(fh), FopenFlags::empty());
    }

    fn readdir(&self, req: &Request, ino: INodeNo, fh: FileHandle, offset: u64, mut reply: ReplyDirectory) {
        let (ctx, _guard) = self.begin(req);
        let Ok(node) = self.node(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if offset == 0 {
            match node.readdir(&ctx) {
                Ok(rest) => {
                    let mut entries = self.dot_entries(&ctx, ino);
                    entries.extend(rest);
                    self.dir_snapshots.lock().insert(fh.0, entries);
                }
                Err(e) => {
                    reply.error(e);
                    return;
                }
            }
        }
        let snapshots = self.dir_snapshots.lock();
        let Some(entries) = snapshots.get(&fh.0) else {
            drop(snapshots);
            reply.error(Errno::EBADF);
            return;
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        drop(snapshots);
        reply.ok();
    }

    fn readdirplus(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let (ctx, _guard) = self.begin(req);
        let Ok(node) = self.node(ino) else {
            reply.error(Errno::ENOENT);
            return;
        };
        if offset == 0 {
            match node.readdir(&ctx) {
                Ok(rest) => {
                    let mut entries = self.dot_entries(&ctx, ino);
                    entries.extend(rest);
                    self.dir_snapshots.lock().insert(fh.0, entries);
                }
                Err(e) => {
                    reply.error(e);
                    return;
                }
            }
        }
        let entries = {
            let snapshots = self.dir_snapshots.lock();
            match snapshots.get(&fh.0) {
                Some(e) => e.clone(),
                None => {
                    reply.error(Errno::EBADF);
                    return;
                }
            }
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let attr = match entry.attr {
                Some(a) => a,
                None => {
                    let (child_ino, child_attr) = match self
                        .tree
                        .lookup(ino, &entry.name, |parent_node| {
                            let (child, attr) = parent_node.lookup(&ctx, &entry.name)?;
                            Ok((child, attr.kind == FileType::Directory))
                        }) {
                        Ok((child_ino, _, _)) => match self.node(child_ino).and_then(|n| n.getattr(&ctx)) {
                            Ok(attr) => (child_ino, attr),
                            Err(_) => continue,
                        },
                        Err(_) => continue,
                    };
                    self.tree.note_lookup_reply(child_ino);
                    child_attr
                }
            };
            let mut attr = self.fixup_attr(attr);
            attr.ino = entry.ino;
            if reply.add(
                entry.ino,
                self.tree.generation(entry.ino),
                (i + 1) as i64,
                &entry.name,
                &self.options.entry_timeout,
                &attr,
                &self.options.attr_timeout,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, req: &Request, ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let (_ctx, _guard) = self.begin(req);
        self.files.unregister(fh.0);
        self.dir_snapshots.lock().remove(&fh.0);
        self.tree.note_handle_closed(ino);
        reply.ok();
    }

    fn fsyncdir(&self, req: &Request, ino: INodeNo, fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        let (_ctx, _guard) = self.begin(req);
        let _ = (ino, fh, datasync);
        reply.ok();
    }

    fn statfs(&self, req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        let (ctx, _guard) = self.begin(req);
        let ino = if ino == INodeNo(0) { super::tree::ROOT } else { ino };
        match self.node(ino).and_then(|n| n.statfs(&ctx)) {
            Ok(s) => reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize),
            Err(e) => reply.error(e),
        }
    }

    fn setxattr(
        &self,
        req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.setxattr(&ctx, name, value, flags, position)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn getxattr(&self, req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyXattr) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.getxattr(&ctx, name, size)) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() as u32 > size {
                    reply.error(Errno::ERANGE);
                } else {
                    reply.data(&data);
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn listxattr(&self, req: &Request, ino: INodeNo, size: u32, reply: ReplyXattr) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.listxattr(&ctx, size)) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() as u32 > size {
                    reply.error(Errno::ERANGE);
                } else {
                    reply.data(&data);
                }
            }
            Err(e) => reply.error(e),
        }
    }

    fn removexattr(&self, req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.removexattr(&ctx, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn access(&self, req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let (ctx, _guard) = self.begin(req);
        match self.node(ino).and_then(|n| n.access(&ctx, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &self,
        req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (ctx, _guard) = self.begin(req);
        let name = name.to_os_string();
        let attr_slot: std::cell::Cell<Option<FileAttr>> = std::cell::Cell::new(None);
        let file_slot: Mutex<Option<N::File>> = Mutex::new(None);
        let result = self.tree.lookup(parent, &name, |parent_node| {
            let (child, attr, file) = parent_node.create(&ctx, &name, mode, umask, flags)?;
            attr_slot.set(Some(attr));
            *file_slot.lock() = Some(file);
            Ok((child, false))
        });
        match result {
            Ok((ino, _is_dir, _created)) => {
                let (Some(attr), Some(file)) = (attr_slot.take(), file_slot.lock().take()) else {
                    reply.error(Errno::EEXIST);
                    return;
                };
                self.tree.note_lookup_reply(ino);
                let open_flags = OpenFlags(flags);
                let fh = self
                    .files
                    .register(ino, false, Some(Arc::new(file)), open_flags, FopenFlags::empty());
                self.tree.note_handle_opened(ino);
                let mut attr = self.fixup_attr(attr);
                attr.ino = ino;
                reply.created(
                    &self.options.attr_timeout,
                    &attr,
                    self.tree.generation(ino),
                    FileHandle(fh),
                    FopenFlags::empty(),
                );
            }
            Err(e) => reply.error(e),
        }
    }

    fn getlk(
        &self,
        req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let (ctx, _guard) = self.begin(req);
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.getlk(&ctx, start, end, typ, pid) {
            Ok((start, end, typ, pid)) => reply.locked(start, end, typ, pid),
            Err(e) => reply.error(e),
        }
    }

    fn setlk(
        &self,
        req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _lock_owner: LockOwner,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let (ctx, _guard) = self.begin(req);
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.setlk(&ctx, start, end, typ, pid, sleep) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn bmap(&self, _req: &Request, _ino: INodeNo, _blocksize: u32, _idx: u64, reply: ReplyBmap) {
        reply.error(Errno::ENOSYS);
    }

    fn ioctl(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: IoctlFlags,
        _cmd: u32,
        _in_data: &[u8],
        _out_size: u32,
        reply: ReplyIoctl,
    ) {
        reply.error(Errno::ENOSYS);
    }

    fn fallocate(
        &self,
        req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let (ctx, _guard) = self.begin(req);
        let Some(file) = self.files.get(fh.0) else {
            reply.error(Errno::EBADF);
            return;
        };
        match file.fallocate(&ctx, offset, length, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn lseek(&self, _req: &Request, _ino: INodeNo, _fh: FileHandle, _offset: i64, _whence: i32, reply: ReplyLseek) {
        reply.error(Errno::ENOSYS);
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &self,
        req: &Request,
        _ino_in: INodeNo,
        fh_in: FileHandle,
        offset_in: i64,
        _ino_out: INodeNo,
        fh_out: FileHandle,
        offset_out: i64,
        len: u64,
        _flags: CopyFileRangeFlags,
        reply: ReplyWrite,
    ) {
        let (ctx, _guard) = self.begin(req);
        let (Some(src), Some(dst)) = (self.files.get(fh_in.0), self.files.get(fh_out.0)) else {
            reply.error(Errno::EBADF);
            return;
        };
        let data = match src.read(&ctx, offset_in, len as u32) {
            Ok(d) => d,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match dst.write(&ctx, offset_out, &data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }
}
