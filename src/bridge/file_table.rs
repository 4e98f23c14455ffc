//! Per-mount table of open files and directories, keyed by the 64-bit Fh the kernel echoes
//! back on every `Read`/`Write`/`Release` for a handle returned from `Open`/`Create`/`OpenDir`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{FopenFlags, INodeNo, OpenFlags};

use super::handle::{HandleMap, HandleMapKind};
use super::node::File;

/// One entry per live `Fh`.
pub struct OpenFile<F> {
    pub ino: INodeNo,
    pub is_dir: bool,
    pub file: Option<Arc<F>>,
    pub flags: OpenFlags,
    pub fuse_flags: FopenFlags,
}

/// Issues and retires file handles through a [`HandleMap`] — the same allocation contract the
/// inode tree uses for nodeids, applied here to `Fh` values (§4.3: "a file handle table is a
/// handle map of `OpenFile`"). Fh 0 is reserved by the protocol and Fh 1 is reserved by the
/// handle map for the mount root's nodeid; neither is ever handed out here.
pub struct FileHandleTable<F: File> {
    handle_map: Box<dyn HandleMap<OpenFile<F>>>,
    creation_seq: AtomicU64,
    /// Small per-inode index of live handles, so a caller that only has an inode (no Fh, e.g.
    /// a `SetAttr` without `O_*` context) can still find an open file to operate through.
    by_inode: Mutex<HashMap<u64, Vec<u64>>>,
}

impl<F: File> Default for FileHandleTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: File> FileHandleTable<F> {
    pub fn new() -> Self {
        Self::with_handle_map(HandleMapKind::default())
    }

    pub fn with_handle_map(handle_kind: HandleMapKind) -> Self {
        Self {
            handle_map: handle_kind.build(),
            creation_seq: AtomicU64::new(0),
            by_inode: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        ino: INodeNo,
        is_dir: bool,
        file: Option<Arc<F>>,
        flags: OpenFlags,
        fuse_flags: FopenFlags,
    ) -> u64 {
        let seq = self.creation_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(OpenFile {
            ino,
            is_dir,
            file,
            flags,
            fuse_flags,
        });
        let (fh, _generation) = self.handle_map.register(seq, entry);
        self.by_inode.lock().entry(ino.0).or_default().push(fh);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<F>> {
        self.handle_map.decode(fh).and_then(|o| o.file.clone())
    }

    pub fn flags(&self, fh: u64) -> Option<(OpenFlags, FopenFlags)> {
        self.handle_map.decode(fh).map(|o| (o.flags, o.fuse_flags))
    }

    pub fn ino_of(&self, fh: u64) -> Option<INodeNo> {
        self.handle_map.decode(fh).map(|o| o.ino)
    }

    /// Any live handle on `ino`, for the fchmod/fchown/ftruncate fallback path described in
    /// §4.5 — used when the kernel's `SetAttr` did not carry an `Fh`.
    pub fn any_handle_for_inode(&self, ino: INodeNo) -> Option<Arc<F>> {
        let by_inode = self.by_inode.lock();
        let fhs = by_inode.get(&ino.0)?;
        fhs.iter().find_map(|fh| self.handle_map.decode(*fh).and_then(|o| o.file.clone()))
    }

    /// Removes `fh`. The returned file's `Release` (if any) must be invoked by the caller
    /// outside this table's lock.
    pub fn unregister(&self, fh: u64) -> Option<Arc<OpenFile<F>>> {
        let entry = self.handle_map.forget(fh, 1)?;
        if let Some(fhs) = self.by_inode.lock().get_mut(&entry.ino.0) {
            fhs.retain(|&h| h != fh);
        }
        Some(entry)
    }

    pub fn open_count(&self) -> usize {
        self.handle_map.count()
    }

    pub fn has_open_handles(&self, ino: INodeNo) -> bool {
        self.by_inode
            .lock()
            .get(&ino.0)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopFile;
    impl File for NoopFile {}

    #[test]
    fn register_and_unregister_round_trip() {
        let table: FileHandleTable<NoopFile> = FileHandleTable::new();
        let fh = table.register(
            INodeNo(5),
            false,
            Some(Arc::new(NoopFile)),
            OpenFlags(0),
            FopenFlags::empty(),
        );
        assert!(fh > 1, "handles 0 and 1 must stay reserved, got {fh}");
        assert!(table.get(fh).is_some());
        assert!(table.has_open_handles(INodeNo(5)));
        let removed = table.unregister(fh).unwrap();
        assert_eq!(removed.ino, INodeNo(5));
        assert!(table.get(fh).is_none());
        assert!(!table.has_open_handles(INodeNo(5)));
    }

    #[test]
    fn any_handle_for_inode_finds_a_live_handle() {
        let table: FileHandleTable<NoopFile> = FileHandleTable::new();
        let fh = table.register(
            INodeNo(9),
            false,
            Some(Arc::new(NoopFile)),
            OpenFlags(0),
            FopenFlags::empty(),
        );
        assert!(table.any_handle_for_inode(INodeNo(9)).is_some());
        table.unregister(fh);
        assert!(table.any_handle_for_inode(INodeNo(9)).is_none());
    }
}
