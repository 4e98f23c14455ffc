//! Cross-module behavior for the inode/handle bridge, driven by in-process fake `Node`/`File`
//! implementations rather than a real kernel mount (which needs root/`/dev/fuse`; see
//! `tests/integration_tests.rs` for that path).

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use nodefuse::bridge::node::Context;
use nodefuse::bridge::path_adapter::PathAdapter;
use nodefuse::bridge::tree::{InodeTree, ROOT};
use nodefuse::bridge::{cancel::CancelTable, file_table::FileHandleTable, File, HandleMapKind, Node};
use nodefuse::{Errno, FileAttr, FileType, FopenFlags, INodeNo, OpenFlags, RequestId};

fn ctx() -> Context {
    let cancel = CancelTable::new().begin(RequestId(1));
    Context {
        uid: 0,
        gid: 0,
        pid: 0,
        cancel,
    }
}

fn attr(ino: u64, kind: FileType) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm: 0o644,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

struct MemFile;
impl File for MemFile {
    fn read(&self, _ctx: &Context, _offset: i64, _size: u32) -> Result<Vec<u8>, Errno> {
        Ok(b"hello world".to_vec())
    }
}

/// A directory node that creates a fresh child `MemNode` under any name the first time it is
/// looked up and reuses the same object thereafter, mirroring what a real in-memory filesystem
/// would do inside its own `Lookup`.
struct MemNode {
    is_dir: bool,
    next_child_ino: AtomicU64,
}

impl MemNode {
    fn dir() -> Self {
        Self {
            is_dir: true,
            next_child_ino: AtomicU64::new(100),
        }
    }
}

impl Node for MemNode {
    type File = MemFile;

    fn lookup(&self, _ctx: &Context, name: &OsStr) -> Result<(Arc<Self>, FileAttr), Errno> {
        if name == "missing" {
            return Err(Errno::ENOENT);
        }
        let is_dir = name == "subdir";
        let ino = self.next_child_ino.fetch_add(1, Ordering::Relaxed);
        Ok((
            Arc::new(Self {
                is_dir,
                next_child_ino: AtomicU64::new(ino * 1000),
            }),
            attr(ino, if is_dir { FileType::Directory } else { FileType::RegularFile }),
        ))
    }

    fn getattr(&self, _ctx: &Context) -> Result<FileAttr, Errno> {
        Ok(attr(1, if self.is_dir { FileType::Directory } else { FileType::RegularFile }))
    }

    fn open(&self, _ctx: &Context, _flags: OpenFlags) -> Result<Self::File, Errno> {
        Ok(MemFile)
    }
}

#[test]
fn lookup_forget_balance_drops_inode_at_zero() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let c = ctx();
    let root = tree.node(ROOT).unwrap();

    let (ino, _is_dir, created) = tree
        .lookup(ROOT, OsStr::new("a"), |parent| {
            let (child, a) = parent.lookup(&c, OsStr::new("a"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    assert!(created);
    tree.note_lookup_reply(ino);
    tree.note_lookup_reply(ino);
    assert_eq!(tree.count(), 2, "root plus the new child");

    // One forget leaves a reference outstanding; the inode must survive.
    tree.forget(ino, 1);
    assert_eq!(tree.count(), 2);

    // The second forget drains it to zero; since the node has no children and reports
    // deletable (the default), the inode must be dropped from the tree.
    tree.forget(ino, 1);
    assert_eq!(tree.count(), 1);
    let _ = root;
}

#[test]
fn negative_lookup_does_not_create_an_inode() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let c = ctx();
    let result = tree.lookup(ROOT, OsStr::new("missing"), |parent| {
        let (child, a) = parent.lookup(&c, OsStr::new("missing"))?;
        Ok((child, a.kind == FileType::Directory))
    });
    assert_eq!(result.unwrap_err(), Errno::ENOENT);
    assert_eq!(tree.count(), 1, "only the root exists");
}

#[test]
fn rename_preserves_open_file_handle_and_moves_child_map_entry() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let files: FileHandleTable<MemFile> = FileHandleTable::new();
    let c = ctx();

    let (dir_a, ..) = tree
        .lookup(ROOT, OsStr::new("subdir"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    let (dir_b, ..) = tree
        .lookup(ROOT, OsStr::new("subdir2"), |p| {
            // distinct name, still a directory
            let (child, _attr) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, true))
        })
        .unwrap();
    let (file_ino, ..) = tree
        .lookup(dir_a, OsStr::new("f"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("f"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    tree.note_lookup_reply(file_ino);

    let node = tree.node(file_ino).unwrap();
    let opened = node.open(&c, OpenFlags(0)).unwrap();
    let fh = files.register(file_ino, false, Some(Arc::new(opened)), OpenFlags(0), FopenFlags::empty());

    let moved = tree.rename(dir_a, OsStr::new("f"), dir_b, OsStr::new("g")).unwrap();
    assert_eq!(moved, file_ino);

    // Old name is gone, new name resolves to the same inode, and the handle opened before the
    // rename is still live and still serves reads — renaming never touches open handles.
    let lookup_old = tree.lookup(dir_a, OsStr::new("f"), |p| {
        let (child, a) = p.lookup(&c, OsStr::new("f"))?;
        Ok((child, a.kind == FileType::Directory))
    });
    assert!(lookup_old.unwrap().2, "a fresh lookup under the old name creates a new child");

    let lookup_new = tree
        .lookup(dir_b, OsStr::new("g"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("g"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    assert_eq!(lookup_new.0, file_ino);
    assert!(!lookup_new.2);

    let handle = files.get(fh).unwrap();
    assert_eq!(handle.read(&c, 0, 11).unwrap(), b"hello world");
}

#[test]
fn cross_mount_rename_is_exdev() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let c = ctx();
    let (dir_a, ..) = tree
        .lookup(ROOT, OsStr::new("subdir"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    let (file_ino, ..) = tree
        .lookup(dir_a, OsStr::new("f"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("f"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    let _ = file_ino;

    let submount_root = tree.graft_submount(ROOT, OsStr::new("mnt"), Arc::new(MemNode::dir()), true).unwrap();

    let err = tree.rename(dir_a, OsStr::new("f"), submount_root, OsStr::new("f2"));
    assert_eq!(err.unwrap_err(), Errno::EXDEV);
}

#[test]
fn renaming_a_submount_root_is_ebusy() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let submount_root = tree.graft_submount(ROOT, OsStr::new("mnt"), Arc::new(MemNode::dir()), true).unwrap();
    let (other_dir, ..) = {
        let c = ctx();
        tree.lookup(ROOT, OsStr::new("subdir"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap()
    };
    let _ = submount_root;
    let err = tree.rename(ROOT, OsStr::new("mnt"), other_dir, OsStr::new("mnt2"));
    assert_eq!(err.unwrap_err(), Errno::EBUSY);
}

#[test]
fn unmount_refuses_while_handles_are_open() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let submount_root = tree.graft_submount(ROOT, OsStr::new("mnt"), Arc::new(MemNode::dir()), true).unwrap();
    tree.note_handle_opened(submount_root);
    assert_eq!(tree.unmount_submount(submount_root).unwrap_err(), Errno::EBUSY);
    tree.note_handle_closed(submount_root);
    assert!(tree.unmount_submount(submount_root).is_ok());
}

#[test]
fn readdir_snapshot_is_stable_across_later_mutation() {
    // A directory listing captured at one point does not see entries added to the backing
    // `Node` afterwards, matching the "snapshot at OpenDir time" invariant the dispatcher's
    // `dir_snapshots` table implements on top of this.
    struct Listing(std::sync::Mutex<Vec<OsString>>);
    impl Node for Listing {
        type File = MemFile;
        fn getattr(&self, _ctx: &Context) -> Result<FileAttr, Errno> {
            Ok(attr(1, FileType::Directory))
        }
        fn readdir(&self, _ctx: &Context) -> Result<Vec<nodefuse::bridge::DirEntry>, Errno> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(i, name)| nodefuse::bridge::DirEntry {
                    name: name.clone(),
                    ino: INodeNo(i as u64 + 2),
                    kind: FileType::RegularFile,
                    attr: None,
                })
                .collect())
        }
    }

    let node = Arc::new(Listing(std::sync::Mutex::new(vec![OsString::from("a")])));
    let c = ctx();
    let snapshot = node.readdir(&c).unwrap();
    node.0.lock().unwrap().push(OsString::from("b"));
    // The already-taken snapshot is unaffected by the later mutation.
    assert_eq!(snapshot.len(), 1);
    let fresh = node.readdir(&c).unwrap();
    assert_eq!(fresh.len(), 2);
}

#[test]
fn cancellation_fires_before_a_later_interrupt_lookup() {
    let table = CancelTable::new();
    let cancel = table.begin(RequestId(42));
    assert!(!cancel.is_cancelled());
    table.interrupt(RequestId(42));
    assert!(cancel.is_cancelled(), "INTERRUPT must be observable by the in-flight handler");
    table.end(RequestId(42));
}

#[test]
fn file_handle_table_fallback_finds_a_handle_without_an_fh() {
    let files: FileHandleTable<MemFile> = FileHandleTable::new();
    let ino = INodeNo(7);
    assert!(files.any_handle_for_inode(ino).is_none());
    let fh = files.register(ino, false, Some(Arc::new(MemFile)), OpenFlags(0), FopenFlags::empty());
    assert!(files.any_handle_for_inode(ino).is_some());
    files.unregister(fh);
    assert!(files.any_handle_for_inode(ino).is_none());
}

/// Demonstrates the path adapter driven alongside the inode tree, the way a loopback-style
/// `Node` backed by a real on-disk path would keep the two in sync: register a link on every
/// `lookup`, relocate it on `rename`, drop it on `unlink`.
#[test]
fn path_adapter_tracks_renames_alongside_the_tree() {
    let tree = InodeTree::new(Arc::new(MemNode::dir()), true, HandleMapKind::default());
    let adapter = PathAdapter::new(false);
    let c = ctx();

    let (dir_a, ..) = tree
        .lookup(ROOT, OsStr::new("subdir"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    adapter.register(dir_a, ROOT, OsStr::new("subdir"), None);

    let (dir_b, ..) = tree
        .lookup(ROOT, OsStr::new("subdir2"), |p| {
            let (child, _attr) = p.lookup(&c, OsStr::new("subdir"))?;
            Ok((child, true))
        })
        .unwrap();
    adapter.register(dir_b, ROOT, OsStr::new("subdir2"), None);

    let (file_ino, ..) = tree
        .lookup(dir_a, OsStr::new("f"), |p| {
            let (child, a) = p.lookup(&c, OsStr::new("f"))?;
            Ok((child, a.kind == FileType::Directory))
        })
        .unwrap();
    adapter.register(file_ino, dir_a, OsStr::new("f"), None);
    assert_eq!(adapter.get_path(file_ino), PathBuf::from("/subdir/f"));

    tree.rename(dir_a, OsStr::new("f"), dir_b, OsStr::new("g")).unwrap();
    adapter.unlink(file_ino, dir_a, OsStr::new("f"));
    adapter.register(file_ino, dir_b, OsStr::new("g"), None);
    assert_eq!(adapter.get_path(file_ino), PathBuf::from("/subdir2/g"));
}
