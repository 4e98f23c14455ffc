//! The inode tree: the server's view of what the kernel calls nodeids, independent of any
//! particular `Node` implementation's own notion of identity.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::{Errno, INodeNo};

use super::handle::{HandleMap, HandleMapKind};
use super::node::Node;

/// Per-mount bookkeeping shared by every inode that belongs to it. A submount grafts a fresh
/// `MountState` at a named child of the parent mount's tree.
pub struct MountState {
    /// Cleared when a submount root is freshly grafted, set after its first successful
    /// `GetAttr`. Resolves the staleness question for `lookupMountUpdate`: a grafted root's
    /// attributes are never trusted from the grafting `Lookup` reply, only from a real
    /// `GetAttr` round trip. See `DESIGN.md`.
    attrs_fresh: AtomicBool,
    open_handle_count: AtomicU64,
}

impl MountState {
    fn new() -> Self {
        Self {
            attrs_fresh: AtomicBool::new(true),
            open_handle_count: AtomicU64::new(0),
        }
    }

    fn fresh_submount() -> Self {
        Self {
            attrs_fresh: AtomicBool::new(false),
            open_handle_count: AtomicU64::new(0),
        }
    }

    pub fn attrs_fresh(&self) -> bool {
        self.attrs_fresh.load(Ordering::Acquire)
    }

    pub fn mark_attrs_fresh(&self) {
        self.attrs_fresh.store(true, Ordering::Release);
    }

    fn inc_handles(&self) {
        self.open_handle_count.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_handles(&self) {
        self.open_handle_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn has_open_handles(&self) -> bool {
        self.open_handle_count.load(Ordering::Acquire) > 0
    }
}

struct Inode<N: Node> {
    node: Arc<N>,
    is_dir: bool,
    lookups: u64,
    /// Qualifies this inode's id; bumped by the handle map whenever the id is reused after a
    /// prior occupant was forgotten. `0` for the mount root, which never recycles.
    generation: u64,
    parent: Option<INodeNo>,
    children: HashMap<OsString, INodeNo>,
    mount: Arc<MountState>,
    /// Set when this inode is itself the root of a grafted submount; distinct from `mount`,
    /// which is the mount this inode's *parent* slot belongs to.
    submount_root: Option<Arc<MountState>>,
}

/// Owns every live inode for one top-level mount (and any submounts grafted beneath it).
///
/// Locking: `tree_lock` is read-held for lookups and attribute reads, write-held for any
/// structural mutation (link/unlink/rename/graft). `lookup_lock` is taken write by `forget`
/// and read by `lookup`, so sibling lookups proceed in parallel while serializing against the
/// refcount-draining path — this is what lets `CAP_PARALLEL_DIROPS` hold without breaking the
/// "forget observes lookup's increment" ordering guarantee.
pub struct InodeTree<N: Node> {
    tree_lock: RwLock<HashMap<u64, Inode<N>>>,
    lookup_lock: RwLock<()>,
    /// Assigns nodeids (and their generations) for every inode but the root, per §4.3/§4.4: a
    /// fresh inode is only ever created by calling `handle_map.register`, and its id is
    /// returned to the map's free list (via `handle_map.forget`) exactly when the inode is
    /// actually dropped from `tree_lock`, so a reused id always carries a bumped generation.
    handle_map: Box<dyn HandleMap<N>>,
    /// Dedup key fed to `handle_map.register`; every creation uses a fresh value so the handle
    /// map always takes the "new object" branch (the tree's own child map already handles
    /// find-or-create dedup before a registration is attempted).
    creation_seq: AtomicU64,
    root_mount: Arc<MountState>,
}

/// FUSE reserves nodeid 1 for the mount root.
pub const ROOT: INodeNo = INodeNo(1);

impl<N: Node> InodeTree<N> {
    pub fn new(root: Arc<N>, root_is_dir: bool, handle_kind: HandleMapKind) -> Self {
        let root_mount = Arc::new(MountState::new());
        let mut tree = HashMap::new();
        tree.insert(
            ROOT.0,
            Inode {
                node: root,
                is_dir: root_is_dir,
                lookups: 1,
                generation: 0,
                parent: None,
                children: HashMap::new(),
                mount: root_mount.clone(),
                submount_root: None,
            },
        );
        Self {
            tree_lock: RwLock::new(tree),
            lookup_lock: RwLock::new(()),
            handle_map: handle_kind.build(),
            creation_seq: AtomicU64::new(0),
            root_mount,
        }
    }

    /// The generation qualifying `ino`'s id, for packing into an entry/create reply alongside
    /// the nodeid. `0` for the root or an id no longer present in the tree.
    pub fn generation(&self, ino: INodeNo) -> u64 {
        self.tree_lock.read().get(&ino.0).map(|i| i.generation).unwrap_or(0)
    }

    /// The parent of `ino`, or `None` if `ino` is the root or not currently in the tree.
    pub fn parent_of(&self, ino: INodeNo) -> Option<INodeNo> {
        self.tree_lock.read().get(&ino.0).and_then(|i| i.parent)
    }

    pub fn node(&self, ino: INodeNo) -> Option<Arc<N>> {
        self.tree_lock.read().get(&ino.0).map(|i| i.node.clone())
    }

    pub fn is_dir(&self, ino: INodeNo) -> Option<bool> {
        self.tree_lock.read().get(&ino.0).map(|i| i.is_dir)
    }

    pub fn mount_of(&self, ino: INodeNo) -> Option<Arc<MountState>> {
        self.tree_lock.read().get(&ino.0).map(|i| i.mount.clone())
    }

    fn same_mount(&self, a: INodeNo, b: INodeNo) -> bool {
        let tree = self.tree_lock.read();
        match (tree.get(&a.0), tree.get(&b.0)) {
            (Some(x), Some(y)) => Arc::ptr_eq(&x.mount, &y.mount),
            _ => false,
        }
    }

    /// Implements `internalLookup`: find-or-create the child of `parent` named `name`,
    /// assigning it a fresh inode id on first sight. Returns the child id, whether it is a
    /// directory, and whether this call just created the inode entry (vs. reusing one already
    /// present, in which case the caller should prefer a `GetAttr` refresh over trusting stale
    /// attrs). The lookup-count increment on success is the caller's responsibility, performed
    /// after the handle map has assigned a nodeid/generation (see `dispatcher.rs`).
    pub fn lookup(
        &self,
        parent: INodeNo,
        name: &OsStr,
        child_of: impl FnOnce(&N) -> Result<(Arc<N>, bool), Errno>,
    ) -> Result<(INodeNo, bool, bool), Errno> {
        let _guard = self.lookup_lock.read();

        if let Some(existing) = {
            let tree = self.tree_lock.read();
            tree.get(&parent.0)
                .and_then(|p| p.children.get(name))
                .copied()
        } {
            return Ok((
                existing,
                self.tree_lock.read().get(&existing.0).map(|i| i.is_dir).unwrap_or(false),
                false,
            ));
        }

        let parent_node = self
            .tree_lock
            .read()
            .get(&parent.0)
            .map(|i| i.node.clone())
            .ok_or(Errno::ENOENT)?;
        let (child_node, is_dir) = child_of(&parent_node)?;

        let mut tree = self.tree_lock.write();
        // Re-check under the write lock: a racing lookup may have already created this
        // child while we were calling into user code above.
        if let Some(existing) = tree.get(&parent.0).and_then(|p| p.children.get(name)).copied() {
            return Ok((existing, tree.get(&existing.0).map(|i| i.is_dir).unwrap_or(false), false));
        }
        let parent_mount = tree
            .get(&parent.0)
            .map(|p| p.mount.clone())
            .ok_or(Errno::ENOENT)?;
        let seq = self.creation_seq.fetch_add(1, Ordering::Relaxed);
        let (raw_id, generation) = self.handle_map.register(seq, child_node.clone());
        let id = INodeNo(raw_id);
        tree.insert(
            id.0,
            Inode {
                node: child_node,
                is_dir,
                lookups: 0,
                generation,
                parent: Some(parent),
                children: HashMap::new(),
                mount: parent_mount,
                submount_root: None,
            },
        );
        tree.get_mut(&parent.0)
            .expect("parent present, checked above")
            .children
            .insert(name.to_os_string(), id);
        Ok((id, is_dir, true))
    }

    /// Records a successful lookup reply having been sent for `ino`. Must be called exactly
    /// once per reply, after `lookup` returns `Ok`.
    pub fn note_lookup_reply(&self, ino: INodeNo) {
        if let Some(inode) = self.tree_lock.write().get_mut(&ino.0) {
            inode.lookups += 1;
        }
    }

    /// `forgetUpdate`: decrements the lookup count by `n`; on drop to zero, detaches the inode
    /// from its parent's child map (recursing into now-zero-count, deletable children) provided
    /// no submount is still grafted there.
    pub fn forget(&self, ino: INodeNo, n: u64) {
        let _guard = self.lookup_lock.write();
        let mut tree = self.tree_lock.write();
        self.forget_locked(&mut tree, ino, n);
    }

    fn forget_locked(&self, tree: &mut HashMap<u64, Inode<N>>, ino: INodeNo, n: u64) {
        if ino == ROOT {
            // The root's lookup count is decorative; it is never detached.
            if let Some(root) = tree.get_mut(&ROOT.0) {
                root.lookups = root.lookups.saturating_sub(n);
            }
            return;
        }
        let Some(inode) = tree.get_mut(&ino.0) else {
            return;
        };
        assert!(
            inode.lookups >= n,
            "forget underflow on inode {}: {} lookups, asked to drop {n}",
            ino.0,
            inode.lookups
        );
        inode.lookups -= n;
        if inode.lookups > 0 {
            return;
        }
        if inode.submount_root.is_some() {
            // A live submount keeps the grafted root pinned even at zero lookups.
            return;
        }
        if !inode.children.is_empty() {
            return;
        }
        if !inode.node.deletable() {
            return;
        }
        let parent = inode.parent;
        let node = tree.remove(&ino.0).map(|i| i.node);
        // The inode was registered with the handle map exactly once (at creation, with a
        // lookup count of 1 there regardless of the kernel-visible `lookups` tracked above);
        // releasing it here returns the id to the map's free list so a future reuse bumps its
        // generation, per the id-reuse invariant.
        self.handle_map.forget(ino.0, 1);
        if let Some(node) = node {
            node.on_forget();
        }
        if let Some(parent_ino) = parent {
            if let Some(parent_inode) = tree.get_mut(&parent_ino.0) {
                parent_inode.children.retain(|_, &mut v| v != ino);
            }
        }
    }

    /// Checks the EXDEV/EBUSY conditions [`Self::rename`] would enforce, without mutating
    /// anything. Lets a caller reject a cross-mount or mountpoint-source rename before calling
    /// into user code, so the user's `Node::rename` is never invoked for a rename the tree is
    /// always going to refuse anyway.
    pub fn check_rename(&self, parent: INodeNo, name: &OsStr, newparent: INodeNo) -> Result<(), Errno> {
        if !self.same_mount(parent, newparent) {
            return Err(Errno::EXDEV);
        }
        let tree = self.tree_lock.read();
        let child_id = tree
            .get(&parent.0)
            .and_then(|p| p.children.get(name))
            .copied()
            .ok_or(Errno::ENOENT)?;
        if tree
            .get(&child_id.0)
            .map(|i| i.submount_root.is_some())
            .unwrap_or(false)
        {
            return Err(Errno::EBUSY);
        }
        Ok(())
    }

    /// Rename `name` under `parent` to `newname` under `newparent`. Enforces EXDEV across
    /// mounts and EBUSY when the source is itself a submount root, then performs the child-map
    /// update atomically under the tree write lock — overwriting any existing destination
    /// entry within the same critical section, per the atomic-rename-over-destination
    /// invariant.
    pub fn rename(
        &self,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
    ) -> Result<INodeNo, Errno> {
        if !self.same_mount(parent, newparent) {
            return Err(Errno::EXDEV);
        }
        let mut tree = self.tree_lock.write();
        let child_id = tree
            .get(&parent.0)
            .and_then(|p| p.children.get(name))
            .copied()
            .ok_or(Errno::ENOENT)?;
        if tree
            .get(&child_id.0)
            .map(|i| i.submount_root.is_some())
            .unwrap_or(false)
        {
            return Err(Errno::EBUSY);
        }
        if let Some(dest_id) = tree.get(&newparent.0).and_then(|p| p.children.get(newname)).copied() {
            tree.get_mut(&newparent.0)
                .expect("checked above")
                .children
                .remove(newname);
            if let Some(dest_inode) = tree.get_mut(&dest_id.0) {
                dest_inode.parent = None;
            }
        }
        tree.get_mut(&parent.0)
            .expect("checked above")
            .children
            .remove(name);
        tree.get_mut(&newparent.0)
            .expect("checked above")
            .children
            .insert(newname.to_os_string(), child_id);
        if let Some(child) = tree.get_mut(&child_id.0) {
            child.parent = Some(newparent);
        }
        Ok(child_id)
    }

    /// Grafts a new mount at `parent`/`name`, creating its root inode. Fails with `EEXIST` if
    /// the slot is already occupied.
    pub fn graft_submount(
        &self,
        parent: INodeNo,
        name: &OsStr,
        root_node: Arc<N>,
        root_is_dir: bool,
    ) -> Result<INodeNo, Errno> {
        let mut tree = self.tree_lock.write();
        if tree.get(&parent.0).map(|p| p.children.contains_key(name)).unwrap_or(false) {
            return Err(Errno::EEXIST);
        }
        let mount = Arc::new(MountState::fresh_submount());
        let seq = self.creation_seq.fetch_add(1, Ordering::Relaxed);
        let (raw_id, generation) = self.handle_map.register(seq, root_node.clone());
        let id = INodeNo(raw_id);
        tree.insert(
            id.0,
            Inode {
                node: root_node,
                is_dir: root_is_dir,
                lookups: 1,
                generation,
                parent: Some(parent),
                children: HashMap::new(),
                mount: mount.clone(),
                submount_root: Some(mount),
            },
        );
        tree.get_mut(&parent.0)
            .ok_or(Errno::ENOENT)?
            .children
            .insert(name.to_os_string(), id);
        Ok(id)
    }

    /// Unmounts the submount rooted at `ino`. Refuses with `EBUSY` if any descendant has an
    /// open file handle or is itself a further submount.
    pub fn unmount_submount(&self, ino: INodeNo) -> Result<(), Errno> {
        let mut tree = self.tree_lock.write();
        let mount = tree
            .get(&ino.0)
            .and_then(|i| i.submount_root.clone())
            .ok_or(Errno::EINVAL)?;
        if mount.has_open_handles() {
            return Err(Errno::EBUSY);
        }
        if self.has_descendant_submount(&tree, ino) {
            return Err(Errno::EBUSY);
        }
        let parent = tree.get(&ino.0).and_then(|i| i.parent);
        self.remove_subtree(&mut tree, ino);
        if let Some(parent_ino) = parent {
            if let Some(p) = tree.get_mut(&parent_ino.0) {
                p.children.retain(|_, &mut v| v != ino);
            }
        }
        Ok(())
    }

    fn has_descendant_submount(&self, tree: &HashMap<u64, Inode<N>>, ino: INodeNo) -> bool {
        let Some(inode) = tree.get(&ino.0) else {
            return false;
        };
        for &child in inode.children.values() {
            let Some(child_inode) = tree.get(&child.0) else {
                continue;
            };
            if child_inode.submount_root.is_some() || self.has_descendant_submount(tree, child) {
                return true;
            }
        }
        false
    }

    fn remove_subtree(&self, tree: &mut HashMap<u64, Inode<N>>, ino: INodeNo) {
        let children: Vec<INodeNo> = tree
            .get(&ino.0)
            .map(|i| i.children.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.remove_subtree(tree, child);
        }
        if let Some(inode) = tree.remove(&ino.0) {
            self.handle_map.forget(ino.0, 1);
            inode.node.on_forget();
        }
    }

    /// Detaches `name` from `parent`'s child map after a successful `Unlink`/`Rmdir`, so a
    /// later `Lookup` of the same name does not resolve to the removed entry's stale nodeid
    /// while the kernel still holds a lookup reference on it. The inode itself is only dropped
    /// once its lookup count reaches zero, via [`InodeTree::forget`].
    pub fn unlink_name(&self, parent: INodeNo, name: &OsStr) -> Option<INodeNo> {
        let mut tree = self.tree_lock.write();
        let child = tree.get_mut(&parent.0)?.children.remove(name)?;
        if let Some(child_inode) = tree.get_mut(&child.0) {
            child_inode.parent = None;
        }
        Some(child)
    }

    pub fn note_handle_opened(&self, ino: INodeNo) {
        if let Some(mount) = self.mount_of(ino) {
            mount.inc_handles();
        }
    }

    pub fn note_handle_closed(&self, ino: INodeNo) {
        if let Some(mount) = self.mount_of(ino) {
            mount.dec_handles();
        }
    }

    pub fn root_mount(&self) -> Arc<MountState> {
        self.root_mount.clone()
    }

    pub fn count(&self) -> usize {
        self.tree_lock.read().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::node::{Context, File as FileTrait};
    use crate::FileAttr;

    struct TestFile;
    impl FileTrait for TestFile {}

    struct TestNode {
        is_dir: bool,
    }
    impl Node for TestNode {
        type File = TestFile;
        fn lookup(&self, _ctx: &Context, _name: &OsStr) -> Result<(Arc<Self>, FileAttr), Errno> {
            unreachable!("test drives InodeTree::lookup directly")
        }
        fn getattr(&self, _ctx: &Context) -> Result<FileAttr, Errno> {
            unreachable!()
        }
    }

    fn make_child(is_dir: bool) -> impl FnOnce(&TestNode) -> Result<(Arc<TestNode>, bool), Errno> {
        move |_parent| Ok((Arc::new(TestNode { is_dir }), is_dir))
    }

    #[test]
    fn lookup_creates_once_and_reuses() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (a, is_dir, created) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        assert!(created);
        assert!(!is_dir);
        let (a2, _, created2) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        assert_eq!(a, a2);
        assert!(!created2);
    }

    #[test]
    fn forget_detaches_at_zero_count() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (child, _, _) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        tree.note_lookup_reply(child);
        assert_eq!(tree.count(), 2);
        tree.forget(child, 1);
        assert_eq!(tree.count(), 1);
    }

    #[test]
    fn reused_ino_carries_a_strictly_greater_generation() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (first, _, _) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        let first_generation = tree.generation(first);
        // Never bumped past 0, so this forget drops the inode immediately, releasing its id
        // back to the handle map's free list.
        tree.forget(first, 0);
        let (second, _, _) = tree.lookup(ROOT, OsStr::new("b"), make_child(false)).unwrap();
        // With a freshly freed slot available, the recycling map hands the id straight back
        // out, so the reused ino's generation must be strictly greater than before.
        if second == first {
            assert!(tree.generation(second) > first_generation);
        }
    }

    #[test]
    fn root_ino_and_generation_are_fixed() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        assert_eq!(ROOT, INodeNo(1));
        assert_eq!(tree.generation(ROOT), 0);
    }

    #[test]
    fn rename_moves_child_across_directories() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (dir_a, _, _) = tree.lookup(ROOT, OsStr::new("dira"), make_child(true)).unwrap();
        let (dir_b, _, _) = tree.lookup(ROOT, OsStr::new("dirb"), make_child(true)).unwrap();
        let (file, _, _) = tree.lookup(dir_a, OsStr::new("f"), make_child(false)).unwrap();

        let moved = tree.rename(dir_a, OsStr::new("f"), dir_b, OsStr::new("g")).unwrap();
        assert_eq!(moved, file);
        assert!(tree.lookup(dir_a, OsStr::new("f"), make_child(false)).unwrap().2);
        let (found, _, created) = tree.lookup(dir_b, OsStr::new("g"), make_child(false)).unwrap();
        assert_eq!(found, file);
        assert!(!created);
    }

    #[test]
    #[should_panic(expected = "forget underflow")]
    fn forget_underflow_panics() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (child, _, _) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        tree.forget(child, 1);
    }

    #[test]
    fn unlink_name_detaches_but_keeps_inode_until_forgotten() {
        let tree = InodeTree::new(Arc::new(TestNode { is_dir: true }), true, HandleMapKind::default());
        let (child, _, _) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        tree.note_lookup_reply(child);
        let removed = tree.unlink_name(ROOT, OsStr::new("a"));
        assert_eq!(removed, Some(child));
        // A fresh lookup of the same name now creates a brand new child.
        let (again, _, created) = tree.lookup(ROOT, OsStr::new("a"), make_child(false)).unwrap();
        assert!(created);
        assert_ne!(again, child);
        // The unlinked inode is still present until its lookup count drains.
        assert_eq!(tree.count(), 3);
        tree.forget(child, 1);
        assert_eq!(tree.count(), 2);
    }
}
