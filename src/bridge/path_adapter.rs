//! Presents the inode tree as a path-addressable filesystem, for callers (loopback-style
//! `Node` implementations) that find it more natural to operate on paths than on raw inode
//! handles. This is an optional overlay; the core bridge/dispatcher never requires it.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Errno, INodeNo};

/// Visiting more ancestors than this while reconstructing a path means the parent chain
/// cycles; `get_path` gives up and returns [`CYCLE_SENTINEL`] rather than looping forever.
const PATH_MAX: usize = 4096;

/// A path that is guaranteed not to resolve to anything real, returned by `get_path` when it
/// detects a cycle or an unreachable root so that the caller surfaces an error instead of
/// silently operating on the wrong file.
pub const CYCLE_SENTINEL: &str = "\0path-adapter-cycle\0";

struct PathNodeState {
    /// `(parent, name)` pairs, one per hardlink. The first entry is the node's primary parent,
    /// the one `get_path` walks from; `Unlink` promotes another entry to primary when the
    /// primary link goes away.
    links: Vec<(INodeNo, OsString)>,
}

/// Overlay entity tracked per adapter-visible inode: every hardlinked name that currently
/// refers to it, plus the backing filesystem's own inode number (if it exposes one), used to
/// de-duplicate hardlinks discovered via independent `Lookup` calls.
pub struct PathNode {
    ino: INodeNo,
    client_ino: Option<u64>,
    state: RwLock<PathNodeState>,
}

impl PathNode {
    fn new(ino: INodeNo, parent: INodeNo, name: OsString, client_ino: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            ino,
            client_ino,
            state: RwLock::new(PathNodeState {
                links: vec![(parent, name)],
            }),
        })
    }

    pub fn ino(&self) -> INodeNo {
        self.ino
    }
}

/// Shared `client-ino -> adapter-node` map used to fold distinct lookup paths that land on the
/// same backing object into a single [`PathNode`] with multiple links, i.e. hardlink
/// de-duplication.
#[derive(Default)]
pub struct ClientInodeMap {
    by_client_ino: RwLock<HashMap<u64, Arc<PathNode>>>,
}

impl ClientInodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, client_ino: u64) -> Option<Arc<PathNode>> {
        self.by_client_ino.read().get(&client_ino).cloned()
    }

    fn insert(&self, client_ino: u64, node: Arc<PathNode>) {
        self.by_client_ino.write().insert(client_ino, node);
    }

    fn remove(&self, client_ino: u64) {
        self.by_client_ino.write().remove(&client_ino);
    }

    /// Drops every entry unconditionally. The next operation that needs hardlink
    /// de-duplication reconstructs its entry on the following `Lookup`.
    pub fn forget_client_inodes(&self) {
        self.by_client_ino.write().clear();
    }
}

/// Maps adapter inodes to their [`PathNode`] and reconstructs filesystem paths on demand.
/// `client_inodes` is `None` when the backing `Node` doesn't expose stable inode numbers, in
/// which case hardlink de-duplication is simply not attempted.
pub struct PathAdapter {
    nodes: RwLock<HashMap<u64, Arc<PathNode>>>,
    client_inodes: Option<ClientInodeMap>,
}

impl PathAdapter {
    pub fn new(client_inode_tracking: bool) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            client_inodes: client_inode_tracking.then(ClientInodeMap::new),
        }
    }

    /// Registers `ino` as reachable at `parent`/`name`. If `client_ino` is known and already
    /// mapped to an existing node, that node gets a new link instead of a fresh `PathNode`
    /// being created — the hardlink case.
    pub fn register(
        &self,
        ino: INodeNo,
        parent: INodeNo,
        name: &OsStr,
        client_ino: Option<u64>,
    ) -> Arc<PathNode> {
        if let (Some(map), Some(cino)) = (&self.client_inodes, client_ino) {
            if let Some(existing) = map.lookup(cino) {
                existing
                    .state
                    .write()
                    .links
                    .push((parent, name.to_os_string()));
                self.nodes.write().insert(ino.0, existing.clone());
                return existing;
            }
        }
        let node = PathNode::new(ino, parent, name.to_os_string(), client_ino);
        if let (Some(map), Some(cino)) = (&self.client_inodes, client_ino) {
            map.insert(cino, node.clone());
        }
        self.nodes.write().insert(ino.0, node.clone());
        node
    }

    pub fn node(&self, ino: INodeNo) -> Option<Arc<PathNode>> {
        self.nodes.read().get(&ino.0).cloned()
    }

    /// Reconstructs a path to `ino` by walking primary-parent pointers to the root (`ino` 1,
    /// whose own node is absent from `nodes` since it has no parent link).
    pub fn get_path(&self, ino: INodeNo) -> PathBuf {
        let mut components: Vec<OsString> = Vec::new();
        let mut current = ino;
        for _ in 0..PATH_MAX {
            if current == crate::bridge::tree::ROOT {
                let mut path = PathBuf::from("/");
                for comp in components.into_iter().rev() {
                    path.push(comp);
                }
                return path;
            }
            let Some(node) = self.node(current) else {
                return PathBuf::from(CYCLE_SENTINEL);
            };
            let (parent, name) = {
                let state = node.state.read();
                match state.links.first() {
                    Some(pair) => pair.clone(),
                    None => return PathBuf::from(CYCLE_SENTINEL),
                }
            };
            components.push(name);
            current = parent;
        }
        PathBuf::from(CYCLE_SENTINEL)
    }

    /// Relocates `ino`'s primary `(parent, name)` entry to `newparent`/`newname`. For a
    /// directory being moved across parents, `descendants` must list every descendant inode
    /// whose *primary* parent pointer transitively passes through `ino`'s old location so that
    /// `get_path` on any of them yields the new path; the caller (the dispatcher, which already
    /// holds the inode tree's structural lock for the whole rename) is responsible for
    /// computing that list.
    pub fn rename(
        &self,
        ino: INodeNo,
        newparent: INodeNo,
        newname: &OsStr,
        subtree_reparent: &[(INodeNo, INodeNo)],
    ) -> Result<(), Errno> {
        let node = self.node(ino).ok_or(Errno::ENOENT)?;
        {
            let mut state = node.state.write();
            if let Some(primary) = state.links.first_mut() {
                *primary = (newparent, newname.to_os_string());
            }
        }
        for &(descendant, new_primary_parent) in subtree_reparent {
            if let Some(desc_node) = self.node(descendant) {
                let mut state = desc_node.state.write();
                if let Some(primary) = state.links.first_mut() {
                    primary.0 = new_primary_parent;
                }
            }
        }
        Ok(())
    }

    /// Removes the `(parent, name)` link from `ino`'s node. If another link remains, promotes
    /// it to primary (mandatory per the hardlink-tracking invariant); if none remain, drops the
    /// node (and its client-inode map entry, if any) entirely.
    pub fn unlink(&self, ino: INodeNo, parent: INodeNo, name: &OsStr) {
        let Some(node) = self.node(ino) else {
            return;
        };
        let emptied = {
            let mut state = node.state.write();
            state.links.retain(|(p, n)| !(*p == parent && n == name));
            state.links.is_empty()
        };
        if emptied {
            self.nodes.write().remove(&ino.0);
            if let (Some(map), Some(cino)) = (&self.client_inodes, node.client_ino) {
                map.remove(cino);
            }
        }
    }

    pub fn forget_client_inodes(&self) {
        if let Some(map) = &self.client_inodes {
            map.forget_client_inodes();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bridge::tree::ROOT;

    #[test]
    fn get_path_walks_to_root() {
        let adapter = PathAdapter::new(false);
        adapter.register(INodeNo(2), ROOT, OsStr::new("a"), None);
        adapter.register(INodeNo(3), INodeNo(2), OsStr::new("b"), None);
        assert_eq!(adapter.get_path(INodeNo(3)), PathBuf::from("/a/b"));
    }

    #[test]
    fn cycle_yields_sentinel() {
        let adapter = PathAdapter::new(false);
        // Neither 2 nor 3 is ever linked to the root, so the walk exhausts PATH_MAX.
        adapter.register(INodeNo(2), INodeNo(3), OsStr::new("a"), None);
        adapter.register(INodeNo(3), INodeNo(2), OsStr::new("b"), None);
        assert_eq!(adapter.get_path(INodeNo(2)), PathBuf::from(CYCLE_SENTINEL));
    }

    #[test]
    fn hardlink_dedup_shares_one_node() {
        let adapter = PathAdapter::new(true);
        let n1 = adapter.register(INodeNo(2), ROOT, OsStr::new("a"), Some(100));
        let n2 = adapter.register(INodeNo(2), ROOT, OsStr::new("b"), Some(100));
        assert!(Arc::ptr_eq(&n1, &n2));
        assert_eq!(n1.state.read().links.len(), 2);
    }

    #[test]
    fn unlink_promotes_remaining_link() {
        let adapter = PathAdapter::new(false);
        adapter.register(INodeNo(2), ROOT, OsStr::new("a"), None);
        {
            let node = adapter.node(INodeNo(2)).unwrap();
            node.state.write().links.push((ROOT, OsString::from("b")));
        }
        adapter.unlink(INodeNo(2), ROOT, OsStr::new("a"));
        assert_eq!(adapter.get_path(INodeNo(2)), PathBuf::from("/b"));
        adapter.unlink(INodeNo(2), ROOT, OsStr::new("b"));
        assert!(adapter.node(INodeNo(2)).is_none());
    }
}
