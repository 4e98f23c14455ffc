use std::ffi::OsStr;
use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::prelude::OsStrExt;

use smallvec::SmallVec;
use smallvec::smallvec;
use zerocopy::IntoBytes;

use super::INodeNo;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code;

/// A server-initiated message to the kernel, built with the same fixed
/// `fuse_out_header` framing as a normal reply but with `unique` set to 0
/// and `error` repurposed to carry the notify opcode.
#[derive(Debug)]
pub(crate) enum Notification<'a> {
    Poll(abi::fuse_notify_poll_wakeup_out),
    InvalInode(abi::fuse_notify_inval_inode_out),
    InvalEntry {
        header: abi::fuse_notify_inval_entry_out,
        name: &'a OsStr,
    },
    Delete {
        header: abi::fuse_notify_delete_out,
        name: &'a OsStr,
    },
    Store {
        header: abi::fuse_notify_store_out,
        data: &'a [u8],
    },
    Retrieve(abi::fuse_notify_retrieve_out),
}

impl<'a> Notification<'a> {
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        code: fuse_notify_code,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let mut v: SmallVec<[IoSlice<'_>; 3]> = smallvec![IoSlice::new(&[])];
        let body_len = match self {
            Notification::Poll(b) => {
                v.push(IoSlice::new(b.as_bytes()));
                b.as_bytes().len()
            }
            Notification::InvalInode(b) => {
                v.push(IoSlice::new(b.as_bytes()));
                b.as_bytes().len()
            }
            Notification::InvalEntry { header, name } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(nul_terminated(name)));
                header.as_bytes().len() + name.as_bytes().len() + 1
            }
            Notification::Delete { header, name } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(nul_terminated(name)));
                header.as_bytes().len() + name.as_bytes().len() + 1
            }
            Notification::Store { header, data } => {
                v.push(IoSlice::new(header.as_bytes()));
                v.push(IoSlice::new(data));
                header.as_bytes().len() + data.len()
            }
            Notification::Retrieve(b) => {
                v.push(IoSlice::new(b.as_bytes()));
                b.as_bytes().len()
            }
        };
        let header = abi::fuse_out_header {
            unique: 0,
            error: code as i32,
            len: (size_of::<abi::fuse_out_header>() + body_len).try_into()?,
        };
        v[0] = IoSlice::new(header.as_bytes());
        Ok(f(&v))
    }

    pub(crate) fn new_poll(kh: crate::notify::PollHandle) -> Self {
        Notification::Poll(abi::fuse_notify_poll_wakeup_out { kh: kh.0 })
    }

    pub(crate) fn new_inval_inode(ino: INodeNo, offset: i64, len: i64) -> Self {
        Notification::InvalInode(abi::fuse_notify_inval_inode_out {
            ino: ino.into(),
            off: offset,
            len,
        })
    }

    pub(crate) fn new_inval_entry(
        parent: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::InvalEntry {
            header: abi::fuse_notify_inval_entry_out {
                parent: parent.into(),
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        })
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::Delete {
            header: abi::fuse_notify_delete_out {
                parent: parent.into(),
                child: child.into(),
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        })
    }

    pub(crate) fn new_store(
        ino: INodeNo,
        offset: u64,
        data: &'a [u8],
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::Store {
            header: abi::fuse_notify_store_out {
                nodeid: ino.into(),
                offset,
                size: data.len().try_into()?,
                padding: 0,
            },
            data,
        })
    }

    /// Build a `RetrieveCache` request. `notify_unique` is a server-chosen id correlated
    /// against the kernel's subsequent `NOTIFY_REPLY` by [`crate::bridge::notify_pending`].
    pub(crate) fn new_retrieve(notify_unique: u64, ino: INodeNo, offset: u64, size: u32) -> Self {
        Notification::Retrieve(abi::fuse_notify_retrieve_out {
            notify_unique,
            nodeid: ino.into(),
            offset,
            size,
            padding: 0,
        })
    }
}

fn nul_terminated(name: &OsStr) -> &'static [u8] {
    // Safety valve: the kernel requires a NUL-terminated name but `OsStr` isn't
    // guaranteed to carry a trailing NUL, so borrow a thread-local scratch buffer.
    thread_local! {
        static SCRATCH: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
    }
    SCRATCH.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.clear();
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        // Extend the borrow to 'static: sound because `with_iovec` consumes the slice
        // synchronously before this function can be called again on the same thread.
        unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) }
    })
}
