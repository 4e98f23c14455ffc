//! Low-level FUSE wire protocol: kernel ABI structs, the request parser, and reply encoders.
//!
//! Everything in this module speaks the kernel's byte layout directly. The rest of the crate
//! builds its ergonomic, typed API on top of the types defined here.

pub(crate) mod argument;
pub(crate) mod errno;
pub(crate) mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod ioslice_concat;
pub(crate) mod notify;
pub(crate) mod reply;
pub(crate) mod request;

pub use request::FileHandle;
pub use request::INodeNo;
pub use request::LockOwner;
pub use request::Version;

pub(crate) use reply::Response;
pub(crate) use request::Operation;
pub(crate) use request::Request;
pub(crate) use request::RequestError;

use std::fmt;
use std::num::NonZeroI32;
use std::time::SystemTime;

/// A POSIX error number.
///
/// Carried around the crate instead of the raw `libc::c_int` so that replies and filesystem
/// errors can't accidentally be built from a non-error (0) or out-of-range value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Errno(pub(crate) NonZeroI32);

impl Errno {
    /// Builds an `Errno` from a raw, possibly invalid `errno` value. `0` and values that overflow
    /// `libc::c_int` are mapped to `EIO`, matching what the kernel does with malformed replies.
    pub(crate) fn from_i32(raw: i32) -> Self {
        match NonZeroI32::new(raw.abs()) {
            Some(nz) => Self(nz),
            None => Self::EIO,
        }
    }

    /// Returns the raw, positive `errno` value.
    pub(crate) fn into_i32(self) -> i32 {
        self.0.get()
    }
}

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                // all named errno values are nonzero
                pub const $name: Errno = Errno(unsafe { NonZeroI32::new_unchecked(libc::$name) });
            )*
        }
    };
}

errno_consts!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN, ENOMEM, EACCES,
    EFAULT, ENOTBLK, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE, EMFILE, ENOTTY,
    ETXTBSY, EFBIG, ENOSPC, ESPIPE, EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK, ENAMETOOLONG,
    ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, EIDRM, ENOSTR, ENODATA, ETIME, ENOSR, ENOLINK,
    EPROTO, EMULTIHOP, EBADMSG, EOVERFLOW, EILSEQ, EUSERS, ENOTSOCK, EDESTADDRREQ, EMSGSIZE,
    EPROTOTYPE, ENOPROTOOPT, EPROTONOSUPPORT, ESOCKTNOSUPPORT, EOPNOTSUPP, EPFNOSUPPORT,
    EAFNOSUPPORT, EADDRINUSE, EADDRNOTAVAIL, ENETDOWN, ENETUNREACH, ENETRESET, ECONNABORTED,
    ECONNRESET, ENOBUFS, EISCONN, ENOTCONN, ESHUTDOWN, ETOOMANYREFS, ETIMEDOUT, ECONNREFUSED,
    EHOSTDOWN, EHOSTUNREACH, EALREADY, EINPROGRESS, ESTALE, EDQUOT, ECANCELED,
);

impl From<i32> for Errno {
    fn from(raw: i32) -> Self {
        Errno::from_i32(raw)
    }
}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Errno::from_i32(raw),
            None => Errno::EIO,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match errno::get_errno_message(*self) {
            Some(msg) => write!(f, "{} ({})", msg.to_string_lossy(), self.0.get()),
            None => write!(f, "errno {}", self.0.get()),
        }
    }
}

/// An inode generation number, used alongside the inode number to detect stale NFS-style file
/// handles across inode number reuse.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unique identifier the kernel assigns to an in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl From<u64> for RequestId {
    fn from(raw: u64) -> Self {
        RequestId(raw)
    }
}

/// A timestamp passed to `setattr`, which the kernel may request be set to "now" rather than a
/// specific value observed on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// A specific point in time.
    SpecificTime(SystemTime),
    /// The current time, to be read by the filesystem at the moment the request is handled.
    Now,
}

/// A POSIX byte-range lock, as reported by `getlk`/`setlk`/`setlkw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    /// Inclusive `(start, end)` byte range the lock covers.
    pub range: (u64, u64),
    /// `F_RDLCK`, `F_WRLCK`, or `F_UNLCK`.
    pub typ: i32,
    /// The pid of the process that owns the lock, from the locker's namespace.
    pub pid: u32,
}

impl From<&fuse_abi::fuse_file_lock> for Lock {
    fn from(lk: &fuse_abi::fuse_file_lock) -> Self {
        Lock {
            range: (lk.start, lk.end),
            typ: lk.typ,
            pid: lk.pid,
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    /// Aligns embedded test fixture byte arrays to `u64` so they can be parsed via zerocopy the
    /// same way data coming off `/dev/fuse` is.
    #[repr(align(8))]
    pub(crate) struct AlignedData<T>(pub T);

    impl<T, I> std::ops::Index<I> for AlignedData<T>
    where
        T: std::ops::Index<I>,
    {
        type Output = T::Output;

        fn index(&self, index: I) -> &Self::Output {
            &self.0[index]
        }
    }
}
