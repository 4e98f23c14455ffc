//! Native FFI bindings to libfuse2.
//!
//! This is a small set of bindings that are required to mount/unmount FUSE filesystems using
//! the libfuse2 ABI.
#![warn(missing_debug_implementations)]
#![allow(missing_docs)]
#![allow(non_camel_case_types)]

use libc::c_char;
use libc::c_int;

/// Helper function to provide options as a `fuse_args` struct
/// (which contains an argc count and an argv pointer). See the official fuse_common.h header.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct fuse_args {
    pub(crate) argc: c_int,
    pub(crate) argv: *const *const c_char,
    pub(crate) allocated: c_int,
}

unsafe extern "C" {
    /// Standard path to `fuse_mount` used by libfuse2's `fuse_main`. Mounts the filesystem and
    /// returns a file descriptor to `/dev/fuse`, or `-1` on error.
    pub(crate) fn fuse_mount_compat25(mountpoint: *const c_char, args: *const fuse_args) -> c_int;
}
