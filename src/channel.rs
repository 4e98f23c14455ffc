//! Raw communication channel to the FUSE kernel driver.
//!
//! A [`Channel`] wraps the open file descriptor to `/dev/fuse` returned by mounting the
//! filesystem. Reading from the channel blocks the calling thread until the kernel has a
//! request ready; writing a reply is a single `writev` of the header plus payload.

use std::io;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::error;

use crate::dev_fuse::DevFuse;
#[cfg(not(target_os = "macos"))]
use crate::ll::ioctl::fuse_dev_ioc_clone;

/// A raw communication channel to the FUSE kernel driver.
///
/// Channels are cheap to clone: clones share the same underlying file descriptor, which is
/// how multiple worker threads read from the same mount concurrently (see [`Channel::clone_fd`]
/// for an alternative that gives each worker its own kernel-side queue).
#[derive(Debug, Clone)]
pub(crate) struct Channel {
    mountpoint: Arc<PathBuf>,
    fd: Arc<DevFuse>,
}

impl Channel {
    pub(crate) fn new(mountpoint: PathBuf, fd: Arc<DevFuse>) -> Self {
        Self {
            mountpoint: Arc::new(mountpoint),
            fd,
        }
    }

    pub(crate) fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub(crate) fn device(&self) -> &Arc<DevFuse> {
        &self.fd
    }

    /// Returns a handle that can be used to send replies back through this channel.
    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender(self.fd.clone())
    }

    /// Blocks until a request is available and reads it into `buffer`, returning the number of
    /// bytes read. Retries on `EINTR`.
    pub(crate) fn receive(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    /// Clones the kernel-side queue onto a fresh file descriptor via `FUSE_DEV_IOC_CLONE`.
    ///
    /// Each cloned descriptor sees its own slice of incoming requests from the kernel, which
    /// lets independent worker threads call [`Channel::receive`] without contending on a single
    /// fd. Not supported on macOS, where the single root descriptor is shared instead.
    #[cfg(not(target_os = "macos"))]
    pub(crate) fn clone_fd(&self) -> io::Result<Channel> {
        let new_fd = DevFuse::open()?;
        let mut source: u32 = self.fd.as_raw_fd() as u32;
        unsafe { fuse_dev_ioc_clone(new_fd.as_raw_fd(), &mut source as *mut u32) }
            .map_err(io::Error::from)?;
        Ok(Channel {
            mountpoint: self.mountpoint.clone(),
            fd: Arc::new(new_fd),
        })
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn clone_fd(&self) -> io::Result<Channel> {
        Ok(self.clone())
    }
}

/// A handle used to send a single reply through a [`Channel`]. Cheap to clone; every in-flight
/// request holds one so it can answer the kernel once its reply is ready, regardless of which
/// worker thread eventually processes it.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSender(Arc<DevFuse>);

impl ChannelSender {
    pub(crate) fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        let fd = self.0.as_raw_fd();
        let mut written = 0usize;
        let total: usize = data.iter().map(|s| s.len()).sum();
        let mut remaining = data.to_vec();
        while written < total {
            let rc = unsafe {
                libc::writev(
                    fd,
                    remaining.as_ptr() as *const libc::iovec,
                    remaining.len() as libc::c_int,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("Failed to write FUSE reply: {}", err);
                return Err(err);
            }
            written += rc as usize;
            // writev() is defined to write as much as the kernel can accept in one call for
            // /dev/fuse; a short write here would indicate a malformed reply.
            break;
        }
        Ok(())
    }
}

impl crate::reply::ReplySender for ChannelSender {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        ChannelSender::send(self, data)
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
