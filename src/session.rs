//! Filesystem session
//!
//! A session runs a filesystem implementation while it is being mounted to a specific mount
//! point. A session begins by mounting the filesystem and ends by unmounting it. While the
//! filesystem is mounted, the session loop receives, dispatches and replies to kernel requests
//! for filesystem operations under its mount point.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use libc::{EAGAIN, EINTR, ENODEV, ENOENT};
use log::{error, info, warn};

use crate::channel::Channel;
use crate::mnt::mount_options::MountOption;
use crate::mnt::Mount;
use crate::read_buf::FuseReadBuf;
use crate::request::Request;
use crate::Filesystem;

/// The max size of write requests from the kernel. The absolute minimum is 4k,
/// FUSE recommends at least 128k, max 16M. The FUSE default is 16M on macOS
/// and 128k on other systems.
pub const MAX_WRITE_SIZE: usize = 16 * 1024 * 1024;

/// Who is allowed to access the mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionACL {
    /// Access to the filesystem is limited to the owning user.
    Owner,
    /// The owning user and root are allowed access; requires the `allow_root`
    /// mount option to be permitted by the system (see `user_allow_other`).
    RootAndOwner,
    /// Any user is allowed access; requires `allow_other`.
    All,
}

impl Default for SessionACL {
    fn default() -> Self {
        SessionACL::Owner
    }
}

impl SessionACL {
    pub(crate) fn to_mount_option(self) -> Option<&'static str> {
        match self {
            SessionACL::Owner => None,
            SessionACL::RootAndOwner => Some("allow_root"),
            SessionACL::All => Some("allow_other"),
        }
    }
}

/// The session data structure
#[derive(Debug)]
pub struct Session<FS: Filesystem> {
    /// Filesystem operation implementations
    pub(crate) filesystem: FS,
    /// Communication channel to the kernel driver
    pub(crate) ch: Channel,
    /// Handle to the raw mount, used to unmount on drop
    mount: Arc<Mutex<Option<Mount>>>,
    /// FUSE protocol major version negotiated with the kernel
    pub(crate) proto_major: u32,
    /// FUSE protocol minor version negotiated with the kernel
    pub(crate) proto_minor: u32,
    /// True once the init handshake has completed
    pub(crate) initialized: bool,
    /// True once the destroy operation has been processed
    pub(crate) destroyed: bool,
}

impl<FS: Filesystem> Session<FS> {
    /// Create a new session by mounting the given filesystem to the given mountpoint.
    pub fn new(filesystem: FS, mountpoint: &Path, options: &[MountOption]) -> io::Result<Session<FS>> {
        Self::new_with_acl(filesystem, mountpoint, options, SessionACL::default())
    }

    /// Create a new session, explicitly specifying who is allowed to access the mount.
    pub(crate) fn new_with_acl(
        filesystem: FS,
        mountpoint: &Path,
        options: &[MountOption],
        acl: SessionACL,
    ) -> io::Result<Session<FS>> {
        let (dev_fuse, mount) = Mount::new(mountpoint, options, acl)?;
        let ch = Channel::new(mountpoint.to_path_buf(), dev_fuse);
        Ok(Session {
            filesystem,
            ch,
            mount: Arc::new(Mutex::new(Some(mount))),
            proto_major: 0,
            proto_minor: 0,
            initialized: false,
            destroyed: false,
        })
    }

    /// Return path of the mounted filesystem
    pub fn mountpoint(&self) -> &Path {
        self.ch.mountpoint()
    }

    /// Returns a thread-safe object that can be used to unmount the session asynchronously.
    pub fn unmount_callable(&self) -> SessionUnmounter {
        SessionUnmounter {
            mount: self.mount.clone(),
        }
    }

    /// Run the session loop that receives kernel requests and dispatches them to method
    /// calls into the filesystem. This read-dispatch-reply loop runs on the calling thread
    /// until the filesystem is unmounted, or an unrecoverable I/O error occurs.
    pub fn run(&mut self) -> io::Result<()> {
        let mut read_buf = FuseReadBuf::new();

        loop {
            if self.destroyed {
                return Ok(());
            }
            let size = match self.ch.receive(read_buf.as_mut()) {
                Ok(size) => size,
                Err(err) => match err.raw_os_error() {
                    Some(ENOENT) | Some(EINTR) | Some(EAGAIN) => continue,
                    Some(ENODEV) => return Ok(()),
                    _ => return Err(err),
                },
            };
            if let Some(req) = Request::new(self.ch.sender(), &read_buf.as_mut()[..size]) {
                req.dispatch(self);
            }
        }
    }

    /// Run the session loop in a background thread. If the returned handle is dropped, the
    /// filesystem is unmounted and the session ends.
    pub fn spawn(mut self) -> io::Result<BackgroundSession>
    where
        FS: Send + 'static,
    {
        let mountpoint = self.mountpoint().to_path_buf();
        let unmounter = self.unmount_callable();
        let guard = thread::Builder::new()
            .name("fuse-session".to_owned())
            .spawn(move || self.run())?;
        Ok(BackgroundSession {
            mountpoint,
            guard: Some(guard),
            unmounter,
        })
    }
}

/// A handle that allows unmounting a running [`Session`] from another thread.
#[derive(Debug, Clone)]
pub struct SessionUnmounter {
    mount: Arc<Mutex<Option<Mount>>>,
}

impl SessionUnmounter {
    /// Unmount the filesystem immediately.
    pub fn unmount(&mut self) -> io::Result<()> {
        let mount = self.mount.lock().unwrap().take();
        if let Some(mount) = mount {
            mount
                .umount(&[])
                .map_err(|(_, err)| err)?;
        }
        Ok(())
    }
}

/// The background session data structure
pub struct BackgroundSession {
    /// Path of the mounted filesystem
    pub mountpoint: PathBuf,
    /// Thread guard of the background session
    guard: Option<thread::JoinHandle<io::Result<()>>>,
    /// Handle used to trigger an unmount from `Drop`
    unmounter: SessionUnmounter,
}

impl BackgroundSession {
    /// Unmount the filesystem and wait for the session thread to finish.
    pub fn join(mut self) -> io::Result<()> {
        let _ = self.unmounter.unmount();
        match self.guard.take().map(thread::JoinHandle::join) {
            Some(Ok(res)) => res,
            Some(Err(_)) => Err(io::Error::other("fuse session thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        info!("Unmounting {}", self.mountpoint.display());
        if let Err(err) = self.unmounter.unmount() {
            error!("Failed to unmount {}: {}", self.mountpoint.display(), err);
        }
        if let Some(guard) = self.guard.take() {
            let _ = guard.join();
        }
    }
}

impl std::fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackgroundSession {{ mountpoint: {:?} }}", self.mountpoint)
    }
}
