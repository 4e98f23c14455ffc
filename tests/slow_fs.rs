use nodefuse::{
    Errno, FileAttr, FileHandle, FileType, Generation, INodeNo, KernelConfig, Request,
    ReplyAttr, ReplyDirectory, ReplyEntry, Filesystem,
};
use std::time::{Duration, UNIX_EPOCH};

const TTL: Duration = Duration::from_secs(1); // 1 second

const HELLO_DIR_ATTR: FileAttr = FileAttr {
    ino: INodeNo::ROOT,
    size: 0,
    blocks: 0,
    atime: UNIX_EPOCH, // 1970-01-01 00:00:00
    mtime: UNIX_EPOCH,
    ctime: UNIX_EPOCH,
    crtime: UNIX_EPOCH,
    kind: FileType::Directory,
    perm: 0o755,
    nlink: 2,
    uid: 501,
    gid: 20,
    rdev: 0,
    blksize: 512,
    flags: 0,
};

const HELLO_TXT_CONTENT: &str = "Hello World!\n";

const HELLO_TXT_ATTR: FileAttr = FileAttr {
    ino: INodeNo(2),
    size: 13,
    blocks: 1,
    atime: UNIX_EPOCH, // 1970-01-01 00:00:00
    mtime: UNIX_EPOCH,
    ctime: UNIX_EPOCH,
    crtime: UNIX_EPOCH,
    kind: FileType::RegularFile,
    perm: 0o644,
    nlink: 1,
    uid: 501,
    gid: 20,
    rdev: 0,
    blksize: 512,
    flags: 0,
};

struct SlowInitFS;

impl Filesystem for SlowInitFS {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        std::thread::sleep(Duration::new(2, 0));
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &std::ffi::OsStr, reply: ReplyEntry) {
        if parent == INodeNo::ROOT && name == "hello.txt" {
            reply.entry(&TTL, &HELLO_TXT_ATTR, Generation(0));
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match ino {
            INodeNo::ROOT => reply.attr(&TTL, &HELLO_DIR_ATTR),
            INodeNo(2) => reply.attr(&TTL, &HELLO_TXT_ATTR),
            _ => reply.error(Errno::ENOENT),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        if ino != INodeNo::ROOT {
            reply.error(Errno::ENOENT);
            return;
        }

        let entries = vec![
            (INodeNo::ROOT, FileType::Directory, "."),
            (INodeNo::ROOT, FileType::Directory, ".."),
            (INodeNo(2), FileType::RegularFile, "hello.txt"),
        ];

        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            // i + 1 means the index of the next entry
            if reply.add(entry.0, (i + 1) as i64, entry.1, entry.2) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::SlowInitFS;
    use std::ffi::OsStr;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Mounting with a slow `init` must not block the session's background thread from
    /// returning: directory entries become visible as soon as `init` finishes, not before, and
    /// the caller that spawned the mount observes that promptly rather than blocking for the
    /// full two seconds `init` sleeps.
    #[test]
    #[cfg_attr(not(target_os = "linux"), ignore)]
    fn slow_init_does_not_block_spawn() {
        let mountpoint = tempdir().unwrap().into_path();
        let start = std::time::SystemTime::now();
        let mount = nodefuse::spawn_mount(
            SlowInitFS,
            &mountpoint,
            &[OsStr::new("-o"), OsStr::new("auto_unmount")],
        )
        .unwrap();
        std::thread::sleep(Duration::from_micros(100));
        // Spawning the session returns immediately; it does not wait for init to finish.
        assert!(start.elapsed().unwrap().as_secs_f64() < 0.5);
        let mut entries = std::fs::read_dir(&mountpoint).unwrap();
        assert!(entries.any(|x| x.unwrap().file_name() == "hello.txt"));
        drop(mount);
    }
}
