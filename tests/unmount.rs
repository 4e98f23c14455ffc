mod fixtures;

use std::io::Read;

use fixtures::hello_fs::HelloFS;
use nodefuse::MountOption;

#[test]
#[cfg_attr(not(target_os = "linux"), ignore)]
fn should_unmount_without_outstanding_handles() {
    let mountpoint = tempfile::tempdir().unwrap();
    let session = nodefuse::spawn_mount2(HelloFS, &mountpoint, &[]).unwrap();
    session.join().unwrap();
}

#[test]
#[cfg_attr(not(target_os = "linux"), ignore)]
fn should_unmount_on_drop_with_autounmount() {
    let mountpoint = tempfile::tempdir().unwrap();
    let options = [MountOption::AutoUnmount];
    let session = nodefuse::spawn_mount2(HelloFS, &mountpoint, &options).unwrap();
    let hello_file = mountpoint.path().join("hello.txt");

    let mut file = std::fs::File::open(&hello_file).expect("open hello file");
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).expect("read hello file");
    assert_eq!(buffer, fixtures::hello_fs::HELLO_TXT_CONTENT.as_bytes());
    drop(file);

    // Dropping the session unmounts regardless of whether a handle was recently open; this
    // must return rather than hang even though a handle on hello.txt was open a moment ago.
    drop(session);
}
