//! Concurrent operations on shared files and directories.

mod common;

use common::TestFs;
use cowfs_zpl::types::{Cred, FileKind, FlagChange, IoFlags, NodeFlags, SetAttrs};
use cowfs_zpl::{CreateAttrs, ZplError};
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_readers_never_observe_torn_writes() {
    let fs = TestFs::new();
    let root = fs.root();
    let f = fs.create_file(&root, "f");
    const LEN: usize = 8192;

    std::thread::scope(|s| {
        for w in 0..4u8 {
            let (fs, f) = (&fs, &f);
            s.spawn(move || {
                for round in 0..50u8 {
                    let fill = w.wrapping_mul(50).wrapping_add(round);
                    fs.write_at(f, 0, &[fill; LEN]);
                }
            });
        }
        for _ in 0..4 {
            let (fs, f) = (&fs, &f);
            s.spawn(move || {
                for _ in 0..100 {
                    let data = fs.mount.read(f, 0, LEN, IoFlags::READ).unwrap();
                    if let Some(first) = data.first() {
                        assert_eq!(data.len(), LEN);
                        assert!(data.iter().all(|b| b == first), "torn read");
                    }
                }
            });
        }
    });
    assert_eq!(f.size(), LEN as u64);
    assert_eq!(f.ranges_held(), 0);
}

#[test]
fn test_concurrent_appends_do_not_overlap() {
    let fs = TestFs::new();
    let root = fs.root();
    let f = fs.create_file(&root, "log");
    const RECORD: usize = 100;

    std::thread::scope(|s| {
        for w in 0..8u8 {
            let (fs, f) = (&fs, &f);
            s.spawn(move || {
                for _ in 0..25 {
                    let res = fs
                        .mount
                        .write(f, 0, &[w; RECORD], IoFlags::WRITE | IoFlags::APPEND, &Cred::root())
                        .unwrap();
                    assert_eq!(res.written, RECORD);
                    assert_eq!(res.offset % RECORD as u64, 0);
                }
            });
        }
    });

    let data = fs.read_all(&f);
    assert_eq!(data.len(), 8 * 25 * RECORD);
    for record in data.chunks(RECORD) {
        assert!(record.iter().all(|b| *b == record[0]), "interleaved append");
    }
}

#[test]
fn test_racing_creates_of_one_name() {
    let fs = TestFs::new();
    let root = fs.root();
    let created = AtomicUsize::new(0);
    let existed = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..8 {
            let (fs, root, created, existed) = (&fs, &root, &created, &existed);
            s.spawn(move || {
                match fs.mount.create(
                    root,
                    b"contested",
                    FileKind::Regular,
                    &CreateAttrs::with_mode(0o644),
                    &Cred::root(),
                ) {
                    Ok(_) => created.fetch_add(1, Ordering::Relaxed),
                    Err(ZplError::Exists) => existed.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {}", e),
                };
            });
        }
    });
    assert_eq!(created.load(Ordering::Relaxed), 1);
    assert_eq!(existed.load(Ordering::Relaxed), 7);
    assert_eq!(fs.list(&root), vec!["contested"]);
    assert_eq!(fs.mount.dirent_locks_held(), 0);
}

#[test]
fn test_parallel_creates_in_one_directory() {
    let fs = TestFs::new();
    let root = fs.root();
    let dir = fs.mkdir(&root, "d");

    std::thread::scope(|s| {
        for w in 0..4 {
            let (fs, dir) = (&fs, &dir);
            s.spawn(move || {
                for i in 0..50 {
                    let f = fs.create_file(dir, &format!("w{}-{}", w, i));
                    fs.write_at(&f, 0, format!("{}:{}", w, i).as_bytes());
                }
            });
        }
    });

    let names = fs.list(&dir);
    assert_eq!(names.len(), 200);
    let f = fs.mount.lookup(&dir, b"w3-49", &Cred::root()).unwrap();
    assert_eq!(fs.read_all(&f), b"3:49");
    // Directory size counts "." and "..".
    assert_eq!(dir.size(), 202);
    assert_eq!(dir.links(), 2);
}

#[test]
fn test_parallel_mkdirs_keep_directory_counts() {
    let fs = TestFs::new();
    let root = fs.root();
    let dir = fs.mkdir(&root, "d");

    std::thread::scope(|s| {
        for w in 0..4 {
            let (fs, dir) = (&fs, &dir);
            s.spawn(move || {
                for i in 0..25 {
                    fs.mkdir(dir, &format!("w{}-{}", w, i));
                }
            });
        }
    });
    assert_eq!(dir.size(), 102);
    assert_eq!(dir.links(), 102);

    std::thread::scope(|s| {
        for w in 0..4 {
            let (fs, dir) = (&fs, &dir);
            s.spawn(move || {
                for i in 0..25 {
                    fs.mount.rmdir(dir, format!("w{}-{}", w, i).as_bytes(), &Cred::root()).unwrap();
                }
            });
        }
    });
    assert_eq!(dir.size(), 2);
    assert_eq!(dir.links(), 2);

    // The counts on disk match the cached ones.
    fs.mount.sync().unwrap();
    let after = fs.crash_and_remount();
    let dir = after.mount.lookup(&after.root(), b"d", &Cred::root()).unwrap();
    assert_eq!(dir.size(), 2);
    assert_eq!(dir.links(), 2);
}

#[test]
fn test_flag_change_survives_concurrent_writes() {
    let fs = TestFs::new();
    let root = fs.root();
    let f = fs.create_file(&root, "f");
    let nodump = SetAttrs {
        flags: Some(FlagChange {
            set: NodeFlags::NODUMP,
            clear: NodeFlags::empty(),
        }),
        ..SetAttrs::default()
    };

    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            for i in 0..200i64 {
                fs.write_at(&f, i * 8, &[7u8; 8]);
            }
        });
        for _ in 0..20 {
            fs.mount.setattr(&f, &nodump, &Cred::root()).unwrap();
        }
        writer.join().unwrap();
    });
    assert!(f.flags().contains(NodeFlags::NODUMP));
    assert_eq!(f.size(), 200 * 8);

    fs.mount.sync().unwrap();
    let after = fs.crash_and_remount();
    let g = after.mount.lookup(&after.root(), b"f", &Cred::root()).unwrap();
    assert!(g.flags().contains(NodeFlags::NODUMP));
    assert_eq!(g.size(), 200 * 8);
}

#[test]
fn test_unmount_waits_for_running_operations() {
    let fs = TestFs::new();
    let root = fs.root();
    let f = fs.create_file(&root, "f");

    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            let mut done = 0;
            for i in 0..1000 {
                match fs.mount.write(&f, i * 16, &[1u8; 16], IoFlags::WRITE, &Cred::root()) {
                    Ok(_) => done += 1,
                    Err(ZplError::Unmounted) => break,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            done
        });
        std::thread::yield_now();
        fs.mount.unmount().unwrap();
        let done = writer.join().unwrap();
        assert!(done <= 1000);
    });
    assert!(matches!(
        fs.mount.write(&f, 0, b"late", IoFlags::WRITE, &Cred::root()),
        Err(ZplError::Unmounted)
    ));
}
