//! Filesystem scenarios: data round trips through the indirection layers,
//! hierarchical directories, growth on write, deletion-while-open, and
//! the consistency check.

use std::sync::Arc;

use mekos_kernel::test_utils;
use mekos_kernel::threads::thread::{self, Thread};
use mekos_kernel::threads::Channel;
use mekos_kernel::{Kernel, KernelError};

fn boot() -> (Arc<Kernel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let k = test_utils::boot(&dir.path().join("DISK"), |_| {});
    (k, dir)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 255) as u8).collect()
}

#[test]
fn written_data_survives_reopen() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    // Large enough to force both indirection levels (70 sectors).
    let data = pattern(70 * 128);
    test_utils::install_file(&k, "big", &data);

    let file = fs.open(&k, "big").unwrap();
    assert_eq!(test_utils::slurp(&k, &file), data);
    // Unaligned interior read.
    let mut window = vec![0u8; 300];
    assert_eq!(file.read_at(&k, &mut window, 1000), 300);
    assert_eq!(window, data[1000..1300]);
    file.close(&k);

    assert!(fs.check(&k));
}

#[test]
fn sequential_writes_grow_the_file() {
    let (k, _dir) = boot();
    let fs = k.file_system();
    fs.create(&k, "log", 0, false).unwrap();

    let file = fs.open(&k, "log").unwrap();
    let chunk = pattern(1000);
    for _ in 0..5 {
        assert_eq!(file.write(&k, &chunk), chunk.len());
    }
    assert_eq!(file.length(), 5000);
    file.seek(0);
    let mut back = vec![0u8; 5000];
    assert_eq!(file.read(&k, &mut back), 5000);
    for piece in back.chunks(1000) {
        assert_eq!(piece, &chunk[..]);
    }
    file.close(&k);
    assert!(fs.check(&k));
}

#[test]
fn create_and_remove_restore_the_free_map() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    test_utils::install_file(&k, "noise", &pattern(40 * 128));
    assert!(fs.check(&k));
    fs.remove(&k, "noise").unwrap();
    assert!(fs.check(&k));
    assert_eq!(fs.open(&k, "noise").err(), Some(KernelError::NotFound));
}

#[test]
fn removal_while_open_is_deferred_to_the_last_close() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    let data = pattern(600);
    test_utils::install_file(&k, "victim", &data);

    let file = fs.open(&k, "victim").unwrap();
    // Removal succeeds immediately from the caller's point of view.
    fs.remove(&k, "victim").unwrap();
    // The open handle still sees intact data...
    assert_eq!(test_utils::slurp(&k, &file), data);
    // ...but no new open can reach the file.
    assert_eq!(fs.open(&k, "victim").err(), Some(KernelError::RemovePending));
    // The last close unlinks it physically.
    file.close(&k);
    assert!(fs.check(&k));
    assert_eq!(fs.open(&k, "victim").err(), Some(KernelError::NotFound));
    // The name can be used again.
    fs.create(&k, "victim", 0, false).unwrap();
}

#[test]
fn directories_nest_and_paths_resolve() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    fs.mkdir(&k, "a").unwrap();
    fs.mkdir(&k, "/a/b").unwrap();
    test_utils::install_file(&k, "/a/b/leaf", b"payload");

    fs.chdir(&k, "/a/b").unwrap();
    let file = fs.open(&k, "leaf").unwrap();
    assert_eq!(test_utils::slurp(&k, &file), b"payload");
    file.close(&k);

    let mut names: Vec<String> = fs.list(&k).into_iter().map(|(n, _)| n).collect();
    names.sort();
    assert_eq!(names, vec!["leaf"]);

    fs.chdir(&k, "..").unwrap();
    let listing = fs.list(&k);
    assert_eq!(listing, vec![("b".to_string(), true)]);

    fs.chdir(&k, "/").unwrap();
    assert!(fs.check(&k));
}

#[test]
fn directory_entries_grow_past_the_initial_table() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    // The initial table holds 10 entries; go well past it.
    for i in 0..25 {
        fs.create(&k, &format!("f{i}"), 0, false).unwrap();
    }
    for i in 0..25 {
        assert!(fs.open(&k, &format!("f{i}")).is_ok());
    }
    assert_eq!(fs.list(&k).len(), 25);
    assert!(fs.check(&k));
}

#[test]
fn non_empty_or_busy_directories_cannot_be_removed() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    fs.mkdir(&k, "d").unwrap();
    fs.create(&k, "/d/inner", 0, false).unwrap();
    assert_eq!(fs.remove(&k, "d").err(), Some(KernelError::DirectoryNotEmpty));
    fs.remove(&k, "/d/inner").unwrap();

    // Park another thread with its working directory inside `d`.
    let parked = Thread::new(&k, "parked", true);
    let release = Arc::new(Channel::new("release"));
    {
        let release = Arc::clone(&release);
        parked.fork(
            &k,
            Box::new(move |k| {
                k.file_system().chdir(k, "/d").unwrap();
                release.receive(k);
            }),
        );
    }
    thread::yield_now(&k);
    assert_eq!(fs.remove(&k, "d").err(), Some(KernelError::DirectoryInUse));

    release.send(&k, 0);
    parked.join(&k);
    fs.remove(&k, "d").unwrap();
    assert_eq!(fs.chdir(&k, "/d").err(), Some(KernelError::NotFound));
    assert!(fs.check(&k));
}

#[test]
fn a_forked_thread_pins_its_inherited_working_directory() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    fs.mkdir(&k, "work").unwrap();
    fs.chdir(&k, "/work").unwrap();

    // The worker inherits /work at creation and holds it open from its
    // fork onward, without ever touching the filesystem itself.
    let worker = Thread::new(&k, "worker", true);
    let release = Arc::new(Channel::new("release"));
    {
        let release = Arc::clone(&release);
        worker.fork(
            &k,
            Box::new(move |k| {
                release.receive(k);
            }),
        );
    }
    fs.chdir(&k, "/").unwrap();
    assert_eq!(fs.remove(&k, "work").err(), Some(KernelError::DirectoryInUse));

    release.send(&k, 0);
    worker.join(&k);
    fs.remove(&k, "work").unwrap();
    assert!(fs.check(&k));
}

#[test]
fn duplicate_names_and_missing_files_error_cleanly() {
    let (k, _dir) = boot();
    let fs = k.file_system();

    fs.create(&k, "once", 0, false).unwrap();
    assert_eq!(
        fs.create(&k, "once", 0, false).err(),
        Some(KernelError::AlreadyExists)
    );
    assert_eq!(
        fs.create(&k, "wayt00long", 0, false).err(),
        Some(KernelError::NameTooLong)
    );
    assert_eq!(fs.remove(&k, "absent").err(), Some(KernelError::NotFound));
    assert_eq!(fs.open(&k, "absent").err(), Some(KernelError::NotFound));
    assert_eq!(fs.open(&k, "/").err(), Some(KernelError::IsADirectory));
    assert_eq!(
        fs.chdir(&k, "once").err(),
        Some(KernelError::NotADirectory)
    );
}

#[test]
fn concurrent_writers_serialize_on_the_file_lock() {
    let (k, _dir) = boot();
    let fs = k.file_system();
    test_utils::install_file(&k, "shared", &[0u8; 512]);

    let mut writers = Vec::new();
    for id in 0..4u8 {
        let writer = Thread::new(&k, &format!("writer {id}"), true);
        writer.fork(
            &k,
            Box::new(move |k| {
                let file = k.file_system().open(k, "shared").unwrap();
                // Each writer stamps the whole file with its own byte.
                file.write(k, &[id + 1; 512]);
                file.close(k);
            }),
        );
        writers.push(writer);
    }
    for writer in &writers {
        writer.join(&k);
    }

    let file = fs.open(&k, "shared").unwrap();
    let data = test_utils::slurp(&k, &file);
    file.close(&k);
    // Writes are atomic under the writer lock: the file holds exactly one
    // writer's stamp.
    assert!(data.iter().all(|&b| b == data[0]));
    assert!((1..=4).contains(&data[0]));
    assert!(fs.check(&k));
}

#[test]
fn console_round_trip() {
    struct SharedSink(Arc<std::sync::Mutex<Vec<u8>>>);
    impl std::io::Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let output = Arc::new(std::sync::Mutex::new(Vec::new()));
    let k = test_utils::boot_with_io(
        &dir.path().join("DISK"),
        |_| {},
        Box::new(std::io::Cursor::new(b"ping\n".to_vec())),
        Box::new(SharedSink(Arc::clone(&output))),
    );

    let mut buf = [0u8; 5];
    k.synch_console.read(&k, &mut buf);
    assert_eq!(&buf, b"ping\n");
    k.synch_console.write(&k, b"pong\n");
    assert_eq!(*output.lock().unwrap(), b"pong\n");
}
