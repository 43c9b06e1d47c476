//! Thread-core scenarios: rendezvous, producer/consumer, priority
//! donation, and reader/writer fairness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use mekos_kernel::fs::file_lock::FileLock;
use mekos_kernel::test_utils;
use mekos_kernel::threads::thread::{self, Thread};
use mekos_kernel::threads::{Channel, Condition, Lock};
use mekos_kernel::Kernel;

fn boot(name: &str) -> (Arc<Kernel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let k = test_utils::boot(&dir.path().join(name), |_| {});
    (k, dir)
}

#[test]
fn channel_rendezvous_with_receiver_first() {
    let (k, _dir) = boot("DISK");
    let channel = Arc::new(Channel::new("test channel"));
    let cell = Arc::new(AtomicI32::new(0));

    let receiver = Thread::new(&k, "receiver", true);
    {
        let channel = Arc::clone(&channel);
        let cell = Arc::clone(&cell);
        receiver.fork(
            &k,
            Box::new(move |k| {
                cell.store(channel.receive(k), Ordering::SeqCst);
            }),
        );
    }
    // Let the receiver park on the empty channel before sending.
    thread::yield_now(&k);
    channel.send(&k, 42);
    receiver.join(&k);
    assert_eq!(cell.load(Ordering::SeqCst), 42);
}

#[test]
fn channel_rendezvous_with_sender_first() {
    let (k, _dir) = boot("DISK");
    let channel = Arc::new(Channel::new("test channel"));

    let sender = Thread::new(&k, "sender", true);
    {
        let channel = Arc::clone(&channel);
        sender.fork(&k, Box::new(move |k| channel.send(k, 7)));
    }
    thread::yield_now(&k);
    assert_eq!(channel.receive(&k), 7);
    sender.join(&k);
}

#[test]
fn channel_pairs_every_sender_with_one_receiver() {
    let (k, _dir) = boot("DISK");
    let channel = Arc::new(Channel::new("fan in"));
    let mut receivers = Vec::new();
    let received = Arc::new(Mutex::new(Vec::new()));

    for i in 0..4 {
        let receiver = Thread::new(&k, &format!("receiver {i}"), true);
        let channel = Arc::clone(&channel);
        let received = Arc::clone(&received);
        receiver.fork(
            &k,
            Box::new(move |k| {
                let message = channel.receive(k);
                received.lock().unwrap().push(message);
            }),
        );
        receivers.push(receiver);
    }
    for message in 0..4 {
        channel.send(&k, message);
    }
    for receiver in &receivers {
        receiver.join(&k);
    }
    let mut seen = received.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn producers_and_consumers_balance_out() {
    const PRODUCERS: usize = 10;
    const CONSUMERS: usize = 10;
    const ITERS: i32 = 10;
    const CAPACITY: usize = 5;

    let (k, _dir) = boot("DISK");
    let lock = Arc::new(Lock::new("buffer"));
    let not_full = Arc::new(Condition::new("not full", Arc::clone(&lock)));
    let not_empty = Arc::new(Condition::new("not empty", Arc::clone(&lock)));
    let buffer: Arc<Mutex<VecDeque<i32>>> = Arc::new(Mutex::new(VecDeque::new()));
    let consumed = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for p in 0..PRODUCERS {
        let producer = Thread::new(&k, &format!("producer {p}"), true);
        let lock = Arc::clone(&lock);
        let not_full = Arc::clone(&not_full);
        let not_empty = Arc::clone(&not_empty);
        let buffer = Arc::clone(&buffer);
        producer.fork(
            &k,
            Box::new(move |k| {
                for i in 0..ITERS {
                    lock.acquire(k);
                    while buffer.lock().unwrap().len() == CAPACITY {
                        not_full.wait(k);
                    }
                    buffer.lock().unwrap().push_back(p as i32 * ITERS + i);
                    not_empty.signal(k);
                    lock.release(k);
                }
            }),
        );
        workers.push(producer);
    }
    for c in 0..CONSUMERS {
        let consumer = Thread::new(&k, &format!("consumer {c}"), true);
        let lock = Arc::clone(&lock);
        let not_full = Arc::clone(&not_full);
        let not_empty = Arc::clone(&not_empty);
        let buffer = Arc::clone(&buffer);
        let consumed = Arc::clone(&consumed);
        consumer.fork(
            &k,
            Box::new(move |k| {
                for _ in 0..ITERS {
                    lock.acquire(k);
                    let product = loop {
                        if let Some(product) = buffer.lock().unwrap().pop_front() {
                            break product;
                        }
                        not_empty.wait(k);
                    };
                    not_full.signal(k);
                    lock.release(k);
                    consumed.lock().unwrap().push(product);
                }
            }),
        );
        workers.push(consumer);
    }
    for worker in &workers {
        worker.join(&k);
    }

    assert!(buffer.lock().unwrap().is_empty());
    let mut products = consumed.lock().unwrap().clone();
    assert_eq!(products.len(), PRODUCERS * ITERS as usize);
    products.sort_unstable();
    products.dedup();
    assert_eq!(products.len(), PRODUCERS * ITERS as usize, "a product was consumed twice");
}

#[test]
fn lock_donation_lifts_the_holder_past_the_middle_thread() {
    let (k, _dir) = boot("DISK");
    let x = Arc::new(Lock::new("X"));
    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let h_waiting = Arc::new(AtomicBool::new(false));
    let h_acquired = Arc::new(AtomicBool::new(false));
    let l_released = Arc::new(AtomicBool::new(false));

    let l_holds = Arc::new(AtomicBool::new(false));
    let low = Thread::new(&k, "L", true);
    let mid = Thread::new(&k, "M", true);
    let high = Thread::new(&k, "H", true);
    k.scheduler.transfer_priority(&low, 8);
    k.scheduler.transfer_priority(&mid, 5);
    k.scheduler.transfer_priority(&high, 0);

    {
        let x = Arc::clone(&x);
        let events = Arc::clone(&events);
        let l_holds = Arc::clone(&l_holds);
        let h_waiting = Arc::clone(&h_waiting);
        let l_released = Arc::clone(&l_released);
        let me = Arc::clone(&low);
        low.fork(
            &k,
            Box::new(move |k| {
                x.acquire(k);
                l_holds.store(true, Ordering::SeqCst);
                // Spin until the strong waiter has blocked on X and its
                // donation has landed.
                while !(h_waiting.load(Ordering::SeqCst) && me.priority() == 0) {
                    thread::yield_now(k);
                }
                events.lock().unwrap().push("L donated".into());
                x.release(k);
                assert_eq!(me.priority(), 8, "donation not undone on release");
                l_released.store(true, Ordering::SeqCst);
                events.lock().unwrap().push("L released".into());
            }),
        );
    }
    // L must own X before its competitors exist.
    while !l_holds.load(Ordering::SeqCst) {
        thread::yield_now(&k);
    }
    {
        let events = Arc::clone(&events);
        let l_released = Arc::clone(&l_released);
        let h_acquired = Arc::clone(&h_acquired);
        mid.fork(
            &k,
            Box::new(move |k| {
                for _ in 0..10 {
                    assert!(
                        !(l_released.load(Ordering::SeqCst)
                            && !h_acquired.load(Ordering::SeqCst)),
                        "M ran between the release and the hand-off to H"
                    );
                    thread::yield_now(k);
                }
                events.lock().unwrap().push("M finished".into());
            }),
        );
    }
    {
        let x = Arc::clone(&x);
        let events = Arc::clone(&events);
        let h_waiting = Arc::clone(&h_waiting);
        let h_acquired = Arc::clone(&h_acquired);
        high.fork(
            &k,
            Box::new(move |k| {
                h_waiting.store(true, Ordering::SeqCst);
                x.acquire(k);
                h_acquired.store(true, Ordering::SeqCst);
                events.lock().unwrap().push("H acquired".into());
                x.release(k);
            }),
        );
    }

    low.join(&k);
    mid.join(&k);
    high.join(&k);

    let events = events.lock().unwrap().clone();
    let index = |tag: &str| events.iter().position(|e| e == tag).unwrap();
    assert!(index("L donated") < index("L released"));
    assert!(index("H acquired") < index("M finished"));
}

#[test]
fn file_lock_writer_waits_for_readers() {
    let (k, _dir) = boot("DISK");
    let file_lock = Arc::new(FileLock::new());
    let writer_in = Arc::new(AtomicBool::new(false));

    file_lock.read_acquire(&k);
    let writer = Thread::new(&k, "writer", true);
    {
        let file_lock = Arc::clone(&file_lock);
        let writer_in = Arc::clone(&writer_in);
        writer.fork(
            &k,
            Box::new(move |k| {
                file_lock.write_acquire(k);
                writer_in.store(true, Ordering::SeqCst);
                file_lock.write_release(k);
            }),
        );
    }
    thread::yield_now(&k);
    assert!(!writer_in.load(Ordering::SeqCst), "writer entered during a read");
    file_lock.read_release(&k);
    writer.join(&k);
    assert!(writer_in.load(Ordering::SeqCst));
}

#[test]
fn file_lock_turnstile_blocks_late_readers_behind_a_writer() {
    let (k, _dir) = boot("DISK");
    let file_lock = Arc::new(FileLock::new());
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    file_lock.read_acquire(&k);
    let writer = Thread::new(&k, "writer", true);
    {
        let file_lock = Arc::clone(&file_lock);
        let events = Arc::clone(&events);
        writer.fork(
            &k,
            Box::new(move |k| {
                file_lock.write_acquire(k);
                events.lock().unwrap().push("writer");
                file_lock.write_release(k);
            }),
        );
    }
    thread::yield_now(&k); // writer now queued on the turnstile
    let reader = Thread::new(&k, "late reader", true);
    {
        let file_lock = Arc::clone(&file_lock);
        let events = Arc::clone(&events);
        reader.fork(
            &k,
            Box::new(move |k| {
                file_lock.read_acquire(k);
                events.lock().unwrap().push("late reader");
                file_lock.read_release(k);
            }),
        );
    }
    thread::yield_now(&k);
    file_lock.read_release(&k);
    writer.join(&k);
    reader.join(&k);
    // The late reader arrived while a writer was parked on the turnstile,
    // so the writer went first.
    assert_eq!(*events.lock().unwrap(), vec!["writer", "late reader"]);
}
