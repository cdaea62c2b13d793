//! Locking properties across several clients

use crate::prelude::*;

#[test]
fn writers_are_mutually_exclusive() {
    let server = start(ServerConfig::new(0));
    let inside = Arc::new(AtomicU32::new(0));
    let managers: Vec<_> = (0..4).map(|_| Arc::new(connect(&server, ""))).collect();

    let threads: Vec<_> = managers
        .iter()
        .flat_map(|manager| (0..2).map(move |_| Arc::clone(manager)))
        .map(|manager| {
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let me = LocalId::current_thread();
                let lock = manager.get_lock("counter");
                for _ in 0..20 {
                    lock.lock_write(me).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two writers inside");
                    thread::sleep(Duration::from_millis(1));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.unlock_write(me).unwrap();
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
    assert!(eventually(|| is_free(&server, "counter")));
}

#[test]
fn readers_and_writers_never_overlap() {
    let server = start(ServerConfig::new(0));
    // Positive: readers inside; u32::MAX marks a writer
    let state = Arc::new(Mutex::new(0u32));
    let managers: Vec<_> = (0..3).map(|_| Arc::new(connect(&server, ""))).collect();

    let threads: Vec<_> = managers
        .iter()
        .enumerate()
        .map(|(i, manager)| {
            let manager = Arc::clone(manager);
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let me = LocalId::current_thread();
                let lock = manager.get_lock("mixed");
                for round in 0..15 {
                    if (i + round) % 3 == 0 {
                        let _guard = lock.write(me).unwrap();
                        {
                            let mut s = state.lock().unwrap();
                            assert_eq!(*s, 0, "writer entered while held");
                            *s = u32::MAX;
                        }
                        thread::sleep(Duration::from_millis(2));
                        *state.lock().unwrap() = 0;
                    } else {
                        let _guard = lock.read(me).unwrap();
                        {
                            let mut s = state.lock().unwrap();
                            assert_ne!(*s, u32::MAX, "reader entered during write");
                            *s += 1;
                        }
                        thread::sleep(Duration::from_millis(2));
                        *state.lock().unwrap() -= 1;
                    }
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn blocked_writers_are_served_in_request_order() {
    let server = start(ServerConfig::new(0));
    let holder = connect(&server, "");
    let order = Arc::new(Mutex::new(Vec::new()));
    holder.get_lock("fifo").lock_write(LocalId(1)).unwrap();

    let mut threads = Vec::new();
    for label in ["first", "second", "third"] {
        let manager = connect(&server, "");
        let order = Arc::clone(&order);
        let waiting = queued(&server, "fifo");
        threads.push(thread::spawn(move || {
            let lock = manager.get_lock("fifo");
            lock.lock_write(LocalId(1)).unwrap();
            order.lock().unwrap().push(label);
            thread::sleep(Duration::from_millis(20));
            lock.unlock_write(LocalId(1)).unwrap();
        }));
        assert!(eventually(|| queued(&server, "fifo") == waiting + 1));
    }

    holder.get_lock("fifo").unlock_write(LocalId(1)).unwrap();
    for t in threads {
        t.join().unwrap();
    }

    similar_asserts::assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn new_reader_barges_past_queued_writer() {
    let server = start(ServerConfig::new(0));
    let reader = connect(&server, "");
    let writer = Arc::new(connect(&server, ""));
    let late_reader = connect(&server, "");
    reader.get_lock("shared").lock_read(LocalId(1)).unwrap();

    let blocked = {
        let writer = Arc::clone(&writer);
        thread::spawn(move || {
            let lock = writer.get_lock("shared");
            lock.lock_write(LocalId(1)).unwrap();
            lock.unlock_write(LocalId(1)).unwrap();
        })
    };
    assert!(eventually(|| queued(&server, "shared") == 1));

    let started = Instant::now();
    late_reader.get_lock("shared").lock_read(LocalId(1)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(queued(&server, "shared"), 1);

    reader.get_lock("shared").unlock_read(LocalId(1)).unwrap();
    late_reader.get_lock("shared").unlock_read(LocalId(1)).unwrap();
    blocked.join().unwrap();
}

#[test]
fn write_holder_can_take_its_own_read_lock() {
    let server = start(ServerConfig::new(0));
    let manager = connect(&server, "");
    let lock = manager.get_lock("downgrade");
    let me = LocalId(1);

    lock.lock_write(me).unwrap();
    lock.lock_read(me).unwrap();
    lock.unlock_write(me).unwrap();

    // Still shared-held through the read hold
    assert!(eventually(|| {
        matches!(
            server.registry().snapshot("downgrade").map(|s| s.holders),
            Some(Holders::Shared(_))
        )
    }));
    lock.unlock_read(me).unwrap();
    assert!(eventually(|| is_free(&server, "downgrade")));
}

#[test]
fn unmatched_unlock_is_reported_to_caller() {
    let server = start(ServerConfig::new(0));
    let manager = connect(&server, "");
    let lock = manager.get_lock("account");

    assert!(matches!(
        lock.unlock_read(LocalId(1)),
        Err(ClientError::LockState(_))
    ));

    lock.lock_read(LocalId(1)).unwrap();
    assert!(matches!(
        lock.unlock_write(LocalId(1)),
        Err(ClientError::LockState(_))
    ));
    // Another owner does not hold it either
    assert!(lock.unlock_read(LocalId(2)).is_err());
    lock.unlock_read(LocalId(1)).unwrap();
    assert!(manager.is_connected());
}

#[test]
fn lock_before_connect_is_a_connection_error() {
    let server = start(ServerConfig::new(0));
    let manager = LockManager::new(client_config(&server)).unwrap();

    let err = manager.get_lock("a").lock_write(LocalId(1)).unwrap_err();
    assert!(err.is_connection_error());
}
