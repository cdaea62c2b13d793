//! End-to-end locking scenarios
//!
//! Application threads use `LockManager` against a live server.

use crate::prelude::*;

#[test]
fn read_and_write_on_unheld_names_grant_immediately() {
    let server = start(ServerConfig::new(0));
    let manager = connect(&server, "");
    let me = LocalId::current_thread();

    let account = manager.get_lock("account");
    let transaction = manager.get_lock("transaction");

    let started = Instant::now();
    account.lock_read(me).unwrap();
    transaction.lock_write(me).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    transaction.unlock_write(me).unwrap();
    account.unlock_read(me).unwrap();
    assert!(eventually(|| is_free(&server, "account") && is_free(&server, "transaction")));
}

#[test]
fn reader_waits_for_writer_release() {
    let server = start(ServerConfig::new(0));
    let manager = Arc::new(connect(&server, ""));
    let released_at = Arc::new(Mutex::new(None::<Instant>));

    let writer = {
        let manager = Arc::clone(&manager);
        let released_at = Arc::clone(&released_at);
        thread::spawn(move || {
            let me = LocalId::current_thread();
            let lock = manager.get_lock("test-lock");
            lock.lock_write(me).unwrap();
            thread::sleep(Duration::from_millis(1500));
            *released_at.lock().unwrap() = Some(Instant::now());
            lock.unlock_write(me).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(100));
    let requested = Instant::now();
    let lock = manager.get_lock("test-lock");
    lock.lock_read(LocalId::current_thread()).unwrap();
    let granted = Instant::now();

    writer.join().unwrap();
    let released = released_at.lock().unwrap().expect("writer never released");
    assert!(granted >= released, "reader granted before the writer released");
    assert!(
        granted - requested >= Duration::from_millis(1300),
        "reader waited only {:?}",
        granted - requested
    );
    lock.unlock_read(LocalId::current_thread()).unwrap();
}

#[test]
fn reentrant_write_holds_until_last_unlock() {
    let server = start(ServerConfig::new(0));
    let owner = connect(&server, "");
    let other = Arc::new(connect(&server, ""));
    let me = LocalId::current_thread();
    let lock = owner.get_lock("reentrant");

    for _ in 0..4 {
        lock.lock_write(me).unwrap();
    }
    assert_eq!(lock.hold_count(me, LockMode::Write), 4);

    let granted = Arc::new(AtomicU32::new(0));
    let waiter = {
        let other = Arc::clone(&other);
        let granted = Arc::clone(&granted);
        thread::spawn(move || {
            let lock = other.get_lock("reentrant");
            let me = LocalId::current_thread();
            lock.lock_write(me).unwrap();
            granted.store(1, Ordering::SeqCst);
            lock.unlock_write(me).unwrap();
        })
    };
    assert!(eventually(|| queued(&server, "reentrant") == 1));

    for remaining in (1..4).rev() {
        lock.unlock_write(me).unwrap();
        assert_eq!(lock.hold_count(me, LockMode::Write), remaining);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(granted.load(Ordering::SeqCst), 0, "granted early");
    }

    lock.unlock_write(me).unwrap();
    assert_eq!(lock.hold_count(me, LockMode::Write), 0);
    waiter.join().unwrap();
    assert_eq!(granted.load(Ordering::SeqCst), 1);
}

#[test]
fn many_readers_hold_concurrently() {
    const READERS: u64 = 33;

    let server = start(ServerConfig::new(0));
    let manager = Arc::new(connect(&server, ""));
    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let started = Instant::now();

    let threads: Vec<_> = (0..READERS)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let me = LocalId::current_thread();
                let lock = manager.get_lock("lockTest");
                lock.lock_read(me).unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(i * 3000 / READERS));
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.unlock_read(me).unwrap();
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(4500), "took {:?}", elapsed);
    assert!(peak.load(Ordering::SeqCst) > 1, "readers never overlapped");
    assert!(eventually(|| is_free(&server, "lockTest")));
}

#[test]
fn wrong_password_never_locks() {
    let server = start(ServerConfig::new(0).with_password("correct horse"));
    let manager = LockManager::new(client_config(&server).with_password("battery staple")).unwrap();

    assert!(matches!(
        manager.connect(),
        Err(ClientError::Authentication(_))
    ));

    let lock = manager.get_lock("account");
    assert!(lock.lock_read(LocalId(1)).is_err());
    assert!(lock.lock_write(LocalId(1)).is_err());
    assert!(server.registry().lock_names().is_empty());
}
