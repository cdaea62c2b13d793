//! Server-side connection cleanup specs
//!
//! Whatever ends a connection, its holds and waits are released.

use crate::prelude::*;

fn lock_write(client: &mut RawClient, request_id: u64, name: &str) -> Message {
    client.send(&Message::lock(LockMode::Write, request_id, name, 1));
    client.recv()
}

#[test]
fn disconnect_releases_every_held_lock() {
    let server = start(ServerConfig::new(0));
    let holder = connect(&server, "");
    let waiter = Arc::new(connect(&server, ""));
    holder.get_lock("l1").lock_write(LocalId(1)).unwrap();
    holder.get_lock("l2").lock_read(LocalId(1)).unwrap();

    let blocked = {
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || waiter.get_lock("l1").lock_write(LocalId(1)))
    };
    assert!(eventually(|| queued(&server, "l1") == 1));

    holder.disconnect();

    blocked.join().unwrap().unwrap();
    assert!(eventually(|| is_free(&server, "l2")));
}

#[test]
fn silent_client_times_out_and_is_released() {
    let config = ServerConfig::new(0)
        .with_heartbeat(Duration::from_millis(100), Duration::from_millis(400));
    let server = start(config);
    let (mut silent, _) = RawClient::login(&server, "");
    assert!(matches!(
        lock_write(&mut silent, 1, "heartbeat"),
        Message::Granted { request_id: 1, .. }
    ));

    // Never answer again; the server must give up on its own
    let manager = connect(&server, "");
    let started = Instant::now();
    manager.get_lock("heartbeat").lock_write(LocalId(1)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(silent.closed_by_server());
}

#[test]
fn malformed_frame_closes_only_that_connection() {
    let server = start(ServerConfig::new(0));
    let (mut bad, _) = RawClient::login(&server, "");
    let bystander = connect(&server, "");
    assert!(matches!(
        lock_write(&mut bad, 1, "p"),
        Message::Granted { .. }
    ));
    bystander.get_lock("q").lock_write(LocalId(1)).unwrap();

    bad.send_body(b"\x00this is not json");

    assert!(bad.closed_by_server());
    assert!(eventually(|| is_free(&server, "p")));
    assert!(bystander.is_connected());
    assert!(!is_free(&server, "q"));
}

#[test]
fn unmatched_unlock_on_the_wire_closes_connection() {
    let server = start(ServerConfig::new(0));
    let (mut client, _) = RawClient::login(&server, "");
    assert!(matches!(
        lock_write(&mut client, 1, "held"),
        Message::Granted { .. }
    ));

    client.send(&Message::unlock(LockMode::Read, 2, "never-held", 1));

    assert!(client.closed_by_server());
    assert!(eventually(|| is_free(&server, "held")));
}

#[test]
fn queued_then_granted_share_a_request_id() {
    let server = start(ServerConfig::new(0));
    let (mut first, _) = RawClient::login(&server, "");
    let (mut second, _) = RawClient::login(&server, "");

    lock_write(&mut first, 10, "seq");
    assert_eq!(
        lock_write(&mut second, 20, "seq"),
        Message::Queued {
            request_id: 20,
            name: "seq".to_string(),
            owner: 1,
        }
    );

    first.send(&Message::unlock(LockMode::Write, 11, "seq", 1));
    assert_eq!(
        second.recv(),
        Message::Granted {
            request_id: 20,
            name: "seq".to_string(),
            owner: 1,
        }
    );
}

#[test]
fn connection_ids_are_distinct() {
    let server = start(ServerConfig::new(0));
    let (_a, first) = RawClient::login(&server, "");
    let (_b, second) = RawClient::login(&server, "");
    assert_ne!(first, second);
}
