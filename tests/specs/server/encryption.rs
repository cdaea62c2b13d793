//! Encrypted transport specs

use crate::prelude::*;

fn encrypted_server() -> ServerHandle {
    start(ServerConfig::new(0).with_password("pw").with_encryption(true))
}

#[test]
fn encrypted_session_locks_and_unlocks() {
    let server = encrypted_server();
    let manager =
        LockManager::new(client_config(&server).with_password("pw").with_encryption(true)).unwrap();
    manager.connect().unwrap();

    let lock = manager.get_lock("secret");
    lock.lock_write(LocalId(1)).unwrap();
    assert!(!is_free(&server, "secret"));
    lock.unlock_write(LocalId(1)).unwrap();
    assert!(eventually(|| is_free(&server, "secret")));
}

#[test]
fn plain_client_is_refused_by_encrypted_server() {
    let server = encrypted_server();
    let manager = LockManager::new(client_config(&server).with_password("pw")).unwrap();

    assert!(matches!(
        manager.connect(),
        Err(ClientError::Authentication(_))
    ));
}

#[test]
fn encrypting_client_is_refused_by_plain_server() {
    let server = start(ServerConfig::new(0).with_password("pw"));
    let manager =
        LockManager::new(client_config(&server).with_password("pw").with_encryption(true)).unwrap();

    assert!(matches!(
        manager.connect(),
        Err(ClientError::Authentication(_))
    ));
}

#[test]
fn wrong_key_is_an_authentication_failure() {
    let server = encrypted_server();
    let manager = LockManager::new(
        client_config(&server)
            .with_password("not-pw")
            .with_encryption(true),
    )
    .unwrap();

    assert!(matches!(
        manager.connect(),
        Err(ClientError::Authentication(_))
    ));
    assert!(server.registry().lock_names().is_empty());
}

#[test]
fn encryption_without_password_is_rejected_up_front() {
    assert!(ServerHandle::start(ServerConfig::new(0).with_encryption(true)).is_err());
    assert!(LockManager::new(ClientConfig::default().with_encryption(true)).is_err());
}
