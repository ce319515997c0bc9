//! Session broker integration tests.
//!
//! These tests run real kernel processes (`/bin/cat` and small `/bin/sh`
//! loops), so they only build on unix.

#![cfg(unix)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use knoboo::{
    Credentials, InMemoryDirectory, KernelSpec, KnobooError, NotebookRecord, PasswordChecker,
    PayloadKind, Portal, ProcessManager, ProcessManagerConfig, Realm, Role, ServerMessage,
    SessionManager, SessionManagerConfig, SessionState,
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_test::{assert_err, assert_ok};

/// Echoes every request line and exits with status 3 on a request mentioning "exit".
const CRASHY_KERNEL: &str =
    r#"while read -r line; do case "$line" in *exit*) exit 3;; esac; printf '%s\n' "$line"; done"#;

fn manager_with(spec: KernelSpec) -> Arc<SessionManager> {
    let portal = Portal::new(Realm::new()).with_checker(Arc::new(PasswordChecker::with_users([
        ("alice", "a"),
        ("bob", "b"),
        ("carol", "c"),
        ("dave", "d"),
    ])));
    let directory = InMemoryDirectory::new(spec).with_notebook(
        "nb1",
        NotebookRecord::new("alice").collaborator("bob").viewer("carol"),
    );
    let procman = Arc::new(ProcessManager::new(ProcessManagerConfig {
        grace: Duration::from_millis(300),
        ..Default::default()
    }));
    SessionManager::new(
        portal,
        Arc::new(directory),
        procman,
        SessionManagerConfig::default(),
    )
}

fn manager() -> Arc<SessionManager> {
    manager_with(KernelSpec::new("/bin/cat"))
}

async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound channel closed")
}

/// Skip input echoes and return the next non-echo frame.
async fn next_non_echo(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    loop {
        match next(rx).await {
            ServerMessage::Envelope(env) if env.kind == PayloadKind::Input => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_concurrent_attach_starts_one_kernel() {
    let manager = manager();

    let attaches = (0..8).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let attachment = manager
                .attach(tx, &"nb1".into(), &Credentials::password("alice", "a"))
                .await
                .unwrap();
            (attachment, rx)
        })
    });

    let mut processes = HashSet::new();
    let mut sessions = HashSet::new();
    let mut receivers = Vec::new();
    for handle in attaches {
        let (attachment, rx) = handle.await.unwrap();
        processes.insert(attachment.process);
        sessions.insert(attachment.session);
        receivers.push(rx);
    }

    assert_eq!(processes.len(), 1);
    assert_eq!(sessions.len(), 8);
    assert_eq!(manager.processes().count(), 1);
    assert_eq!(manager.session_count(), 8);
    manager.processes().shutdown().await;
}

#[tokio::test]
async fn test_collaborator_shares_kernel() {
    let manager = manager();
    let (atx, mut arx) = mpsc::unbounded_channel();
    let (btx, mut brx) = mpsc::unbounded_channel();

    let alice = manager
        .attach(atx, &"nb1".into(), &Credentials::password("alice", "a"))
        .await
        .unwrap();
    let bob = manager
        .attach(btx, &"nb1".into(), &Credentials::password("bob", "b"))
        .await
        .unwrap();
    next(&mut arx).await;
    next(&mut brx).await;

    assert_eq!(alice.process, bob.process);
    assert_eq!(bob.role, Role::Writer);
    let infos = manager.sessions().await.unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|info| info.state == SessionState::Active));

    // Output of bob's request reaches alice too, attributed to bob.
    manager.route(bob.session, json!("from bob"), None).await.unwrap();
    match next_non_echo(&mut arx).await {
        ServerMessage::Envelope(env) => {
            assert_eq!(env.kind, PayloadKind::Output);
            assert_eq!((env.session_id, env.sequence), (bob.session, 1));
            assert_eq!(env.payload, json!("from bob"));
        }
        other => panic!("Expected output envelope, got {:?}", other),
    }
    manager.processes().shutdown().await;
}

#[tokio::test]
async fn test_viewer_is_read_only() {
    let manager = manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let carol = manager
        .attach(tx, &"nb1".into(), &Credentials::password("carol", "c"))
        .await
        .unwrap();
    next(&mut rx).await;

    assert_eq!(carol.role, Role::Viewer);
    let err = assert_err!(manager.route(carol.session, json!("1+1"), None).await);
    assert!(matches!(err, KnobooError::ReadOnly));
    manager.processes().shutdown().await;
}

#[tokio::test]
async fn test_invalid_credentials_create_nothing() {
    let manager = manager();

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = manager
        .attach(tx, &"nb1".into(), &Credentials::password("alice", "wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUTHENTICATION_ERROR");

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = manager
        .attach(tx, &"nb1".into(), &Credentials::token("kb_unknown"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUTHENTICATION_ERROR");

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = manager
        .attach(tx, &"nb1".into(), &Credentials::password("dave", "d"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AUTHORIZATION_ERROR");

    assert_eq!(manager.session_count(), 0);
    assert_eq!(manager.processes().count(), 0);
}

#[tokio::test]
async fn test_session_output_is_fifo() {
    let manager = manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let alice = manager
        .attach(tx, &"nb1".into(), &Credentials::password("alice", "a"))
        .await
        .unwrap();
    next(&mut rx).await;

    for i in 1..=50u64 {
        let seq = assert_ok!(
            manager
                .route(alice.session, json!(format!("line {}", i)), None)
                .await
        );
        assert_eq!(seq, i);
    }

    for i in 1..=50u64 {
        match next_non_echo(&mut rx).await {
            ServerMessage::Envelope(env) => {
                assert_eq!(env.sequence, i);
                assert_eq!(env.payload, json!(format!("line {}", i)));
            }
            other => panic!("Expected output envelope, got {:?}", other),
        }
    }
    manager.processes().shutdown().await;
}

#[tokio::test]
async fn test_crash_notifies_and_restart_spawns_new_kernel() {
    let manager = manager_with(KernelSpec::new("/bin/sh").arg("-c").arg(CRASHY_KERNEL));
    let (atx, mut arx) = mpsc::unbounded_channel();
    let (ctx, mut crx) = mpsc::unbounded_channel();
    let alice = manager
        .attach(atx, &"nb1".into(), &Credentials::password("alice", "a"))
        .await
        .unwrap();
    let carol = manager
        .attach(ctx, &"nb1".into(), &Credentials::password("carol", "c"))
        .await
        .unwrap();
    next(&mut arx).await;
    next(&mut crx).await;
    assert_eq!(alice.process, carol.process);

    manager.route(alice.session, json!("exit"), None).await.unwrap();

    for rx in [&mut arx, &mut crx] {
        match next_non_echo(rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "PROCESS_CRASHED"),
            other => panic!("Expected crash notice, got {:?}", other),
        }
    }
    assert_eq!(manager.processes().count(), 0);
    assert!(manager.contains(alice.session));

    let restarted = manager.restart(alice.session).await.unwrap();
    assert_ne!(restarted, alice.process);
    match next(&mut arx).await {
        ServerMessage::Attached { process_id, .. } => assert_eq!(process_id, restarted),
        other => panic!("Expected Attached, got {:?}", other),
    }
    assert_eq!(manager.processes().count(), 1);

    manager.route(alice.session, json!("still here"), None).await.unwrap();
    match next_non_echo(&mut arx).await {
        ServerMessage::Envelope(env) => {
            assert_eq!(env.kind, PayloadKind::Output);
            assert_eq!(env.payload, json!("still here"));
        }
        other => panic!("Expected output envelope, got {:?}", other),
    }
    manager.processes().shutdown().await;
}
