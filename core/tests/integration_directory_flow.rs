//! Directory and session integration tests over the in-process bus
//!
//! Each test starts a directory on a fresh `MemoryBus` and drives it with
//! real `ClientSession`s, or with raw links where the exact wire text matters.
//!
//! Run with: cargo test --test integration_directory_flow

use parley_core::directory::REQUEST_ACTIONS;
use parley_core::session::CandidateList;
use parley_core::topic::any_user;
use parley_core::{
    ClientSession, DirectoryServer, DirectoryService, InboxMessage, MemoryBus, RegisterFailure,
    RejectReason, RelayStatus, Resolution, ResolveMode, SessionConfig, SessionError, SessionEvent,
    Transport, UsernameProvider,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

struct Directory {
    bus: MemoryBus,
    service: Arc<DirectoryService>,
    _stop: watch::Sender<bool>,
}

async fn start_directory() -> Directory {
    let bus = MemoryBus::new();
    let (link, inbound) = bus.connect();
    let service = Arc::new(DirectoryService::new());
    let server = DirectoryServer::new(Arc::clone(&service));
    let (stop, stop_rx) = watch::channel(false);

    let transport: Arc<dyn Transport> = Arc::new(link);
    tokio::spawn(async move { server.run(transport, inbound, stop_rx).await });
    // let the runner install its subscriptions
    tokio::time::sleep(Duration::from_millis(10)).await;

    Directory {
        bus,
        service,
        _stop: stop,
    }
}

/// Like `start_directory`, but the first registration is held for `delay`
/// before it is processed.
async fn start_slow_directory(delay: Duration) -> Directory {
    let bus = MemoryBus::new();
    let (link, mut inbound) = bus.connect();
    for action in REQUEST_ACTIONS {
        link.subscribe(&any_user(action)).await.unwrap();
    }
    let service = Arc::new(DirectoryService::new());
    let server = DirectoryServer::new(Arc::clone(&service));
    let (stop, _) = watch::channel(false);

    tokio::spawn(async move {
        let mut held = false;
        while let Some(delivery) = inbound.recv().await {
            if !held && delivery.topic.ends_with("/register") {
                held = true;
                tokio::time::sleep(delay).await;
            }
            server.process(&link, delivery).await;
        }
    });

    Directory {
        bus,
        service,
        _stop: stop,
    }
}

fn fast_config(download_dir: &Path) -> SessionConfig {
    SessionConfig {
        register_timeout: Duration::from_millis(500),
        resolve_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        flush_grace: Duration::from_millis(10),
        download_dir: download_dir.to_path_buf(),
    }
}

async fn join(
    directory: &Directory,
    name: &str,
    config: SessionConfig,
) -> (ClientSession, mpsc::UnboundedReceiver<SessionEvent>) {
    let (link, inbound) = directory.bus.connect();
    let mut provider = CandidateList::new([name]);
    ClientSession::establish(Arc::new(link), inbound, &mut provider, config)
        .await
        .expect("registration should succeed")
}

/// Wait for the first event matching `pred`, skipping others
async fn expect_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Publish raw text and return the first payload seen on `reply_channel`
async fn raw_exchange(bus: &MemoryBus, reply_channel: &str, topic: &str, payload: &str) -> String {
    let (link, mut inbound) = bus.connect();
    link.subscribe(reply_channel).await.unwrap();
    link.publish(topic, payload.as_bytes().to_vec()).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("no reply")
        .expect("link closed");
    String::from_utf8(delivery.payload).unwrap()
}

async fn wait_until_gone(service: &DirectoryService, username: &str) {
    for _ in 0..100 {
        if !service.is_connected(username) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{username} was never removed from the directory");
}

#[tokio::test]
async fn test_register_success_text() {
    let directory = start_directory().await;

    let reply = raw_exchange(
        &directory.bus,
        "chat/alice/register_result/sess-1",
        "chat/alice/register",
        "sess-1",
    )
    .await;

    assert_eq!(reply, "SUCCESS: Registered as alice with ID sess-1");
    assert!(directory.service.is_connected("alice"));
}

#[tokio::test]
async fn test_session_registers_and_subscribes() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();

    let (alice, _events) = join(&directory, "alice", fast_config(dir.path())).await;

    assert!(alice.is_registered());
    assert_eq!(alice.identity().inbox_address, "chat/alice/inbox");
    let entry = directory.service.lookup("alice").unwrap();
    assert_eq!(entry.session_id, alice.identity().session_id);
}

#[tokio::test]
async fn test_duplicate_username_rejected_and_retried() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _alice_events) = join(&directory, "alice", fast_config(dir.path())).await;

    let reply = raw_exchange(
        &directory.bus,
        "chat/alice/register_result/other",
        "chat/alice/register",
        "other",
    )
    .await;
    assert_eq!(reply, "ERROR: Username alice already connected.");

    struct Retry {
        names: Vec<&'static str>,
        failures: Vec<Option<RegisterFailure>>,
    }

    #[async_trait::async_trait]
    impl UsernameProvider for Retry {
        async fn next_candidate(&mut self, last: Option<&RegisterFailure>) -> Option<String> {
            self.failures.push(last.cloned());
            if self.names.is_empty() {
                None
            } else {
                Some(self.names.remove(0).to_string())
            }
        }
    }

    let (link, inbound) = directory.bus.connect();
    let mut provider = Retry {
        names: vec!["alice", "bob2"],
        failures: Vec::new(),
    };
    let (bob2, _events) =
        ClientSession::establish(Arc::new(link), inbound, &mut provider, fast_config(dir.path()))
            .await
            .unwrap();

    assert_eq!(bob2.username().as_str(), "bob2");
    assert_eq!(
        provider.failures,
        vec![
            None,
            Some(RegisterFailure::Rejected(RejectReason::AlreadyConnected))
        ]
    );

    // alice's entry still belongs to the first session
    let entry = directory.service.lookup("alice").unwrap();
    assert_eq!(entry.session_id, alice.identity().session_id);
}

#[tokio::test]
async fn test_resolve_unknown_user() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();

    let reply = raw_exchange(
        &directory.bus,
        "chat/alice/address_reply",
        "chat/alice/get_address",
        "carol",
    )
    .await;
    assert_eq!(reply, "carol:NOT_FOUND");

    let (alice, mut events) = join(&directory, "alice", fast_config(dir.path())).await;
    let result = alice.resolve_address("carol", ResolveMode::Broadcast).await;
    assert!(matches!(result, Err(SessionError::TimedOut(ref name)) if name == "carol"));

    expect_event(&mut events, |e| {
        matches!(e, SessionEvent::AddressResolved { name, resolution: Resolution::NotFound, .. } if name == "carol")
    })
    .await;
}

#[tokio::test]
async fn test_resolve_timeout_is_bounded() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let config = fast_config(dir.path());
    let timeout = config.resolve_timeout;
    let (alice, _events) = join(&directory, "alice", config).await;

    let started = Instant::now();
    let result = alice.resolve_address("nobody", ResolveMode::Targeted).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SessionError::TimedOut(_))));
    assert!(elapsed >= timeout, "returned too early: {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_secs(1), "took too long: {elapsed:?}");
}

#[tokio::test]
async fn test_register_then_resolve_returns_inbox() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;
    let (_bob, _b) = join(&directory, "bob", fast_config(dir.path())).await;

    let address = alice
        .resolve_address("bob", ResolveMode::Targeted)
        .await
        .unwrap();
    assert_eq!(address, "chat/bob/inbox");
    assert_eq!(alice.cached_address("bob").as_deref(), Some("chat/bob/inbox"));
}

#[tokio::test]
async fn test_broadcast_resolve_also_caches_own_address() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;
    let (_bob, _b) = join(&directory, "bob", fast_config(dir.path())).await;

    alice
        .resolve_address("bob", ResolveMode::Broadcast)
        .await
        .unwrap();

    // the second reply may trail the first one
    for _ in 0..50 {
        if alice.cached_address("alice").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let names: Vec<String> = alice.known_peers().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_file_transfer_is_byte_identical() {
    let directory = start_directory().await;
    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(alice_dir.path())).await;
    let (_bob, mut bob_events) = join(&directory, "bob", fast_config(bob_dir.path())).await;

    let original: Vec<u8> = (0u8..37).map(|b| b.wrapping_mul(7)).collect();
    let source = alice_dir.path().join("report.pdf");
    std::fs::write(&source, &original).unwrap();

    alice
        .resolve_address("bob", ResolveMode::Targeted)
        .await
        .unwrap();
    let sent = alice.send_file("bob", &source).await.unwrap();
    assert_eq!(sent, 37);

    let event = expect_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::FileReceived { .. })
    })
    .await;
    let SessionEvent::FileReceived {
        sender,
        filename,
        saved_to,
        bytes,
    } = event
    else {
        unreachable!()
    };

    assert_eq!(sender, "alice");
    assert_eq!(filename, "report.pdf");
    assert_eq!(bytes, 37);
    assert_eq!(saved_to, bob_dir.path().join("received_report.pdf"));
    assert_eq!(std::fs::read(saved_to).unwrap(), original);
}

#[tokio::test]
async fn test_send_file_errors() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;

    let missing = alice.send_file("bob", &dir.path().join("nope.txt")).await;
    assert!(matches!(missing, Err(SessionError::File(_))));

    let present = dir.path().join("notes.txt");
    std::fs::write(&present, b"hi").unwrap();
    let unresolved = alice.send_file("bob", &present).await;
    assert!(matches!(unresolved, Err(SessionError::PeerUnreachable(ref p)) if p == "bob"));
}

#[tokio::test]
async fn test_disconnect_removes_entry() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;
    let (bob, mut bob_events) = join(&directory, "bob", fast_config(dir.path())).await;

    alice.shutdown().await.unwrap();
    assert!(!alice.is_registered());
    wait_until_gone(&directory.service, "alice").await;

    let result = bob.resolve_address("alice", ResolveMode::Targeted).await;
    assert!(matches!(result, Err(SessionError::TimedOut(_))));
    expect_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::AddressResolved { resolution: Resolution::NotFound, .. })
    })
    .await;

    // the name is free again
    let (again, _events) = join(&directory, "alice", fast_config(dir.path())).await;
    assert!(again.is_registered());
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;

    alice.shutdown().await.unwrap();
    alice.shutdown().await.unwrap();
    wait_until_gone(&directory.service, "alice").await;
    assert!(matches!(
        alice.send_plain("bob", "hi").await,
        Err(SessionError::ShutDown)
    ));
    assert_eq!(directory.service.stats().disconnects, 1);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_resolve() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        resolve_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(10),
        ..fast_config(dir.path())
    };
    let (alice, _a) = join(&directory, "alice", config).await;
    let alice = Arc::new(alice);

    let resolver = Arc::clone(&alice);
    let pending =
        tokio::spawn(async move { resolver.resolve_address("ghost", ResolveMode::Targeted).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    alice.shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("resolve did not observe shutdown")
        .unwrap();

    assert!(matches!(result, Err(SessionError::TimedOut(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_server_relay_delivers_and_confirms() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut alice_events) = join(&directory, "alice", fast_config(dir.path())).await;
    let (_bob, mut bob_events) = join(&directory, "bob", fast_config(dir.path())).await;

    alice.send_plain("bob", "hello").await.unwrap();

    let received = expect_event(&mut bob_events, |e| matches!(e, SessionEvent::Message(_))).await;
    assert_eq!(
        received,
        SessionEvent::Message(InboxMessage::ViaServer {
            sender: "alice".into(),
            text: "hello".into(),
        })
    );

    let status = expect_event(&mut alice_events, |e| matches!(e, SessionEvent::RelayStatus(_))).await;
    assert_eq!(
        status,
        SessionEvent::RelayStatus(RelayStatus::Delivered {
            target: "bob".into()
        })
    );
}

#[tokio::test]
async fn test_relay_wire_text() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (_bob, _b) = join(&directory, "bob", fast_config(dir.path())).await;

    let (spy, mut spy_rx) = directory.bus.connect();
    spy.subscribe("chat/bob/inbox").await.unwrap();

    let confirmation = raw_exchange(
        &directory.bus,
        "chat/alice/get_message",
        "chat/alice/send_message",
        "bob:hello",
    )
    .await;
    assert_eq!(
        confirmation,
        "Message was sent to bob via the server successfully."
    );

    let inbox = spy_rx.recv().await.unwrap();
    assert_eq!(inbox.payload, b"[Via server] alice:hello");
}

#[tokio::test]
async fn test_relay_to_missing_user_reports_not_found() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut events) = join(&directory, "alice", fast_config(dir.path())).await;

    alice.send_plain("carol", "anyone there?").await.unwrap();
    let status = expect_event(&mut events, |e| matches!(e, SessionEvent::RelayStatus(_))).await;
    assert_eq!(
        status,
        SessionEvent::RelayStatus(RelayStatus::NotFound {
            target: "carol".into()
        })
    );
    assert_eq!(directory.service.stats().relays_not_found, 1);
}

#[tokio::test]
async fn test_direct_message_needs_resolved_address() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;
    let (_bob, mut bob_events) = join(&directory, "bob", fast_config(dir.path())).await;

    assert!(matches!(
        alice.send_direct("bob", "psst").await,
        Err(SessionError::PeerUnreachable(_))
    ));

    alice
        .resolve_address("bob", ResolveMode::Targeted)
        .await
        .unwrap();
    alice.send_direct("bob", "psst: it's me").await.unwrap();

    let received = expect_event(&mut bob_events, |e| matches!(e, SessionEvent::Message(_))).await;
    assert_eq!(
        received,
        SessionEvent::Message(InboxMessage::Direct {
            sender: "alice".into(),
            text: "psst: it's me".into(),
        })
    );
}

#[tokio::test]
async fn test_malformed_requests_do_not_stop_directory() {
    let directory = start_directory().await;
    let (link, _rx) = directory.bus.connect();

    link.publish("chat/alice/send_message", b"no separator".to_vec())
        .await
        .unwrap();
    link.publish("chat/alice/disconnect", b"BYE".to_vec())
        .await
        .unwrap();
    link.publish("chat/alice/register", vec![0xff, 0xfe])
        .await
        .unwrap();

    let reply = raw_exchange(
        &directory.bus,
        "chat/dave/register_result/s9",
        "chat/dave/register",
        "s9",
    )
    .await;
    assert!(reply.starts_with("SUCCESS:"));
    assert_eq!(directory.service.stats().malformed_dropped, 3);
}

#[tokio::test]
async fn test_transport_loss_is_reported() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, mut events) = join(&directory, "alice", fast_config(dir.path())).await;

    directory.bus.sever();

    let event = expect_event(&mut events, |e| matches!(e, SessionEvent::TransportLost)).await;
    assert_eq!(event, SessionEvent::TransportLost);
    assert!(!alice.is_registered());
    // nothing left to notify; shutdown still completes
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_name_accepted_after_timeout_is_released() {
    let directory = start_slow_directory(Duration::from_millis(300)).await;
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        register_timeout: Duration::from_millis(200),
        ..fast_config(dir.path())
    };

    let (link, inbound) = directory.bus.connect();
    let mut provider = CandidateList::new(["alice", "alice2"]);
    let (session, _events) = ClientSession::establish(Arc::new(link), inbound, &mut provider, config)
        .await
        .expect("second candidate should register");

    assert_eq!(session.username().as_str(), "alice2");
    wait_until_gone(&directory.service, "alice").await;
    assert!(directory.service.is_connected("alice2"));
    assert_eq!(directory.service.connected_users(), vec!["alice2".to_string()]);
}

#[tokio::test]
async fn test_resolve_after_peer_left_ignores_cached_address() {
    let directory = start_directory().await;
    let dir = tempfile::tempdir().unwrap();
    let (alice, _a) = join(&directory, "alice", fast_config(dir.path())).await;
    let (bob, _b) = join(&directory, "bob", fast_config(dir.path())).await;

    alice
        .resolve_address("bob", ResolveMode::Targeted)
        .await
        .unwrap();
    bob.shutdown().await.unwrap();
    wait_until_gone(&directory.service, "bob").await;

    let result = alice.resolve_address("bob", ResolveMode::Broadcast).await;
    assert!(matches!(result, Err(SessionError::TimedOut(ref name)) if name == "bob"));
    assert!(alice.cached_address("bob").is_none());

    let sent = alice.send_direct("bob", "still there?").await;
    assert!(matches!(sent, Err(SessionError::PeerUnreachable(ref p)) if p == "bob"));
}
