//! End-to-end tests of the link stack over the mock transport.
//!
//! Every test runs with a paused clock, so timeouts, pacing and reconnect
//! ticks advance deterministically.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use vaultlink_core::store::{LAST_DEVICE_KEY, PASSPHRASE_KEY};
use vaultlink_core::{
    Command, ConnectDisposition, ConnectionState, DeviceLink, Error, KeyValueStore, LinkConfig,
    LinkEvent, MemoryStore, MockTransport, Response, ResponseKind, ScanDisposition,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Fixture {
    mock: Arc<MockTransport>,
    store: Arc<MemoryStore>,
    link: DeviceLink,
}

fn fixture(store: MemoryStore) -> Fixture {
    init_tracing();
    let mock = Arc::new(MockTransport::builder().address("AA:BB").build());
    let store = Arc::new(store);
    let link = DeviceLink::new(
        mock.clone(),
        store.clone() as Arc<dyn KeyValueStore>,
        LinkConfig::default(),
    )
    .unwrap();
    Fixture { mock, store, link }
}

async fn connected(store: MemoryStore) -> Fixture {
    let f = fixture(store);
    assert_eq!(
        f.link.handle().connect(f.mock.peripheral()).await.unwrap(),
        ConnectDisposition::Started
    );
    f.link
        .handle()
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    f
}

async fn next_event(events: &mut vaultlink_core::EventReceiver, kind: &str) -> LinkEvent {
    loop {
        let event = events.recv().await.unwrap();
        if event.kind() == kind {
            return event;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_commands_complete_in_order() {
    let f = connected(MemoryStore::new()).await;
    f.mock.set_chunk_delay(Duration::from_millis(30));
    f.mock.respond_with(|cmd| {
        let body = format!(r#"{{"echo":{}}}"#, cmd.param("n").unwrap());
        Some(vec![body.into_bytes()])
    });

    let pending: Vec<_> = (0..8)
        .map(|n| f.link.queue().request(Command::new("list").with_param("n", n)))
        .collect();
    let results = futures::future::join_all(pending).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().into_json(), json!({ "echo": n }));
    }
    let sent: Vec<_> = f
        .mock
        .commands()
        .iter()
        .map(|c| c.param("n").cloned().unwrap())
        .collect();
    assert_eq!(sent, (0..8).map(|n| json!(n)).collect::<Vec<_>>());
    assert!(!f.mock.overlap_detected());
}

#[tokio::test(start_paused = true)]
async fn test_commands_from_many_tasks_never_overlap() {
    let f = connected(MemoryStore::new()).await;
    f.mock.set_chunk_delay(Duration::from_millis(10));
    f.mock.respond_with(|_| {
        Some(vec![
            b"21,2,10\n{\"status\"".to_vec(),
            b":\"success\"}".to_vec(),
        ])
    });

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let client = f.link.client().clone();
            tokio::spawn(async move { client.list().await })
        })
        .collect();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.into_json(), json!({"status": "success"}));
    }
    assert_eq!(f.mock.command_names().len(), 5);
    assert!(!f.mock.overlap_detected());
}

#[tokio::test(start_paused = true)]
async fn test_three_fragment_reassembly() {
    let f = connected(MemoryStore::new()).await;
    f.mock.respond_with(|_| {
        Some(vec![
            b"28,3,10\n".to_vec(),
            br#"{"part1":"hello""#.to_vec(),
            br#","part2":"worl"#.to_vec(),
            br#"d"}"#.to_vec(),
        ])
    });

    let response = f.link.client().list().await.unwrap();
    assert_eq!(
        response.into_json(),
        json!({"part1": "hello", "part2": "world"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_header_concatenated_with_first_fragment() {
    let f = connected(MemoryStore::new()).await;
    f.mock.respond_with(|_| {
        Some(vec![
            b"28,3,10\n{\"part1\":\"hello\"".to_vec(),
            br#","part2":"worl"#.to_vec(),
            br#"d"}"#.to_vec(),
        ])
    });

    let response = f.link.client().list().await.unwrap();
    assert_eq!(
        response.into_json(),
        json!({"part1": "hello", "part2": "world"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_headerless_raw_text() {
    let f = connected(MemoryStore::new()).await;
    f.mock
        .respond_with(|_| Some(vec![b"this is not a header".to_vec()]));

    let response = f
        .link
        .queue()
        .submit(Command::new("dumpOne"), Duration::from_secs(5), ResponseKind::RawText)
        .await
        .unwrap();
    assert_eq!(response, Response::Text("this is not a header".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_single_chunk_resolves_without_waiting() {
    let f = connected(MemoryStore::new()).await;
    f.mock
        .respond_with(|_| Some(vec![b"21,1,21\n{\"status\":\"success\"}".to_vec()]));

    let started = Instant::now();
    let response = f.link.client().reset().await.unwrap();
    assert_eq!(response.into_json(), json!({"status": "success"}));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_single_chunk_in_next_notification() {
    let f = connected(MemoryStore::new()).await;
    f.mock.respond_with(|_| {
        Some(vec![
            b"21,1,21\n".to_vec(),
            b"{\"status\":\"success\"}".to_vec(),
        ])
    });

    let response = f.link.client().reset().await.unwrap();
    assert_eq!(response.into_json(), json!({"status": "success"}));
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_response_times_out() {
    let f = connected(MemoryStore::new()).await;
    f.mock.respond_with(|cmd| match cmd.name() {
        "fetchPass" => Some(vec![b"30,3,10\n{\"id\":1,".to_vec(), b"\"name\":\"a".to_vec()]),
        _ => Some(vec![b"{\"status\":\"success\"}".to_vec()]),
    });

    let timeout = Duration::from_secs(3);
    let started = Instant::now();
    let err = f
        .link
        .queue()
        .submit(Command::new("fetchPass").with_param("id", 1), timeout, ResponseKind::Structured)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() >= timeout);

    // The partial buffer must not leak into the next response.
    let next = f.link.client().list().await.unwrap();
    assert_eq!(next.into_json(), json!({"status": "success"}));
}

#[tokio::test(start_paused = true)]
async fn test_state_resets_after_malformed_response() {
    let f = connected(MemoryStore::new()).await;
    f.mock.respond_with(|cmd| match cmd.name() {
        "list" => Some(vec![b"12,1,12\n{not json!!}".to_vec()]),
        _ => Some(vec![b"16,1,16\n{\"status\":\"ok\"}".to_vec()]),
    });

    let err = f.link.client().list().await.unwrap_err();
    match err {
        Error::MalformedResponse { raw, .. } => assert_eq!(raw, "{not json!!}"),
        other => panic!("unexpected error: {other}"),
    }
    let ok = f.link.client().fetch_entry(2).await.unwrap();
    assert_eq!(ok.into_json(), json!({"status": "ok"}));
}

#[tokio::test(start_paused = true)]
async fn test_manual_scan_excludes_reconnect() {
    let f = fixture(MemoryStore::with_values([(LAST_DEVICE_KEY, "CC:DD")]));
    let handle = f.link.handle();
    let mut events = handle.events();

    next_event(&mut events, "reconnect_attempt").await;
    next_event(&mut events, "scan_started").await;

    // The reconnect scan is stopped before the manual scan begins.
    assert_eq!(handle.start_scan().await.unwrap(), ScanDisposition::Started);
    let LinkEvent::ScanFinished { manual, .. } = next_event(&mut events, "scan_finished").await
    else {
        unreachable!();
    };
    assert!(!manual);
    let LinkEvent::ScanStarted { manual } = next_event(&mut events, "scan_started").await else {
        unreachable!();
    };
    assert!(manual);

    // Several reconnect intervals pass while the manual scan runs.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let scans_before = f.mock.scan_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(f.mock.scan_count(), scans_before);
    assert_eq!(f.mock.max_concurrent_scans(), 1);

    handle.stop_scan().await.unwrap();
    assert_eq!(f.mock.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_scan_right_after_reconnect_scan() {
    let f = fixture(MemoryStore::with_values([(LAST_DEVICE_KEY, "CC:DD")]));
    let handle = f.link.handle();
    let mut events = handle.events();

    for _ in 0..5 {
        while !matches!(
            next_event(&mut events, "scan_finished").await,
            LinkEvent::ScanFinished { manual: false, .. }
        ) {}
        assert_eq!(handle.start_scan().await.unwrap(), ScanDisposition::Started);
        handle.stop_scan().await.unwrap();
    }
    assert_eq!(f.mock.max_concurrent_scans(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_remote_disconnect() {
    let f = connected(MemoryStore::new()).await;
    f.mock.set_scan_results(vec![f.mock.peripheral()]);
    assert_eq!(f.store.get(LAST_DEVICE_KEY).as_deref(), Some("AA:BB"));

    f.mock.simulate_disconnect();
    f.link
        .handle()
        .wait_for_state(ConnectionState::Disconnected)
        .await
        .unwrap();
    f.link
        .handle()
        .wait_for_state(ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(f.mock.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_runs_after_connect() {
    let f = fixture(MemoryStore::with_values([(PASSPHRASE_KEY, "hunter2")]));
    f.mock.respond_with(|cmd| match cmd.name() {
        "passphrase" => Some(vec![b"{\"status\":\"success\"}".to_vec()]),
        _ => None,
    });
    let mut events = f.link.events();

    f.link.handle().connect(f.mock.peripheral()).await.unwrap();
    next_event(&mut events, "authenticated").await;

    assert_eq!(f.link.handle().state(), ConnectionState::Connected);
    assert_eq!(
        f.mock.commands(),
        vec![Command::new("passphrase").with_param("p", "hunter2")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_authentication_fails_closed() {
    let f = fixture(MemoryStore::with_values([(PASSPHRASE_KEY, "wrong")]));
    f.mock
        .respond_with(|_| Some(vec![b"{\"error\":\"Invalid passphrase\"}".to_vec()]));
    let mut events = f.link.events();

    f.link.handle().connect(f.mock.peripheral()).await.unwrap();
    next_event(&mut events, "authentication_failed").await;

    assert_eq!(f.link.handle().state(), ConnectionState::Disconnected);
    let err = f.link.client().list().await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_silent_authentication_times_out_and_fails_closed() {
    let f = fixture(MemoryStore::with_values([(PASSPHRASE_KEY, "secret")]));
    f.mock.respond_with(|_| None);
    let mut events = f.link.events();

    f.link.handle().connect(f.mock.peripheral()).await.unwrap();
    let event = next_event(&mut events, "authentication_failed").await;
    let LinkEvent::AuthenticationFailed { error, .. } = event else {
        unreachable!();
    };
    assert!(error.contains("timed out"));
    assert_eq!(f.link.handle().state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_suppression_during_restore() {
    let f = connected(MemoryStore::new()).await;
    f.mock
        .respond_with(|_| Some(vec![b"{\"status\":\"success\"}".to_vec()]));

    {
        let _guard = f.link.client().suppress_notifications();
        let err = f
            .link
            .queue()
            .submit(
                Command::new("restoreOne").with_param("uid", 1),
                Duration::from_secs(1),
                ResponseKind::Structured,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    let response = f.link.client().restore_entry(1, "blob").await.unwrap();
    assert_eq!(response.into_json(), json!({"status": "success"}));
}
