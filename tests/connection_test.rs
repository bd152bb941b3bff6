use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use plugin_host::bridge::{InvokeEvent, IpcBridge};
use plugin_host::connection::{Connection, ConnectionError, ConnectionOptions, ConnectionState, WorkerSpawner};
use plugin_protocol::message::{LogLevel, LogMessage};
use plugin_protocol::{Envelope, MessageType, Worker, WorkerPort};
use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

fn raw_worker<F, Fut>(entry: F) -> impl WorkerSpawner
where
    F: Fn(WorkerPort) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    move |name: &str| Worker::spawn(name, entry.clone())
}

fn connect<S: WorkerSpawner>(call_timeout: Duration, spawner: S) -> Connection {
    Connection::new(
        ConnectionOptions::new("it").with_timeout(call_timeout),
        Arc::new(IpcBridge::new()),
        spawner,
    )
}

async fn next_request(port: &mut WorkerPort) -> Option<Envelope> {
    let raw = port.recv().await?;
    serde_json::from_value(raw).ok()
}

/// Replies to every request with its correlation id.
async fn id_echo(mut port: WorkerPort) -> anyhow::Result<()> {
    let sender = port.sender();
    sender.post_json(&Envelope::ready())?;
    while let Some(req) = next_request(&mut port).await {
        sender.post_json(&Envelope::response(req.id.clone(), json!(req.id)))?;
    }
    Ok(())
}

/// Never answers anything after `ready`.
async fn silent(mut port: WorkerPort) -> anyhow::Result<()> {
    port.sender().post_json(&Envelope::ready())?;
    while port.recv().await.is_some() {}
    Ok(())
}

#[tokio::test]
async fn sequential_messages_use_distinct_ids() {
    let conn = connect(Duration::from_secs(5), raw_worker(id_echo));
    conn.start().await.unwrap();

    let first = conn.send_message(MessageType::InitializePlugins, json!({})).await.unwrap();
    let second = conn.send_message(MessageType::InitializePlugins, json!({})).await.unwrap();
    assert_ne!(first, second);
    assert!(first.as_str().unwrap().starts_with("msg-"));
    conn.stop().await;
}

#[tokio::test]
async fn reversed_responses_resolve_their_own_calls() {
    let conn = connect(
        Duration::from_secs(5),
        raw_worker(|mut port: WorkerPort| async move {
            let sender = port.sender();
            sender.post_json(&Envelope::ready())?;
            let a = next_request(&mut port).await.ok_or_else(|| anyhow::anyhow!("no first request"))?;
            let b = next_request(&mut port).await.ok_or_else(|| anyhow::anyhow!("no second request"))?;
            sender.post_json(&Envelope::response(b.id, b.payload))?;
            sender.post_json(&Envelope::response(a.id, a.payload))?;
            while port.recv().await.is_some() {}
            Ok::<_, anyhow::Error>(())
        }),
    );
    conn.start().await.unwrap();

    let (a, b) = tokio::join!(
        conn.send_message(MessageType::InvokeExtension, json!("A")),
        conn.send_message(MessageType::InvokeExtension, json!("B")),
    );
    assert_eq!(a.unwrap(), json!("A"));
    assert_eq!(b.unwrap(), json!("B"));
    assert_eq!(conn.pending_calls(), 0);
    conn.stop().await;
}

#[tokio::test]
async fn unanswered_message_times_out_after_the_configured_duration() {
    let call_timeout = Duration::from_millis(80);
    let conn = connect(call_timeout, raw_worker(silent));
    conn.start().await.unwrap();

    let started = Instant::now();
    let err = conn.send_message(MessageType::DisposePlugins, Value::Null).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed >= call_timeout, "timed out early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "timed out late: {elapsed:?}");
    match err {
        ConnectionError::Timeout { id, timeout_ms } => {
            assert!(id.starts_with("msg-"));
            assert_eq!(timeout_ms, 80);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(conn.pending_calls(), 0);
    conn.stop().await;
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let conn = connect(
        Duration::from_millis(100),
        raw_worker(|mut port: WorkerPort| async move {
            let sender = port.sender();
            sender.post_json(&Envelope::ready())?;
            while let Some(req) = next_request(&mut port).await {
                if req.payload == json!("slow") {
                    sleep(Duration::from_millis(200)).await;
                }
                sender.post_json(&Envelope::response(req.id, req.payload))?;
            }
            Ok::<_, anyhow::Error>(())
        }),
    );
    conn.start().await.unwrap();

    let err = conn.send_message(MessageType::InvokeExtension, json!("slow")).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout { .. }));

    // let the late reply land first
    sleep(Duration::from_millis(200)).await;
    let out = conn.send_message(MessageType::InvokeExtension, json!("fast")).await.unwrap();
    assert_eq!(out, json!("fast"));
    assert_eq!(conn.state(), ConnectionState::Running);
    conn.stop().await;
}

#[tokio::test]
async fn cancelled_messages_leave_nothing_pending() {
    let conn = connect(Duration::from_millis(100), raw_worker(silent));
    conn.start().await.unwrap();

    for _ in 0..3 {
        let cancelled = timeout(
            Duration::from_millis(10),
            conn.send_message(MessageType::InitializePlugins, json!({})),
        )
        .await;
        assert!(cancelled.is_err());
    }
    assert_eq!(conn.pending_calls(), 0);

    // well past the call timeout nothing has come back either
    sleep(Duration::from_millis(300)).await;
    assert_eq!(conn.pending_calls(), 0);
    assert_eq!(conn.state(), ConnectionState::Running);
    conn.stop().await;
}

#[tokio::test]
async fn message_while_starting_is_not_started() {
    let conn = connect(
        Duration::from_secs(5),
        raw_worker(|port: WorkerPort| async move {
            sleep(Duration::from_millis(150)).await;
            id_echo(port).await
        }),
    );

    let starter = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.start().await })
    };
    let mut states = conn.watch_state();
    states.wait_for(|s| *s == ConnectionState::Starting).await.unwrap();

    let err = conn.send_message(MessageType::RegisterPlugin, json!({})).await.unwrap_err();
    assert!(matches!(err, ConnectionError::NotStarted));

    starter.await.unwrap().unwrap();
    assert!(conn.send_message(MessageType::RegisterPlugin, json!({})).await.is_ok());
    conn.stop().await;
}

#[tokio::test]
async fn concurrent_starts_share_one_worker() {
    let conn = connect(Duration::from_secs(5), raw_worker(id_echo));
    let (a, b) = tokio::join!(conn.start(), conn.start());
    a.unwrap();
    b.unwrap();
    assert_eq!(conn.state(), ConnectionState::Running);
    conn.stop().await;
}

#[tokio::test]
async fn stop_rejects_pending_calls() {
    let conn = connect(Duration::from_secs(30), raw_worker(silent));
    conn.start().await.unwrap();

    let call = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send_message(MessageType::InitializePlugins, json!({})).await })
    };
    timeout(Duration::from_secs(5), async {
        while conn.pending_calls() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    conn.stop().await;
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionClosed));
    assert_eq!(conn.state(), ConnectionState::Stopped);
    assert_eq!(conn.pending_calls(), 0);
}

#[tokio::test]
async fn worker_crash_rejects_pending_calls_and_stops() {
    let conn = connect(
        Duration::from_secs(30),
        raw_worker(|mut port: WorkerPort| async move {
            port.sender().post_json(&Envelope::ready())?;
            let _ = port.recv().await;
            Err::<(), _>(anyhow::anyhow!("loader crashed"))
        }),
    );
    conn.start().await.unwrap();

    let err = conn.send_message(MessageType::InitializePlugins, json!({})).await.unwrap_err();
    assert!(matches!(err, ConnectionError::ConnectionClosed));

    let mut states = conn.watch_state();
    timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Stopped))
        .await
        .unwrap()
        .unwrap();

    // a crashed connection can be started again
    conn.start().await.unwrap();
    conn.stop().await;
}

#[tokio::test]
async fn malformed_messages_and_logs_do_not_break_dispatch() {
    let conn = connect(
        Duration::from_secs(5),
        raw_worker(|port: WorkerPort| async move {
            let sender = port.sender();
            sender.post(json!("not an object"))?;
            sender.post(json!({"type": "log", "level": "shout", "message": "bad level"}))?;
            sender.post(json!({"type": "ipc-call", "id": "x", "channel": "echo"}))?;
            sender.post(json!({"type": "response", "id": "nobody-waits", "payload": 1}))?;
            sender.post_json(&LogMessage::new(LogLevel::Info, "booting").with_context("loader"))?;
            id_echo(port).await
        }),
    );
    conn.start().await.unwrap();
    assert!(conn.send_message(MessageType::InitializePlugins, json!({})).await.is_ok());
    conn.stop().await;
}

#[tokio::test]
async fn repeated_ready_is_harmless() {
    let conn = connect(
        Duration::from_secs(5),
        raw_worker(|port: WorkerPort| async move {
            port.sender().post_json(&Envelope::ready())?;
            id_echo(port).await
        }),
    );
    conn.start().await.unwrap();
    assert!(conn.send_message(MessageType::InitializePlugins, json!({})).await.is_ok());
    assert_eq!(conn.state(), ConnectionState::Running);
    conn.stop().await;
}

#[tokio::test]
async fn ipc_calls_before_ready_are_served() {
    use plugin_protocol::message::{IpcCallMessage, IpcResponseMessage};

    let bridge = Arc::new(IpcBridge::new());
    bridge
        .register("echo", |_e: InvokeEvent, args: Vec<Value>| async move {
            Ok::<_, anyhow::Error>(args.into_iter().next().unwrap_or(Value::Null))
        })
        .unwrap();

    let conn = Connection::new(
        ConnectionOptions::new("early").with_timeout(Duration::from_secs(5)),
        bridge,
        raw_worker(|mut port: WorkerPort| async move {
            let sender = port.sender();
            sender.post_json(&IpcCallMessage::new("ipc-early", "echo", vec![json!("before ready")]))?;
            let raw = port.recv().await.ok_or_else(|| anyhow::anyhow!("host went away"))?;
            let resp: IpcResponseMessage = serde_json::from_value(raw)?;
            anyhow::ensure!(resp.result == Some(json!("before ready")), "unexpected {resp:?}");
            id_echo(port).await
        }),
    );
    conn.start().await.unwrap();
    assert!(conn.send_message(MessageType::InitializePlugins, json!({})).await.is_ok());
    conn.stop().await;
}
