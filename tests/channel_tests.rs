use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use lumenx::auth::{MemoryBackend, SessionStore};
use lumenx::channels::{ChannelConfig, ChannelManager};
use lumenx::core::kernel::ReqwestTransport;
use lumenx::{ChannelState, ClientError, CredentialMode};
use secrecy::Secret;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn make_token(sub: &str, expires_in_secs: i64) -> String {
    let exp = (Utc::now() + ChronoDuration::seconds(expires_in_secs)).timestamp();
    let claims = json!({
        "sub": sub,
        "role": "patient",
        "exp": exp,
        "iat": exp - 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"server-signing-key"),
    )
    .unwrap()
}

fn empty_store() -> Arc<SessionStore> {
    let transport = Arc::new(
        ReqwestTransport::new("http://127.0.0.1:9".to_string(), "test".to_string()).unwrap(),
    );
    Arc::new(SessionStore::new(
        Arc::new(MemoryBackend::new()),
        transport,
        CredentialMode::Local,
        Secret::new("test-storage-key".to_string()),
    ))
}

async fn seeded_store(sub: &str) -> Arc<SessionStore> {
    let store = empty_store();
    store.save(&make_token(sub, 3600), None, None).await.unwrap();
    store
}

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn wait_for_state(manager: &ChannelManager, want: ChannelState) {
    let mut rx = manager.watch_state();
    timeout(Duration::from_secs(10), async {
        loop {
            if *rx.borrow() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {}", want));
}

fn notification_frame(id: &str) -> Message {
    Message::Text(
        json!({
            "event": "notification",
            "data": {
                "Id": id,
                "Title": "Hello",
                "Message": "You have an update",
                "Category": "general",
                "Read": false,
                "CreatedAt": "2026-08-07T12:00:00Z",
            },
        })
        .to_string(),
    )
}

#[tokio::test]
async fn connects_joins_group_and_delivers_normalized_events() {
    let (listener, url) = bind_server().await;
    let (join_tx, mut join_rx) = mpsc::channel::<Value>(4);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let join: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        join_tx.send(join).await.unwrap();

        ws.send(notification_frame("n-1")).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let manager = ChannelManager::new(
        ChannelConfig::new("notifications", url),
        seeded_store("user-7").await,
    );
    let (event_tx, mut event_rx) = mpsc::channel::<Value>(4);
    let _subscription = manager.on("notification", move |payload| {
        let _ = event_tx.try_send(payload);
    });

    manager.connect("user-7").await.unwrap();

    let join = timeout(Duration::from_secs(5), join_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(join["action"], "join");
    assert_eq!(join["group"], "user:user-7");

    wait_for_state(&manager, ChannelState::Connected).await;

    let payload = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    // Wire fields arrive capitalized and are normalized before dispatch
    assert_eq!(payload["id"], "n-1");
    assert_eq!(payload["title"], "Hello");
    assert_eq!(payload["read"], false);

    manager.disconnect().await;
    assert_eq!(manager.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn reconnects_and_rejoins_before_delivering_further_events() {
    let (listener, url) = bind_server().await;
    let (join_tx, mut join_rx) = mpsc::channel::<Value>(4);

    tokio::spawn(async move {
        // First connection: take the join, then drop without a close frame
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let join: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        join_tx.send(join).await.unwrap();
        drop(ws);

        // Second connection: the group must be re-joined before any event
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let join: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        join_tx.send(join).await.unwrap();

        ws.send(notification_frame("after-reconnect")).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let manager = ChannelManager::new(
        ChannelConfig::new("notifications", url),
        seeded_store("user-7").await,
    );
    let (event_tx, mut event_rx) = mpsc::channel::<Value>(4);
    let _subscription = manager.on("notification", move |payload| {
        let _ = event_tx.try_send(payload);
    });

    manager.connect("user-7").await.unwrap();
    wait_for_state(&manager, ChannelState::Connected).await;

    let first_join = timeout(Duration::from_secs(5), join_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first_join["group"], "user:user-7");

    // The drop is followed by an immediate reconnect (first delay in the
    // schedule is zero), so the Reconnecting state can be too brief to
    // observe through the watch channel; the second join proves it happened.
    let second_join = timeout(Duration::from_secs(5), join_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_join["action"], "join");
    assert_eq!(second_join["group"], "user:user-7");

    let payload = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["id"], "after-reconnect");

    manager.disconnect().await;
}

#[tokio::test]
async fn exhausting_the_reconnect_budget_fails_the_channel() {
    // Bind then drop the listener so the port refuses connections
    let (listener, url) = bind_server().await;
    drop(listener);

    let config = ChannelConfig::new("notifications", url).backoff(vec![
        Duration::ZERO,
        Duration::from_millis(20),
        Duration::from_millis(20),
    ]);
    let manager = ChannelManager::new(config, seeded_store("user-7").await);

    manager.connect("user-7").await.unwrap();
    wait_for_state(&manager, ChannelState::Failed).await;

    // Failed is terminal until an explicit connect
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.state(), ChannelState::Failed);
}

#[tokio::test]
async fn connect_fails_fast_without_a_usable_credential() {
    let (_listener, url) = bind_server().await;

    let manager = ChannelManager::new(ChannelConfig::new("notifications", url.clone()), empty_store());
    let error = manager.connect("user-7").await.unwrap_err();
    assert!(matches!(error, ClientError::AuthenticationExpired));
    assert_eq!(manager.state(), ChannelState::Disconnected);

    // An expired credential is just as unusable
    let store = empty_store();
    store
        .save(&make_token("user-7", -60), None, None)
        .await
        .unwrap();
    let manager = ChannelManager::new(ChannelConfig::new("notifications", url), store);
    assert!(manager.connect("user-7").await.is_err());
}

#[tokio::test]
async fn concurrent_connects_coalesce_onto_one_connection() {
    let (listener, url) = bind_server().await;
    let (count_tx, mut count_rx) = mpsc::channel::<()>(8);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            count_tx.send(()).await.unwrap();
            tokio::spawn(async move {
                let mut ws = accept_async(stream).await.unwrap();
                while ws.next().await.is_some() {}
            });
        }
    });

    let manager = Arc::new(ChannelManager::new(
        ChannelConfig::new("notifications", url),
        seeded_store("user-7").await,
    ));

    let (a, b, c) = tokio::join!(
        manager.connect("user-7"),
        manager.connect("user-7"),
        manager.connect("user-7"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    wait_for_state(&manager, ChannelState::Connected).await;

    // Exactly one underlying connection was opened
    timeout(Duration::from_secs(5), count_rx.recv()).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), count_rx.recv()).await.is_err(),
        "duplicate connection spawned for coalesced connects"
    );

    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_cancels_a_pending_reconnect_timer_and_releases_handlers() {
    let (listener, url) = bind_server().await;
    drop(listener);

    // A very long delay after the first failed attempt
    let config = ChannelConfig::new("notifications", url)
        .backoff(vec![Duration::ZERO, Duration::from_secs(3600)]);
    let manager = ChannelManager::new(config, seeded_store("user-7").await);
    let _subscription = manager.on("notification", |_| {});

    manager.connect("user-7").await.unwrap();
    wait_for_state(&manager, ChannelState::Reconnecting).await;

    // Must return promptly despite the pending hour-long timer
    timeout(Duration::from_secs(2), manager.disconnect())
        .await
        .expect("disconnect did not cancel the pending reconnect timer");

    assert_eq!(manager.state(), ChannelState::Disconnected);
    assert_eq!(manager.dispatcher().handler_count("notification"), 0);
    assert!(manager.joined_groups().is_empty());
}
