use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use clipshare_client::{ClientError, ClipboardClient, ReceivedContent};
use clipshare_codec::RoomCodec;
use clipshare_crypto::{Cipher, keys::generate_key};
use clipshare_db::Database;
use clipshare_gateway::connection::handle_connection;
use clipshare_gateway::hub::Hub;
use clipshare_store::RoomStore;
use clipshare_types::events::{HubCommand, HubEvent};
use clipshare_types::models::{ConnectionId, ConnectionState};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn hub() -> anyhow::Result<Hub> {
    let store = RoomStore::new(
        Database::open_in_memory()?,
        RoomCodec::new("e2e-salt")?,
        Cipher::new(generate_key()),
    );
    Ok(Hub::new(Arc::new(store)))
}

async fn serve(app: Router) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("ws://{}/hub", addr))
}

async fn spawn_server() -> anyhow::Result<String> {
    serve(clipshare_gateway::router(hub()?)).await
}

async fn next_content(rx: &mut mpsc::UnboundedReceiver<ReceivedContent>) -> ReceivedContent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("content channel closed")
}

#[tokio::test]
async fn create_join_send_history() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (alice, mut alice_rx) = ClipboardClient::connect(url.as_str()).await?;
    let (bob, mut bob_rx) = ClipboardClient::connect(url.as_str()).await?;

    let code = timeout(WAIT, alice.create_room()).await??;
    assert_eq!(code.len(), 5);
    assert!(timeout(WAIT, alice.join_room(&code)).await??);
    assert!(timeout(WAIT, bob.join_room(&code.to_lowercase())).await??);

    timeout(WAIT, alice.send(&code, "hello")).await??;

    let expected = ReceivedContent {
        code: code.clone(),
        content: "hello".into(),
    };
    assert_eq!(next_content(&mut alice_rx).await, expected);
    assert_eq!(next_content(&mut bob_rx).await, expected);

    assert_eq!(timeout(WAIT, bob.history(&code)).await??, vec!["hello".to_string()]);
    Ok(())
}

#[tokio::test]
async fn late_joiner_replays_history() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (alice, _alice_rx) = ClipboardClient::connect(url.as_str()).await?;

    let code = timeout(WAIT, alice.create_room()).await??;
    for text in ["one", "two", "three"] {
        timeout(WAIT, alice.send(&code, text)).await??;
    }

    let (carol, mut carol_rx) = ClipboardClient::connect(url.as_str()).await?;
    assert!(timeout(WAIT, carol.join_room(&code)).await??);
    assert_eq!(timeout(WAIT, carol.history(&code)).await??, vec!["one", "two", "three"]);

    // Nothing sent before the join is pushed live.
    assert!(timeout(QUIET, carol_rx.recv()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn unknown_code_is_rejected() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (client, _rx) = ClipboardClient::connect(url.as_str()).await?;

    assert!(!timeout(WAIT, client.join_room("ABCDE")).await??);
    assert!(!timeout(WAIT, client.join_room("not-a-code")).await??);
    assert_eq!(client.state(), ConnectionState::Connected);
    Ok(())
}

#[tokio::test]
async fn send_to_unknown_room_is_dropped() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (alice, mut alice_rx) = ClipboardClient::connect(url.as_str()).await?;

    let code = timeout(WAIT, alice.create_room()).await??;
    assert!(timeout(WAIT, alice.join_room(&code)).await??);

    timeout(WAIT, alice.send("ZZZZZ", "lost")).await??;
    assert!(timeout(QUIET, alice_rx.recv()).await.is_err());
    assert!(timeout(WAIT, alice.history("ZZZZZ")).await??.is_empty());
    assert!(timeout(WAIT, alice.history(&code)).await??.is_empty());
    Ok(())
}

#[tokio::test]
async fn leave_room_stops_delivery() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (alice, mut alice_rx) = ClipboardClient::connect(url.as_str()).await?;
    let (bob, mut bob_rx) = ClipboardClient::connect(url.as_str()).await?;

    let code = timeout(WAIT, alice.create_room()).await??;
    assert!(timeout(WAIT, alice.join_room(&code)).await??);
    assert!(timeout(WAIT, bob.join_room(&code)).await??);
    timeout(WAIT, bob.leave_room(&code)).await??;

    timeout(WAIT, alice.send(&code, "after leave")).await??;
    assert_eq!(next_content(&mut alice_rx).await.content, "after leave");
    assert!(timeout(QUIET, bob_rx.recv()).await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_match_history_order() -> anyhow::Result<()> {
    const PER_SENDER: usize = 20;

    let url = spawn_server().await?;
    let (alice, mut alice_rx) = ClipboardClient::connect(url.as_str()).await?;
    let (bob, mut bob_rx) = ClipboardClient::connect(url.as_str()).await?;

    let code = timeout(WAIT, alice.create_room()).await??;
    assert!(timeout(WAIT, alice.join_room(&code)).await??);
    assert!(timeout(WAIT, bob.join_room(&code)).await??);

    let mut senders = Vec::new();
    for (name, client) in [("alice", alice.clone()), ("bob", bob.clone())] {
        let code = code.clone();
        senders.push(tokio::spawn(async move {
            for i in 0..PER_SENDER {
                client.send(&code, &format!("{name}-{i}")).await?;
            }
            Ok::<_, ClientError>(())
        }));
    }
    for sender in senders {
        timeout(WAIT, sender).await???;
    }

    let mut seen_by_alice = Vec::new();
    let mut seen_by_bob = Vec::new();
    for _ in 0..PER_SENDER * 2 {
        seen_by_alice.push(next_content(&mut alice_rx).await.content);
        seen_by_bob.push(next_content(&mut bob_rx).await.content);
    }

    let history = timeout(WAIT, alice.history(&code)).await??;
    assert_eq!(history.len(), PER_SENDER * 2);
    assert_eq!(seen_by_alice, history);
    assert_eq!(seen_by_bob, history);
    Ok(())
}

#[tokio::test]
async fn close_ends_in_disconnected() -> anyhow::Result<()> {
    let url = spawn_server().await?;
    let (client, _rx) = ClipboardClient::connect(url.as_str()).await?;
    assert_eq!(client.state(), ConnectionState::Connected);

    timeout(WAIT, client.close()).await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(client.create_room().await, Err(ClientError::ConnectionLost)));
    Ok(())
}

#[tokio::test]
async fn connect_to_nothing_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = ClipboardClient::connect(format!("ws://{}/hub", addr)).await;
    assert!(matches!(result, Err(ClientError::Connect(_))));
}

#[derive(Clone)]
struct FlakyState {
    hub: Hub,
    sessions: Arc<AtomicUsize>,
}

/// The first session accepts any join and then hangs up on the next command.
/// Every later session is served by the real hub.
async fn flaky_upgrade(State(state): State<FlakyState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let session = state.sessions.fetch_add(1, Ordering::SeqCst);
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| async move {
        if session == 0 {
            short_lived_session(socket).await;
        } else {
            handle_connection(socket, hub).await;
        }
    })
}

async fn short_lived_session(mut socket: WebSocket) {
    while let Some(Ok(Message::Text(text))) = socket.recv().await {
        let Ok(HubCommand::JoinRoom { request_id, code }) = serde_json::from_str(text.as_str()) else {
            return;
        };
        let reply = HubEvent::RoomJoined {
            request_id,
            code,
            accepted: true,
        };
        let Ok(json) = serde_json::to_string(&reply) else { return };
        if socket.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }
}

#[tokio::test]
async fn reconnect_rejoins_rooms() -> anyhow::Result<()> {
    let hub = hub()?;
    let code = hub.create_room(ConnectionId::new()).await?;
    let app = Router::new().route("/hub", get(flaky_upgrade)).with_state(FlakyState {
        hub,
        sessions: Arc::new(AtomicUsize::new(0)),
    });
    let url = serve(app).await?;

    let (client, mut rx) = ClipboardClient::connect(url.as_str()).await?;
    let mut states = client.state_changes();
    assert!(timeout(WAIT, client.join_room(&code)).await??);

    // The first session hangs up on this one.
    let lost = timeout(WAIT, client.create_room()).await?;
    assert!(matches!(lost, Err(ClientError::ConnectionLost)));

    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Connected)).await??;
    // Same socket as the automatic rejoin, so it is answered after it.
    assert!(timeout(WAIT, client.history(&code)).await??.is_empty());

    let (other, _other_rx) = ClipboardClient::connect(url.as_str()).await?;
    timeout(WAIT, other.send(&code, "after reconnect")).await??;

    let received = next_content(&mut rx).await;
    assert_eq!(received.code, code);
    assert_eq!(received.content, "after reconnect");
    Ok(())
}
