//! Typed client for the clipshare hub WebSocket.
//!
//! Every hub command is an invocation with its own `request_id`; replies are
//! routed back to the waiting call, and room broadcasts come out of the
//! receiver returned by [`ClipboardClient::connect`].
//!
//! When the transport drops, the client reconnects with exponential backoff
//! and re-issues `JoinRoom` for every room it had joined, because the hub
//! forgets membership when a session ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use clipshare_types::events::{HubCommand, HubEvent};
use clipshare_types::models::ConnectionState;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 6;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("request timed out")]
    Timeout,
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(Box<HubEvent>),
}

/// A clipboard payload broadcast to a joined room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedContent {
    pub code: String,
    pub content: String,
}

enum DriverMessage {
    Command(HubCommand),
    Close,
}

enum PumpExit {
    Closed,
    Lost,
}

#[derive(Clone)]
pub struct ClipboardClient {
    inner: Arc<ClientInner>,
    /// Dropping the last handle closes this channel, which stops the driver.
    commands: mpsc::UnboundedSender<DriverMessage>,
}

struct ClientInner {
    url: String,
    pending: Mutex<HashMap<u64, oneshot::Sender<HubEvent>>>,
    next_request_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// Rooms to re-join after a reconnect.
    joined: Mutex<HashSet<String>>,
}

impl ClipboardClient {
    /// Open a session to `url` (e.g. `ws://127.0.0.1:5134/hub`).
    pub async fn connect(
        url: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ReceivedContent>), ClientError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(ClientInner {
            url: url.into(),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            state,
            joined: Mutex::new(HashSet::new()),
        });

        inner.set_state(ConnectionState::Connecting);
        let ws = match connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        inner.set_state(ConnectionState::Connected);
        info!("Connected to {}", inner.url);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (content_tx, content_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_driver(inner.clone(), ws, commands_rx, content_tx));

        Ok((Self { inner, commands }, content_rx))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn create_room(&self) -> Result<String, ClientError> {
        match self.invoke(|request_id| HubCommand::CreateRoom { request_id }).await? {
            HubEvent::RoomCreated { code, .. } => Ok(code),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    /// Join a room. Codes are matched case-insensitively, like the UI input.
    pub async fn join_room(&self, code: &str) -> Result<bool, ClientError> {
        let code = normalize_code(code);
        match self
            .invoke(|request_id| HubCommand::JoinRoom { request_id, code })
            .await?
        {
            HubEvent::RoomJoined { accepted, .. } => Ok(accepted),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    pub async fn leave_room(&self, code: &str) -> Result<(), ClientError> {
        let code = normalize_code(code);
        match self
            .invoke(|request_id| HubCommand::LeaveRoom { request_id, code })
            .await?
        {
            HubEvent::RoomLeft { .. } => Ok(()),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    /// Returns once the hub has persisted the content (or dropped it because
    /// the room does not exist).
    pub async fn send(&self, code: &str, content: &str) -> Result<(), ClientError> {
        let code = normalize_code(code);
        let content = content.to_string();
        match self
            .invoke(|request_id| HubCommand::SendClipboardContent {
                request_id,
                code,
                content,
            })
            .await?
        {
            HubEvent::ContentSent { .. } => Ok(()),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    pub async fn history(&self, code: &str) -> Result<Vec<String>, ClientError> {
        let code = normalize_code(code);
        match self
            .invoke(|request_id| HubCommand::GetRoomHistory { request_id, code })
            .await?
        {
            HubEvent::RoomHistory { items, .. } => Ok(items),
            other => Err(ClientError::UnexpectedReply(Box::new(other))),
        }
    }

    /// Close the session and wait until the driver has shut down.
    pub async fn close(&self) {
        let mut changes = self.state_changes();
        if self.commands.send(DriverMessage::Close).is_ok() {
            let _ = changes
                .wait_for(|state| *state == ConnectionState::Disconnected)
                .await;
        }
    }

    async fn invoke<F>(&self, build: F) -> Result<HubEvent, ClientError>
    where
        F: FnOnce(u64) -> HubCommand,
    {
        let request_id = self.inner.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().await.insert(request_id, tx);

        if self.commands.send(DriverMessage::Command(build(request_id))).is_err() {
            self.inner.pending().await.remove(&request_id);
            return Err(ClientError::ConnectionLost);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(HubEvent::Error { message, .. })) => Err(ClientError::Server(message)),
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.inner.pending().await.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }
}

impl ClientInner {
    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<HubEvent>>> {
        self.pending.lock().await
    }

    async fn joined(&self) -> MutexGuard<'_, HashSet<String>> {
        self.joined.lock().await
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            warn!("Unexpected connection state change {:?} -> {:?}", prev, next);
        }
        debug!("Connection state {:?} -> {:?}", prev, next);
    }

    /// Wake every waiting invocation with `ConnectionLost`.
    async fn fail_pending(&self) {
        self.pending().await.clear();
    }

    async fn dispatch(&self, text: &str, content_tx: &mpsc::UnboundedSender<ReceivedContent>) {
        let event: HubEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Bad event from hub: {}", e);
                return;
            }
        };

        match &event {
            HubEvent::RoomJoined { code, accepted, .. } => {
                let mut joined = self.joined().await;
                if *accepted {
                    joined.insert(code.clone());
                } else {
                    joined.remove(code);
                }
            }
            HubEvent::RoomLeft { code, .. } => {
                self.joined().await.remove(code);
            }
            _ => {}
        }

        if let HubEvent::ReceiveClipboardContent { code, content } = event {
            let _ = content_tx.send(ReceivedContent { code, content });
            return;
        }

        match event.request_id() {
            Some(request_id) => match self.pending().await.remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(event);
                }
                None => debug!("Reply for request {} with no waiter", request_id),
            },
            None => warn!("Unsolicited event from hub: {:?}", event),
        }
    }
}

async fn run_driver(
    inner: Arc<ClientInner>,
    mut ws: WsStream,
    mut commands: mpsc::UnboundedReceiver<DriverMessage>,
    content_tx: mpsc::UnboundedSender<ReceivedContent>,
) {
    loop {
        match pump(&inner, &mut ws, &mut commands, &content_tx).await {
            PumpExit::Closed => break,
            PumpExit::Lost => {
                warn!("Lost connection to {}, reconnecting", inner.url);
                inner.set_state(ConnectionState::Reconnecting);
                inner.fail_pending().await;

                let Some(fresh) = reconnect(&inner).await else {
                    warn!("Giving up on {} after {} attempts", inner.url, MAX_RECONNECT_ATTEMPTS);
                    break;
                };
                ws = fresh;
                rejoin(&inner, &mut ws).await;
                inner.set_state(ConnectionState::Connected);
            }
        }
    }

    // Refuse new invocations before failing the ones already queued.
    commands.close();
    inner.fail_pending().await;
    inner.set_state(ConnectionState::Disconnected);
    info!("Disconnected from {}", inner.url);
}

async fn pump(
    inner: &ClientInner,
    ws: &mut WsStream,
    commands: &mut mpsc::UnboundedReceiver<DriverMessage>,
    content_tx: &mpsc::UnboundedSender<ReceivedContent>,
) -> PumpExit {
    loop {
        tokio::select! {
            msg = commands.recv() => match msg {
                Some(DriverMessage::Command(cmd)) => {
                    let text = match serde_json::to_string(&cmd) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode command: {}", e);
                            continue;
                        }
                    };
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return PumpExit::Lost;
                    }
                }
                Some(DriverMessage::Close) | None => {
                    let _ = ws.close(None).await;
                    return PumpExit::Closed;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.dispatch(text.as_str(), content_tx).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return PumpExit::Lost,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn reconnect(inner: &ClientInner) -> Option<WsStream> {
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        tokio::time::sleep(backoff_delay(attempt)).await;
        match connect_async(inner.url.as_str()).await {
            Ok((ws, _)) => {
                info!("Reconnected to {} (attempt {})", inner.url, attempt + 1);
                return Some(ws);
            }
            Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt + 1, inner.url, e),
        }
    }
    None
}

/// Membership does not survive a dropped session, so ask for it again.
async fn rejoin(inner: &ClientInner, ws: &mut WsStream) {
    let codes: Vec<String> = inner.joined().await.iter().cloned().collect();
    for code in codes {
        let cmd = HubCommand::JoinRoom {
            request_id: inner.next_request_id(),
            code,
        };
        let Ok(text) = serde_json::to_string(&cmd) else {
            continue;
        };
        if ws.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}

/// Exponential backoff capped at [`BACKOFF_MAX`], plus up to 100ms of jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16));
    let jitter = Duration::from_millis(rand::rng().random_range(0..=100));
    exponential.min(BACKOFF_MAX) + jitter
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
