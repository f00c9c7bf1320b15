use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use clipshare_types::events::{HubCommand, HubEvent};
use clipshare_types::models::ConnectionId;

use crate::hub::Hub;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one hub WebSocket session until either side goes away.
///
/// Replies and room broadcasts share one outbound queue, so a client sees
/// them in the order the hub produced them.
pub async fn handle_connection(socket: WebSocket, hub: Hub) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<HubEvent>();
    let conn_id = hub.register(tx.clone()).await;
    info!("{} connected to hub", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward hub events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("{} failed to encode event: {}", conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("{} heartbeat timeout (missed {} pongs), dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let hub_recv = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<HubCommand>(text.as_str()) {
                        Ok(cmd) => handle_command(&hub_recv, conn_id, cmd).await,
                        Err(e) => {
                            warn!(
                                "{} bad command: {} -- raw: {}",
                                conn_id,
                                e,
                                text.as_str().chars().take(200).collect::<String>()
                            );
                            HubEvent::Error {
                                request_id: None,
                                message: "malformed command".into(),
                            }
                        }
                    };
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(conn_id).await;
    info!("{} disconnected from hub", conn_id);
}

/// Run one command against the hub and build its reply.
async fn handle_command(hub: &Hub, conn_id: ConnectionId, cmd: HubCommand) -> HubEvent {
    let request_id = cmd.request_id();

    let result = match cmd {
        HubCommand::CreateRoom { request_id } => hub
            .create_room(conn_id)
            .await
            .map(|code| HubEvent::RoomCreated { request_id, code }),

        HubCommand::JoinRoom { request_id, code } => hub
            .join_room(conn_id, &code)
            .await
            .map(|accepted| HubEvent::RoomJoined {
                request_id,
                code,
                accepted,
            }),

        HubCommand::LeaveRoom { request_id, code } => {
            hub.leave_room(conn_id, &code).await;
            Ok(HubEvent::RoomLeft { request_id, code })
        }

        HubCommand::SendClipboardContent {
            request_id,
            code,
            content,
        } => hub
            .send_content(conn_id, &code, &content)
            .await
            .map(|_| HubEvent::ContentSent { request_id }),

        HubCommand::GetRoomHistory { request_id, code } => hub
            .get_history(conn_id, &code)
            .await
            .map(|items| HubEvent::RoomHistory {
                request_id,
                code,
                items,
            }),
    };

    result.unwrap_or_else(|e| {
        warn!("{} command {} failed: {}", conn_id, request_id, e);
        HubEvent::Error {
            request_id: Some(request_id),
            message: e.client_message().to_string(),
        }
    })
}
