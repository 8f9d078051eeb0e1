use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use huddle_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;
use crate::identity::Identity;
use crate::registry::SessionId;

/// Server pings every 15 seconds. Two missed pongs drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const MISSED_PONG_LIMIT: u8 = 2;
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

fn encode(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            None
        }
    }
}

/// Connection whose token was already verified at the HTTP upgrade.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    dispatcher: Dispatcher,
    identity: Identity,
) {
    let (sender, receiver) = socket.split();
    info!("{} ({}) connected to gateway (pre-authenticated)", identity.username, identity.user_id);
    run_connection_loop(sender, receiver, dispatcher, identity).await;
}

/// Connection that must send `identify` within ten seconds.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &dispatcher).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", identity.username, identity.user_id);
    run_connection_loop(sender, receiver, dispatcher, identity).await;
}

async fn wait_for_identify(receiver: &mut WsStream, dispatcher: &Dispatcher) -> Option<Identity> {
    let handshake = async {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str(&text) {
                return match dispatcher.identity().verify(&token).await {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        debug!("identify refused: {}", e);
                        None
                    }
                };
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, handshake).await.ok().flatten()
}

async fn run_connection_loop(
    mut sender: WsSink,
    mut receiver: WsStream,
    dispatcher: Dispatcher,
    identity: Identity,
) {
    let username = identity.username.clone();
    let user_id = identity.user_id;
    let (session_id, mut events) = dispatcher.connect(identity.clone()).await;

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
        session_id,
    };
    let Some(ready) = encode(&ready) else { return };
    if sender.send(ready).await.is_err() {
        dispatcher.disconnect(session_id).await;
        return;
    }

    // Writes run on their own task in arrival order. It is never aborted:
    // once the socket goes away it drains what was queued and exits.
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_write_worker(dispatcher.clone(), identity, session_id, writes_rx));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(msg) = encode(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed = 0;
                    } else {
                        missed += 1;
                        if missed >= MISSED_PONG_LIMIT {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_dispatcher = dispatcher.clone();
    let recv_username = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            recv_dispatcher.registry().touch(session_id).await;
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&recv_dispatcher, session_id, cmd, &writes_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_username,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => pong_flag_recv.store(true, Ordering::Release),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(session_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    session_id: SessionId,
    cmd: GatewayCommand,
    writes: &mpsc::UnboundedSender<GatewayCommand>,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {}

        GatewayCommand::JoinGroups { group_ids } => {
            let (joined, rejected) = dispatcher.join_groups(session_id, group_ids).await;
            debug!(
                "Session {} joined {} rooms, {} rejected",
                session_id,
                joined.len(),
                rejected.len()
            );
            dispatcher
                .fabric()
                .send_to_session(
                    session_id,
                    GatewayEvent::Joined {
                        group_ids: joined,
                        rejected,
                    },
                )
                .await;
        }

        GatewayCommand::TypingStart { group_id } => {
            dispatcher.typing(session_id, group_id, true).await;
        }

        GatewayCommand::TypingStop { group_id } => {
            dispatcher.typing(session_id, group_id, false).await;
        }

        cmd @ (GatewayCommand::SendMessage(_) | GatewayCommand::MarkRead { .. }) => {
            if writes.send(cmd).is_err() {
                error!("Write worker for session {} is gone", session_id);
            }
        }
    }
}

async fn run_write_worker(
    dispatcher: Dispatcher,
    identity: Identity,
    session_id: SessionId,
    mut writes: mpsc::UnboundedReceiver<GatewayCommand>,
) {
    while let Some(cmd) = writes.recv().await {
        match cmd {
            GatewayCommand::SendMessage(cmd) => {
                dispatcher.send_message(&identity, session_id, cmd).await
            }
            GatewayCommand::MarkRead {
                group_id,
                message_id,
            } => dispatcher.mark_read(&identity, group_id, message_id).await,
            _ => {}
        }
    }
}
