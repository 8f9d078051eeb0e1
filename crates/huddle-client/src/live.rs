use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::{GatewayCommand, GatewayEvent};

use crate::action::{ActionKind, QueuedAction};
use crate::config::SyncConfig;
use crate::sender::{ActionSender, SendError};

type Waiters = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<(), SendError>>>>>;

/// Live gateway connection. Sends wait for the `message-sent` or
/// `message-error` that carries their action id.
pub struct GatewayLink {
    outbound: mpsc::UnboundedSender<Message>,
    waiters: Waiters,
    connected: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl GatewayLink {
    /// Connect and authenticate. Every event received, confirmations
    /// included, is forwarded on the returned channel.
    pub async fn connect(
        config: &SyncConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>)> {
        let (ws, _) = connect_async(config.gateway_url_with_token())
            .await
            .with_context(|| format!("connecting to gateway at {}", config.gateway_url))?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let waiters: Waiters = Arc::default();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_connected = connected.clone();
        let reader_waiters = waiters.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<GatewayEvent>(&text) {
                        Ok(event) => {
                            settle(&reader_waiters, &event).await;
                            let _ = event_tx.send(event);
                        }
                        Err(e) => warn!("Unparseable gateway event: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Gateway read error: {}", e);
                        break;
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            for (_, waiter) in reader_waiters.lock().await.drain() {
                let _ = waiter.send(Err(SendError::Unavailable));
            }
            info!("Gateway link closed");
        });

        info!("Gateway link established");
        Ok((
            Self {
                outbound,
                waiters,
                connected,
                send_timeout: config.send_timeout,
            },
            event_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Fire-and-forget command, e.g. `join-groups` or typing.
    pub fn command(&self, command: &GatewayCommand) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Unavailable);
        }
        let text =
            serde_json::to_string(command).map_err(|e| SendError::Transport(e.to_string()))?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| SendError::Unavailable)
    }
}

/// Resolve whichever send is waiting on this event, if any.
async fn settle(waiters: &Waiters, event: &GatewayEvent) {
    let (client_id, result) = match event {
        GatewayEvent::MessageSent {
            client_id: Some(id),
            ..
        } => (*id, Ok(())),
        GatewayEvent::MessageError {
            client_id: Some(id),
            error,
            message,
        } => (
            *id,
            Err(SendError::Rejected {
                kind: *error,
                message: message.clone(),
            }),
        ),
        _ => return,
    };
    if let Some(waiter) = waiters.lock().await.remove(&client_id) {
        let _ = waiter.send(result);
    }
}

#[async_trait]
impl ActionSender for GatewayLink {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn supports(&self, kind: ActionKind) -> bool {
        kind == ActionKind::SendMessage
    }

    async fn is_available(&self) -> bool {
        self.is_connected()
    }

    async fn send(&self, action: &QueuedAction) -> Result<(), SendError> {
        let Some(command) = action.send_command() else {
            return Err(SendError::Unavailable);
        };

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(action.id, tx);
        if let Err(e) = self.command(&GatewayCommand::SendMessage(command)) {
            self.waiters.lock().await.remove(&action.id);
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(result)) => {
                debug!("send-message {} settled over gateway", action.id);
                result
            }
            Ok(Err(_)) => Err(SendError::Unavailable),
            Err(_) => {
                self.waiters.lock().await.remove(&action.id);
                Err(SendError::Timeout)
            }
        }
    }
}
