use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::debug;

use huddle_types::ErrorKind;

use crate::action::{ActionKind, ActionPayload, QueuedAction};
use crate::config::SyncConfig;
use crate::sender::{ActionSender, SendError};

/// Request-style fallback. Handles every action kind; the only sender for
/// group creation and uploads.
pub struct HttpSender {
    client: Client,
    server_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
}

impl HttpSender {
    pub fn new(config: &SyncConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.send_timeout).build()?;
        Ok(Self {
            client,
            server_url: config.server_url.clone(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }
}

#[async_trait]
impl ActionSender for HttpSender {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, _kind: ActionKind) -> bool {
        true
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn send(&self, action: &QueuedAction) -> Result<(), SendError> {
        let request = match &action.payload {
            ActionPayload::SendMessage { .. } => {
                let Some((group_id, body)) = action.create_request() else {
                    return Err(SendError::Transport("not a message".into()));
                };
                self.client
                    .post(self.url(&format!("/groups/{}/messages", group_id)))
                    .json(&body)
            }
            ActionPayload::CreateGroup(body) => self.client.post(self.url("/groups")).json(body),
            ActionPayload::UploadFile {
                group_id,
                filename,
                content_type,
                data,
            } => {
                let mut query = vec![("filename", filename.clone())];
                if let Some(group_id) = group_id {
                    query.push(("group_id", group_id.to_string()));
                }
                self.client
                    .post(self.url("/files"))
                    .query(&query)
                    .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
                    .body(data.clone())
            }
        };

        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout
                } else {
                    SendError::Transport(e.to_string())
                }
            })?;

        check(response).await?;
        debug!("{} action {} confirmed over http", action.kind(), action.id);
        Ok(())
    }
}

async fn check(response: Response) -> Result<(), SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(SendError::Rejected {
            kind: body.error,
            message: body.message,
        }),
        Err(_) => Err(SendError::Transport(format!("server returned {}", status))),
    }
}
