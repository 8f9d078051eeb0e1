use std::time::Duration;

/// Failed attempts after which a queued action is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the request-style API, e.g. `http://localhost:3000`.
    pub server_url: String,
    /// Gateway WebSocket URL, e.g. `ws://localhost:3000/gateway`.
    pub gateway_url: String,
    pub token: String,
    pub max_attempts: u32,
    /// How long a single send may wait for its confirmation.
    pub send_timeout: Duration,
}

impl SyncConfig {
    pub fn new(
        server_url: impl Into<String>,
        gateway_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            gateway_url: gateway_url.into(),
            token: token.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Gateway URL with the credential attached, so the server checks it
    /// before upgrading.
    pub fn gateway_url_with_token(&self) -> String {
        let sep = if self.gateway_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.gateway_url, sep, self.token)
    }
}
