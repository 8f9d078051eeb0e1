use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub session_grace: Duration,
    pub storage_workers: usize,
    pub token_ttl: chrono::Duration,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = get("HUDDLE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("HUDDLE_JWT_SECRET is unset or still a placeholder; set it in .env and restart");
        }

        let parse = |key: &str, default: u64| -> anyhow::Result<u64> {
            match get(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
                None => Ok(default),
            }
        };

        let port = parse("HUDDLE_PORT", 3000)?;
        let port = u16::try_from(port).context("HUDDLE_PORT out of range")?;
        let storage_workers = parse("HUDDLE_STORAGE_WORKERS", 8)?.max(1) as usize;
        let ttl_hours = parse("HUDDLE_TOKEN_TTL_HOURS", 720)?;

        Ok(Self {
            jwt_secret,
            db_path: get("HUDDLE_DB_PATH").unwrap_or_else(|| "huddle.db".into()).into(),
            host: get("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            session_grace: Duration::from_secs(parse("HUDDLE_SESSION_GRACE_SECS", 30)?),
            storage_workers,
            token_ttl: chrono::Duration::hours(ttl_hours as i64),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_with_a_real_secret() {
        let config = ServerConfig::from_lookup(lookup(&[("HUDDLE_JWT_SECRET", "s3cret-value")])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.session_grace, Duration::from_secs(30));
        assert_eq!(config.storage_workers, 8);
        assert_eq!(config.db_path, PathBuf::from("huddle.db"));
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn placeholder_and_missing_secrets_are_refused() {
        assert!(ServerConfig::from_lookup(lookup(&[])).is_err());
        assert!(
            ServerConfig::from_lookup(lookup(&[("HUDDLE_JWT_SECRET", "dev-secret-change-me")])).is_err()
        );
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let err = ServerConfig::from_lookup(lookup(&[
            ("HUDDLE_JWT_SECRET", "s3cret-value"),
            ("HUDDLE_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(format!("{:#}", err).contains("HUDDLE_PORT"));
    }
}
