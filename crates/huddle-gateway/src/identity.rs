use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{debug, warn};
use uuid::Uuid;

use huddle_types::HuddleError;
use huddle_types::api::Claims;
use huddle_types::models::{Role, User, UserStatus};

use crate::store::Store;

/// A verified caller. The role is read from the store at verification time,
/// so a role change applies to the next request without re-login.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub organization_id: String,
}

impl From<&User> for Identity {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
            organization_id: user.organization_id.clone(),
        }
    }
}

/// Turns bearer credentials into identities. Shared by the REST middleware
/// and the gateway handshake.
#[derive(Clone)]
pub struct IdentityResolver {
    secret: String,
    token_ttl: chrono::Duration,
    store: Store,
}

impl IdentityResolver {
    pub fn new(secret: impl Into<String>, token_ttl: chrono::Duration, store: Store) -> Self {
        Self {
            secret: secret.into(),
            token_ttl,
            store,
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            role: user.role,
            org: user.organization_id.clone(),
            exp: (chrono::Utc::now() + self.token_ttl).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Signature and expiry check only.
    pub fn decode(&self, token: &str) -> Result<Claims, HuddleError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| {
            debug!("Rejected credential: {}", e);
            HuddleError::Authentication
        })
    }

    /// Full verification: valid token naming an active user.
    pub async fn verify(&self, credential: &str) -> Result<Identity, HuddleError> {
        let claims = self.decode(credential)?;

        let user_id = claims.sub;
        let user = self
            .store
            .call("load user for credential", move |db| db.get_user(user_id))
            .await?
            .ok_or(HuddleError::Authentication)?;

        if user.status != UserStatus::Active {
            warn!("Credential for inactive user {} refused", user.id);
            return Err(HuddleError::Authentication);
        }

        Ok(Identity::from(&user))
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}
