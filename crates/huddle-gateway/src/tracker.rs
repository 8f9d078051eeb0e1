use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use huddle_db::{CreateOutcome, NewMessage};
use huddle_types::api::{CreateMessageRequest, TagInput};
use huddle_types::events::GatewayEvent;
use huddle_types::models::{GroupAction, Message, MessageType, TagKind};
use huddle_types::{FieldError, HuddleError};

use crate::access::MembershipAuthority;
use crate::fabric::BroadcastFabric;
use crate::identity::Identity;
use crate::registry::{SessionId, SessionRegistry};
use crate::store::Store;

pub const MAX_CONTENT_LEN: usize = 4000;
pub const MAX_TAG_VALUE_LEN: usize = 200;

/// Parse submitted tags against the fixed vocabulary. Every bad entry is
/// reported; nothing is dropped silently.
pub fn parse_tags(tags: &[TagInput]) -> Result<Vec<(TagKind, Option<String>)>, Vec<FieldError>> {
    let mut parsed = Vec::with_capacity(tags.len());
    let mut errors = Vec::new();

    for (i, tag) in tags.iter().enumerate() {
        match tag.kind.parse::<TagKind>() {
            Ok(kind) => parsed.push((kind, tag.value.clone())),
            Err(_) => errors.push(FieldError::new(
                format!("tags[{}].kind", i),
                format!("'{}' is not a known tag kind", tag.kind),
            )),
        }
        if tag.value.as_ref().is_some_and(|v| v.len() > MAX_TAG_VALUE_LEN) {
            errors.push(FieldError::new(
                format!("tags[{}].value", i),
                format!("must be at most {} bytes", MAX_TAG_VALUE_LEN),
            ));
        }
    }

    if errors.is_empty() { Ok(parsed) } else { Err(errors) }
}

pub fn validate_content(content: &str, errors: &mut Vec<FieldError>) {
    if content.trim().is_empty() {
        errors.push(FieldError::new("content", "must not be empty"));
    } else if content.len() > MAX_CONTENT_LEN {
        errors.push(FieldError::new(
            "content",
            format!("must be at most {} bytes", MAX_CONTENT_LEN),
        ));
    }
}

fn validate(
    req: &CreateMessageRequest,
) -> Result<(MessageType, Vec<(TagKind, Option<String>)>), HuddleError> {
    let mut errors = Vec::new();
    validate_content(&req.content, &mut errors);

    let message_type = match req.message_type.as_deref() {
        None => MessageType::Text,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            errors.push(FieldError::new(
                "message_type",
                format!("'{}' is not a known message type", raw),
            ));
            MessageType::Text
        }),
    };

    let tags = match parse_tags(&req.tags) {
        Ok(tags) => tags,
        Err(tag_errors) => {
            errors.extend(tag_errors);
            vec![]
        }
    };

    if errors.is_empty() {
        Ok((message_type, tags))
    } else {
        Err(HuddleError::Validation(errors))
    }
}

/// Persists messages with their delivery fan-out and turns read
/// acknowledgements into `message-read` receipts.
#[derive(Clone)]
pub struct DeliveryTracker {
    store: Store,
    authority: MembershipAuthority,
    registry: Arc<SessionRegistry>,
    fabric: BroadcastFabric,
}

impl DeliveryTracker {
    pub fn new(
        store: Store,
        authority: MembershipAuthority,
        registry: Arc<SessionRegistry>,
        fabric: BroadcastFabric,
    ) -> Self {
        Self {
            store,
            authority,
            registry,
            fabric,
        }
    }

    /// Create a message in `group_id`.
    ///
    /// Validation and authorization fail before anything is written. The
    /// message row, its tags and one delivery row per current member are
    /// one transaction. Afterwards `new-message` goes to the room minus the
    /// originating session and `message-sent` to the originating session.
    /// A replay of an already-stored `client_id` is only re-confirmed.
    pub async fn create_message(
        &self,
        identity: &Identity,
        origin: Option<SessionId>,
        group_id: Uuid,
        req: CreateMessageRequest,
    ) -> Result<Message, HuddleError> {
        let (message_type, tags) = validate(&req)?;

        self.authority
            .authorize(identity, group_id, GroupAction::Write)
            .await?;

        let client_id = req.client_id;
        let new = NewMessage {
            id: Uuid::new_v4(),
            group_id,
            sender_id: identity.user_id,
            content: req.content,
            message_type,
            reply_to: req.reply_to,
            client_id,
            tags,
            created_at: Utc::now(),
        };

        let outcome = self
            .store
            .call("create message", move |db| db.create_message(&new))
            .await?;

        let message = match outcome {
            CreateOutcome::Created {
                message,
                recipients,
            } => {
                info!(
                    "{} posted message {} to group {} ({} delivery rows)",
                    identity.username,
                    message.id,
                    group_id,
                    recipients.len()
                );

                if self.registry.clear_typing(group_id, identity.user_id).await {
                    self.fabric
                        .publish(
                            group_id,
                            GatewayEvent::UserStopTyping {
                                group_id,
                                user_id: identity.user_id,
                            },
                            None,
                        )
                        .await;
                }

                self.fabric
                    .publish(
                        group_id,
                        GatewayEvent::NewMessage {
                            message: message.clone(),
                        },
                        origin,
                    )
                    .await;
                message
            }
            CreateOutcome::Replayed(message) => {
                debug!(
                    "Replayed send from {} (client id {:?}) matched message {}",
                    identity.username, client_id, message.id
                );
                message
            }
            CreateOutcome::ReplyTargetMissing => return Err(HuddleError::NotFound),
        };

        if let Some(session_id) = origin {
            self.fabric
                .send_to_session(
                    session_id,
                    GatewayEvent::MessageSent {
                        client_id,
                        message: message.clone(),
                    },
                )
                .await;
        }

        Ok(message)
    }

    /// Mark one message read. Idempotent: only the first call for a
    /// (message, user) pair changes state and emits `message-read`.
    pub async fn mark_read(
        &self,
        identity: &Identity,
        group_id: Uuid,
        message_id: Uuid,
    ) -> Result<bool, HuddleError> {
        self.authority
            .authorize(identity, group_id, GroupAction::Read)
            .await?;

        let user_id = identity.user_id;
        let at = Utc::now();
        let changed = self
            .store
            .call("mark message read", move |db| {
                db.mark_read(message_id, group_id, user_id, at)
            })
            .await?
            .ok_or(HuddleError::NotFound)?;

        if changed {
            self.publish_read(group_id, user_id, vec![message_id], at).await;
        }
        Ok(changed)
    }

    /// Mark every unread message in the group read for the caller, in one
    /// statement. Returns the ids that transitioned.
    pub async fn mark_group_read(
        &self,
        identity: &Identity,
        group_id: Uuid,
    ) -> Result<Vec<Uuid>, HuddleError> {
        self.authority
            .authorize(identity, group_id, GroupAction::Read)
            .await?;

        let user_id = identity.user_id;
        let at = Utc::now();
        let ids = self
            .store
            .call("mark group read", move |db| db.mark_group_read(group_id, user_id, at))
            .await?;

        if !ids.is_empty() {
            debug!("{} read {} messages in group {}", identity.username, ids.len(), group_id);
            self.publish_read(group_id, user_id, ids.clone(), at).await;
        }
        Ok(ids)
    }

    async fn publish_read(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: chrono::DateTime<Utc>,
    ) {
        self.fabric
            .publish(
                group_id,
                GatewayEvent::MessageRead {
                    group_id,
                    user_id,
                    message_ids,
                    read_at,
                },
                None,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content: &str, tags: &[&str]) -> CreateMessageRequest {
        CreateMessageRequest {
            content: content.to_string(),
            message_type: None,
            reply_to: None,
            tags: tags
                .iter()
                .map(|k| TagInput { kind: k.to_string(), value: None })
                .collect(),
            client_id: None,
        }
    }

    #[test]
    fn unknown_tag_kinds_are_field_errors() {
        let err = validate(&request("ok", &["urgent", "gossip"])).unwrap_err();
        match err {
            HuddleError::Validation(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "tags[1].kind");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_content_and_bad_type_are_both_reported() {
        let mut req = request("   ", &[]);
        req.message_type = Some("video".into());
        match validate(&req).unwrap_err() {
            HuddleError::Validation(fields) => {
                let names: Vec<_> = fields.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, vec!["content", "message_type"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn defaults_to_text() {
        let (kind, tags) = validate(&request("hi", &["follow-up"])).unwrap();
        assert_eq!(kind, MessageType::Text);
        assert_eq!(tags, vec![(TagKind::FollowUp, None)]);
    }
}
