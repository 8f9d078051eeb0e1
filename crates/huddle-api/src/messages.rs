use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use huddle_gateway::identity::Identity;
use huddle_gateway::tracker::{parse_tags, validate_content};
use huddle_types::api::{
    AddTagsRequest, CreateMessageRequest, EditMessageRequest, ListMessagesQuery, MessagePage,
    MessageStatusResponse, ReadResponse, SearchQuery,
};
use huddle_types::models::{GroupAction, Message, Tag, TagKind};
use huddle_types::{FieldError, HuddleError};

use crate::AppState;
use crate::error::ApiResult;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const MAX_SEARCH_RESULTS: u32 = 50;

fn page_limit(limit: Option<u32>, max: u32) -> Result<u32, HuddleError> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE.min(max));
    if limit == 0 || limit > max {
        return Err(HuddleError::invalid(
            "limit",
            format!("must be between 1 and {}", max),
        ));
    }
    Ok(limit)
}

/// Load a message the caller can read. Absent and unreadable look the same.
async fn load_readable(
    state: &AppState,
    identity: &Identity,
    message_id: Uuid,
) -> Result<Message, HuddleError> {
    let message = state
        .store
        .call("load message", move |db| db.get_message(message_id))
        .await?
        .ok_or(HuddleError::NotFound)?;
    state
        .dispatcher
        .authority()
        .authorize(identity, message.group_id, GroupAction::Read)
        .await?;
    Ok(message)
}

async fn require_modify(
    state: &AppState,
    identity: &Identity,
    message: &Message,
    verb: &str,
) -> Result<(), HuddleError> {
    if state
        .dispatcher
        .authority()
        .can_modify_message(identity, message)
        .await?
    {
        Ok(())
    } else {
        Err(HuddleError::forbidden(
            format!("{} message {}", verb, message.id),
            identity.role,
        ))
    }
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<MessagePage>> {
    let limit = page_limit(query.limit, MAX_PAGE_SIZE)?;
    let offset = query.offset.unwrap_or(0);
    state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, GroupAction::Read)
        .await?;

    let since = query.since;
    let messages = state
        .store
        .call("list messages", move |db| {
            db.list_messages(group_id, limit, offset, since)
        })
        .await?;

    Ok(Json(MessagePage {
        messages,
        limit,
        offset,
    }))
}

/// Request-style send. The room receives `new-message` like any gateway
/// send; there is no originating session to confirm to.
pub async fn create_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .dispatcher
        .tracker()
        .create_message(&identity, None, group_id, req)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    Ok(Json(load_readable(&state, &identity, message_id).await?))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<Message>> {
    let mut errors = Vec::new();
    validate_content(&req.content, &mut errors);
    if !errors.is_empty() {
        return Err(HuddleError::Validation(errors).into());
    }

    let message = load_readable(&state, &identity, message_id).await?;
    require_modify(&state, &identity, &message, "edit").await?;

    let content = req.content;
    let edited = state
        .store
        .call("edit message", move |db| {
            db.edit_message(message_id, &content, Utc::now())
        })
        .await?
        .ok_or(HuddleError::NotFound)?;

    info!("{} edited message {}", identity.username, message_id);
    Ok(Json(edited))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let message = load_readable(&state, &identity, message_id).await?;
    require_modify(&state, &identity, &message, "delete").await?;

    let deleted = state
        .store
        .call("delete message", move |db| db.delete_message(message_id))
        .await?;
    if !deleted {
        return Err(HuddleError::NotFound.into());
    }

    info!("{} deleted message {}", identity.username, message_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Tag a message. Kinds outside the fixed vocabulary reject the whole
/// request; a kind the message already carries is ignored.
pub async fn add_tags(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<AddTagsRequest>,
) -> ApiResult<Json<Vec<Tag>>> {
    if req.tags.is_empty() {
        return Err(HuddleError::invalid("tags", "at least one tag is required").into());
    }
    let tags = parse_tags(&req.tags).map_err(HuddleError::Validation)?;

    let message = load_readable(&state, &identity, message_id).await?;
    state
        .dispatcher
        .authority()
        .authorize(&identity, message.group_id, GroupAction::Write)
        .await?;

    let user_id = identity.user_id;
    let all = state
        .store
        .call("add tags", move |db| {
            db.add_tags(message_id, &tags, user_id, Utc::now())
        })
        .await?;
    Ok(Json(all))
}

pub async fn message_status(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Json<MessageStatusResponse>> {
    let message = load_readable(&state, &identity, message_id).await?;

    let (statuses, tags) = state
        .store
        .call("load message status", move |db| {
            Ok((db.message_status(message_id)?, db.tags_for_message(message_id)?))
        })
        .await?;

    Ok(Json(MessageStatusResponse {
        message_id: message.id,
        statuses,
        tags,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Json<ReadResponse>> {
    let message = load_readable(&state, &identity, message_id).await?;
    let changed = state
        .dispatcher
        .tracker()
        .mark_read(&identity, message.group_id, message_id)
        .await?;

    let message_ids = if changed { vec![message_id] } else { vec![] };
    Ok(Json(ReadResponse { message_ids }))
}

/// Case-insensitive substring search across every group the caller can read.
pub async fn search_messages(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let mut errors = Vec::new();
    if query.q.trim().is_empty() {
        errors.push(FieldError::new("q", "must not be empty"));
    }
    let tag = match query.tag.as_deref().map(str::parse::<TagKind>) {
        None => None,
        Some(Ok(kind)) => Some(kind),
        Some(Err(e)) => {
            errors.push(FieldError::new("tag", e.to_string()));
            None
        }
    };
    let limit = match page_limit(query.limit, MAX_SEARCH_RESULTS) {
        Ok(limit) => limit,
        Err(HuddleError::Validation(fields)) => {
            errors.extend(fields);
            MAX_SEARCH_RESULTS
        }
        Err(other) => return Err(other.into()),
    };
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            errors.push(FieldError::new("from", "must not be after 'to'"));
        }
    }
    if !errors.is_empty() {
        return Err(HuddleError::Validation(errors).into());
    }

    let group_ids: Vec<Uuid> = state
        .dispatcher
        .authority()
        .accessible_groups(&identity)
        .await?
        .into_iter()
        .map(|g| g.id)
        .collect();

    let needle = query.q.trim().to_string();
    let (from, to) = (query.from, query.to);
    let results = state
        .store
        .call("search messages", move |db| {
            db.search_messages(&group_ids, &needle, tag, from, to, limit)
        })
        .await?;

    Ok(Json(results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limits() {
        assert_eq!(page_limit(None, MAX_PAGE_SIZE).unwrap(), 50);
        assert_eq!(page_limit(Some(100), MAX_PAGE_SIZE).unwrap(), 100);
        assert!(page_limit(Some(0), MAX_PAGE_SIZE).is_err());
        assert!(page_limit(Some(101), MAX_PAGE_SIZE).is_err());
        assert!(page_limit(Some(51), MAX_SEARCH_RESULTS).is_err());
    }
}
