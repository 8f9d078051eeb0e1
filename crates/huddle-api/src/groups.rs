use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use huddle_db::{NewGroup, RemoveMemberOutcome};
use huddle_gateway::identity::Identity;
use huddle_types::api::{
    AddMemberRequest, CreateGroupRequest, GroupResponse, OnlineMembersResponse, ReadResponse,
    UpdateGroupRequest,
};
use huddle_types::models::{GroupAction, Membership, Role, UserStatus};
use huddle_types::{FieldError, HuddleError};

use crate::AppState;
use crate::error::ApiResult;

const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 1000;

fn validate_metadata(name: Option<&str>, description: Option<&str>) -> Result<(), HuddleError> {
    let mut errors = Vec::new();
    if let Some(name) = name {
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            errors.push(FieldError::new(
                "name",
                format!("must be 1-{} characters", MAX_NAME_LEN),
            ));
        }
    }
    if description.is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        errors.push(FieldError::new(
            "description",
            format!("must be at most {} characters", MAX_DESCRIPTION_LEN),
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HuddleError::Validation(errors))
    }
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    if identity.role != Role::Admin {
        return Err(HuddleError::forbidden("create groups", identity.role).into());
    }
    validate_metadata(Some(&req.name), req.description.as_deref())?;

    let new = NewGroup {
        id: Uuid::new_v4(),
        name: req.name.trim().to_string(),
        group_type: req.group_type,
        description: req.description,
        organization_id: identity.organization_id.clone(),
        created_by: identity.user_id,
        created_at: Utc::now(),
    };
    let group = state.store.call("create group", move |db| db.create_group(&new)).await?;

    info!("{} created group {} ({})", identity.username, group.name, group.id);
    Ok((
        StatusCode::CREATED,
        Json(GroupResponse {
            group,
            member_count: 1,
        }),
    ))
}

pub async fn list_groups(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<GroupResponse>>> {
    let groups = state.dispatcher.authority().accessible_groups(&identity).await?;

    let response = state
        .store
        .call("count group members", move |db| {
            groups
                .into_iter()
                .map(|group| {
                    let member_count = db.list_members(group.id)?.len();
                    Ok(GroupResponse {
                        group,
                        member_count,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;

    Ok(Json(response))
}

pub async fn update_group(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<UpdateGroupRequest>,
) -> ApiResult<Json<GroupResponse>> {
    state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, GroupAction::Manage)
        .await?;
    validate_metadata(req.name.as_deref(), req.description.as_deref())?;

    let (group, member_count) = state
        .store
        .call("update group", move |db| {
            let group = db.update_group(
                group_id,
                req.name.as_deref().map(str::trim),
                req.group_type,
                req.description.as_deref(),
            )?;
            let count = db.list_members(group_id)?.len();
            Ok((group, count))
        })
        .await?;
    let group = group.ok_or(HuddleError::NotFound)?;

    Ok(Json(GroupResponse {
        group,
        member_count,
    }))
}

pub async fn list_members(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Membership>>> {
    state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, GroupAction::Read)
        .await?;
    let members = state
        .store
        .call("list members", move |db| db.list_members(group_id))
        .await?;
    Ok(Json(members))
}

/// Add a member or change their group role. The user must be an active
/// account of the group's organization.
pub async fn add_member(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, GroupAction::Manage)
        .await?;

    let user_id = req.user_id;
    let user = state
        .store
        .call("load user", move |db| db.get_user(user_id))
        .await?
        .filter(|u| u.organization_id == group.organization_id && u.status == UserStatus::Active)
        .ok_or(HuddleError::NotFound)?;

    let role = req.role;
    let members = state
        .store
        .call("add member", move |db| {
            db.add_member(group_id, user_id, role, Utc::now())?;
            db.list_members(group_id)
        })
        .await?;

    info!("{} added {} to group {} as {}", identity.username, user.username, group_id, role);
    Ok((StatusCode::CREATED, Json(members)))
}

/// Remove a member. Members may always remove themselves; removing anyone
/// else needs `manage`. The last admin membership is never removed. The
/// user's live sessions leave the group's room at once.
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path((group_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    let action = if user_id == identity.user_id {
        GroupAction::Read
    } else {
        GroupAction::Manage
    };
    state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, action)
        .await?;

    let outcome = state
        .store
        .call("remove member", move |db| db.remove_member(group_id, user_id))
        .await?;

    match outcome {
        RemoveMemberOutcome::Removed => {
            state.dispatcher.revoke_membership(user_id, group_id).await;
            info!("{} removed {} from group {}", identity.username, user_id, group_id);
            Ok(StatusCode::NO_CONTENT)
        }
        RemoveMemberOutcome::NotMember => Err(HuddleError::NotFound.into()),
        RemoveMemberOutcome::LastAdmin => Err(HuddleError::invalid(
            "user_id",
            "the last admin of a group cannot be removed",
        )
        .into()),
    }
}

pub async fn online_members(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
) -> ApiResult<Json<OnlineMembersResponse>> {
    state
        .dispatcher
        .authority()
        .authorize(&identity, group_id, GroupAction::Read)
        .await?;

    let mut user_ids: Vec<Uuid> = state
        .dispatcher
        .registry()
        .members_online(group_id)
        .await
        .into_iter()
        .collect();
    user_ids.sort();

    Ok(Json(OnlineMembersResponse { group_id, user_ids }))
}

/// Mark everything unread in the group read for the caller.
pub async fn mark_group_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(group_id): Path<Uuid>,
) -> ApiResult<Json<ReadResponse>> {
    let message_ids = state
        .dispatcher
        .tracker()
        .mark_group_read(&identity, group_id)
        .await?;
    Ok(Json(ReadResponse { message_ids }))
}
