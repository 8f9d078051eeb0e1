use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;
use uuid::Uuid;

use huddle_gateway::identity::Identity;
use huddle_types::HuddleError;
use huddle_types::api::UpdateRoleRequest;
use huddle_types::models::{Role, User};

use crate::AppState;
use crate::error::ApiResult;

/// Only a global admin manages accounts, and only inside their organization.
async fn load_managed_user(
    state: &AppState,
    identity: &Identity,
    user_id: Uuid,
    action: &str,
) -> Result<User, HuddleError> {
    if identity.role != Role::Admin {
        return Err(HuddleError::forbidden(action, identity.role));
    }
    state
        .store
        .call("load user", move |db| db.get_user(user_id))
        .await?
        .filter(|u| u.organization_id == identity.organization_id)
        .ok_or(HuddleError::NotFound)
}

pub async fn update_role(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> ApiResult<Json<User>> {
    let mut user = load_managed_user(&state, &identity, user_id, "change user roles").await?;

    let role = req.role;
    state
        .store
        .call("set user role", move |db| db.set_user_role(user_id, role))
        .await?;

    state.dispatcher.refresh_user(user_id).await?;

    info!("{} set role of {} to {}", identity.username, user.username, role);
    user.role = role;
    Ok(Json(user))
}

/// Accounts are never hard-deleted; the user is flagged inactive, can no
/// longer authenticate, and is dropped from every live room.
pub async fn deactivate(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let user = load_managed_user(&state, &identity, user_id, "deactivate users").await?;
    if user.id == identity.user_id {
        return Err(HuddleError::invalid("user_id", "cannot deactivate your own account").into());
    }

    state
        .store
        .call("deactivate user", move |db| db.deactivate_user(user_id))
        .await?;

    state.dispatcher.refresh_user(user_id).await?;

    info!("{} deactivated {}", identity.username, user.username);
    Ok(StatusCode::NO_CONTENT)
}
