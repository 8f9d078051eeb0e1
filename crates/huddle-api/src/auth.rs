use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use huddle_db::NewUser;
use huddle_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use huddle_types::models::{Role, UserStatus};
use huddle_types::{FieldError, HuddleError};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

fn validate_registration(req: &RegisterRequest) -> Result<(), HuddleError> {
    let mut errors = Vec::new();

    let name_ok = req
        .username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if req.username.len() < 3 || req.username.len() > 32 || !name_ok {
        errors.push(FieldError::new(
            "username",
            "3-32 characters: letters, digits, '_', '-' or '.'",
        ));
    }
    if req.password.len() < 8 {
        errors.push(FieldError::new("password", "must be at least 8 characters"));
    }
    if req.organization.trim().is_empty() || req.organization.len() > 64 {
        errors.push(FieldError::new("organization", "must be 1-64 characters"));
    }
    if req.display_name.as_ref().is_some_and(|d| d.trim().is_empty() || d.len() > 64) {
        errors.push(FieldError::new("display_name", "must be 1-64 characters"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(HuddleError::Validation(errors))
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    validate_registration(&req)?;

    let username = req.username.clone();
    let taken = state
        .store
        .call("check username", move |db| db.get_user_by_username(&username))
        .await?
        .is_some();
    if taken {
        return Err(HuddleError::invalid("username", "already taken").into());
    }

    // Argon2id with a fresh salt
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::internal("password hashing", e))?
        .to_string();

    let new = NewUser {
        id: Uuid::new_v4(),
        display_name: req.display_name.unwrap_or_else(|| req.username.clone()),
        username: req.username,
        password_hash,
        organization_id: req.organization.trim().to_string(),
        role: Role::Volunteer,
        created_at: Utc::now(),
    };
    let user = state.store.call("create user", move |db| db.create_user(&new)).await?;

    let token = state
        .identity
        .issue(&user)
        .map_err(|e| ApiError::internal("token signing", e))?;

    info!("Registered {} in {} as {}", user.username, user.organization_id, user.role);
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            role: user.role,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let username = req.username.clone();
    let row = state
        .store
        .call("load user for login", move |db| db.get_user_by_username(&username))
        .await?
        .ok_or(HuddleError::Authentication)?;

    let parsed_hash =
        PasswordHash::new(&row.password).map_err(|e| ApiError::internal("password hash parse", e))?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        warn!("Failed login for {}", req.username);
        return Err(HuddleError::Authentication.into());
    }

    if row.user.status != UserStatus::Active {
        warn!("Login refused for inactive user {}", row.user.username);
        return Err(HuddleError::Authentication.into());
    }

    let token = state
        .identity
        .issue(&row.user)
        .map_err(|e| ApiError::internal("token signing", e))?;

    Ok(Json(LoginResponse {
        user_id: row.user.id,
        username: row.user.username,
        role: row.user.role,
        token,
    }))
}
