use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use huddle_gateway::identity::bearer;
use huddle_types::HuddleError;

use crate::AppState;
use crate::error::ApiError;

/// Resolve the bearer token into an `Identity` request extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer)
        .ok_or(HuddleError::Authentication)?
        .to_string();

    let identity = state.identity.verify(&token).await?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
