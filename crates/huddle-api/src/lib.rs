pub mod auth;
pub mod error;
pub mod groups;
pub mod messages;
pub mod middleware;
pub mod users;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use huddle_gateway::dispatcher::Dispatcher;
use huddle_gateway::identity::IdentityResolver;
use huddle_gateway::store::Store;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Store,
    pub identity: IdentityResolver,
    pub dispatcher: Dispatcher,
}

impl AppStateInner {
    pub fn new(dispatcher: Dispatcher) -> AppState {
        Arc::new(Self {
            store: dispatcher.store().clone(),
            identity: dispatcher.identity().clone(),
            dispatcher,
        })
    }
}

/// Request-style routes. Everything except register and login requires a
/// bearer token.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/users/{user_id}/role", put(users::update_role))
        .route("/users/{user_id}", axum::routing::delete(users::deactivate))
        .route("/groups", get(groups::list_groups).post(groups::create_group))
        .route("/groups/{group_id}", put(groups::update_group))
        .route("/groups/{group_id}/members", get(groups::list_members).post(groups::add_member))
        .route(
            "/groups/{group_id}/members/{user_id}",
            axum::routing::delete(groups::remove_member),
        )
        .route("/groups/{group_id}/online", get(groups::online_members))
        .route("/groups/{group_id}/read", post(groups::mark_group_read))
        .route(
            "/groups/{group_id}/messages",
            get(messages::list_messages).post(messages::create_message),
        )
        .route("/messages/search", get(messages::search_messages))
        .route(
            "/messages/{message_id}",
            get(messages::get_message)
                .put(messages::edit_message)
                .delete(messages::delete_message),
        )
        .route("/messages/{message_id}/tags", post(messages::add_tags))
        .route("/messages/{message_id}/status", get(messages::message_status))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
