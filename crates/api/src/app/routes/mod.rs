use axum::Router;

pub mod await_item;
pub mod domain_event_store;
pub mod replay;

/// Router for all protocol endpoints, each under its versioned prefix.
pub fn router() -> Router {
    Router::new()
        .nest("/await-domain-event/v2", await_item::router())
        .nest("/domain-event-store/v2", domain_event_store::router())
        .nest("/perform-replay/v2", replay::router())
}
