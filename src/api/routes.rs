use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::replication::MISSING_PATH;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Browser upload form, and uploads to the default directory
        .route("/", get(handlers::upload_form).post(handlers::create_object))
        // Replication and collaborators
        .route(
            MISSING_PATH,
            put(handlers::missing_objects).post(handlers::missing_objects),
        )
        .route("/_statistics", get(handlers::statistics))
        .route(&state.config.health.path, get(handlers::health))
        // Objects
        .route(
            "/*path",
            get(handlers::get_object)
                .post(handlers::create_object)
                .put(handlers::place_object),
        )
        // Upload size is enforced by the store while streaming
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            handlers::track_requests,
        ));

    if !state.config.quiet {
        router = router.layer(TraceLayer::new_for_http());
    }

    router.with_state(state)
}
