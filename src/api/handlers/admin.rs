use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{Html, Response};

use crate::api::response::plain_text;
use crate::statistics::{Counter, Statistics, StatisticsSink};
use crate::AppState;

const UPLOAD_FORM: &str = "<!DOCTYPE html><html><head><title>Upload</title></head><body>\
<form method='post' enctype='multipart/form-data'>\
<input type='hidden' name='redirect' value='1'/>\
<input type='file' name='uploaded_file'/>\
<input type='submit' value='Upload'/>\
</form>\
</body></html>\n";

// ============================================================================
// Handlers
// ============================================================================

/// A bare form for trying uploads from a browser.
pub async fn upload_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

pub async fn statistics(State(state): State<Arc<AppState>>) -> Response {
    state.replication.report_metrics(state.statistics.as_ref());
    plain_text(StatusCode::OK, state.statistics.render())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.health.is_healthy() {
        plain_text(StatusCode::OK, "Online")
    } else {
        plain_text(StatusCode::SERVICE_UNAVAILABLE, "Offline")
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Keeps `connections_current` equal to the number of requests in flight.
pub async fn track_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    state.statistics.increment(Counter::ConnectionsCurrent);
    let _guard = InFlight(Arc::clone(&state.statistics));
    next.run(request).await
}

struct InFlight(Arc<Statistics>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.decrement(Counter::ConnectionsCurrent);
    }
}
