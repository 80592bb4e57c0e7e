//! Router assembly.

pub mod health;
pub mod media;
pub mod uploads;

use axum::http::{HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full application router: health at the root, media and uploads
/// under their configured prefixes, CORS and request tracing on top.
pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let media_prefix = state.routes().media_prefix().to_string();
    let uploads_prefix = state.routes().uploads_prefix().to_string();

    Router::new()
        .merge(health::router())
        .merge(mount(&media_prefix, media::router()))
        .merge(mount(&uploads_prefix, uploads::router()))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(allowed_origins))
        .with_state(state)
}

fn mount(prefix: &str, router: Router<AppState>) -> Router<AppState> {
    if prefix.is_empty() {
        router
    } else {
        Router::new().nest(prefix, router)
    }
}

/// Any origin when the list is empty; unparseable origins are skipped with a
/// warning.
pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let allow_origin = if allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}
