//! HTTP surface for lessoncast: encrypted HLS manifests, keys and segments,
//! on-demand lesson conversion and the raw upload fallback.

pub mod error;
pub mod routes;
pub mod state;

pub use error::AppError;
pub use routes::create_router;
pub use state::{AppState, StateError};
