pub mod error;
pub mod models;
pub mod store;

pub use error::{LessonError, LessonResult};
pub use models::{Lesson, LessonVideoReference, RenditionState};
pub use store::{SqliteLessonStore, SqliteLessonStoreBuilder};
