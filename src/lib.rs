//! Batch image moderation as an incremental pipeline step.
//!
//! An [`ImageClassificationStep`](step::ImageClassificationStep) reads image
//! references from a tracked input table, classifies them in provider-sized
//! chunks through a [`ModerationProvider`](engine::ModerationProvider) and
//! writes one moderation record per primary key to the output table.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod google_vision;
pub mod step;
pub mod table;
pub mod types;
pub mod yandex_vision;

pub use engine::{ModerationProvider, ProviderFactory};
pub use error::{AuthError, FetchError, ModerationError, StoreError};
pub use step::ImageClassificationStep;
pub use types::{CategoryValue, Likelihood, ModerationRecord};
