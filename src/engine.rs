use async_trait::async_trait;

use crate::error::ModerationError;
use crate::types::{ImageReference, ModerationRecord};

/// A moderation backend able to classify one bounded batch of images per call.
#[async_trait]
pub trait ModerationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hard ceiling on images per `moderate_batch` call.
    fn max_batch_size(&self) -> usize;

    /// Returns exactly one record per image, in input order.
    async fn moderate_batch(
        &self,
        images: &[ImageReference],
    ) -> Result<Vec<ModerationRecord>, ModerationError>;
}

/// Immutable provider configuration that builds a fresh client per chunk.
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn max_batch_size(&self) -> usize;

    fn build(&self) -> Result<Box<dyn ModerationProvider>, ModerationError>;
}

/// Reject batches above the provider ceiling before any I/O happens.
pub fn ensure_batch_size(
    provider: &'static str,
    len: usize,
    max: usize,
) -> Result<(), ModerationError> {
    if len > max {
        return Err(ModerationError::Validation { provider, len, max });
    }
    Ok(())
}
