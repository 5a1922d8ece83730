//! Typed errors for fetching, moderation and table storage.
//!
//! Orchestration code (executor, steps, binary) wraps these in `anyhow::Error`
//! with step context; callers can still `downcast_ref` to the variants below.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to load service-account credentials or exchange them for a token.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid service account JSON: {0}")]
    InvalidServiceAccount(#[source] serde_json::Error),

    #[error("invalid RSA private key (PEM): {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),

    #[error("failed to sign JWT: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("token request to {endpoint} failed: {source}")]
    TokenRequest {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed token response from {endpoint}: {source}")]
    TokenResponse {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Failure to resolve an image reference to bytes.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {reference} failed: {source}")]
    Http {
        reference: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{reference} returned HTTP {status}")]
    Status { reference: String, status: u16 },

    #[error("{reference} does not exist")]
    NotFound { reference: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid reference {reference}: {message}")]
    InvalidReference { reference: String, message: String },

    #[error("unsupported file system `{0}`")]
    UnsupportedFileSystem(String),

    #[error("file system credentials error: {0}")]
    Credentials(#[from] AuthError),
}

/// Errors raised by a moderation provider client.
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Batch exceeds the provider ceiling. Raised before any network activity.
    #[error("{provider} accepts at most {max} images per batch, got {len}")]
    Validation {
        provider: &'static str,
        len: usize,
        max: usize,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{provider} request failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("credentials error: {0}")]
    Credentials(#[from] AuthError),

    #[error("{provider} returned {actual} results for {expected} images")]
    ResponseMismatch {
        provider: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl ModerationError {
    pub(crate) fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }
}

/// Errors from the table catalog.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` not found")]
    TableNotFound(String),

    #[error("invalid table name `{0}`")]
    InvalidTableName(String),

    #[error("column `{column}` not found in {context}")]
    ColumnNotFound { column: String, context: String },

    #[error("schema mismatch for table `{table}`: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
