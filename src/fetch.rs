//! Resolves image references to raw bytes.
//!
//! Two modes: a plain HTTP(S) GET, or a lookup on a named file system driver
//! (`file`, `http`, `gcs`). No retries and no caching.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::auth::ServiceAccountCredentials;
use crate::error::FetchError;
use crate::types::ImageReference;

/// Timeout applied to plain URL downloads only.
pub const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

const GCS_DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const GCS_READ_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_only";

/// A named file system plus optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemDescriptor {
    pub name: String,
    pub credentials_path: Option<PathBuf>,
    /// Overrides the driver's service endpoint (GCS only).
    pub endpoint: Option<String>,
}

impl FileSystemDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credentials_path: None,
            endpoint: None,
        }
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FetchSource {
    #[default]
    Url,
    FileSystem(FileSystemDescriptor),
}

enum Driver<'a> {
    Http,
    Local,
    Gcs(&'a FileSystemDescriptor),
}

pub struct ByteFetcher {
    source: FetchSource,
    http: reqwest::Client,
    gcs_token: OnceCell<Option<String>>,
}

impl ByteFetcher {
    pub fn new(source: FetchSource) -> Self {
        Self {
            source,
            http: reqwest::Client::new(),
            gcs_token: OnceCell::new(),
        }
    }

    fn driver(&self) -> Result<Driver<'_>, FetchError> {
        match &self.source {
            FetchSource::Url => Ok(Driver::Http),
            FetchSource::FileSystem(fs) => match fs.name.as_str() {
                "http" | "https" => Ok(Driver::Http),
                "file" | "local" => Ok(Driver::Local),
                "gcs" | "gs" => Ok(Driver::Gcs(fs)),
                other => Err(FetchError::UnsupportedFileSystem(other.to_string())),
            },
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let bytes = match self.driver()? {
            Driver::Http => self.fetch_url(reference).await?,
            Driver::Local => read_local(reference).await?,
            Driver::Gcs(fs) => self.fetch_gcs(fs, reference).await?,
        };
        tracing::trace!(size = bytes.len(), "Fetched image");
        Ok(bytes)
    }

    /// Fetch every reference sequentially, preserving input order.
    pub async fn fetch_all(&self, references: &[ImageReference]) -> Result<Vec<Vec<u8>>, FetchError> {
        let mut images = Vec::with_capacity(references.len());
        for reference in references {
            images.push(self.fetch(reference).await?);
        }
        Ok(images)
    }

    async fn fetch_url(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        self.download(reference, self.url_request(reference)).await
    }

    fn url_request(&self, reference: &str) -> reqwest::RequestBuilder {
        self.http.get(reference).timeout(URL_FETCH_TIMEOUT)
    }

    async fn download(
        &self,
        reference: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, FetchError> {
        let http_err = |source| FetchError::Http {
            reference: reference.to_string(),
            source,
        };

        let resp = request.send().await.map_err(http_err)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                reference: reference.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                reference: reference.to_string(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(http_err)?;
        Ok(body.to_vec())
    }

    async fn fetch_gcs(&self, fs: &FileSystemDescriptor, reference: &str) -> Result<Vec<u8>, FetchError> {
        let mut request = self.gcs_request(fs, reference)?;
        if let Some(token) = self.gcs_token(fs).await? {
            request = request.bearer_auth(token);
        }
        self.download(reference, request).await
    }

    fn gcs_request(
        &self,
        fs: &FileSystemDescriptor,
        reference: &str,
    ) -> Result<reqwest::RequestBuilder, FetchError> {
        let (bucket, object) = split_gcs_reference(reference)?;
        let endpoint = fs.endpoint.as_deref().unwrap_or(GCS_DEFAULT_ENDPOINT);

        let mut url = reqwest::Url::parse(endpoint).map_err(|e| FetchError::InvalidReference {
            reference: reference.to_string(),
            message: format!("bad endpoint {endpoint}: {e}"),
        })?;
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidReference {
                reference: reference.to_string(),
                message: format!("endpoint {endpoint} cannot be a base URL"),
            })?
            .pop_if_empty()
            .extend(["storage", "v1", "b", bucket, "o", object]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(self.http.get(url))
    }

    async fn gcs_token(&self, fs: &FileSystemDescriptor) -> Result<Option<&String>, FetchError> {
        let token = self
            .gcs_token
            .get_or_try_init(|| async {
                let Some(path) = &fs.credentials_path else {
                    return Ok::<_, FetchError>(None);
                };
                let creds = ServiceAccountCredentials::from_file(path).await?;
                let token = creds.access_token(&self.http, GCS_READ_SCOPE).await?;
                Ok::<_, FetchError>(Some(token))
            })
            .await?;
        Ok(token.as_ref())
    }
}

async fn read_local(reference: &str) -> Result<Vec<u8>, FetchError> {
    let path = Path::new(reference.strip_prefix("file://").unwrap_or(reference));
    tokio::fs::read(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            FetchError::NotFound {
                reference: reference.to_string(),
            }
        } else {
            FetchError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Split `gs://bucket/path/to/object` (scheme optional) into bucket and object.
fn split_gcs_reference(reference: &str) -> Result<(&str, &str), FetchError> {
    let trimmed = reference
        .strip_prefix("gs://")
        .or_else(|| reference.strip_prefix("gcs://"))
        .unwrap_or(reference);

    match trimmed.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok((bucket, object)),
        _ => Err(FetchError::InvalidReference {
            reference: reference.to_string(),
            message: "expected bucket/object".to_string(),
        }),
    }
}
