use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::auth::{CLOUD_PLATFORM_SCOPE, ServiceAccountCredentials};
use crate::engine::{ModerationProvider, ProviderFactory, ensure_batch_size};
use crate::error::ModerationError;
use crate::fetch::{ByteFetcher, FetchSource};
use crate::types::{ImageReference, Likelihood, ModerationRecord};

const PROVIDER: &str = "google";
const DEFAULT_BASE_URL: &str = "https://vision.googleapis.com";
const SAFE_SEARCH_DETECTION: &str = "SAFE_SEARCH_DETECTION";

/// Images per `images:annotate` call accepted by Cloud Vision.
pub const GOOGLE_MAX_BATCH_SIZE: usize = 15;

pub const SAFE_SEARCH_CATEGORIES: [&str; 5] = ["adult", "spoof", "medical", "violence", "racy"];

#[derive(Debug, Clone)]
pub enum GoogleCredentials {
    ServiceAccount(ServiceAccountCredentials),
    ServiceAccountFile(PathBuf),
    AccessToken(String),
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub struct GoogleVisionConfig {
    pub credentials: GoogleCredentials,
    pub base_url: String,
    pub fetch_source: FetchSource,
}

impl GoogleVisionConfig {
    pub fn new(credentials: GoogleCredentials) -> Self {
        Self {
            credentials,
            base_url: DEFAULT_BASE_URL.to_string(),
            fetch_source: FetchSource::Url,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_fetch_source(mut self, source: FetchSource) -> Self {
        self.fetch_source = source;
        self
    }
}

impl ProviderFactory for GoogleVisionConfig {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn max_batch_size(&self) -> usize {
        GOOGLE_MAX_BATCH_SIZE
    }

    fn build(&self) -> Result<Box<dyn ModerationProvider>, ModerationError> {
        Ok(Box::new(GoogleVisionClient::new(self.clone())))
    }
}

/// SafeSearch moderation through the Cloud Vision `images:annotate` endpoint.
///
/// Strict about response shape: a result count that differs from the number
/// of submitted images is an error.
pub struct GoogleVisionClient {
    config: GoogleVisionConfig,
    http: reqwest::Client,
    fetcher: ByteFetcher,
}

impl GoogleVisionClient {
    pub fn new(config: GoogleVisionConfig) -> Self {
        let fetcher = ByteFetcher::new(config.fetch_source.clone());
        Self {
            config,
            http: reqwest::Client::new(),
            fetcher,
        }
    }

    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ModerationError> {
        let builder = match &self.config.credentials {
            GoogleCredentials::ApiKey(key) => builder.query(&[("key", key)]),
            GoogleCredentials::AccessToken(token) => builder.bearer_auth(token),
            GoogleCredentials::ServiceAccount(creds) => {
                let token = creds.access_token(&self.http, CLOUD_PLATFORM_SCOPE).await?;
                builder.bearer_auth(token)
            }
            GoogleCredentials::ServiceAccountFile(path) => {
                let creds = ServiceAccountCredentials::from_file(path).await?;
                let token = creds.access_token(&self.http, CLOUD_PLATFORM_SCOPE).await?;
                builder.bearer_auth(token)
            }
        };
        Ok(builder)
    }
}

#[async_trait]
impl ModerationProvider for GoogleVisionClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn max_batch_size(&self) -> usize {
        GOOGLE_MAX_BATCH_SIZE
    }

    #[tracing::instrument(skip(self, images), fields(provider = PROVIDER, batch_size = images.len()))]
    async fn moderate_batch(
        &self,
        images: &[ImageReference],
    ) -> Result<Vec<ModerationRecord>, ModerationError> {
        ensure_batch_size(PROVIDER, images.len(), GOOGLE_MAX_BATCH_SIZE)?;
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let contents = self.fetcher.fetch_all(images).await?;

        let request = BatchAnnotateImagesRequest {
            requests: contents
                .iter()
                .map(|bytes| AnnotateImageRequest {
                    image: Image {
                        content: STANDARD.encode(bytes),
                    },
                    features: vec![Feature {
                        kind: SAFE_SEARCH_DETECTION,
                    }],
                })
                .collect(),
        };

        let url = format!(
            "{}/v1/images:annotate",
            self.config.base_url.trim_end_matches('/')
        );
        let builder = self.authorize(self.http.post(url).json(&request)).await?;

        tracing::debug!("Calling images:annotate");
        let resp = builder
            .send()
            .await
            .map_err(|e| ModerationError::provider(PROVIDER, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModerationError::provider(
                PROVIDER,
                format!("HTTP {status}: {body}"),
            ));
        }

        let response: BatchAnnotateImagesResponse = resp
            .json()
            .await
            .map_err(|e| ModerationError::provider(PROVIDER, format!("malformed response: {e}")))?;

        counter!("moderation_batches_total", "provider" => PROVIDER).increment(1);
        counter!("moderation_images_total", "provider" => PROVIDER).increment(images.len() as u64);

        records_from_response(images.len(), response)
    }
}

fn records_from_response(
    expected: usize,
    response: BatchAnnotateImagesResponse,
) -> Result<Vec<ModerationRecord>, ModerationError> {
    if response.responses.len() != expected {
        return Err(ModerationError::ResponseMismatch {
            provider: PROVIDER,
            expected,
            actual: response.responses.len(),
        });
    }

    Ok(response
        .responses
        .into_iter()
        .enumerate()
        .map(|(index, resp)| {
            // A failed image keeps an empty annotation, i.e. all UNKNOWN.
            let annotation = match resp.error {
                Some(err) => {
                    tracing::warn!(
                        index,
                        code = err.code,
                        message = %err.message,
                        "Image annotation failed"
                    );
                    SafeSearchAnnotation::default()
                }
                None => resp.safe_search_annotation.unwrap_or_default(),
            };
            ModerationRecord::new()
                .with_category("adult", annotation.adult)
                .with_category("spoof", annotation.spoof)
                .with_category("medical", annotation.medical)
                .with_category("violence", annotation.violence)
                .with_category("racy", annotation.racy)
        })
        .collect())
}

#[derive(Debug, Serialize)]
struct BatchAnnotateImagesRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
struct AnnotateImageRequest {
    image: Image,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct Image {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchAnnotateImagesResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    safe_search_annotation: Option<SafeSearchAnnotation>,
    #[serde(default)]
    error: Option<RpcStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct SafeSearchAnnotation {
    #[serde(default)]
    adult: Likelihood,
    #[serde(default)]
    spoof: Likelihood,
    #[serde(default)]
    medical: Likelihood,
    #[serde(default)]
    violence: Likelihood,
    #[serde(default)]
    racy: Likelihood,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}
