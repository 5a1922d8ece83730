use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::engine::{ModerationProvider, ProviderFactory, ensure_batch_size};
use crate::error::{AuthError, ModerationError};
use crate::fetch::{ByteFetcher, FetchSource};
use crate::types::{ImageReference, ModerationRecord};

const PROVIDER: &str = "yandex";
const DEFAULT_BASE_URL: &str = "https://vision.api.cloud.yandex.net";
const DEFAULT_IAM_URL: &str = "https://iam.api.cloud.yandex.net";
const CLASSIFICATION: &str = "CLASSIFICATION";
const MODERATION_MODEL: &str = "moderation";

/// Images per `batchAnalyze` call accepted by Yandex Vision.
pub const YANDEX_MAX_BATCH_SIZE: usize = 5;

pub const MODERATION_CATEGORIES: [&str; 4] = ["adult", "gruesome", "text", "watermarks"];

/// The record every image gets unless the response carries data for it.
/// Scores are integer zeros.
pub fn default_record() -> ModerationRecord {
    MODERATION_CATEGORIES
        .iter()
        .fold(ModerationRecord::new(), |record, name| record.with_category(*name, 0_i64))
}

#[derive(Debug, Clone)]
pub enum YandexCredentials {
    /// Yandex Passport OAuth token, exchanged for an IAM token per client.
    OAuthToken(String),
    IamToken(String),
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub struct YandexVisionConfig {
    pub credentials: YandexCredentials,
    pub folder_id: String,
    pub base_url: String,
    pub iam_url: String,
    pub fetch_source: FetchSource,
}

impl YandexVisionConfig {
    pub fn new(credentials: YandexCredentials, folder_id: impl Into<String>) -> Self {
        Self {
            credentials,
            folder_id: folder_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            iam_url: DEFAULT_IAM_URL.to_string(),
            fetch_source: FetchSource::Url,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_iam_url(mut self, iam_url: impl Into<String>) -> Self {
        self.iam_url = iam_url.into();
        self
    }

    pub fn with_fetch_source(mut self, source: FetchSource) -> Self {
        self.fetch_source = source;
        self
    }
}

impl ProviderFactory for YandexVisionConfig {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn max_batch_size(&self) -> usize {
        YANDEX_MAX_BATCH_SIZE
    }

    fn build(&self) -> Result<Box<dyn ModerationProvider>, ModerationError> {
        Ok(Box::new(YandexVisionClient::new(self.clone())))
    }
}

/// Moderation through the Yandex Vision `batchAnalyze` endpoint.
///
/// Tolerates short or partially failed responses: every slot starts as
/// [`default_record`] and is replaced only when the provider returned
/// classification data at that position.
pub struct YandexVisionClient {
    config: YandexVisionConfig,
    http: reqwest::Client,
    fetcher: ByteFetcher,
}

impl YandexVisionClient {
    pub fn new(config: YandexVisionConfig) -> Self {
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
            YandexCredentials::ApiKey(key) => {
                builder.header(reqwest::header::AUTHORIZATION, format!("Api-Key {key}"))
            }
            YandexCredentials::IamToken(token) => builder.bearer_auth(token),
            YandexCredentials::OAuthToken(oauth) => builder.bearer_auth(self.iam_token(oauth).await?),
        };
        Ok(builder)
    }

    #[tracing::instrument(skip_all)]
    async fn iam_token(&self, oauth_token: &str) -> Result<String, ModerationError> {
        let url = format!("{}/iam/v1/tokens", self.config.iam_url.trim_end_matches('/'));
        let request_err = |source| AuthError::TokenRequest {
            endpoint: url.clone(),
            source,
        };
        let resp = self
            .http
            .post(url.as_str())
            .json(&IamTokenRequest {
                yandex_passport_oauth_token: oauth_token,
            })
            .send()
            .await
            .map_err(request_err)?
            .error_for_status()
            .map_err(request_err)?;

        let token: IamTokenResponse = resp.json().await.map_err(|source| AuthError::TokenResponse {
            endpoint: url.clone(),
            source,
        })?;
        Ok(token.iam_token)
    }
}

#[async_trait]
impl ModerationProvider for YandexVisionClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn max_batch_size(&self) -> usize {
        YANDEX_MAX_BATCH_SIZE
    }

    #[tracing::instrument(skip(self, images), fields(provider = PROVIDER, batch_size = images.len()))]
    async fn moderate_batch(
        &self,
        images: &[ImageReference],
    ) -> Result<Vec<ModerationRecord>, ModerationError> {
        ensure_batch_size(PROVIDER, images.len(), YANDEX_MAX_BATCH_SIZE)?;
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let contents = self.fetcher.fetch_all(images).await?;

        let request = BatchAnalyzeRequest {
            folder_id: &self.config.folder_id,
            analyze_specs: contents
                .iter()
                .map(|bytes| AnalyzeSpec {
                    content: STANDARD.encode(bytes),
                    features: vec![Feature {
                        kind: CLASSIFICATION,
                        classification_config: ClassificationConfig {
                            model: MODERATION_MODEL,
                        },
                    }],
                })
                .collect(),
        };

        let url = format!(
            "{}/vision/v1/batchAnalyze",
            self.config.base_url.trim_end_matches('/')
        );
        let builder = self.authorize(self.http.post(url).json(&request)).await?;

        tracing::debug!("Calling batchAnalyze");
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

        let response: BatchAnalyzeResponse = resp
            .json()
            .await
            .map_err(|e| ModerationError::provider(PROVIDER, format!("malformed response: {e}")))?;

        counter!("moderation_batches_total", "provider" => PROVIDER).increment(1);
        counter!("moderation_images_total", "provider" => PROVIDER).increment(images.len() as u64);

        Ok(records_from_response(images.len(), response))
    }
}

fn records_from_response(expected: usize, response: BatchAnalyzeResponse) -> Vec<ModerationRecord> {
    let mut records = vec![default_record(); expected];

    if response.results.len() != expected {
        tracing::warn!(
            expected,
            actual = response.results.len(),
            "Yandex returned a different number of results than images submitted"
        );
    }

    for (index, result) in response.results.into_iter().enumerate().take(expected) {
        let properties = result
            .results
            .into_iter()
            .next()
            .and_then(|r| r.classification)
            .map(|c| c.properties);

        let Some(properties) = properties else {
            tracing::warn!(index, error = ?result.error, "No classification for image, keeping defaults");
            continue;
        };

        records[index] = properties
            .into_iter()
            .fold(records[index].clone(), |record, prop| {
                record.with_category(prop.name, prop.probability)
            });
    }

    records
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IamTokenRequest<'a> {
    yandex_passport_oauth_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamTokenResponse {
    iam_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchAnalyzeRequest<'a> {
    folder_id: &'a str,
    analyze_specs: Vec<AnalyzeSpec>,
}

#[derive(Debug, Serialize)]
struct AnalyzeSpec {
    content: String,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    classification_config: ClassificationConfig,
}

#[derive(Debug, Serialize)]
struct ClassificationConfig {
    model: &'static str,
}

#[derive(Debug, Deserialize)]
struct BatchAnalyzeResponse {
    #[serde(default)]
    results: Vec<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    results: Vec<FeatureResult>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FeatureResult {
    #[serde(default)]
    classification: Option<ClassAnnotation>,
}

#[derive(Debug, Deserialize)]
struct ClassAnnotation {
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Debug, Deserialize)]
struct Property {
    name: String,
    #[serde(default)]
    probability: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CategoryValue;

    fn parse(json: serde_json::Value) -> BatchAnalyzeResponse {
        serde_json::from_value(json).unwrap()
    }

    fn classified(adult: f64) -> serde_json::Value {
        serde_json::json!({
            "results": [{
                "classification": {
                    "properties": [
                        {"name": "adult", "probability": adult},
                        {"name": "gruesome", "probability": 0.01},
                        {"name": "text", "probability": 0.2},
                        {"name": "watermarks", "probability": 0.3}
                    ]
                }
            }]
        })
    }

    #[test]
    fn default_record_has_four_zero_categories() {
        let record = default_record();
        assert_eq!(record.len(), 4);
        for name in MODERATION_CATEGORIES {
            assert_eq!(record.get(name), Some(&CategoryValue::Integer(0)));
        }
    }

    #[test]
    fn short_response_keeps_defaults_for_missing_positions() {
        let response = parse(serde_json::json!({"results": [classified(0.9)]}));
        let records = records_from_response(3, response);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].get("adult"), Some(&CategoryValue::Probability(0.9)));
        assert_eq!(records[1], default_record());
        assert_eq!(records[2], default_record());
    }

    #[test]
    fn failed_entry_in_the_middle_keeps_its_default() {
        let response = parse(serde_json::json!({
            "results": [
                classified(0.1),
                {"error": {"code": 3, "message": "image is corrupted"}},
                classified(0.7)
            ]
        }));
        let records = records_from_response(3, response);

        assert_eq!(records[0].get("adult"), Some(&CategoryValue::Probability(0.1)));
        assert_eq!(records[1], default_record());
        assert_eq!(records[2].get("adult"), Some(&CategoryValue::Probability(0.7)));
    }

    #[test]
    fn surplus_results_are_ignored() {
        let response = parse(serde_json::json!({"results": [classified(0.5), classified(0.6)]}));
        let records = records_from_response(1, response);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("adult"), Some(&CategoryValue::Probability(0.5)));
    }

    #[test]
    fn request_uses_the_moderation_model() {
        let request = BatchAnalyzeRequest {
            folder_id: "b1g",
            analyze_specs: vec![AnalyzeSpec {
                content: "AAAA".to_string(),
                features: vec![Feature {
                    kind: CLASSIFICATION,
                    classification_config: ClassificationConfig {
                        model: MODERATION_MODEL,
                    },
                }],
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "folderId": "b1g",
                "analyzeSpecs": [{
                    "content": "AAAA",
                    "features": [{
                        "type": "CLASSIFICATION",
                        "classificationConfig": {"model": "moderation"}
                    }]
                }]
            })
        );
    }
}
