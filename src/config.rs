use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::ProviderFactory;
use crate::executor::ExecutorConfig;
use crate::fetch::{FetchSource, FileSystemDescriptor};
use crate::google_vision::{GoogleCredentials, GoogleVisionConfig};
use crate::step::{DEFAULT_DETAILS_FIELD, DEFAULT_IMAGE_FIELD};
use crate::yandex_vision::{YandexCredentials, YandexVisionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    Google,
    Yandex,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Moderation provider to use
    #[arg(long, env = "PROVIDER", value_enum)]
    pub provider: ProviderKind,

    /// Directory holding the table catalog
    #[arg(long, env = "STORE_PATH", default_value = "./data")]
    pub store_path: PathBuf,

    /// Input table name
    #[arg(long, env = "INPUT_TABLE")]
    pub input_table: String,

    /// Output table name
    #[arg(long, env = "OUTPUT_TABLE")]
    pub output_table: String,

    /// Input column holding the image URL or path
    #[arg(long, env = "IMAGE_FIELD", default_value = DEFAULT_IMAGE_FIELD)]
    pub image_field: String,

    /// Output column receiving the moderation result
    #[arg(long, env = "DETAILS_FIELD", default_value = DEFAULT_DETAILS_FIELD)]
    pub details_field: String,

    /// Step name (defaults to image_classification_<provider>)
    #[arg(long, env = "STEP_NAME")]
    pub step_name: Option<String>,

    /// Step labels in format "team=trust,env=prod"
    #[arg(long, env = "STEP_LABELS")]
    pub labels: Option<String>,

    /// Number of chunks processed concurrently
    #[arg(long, env = "WORKERS", default_value = "1")]
    pub workers: usize,

    /// Reprocess all rows instead of only changed ones
    #[arg(long)]
    pub full: bool,

    /// Fail instead of creating a missing output table
    #[arg(long, env = "NO_CREATE_TABLE")]
    pub no_create_table: bool,

    /// Path to a Google service account JSON file
    #[arg(long, env = "GOOGLE_CREDENTIALS_PATH")]
    pub google_credentials_path: Option<PathBuf>,

    /// Google API key
    #[arg(long, env = "GOOGLE_API_KEY")]
    pub google_api_key: Option<String>,

    /// Pre-issued Google OAuth access token
    #[arg(long, env = "GOOGLE_ACCESS_TOKEN")]
    pub google_access_token: Option<String>,

    /// Yandex Passport OAuth token
    #[arg(long, env = "YANDEX_OAUTH_TOKEN")]
    pub yandex_oauth_token: Option<String>,

    /// Yandex IAM token
    #[arg(long, env = "YANDEX_IAM_TOKEN")]
    pub yandex_iam_token: Option<String>,

    /// Yandex API key
    #[arg(long, env = "YANDEX_API_KEY")]
    pub yandex_api_key: Option<String>,

    /// Yandex Cloud folder ID
    #[arg(long, env = "YANDEX_FOLDER_ID")]
    pub yandex_folder_id: Option<String>,

    /// File system holding the images (file, gcs, http); plain URLs when unset
    #[arg(long, env = "FILE_SYSTEM")]
    pub file_system: Option<String>,

    /// Credentials file for the file system
    #[arg(long, env = "FILE_SYSTEM_CREDS_PATH")]
    pub file_system_creds_path: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.max(1),
        }
    }
}

impl Config {
    pub fn parse_labels(&self) -> Vec<(String, String)> {
        self.labels
            .as_ref()
            .map(|labels| {
                labels
                    .split(',')
                    .filter_map(|pair| {
                        let (key, value) = pair.split_once('=')?;
                        let key = key.trim();
                        (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn fetch_source(&self) -> FetchSource {
        match &self.file_system {
            None => FetchSource::Url,
            Some(name) => {
                let mut fs = FileSystemDescriptor::new(name.clone());
                if let Some(path) = &self.file_system_creds_path {
                    fs = fs.with_credentials_path(path.clone());
                }
                FetchSource::FileSystem(fs)
            }
        }
    }

    pub fn provider_factory(&self) -> Result<Arc<dyn ProviderFactory>> {
        let factory: Arc<dyn ProviderFactory> = match self.provider {
            ProviderKind::Google => {
                let credentials = if let Some(path) = &self.google_credentials_path {
                    GoogleCredentials::ServiceAccountFile(path.clone())
                } else if let Some(token) = &self.google_access_token {
                    GoogleCredentials::AccessToken(token.clone())
                } else if let Some(key) = &self.google_api_key {
                    GoogleCredentials::ApiKey(key.clone())
                } else {
                    bail!(
                        "Google provider needs --google-credentials-path, --google-access-token or --google-api-key"
                    );
                };
                Arc::new(GoogleVisionConfig::new(credentials).with_fetch_source(self.fetch_source()))
            }
            ProviderKind::Yandex => {
                let Some(folder_id) = &self.yandex_folder_id else {
                    bail!("Yandex provider needs --yandex-folder-id");
                };
                let credentials = if let Some(token) = &self.yandex_iam_token {
                    YandexCredentials::IamToken(token.clone())
                } else if let Some(token) = &self.yandex_oauth_token {
                    YandexCredentials::OAuthToken(token.clone())
                } else if let Some(key) = &self.yandex_api_key {
                    YandexCredentials::ApiKey(key.clone())
                } else {
                    bail!(
                        "Yandex provider needs --yandex-iam-token, --yandex-oauth-token or --yandex-api-key"
                    );
                };
                Arc::new(
                    YandexVisionConfig::new(credentials, folder_id.clone())
                        .with_fetch_source(self.fetch_source()),
                )
            }
        };
        Ok(factory)
    }
}
