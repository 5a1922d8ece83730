//! Google service-account credentials and the OAuth 2.0 JWT bearer grant.
//!
//! Shared by the Google Vision client and the GCS file system driver. Tokens
//! are not cached: every client is built fresh per chunk and asks once.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AuthError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Service account credential subset (fields required for the JWT flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountCredentials {
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        serde_json::from_str::<Self>(json).map_err(AuthError::InvalidServiceAccount)
    }

    pub async fn from_file(path: &Path) -> Result<Self, AuthError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| AuthError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&json)
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Exchange a signed assertion for a bearer access token.
    #[tracing::instrument(skip(self, http), fields(client_email = %self.client_email))]
    pub async fn access_token(&self, http: &reqwest::Client, scope: &str) -> Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.client_email.clone(),
            scope: scope.to_string(),
            aud: self.token_uri().to_string(),
            iat: now,
            exp: now + 3600,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some("JWT".to_string());
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(AuthError::InvalidKey)?;
        let assertion = encode(&header, &claims, &key).map_err(AuthError::Signing)?;

        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ];

        let request_err = |source| AuthError::TokenRequest {
            endpoint: self.token_uri().to_string(),
            source,
        };
        let resp = http
            .post(self.token_uri())
            .form(&form)
            .send()
            .await
            .map_err(request_err)?
            .error_for_status()
            .map_err(request_err)?;

        let token: TokenResponse = resp.json().await.map_err(|source| AuthError::TokenResponse {
            endpoint: self.token_uri().to_string(),
            source,
        })?;

        tracing::debug!(expires_in = token.expires_in, "Obtained access token");
        Ok(token.access_token)
    }
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}
