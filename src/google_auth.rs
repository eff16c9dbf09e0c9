//! Google service-account authentication.
//!
//! Mints an RS256 JWT from the service-account key and exchanges it for an
//! OAuth2 access token, cached until shortly before it expires.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive.readonly";

/// Seconds before expiry at which a cached token is refreshed.
const REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key: {:?}", path))?;
        Self::from_json(&json).with_context(|| format!("Invalid service account key: {:?}", path))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse service account JSON")
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(TOKEN_URI)
    }
}

struct CachedToken {
    access_token: String,
    expires_at: u64,
}

/// Token source for the Sheets and Drive APIs.
pub struct ServiceAccountAuth {
    key: ServiceAccountKey,
    token_cache: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    pub fn new(key: ServiceAccountKey) -> Self {
        Self {
            key,
            token_cache: Mutex::new(None),
        }
    }

    /// Get a valid OAuth2 access token, refreshing if expired.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        let mut cache = self.token_cache.lock().await;
        let now = now_secs();

        if let Some(cached) = cache.as_ref() {
            if now < cached.expires_at.saturating_sub(REFRESH_MARGIN_SECS) {
                return Ok(cached.access_token.clone());
            }
        }

        let jwt = self.signed_assertion(now)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let resp: TokenResponse = client
            .post(self.key.token_uri())
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .context("Token exchange request failed")?
            .error_for_status()
            .context("Token exchange returned error")?
            .json()
            .await
            .context("Failed to parse token response")?;

        debug!(
            "Obtained access token for {} (expires in {}s)",
            self.key.client_email, resp.expires_in
        );

        let token = resp.access_token.clone();
        *cache = Some(CachedToken {
            access_token: resp.access_token,
            expires_at: now + resp.expires_in,
        });

        Ok(token)
    }

    fn signed_assertion(&self, now: u64) -> Result<String> {
        let claims = serde_json::json!({
            "iss": self.key.client_email,
            "scope": SHEETS_SCOPES,
            "aud": self.key.token_uri(),
            "iat": now,
            "exp": now + 3600,
        });

        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("Invalid RSA private key in service account JSON")?;

        jsonwebtoken::encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
