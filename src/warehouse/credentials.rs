//! Bearer tokens for warehouse calls.
//!
//! Tokens from the metadata server or a service-account key are cached until
//! shortly before they expire. The cache sits behind one async lock, so the
//! concurrent queries of a request batch share a single fetch.

use super::QueryError;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// OAuth scope requested for service-account tokens.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
const REFRESH_MARGIN_SECONDS: i64 = 60;

/// Where the bearer token for warehouse calls comes from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// A pre-issued OAuth access token.
    Static(String),
    /// A service-account JSON key file.
    ServiceAccountFile(PathBuf),
    /// The GCE metadata server of the host the service runs on.
    MetadataServer { url: String },
}

/// The fields of a Google service-account key file this client needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid service-account key: {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Token endpoint response, shared by the metadata server and OAuth.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    300
}

struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

enum Source {
    Static(String),
    Fetched(Endpoint),
}

enum Endpoint {
    ServiceAccount {
        key: ServiceAccountKey,
        signing_key: EncodingKey,
    },
    Metadata {
        url: String,
    },
}

/// Hands out bearer tokens for one [`CredentialSource`].
pub struct TokenProvider {
    source: Source,
    http_client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Key files are read and parsed here, so a bad key fails startup.
    pub fn new(source: &CredentialSource, http_client: reqwest::Client) -> Result<Self> {
        let source = match source {
            CredentialSource::Static(token) => Source::Static(token.clone()),
            CredentialSource::MetadataServer { url } => {
                Source::Fetched(Endpoint::Metadata { url: url.clone() })
            }
            CredentialSource::ServiceAccountFile(path) => {
                let key = ServiceAccountKey::from_file(path)?;
                let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                    .with_context(|| {
                        format!("Invalid private key in credentials file: {}", path.display())
                    })?;
                Source::Fetched(Endpoint::ServiceAccount { key, signing_key })
            }
        };

        Ok(Self {
            source,
            http_client,
            cached: Mutex::new(None),
        })
    }

    /// A token valid for at least the refresh margin.
    pub async fn token(&self) -> Result<String, QueryError> {
        let endpoint = match &self.source {
            Source::Static(token) => return Ok(token.clone()),
            Source::Fetched(endpoint) => endpoint,
        };

        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| now < t.refresh_at) {
            return Ok(token.value.clone());
        }

        let grant = self.fetch(endpoint, now).await?;
        debug!("Fetched warehouse token valid for {}s", grant.expires_in);
        let value = grant.access_token.clone();
        *cached = Some(CachedToken {
            value: grant.access_token,
            refresh_at: now + Duration::seconds(grant.expires_in - REFRESH_MARGIN_SECONDS),
        });
        Ok(value)
    }

    /// Drop the cached token after the warehouse rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch(
        &self,
        endpoint: &Endpoint,
        now: DateTime<Utc>,
    ) -> Result<TokenGrant, QueryError> {
        let request = match endpoint {
            Endpoint::Metadata { url } => self
                .http_client
                .get(url)
                .header("Metadata-Flavor", "Google"),
            Endpoint::ServiceAccount { key, signing_key } => {
                let assertion = sign_assertion(key, signing_key, now.timestamp())?;
                self.http_client
                    .post(&key.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| QueryError::Authorization(format!("Cannot reach token endpoint: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Authorization(format!(
                "Token endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| QueryError::Authorization(format!("Invalid token response: {}", e)))
    }
}

fn sign_assertion(
    key: &ServiceAccountKey,
    signing_key: &EncodingKey,
    now: i64,
) -> Result<String, QueryError> {
    let claims = Claims {
        iss: &key.client_email,
        scope: BIGQUERY_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECONDS,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, signing_key)
        .map_err(|e| QueryError::Authorization(format!("Cannot sign token request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_stub;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TEST_KEY_PEM: &str = include_str!("../../fixtures/test_service_account_key.pem");

    fn metadata_stub(hits: Arc<AtomicUsize>, expires_in: i64) -> Router {
        let handler = move |State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap| async move {
            if headers.get("metadata-flavor").map(|v| v == "Google") != Some(true) {
                return Err(StatusCode::FORBIDDEN);
            }
            let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Json(serde_json::json!({
                "access_token": format!("meta-{}", n),
                "expires_in": expires_in,
                "token_type": "Bearer"
            })))
        };
        Router::new().route("/token", get(handler)).with_state(hits)
    }

    fn provider(source: CredentialSource) -> TokenProvider {
        TokenProvider::new(&source, reqwest::Client::new()).unwrap()
    }

    fn key_file(token_uri: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let key = serde_json::json!({
            "type": "service_account",
            "client_email": "dashboard@mf-crucible.iam.gserviceaccount.com",
            "private_key": TEST_KEY_PEM,
            "token_uri": token_uri,
        });
        write!(file, "{}", key).unwrap();
        file
    }

    #[test]
    fn test_static_token_is_returned_as_is() {
        let tokens = provider(CredentialSource::Static("ya29.static".to_string()));
        assert_eq!(tokio_test::block_on(tokens.token()).unwrap(), "ya29.static");
    }

    #[tokio::test]
    async fn test_metadata_token_is_fetched_once_per_batch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_stub(metadata_stub(hits.clone(), 3600)).await;
        let tokens = provider(CredentialSource::MetadataServer {
            url: format!("{}/token", base),
        });

        let batch = futures::future::join_all((0..9).map(|_| tokens.token())).await;
        for token in batch {
            assert_eq!(token.unwrap(), "meta-1");
        }
        assert_eq!(tokens.token().await.unwrap(), "meta-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_and_invalidated_tokens_are_refetched() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_stub(metadata_stub(hits.clone(), 30)).await;
        let tokens = provider(CredentialSource::MetadataServer {
            url: format!("{}/token", base),
        });

        assert_eq!(tokens.token().await.unwrap(), "meta-1");
        assert_eq!(tokens.token().await.unwrap(), "meta-2");

        tokens.invalidate().await;
        assert_eq!(tokens.token().await.unwrap(), "meta-3");
    }

    #[tokio::test]
    async fn test_metadata_failure_is_authorization_error() {
        let stub = Router::new().route(
            "/token",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = spawn_stub(stub).await;
        let tokens = provider(CredentialSource::MetadataServer {
            url: format!("{}/token", base),
        });

        match tokens.token().await {
            Err(QueryError::Authorization(msg)) => assert!(msg.contains("500")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_service_account_exchanges_signed_assertion() {
        let stub = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form["grant_type"], JWT_BEARER_GRANT);
                assert_eq!(form["assertion"].split('.').count(), 3);
                Json(serde_json::json!({
                    "access_token": "ya29.service",
                    "expires_in": 3599,
                    "token_type": "Bearer"
                }))
            }),
        );
        let base = spawn_stub(stub).await;
        let file = key_file(&format!("{}/token", base));

        let tokens = provider(CredentialSource::ServiceAccountFile(file.path().to_path_buf()));
        assert_eq!(tokens.token().await.unwrap(), "ya29.service");
    }

    #[test]
    fn test_assertion_claims() {
        let key = ServiceAccountKey {
            client_email: "dashboard@mf-crucible.iam.gserviceaccount.com".to_string(),
            private_key: TEST_KEY_PEM.to_string(),
            token_uri: default_token_uri(),
        };
        let signing_key = EncodingKey::from_rsa_pem(TEST_KEY_PEM.as_bytes()).unwrap();
        let jwt = sign_assertion(&key, &signing_key, 1_700_000_000).unwrap();

        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);

        let payload = jwt.split('.').nth(1).unwrap();
        let claims: serde_json::Value = serde_json::from_slice(
            &base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(claims["iss"], key.client_email);
        assert_eq!(claims["aud"], "https://oauth2.googleapis.com/token");
        assert_eq!(claims["scope"], BIGQUERY_SCOPE);
        assert_eq!(claims["exp"], 1_700_000_000 + ASSERTION_LIFETIME_SECONDS);
    }

    #[test]
    fn test_bad_key_files_fail_at_startup() {
        let missing = CredentialSource::ServiceAccountFile(PathBuf::from("/nonexistent/key.json"));
        assert!(TokenProvider::new(&missing, reqwest::Client::new()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"client_email": "a@b", "private_key": "not a pem"}}"#
        )
        .unwrap();
        let bad_pem = CredentialSource::ServiceAccountFile(file.path().to_path_buf());
        assert!(TokenProvider::new(&bad_pem, reqwest::Client::new()).is_err());
    }
}
