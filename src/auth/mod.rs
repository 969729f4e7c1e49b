//! Optional ORCID login in front of the dashboard page.
//!
//! The gate is an axum middleware plus three OAuth routes. When auth is
//! disabled none of it is mounted and handlers never see it.

pub mod session;

pub use session::{Session, SessionKey, LOGIN_STATE_COOKIE, SESSION_COOKIE};

use crate::config::AuthConfig;
use anyhow::{Context, Result};
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors raised by the login flow.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("ORCID token exchange failed: {0}")]
    TokenExchange(String),

    #[error("session error: {0}")]
    Session(String),
}

/// Body returned when login fails.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

/// Settings for talking to ORCID.
#[derive(Debug, Clone)]
struct OrcidSettings {
    client_id: String,
    client_secret: String,
    base_url: String,
    redirect_uri: String,
}

/// ORCID token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    orcid: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Login gate shared by the middleware and the OAuth routes.
#[derive(Debug, Clone)]
pub struct AuthGate {
    orcid: Arc<OrcidSettings>,
    key: SessionKey,
    http_client: reqwest::Client,
}

impl AuthGate {
    /// Build the gate, or `None` when auth is disabled.
    pub fn from_config(config: &AuthConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let client_id = config
            .orcid_client_id
            .clone()
            .context("ORCID client id is required when auth is enabled")?;
        let client_secret = config
            .orcid_client_secret
            .clone()
            .context("ORCID client secret is required when auth is enabled")?;

        let key = match &config.session_secret {
            Some(secret) => SessionKey::from_secret(secret),
            None => {
                warn!("No session secret configured; sessions will not survive a restart");
                SessionKey::random()
            }
        };

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Some(Self {
            orcid: Arc::new(OrcidSettings {
                client_id,
                client_secret,
                base_url: config.orcid_base_url.trim_end_matches('/').to_string(),
                redirect_uri: format!("{}/authorize", config.public_url.trim_end_matches('/')),
            }),
            key,
            http_client,
        }))
    }

    /// Where `/login` sends the browser. `state` comes back on `/authorize`.
    pub fn authorize_url(&self, state: &str) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/oauth/authorize", self.orcid.base_url),
            &[
                ("client_id", self.orcid.client_id.as_str()),
                ("response_type", "code"),
                ("scope", "/authenticate"),
                ("redirect_uri", self.orcid.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .context("Invalid ORCID base URL")?;
        Ok(url.to_string())
    }

    /// The verified session carried by a request, if any.
    pub fn session(&self, headers: &HeaderMap) -> Option<Session> {
        let value = cookie(headers, SESSION_COOKIE)?;
        self.key.verify(&value)
    }

    /// Whether `returned` is the nonce this browser was given at `/login`.
    fn state_matches(&self, headers: &HeaderMap, returned: Option<&str>) -> bool {
        let expected = cookie(headers, LOGIN_STATE_COOKIE)
            .and_then(|value| self.key.verify_login_state(&value, Utc::now().timestamp()));
        matches!((expected, returned), (Some(e), Some(r)) if e == r)
    }

    /// Trade an authorization code for the user's identity.
    async fn exchange_code(&self, code: &str) -> Result<Session, AuthError> {
        let url = format!("{}/oauth/token", self.orcid.base_url);
        let response = self
            .http_client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.orcid.client_id.as_str()),
                ("client_secret", self.orcid.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.orcid.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("Failed to reach ORCID: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!("ORCID error {}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("Invalid token response: {}", e)))?;

        Ok(Session {
            orcid: token.orcid,
            name: token
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "User".to_string()),
        })
    }
}

/// Middleware: let the request through with its [`Session`] attached, or
/// redirect to `/login`.
pub async fn require_login(
    State(gate): State<AuthGate>,
    mut request: Request,
    next: Next,
) -> Response {
    match gate.session(request.headers()) {
        Some(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        None => Redirect::to("/login").into_response(),
    }
}

/// `/login`, `/authorize` and `/logout`.
pub fn routes<S>(gate: AuthGate) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/login", get(login))
        .route("/authorize", get(authorize))
        .route("/logout", get(logout))
        .with_state(gate)
}

async fn login(State(gate): State<AuthGate>) -> Response {
    let nonce = session::login_nonce();
    let prepared = gate
        .key
        .sign_login_state(&nonce, Utc::now().timestamp())
        .map_err(anyhow::Error::from)
        .and_then(|state| Ok((state, gate.authorize_url(&nonce)?)));

    match prepared {
        Ok((state, url)) => (
            [(header::SET_COOKIE, session::login_state_cookie(&state))],
            Redirect::to(&url),
        )
            .into_response(),
        Err(e) => {
            error!("Cannot start ORCID login: {:#}", e);
            login_failed()
        }
    }
}

async fn authorize(
    State(gate): State<AuthGate>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    let code = match (params.code, params.error) {
        (Some(code), _) => code,
        (None, reason) => {
            warn!("ORCID authorization denied: {}", reason.unwrap_or_default());
            return Redirect::to("/login").into_response();
        }
    };

    if !gate.state_matches(&headers, params.state.as_deref()) {
        warn!("Rejected ORCID callback with a missing or mismatched state");
        return (
            StatusCode::BAD_REQUEST,
            [(header::SET_COOKIE, session::clear_login_state_cookie())],
            Json(ErrorResponse {
                error: "Login request expired or was not started here.",
            }),
        )
            .into_response();
    }

    let signed = match gate.exchange_code(&code).await {
        Ok(session) => {
            info!("User {} logged in", session.orcid);
            gate.key.sign(&session)
        }
        Err(e) => Err(e),
    };

    match signed {
        Ok(value) => (
            AppendHeaders([
                (header::SET_COOKIE, session::session_cookie(&value)),
                (header::SET_COOKIE, session::clear_login_state_cookie()),
            ]),
            Redirect::to("/"),
        )
            .into_response(),
        Err(e) => {
            error!("Login failed: {}", e);
            login_failed()
        }
    }
}

async fn logout() -> Response {
    (
        [(header::SET_COOKIE, session::clear_cookie())],
        Redirect::to("/login"),
    )
        .into_response()
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let values = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok());
    session::find_cookie(values, name)
}

fn login_failed() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorResponse {
            error: "Login with ORCID failed.",
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn enabled_config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            orcid_client_id: Some("APP-TEST".to_string()),
            orcid_client_secret: Some("shh".to_string()),
            orcid_base_url: "https://orcid.org".to_string(),
            public_url: "http://localhost:5000/".to_string(),
            session_secret: Some("test-secret".to_string()),
        }
    }

    fn gate() -> AuthGate {
        AuthGate::from_config(&enabled_config()).unwrap().unwrap()
    }

    #[test]
    fn test_disabled_config_builds_no_gate() {
        assert!(AuthGate::from_config(&AuthConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_authorize_url() {
        let url = gate().authorize_url("n0nce").unwrap();
        assert!(url.starts_with("https://orcid.org/oauth/authorize?"));
        assert!(url.contains("client_id=APP-TEST"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A5000%2Fauthorize"));
        assert!(url.contains("state=n0nce"));
    }

    #[test]
    fn test_session_from_cookie_header() {
        let gate = gate();
        let value = gate
            .key
            .sign(&Session {
                orcid: "0000-0001".to_string(),
                name: "Ada".to_string(),
            })
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("{}={}", SESSION_COOKIE, value).parse().unwrap(),
        );
        assert_eq!(gate.session(&headers).map(|s| s.name), Some("Ada".to_string()));

        assert!(gate.session(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_logout_clears_cookie() {
        let response = tokio_test::block_on(logout());
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("perovdash_session=;"));
    }

    #[tokio::test]
    async fn test_authorize_without_code_returns_to_login() {
        let app: Router = routes(gate());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/authorize?error=access_denied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");
    }

    async fn get(app: Router, uri: &str, cookie: Option<String>) -> Response {
        let mut request = HttpRequest::builder().uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_login_binds_state_to_browser() {
        let response = get(routes(gate()), "/login", None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let location = response.headers()[header::LOCATION].to_str().unwrap();
        let url = reqwest::Url::parse(location).unwrap();
        let nonce = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let cookies = set_cookies(&response);
        let state_cookie = cookies
            .iter()
            .find(|c| c.starts_with(LOGIN_STATE_COOKIE))
            .unwrap();
        let value = state_cookie
            .split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(gate().key.verify_login_state(&value, now), Some(nonce));
        assert!(state_cookie.contains("Max-Age=600"));
    }

    #[tokio::test]
    async fn test_authorize_rejects_code_without_matching_state() {
        let app: Router = routes(gate());

        let bare = get(app.clone(), "/authorize?code=x", None).await;
        assert_eq!(bare.status(), StatusCode::BAD_REQUEST);

        let issued = gate()
            .key
            .sign_login_state("expected", Utc::now().timestamp())
            .unwrap();
        let cookie = format!("{}={}", LOGIN_STATE_COOKIE, issued);

        let mismatched = get(app.clone(), "/authorize?code=x&state=forged", Some(cookie.clone())).await;
        assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);
        assert!(set_cookies(&mismatched).iter().all(|c| !c.starts_with(SESSION_COOKIE)));

        let no_state = get(app, "/authorize?code=x", Some(cookie)).await;
        assert_eq!(no_state.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authorize_with_matching_state_sets_session() {
        use axum::routing::post;

        let orcid = Router::new().route(
            "/oauth/token",
            post(|| async {
                Json(serde_json::json!({
                    "access_token": "a",
                    "orcid": "0000-0002-1825-0097",
                    "name": "Josiah Carberry"
                }))
            }),
        );
        let base = crate::test_support::spawn_stub(orcid).await;

        let gate = AuthGate::from_config(&AuthConfig {
            orcid_base_url: base,
            ..enabled_config()
        })
        .unwrap()
        .unwrap();
        let issued = gate
            .key
            .sign_login_state("n0nce", Utc::now().timestamp())
            .unwrap();

        let response = get(
            routes(gate.clone()),
            "/authorize?code=x&state=n0nce",
            Some(format!("{}={}", LOGIN_STATE_COOKIE, issued)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let cookies = set_cookies(&response);
        let session_value = cookies
            .iter()
            .find_map(|c| c.strip_prefix("perovdash_session="))
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        assert_eq!(
            gate.key.verify(session_value).map(|s| s.name),
            Some("Josiah Carberry".to_string())
        );
        assert!(cookies
            .iter()
            .any(|c| c.starts_with("perovdash_login_state=;")));
    }
}
