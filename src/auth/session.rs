//! Signed session cookies.
//!
//! A session is `base64url(json) "." hex(hmac-sha256)`. Verifying one needs
//! only the key, so the server keeps no session table.

use super::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Name of the cookie carrying the session.
pub const SESSION_COOKIE: &str = "perovdash_session";

/// Name of the cookie binding an OAuth round trip to this browser.
pub const LOGIN_STATE_COOKIE: &str = "perovdash_login_state";

/// How long a login may take between `/login` and `/authorize`.
pub const LOGIN_STATE_TTL_SECONDS: i64 = 600;

/// A logged-in ORCID user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub orcid: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginState {
    nonce: String,
    expires_at: i64,
}

/// HMAC key for signing and verifying sessions.
#[derive(Clone)]
pub struct SessionKey(Arc<[u8]>);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    pub fn from_secret(secret: &str) -> Self {
        Self(Arc::from(secret.as_bytes()))
    }

    /// A fresh 32-byte key; sessions signed with it die with the process.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(Arc::from(&bytes[..]))
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| AuthError::Session(e.to_string()))
    }

    fn sign_payload(&self, json: &[u8]) -> Result<String, AuthError> {
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let tag = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, tag))
    }

    fn verify_payload(&self, value: &str) -> Option<Vec<u8>> {
        let (payload, tag) = value.split_once('.')?;
        let tag = hex::decode(tag).ok()?;

        let mut mac = self.mac().ok()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).ok()?;

        URL_SAFE_NO_PAD.decode(payload).ok()
    }

    pub fn sign(&self, session: &Session) -> Result<String, AuthError> {
        let json = serde_json::to_vec(session).map_err(|e| AuthError::Session(e.to_string()))?;
        self.sign_payload(&json)
    }

    /// Returns the session if the value is well formed and the tag matches.
    pub fn verify(&self, value: &str) -> Option<Session> {
        let json = self.verify_payload(value)?;
        serde_json::from_slice(&json).ok()
    }

    /// Sign a login nonce valid for [`LOGIN_STATE_TTL_SECONDS`].
    pub fn sign_login_state(&self, nonce: &str, now: i64) -> Result<String, AuthError> {
        let state = LoginState {
            nonce: nonce.to_string(),
            expires_at: now + LOGIN_STATE_TTL_SECONDS,
        };
        let json = serde_json::to_vec(&state).map_err(|e| AuthError::Session(e.to_string()))?;
        self.sign_payload(&json)
    }

    /// The nonce carried by a login-state cookie, if genuine and unexpired.
    pub fn verify_login_state(&self, value: &str, now: i64) -> Option<String> {
        let json = self.verify_payload(value)?;
        let state: LoginState = serde_json::from_slice(&json).ok()?;
        (state.expires_at > now).then_some(state.nonce)
    }
}

/// Fresh random nonce for the OAuth `state` parameter.
pub fn login_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Find a cookie value in `Cookie` header values.
pub fn find_cookie<'a, I>(header_values: I, name: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    header_values
        .into_iter()
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// `Set-Cookie` value that stores a signed session.
pub fn session_cookie(value: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax",
        SESSION_COOKIE, value
    )
}

/// `Set-Cookie` value that removes the session.
pub fn clear_cookie() -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        SESSION_COOKIE
    )
}

/// `Set-Cookie` value for the signed login state.
pub fn login_state_cookie(value: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        LOGIN_STATE_COOKIE, value, LOGIN_STATE_TTL_SECONDS
    )
}

/// `Set-Cookie` value that removes the login state.
pub fn clear_login_state_cookie() -> String {
    format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        LOGIN_STATE_COOKIE
    )
}
