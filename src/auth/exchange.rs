//! Token exchange against the RainFocus login API
//!
//! Converts any of three artifacts into a persisted JWT: the `ssoToken` from
//! the SAML callback, the global RainFocus session cookie, or a token pasted
//! by the user. Also probes the API to check a token already held.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::StatusCode;
use serde_json::Value;

use super::store::{AuthMethod, AuthToken, TokenStore};
use super::{
    AuthError, AUTH_PROFILE_ID, AUTH_WIDGET_ID, GLOBAL_COOKIE_NAME, LOGIN_URL, SEARCH_URL,
    SITE_ORIGIN, SITE_REFERER, SSO_PROFILE_ID,
};

/// The login API does not advertise a token lifetime; assume a conservative
/// 24 hours for exchanged tokens.
const TOKEN_LIFETIME_SECS: u64 = 86_400;

/// Shortest string accepted as a token; rejects truncated or placeholder
/// values.
const MIN_TOKEN_LEN: usize = 20;

/// Flat response fields that may carry the token, tried in order.
const FLAT_TOKEN_FIELDS: &[&str] = &["rfAuthToken", "authToken", "token", "jwt", "access_token"];

/// Containers worth one level of recursion, and the fields retried inside.
const NESTED_CONTAINERS: &[&str] = &["user", "attendee", "data", "result"];
const NESTED_TOKEN_FIELDS: &[&str] = &["rfAuthToken", "authToken", "token", "jwt"];

/// Outcome of a live token probe.
#[derive(Debug)]
pub enum Validation {
    /// The API accepted the token (or at least raised no auth error).
    Valid,
    /// The API explicitly rejected the token.
    Invalid(String),
}

/// Client for the RainFocus login/probe endpoints. Persists successful
/// exchanges into its [`TokenStore`].
pub struct ExchangeClient {
    http: reqwest::Client,
    store: TokenStore,
    login_url: String,
    search_url: String,
}

impl ExchangeClient {
    pub fn new(store: TokenStore) -> Result<Self> {
        Self::with_endpoints(store, LOGIN_URL, SEARCH_URL)
    }

    /// Client against explicit endpoints (tests point these at a stub).
    pub fn with_endpoints(store: TokenStore, login_url: &str, search_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            store,
            login_url: login_url.to_string(),
            search_url: search_url.to_string(),
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub(crate) fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Exchange an `ssoToken` from the SAML callback redirect for a JWT.
    pub async fn exchange_sso_token(
        &self,
        sso_token: &str,
        sso_profile_id: Option<&str>,
    ) -> Result<AuthToken, AuthError> {
        let sso_token = sso_token.trim();
        if sso_token.is_empty() {
            return Err(AuthError::Empty("SSO token"));
        }
        let profile_id = sso_profile_id.unwrap_or(SSO_PROFILE_ID);

        tracing::debug!("Exchanging SSO token at {}", self.login_url);
        let data = self
            .login_request(&[("ssoToken", sso_token), ("ssoProfileId", profile_id)])
            .await?;
        self.accept(AuthMethod::SsoToken, &data)
    }

    /// Exchange the global RainFocus session cookie for a JWT.
    pub async fn exchange_global_cookie(&self, cookie_value: &str) -> Result<AuthToken, AuthError> {
        let cookie_value = cookie_value.trim();
        if cookie_value.is_empty() {
            return Err(AuthError::Empty("cookie value"));
        }

        tracing::debug!("Exchanging global cookie at {}", self.login_url);
        let data = self
            .login_request(&[("performLogin", "true"), (GLOBAL_COOKIE_NAME, cookie_value)])
            .await?;
        self.accept(AuthMethod::GlobalCookie, &data)
    }

    /// Trigger a login through a caller-supplied client whose cookie jar
    /// holds the session collected during the SAML handshake.
    pub(crate) async fn exchange_session_cookies(
        &self,
        http: &reqwest::Client,
    ) -> Result<AuthToken, AuthError> {
        tracing::debug!("Triggering login with collected session cookies");
        let resp = http
            .post(&self.login_url)
            .headers(identity_headers())
            .form(&[("performLogin", "true")])
            .send()
            .await?;
        let data = parse_login_response(resp).await?;
        self.accept(AuthMethod::Credentials, &data)
    }

    /// Persist a token the user copied out of their browser.
    ///
    /// The token is probed first. A clear rejection is an error; an
    /// inconclusive probe (network trouble, odd API response) still persists
    /// the token, since forcing re-entry of a possibly-good token is worse.
    pub async fn save_manual_token(&self, token: &str) -> Result<AuthToken, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Empty("token"));
        }

        match self.validate(token).await {
            Ok(Validation::Valid) => {
                tracing::info!("Manual token validated");
                Ok(self.persist(AuthMethod::Manual, token.to_string(), None))
            }
            Ok(Validation::Invalid(reason)) => Err(AuthError::Remote(reason)),
            Err(e) => {
                tracing::warn!("Saving manual token without validation: {}", e);
                Ok(self.persist(AuthMethod::Manual, token.to_string(), None))
            }
        }
    }

    /// Probe the API with the token on the smallest possible search request.
    ///
    /// Only an explicit auth failure (response code 107, HTTP 401/403) counts
    /// as invalid; any response that parses without one is treated as valid.
    /// Everything else is an inconclusive error.
    pub async fn validate(&self, token: &str) -> Result<Validation, AuthError> {
        let resp = self
            .http
            .post(&self.search_url)
            .headers(identity_headers())
            .header("rfAuthToken", token)
            .form(&[("type", "session"), ("size", "1"), ("from", "0")])
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(Validation::Invalid(format!(
                "token is invalid or expired (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AuthError::Remote(format!(
                "validation probe returned HTTP {}",
                status.as_u16()
            )));
        }

        let data: Value = resp.json().await?;
        if data.get("responseCode").and_then(Value::as_str) == Some("107") {
            return Ok(Validation::Invalid("token is invalid or expired".to_string()));
        }
        Ok(Validation::Valid)
    }

    async fn login_request(&self, params: &[(&str, &str)]) -> Result<Value, AuthError> {
        let resp = self
            .http
            .post(&self.login_url)
            .headers(identity_headers())
            .form(params)
            .send()
            .await?;
        parse_login_response(resp).await
    }

    /// Extract and persist a token from a login response, or map the
    /// response to the right failure reason.
    fn accept(&self, method: AuthMethod, data: &Value) -> Result<AuthToken, AuthError> {
        match extract_token(data) {
            Some(jwt) => Ok(self.persist(method, jwt, Some(TOKEN_LIFETIME_SECS))),
            None => Err(rejection_reason(data)),
        }
    }

    fn persist(&self, method: AuthMethod, jwt: String, lifetime: Option<u64>) -> AuthToken {
        let token = AuthToken::new(method, jwt, lifetime);
        self.store.save(&token);
        tracing::info!("Stored token ({})", token.method);
        token
    }
}

async fn parse_login_response(resp: reqwest::Response) -> Result<Value, AuthError> {
    let status = resp.status();
    let body = resp.text().await?;
    let snippet: String = body.chars().take(200).collect();
    if !status.is_success() {
        return Err(AuthError::Remote(format!(
            "login API returned HTTP {}: {}",
            status.as_u16(),
            snippet
        )));
    }
    serde_json::from_str(&body).map_err(|_| {
        AuthError::Remote(format!("login API returned a non-JSON body: {}", snippet))
    })
}

/// Distinguish "remote reported an error" from "no usable token" for a
/// response that yielded nothing extractable.
fn rejection_reason(data: &Value) -> AuthError {
    let error = data
        .get("error")
        .or_else(|| data.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if error.is_empty() {
        AuthError::NoToken
    } else {
        AuthError::Remote(format!("login failed: {}", error))
    }
}

fn identity_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("rfWidgetId", HeaderValue::from_static(AUTH_WIDGET_ID));
    headers.insert("rfApiProfileId", HeaderValue::from_static(AUTH_PROFILE_ID));
    headers.insert(ORIGIN, HeaderValue::from_static(SITE_ORIGIN));
    headers.insert(REFERER, HeaderValue::from_static(SITE_REFERER));
    headers
}

/// Pull the token out of a login response.
///
/// The API returns it under different names depending on the path taken, so
/// this tries a fixed strategy list: flat fields, then one level into likely
/// containers, then a cookie-style embedded field.
pub(crate) fn extract_token(data: &Value) -> Option<String> {
    for key in FLAT_TOKEN_FIELDS {
        if let Some(token) = candidate(data.get(*key)) {
            return Some(token);
        }
    }

    for container_key in NESTED_CONTAINERS {
        if let Some(container) = data.get(*container_key).filter(|v| v.is_object()) {
            for key in NESTED_TOKEN_FIELDS {
                if let Some(token) = candidate(container.get(*key)) {
                    return Some(token);
                }
            }
        }
    }

    if let Some(cookie) = data.get("cookie").and_then(Value::as_str) {
        if let Ok(re) = Regex::new(r"rfjwt=([^;]+)") {
            if let Some(m) = re.captures(cookie).and_then(|c| c.get(1)) {
                if m.as_str().len() > MIN_TOKEN_LEN {
                    return Some(m.as_str().to_string());
                }
            }
        }
    }

    None
}

fn candidate(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| s.len() > MIN_TOKEN_LEN)
        .map(str::to_string)
}
