//! Fully programmatic SAML login from username/password
//!
//! Walks the same handshake a browser would: primary-factor authentication
//! against Cisco SSO, then SAML completion against RainFocus, with redirects
//! intercepted so intermediate artifacts can be captured. Best-effort only:
//! anything unexpected fails closed to the browser login.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::LOCATION;
use reqwest::redirect;
use serde::Deserialize;
use url::Url;

use super::exchange::ExchangeClient;
use super::store::AuthToken;
use super::{AuthError, GLOBAL_COOKIE_NAME};

/// Cisco SSO primary-factor authentication API.
const AUTHN_URL: &str = "https://id.cisco.com/api/v1/authn";

/// Establishes the IdP session from a session token, then redirects onward.
const SESSION_REDIRECT_URL: &str = "https://id.cisco.com/login/sessionCookieRedirect";

/// App-specific SSO endpoint that produces the SAML assertion form.
const APP_SSO_URL: &str = "https://id.cisco.com/app/ciscoinc_rainfocus_1/exk1f8rrxEIlwhCCV1d8/sso/saml";

/// Redirect hops followed manually before giving up.
const MAX_HOPS: usize = 5;

/// Identity-provider endpoints, overridable for tests.
#[derive(Debug, Clone)]
pub struct SsoEndpoints {
    pub authn_url: String,
    pub session_redirect_url: String,
    pub app_sso_url: String,
}

impl Default for SsoEndpoints {
    fn default() -> Self {
        Self {
            authn_url: AUTHN_URL.to_string(),
            session_redirect_url: SESSION_REDIRECT_URL.to_string(),
            app_sso_url: APP_SSO_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthnResponse {
    #[serde(default)]
    status: String,
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "errorSummary")]
    error_summary: Option<String>,
}

/// Drives a login from raw credentials, handing every captured artifact to
/// the [`ExchangeClient`].
pub struct CredentialFlow {
    http: reqwest::Client,
    jar: Arc<Jar>,
    exchange: ExchangeClient,
    endpoints: SsoEndpoints,
}

impl CredentialFlow {
    pub fn new(exchange: ExchangeClient) -> Result<Self> {
        Self::with_endpoints(exchange, SsoEndpoints::default())
    }

    pub fn with_endpoints(exchange: ExchangeClient, endpoints: SsoEndpoints) -> Result<Self> {
        // Redirects stay manual so intermediate Location headers and cookies
        // can be inspected; the jar carries the session across hops.
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .redirect(redirect::Policy::none())
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to build SSO HTTP client")?;
        Ok(Self {
            http,
            jar,
            exchange,
            endpoints,
        })
    }

    /// Run the whole handshake. First successful resolution path wins:
    /// an `ssoToken` on the assertion-consumer redirect, then the global
    /// session cookie, then a direct login trigger with collected cookies.
    pub async fn login(&self, username: &str, password: &str) -> Result<AuthToken, AuthError> {
        let session_token = self.primary_authn(username, password).await?;
        tracing::info!("Primary authentication succeeded");

        let html = self.fetch_assertion_form(&session_token).await?;
        let (form, final_url) = (html.body, html.url);

        let assertion = extract_form_field(&form, "SAMLResponse").ok_or_else(|| {
            AuthError::Protocol(
                "SSO response carried no SAMLResponse form field; use the browser login instead"
                    .to_string(),
            )
        })?;
        let relay = extract_form_field(&form, "RelayState").unwrap_or_default();
        let action = extract_form_action(&form).ok_or_else(|| {
            AuthError::Protocol("SSO response form has no action URL".to_string())
        })?;
        let acs_url = final_url
            .join(&action)
            .map_err(|_| AuthError::Protocol(format!("invalid assertion consumer URL {action}")))?;

        tracing::debug!("Posting assertion to {}", acs_url);
        let resp = self
            .http
            .post(acs_url)
            .form(&[("SAMLResponse", assertion.as_str()), ("RelayState", relay.as_str())])
            .send()
            .await?;

        if let Some((sso_token, profile_id)) = sso_token_from_redirect(&resp) {
            tracing::debug!("Assertion consumer redirect carried an SSO token");
            match self
                .exchange
                .exchange_sso_token(&sso_token, profile_id.as_deref())
                .await
            {
                Ok(token) => return Ok(token),
                Err(e) => tracing::warn!("SSO token exchange failed: {}", e),
            }
        }

        if let Some(cookie_value) = self.global_cookie_value() {
            tracing::debug!("Trying the global session cookie");
            match self.exchange.exchange_global_cookie(&cookie_value).await {
                Ok(token) => return Ok(token),
                Err(e) => tracing::warn!("Global cookie exchange failed: {}", e),
            }
        }

        tracing::debug!("Trying a direct login trigger with collected cookies");
        match self.exchange.exchange_session_cookies(&self.http).await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::warn!("Login trigger failed: {}", e);
                Err(AuthError::Protocol(
                    "programmatic sign-in produced no usable token; use the browser login instead"
                        .to_string(),
                ))
            }
        }
    }

    /// Username/password against the authentication API. Anything but
    /// `SUCCESS` terminates the flow with a specific reason; those states
    /// need out-of-band resolution, not a retry.
    async fn primary_authn(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username.trim().is_empty() {
            return Err(AuthError::Empty("username"));
        }
        if password.is_empty() {
            return Err(AuthError::Empty("password"));
        }

        let resp = self
            .http
            .post(&self.endpoints.authn_url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        let body: AuthnResponse = serde_json::from_str(&text).unwrap_or_default();

        if !status.is_success() {
            let reason = body
                .error_summary
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(AuthError::Remote(format!("sign-in rejected: {}", reason)));
        }

        match body.status.as_str() {
            "SUCCESS" => body
                .session_token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    AuthError::Protocol(
                        "sign-in succeeded but returned no session token".to_string(),
                    )
                }),
            "MFA_REQUIRED" => Err(AuthError::Remote(
                "this account requires multi-factor authentication; use the browser login instead"
                    .to_string(),
            )),
            "LOCKED_OUT" => Err(AuthError::Remote(
                "account is locked out; unlock it with your identity provider, then retry"
                    .to_string(),
            )),
            "PASSWORD_EXPIRED" => Err(AuthError::Remote(
                "password has expired; update it in a browser, then retry".to_string(),
            )),
            other => Err(AuthError::Remote(format!(
                "sign-in returned status {}; use the browser login instead",
                other
            ))),
        }
    }

    /// Establish the IdP session and follow intercepted redirects until the
    /// HTML page carrying the assertion form comes back.
    async fn fetch_assertion_form(&self, session_token: &str) -> Result<HtmlPage, AuthError> {
        let start = Url::parse_with_params(
            &self.endpoints.session_redirect_url,
            &[
                ("token", session_token),
                ("redirectUrl", self.endpoints.app_sso_url.as_str()),
            ],
        )
        .map_err(|_| AuthError::Protocol("invalid SSO endpoint configuration".to_string()))?;

        let mut url = start;
        for _ in 0..MAX_HOPS {
            tracing::debug!("SSO hop: {}", url);
            let resp = self.http.get(url.clone()).send().await?;
            let status = resp.status();

            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        AuthError::Protocol("SSO redirect carried no Location header".to_string())
                    })?;
                url = url.join(location).map_err(|_| {
                    AuthError::Protocol(format!("SSO redirect target {location} is not a valid URL"))
                })?;
                continue;
            }
            if status.is_success() {
                let body = resp.text().await?;
                return Ok(HtmlPage { url, body });
            }
            return Err(AuthError::Remote(format!(
                "SSO endpoint returned HTTP {}",
                status.as_u16()
            )));
        }
        Err(AuthError::Protocol(
            "SSO sign-in redirected too many times".to_string(),
        ))
    }

    /// Value of the RainFocus global cookie if the handshake set one.
    fn global_cookie_value(&self) -> Option<String> {
        let url = Url::parse(self.exchange.login_url()).ok()?;
        let header = self.jar.cookies(&url)?;
        let cookies = header.to_str().ok()?;
        let prefix = format!("{}=", GLOBAL_COOKIE_NAME);
        cookies
            .split(';')
            .map(str::trim)
            .find_map(|kv| kv.strip_prefix(prefix.as_str()))
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    }
}

struct HtmlPage {
    url: Url,
    body: String,
}

/// `ssoToken` (and profile id) from a redirect's target, if present.
fn sso_token_from_redirect(resp: &reqwest::Response) -> Option<(String, Option<String>)> {
    if !resp.status().is_redirection() {
        return None;
    }
    let location = resp.headers().get(LOCATION)?.to_str().ok()?;
    let target = resp.url().join(location).ok()?;

    let mut sso_token = None;
    let mut profile_id = None;
    for (key, value) in target.query_pairs() {
        match key.as_ref() {
            "ssoToken" => sso_token = Some(value.into_owned()),
            "ssoProfileId" => profile_id = Some(value.into_owned()),
            _ => {}
        }
    }
    sso_token
        .filter(|t| !t.is_empty())
        .map(|t| (t, profile_id))
}

/// Value of a hidden form field, tolerating either attribute order.
fn extract_form_field(html: &str, name: &str) -> Option<String> {
    let patterns = [
        format!(r#"name="{name}"[^>]*\bvalue="([^"]*)""#),
        format!(r#"value="([^"]*)"[^>]*\bname="{name}""#),
    ];
    for pattern in &patterns {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(m) = re.captures(html).and_then(|c| c.get(1)) {
                let value = html_unescape(m.as_str());
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn extract_form_action(html: &str) -> Option<String> {
    let re = Regex::new(r#"<form[^>]*\baction="([^"]+)""#).ok()?;
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| html_unescape(m.as_str()))
}

/// Minimal entity decoding for the characters IdPs escape in form values
/// (base64 payloads arrive with +, =, / entity-encoded).
fn html_unescape(s: &str) -> String {
    s.replace("&#x2b;", "+")
        .replace("&#x3d;", "=")
        .replace("&#x2f;", "/")
        .replace("&#x3a;", ":")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{AuthMethod, TokenStore};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flow_against(server: &MockServer, dir: &TempDir) -> CredentialFlow {
        let store = TokenStore::at(dir.path().join("auth.json"));
        let exchange = ExchangeClient::with_endpoints(
            store,
            &format!("{}/api/login", server.uri()),
            &format!("{}/api/search", server.uri()),
        )
        .unwrap();
        let endpoints = SsoEndpoints {
            authn_url: format!("{}/api/v1/authn", server.uri()),
            session_redirect_url: format!("{}/login/sessionCookieRedirect", server.uri()),
            app_sso_url: format!("{}/app/sso", server.uri()),
        };
        CredentialFlow::with_endpoints(exchange, endpoints).unwrap()
    }

    #[test]
    fn test_extract_form_field_entity_encoded() {
        let html = r#"<form method="post" action="https://example.test/acs">
            <input type="hidden" name="SAMLResponse" value="PHNhbWxwOlJl&#x2b;c3BvbnNl&#x3d;"/>
            <input type="hidden" name="RelayState" value="https&#x3a;&#x2f;&#x2f;example.test&#x2f;cb"/>
        </form>"#;
        assert_eq!(
            extract_form_field(html, "SAMLResponse").unwrap(),
            "PHNhbWxwOlJl+c3BvbnNl="
        );
        assert_eq!(
            extract_form_field(html, "RelayState").unwrap(),
            "https://example.test/cb"
        );
        assert_eq!(
            extract_form_action(html).unwrap(),
            "https://example.test/acs"
        );
    }

    #[test]
    fn test_extract_form_field_value_before_name() {
        let html = r#"<input value="some-assertion-payload" type="hidden" name="SAMLResponse">"#;
        assert_eq!(
            extract_form_field(html, "SAMLResponse").unwrap(),
            "some-assertion-payload"
        );
    }

    #[test]
    fn test_extract_form_field_absent() {
        assert!(extract_form_field("<html><body>no form</body></html>", "SAMLResponse").is_none());
    }

    #[tokio::test]
    async fn test_login_resolves_sso_token_from_acs_redirect() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/authn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS",
                "sessionToken": "session-handle-123",
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/login/sessionCookieRedirect"))
            .and(query_param("token", "session-handle-123"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/app/sso"),
            )
            .mount(&server)
            .await;

        let form = r#"<html><body onload="document.forms[0].submit()">
            <form method="post" action="/sso/acs">
              <input type="hidden" name="SAMLResponse" value="PHNhbWxwOlJlc3BvbnNlIHRlc3Q&#x3d;"/>
              <input type="hidden" name="RelayState" value="rf-relay-opaque"/>
            </form></body></html>"#;
        Mock::given(method("GET"))
            .and(path("/app/sso"))
            .respond_with(ResponseTemplate::new(200).set_body_string(form))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/sso/acs"))
            .and(body_string_contains("RelayState=rf-relay-opaque"))
            .respond_with(ResponseTemplate::new(302).insert_header(
                "Location",
                "/callback?ssoToken=artifact-from-redirect&ssoProfileId=saml%3AjUN6c3A5jl",
            ))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_string_contains("ssoToken=artifact-from-redirect"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "rfAuthToken": "R".repeat(40) })),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let flow = flow_against(&server, &dir);
        let token = flow.login("user@example.com", "hunter22").await.unwrap();
        assert_eq!(token.method, AuthMethod::SsoToken);
        assert_eq!(token.bearer_token, "R".repeat(40));
        assert!(flow.exchange.store().load().is_some());
    }

    #[tokio::test]
    async fn test_login_falls_back_to_login_trigger() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/authn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS",
                "sessionToken": "session-handle-456",
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/login/sessionCookieRedirect"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/app/sso"),
            )
            .mount(&server)
            .await;

        let form = r#"<form method="post" action="/sso/acs">
            <input type="hidden" name="SAMLResponse" value="PHNhbWxwOlJlc3BvbnNlIHRlc3Q&#x3d;"/>
        </form>"#;
        Mock::given(method("GET"))
            .and(path("/app/sso"))
            .respond_with(ResponseTemplate::new(200).set_body_string(form))
            .mount(&server)
            .await;

        // ACS replies 200 with no redirect and sets no global cookie.
        Mock::given(method("POST"))
            .and(path("/sso/acs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_string_contains("performLogin=true"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "jwt": "K".repeat(36) })),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let flow = flow_against(&server, &dir);
        let token = flow.login("user@example.com", "hunter22").await.unwrap();
        assert_eq!(token.method, AuthMethod::Credentials);
        assert_eq!(token.bearer_token, "K".repeat(36));
    }

    #[tokio::test]
    async fn test_mfa_required_terminates_with_specific_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/authn"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "MFA_REQUIRED" })),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let flow = flow_against(&server, &dir);
        match flow.login("user@example.com", "hunter22").await {
            Err(AuthError::Remote(reason)) => assert!(reason.contains("multi-factor")),
            other => panic!("expected MFA rejection, got {:?}", other.map(|t| t.method)),
        }
    }

    #[tokio::test]
    async fn test_invalid_credentials_surface_error_summary() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/authn"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "errorSummary": "Authentication failed",
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let flow = flow_against(&server, &dir);
        match flow.login("user@example.com", "wrong").await {
            Err(AuthError::Remote(reason)) => assert!(reason.contains("Authentication failed")),
            other => panic!("expected rejection, got {:?}", other.map(|t| t.method)),
        }
    }

    #[tokio::test]
    async fn test_missing_assertion_is_a_protocol_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/authn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "SUCCESS",
                "sessionToken": "session-handle-789",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/login/sessionCookieRedirect"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>an error page</html>"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let flow = flow_against(&server, &dir);
        match flow.login("user@example.com", "hunter22").await {
            Err(AuthError::Protocol(reason)) => assert!(reason.contains("SAMLResponse")),
            other => panic!("expected protocol failure, got {:?}", other.map(|t| t.method)),
        }
    }
}
