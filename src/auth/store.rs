//! Durable storage of the current RainFocus credential
//!
//! Exactly one token record lives on disk at a time. Writes are best-effort:
//! a failed save is logged and swallowed, since the in-memory token still
//! serves the current process and the worst case is a re-login next launch.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{AUTH_PROFILE_ID, AUTH_WIDGET_ID};

/// How the stored credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    SsoToken,
    GlobalCookie,
    Credentials,
    Manual,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthMethod::SsoToken => "sso token",
            AuthMethod::GlobalCookie => "global cookie",
            AuthMethod::Credentials => "credentials",
            AuthMethod::Manual => "manual entry",
        };
        f.write_str(label)
    }
}

/// The current bearer credential and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub method: AuthMethod,
    pub bearer_token: String,
    /// Unix seconds at creation.
    pub saved_at: u64,
    /// Unix seconds, or 0 when the expiry is unknown (manual tokens are
    /// never verified against a clock).
    pub expires_at: u64,
}

impl AuthToken {
    pub fn new(method: AuthMethod, bearer_token: String, lifetime_secs: Option<u64>) -> Self {
        let saved_at = unix_now();
        Self {
            method,
            bearer_token,
            saved_at,
            expires_at: lifetime_secs.map(|secs| saved_at + secs).unwrap_or(0),
        }
    }

    /// A token with a known expiry is expired once the clock passes it.
    /// Unknown expiry (0) never expires here; callers may probe it live.
    pub fn is_expired(&self) -> bool {
        self.expires_at > 0 && unix_now() > self.expires_at
    }

    /// Remaining lifetime below the threshold. Unknown expiry never
    /// reports soon.
    pub fn expires_soon(&self, threshold_secs: u64) -> bool {
        self.expires_at > 0 && self.expires_at.saturating_sub(unix_now()) < threshold_secs
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// File-backed store for the single current token record.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Store at the default per-user location.
    pub fn open() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "ciscolive-cli", "ciscolive-cli")
            .context("Could not determine data directory")?;
        Ok(Self {
            path: proj_dirs.data_dir().join("auth.json"),
        })
    }

    /// Store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the record. Absent, unreadable, corrupt, and expired records all
    /// read as no token.
    pub fn load(&self) -> Option<AuthToken> {
        let content = fs::read_to_string(&self.path).ok()?;
        let token: AuthToken = serde_json::from_str(&content).ok()?;
        if token.is_expired() {
            tracing::info!("Stored token expired");
            return None;
        }
        Some(token)
    }

    /// Persist the record, replacing any previous one. Best-effort: failures
    /// are logged, never surfaced as a flow failure.
    pub fn save(&self, token: &AuthToken) {
        if let Err(e) = self.try_save(token) {
            tracing::warn!("Failed to persist token: {:#}", e);
        }
    }

    fn try_save(&self, token: &AuthToken) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("Token path has no parent directory")?;
        fs::create_dir_all(dir).context("Failed to create token directory")?;

        let content = serde_json::to_string(token).context("Failed to serialize token")?;

        // Write-then-rename so readers never observe a partial record.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).context("Failed to write token file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).context("Failed to set token file permissions")?;
        }

        fs::rename(&tmp, &self.path).context("Failed to move token file into place")?;
        Ok(())
    }

    /// Remove the record. Best-effort, same policy as `save`.
    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove token file: {}", e),
        }
    }

    /// Header set for authenticated RainFocus calls, or empty if no usable
    /// token is stored.
    pub fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some(token) = self.load() else {
            return headers;
        };
        if token.bearer_token.is_empty() {
            return headers;
        }
        let Ok(value) = HeaderValue::from_str(&token.bearer_token) else {
            tracing::warn!("Stored token is not a valid header value");
            return headers;
        };
        headers.insert("rfAuthToken", value);
        headers.insert("rfWidgetId", HeaderValue::from_static(AUTH_WIDGET_ID));
        headers.insert("rfApiProfileId", HeaderValue::from_static(AUTH_PROFILE_ID));
        headers
    }

    pub fn is_authenticated(&self) -> bool {
        !self.auth_headers().is_empty()
    }

    /// Whether the stored token's known remaining lifetime is below the
    /// threshold. Tokens with unknown expiry never report soon.
    pub fn expires_soon(&self, threshold_secs: u64) -> bool {
        self.load()
            .map(|t| t.expires_soon(threshold_secs))
            .unwrap_or(false)
    }
}
