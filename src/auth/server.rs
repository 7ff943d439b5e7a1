//! Browser-based login callback server
//!
//! Two-screen authentication for a device without a usable browser:
//!
//! 1. Bind a local HTTP server on an ephemeral port
//! 2. Show its URL on the device screen
//! 3. The user opens it in a browser on any machine on the network
//! 4. The landing page links into Cisco SSO with `rfparam` pointing back at
//!    this server's `/callback`
//! 5. After SAML login the provider redirects back with `?ssoToken=...`
//! 6. The server exchanges it for a JWT and exposes it on `/status`
//!
//! Fallback: the failure page offers manual token entry via `POST /token`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use super::exchange::ExchangeClient;
use super::store::{AuthMethod, AuthToken};
use super::{SAML_REQUEST_URL, SSO_PROFILE_ID};

/// How long a login attempt may run before the server gives up.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on a single accept wait, so stop/timeout conditions are
/// observed promptly.
const ACCEPT_TICK: Duration = Duration::from_secs(1);

/// Keep serving briefly after a token arrives so the success page finishes
/// loading in the browser.
const SUCCESS_GRACE: Duration = Duration::from_secs(3);

/// Bound on handling one connection; a stalled client must not wedge the
/// serve loop past this.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

const MAX_BODY_BYTES: usize = 64 * 1024;

const RATE_LIMIT: usize = 20;
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Token observed by the server, tagged with how it arrived.
#[derive(Debug, Clone)]
pub struct ReceivedToken {
    pub token: String,
    pub method: AuthMethod,
}

/// Sliding-window request limiter keyed by client address. Entries are
/// pruned lazily on each check.
pub(crate) struct RateLimiter {
    limit: usize,
    window: Duration,
    log: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, addr: IpAddr) -> bool {
        self.admit_at(addr, Instant::now())
    }

    fn admit_at(&self, addr: IpAddr, now: Instant) -> bool {
        let mut log = self.log.lock().unwrap();
        let stamps = log.entry(addr).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);
        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push(now);
        true
    }
}

/// State shared between the serve loop and the controlling session.
pub(crate) struct ServerState {
    received: OnceLock<ReceivedToken>,
    stop: AtomicBool,
    limiter: RateLimiter,
}

impl ServerState {
    fn new() -> Self {
        Self {
            received: OnceLock::new(),
            stop: AtomicBool::new(false),
            limiter: RateLimiter::new(RATE_LIMIT, RATE_WINDOW),
        }
    }

    /// First writer wins; later offers are discarded.
    pub(crate) fn offer(&self, token: ReceivedToken) -> bool {
        self.received.set(token).is_ok()
    }

    pub(crate) fn received(&self) -> Option<ReceivedToken> {
        self.received.get().cloned()
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Short-lived HTTP server brokering the SAML redirect for one login
/// attempt. Requests are handled one at a time on the serve loop.
pub struct CallbackServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    exchange: ExchangeClient,
    local_ip: String,
    port: u16,
}

impl CallbackServer {
    /// Bind an ephemeral port reachable from the local network.
    pub async fn bind(exchange: ExchangeClient) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .context("Failed to bind login callback listener")?;
        let port = listener
            .local_addr()
            .context("Failed to read callback listener address")?
            .port();
        Ok(Self {
            listener,
            state: Arc::new(ServerState::new()),
            exchange,
            local_ip: local_ip(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Login URL for a browser on another device on the network.
    pub fn login_url(&self) -> String {
        format!("http://{}:{}/login", self.local_ip, self.port)
    }

    /// Login URL for a browser on this machine.
    pub fn local_url(&self) -> String {
        format!("http://localhost:{}/login", self.port)
    }

    pub(crate) fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Serve until a token arrives (plus a short grace period), stop is
    /// requested, or the timeout elapses. The listener closes on exit,
    /// freeing the port.
    pub async fn serve(self, timeout: Duration) {
        let started = Instant::now();
        while self.state.received().is_none()
            && !self.state.stop_requested()
            && started.elapsed() < timeout
        {
            self.tick().await;
        }

        if self.state.received().is_some() && !self.state.stop_requested() {
            let grace_end = Instant::now() + SUCCESS_GRACE;
            while Instant::now() < grace_end && !self.state.stop_requested() {
                self.tick().await;
            }
        }

        tracing::debug!("Login callback server on port {} shut down", self.port);
    }

    /// One bounded accept wait. Errors terminate only this iteration.
    async fn tick(&self) {
        match tokio::time::timeout(ACCEPT_TICK, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let outcome = tokio::time::timeout(REQUEST_DEADLINE, self.handle(stream, peer))
                    .await
                    .unwrap_or_else(|_| Err(anyhow!("request timed out")));
                if let Err(e) = outcome {
                    tracing::debug!("Request from {} failed: {:#}", peer, e);
                }
            }
            Ok(Err(e)) => tracing::debug!("Accept failed: {}", e),
            // Tick elapsed with no connection; re-check exit conditions.
            Err(_) => {}
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let req = read_request(&mut stream).await?;

        if !self.state.limiter.admit(peer.ip()) {
            return send_json(
                &mut stream,
                429,
                "Too Many Requests",
                &json!({ "error": "too many requests" }),
            )
            .await;
        }

        match (req.method.as_str(), req.path.as_str()) {
            ("OPTIONS", _) => send_response(&mut stream, 200, "OK", "text/plain", true, b"").await,
            ("GET", "/") | ("GET", "/login") => {
                let page = PAGE_LANDING.replace("__SAML_URL__", &self.saml_login_url());
                send_html(&mut stream, &page).await
            }
            ("GET", "/callback") => self.handle_callback(&mut stream, &req).await,
            ("GET", "/status") => {
                let body = match self.state.received() {
                    Some(received) => json!({ "status": "ok", "token": received.token }),
                    None => json!({ "status": "waiting" }),
                };
                send_json(&mut stream, 200, "OK", &body).await
            }
            ("GET", "/health") => {
                send_json(&mut stream, 200, "OK", &json!({ "status": "running" })).await
            }
            ("POST", "/token") => self.handle_manual_token(&mut stream, &req).await,
            _ => send_response(&mut stream, 404, "Not Found", "text/plain", false, b"").await,
        }
    }

    /// The SAML callback redirect. An `ssoToken` is exchanged on the spot;
    /// both failure causes (exchange rejected, no token in the redirect)
    /// render the same fallback page with distinct diagnostic detail.
    async fn handle_callback(&self, stream: &mut TcpStream, req: &Request) -> Result<()> {
        let sso_token = req.query_value("ssoToken").unwrap_or_default();
        let profile_id = req.query_value("ssoProfileId");

        if !sso_token.is_empty() {
            match self
                .exchange
                .exchange_sso_token(&sso_token, profile_id.as_deref())
                .await
            {
                Ok(token) => {
                    let fresh = self.state.offer(ReceivedToken {
                        token: token.bearer_token,
                        method: token.method,
                    });
                    if !fresh {
                        tracing::debug!("Token already received; keeping the first one");
                    }
                    return send_html(stream, PAGE_SUCCESS).await;
                }
                Err(e) => {
                    tracing::warn!("SSO token exchange failed: {}", e);
                    let detail = format!("SSO token exchange failed: {}", e);
                    return self.send_failure(stream, &detail).await;
                }
            }
        }

        // Diagnostic listing only; never guess at a cause.
        let received = if req.query.is_empty() {
            "(none)".to_string()
        } else {
            req.query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&")
        };
        let detail = format!("No ssoToken in callback. Received params: {}", received);
        self.send_failure(stream, &detail).await
    }

    /// Manually pasted token from the fallback form. Stored as-is with
    /// unknown expiry; live validation happens on first use.
    async fn handle_manual_token(&self, stream: &mut TcpStream, req: &Request) -> Result<()> {
        let Ok(body) = serde_json::from_str::<serde_json::Value>(&req.body) else {
            return send_json(
                stream,
                400,
                "Bad Request",
                &json!({ "error": "invalid json" }),
            )
            .await;
        };
        let token = body
            .get("token")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if token.is_empty() {
            return send_json(stream, 400, "Bad Request", &json!({ "error": "empty token" }))
                .await;
        }

        let record = AuthToken::new(AuthMethod::Manual, token.clone(), None);
        self.exchange.store().save(&record);
        let fresh = self.state.offer(ReceivedToken {
            token,
            method: AuthMethod::Manual,
        });
        if !fresh {
            tracing::debug!("Manual token arrived after another token; ignoring");
        }
        send_json(stream, 200, "OK", &json!({ "status": "ok" })).await
    }

    async fn send_failure(&self, stream: &mut TcpStream, detail: &str) -> Result<()> {
        let page = PAGE_FAILURE
            .replace("__DETAIL__", &html_escape(detail))
            .replace("__RETRY_URL__", "/login");
        send_html(stream, &page).await
    }

    /// SAML login URL with `rfparam` pointing back at this server.
    fn saml_login_url(&self) -> String {
        let callback = format!("http://{}:{}/callback", self.local_ip, self.port);
        Url::parse_with_params(
            SAML_REQUEST_URL,
            &[
                ("rfapp", "events"),
                ("ssoProfileId", SSO_PROFILE_ID),
                ("rfparam", callback.as_str()),
            ],
        )
        .map(|u| u.to_string())
        .unwrap_or_else(|_| SAML_REQUEST_URL.to_string())
    }
}

struct Request {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: String,
}

impl Request {
    fn query_value(&self, key: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader
        .read_line(&mut request_line)
        .await
        .context("Failed to read request line")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("Empty request line")?.to_string();
    let target = parts.next().context("Request line has no target")?.to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        let n = reader
            .read_line(&mut header)
            .await
            .context("Failed to read header")?;
        if n == 0 || header.trim().is_empty() {
            break;
        }
        let lower = header.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = String::new();
    if content_length > 0 {
        let mut buf = vec![0u8; content_length.min(MAX_BODY_BYTES)];
        reader
            .read_exact(&mut buf)
            .await
            .context("Failed to read request body")?;
        body = String::from_utf8_lossy(&buf).into_owned();
    }

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    let query = url::form_urlencoded::parse(query_str.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Ok(Request {
        method,
        path,
        query,
        body,
    })
}

async fn send_html(stream: &mut TcpStream, html: &str) -> Result<()> {
    send_response(stream, 200, "OK", "text/html; charset=utf-8", false, html.as_bytes()).await
}

async fn send_json(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &serde_json::Value,
) -> Result<()> {
    send_response(
        stream,
        status,
        reason,
        "application/json",
        true,
        body.to_string().as_bytes(),
    )
    .await
}

async fn send_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_type: &str,
    cors: bool,
    body: &[u8],
) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    if cors {
        head.push_str(
            "Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: POST, GET, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n",
        );
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .context("Failed to write response head")?;
    stream
        .write_all(body)
        .await
        .context("Failed to write response body")?;
    stream.flush().await.context("Failed to flush response")?;
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// LAN-reachable address for display to the user, discovered with the UDP
/// connect trick. No packets are sent.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

const PAGE_LANDING: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Cisco Live - Sign In</title>
<style>
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #1a1a2e;
       color: #eee; min-height: 100vh; display: flex; justify-content: center;
       align-items: center; margin: 0; }
.card { background: #16213e; border-radius: 16px; padding: 40px; max-width: 480px;
        width: 90%; text-align: center; box-shadow: 0 20px 60px rgba(0,0,0,0.5); }
h1 { color: #049fd9; font-size: 24px; }
p { color: #aab; line-height: 1.6; }
.btn { display: inline-block; background: #049fd9; color: #fff; text-decoration: none;
       padding: 14px 32px; border-radius: 8px; font-size: 18px; font-weight: 600; }
.btn:hover { background: #0380b0; }
</style>
</head>
<body>
<div class="card">
<h1>Cisco Live Sign In</h1>
<p>Sign in with your Cisco account. When you finish, this device is
connected automatically.</p>
<a href="__SAML_URL__" class="btn">Sign in with Cisco</a>
</div>
</body>
</html>"#;

const PAGE_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Cisco Live - Signed In</title>
<style>
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #1a1a2e;
       color: #eee; min-height: 100vh; display: flex; justify-content: center;
       align-items: center; margin: 0; }
.card { background: #16213e; border-radius: 16px; padding: 40px; max-width: 480px;
        width: 90%; text-align: center; box-shadow: 0 20px 60px rgba(0,0,0,0.5); }
h1 { color: #2ecc71; }
p { color: #aab; line-height: 1.6; }
</style>
</head>
<body>
<div class="card">
<h1>Signed In</h1>
<p>Your Cisco account is now linked.</p>
<p>You can close this tab and return to the other screen.</p>
</div>
</body>
</html>"#;

const PAGE_FAILURE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Cisco Live - Sign-In Issue</title>
<style>
body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #1a1a2e;
       color: #eee; min-height: 100vh; display: flex; justify-content: center;
       align-items: center; margin: 0; }
.card { background: #16213e; border-radius: 16px; padding: 40px; max-width: 520px;
        width: 90%; text-align: center; box-shadow: 0 20px 60px rgba(0,0,0,0.5); }
h1 { color: #e67e22; font-size: 22px; }
p { color: #aab; line-height: 1.6; font-size: 15px; }
.detail { color: #e74c3c; font-size: 13px; background: #0f1a30; padding: 10px;
          border-radius: 6px; margin: 12px 0; word-break: break-all; }
.btn { display: inline-block; background: #049fd9; color: #fff; text-decoration: none;
       padding: 12px 28px; border-radius: 8px; font-size: 16px; font-weight: 600;
       border: none; cursor: pointer; margin: 6px; }
.btn:hover { background: #0380b0; }
.manual { margin-top: 24px; padding-top: 20px; border-top: 1px solid #2a3a5e; }
.manual label { color: #8a9; display: block; margin-bottom: 8px; font-size: 14px; }
.manual input { width: 100%; padding: 10px; border-radius: 6px; border: 1px solid #3a4a6e;
                background: #0f1a30; color: #eee; font-family: monospace; font-size: 13px; }
.sent { color: #2ecc71; display: none; }
</style>
</head>
<body>
<div class="card">
<h1>Sign-In Not Completed</h1>
<p>The login redirect did not produce a token. This can happen when the SSO
provider blocks the redirect.</p>
<p class="detail">__DETAIL__</p>
<p>You can try again, or paste a token from your browser's dev tools:</p>
<a href="__RETRY_URL__" class="btn">Try Again</a>
<div class="manual">
<label>JWT / auth token:</label>
<input type="text" id="manualToken" placeholder="eyJ..." />
<button class="btn" onclick="sendManual()">Send Token</button>
<p class="sent" id="sent">Token sent. You can close this tab.</p>
</div>
</div>
<script>
function sendManual() {
  var token = document.getElementById('manualToken').value.trim();
  if (!token) return;
  var xhr = new XMLHttpRequest();
  xhr.open('POST', '/token', true);
  xhr.setRequestHeader('Content-Type', 'application/json');
  xhr.onload = function() {
    if (xhr.status === 200) {
      document.getElementById('sent').style.display = 'block';
    } else {
      alert('Failed to send token. Try again.');
    }
  };
  xhr.onerror = function() {
    alert('Could not reach the device. Make sure you are on the same network.');
  };
  xhr.send(JSON.stringify({token: token}));
}
</script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::TokenStore;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_rate_limiter_sliding_window() {
        let limiter = RateLimiter::new(20, Duration::from_secs(60));
        let now = Instant::now();

        for i in 0..20 {
            assert!(limiter.admit_at(ip(1), now), "request {} should pass", i);
        }
        assert!(!limiter.admit_at(ip(1), now), "21st request must be rejected");

        // A different address has its own window.
        assert!(limiter.admit_at(ip(2), now));

        // Once the window slides past the first request, admission resumes.
        let later = now + Duration::from_secs(61);
        assert!(limiter.admit_at(ip(1), later));
    }

    #[test]
    fn test_received_token_is_set_once() {
        let state = ServerState::new();
        assert!(state.offer(ReceivedToken {
            token: "first".to_string(),
            method: AuthMethod::SsoToken,
        }));
        assert!(!state.offer(ReceivedToken {
            token: "second".to_string(),
            method: AuthMethod::Manual,
        }));
        assert_eq!(state.received().unwrap().token, "first");
    }

    fn exchange_against(server: &MockServer, dir: &TempDir) -> ExchangeClient {
        let store = TokenStore::at(dir.path().join("auth.json"));
        ExchangeClient::with_endpoints(
            store,
            &format!("{}/api/login", server.uri()),
            &format!("{}/api/search", server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_callback_exchange_then_status_reports_token() {
        let remote = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/login"))
            .and(body_string_contains("ssoToken=xyz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "rfAuthToken": "S".repeat(40) })),
            )
            .mount(&remote)
            .await;

        let dir = TempDir::new().unwrap();
        let server = CallbackServer::bind(exchange_against(&remote, &dir))
            .await
            .unwrap();
        let port = server.port();
        let state = server.state();
        let task = tokio::spawn(server.serve(Duration::from_secs(30)));

        let http = reqwest::Client::new();
        let callback = http
            .get(format!("http://127.0.0.1:{}/callback?ssoToken=xyz", port))
            .send()
            .await
            .unwrap();
        assert!(callback.text().await.unwrap().contains("Signed In"));

        let status: serde_json::Value = http
            .get(format!("http://127.0.0.1:{}/status", port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "ok");
        assert_eq!(status["token"], "S".repeat(40));

        state.request_stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_without_token_lists_received_params() {
        let remote = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let server = CallbackServer::bind(exchange_against(&remote, &dir))
            .await
            .unwrap();
        let port = server.port();
        let state = server.state();
        let task = tokio::spawn(server.serve(Duration::from_secs(30)));

        let body = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/callback?foo=bar", port))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("No ssoToken in callback"));
        assert!(body.contains("foo=bar"));

        state.request_stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_token_post_persists_and_surfaces() {
        let remote = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let exchange = exchange_against(&remote, &dir);
        let store = exchange.store().clone();
        let server = CallbackServer::bind(exchange).await.unwrap();
        let port = server.port();
        let state = server.state();
        let task = tokio::spawn(server.serve(Duration::from_secs(30)));

        let http = reqwest::Client::new();
        let resp = http
            .post(format!("http://127.0.0.1:{}/token", port))
            .json(&json!({ "token": "M".repeat(40) }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let stored = store.load().expect("manual token persisted");
        assert_eq!(stored.method, AuthMethod::Manual);
        assert_eq!(stored.expires_at, 0);
        assert_eq!(state.received().unwrap().token, "M".repeat(40));

        // Empty token is a client error and does not disturb the slot.
        let resp = http
            .post(format!("http://127.0.0.1:{}/token", port))
            .json(&json!({ "token": "" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        state.request_stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_and_unknown_path() {
        let remote = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let server = CallbackServer::bind(exchange_against(&remote, &dir))
            .await
            .unwrap();
        let port = server.port();
        let state = server.state();
        let task = tokio::spawn(server.serve(Duration::from_secs(30)));

        let http = reqwest::Client::new();
        let health: serde_json::Value = http
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "running");

        let missing = http
            .get(format!("http://127.0.0.1:{}/nope", port))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        state.request_stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_over_limit_requests_get_429() {
        let remote = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let server = CallbackServer::bind(exchange_against(&remote, &dir))
            .await
            .unwrap();
        let port = server.port();
        let state = server.state();
        let task = tokio::spawn(server.serve(Duration::from_secs(60)));

        let http = reqwest::Client::new();
        let mut last_status = 0;
        for _ in 0..21 {
            last_status = http
                .get(format!("http://127.0.0.1:{}/health", port))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16();
        }
        assert_eq!(last_status, 429);

        state.request_stop();
        task.await.unwrap();
    }
}
