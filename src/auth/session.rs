//! Caller-facing handle for one browser login attempt
//!
//! Starting a session binds the callback server and moves its serve loop
//! onto a background task; the caller gets connection info immediately and
//! polls for the token. Nothing here blocks the calling task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::exchange::ExchangeClient;
use super::server::{CallbackServer, ReceivedToken, ServerState};

pub use super::server::LOGIN_TIMEOUT;

/// A running login attempt.
pub struct LoginSession {
    state: Arc<ServerState>,
    task: tokio::task::JoinHandle<()>,
    login_url: String,
    local_url: String,
    port: u16,
}

impl LoginSession {
    /// Bind the callback server and start serving in the background.
    /// Returns as soon as the listener is up.
    pub async fn start(exchange: ExchangeClient, timeout: Duration) -> Result<Self> {
        let server = CallbackServer::bind(exchange).await?;
        let state = server.state();
        let login_url = server.login_url();
        let local_url = server.local_url();
        let port = server.port();
        tracing::info!("Login callback server listening on port {}", port);
        let task = tokio::spawn(server.serve(timeout));
        Ok(Self {
            state,
            task,
            login_url,
            local_url,
            port,
        })
    }

    /// URL for a browser on another device on the network.
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// URL for a browser on this machine.
    pub fn local_url(&self) -> &str {
        &self.local_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Non-blocking check for a received token.
    pub fn poll(&self) -> Option<ReceivedToken> {
        self.state.received()
    }

    /// Whether the serve loop has exited (token received, stopped, or
    /// timed out).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the serve loop to exit. Never blocks waiting for in-flight
    /// requests; the loop observes the flag within one tick and closes the
    /// listening socket itself.
    pub fn stop(&self) {
        self.state.request_stop();
    }

    /// Poll once per second until a token arrives or the serve loop exits
    /// (timeout or stop), whichever comes first.
    pub async fn wait(&self) -> Option<ReceivedToken> {
        loop {
            if let Some(received) = self.poll() {
                return Some(received);
            }
            if self.is_finished() {
                return self.poll();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
