//! Authentication for the Cisco Live on-demand library
//!
//! The site is gated behind Cisco federated SSO (SAML). A browser login sets
//! an `ssoToken` on the callback redirect, which is exchanged for a JWT via
//! the RainFocus login API. The JWT then rides in the `rfAuthToken` header on
//! every authenticated call.
//!
//! Paths to a token, in order of preference:
//! - browser flow: a short-lived local callback server brokers the SAML
//!   redirect ([`server`], fronted by [`session::LoginSession`])
//! - programmatic flow: username/password walked through the same handshake
//!   without a browser ([`saml::CredentialFlow`])
//! - global-cookie exchange and manual token entry as fallbacks
//!   ([`exchange::ExchangeClient`])

pub mod exchange;
pub mod saml;
pub mod server;
pub mod session;
pub mod store;

pub use exchange::{ExchangeClient, Validation};
pub use saml::CredentialFlow;
pub use session::LoginSession;
pub use store::{AuthMethod, AuthToken, TokenStore};

use thiserror::Error;

/// RainFocus login endpoint (exchanges artifacts/cookies for a JWT).
pub const LOGIN_URL: &str = "https://events.rainfocus.com/api/login";

/// RainFocus search endpoint, used only as a minimal validation probe.
pub const SEARCH_URL: &str = "https://events.rainfocus.com/api/search";

/// Entry point of the SAML handshake for the on-demand library.
pub const SAML_REQUEST_URL: &str = "https://events.rainfocus.com/ev:cisco/clondemand/samlRequest";

/// SAML SSO profile for Cisco Live on-demand.
pub const SSO_PROFILE_ID: &str = "saml:jUN6c3A5jl";

/// Widget/profile identity pair required on authenticated API calls.
pub const AUTH_WIDGET_ID: &str = "M7n14I8sz0pklW1vybwVRdKrgdREj8sR";
pub const AUTH_PROFILE_ID: &str = "HEedDIRblcZk7Ld3KHm1T0VUtZog9eG9";

/// Session cookie set on .rainfocus.com after SAML login; its value can be
/// posted to the login API as an alternate path to a JWT.
pub const GLOBAL_COOKIE_NAME: &str = "1586783053443001TvYm";

/// Origin/Referer the API expects to see on widget requests.
pub const SITE_ORIGIN: &str = "https://ciscolive.cisco.com";
pub const SITE_REFERER: &str = "https://www.ciscolive.com/on-demand/on-demand-library.html";

/// Failure reasons surfaced by the auth flows.
///
/// Remote calls return one of these instead of panicking or bubbling raw
/// transport errors; the boundary layers (callback server, CLI) turn them
/// into pages or messages.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Network or timeout failure reaching a remote endpoint. Retryable by
    /// re-invoking the same operation.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote login or auth API explicitly rejected the request.
    /// Never retried automatically.
    #[error("{0}")]
    Remote(String),

    /// The response parsed fine but carried no recognizable token.
    #[error("login response contained no usable token")]
    NoToken,

    /// The programmatic SAML flow hit an unexpected shape (missing form
    /// fields, broken redirects). Terminal for that flow only; the browser
    /// login remains available.
    #[error("{0}")]
    Protocol(String),

    /// An empty artifact, cookie, or token was supplied.
    #[error("{0} is empty")]
    Empty(&'static str),
}
