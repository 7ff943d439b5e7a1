//! Cisco Live CLI - on-demand library client
//!
//! Front end for the authentication core: browser-brokered SSO login,
//! fully programmatic credential login, manual token entry, and token
//! status/validation.

mod auth;

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{CredentialFlow, ExchangeClient, LoginSession, TokenStore, Validation};

#[derive(Parser)]
#[command(name = "ciscolive-cli")]
#[command(about = "Lightweight CLI client for the Cisco Live on-demand library", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a browser on any device on the network
    Login {
        /// Cisco account username for the fully programmatic sign-in
        /// (skips the browser flow; fails closed to it on any ambiguity)
        #[arg(long)]
        username: Option<String>,

        /// Password for --username (prompted if omitted)
        #[arg(long, env = "CISCOLIVE_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Seconds to wait for the browser login to complete
        #[arg(long)]
        timeout: Option<u64>,

        /// Start a fresh login even if a stored token exists
        #[arg(short, long)]
        force: bool,
    },

    /// Save a token copied from browser dev tools
    Token {
        /// The JWT / auth token value
        token: String,
    },

    /// Probe the remote API with the stored token
    Validate,

    /// Show current authentication status
    Status,

    /// Log out and clear the stored token
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            username: Some(username),
            password,
            ..
        } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password()?,
            };
            credential_login(&username, &password).await?;
        }
        Commands::Login {
            username: None,
            timeout,
            force,
            ..
        } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(auth::session::LOGIN_TIMEOUT);
            browser_login(timeout, force).await?;
        }
        Commands::Token { token } => {
            save_manual_token(&token).await?;
        }
        Commands::Validate => {
            validate().await?;
        }
        Commands::Status => {
            status()?;
        }
        Commands::Logout => {
            logout()?;
        }
    }

    Ok(())
}

/// Interactive flow: start the callback server, show the URLs, poll until
/// the token lands or the attempt times out.
async fn browser_login(timeout: Duration, force: bool) -> Result<()> {
    let store = TokenStore::open()?;
    if !force && store.is_authenticated() {
        println!("Already logged in. Use --force to start a fresh login.");
        return Ok(());
    }

    let exchange = ExchangeClient::new(store)?;
    let session = LoginSession::start(exchange, timeout).await?;
    tracing::debug!("Callback server on port {}", session.port());

    println!();
    println!("On another device, open:  {}", session.login_url());
    println!("On this machine:          {}", session.local_url());
    println!();
    println!("Waiting for sign-in to complete...");

    let outcome = session.wait().await;
    session.stop();
    match outcome {
        Some(received) => {
            println!("Login successful ({}).", received.method);
            Ok(())
        }
        None => bail!("login not completed in time"),
    }
}

/// Programmatic flow from raw credentials.
async fn credential_login(username: &str, password: &str) -> Result<()> {
    let store = TokenStore::open()?;
    let exchange = ExchangeClient::new(store)?;
    let flow = CredentialFlow::new(exchange)?;

    tracing::info!("Starting programmatic sign-in...");
    let token = flow.login(username, password).await?;
    println!("Login successful ({}).", token.method);
    Ok(())
}

async fn save_manual_token(token: &str) -> Result<()> {
    let store = TokenStore::open()?;
    let exchange = ExchangeClient::new(store)?;
    let saved = exchange.save_manual_token(token).await?;
    println!("Token saved ({}).", saved.method);
    Ok(())
}

async fn validate() -> Result<()> {
    let store = TokenStore::open()?;
    let Some(token) = store.load() else {
        bail!("no stored token. Run 'ciscolive-cli login' first.");
    };
    let exchange = ExchangeClient::new(store)?;
    match exchange.validate(&token.bearer_token).await? {
        Validation::Valid => println!("Token accepted by the API."),
        Validation::Invalid(reason) => println!("Token rejected: {}.", reason),
    }
    Ok(())
}

fn status() -> Result<()> {
    let store = TokenStore::open()?;

    if !store.is_authenticated() {
        println!("Signed in:    no");
        println!("\nRun 'ciscolive-cli login' to authenticate.");
        return Ok(());
    }

    if let Some(token) = store.load() {
        println!("Signed in:    yes ({})", token.method);
        println!("  saved_at:   {}", token.saved_at);
        if token.expires_at > 0 {
            println!("  expires_at: {}", token.expires_at);
            if store.expires_soon(3600) {
                println!("  note:       token expires within the hour");
            }
        } else {
            println!("  expires_at: unknown (never verified)");
        }
    }
    Ok(())
}

fn logout() -> Result<()> {
    let store = TokenStore::open()?;
    store.clear();
    println!("Logged out.");
    Ok(())
}

fn prompt_password() -> Result<String> {
    print!("Password: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    let password = password.trim_end_matches(&['\r', '\n'][..]).to_string();
    if password.is_empty() {
        bail!("no password entered");
    }
    Ok(password)
}
