//! SAML Gateway
//!
//! A web application that delegates login to a SAML 2.0 Identity Provider
//! and keeps the result in a signed browser session. Serves SP metadata,
//! SP-initiated login over the HTTP-Redirect binding, the HTTP-POST
//! assertion consumer service, a protected page and logout.

mod error;
mod http;
mod request;
mod saml;
mod session;
mod settings;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use http::AppState;
use request::AdapterOptions;
use session::{
    spawn_cleanup_task, CookieConfig, CookieSigner, SessionStore, DEFAULT_CLEANUP_INTERVAL_SECS,
    DEFAULT_COOKIE_NAME, MAX_SESSION_TTL_SECS,
};

/// Default session lifetime: 8 hours.
const DEFAULT_SESSION_TTL_SECS: u64 = 8 * 60 * 60;

/// Longest interval between expired-session sweeps: one day.
const MAX_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "saml-gateway")]
#[command(about = "SAML 2.0 service provider gateway")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:5000", env = "LISTEN_ADDR")]
    listen: SocketAddr,

    /// Path to the SAML settings JSON
    #[arg(long, default_value = "saml/settings.json", env = "SAML_SETTINGS")]
    settings: PathBuf,

    /// Secret for signing session cookies (at least 32 bytes).
    /// Changing it logs out every user.
    #[arg(long, env = "SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// Path to the session database
    #[arg(long, default_value = "data/sessions.redb", env = "SESSION_STORE_PATH")]
    session_store: PathBuf,

    /// Session lifetime in seconds (at most one year)
    #[arg(
        long,
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        env = "SESSION_TTL_SECS",
        value_parser = clap::value_parser!(u64).range(1..=MAX_SESSION_TTL_SECS)
    )]
    session_ttl_secs: u64,

    /// Interval between expired-session sweeps, in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS,
        env = "SESSION_CLEANUP_INTERVAL_SECS",
        value_parser = clap::value_parser!(u64).range(1..=MAX_CLEANUP_INTERVAL_SECS)
    )]
    cleanup_interval_secs: u64,

    /// Session cookie name
    #[arg(long, default_value = DEFAULT_COOKIE_NAME, env = "SESSION_COOKIE_NAME")]
    cookie_name: String,

    /// Omit the Secure cookie flag (plain-HTTP development only)
    #[arg(long, env = "INSECURE_COOKIES")]
    insecure_cookies: bool,

    /// Honour X-Forwarded-Proto/Host/Port from a reverse proxy
    #[arg(long, env = "TRUST_PROXY_HEADERS")]
    trust_proxy_headers: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "SAML_GATEWAY_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},tower_http={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .json()
        .init();

    info!("Starting SAML gateway");

    let signer = CookieSigner::new(args.session_secret.as_bytes())
        .context("Invalid --session-secret")?;

    let settings = settings::load(&args.settings)
        .with_context(|| format!("Failed to load SAML settings from {:?}", args.settings))?;
    let settings = Arc::new(settings);

    let store = SessionStore::open(args.session_store.clone(), args.session_ttl_secs)
        .context("Failed to initialize session store")?;
    let store = Arc::new(store);
    info!(path = ?args.session_store, ttl_secs = args.session_ttl_secs, "Session store initialized");

    let cleanup = spawn_cleanup_task(Arc::clone(&store), args.cleanup_interval_secs);

    if args.insecure_cookies {
        warn!("Session cookies are issued without the Secure flag");
    }

    let state = AppState {
        settings,
        sessions: store,
        signer,
        cookies: CookieConfig {
            name: args.cookie_name,
            secure: !args.insecure_cookies,
        },
        adapter: AdapterOptions {
            trust_proxy_headers: args.trust_proxy_headers,
        },
    };

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "Listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    cleanup.abort();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from([
            "saml-gateway",
            "--session-secret",
            "0123456789abcdef0123456789abcdef",
        ])
        .unwrap();
        assert_eq!(args.listen, "127.0.0.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(args.settings, PathBuf::from("saml/settings.json"));
        assert_eq!(args.session_ttl_secs, DEFAULT_SESSION_TTL_SECS);
        assert_eq!(args.cookie_name, DEFAULT_COOKIE_NAME);
        assert!(!args.insecure_cookies);
    }

    #[test]
    fn test_session_ttl_range_checked() {
        let parse = |ttl: &str| {
            Args::try_parse_from([
                "saml-gateway",
                "--session-secret",
                "0123456789abcdef0123456789abcdef",
                "--session-ttl-secs",
                ttl,
            ])
        };
        assert_eq!(parse("3600").unwrap().session_ttl_secs, 3600);
        assert!(parse("0").is_err());
        assert!(parse(&u64::MAX.to_string()).is_err());
        assert!(parse(&(MAX_SESSION_TTL_SECS + 1).to_string()).is_err());
    }

    #[test]
    fn test_session_secret_is_required() {
        if std::env::var_os("SESSION_SECRET").is_none() {
            assert!(Args::try_parse_from(["saml-gateway"]).is_err());
        }
    }
}
