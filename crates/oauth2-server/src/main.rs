//! OAuth2 authorization server
//!
//! `serve` runs the HTTP endpoints; `add-user`, `add-client` and
//! `hash-secret` manage the credential store from the command line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oauth2_server::clock::{Clock, SystemClock};
use oauth2_server::config::Config;
use oauth2_server::generator::RandomGenerator;
use oauth2_server::model::{NewClient, NewUserAccount};
use oauth2_server::secret::{hash_secret, HashVerifier};
use oauth2_server::store::{CredentialStore, MemoryStore};
use oauth2_server::AppState;

#[derive(Parser, Debug)]
#[command(name = "oauth2-server")]
#[command(about = "OAuth2 authorization server")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 3001, env = "AUTH_PORT", global = true)]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "AUTH_BIND", global = true)]
    bind: String,

    /// Path to config directory (config.json and persisted relations)
    #[arg(long, default_value = "/config", env = "AUTH_CONFIG_PATH", global = true)]
    config_path: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Register a resource owner
    AddUser {
        #[arg(long)]
        username: String,
        #[arg(long, env = "AUTH_NEW_PASSWORD")]
        password: String,
        #[arg(long)]
        country: String,
        #[arg(long)]
        subscriber_id: String,
    },
    /// Register a client application
    AddClient {
        #[arg(long)]
        name: String,
        #[arg(long)]
        client_id: String,
        #[arg(long, env = "AUTH_NEW_CLIENT_SECRET")]
        client_secret: String,
        #[arg(long)]
        redirect_uri: String,
    },
    /// Print the Argon2 hash of a secret
    HashSecret { secret: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth2_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli.config_path, &cli.bind, cli.port).await,
        Command::AddUser {
            username,
            password,
            country,
            subscriber_id,
        } => {
            let config = Config::load(&cli.config_path)?;
            let store = open_store(&config, &cli.config_path)?;
            let user = store.insert_user(NewUserAccount {
                username,
                password_hash: hash_secret(&password)
                    .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?,
                country,
                subscriber_id,
            })?;
            println!("Created user {} ({})", user.id, user.username);
            Ok(())
        }
        Command::AddClient {
            name,
            client_id,
            client_secret,
            redirect_uri,
        } => {
            url::Url::parse(&redirect_uri).context("redirect_uri must be an absolute URL")?;
            let config = Config::load(&cli.config_path)?;
            let store = open_store(&config, &cli.config_path)?;
            let client = store.insert_client(NewClient {
                name,
                client_id,
                client_secret_hash: hash_secret(&client_secret)
                    .map_err(|e| anyhow::anyhow!("Failed to hash client secret: {}", e))?,
                redirect_uri,
            })?;
            println!("Created client {} ({})", client.id, client.client_id);
            Ok(())
        }
        Command::HashSecret { secret } => {
            let hash =
                hash_secret(&secret).map_err(|e| anyhow::anyhow!("Failed to hash secret: {}", e))?;
            println!("{}", hash);
            Ok(())
        }
    }
}

fn open_store(config: &Config, config_path: &str) -> Result<MemoryStore> {
    if config.storage.persist {
        MemoryStore::open(config_path)
            .with_context(|| format!("Failed to open credential store in {}", config_path))
    } else {
        tracing::warn!("Persistence disabled; all credentials are lost on restart");
        Ok(MemoryStore::new())
    }
}

async fn serve(config_path: &str, bind: &str, port: u16) -> Result<()> {
    let config = Config::load(config_path)?;
    let store: Arc<dyn CredentialStore> = Arc::new(open_store(&config, config_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let reaper_interval = config.reaper.interval_secs;
    let state = Arc::new(AppState::new(
        config,
        store.clone(),
        Arc::new(HashVerifier),
        Arc::new(RandomGenerator),
        clock.clone(),
    ));

    if reaper_interval > 0 {
        tokio::spawn(reap_expired(store, clock, Duration::from_secs(reaper_interval)));
    }

    let app = oauth2_server::router(state);

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;

    tracing::info!("Starting oauth2-server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("oauth2-server shut down");
    Ok(())
}

/// Periodically drop expired codes and tokens. Redemption checks expiry on
/// its own, so this only bounds storage growth.
async fn reap_expired(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.delete_expired(clock.now()) {
            Ok(purged) if purged.authorization_codes + purged.tokens > 0 => tracing::info!(
                "Cleaned up {} expired authorization codes and {} expired tokens",
                purged.authorization_codes,
                purged.tokens
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to clean up expired credentials: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
