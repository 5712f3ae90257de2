use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use swiftcause_core::{BackendConfig, MailSettings, RetryPolicy, StoreConfig};
use swiftcause_service::worker::{spawn_outbox_worker, spawn_receipt_trigger};
use swiftcause_service::{build_router, GatewayConfig, ServiceConfig, ServiceState};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "swiftcaused", version, about = "SwiftCause payment and webhook service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "SWIFTCAUSE_LISTEN")]
    listen: SocketAddr,
    /// Payment provider secret key. Required unless --mock-gateway is set.
    #[arg(long, env = "STRIPE_SECRET_KEY", hide_env_values = true)]
    stripe_secret_key: Option<String>,
    /// Webhook endpoint signing secret.
    #[arg(long, env = "STRIPE_WEBHOOK_SECRET", hide_env_values = true)]
    stripe_webhook_secret: String,
    /// HS256 secret used to verify bearer identity tokens.
    #[arg(long, env = "AUTH_JWT_SECRET", hide_env_values = true)]
    auth_jwt_secret: String,
    /// Sender address written into queued receipt emails.
    #[arg(long, env = "MAIL_FROM")]
    mail_from: String,
    /// API key of the external mail transport that consumes the mail queue.
    #[arg(long, env = "MAIL_API_KEY", hide_env_values = true)]
    mail_api_key: Option<String>,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "SWIFTCAUSE_STORE")]
    store: StoreMode,
    /// PostgreSQL url for the document store.
    #[arg(long, env = "SWIFTCAUSE_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "SWIFTCAUSE_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// File used to persist pending side effects. In-memory when omitted.
    #[arg(long, env = "SWIFTCAUSE_OUTBOX_PATH")]
    outbox_path: Option<PathBuf>,
    /// Seconds between outbox drain passes.
    #[arg(long, default_value_t = 5, env = "SWIFTCAUSE_OUTBOX_POLL_SECS")]
    outbox_poll_secs: u64,
    /// Where the provider sends an organization after finishing onboarding.
    #[arg(
        long,
        default_value = "http://localhost:3000/admin/onboarding/complete",
        env = "SWIFTCAUSE_ONBOARDING_RETURN_URL"
    )]
    onboarding_return_url: String,
    /// Where the provider sends an organization whose onboarding link expired.
    #[arg(
        long,
        default_value = "http://localhost:3000/admin/onboarding/refresh",
        env = "SWIFTCAUSE_ONBOARDING_REFRESH_URL"
    )]
    onboarding_refresh_url: String,
    /// Comma-separated ISO currency codes accepted for payment intents.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "gbp,usd,eur",
        env = "SWIFTCAUSE_SUPPORTED_CURRENCIES"
    )]
    supported_currencies: Vec<String>,
    /// Require a bearer token for terminal connection tokens.
    #[arg(long, default_value_t = false, env = "SWIFTCAUSE_REQUIRE_AUTH_FOR_CONNECTION_TOKEN")]
    require_auth_for_connection_token: bool,
    /// Use the in-process mock gateway instead of the real provider.
    #[arg(long, default_value_t = false)]
    mock_gateway: bool,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };
    Ok(store)
}

fn resolve_gateway(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    if cli.mock_gateway {
        return Ok(GatewayConfig::Mock);
    }
    let secret_key = cli
        .stripe_secret_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("STRIPE_SECRET_KEY is required (or pass --mock-gateway)"))?;
    Ok(GatewayConfig::Stripe { secret_key })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "swiftcause_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        store: resolve_store(&cli)?,
        outbox_path: cli.outbox_path.clone(),
        retry_policy: RetryPolicy::default(),
        gateway: resolve_gateway(&cli)?,
        webhook_secret: cli.stripe_webhook_secret.clone(),
        jwt_secret: cli.auth_jwt_secret.clone(),
        mail: MailSettings {
            from: cli.mail_from.clone(),
        },
        mail_api_key: cli.mail_api_key.clone(),
        backend: BackendConfig {
            supported_currencies: cli
                .supported_currencies
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            onboarding_return_url: cli.onboarding_return_url.clone(),
            onboarding_refresh_url: cli.onboarding_refresh_url.clone(),
            require_auth_for_connection_token: cli.require_auth_for_connection_token,
        },
    };
    let state = ServiceState::bootstrap(config).await?;

    let trigger = spawn_receipt_trigger(&state.events, state.outbox.clone());
    let worker = spawn_outbox_worker(
        state.outbox.clone(),
        state.dispatcher.clone(),
        Duration::from_secs(cli.outbox_poll_secs.max(1)),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("swiftcause-service REST listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app).await;
    trigger.abort();
    worker.abort();
    served?;
    Ok(())
}
