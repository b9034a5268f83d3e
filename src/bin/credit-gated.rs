#[cfg(feature = "http")]
use std::sync::Arc;

#[cfg(feature = "http")]
use credit_gate::{GateHttpState, LedgerStore, MemoryLedger, ServiceConfig, StoreConfig};

#[cfg(feature = "http")]
use tracing_subscriber::Layer as _;
#[cfg(feature = "http")]
use tracing_subscriber::layer::SubscriberExt as _;
#[cfg(feature = "http")]
use tracing_subscriber::util::SubscriberInitExt as _;

#[cfg(feature = "http")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().ok_or(
        "usage: credit-gated <config.json> [--listen HOST:PORT] [--admin-token TOKEN] [--sqlite PATH] [--redis URL] [--redis-prefix PREFIX] [--json-logs]",
    )?;

    let mut listen_flag: Option<String> = None;
    let mut admin_token_flag: Option<String> = None;
    let mut sqlite_path: Option<std::path::PathBuf> = None;
    let mut redis_url: Option<String> = None;
    let mut redis_prefix: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_flag = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--admin-token" => {
                admin_token_flag = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?.into());
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--redis-prefix" => {
                redis_prefix = Some(args.next().ok_or("missing value for --redis-prefix")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    init_logging(json_logs)?;

    let mut config = ServiceConfig::load(&config_path)?;
    if let Some(listen) = listen_flag {
        config.listen = Some(listen);
    }
    if let Some(token) = admin_token_flag {
        config.admin_token = Some(token);
    }
    if let Some(path) = sqlite_path {
        config.store = Some(StoreConfig::Sqlite { path });
    }
    if let Some(url) = redis_url {
        config.store = Some(StoreConfig::Redis {
            url,
            prefix: redis_prefix,
        });
    }

    let store = build_store(&config).await?;
    let listen = config
        .listen
        .clone()
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let state = GateHttpState::from_config(store, &config);
    let app = credit_gate::http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "credit-gated listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "http")]
async fn build_store(
    config: &ServiceConfig,
) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    match config.store.clone() {
        #[cfg(feature = "store-sqlite")]
        Some(StoreConfig::Sqlite { path }) => {
            let store = credit_gate::SqliteLedger::new(path);
            store.init().await?;
            tracing::info!(path = %store.path().display(), "using sqlite ledger");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "store-redis")]
        Some(StoreConfig::Redis { url, prefix }) => {
            let mut store = credit_gate::RedisLedger::new(url)?;
            if let Some(prefix) = prefix {
                store = store.with_prefix(prefix);
            }
            store.ping().await?;
            tracing::info!(prefix = %store.prefix(), "using redis ledger");
            Ok(Arc::new(store))
        }
        #[cfg(not(all(feature = "store-sqlite", feature = "store-redis")))]
        Some(other) => Err(format!("store backend not compiled in: {other:?}").into()),
        None => {
            tracing::warn!("no store configured; ledger state is in-memory and lost on restart");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

#[cfg(feature = "http")]
fn init_logging(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(not(feature = "http"))]
fn main() {
    eprintln!("credit-gated requires the `http` feature");
}
