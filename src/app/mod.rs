use crate::auth::{CredentialGuard, TwitchIdentityClient};
use crate::config::Config;
use crate::device::{DeviceCommandPort, DryRunPort, HueBridgePort};
use crate::helix::HelixClient;
use crate::queue::{CommandQueue, QueueSettings};
use crate::router::Router;
use crate::session::{ReconnectPolicy, Session, SessionSettings, SessionState, TungsteniteConnector};
use crate::store::{self, keys, ConfigStore};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = std::env::args().nth(1);
    if command.as_deref() == Some("config-init") {
        return handle_config_init();
    }

    let config = Config::load()?;
    let dev = command.as_deref() == Some("dev");

    match command.as_deref() {
        Some("store-get") => return handle_store_get(&config).await,
        Some("store-set") => return handle_store_set(&config).await,
        Some("store-list") => return handle_store_list(&config).await,
        _ => {}
    }

    run_bridge(&config, dev).await
}

async fn run_bridge(config: &Config, dev: bool) -> Result<(), Box<dyn std::error::Error>> {
    if dev {
        tracing::info!("development mode: local endpoints, chat commands enabled");
    }

    let store = Arc::new(ConfigStore::new(config.store_path(dev)));
    store.update(keys::APPLICATION_VERSION, APP_VERSION).await?;

    let channel_id = store
        .get_non_empty(keys::CHANNEL_ID)
        .await
        .ok_or("ChannelId is not set (use: store-set ChannelId <id>)")?;

    let timeout = Duration::from_millis(config.helix.timeout_ms);
    let authority = Arc::new(TwitchIdentityClient::new(config.auth_base(dev), timeout)?);
    let guard = Arc::new(CredentialGuard::new(store.clone(), authority));
    let helix = Arc::new(HelixClient::new(config.api_base(dev), guard.clone(), timeout)?);

    let port: Arc<dyn DeviceCommandPort> = if config.hue.dry_run {
        tracing::info!("hue dry-run enabled, lamp commands are only logged");
        Arc::new(DryRunPort)
    } else {
        Arc::new(HueBridgePort::new(store.clone(), &config.hue)?)
    };
    let queue = CommandQueue::start(
        port,
        QueueSettings {
            capacity: config.queue.capacity,
            command_timeout: Duration::from_millis(config.queue.command_timeout_ms),
        },
    );

    let router = Router::from_config(config, dev)?;
    let settings = SessionSettings {
        default_url: config.eventsub_url(dev).to_string(),
        channel_id,
        subscriptions: config.subscriptions(dev),
        reconnect: ReconnectPolicy {
            max_attempts: config.eventsub.max_reconnect_attempts,
            delay: Duration::from_millis(config.eventsub.reconnect_delay_ms),
        },
        max_message_bytes: config.eventsub.max_message_bytes,
        dev_mode: dev,
    };
    let session = Session::new(
        TungsteniteConnector,
        guard,
        helix,
        router,
        queue.sender(),
        settings,
    );
    let state_task = tokio::spawn(log_state_changes(session.state()));

    let result = tokio::select! {
        res = session.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    };

    queue.stop().await;
    state_task.abort();
    tracing::info!("bridge stopped");
    result.map_err(Into::into)
}

async fn log_state_changes(mut rx: watch::Receiver<SessionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        match state {
            SessionState::Closed => tracing::warn!(state = %state, "eventsub session"),
            _ => tracing::info!(state = %state, "eventsub session"),
        }
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn open_store(config: &Config) -> ConfigStore {
    let dev = std::env::args().any(|arg| arg == "--dev");
    ConfigStore::new(config.store_path(dev))
}

async fn handle_store_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let key = std::env::args()
        .nth(2)
        .ok_or("missing key (usage: store-get <key> [--dev])")?;
    let store = open_store(config);
    let value = store
        .get(&key)
        .await
        .ok_or_else(|| format!("key not found: {key}"))?;
    println!("{}", value);
    Ok(())
}

async fn handle_store_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args
        .next()
        .ok_or("missing key (usage: store-set <key> <value> [--dev])")?;
    let value = args.next().ok_or("missing value")?;

    let store = open_store(config);
    store.update(&key, &value).await?;
    println!("Stored key: {} in {}", key, store.path().display());
    Ok(())
}

async fn handle_store_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config);
    let doc = store::masked(&store.snapshot().await);
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
