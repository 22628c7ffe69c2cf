/// LinguaTip Backend
///
/// Backend service for the LinguaTip language-learning app. Three tips a
/// day unlock per user at scheduled times; the service keeps every user's
/// schedule reconciled through a periodic sweep and on-demand requests,
/// and forwards unlock events to the notification webhook.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;

use linguatip_backend::config::Config;
use linguatip_backend::http_server::{self, AppState};
use linguatip_backend::notifier::{NoopNotifier, NotificationBridge, WebhookNotifier};
use linguatip_backend::reconciler::Reconciler;
use linguatip_backend::store::{PgStore, UnlockStore};
use linguatip_backend::sweep::{start_sweep_loop, SweepStatus};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting LinguaTip backend...");

    // Load configuration from environment
    let cfg = Config::from_env()?;

    // Validate configuration and connections
    cfg.validate().await?;

    // Connect storage and make sure the schema exists
    let pg = PgStore::connect(&cfg).await?;
    pg.init_schema().await?;
    let store: Arc<dyn UnlockStore> = Arc::new(pg);

    // Notification bridge: webhook when configured, otherwise drop
    let notifier: Arc<dyn NotificationBridge> = match &cfg.notify_webhook_url {
        Some(url) => {
            log::info!("Dispatching unlock notifications to {}", url);
            Arc::new(WebhookNotifier::new(url.clone(), cfg.notify_timeout_secs)?)
        }
        None => {
            log::warn!("NOTIFY_WEBHOOK_URL not set - notifications will be dropped");
            Arc::new(NoopNotifier)
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        notifier,
        cfg.unlock_times,
        cfg.day_offset,
    ));

    let sweep_status = Arc::new(RwLock::new(SweepStatus::default()));

    // Background sweep keeps unlocks landing while the app is closed
    tokio::spawn(start_sweep_loop(
        cfg.sweep_interval_minutes,
        store.clone(),
        reconciler.clone(),
        sweep_status.clone(),
    ));

    let state = AppState {
        config: cfg.clone(),
        store,
        reconciler,
        sweep_status,
    };

    http_server::start_server(state, cfg.http_port).await
}
