//! Opens the user's cache and runs the CLI's best-effort sync.

use brewtracker_core::{HttpRemote, Offline, RemoteApi, SessionContext, UserCache};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{init_db, SqliteStorage};

/// Opens the cache stored in the configured database. Without sync settings
/// every push and pull fails as offline and operations stay queued.
pub async fn open_cache(config: &Config) -> Result<Arc<UserCache>, Box<dyn std::error::Error>> {
    let pool = init_db(&config.database_path.value).await?;
    let storage = Arc::new(SqliteStorage::new(pool));
    let session = SessionContext::new(config.user_id.value.clone(), storage);

    let remote: Arc<dyn RemoteApi> = match (&config.sync.server_url, &config.sync.api_key) {
        (Some(url), Some(key)) => Arc::new(HttpRemote::new(url.clone(), key.clone())),
        _ => Arc::new(Offline),
    };

    let cache = UserCache::open(session, remote, config.cache_config()).await?;
    Ok(Arc::new(cache))
}

/// Syncs if `auto_sync` is enabled. Failures are reported and otherwise
/// ignored so the CLI keeps working offline.
pub async fn try_auto_sync(cache: &UserCache, config: &Config) {
    if !config.sync.auto_sync || !config.sync.is_configured() {
        return;
    }

    let report = cache.sync().await;
    if let Some(e) = &report.pull_error {
        eprintln!("Auto-sync: {}", e);
    } else if report.failed > 0 {
        eprintln!(
            "Auto-sync: {} operation(s) failed; see `brew failed list`",
            report.failed
        );
    }
    if report.conflicted > 0 {
        eprintln!(
            "Auto-sync: {} new conflict(s); see `brew conflict list`",
            report.conflicted
        );
    }
    tracing::debug!(pushed = report.pushed, pulled = report.pulled, "auto-sync done");
}
