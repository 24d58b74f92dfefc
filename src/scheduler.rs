//! Background schedulers.
//!
//! Three loops, none of which touch the request hot path:
//! - auto-refresh: periodically refreshes OAuth tokens that are about to
//!   expire, bounded concurrency;
//! - usage poll: per-account vendor usage fetches into the usage cache,
//!   with exponential backoff on repeated failures;
//! - hourly sweep: expires transient oauth_sessions rows.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountState, AccountStore};
use crate::auth::RefreshManager;
use crate::constants::{
    AUTO_REFRESH_CONCURRENCY, AUTO_REFRESH_INTERVAL, AUTO_REFRESH_THRESHOLD_MS,
    MAINTENANCE_SWEEP_INTERVAL, USAGE_POLL_INTERVAL,
};
use crate::db;
use crate::usage_cache::{UsageCache, fetch_account_usage, timestamp_millis};

/// Whether the auto-refresh sweep should refresh this account now.
fn needs_auto_refresh(account: &Account, now: u64) -> bool {
    if !account.auto_refresh_enabled
        || !account.provider.supports_oauth()
        || account.state(now) == AccountState::Paused
        || account.state(now) == AccountState::TokenInvalid
    {
        return false;
    }
    match account.expires_at {
        Some(expires) => expires.saturating_sub(now) < AUTO_REFRESH_THRESHOLD_MS,
        None => true,
    }
}

/// Periodic sweep refreshing about-to-expire OAuth tokens.
pub fn spawn_auto_refresh(
    store: Arc<AccountStore>,
    refresh: Arc<RefreshManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(AUTO_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let accounts = match store.get_all().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!("Auto-refresh sweep cannot read accounts: {e}");
                    continue;
                }
            };

            let now = timestamp_millis();
            let due: Vec<Account> = accounts
                .into_iter()
                .filter(|a| needs_auto_refresh(a, now))
                .collect();
            if due.is_empty() {
                continue;
            }
            info!("Auto-refresh sweep: {} account(s) due", due.len());

            futures_util::stream::iter(due)
                .for_each_concurrent(AUTO_REFRESH_CONCURRENCY, |account| {
                    let refresh = Arc::clone(&refresh);
                    async move {
                        if let Err(e) = refresh.refresh(&account).await {
                            warn!("Auto-refresh failed for account {}: {e}", account.name);
                        }
                    }
                })
                .await;
        }
    })
}

/// Per-account vendor usage polling into the usage cache.
///
/// One loop drives all accounts; an account's poll is skipped for
/// exponentially more ticks after each consecutive failure, and its cache
/// entry is dropped once it is paused or removed.
pub fn spawn_usage_poller(
    store: Arc<AccountStore>,
    refresh: Arc<RefreshManager>,
    cache: Arc<UsageCache>,
    client: Client,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(USAGE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // account id → (consecutive failures, ticks to skip)
        let mut backoff: HashMap<String, (u32, u32)> = HashMap::new();
        let mut tracked: Vec<String> = Vec::new();

        loop {
            ticker.tick().await;
            let accounts = match store.get_all().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!("Usage poller cannot read accounts: {e}");
                    continue;
                }
            };

            let now = timestamp_millis();
            let pollable: Vec<&Account> = accounts
                .iter()
                .filter(|a| {
                    a.provider.supports_usage_tracking()
                        && !a.paused
                        && a.has_valid_access_token(now)
                })
                .collect();

            // Evict cache entries for accounts that stopped being pollable
            let current_ids: Vec<String> = pollable.iter().map(|a| a.id.clone()).collect();
            for gone in tracked.iter().filter(|id| !current_ids.contains(*id)) {
                cache.remove(gone).await;
            }
            backoff.retain(|id, _| current_ids.contains(id));
            tracked = current_ids;

            for account in pollable {
                if let Some((_, skip)) = backoff.get_mut(&account.id) {
                    if *skip > 0 {
                        *skip -= 1;
                        continue;
                    }
                }

                let Ok(token) = refresh.get_valid_access_token(account).await else {
                    continue;
                };
                match fetch_account_usage(&client, &token).await {
                    Ok(snapshot) => {
                        debug!(
                            "Usage for account {}: {:?}% ({:?})",
                            account.name, snapshot.utilization_pct, snapshot.most_restrictive_window
                        );
                        tracing::trace!(
                            "Usage payload for account {}: {}",
                            account.name,
                            snapshot.payload
                        );
                        cache.insert(account.id.clone(), snapshot).await;
                        backoff.remove(&account.id);
                    }
                    Err(e) => {
                        let failures = backoff.get(&account.id).map(|(f, _)| f + 1).unwrap_or(1);
                        let skip = (1u32 << failures.min(6)) - 1;
                        warn!(
                            "Usage poll failed for account {} ({failures} consecutive): {e}",
                            account.name
                        );
                        backoff.insert(account.id.clone(), (failures, skip));
                    }
                }
            }
        }
    })
}

/// Hourly sweep of expired transient OAuth-session rows.
pub fn spawn_session_sweep() -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(MAINTENANCE_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Ok(conn) = db::get_conn().await else {
                continue;
            };
            match conn
                .execute(
                    "DELETE FROM oauth_sessions WHERE expires_at < ?",
                    (timestamp_millis() as i64,),
                )
                .await
            {
                Ok(deleted) if deleted > 0 => {
                    info!("Swept {deleted} expired oauth session(s)")
                }
                Ok(_) => {}
                Err(e) => warn!("OAuth session sweep failed: {e}"),
            }
        }
    })
}
