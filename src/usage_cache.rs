//! Vendor usage cache.
//!
//! Per-account snapshots of the vendor usage endpoint (utilization per
//! window plus the full payload), kept in memory with a TTL and refreshed in
//! the background by the usage poller. Readers take consistent copies; the
//! poller is the only mutator.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::Client;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::constants::{
    ANTHROPIC_USAGE_URL, ANTHROPIC_VERSION, OAUTH_BETA_HEADER, USAGE_CACHE_TTL_MS, USER_AGENT,
};
use crate::error::ProxyError;

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// One account's usage as last seen at the vendor.
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    /// Utilization of the most restrictive window, 0.0–100.0+
    pub utilization_pct: Option<f64>,
    /// Which window is most restrictive ("five_hour", "seven_day", ...)
    pub most_restrictive_window: Option<String>,
    /// Full payload as returned by the vendor
    pub payload: Value,
    pub fetched_at: u64,
}

impl UsageSnapshot {
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.fetched_at) < USAGE_CACHE_TTL_MS
    }
}

#[derive(Default)]
pub struct UsageCache {
    entries: RwLock<HashMap<String, UsageSnapshot>>,
}

impl UsageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh snapshot for an account, or None when absent/stale.
    pub async fn get(&self, account_id: &str) -> Option<UsageSnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(account_id)
            .filter(|s| s.is_fresh(timestamp_millis()))
            .cloned()
    }

    pub async fn insert(&self, account_id: String, snapshot: UsageSnapshot) {
        self.entries.write().await.insert(account_id, snapshot);
    }

    pub async fn remove(&self, account_id: &str) {
        self.entries.write().await.remove(account_id);
    }
}

/// Fetch the vendor usage endpoint with an OAuth access token.
pub async fn fetch_account_usage(
    client: &Client,
    access_token: &str,
) -> Result<UsageSnapshot, ProxyError> {
    let response = client
        .get(ANTHROPIC_USAGE_URL)
        .header("authorization", format!("Bearer {access_token}"))
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-beta", OAUTH_BETA_HEADER)
        .header("content-type", "application/json")
        .header("user-agent", USER_AGENT)
        .header("accept", "application/json")
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ProxyError::UpstreamTransient(format!(
            "usage endpoint returned {}",
            response.status()
        )));
    }

    let payload: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::ParseError(format!("usage payload: {e}")))?;

    Ok(snapshot_from_payload(payload, timestamp_millis()))
}

/// Windows reported by the vendor usage payload, in display order.
const WINDOWS: &[&str] = &["five_hour", "seven_day", "seven_day_opus", "seven_day_sonnet"];

/// Reduce a usage payload to the most restrictive window.
pub fn snapshot_from_payload(payload: Value, fetched_at: u64) -> UsageSnapshot {
    let mut utilization_pct: Option<f64> = None;
    let mut most_restrictive_window: Option<String> = None;

    for window in WINDOWS {
        let Some(pct) = payload
            .get(window)
            .and_then(|w| w.get("utilization"))
            .and_then(|u| u.as_f64())
        else {
            continue;
        };
        if utilization_pct.is_none_or(|current| pct > current) {
            utilization_pct = Some(pct);
            most_restrictive_window = Some(window.to_string());
        }
    }

    UsageSnapshot {
        utilization_pct,
        most_restrictive_window,
        payload,
        fetched_at,
    }
}
