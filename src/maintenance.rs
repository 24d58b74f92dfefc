//! One-shot startup maintenance.
//!
//! Retention cleanup runs before the listener opens: audit rows and payload
//! rows past their windows are deleted, workspaces unseen for a week are
//! pruned, and storage is compacted. Safe to run any number of times.

use tracing::info;

use crate::config::Config;
use crate::constants::WORKSPACE_RETENTION_MS;
use crate::db;
use crate::error::ProxyError;
use crate::usage_cache::timestamp_millis;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

pub async fn run_startup_maintenance(config: &Config) -> Result<(), ProxyError> {
    let conn = db::get_conn().await?;
    let now = timestamp_millis();

    // Payloads have the shorter retention window
    let payload_cutoff = now.saturating_sub(config.data_retention_days as u64 * DAY_MS);
    let payloads_deleted = conn
        .execute(
            "DELETE FROM request_payloads WHERE request_id IN \
             (SELECT id FROM requests WHERE timestamp < ?)",
            (payload_cutoff as i64,),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Payload cleanup failed: {e}")))?;

    let request_cutoff = now.saturating_sub(config.request_retention_days as u64 * DAY_MS);
    let requests_deleted = conn
        .execute(
            "DELETE FROM requests WHERE timestamp < ?",
            (request_cutoff as i64,),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Request cleanup failed: {e}")))?;

    let workspace_cutoff = now.saturating_sub(WORKSPACE_RETENTION_MS);
    let workspaces_deleted = conn
        .execute(
            "DELETE FROM workspaces WHERE last_seen < ?",
            (workspace_cutoff as i64,),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("Workspace prune failed: {e}")))?;

    let sessions_deleted = conn
        .execute(
            "DELETE FROM oauth_sessions WHERE expires_at < ?",
            (now as i64,),
        )
        .await
        .map_err(|e| ProxyError::DatabaseError(format!("OAuth session cleanup failed: {e}")))?;

    // Reclaim the space the deletes left behind; compaction is best-effort
    if let Err(e) = conn.execute("VACUUM", ()).await {
        tracing::warn!("Vacuum failed (continuing): {e}");
    }

    info!(
        "Startup maintenance: removed {requests_deleted} request(s), {payloads_deleted} payload(s), \
         {workspaces_deleted} workspace(s), {sessions_deleted} oauth session(s)"
    );
    Ok(())
}
