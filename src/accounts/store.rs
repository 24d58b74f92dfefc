//! Read-side access to the accounts table.
//!
//! Hot-path readers take whole-table snapshots; every mutation is a writer
//! job. Direct SQL updates from request handling are forbidden.

use std::collections::HashMap;

use turso::Row;

use super::Account;
use crate::db;
use crate::error::ProxyError;
use crate::providers::Provider;

const ACCOUNT_COLUMNS: &str = "id, name, provider, api_key, refresh_token, access_token, \
     expires_at, priority, paused, token_invalid, rate_limited_until, rate_limit_status, \
     rate_limit_remaining, rate_limit_reset, session_start, session_request_count, \
     request_count, total_requests, last_used, auto_refresh_enabled, auto_fallback_enabled, \
     custom_endpoint, model_mappings, created_at";

pub struct AccountStore;

impl AccountStore {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot of every account row.
    pub async fn get_all(&self) -> Result<Vec<Account>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts"), ())
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to list accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Some(account) = row_to_account(&row) {
                accounts.push(account);
            }
        }
        Ok(accounts)
    }

    /// Re-read one account, e.g. after a write acknowledgement.
    pub async fn get(&self, id: &str) -> Result<Option<Account>, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to read account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row_to_account(&row)),
            _ => Ok(None),
        }
    }
}

fn get_opt_u64(row: &Row, idx: usize) -> Option<u64> {
    row.get::<Option<i64>>(idx).ok().flatten().map(|v| v as u64)
}

fn get_u64(row: &Row, idx: usize) -> u64 {
    get_opt_u64(row, idx).unwrap_or(0)
}

fn get_bool(row: &Row, idx: usize) -> bool {
    row.get::<i64>(idx).unwrap_or(0) != 0
}

fn get_opt_string(row: &Row, idx: usize) -> Option<String> {
    row.get::<Option<String>>(idx)
        .ok()
        .flatten()
        .filter(|s| !s.is_empty())
}

/// Map one accounts row. Rows with an unknown provider tag are skipped (and
/// therefore never selected) rather than failing the whole snapshot.
fn row_to_account(row: &Row) -> Option<Account> {
    let id: String = row.get(0).ok()?;
    let name: String = row.get(1).ok()?;
    let provider_tag: String = row.get(2).ok()?;
    let provider = Provider::parse(&provider_tag)?;

    let model_mappings: Option<HashMap<String, String>> = get_opt_string(row, 22)
        .and_then(|json| serde_json::from_str(&json).ok());

    Some(Account {
        id,
        name,
        provider,
        api_key: get_opt_string(row, 3),
        refresh_token: get_opt_string(row, 4),
        access_token: get_opt_string(row, 5),
        expires_at: get_opt_u64(row, 6),
        priority: row.get::<i64>(7).unwrap_or(0),
        paused: get_bool(row, 8),
        token_invalid: get_bool(row, 9),
        rate_limited_until: get_opt_u64(row, 10),
        rate_limit_status: get_opt_string(row, 11),
        rate_limit_remaining: row.get::<Option<i64>>(12).ok().flatten(),
        rate_limit_reset: get_opt_u64(row, 13),
        session_start: get_opt_u64(row, 14),
        session_request_count: get_u64(row, 15),
        request_count: get_u64(row, 16),
        total_requests: get_u64(row, 17),
        last_used: get_opt_u64(row, 18),
        auto_refresh_enabled: get_bool(row, 19),
        auto_fallback_enabled: get_bool(row, 20),
        custom_endpoint: get_opt_string(row, 21),
        model_mappings,
        created_at: get_u64(row, 23),
    })
}
