//! OAuth token lifecycle.
//!
//! `get_valid_access_token` returns a usable credential for any account.
//! For OAuth accounts an expired token triggers a refresh against the vendor
//! token endpoint; concurrent callers for the same account coalesce onto one
//! in-flight refresh through a pending-future map. The lock covers map
//! lookup+insert only, never the network call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::Client;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::accounts::Account;
use crate::constants::{ANTHROPIC_TOKEN_URL, TOKEN_ENDPOINT_TIMEOUT};
use crate::error::{ProxyError, RefreshFailure};
use crate::writer::{DbWriter, WriteJob};

/// Retries against a rate-limited token endpoint, with doubling delay.
const TOKEN_RETRY_ATTEMPTS: u32 = 3;
const TOKEN_RETRY_BASE_DELAY_MS: u64 = 1000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Present when the vendor rotates the refresh token; must replace the
    /// stored one atomically with the access token.
    refresh_token: Option<String>,
    expires_in: u64,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

pub struct RefreshManager {
    client: Client,
    client_id: String,
    writer: DbWriter,
    pending: Arc<Mutex<HashMap<String, SharedRefresh>>>,
}

impl RefreshManager {
    pub fn new(client: Client, client_id: String, writer: DbWriter) -> Self {
        Self {
            client,
            client_id,
            writer,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return a credential usable right now for this account.
    ///
    /// API-key providers return the stored key unchanged; expiry bookkeeping
    /// is skipped. OAuth providers return the cached access token while it is
    /// inside the expiry skew, else refresh (coalesced per account).
    pub async fn get_valid_access_token(&self, account: &Account) -> Result<String, ProxyError> {
        if !account.provider.supports_oauth() {
            return account
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ProxyError::AccountNotRefreshable(account.name.clone()));
        }

        if account.has_valid_access_token(now_ms()) {
            if let Some(token) = &account.access_token {
                return Ok(token.clone());
            }
        }

        self.refresh(account).await
    }

    /// Refresh this account's access token, joining any in-flight refresh for
    /// the same account id. Errors propagate to every joined caller; the
    /// pending entry is removed before propagation so the next call retries.
    pub async fn refresh(&self, account: &Account) -> Result<String, ProxyError> {
        let refresh_token = account
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProxyError::AccountNotRefreshable(account.name.clone()))?;

        let shared = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if let Some(in_flight) = pending.get(&account.id) {
                in_flight.clone()
            } else {
                let fut = perform_refresh(
                    self.client.clone(),
                    self.client_id.clone(),
                    self.writer.clone(),
                    Arc::clone(&self.pending),
                    account.id.clone(),
                    account.name.clone(),
                    refresh_token,
                )
                .boxed()
                .shared();
                pending.insert(account.id.clone(), fut.clone());
                fut
            }
        };

        shared.await.map_err(ProxyError::RefreshFailed)
    }

    /// Number of refreshes currently in flight (all accounts).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }
}

/// The single in-flight refresh for one account. Removes its own
/// pending-map entry before returning so failures are retryable.
async fn perform_refresh(
    client: Client,
    client_id: String,
    writer: DbWriter,
    pending: Arc<Mutex<HashMap<String, SharedRefresh>>>,
    account_id: String,
    account_name: String,
    refresh_token: String,
) -> Result<String, RefreshFailure> {
    let result = do_refresh(
        &client,
        &client_id,
        &writer,
        &account_id,
        &account_name,
        &refresh_token,
    )
    .await;

    pending
        .lock()
        .expect("pending map poisoned")
        .remove(&account_id);

    result
}

async fn do_refresh(
    client: &Client,
    client_id: &str,
    writer: &DbWriter,
    account_id: &str,
    account_name: &str,
    refresh_token: &str,
) -> Result<String, RefreshFailure> {
    // Read through the writer's committed view first: a refresh may have
    // landed between the caller's snapshot and joining the single-flight.
    if let Ok(Some(fresh)) = crate::accounts::AccountStore::new().get(account_id).await
        && fresh.has_valid_access_token(now_ms())
        && let Some(token) = fresh.access_token
    {
        return Ok(token);
    }

    match refresh_with_retries(client, client_id, refresh_token).await {
        Ok(token) => {
            let now = now_ms();
            let expires_at = now + token.expires_in * 1000;
            let rotated = token.refresh_token.is_some();
            // Write-through: await the commit so a subsequent read of this
            // account observes the new tokens. A rotated refresh token that
            // fails to persist is unrecoverable: the old one is already dead.
            let ack = writer
                .enqueue_acked(WriteJob::UpdateAccountTokens {
                    account_id: account_id.to_string(),
                    access_token: token.access_token.clone(),
                    refresh_token: token.refresh_token.clone(),
                    expires_at,
                })
                .await;
            match ack {
                Some(rx) => {
                    if rx.await.is_err() && rotated {
                        error!(
                            "Failed to persist rotated refresh token for account {account_name}; re-authentication will be required"
                        );
                    }
                }
                None if rotated => {
                    error!(
                        "Writer unavailable while persisting rotated refresh token for account {account_name}"
                    );
                }
                None => {}
            }
            info!("Refreshed access token for account {account_name}");
            Ok(token.access_token)
        }
        Err(RefreshFailure::InvalidGrant) => {
            warn!("Refresh token for account {account_name} is revoked; marking token invalid");
            writer
                .enqueue(WriteJob::MarkTokenInvalid {
                    account_id: account_id.to_string(),
                })
                .await;
            Err(RefreshFailure::InvalidGrant)
        }
        Err(e) => {
            warn!("Token refresh failed for account {account_name}: {e}");
            Err(e)
        }
    }
}

/// One token-endpoint exchange, retried with doubling backoff only when the
/// endpoint itself rate-limits us.
async fn refresh_with_retries(
    client: &Client,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse, RefreshFailure> {
    let mut attempt = 0;
    loop {
        match token_exchange(client, client_id, refresh_token).await {
            Err(RefreshFailure::RateLimited(msg)) if attempt + 1 < TOKEN_RETRY_ATTEMPTS => {
                let delay = TOKEN_RETRY_BASE_DELAY_MS << attempt;
                warn!("Token endpoint rate limited ({msg}); retrying in {delay}ms");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn token_exchange(
    client: &Client,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse, RefreshFailure> {
    let body = serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
        "client_id": client_id,
    });

    let response = client
        .post(ANTHROPIC_TOKEN_URL)
        .header("Content-Type", "application/json")
        .timeout(TOKEN_ENDPOINT_TIMEOUT)
        .json(&body)
        .send()
        .await
        .map_err(|e| RefreshFailure::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_token_failure(status.as_u16(), &text));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| RefreshFailure::BadResponse(e.to_string()))
}

/// Map a non-2xx token-endpoint response onto the failure taxonomy.
fn classify_token_failure(status: u16, body: &str) -> RefreshFailure {
    if body.contains("invalid_grant") {
        return RefreshFailure::InvalidGrant;
    }
    if status == 429 {
        return RefreshFailure::RateLimited(format!("status {status}"));
    }
    RefreshFailure::BadResponse(format!("status {status}: {}", truncate(body, 200)))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_invalid_grant() {
        let failure = classify_token_failure(400, r#"{"error":"invalid_grant"}"#);
        assert_eq!(failure, RefreshFailure::InvalidGrant);
    }

    #[test]
    fn test_classify_rate_limited() {
        let failure = classify_token_failure(429, "slow down");
        assert!(matches!(failure, RefreshFailure::RateLimited(_)));
    }

    #[test]
    fn test_classify_other_is_bad_response() {
        let failure = classify_token_failure(500, "oops");
        assert!(matches!(failure, RefreshFailure::BadResponse(_)));
    }

    #[test]
    fn test_token_response_optional_rotation() {
        let with: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r2","expires_in":3600}"#,
        )
        .unwrap();
        assert_eq!(with.refresh_token.as_deref(), Some("r2"));

        let without: TokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3600}"#).unwrap();
        assert!(without.refresh_token.is_none());
        assert_eq!(without.expires_in, 3600);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }

    use crate::accounts::test_account;
    use crate::providers::Provider;

    fn test_manager() -> RefreshManager {
        let (writer, _rx) = crate::writer::test_writer(4);
        RefreshManager::new(Client::new(), "client-id".to_string(), writer)
    }

    #[tokio::test]
    async fn test_api_key_provider_returns_stored_key() {
        let manager = test_manager();
        let account = test_account("zai-1", Provider::Zai);
        let token = manager.get_valid_access_token(&account).await.unwrap();
        assert_eq!(token, "sk-test");
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_api_key_provider_without_key_fails() {
        let manager = test_manager();
        let mut account = test_account("zai-1", Provider::Zai);
        account.api_key = None;
        let err = manager.get_valid_access_token(&account).await.unwrap_err();
        assert!(matches!(err, ProxyError::AccountNotRefreshable(_)));
    }

    #[tokio::test]
    async fn test_valid_cached_token_skips_refresh() {
        let manager = test_manager();
        let mut account = test_account("oauth-1", Provider::AnthropicOauth);
        account.access_token = Some("cached".to_string());
        account.expires_at = Some(now_ms() + 10 * 60_000);
        let token = manager.get_valid_access_token(&account).await.unwrap();
        assert_eq!(token, "cached");
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_join_one_refresh() {
        let manager = test_manager();
        let account = test_account("oauth-1", Provider::AnthropicOauth);

        // Stand in for an in-flight token-endpoint exchange
        let in_flight = async { Ok::<String, RefreshFailure>("tok-joined".to_string()) }
            .boxed()
            .shared();
        manager
            .pending
            .lock()
            .unwrap()
            .insert(account.id.clone(), in_flight);
        assert_eq!(manager.pending_count(), 1);

        let (a, b) = tokio::join!(manager.refresh(&account), manager.refresh(&account));
        assert_eq!(a.unwrap(), "tok-joined");
        assert_eq!(b.unwrap(), "tok-joined");
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_not_refreshable() {
        let manager = test_manager();
        let mut account = test_account("oauth-1", Provider::AnthropicOauth);
        account.refresh_token = None;
        let err = manager.refresh(&account).await.unwrap_err();
        assert!(matches!(err, ProxyError::AccountNotRefreshable(_)));
    }
}
