//! Account model and lifecycle.
//!
//! An account is one credential holder bound to one provider. The proxy
//! load-balances across accounts; all mutation goes through the async
//! writer, so everything here is snapshot-shaped.

mod selector;
mod store;

pub use selector::select_candidates;
pub use store::AccountStore;

use std::collections::HashMap;

use crate::constants::TOKEN_EXPIRY_SKEW_MS;
use crate::providers::Provider;

/// Lifecycle state derived from the row at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Active,
    RateLimited,
    Paused,
    TokenInvalid,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub api_key: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    /// Absolute access-token expiry, epoch ms
    pub expires_at: Option<u64>,
    pub priority: i64,
    pub paused: bool,
    pub token_invalid: bool,
    pub rate_limited_until: Option<u64>,
    pub rate_limit_status: Option<String>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_reset: Option<u64>,
    pub session_start: Option<u64>,
    pub session_request_count: u64,
    pub request_count: u64,
    pub total_requests: u64,
    pub last_used: Option<u64>,
    pub auto_refresh_enabled: bool,
    pub auto_fallback_enabled: bool,
    pub custom_endpoint: Option<String>,
    /// requested model → upstream model id (OpenAI-compatible providers)
    pub model_mappings: Option<HashMap<String, String>>,
    pub created_at: u64,
}

impl Account {
    /// The access token is valid only while expires_at - skew > now.
    pub fn has_valid_access_token(&self, now: u64) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires)) => {
                !token.is_empty() && expires > now + TOKEN_EXPIRY_SKEW_MS
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self, now: u64) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    /// Whether the affinity session that started at `session_start` is still
    /// inside the window.
    pub fn in_session(&self, now: u64, session_duration_ms: u64) -> bool {
        self.session_start
            .is_some_and(|start| start <= now && now - start <= session_duration_ms)
    }

    /// Derived lifecycle state. Pause dominates, then token validity, then
    /// the rate-limit lock (which expires implicitly by time).
    pub fn state(&self, now: u64) -> AccountState {
        if self.paused {
            AccountState::Paused
        } else if self.token_invalid || !self.has_credentials() {
            AccountState::TokenInvalid
        } else if self.is_rate_limited(now) {
            AccountState::RateLimited
        } else {
            AccountState::Active
        }
    }

    /// Initial-insert rule: an account without usable credentials starts
    /// TOKEN_INVALID.
    pub fn has_credentials(&self) -> bool {
        if self.provider.supports_oauth() {
            self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
        } else {
            self.api_key.as_deref().is_some_and(|k| !k.is_empty())
        }
    }

    /// Endpoint base for upstream requests: custom_endpoint wins, else the
    /// provider default. None only for misconfigured custom-endpoint providers.
    pub fn endpoint(&self) -> Option<&str> {
        self.custom_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
            .or_else(|| self.provider.default_endpoint())
    }

    /// Apply this account's model mapping to a requested model id.
    pub fn map_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mappings
            .as_ref()
            .and_then(|m| m.get(requested))
            .map(String::as_str)
            .unwrap_or(requested)
    }

    /// Whether this account's provider can serve the given model id. Accounts
    /// with explicit mappings serve exactly the mapped ids; Anthropic-protocol
    /// accounts serve any claude model.
    pub fn serves_model(&self, model: &str) -> bool {
        if let Some(mappings) = &self.model_mappings {
            return mappings.contains_key(model);
        }
        match self.provider {
            Provider::AnthropicOauth | Provider::ClaudeConsole => model.starts_with("claude-"),
            _ => true,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_account(id: &str, provider: Provider) -> Account {
    Account {
        id: id.to_string(),
        name: id.to_string(),
        provider,
        api_key: Some("sk-test".to_string()),
        refresh_token: Some("rt-test".to_string()),
        access_token: None,
        expires_at: None,
        priority: 0,
        paused: false,
        token_invalid: false,
        rate_limited_until: None,
        rate_limit_status: None,
        rate_limit_remaining: None,
        rate_limit_reset: None,
        session_start: None,
        session_request_count: 0,
        request_count: 0,
        total_requests: 0,
        last_used: None,
        auto_refresh_enabled: true,
        auto_fallback_enabled: true,
        custom_endpoint: None,
        model_mappings: None,
        created_at: 0,
    }
}
