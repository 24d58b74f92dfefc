//! Session-affinity account selection.
//!
//! A pure function over an account snapshot: no locks, no I/O. In-session
//! accounts come first so a caller keeps hitting the same account within
//! its affinity window; within each partition higher priority wins and
//! least-recently-used breaks ties.

use super::{Account, AccountState};

/// Ordered candidate list for one request. Possibly empty.
pub fn select_candidates(
    accounts: &[Account],
    now: u64,
    session_duration_ms: u64,
) -> Vec<Account> {
    let mut in_session: Vec<&Account> = Vec::new();
    let mut fresh: Vec<&Account> = Vec::new();

    for account in accounts {
        if account.state(now) != AccountState::Active {
            continue;
        }
        if account.in_session(now, session_duration_ms) {
            in_session.push(account);
        } else {
            fresh.push(account);
        }
    }

    let order = |a: &&Account, b: &&Account| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.last_used.unwrap_or(0).cmp(&b.last_used.unwrap_or(0)))
    };
    in_session.sort_by(order);
    fresh.sort_by(order);

    in_session
        .into_iter()
        .chain(fresh)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::test_account;
    use crate::providers::Provider;

    const HOUR_MS: u64 = 60 * 60 * 1000;
    const SESSION_MS: u64 = 5 * HOUR_MS;

    #[test]
    fn test_empty_input_yields_no_candidates() {
        assert!(select_candidates(&[], 0, SESSION_MS).is_empty());
    }

    #[test]
    fn test_paused_and_rate_limited_excluded() {
        let now = 10 * HOUR_MS;
        let mut paused = test_account("paused", Provider::AnthropicOauth);
        paused.paused = true;
        let mut limited = test_account("limited", Provider::AnthropicOauth);
        limited.rate_limited_until = Some(now + 1000);
        let mut invalid = test_account("invalid", Provider::AnthropicOauth);
        invalid.token_invalid = true;
        let ok = test_account("ok", Provider::AnthropicOauth);

        let candidates =
            select_candidates(&[paused, limited, invalid, ok], now, SESSION_MS);
        let names: Vec<&str> = candidates.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    #[test]
    fn test_expired_rate_limit_is_selectable_again() {
        let now = 10 * HOUR_MS;
        let mut account = test_account("a", Provider::AnthropicOauth);
        account.rate_limited_until = Some(now - 1);
        assert_eq!(select_candidates(&[account], now, SESSION_MS).len(), 1);
    }

    #[test]
    fn test_in_session_accounts_come_first() {
        let now = 10 * HOUR_MS;
        let mut in_session = test_account("in-session", Provider::AnthropicOauth);
        in_session.session_start = Some(now - HOUR_MS);
        let mut fresh = test_account("fresh", Provider::AnthropicOauth);
        // Higher priority, but a fresh account never outranks an in-session one
        fresh.priority = 100;

        let candidates = select_candidates(&[fresh, in_session], now, SESSION_MS);
        let names: Vec<&str> = candidates.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["in-session", "fresh"]);
    }

    #[test]
    fn test_stale_session_counts_as_fresh() {
        let now = 10 * HOUR_MS;
        let mut stale = test_account("stale", Provider::AnthropicOauth);
        stale.session_start = Some(now - SESSION_MS - 1);
        stale.priority = 0;
        let mut fresh = test_account("fresh", Provider::AnthropicOauth);
        fresh.priority = 1;

        let candidates = select_candidates(&[stale, fresh], now, SESSION_MS);
        let names: Vec<&str> = candidates.iter().map(|a| a.name.as_str()).collect();
        // Both are fresh, so priority decides
        assert_eq!(names, vec!["fresh", "stale"]);
    }

    #[test]
    fn test_priority_then_lru_ordering() {
        let now = 10 * HOUR_MS;
        let mut high = test_account("high", Provider::AnthropicOauth);
        high.priority = 10;
        high.last_used = Some(now - 100);
        let mut low_old = test_account("low-old", Provider::AnthropicOauth);
        low_old.priority = 1;
        low_old.last_used = Some(now - 5000);
        let mut low_recent = test_account("low-recent", Provider::AnthropicOauth);
        low_recent.priority = 1;
        low_recent.last_used = Some(now - 10);

        let candidates = select_candidates(&[low_recent, low_old, high], now, SESSION_MS);
        let names: Vec<&str> = candidates.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low-old", "low-recent"]);
    }

    #[test]
    fn test_never_used_sorts_before_used() {
        let now = 10 * HOUR_MS;
        let never = test_account("never", Provider::AnthropicOauth);
        let mut used = test_account("used", Provider::AnthropicOauth);
        used.last_used = Some(now - 1);

        let candidates = select_candidates(&[used, never], now, SESSION_MS);
        assert_eq!(candidates[0].name, "never");
    }
}
