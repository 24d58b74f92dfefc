//! Client API key verification for the proxy surface.
//!
//! Keys are stored hashed; a presented key is hashed and compared in
//! constant time against every active row. Key management (create/revoke)
//! lives outside the core; only verification and last-used bookkeeping
//! happen here.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::db;
use crate::error::ProxyError;
use crate::writer::{DbWriter, WriteJob};

/// A successfully verified key, as much as the hot path needs.
#[derive(Debug, Clone)]
pub struct VerifiedKey {
    pub id: String,
    pub name: String,
}

/// SHA-256 of the full key, lowercase hex. Matches what the management
/// surface stores in `api_keys.hashed_key`.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct ClientKeysStore;

impl ClientKeysStore {
    pub fn new() -> Self {
        Self
    }

    /// Whether any active key exists. When none do the proxy surface is
    /// open (local single-user deployments).
    pub async fn any_active(&self) -> Result<bool, ProxyError> {
        let conn = db::get_conn().await?;
        let mut rows = conn
            .query("SELECT 1 FROM api_keys WHERE is_active = 1 LIMIT 1", ())
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to check api_keys: {e}")))?;
        Ok(rows.next().await.ok().flatten().is_some())
    }

    /// Verify a presented key against all active rows. Returns None on no
    /// match. Bumps last_used/usage_count through the writer on a match so
    /// verification itself never writes on the hot path.
    pub async fn verify(
        &self,
        presented: &str,
        writer: &DbWriter,
        now: u64,
    ) -> Result<Option<VerifiedKey>, ProxyError> {
        let presented_hash = hash_key(presented);

        let conn = db::get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, hashed_key FROM api_keys WHERE is_active = 1",
                (),
            )
            .await
            .map_err(|e| ProxyError::DatabaseError(format!("Failed to list api_keys: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let (Ok(id), Ok(name), Ok(hashed)) = (
                row.get::<String>(0),
                row.get::<String>(1),
                row.get::<String>(2),
            ) else {
                continue;
            };
            if constant_time_eq(&presented_hash, &hashed) {
                writer
                    .enqueue(WriteJob::TouchApiKey {
                        key_id: id.clone(),
                        now,
                    })
                    .await;
                return Ok(Some(VerifiedKey { id, name }));
            }
        }
        Ok(None)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_hex() {
        let h1 = hash_key("sk-test-abc123");
        let h2 = hash_key("sk-test-abc123");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_keys_hash_differently() {
        assert_ne!(hash_key("sk-a"), hash_key("sk-b"));
    }

    #[test]
    fn test_constant_time_eq() {
        let h = hash_key("sk-a");
        assert!(constant_time_eq(&h, &h.clone()));
        assert!(!constant_time_eq(&h, &hash_key("sk-b")));
        assert!(!constant_time_eq(&h, "short"));
    }
}
