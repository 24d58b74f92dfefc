mod client_keys;
mod oauth;

pub use client_keys::{ClientKeysStore, VerifiedKey};
pub use oauth::RefreshManager;
pub(crate) use oauth::now_ms;
