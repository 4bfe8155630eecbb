//! Delivery collaborator boundary
//!
//! Whatever delivers issued keys to purchasers (a chat bot, mail, a portal)
//! lives behind this trait. Provisioning never depends on delivery
//! succeeding: a committed key with a failed delivery is still committed.

use async_trait::async_trait;
use tracing::info;
use wirevend_common::{IssuedKey, Result};

/// Delivers an issued key to its purchaser
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, user_id: i64, key: &IssuedKey) -> Result<()>;
}

/// Log-only delivery, used when no real channel is wired up.
/// Logs the key name and address, never the config or key material.
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, user_id: i64, key: &IssuedKey) -> Result<()> {
        info!(
            "key {} ({}) ready for user {}, expires at {}",
            key.name, key.address, user_id, key.expires_at
        );
        Ok(())
    }
}
