//! Expiry reaper
//!
//! One long-lived loop that revokes expired keys and expires stale unpaid
//! payments. Each cycle scans storage, revokes per key with failures
//! isolated (a key that will not revoke is logged and retried next cycle,
//! never allowed to block the batch), and sleeps. A failed scan drops the
//! loop into a short backoff instead of crashing it. Cancellation is
//! observed between cycles and between keys; an in-flight revoke always
//! finishes.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wirevend_common::{Database, Result};

use crate::config::ReaperConfig;
use crate::provision::Provisioner;

pub struct Reaper {
    db: Database,
    provisioner: Arc<Provisioner>,
    cycle: Duration,
    backoff: Duration,
}

/// What one cycle accomplished
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub keys_revoked: usize,
    pub keys_failed: usize,
    pub payments_expired: usize,
}

impl Reaper {
    pub fn new(db: Database, provisioner: Arc<Provisioner>, config: &ReaperConfig) -> Self {
        Self {
            db,
            provisioner,
            cycle: Duration::from_secs(config.cycle_secs),
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }

    /// Run until cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!("expiry reaper started");

        loop {
            let sleep_for = match self.cycle_once(&token).await {
                Ok(stats) => {
                    if stats.keys_revoked + stats.keys_failed + stats.payments_expired > 0 {
                        info!(
                            "reap cycle: {} revoked, {} failed, {} payments expired",
                            stats.keys_revoked, stats.keys_failed, stats.payments_expired
                        );
                    } else {
                        debug!("reap cycle: nothing to do");
                    }
                    self.cycle
                }
                Err(e) => {
                    error!("reap cycle failed, backing off: {}", e);
                    self.backoff
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!("expiry reaper stopped");
    }

    /// One scan-and-revoke pass. Storage errors propagate (the caller backs
    /// off); per-key revocation errors do not.
    pub async fn cycle_once(&self, token: &CancellationToken) -> Result<CycleStats> {
        let now = Utc::now().timestamp();
        let mut stats = CycleStats {
            payments_expired: self.db.expire_stale_payments(now)?,
            ..Default::default()
        };

        let expired = self.db.list_expired_active(now)?;
        if expired.is_empty() {
            return Ok(stats);
        }
        info!("found {} expired active keys", expired.len());

        for key in expired {
            // Stop between keys, never mid-revoke
            if token.is_cancelled() {
                break;
            }
            match self.provisioner.revoke(&key).await {
                Ok(_) => stats.keys_revoked += 1,
                Err(e) => {
                    // Retried next cycle; the scan will find the key again
                    warn!("failed to revoke expired key {}: {}", key.name, e);
                    stats.keys_failed += 1;
                }
            }
        }

        Ok(stats)
    }
}
