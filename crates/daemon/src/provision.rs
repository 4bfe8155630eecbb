//! Key provisioning orchestration
//!
//! Turns an entitlement (a confirmed payment, or a direct admin grant) into a
//! registered gateway peer plus a stored key record, with compensating
//! rollback and a reconciliation sweep for the failure window between a
//! gateway ack and a durable record.
//!
//! The write protocol: a provisional `pending` row is inserted *before* the
//! gateway mutation, reserving both the payment (unique payment_id index) and
//! the address (unique live-address index). The row is finalized once the
//! gateway acks. A definite gateway rejection deletes the row; an ambiguous
//! transport failure leaves it for the sweep, because the peer may or may not
//! have been registered.

use chrono::Utc;
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;
use wirevend_common::{
    keygen, Database, Error, IssuedKey, KeyStatus, Payment, PaymentStatus, Result, VpnKey,
    SECS_PER_DAY,
};

use crate::allocator::IpPool;
use crate::config::DaemonConfig;
use crate::gateway::Gateway;
use crate::notify::Delivery;
use crate::render::{self, ClientConfigParams};

/// How an issue attempt ended.
///
/// `NeedsReconciliation` is the ambiguous case: the gateway may hold a peer
/// with no finalized record. The provisional row is left in place and the
/// reconciliation sweep resolves it either way.
#[derive(Debug)]
pub enum IssueOutcome {
    Committed(Box<VpnKey>),
    RolledBack(Error),
    NeedsReconciliation { key_name: String, error: Error },
}

/// What a reconciliation sweep did
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    pub orphan_peers_removed: usize,
    pub stuck_provisionals_cleared: usize,
}

pub struct Provisioner {
    db: Database,
    gateway: Arc<dyn Gateway>,
    delivery: Arc<dyn Delivery>,
    pool: IpPool,
    dns_servers: Vec<Ipv4Addr>,
    keepalive_secs: u16,
    provisional_timeout_secs: i64,
    // Single writer over the scan-allocate-register sequence: two concurrent
    // issues must never observe the same free address
    alloc_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        db: Database,
        gateway: Arc<dyn Gateway>,
        delivery: Arc<dyn Delivery>,
        config: &DaemonConfig,
    ) -> Result<Self> {
        let pool = IpPool::new(config.wireguard.pool_start, config.wireguard.pool_end)?;
        Ok(Self {
            db,
            gateway,
            delivery,
            pool,
            dns_servers: config.wireguard.dns_servers.clone(),
            keepalive_secs: config.wireguard.keepalive_secs,
            provisional_timeout_secs: config.reaper.provisional_timeout_secs as i64,
            alloc_lock: Mutex::new(()),
        })
    }

    /// Handle a payment-confirmed event. Idempotent against duplicate
    /// delivery: at most one key is ever issued per payment.
    pub async fn on_payment_confirmed(&self, payment: &Payment) -> IssueOutcome {
        if payment.status != PaymentStatus::Confirmed {
            return IssueOutcome::RolledBack(Error::InvalidStateTransition {
                from: payment.status.to_string(),
                to: "provisioned".to_string(),
            });
        }
        self.issue(payment.user_id, payment.days, Some(payment)).await
    }

    /// Issue a key for `days` of access, optionally funded by a payment.
    ///
    /// With a payment the operation is keyed on the payment's identity:
    /// calling again returns (or resumes) the one key that payment funds,
    /// never a second one. Without a payment this is a direct admin grant.
    pub async fn issue(&self, user_id: i64, days: u32, payment: Option<&Payment>) -> IssueOutcome {
        if let Some(payment) = payment {
            // Terminal non-confirmed payments never fund a key
            if matches!(
                payment.status,
                PaymentStatus::Rejected | PaymentStatus::Cancelled | PaymentStatus::Expired
            ) {
                return IssueOutcome::RolledBack(Error::InvalidStateTransition {
                    from: payment.status.to_string(),
                    to: "provisioned".to_string(),
                });
            }
            match self.db.key_for_payment(payment.id) {
                Ok(Some(existing)) => return self.resume(existing, payment).await,
                Ok(None) => {}
                Err(e) => return IssueOutcome::RolledBack(e),
            }
        }

        // Keypair generation and gateway identity are independent
        let (keypair, server_info) = match tokio::try_join!(
            async { keygen::generate() },
            self.gateway.read_server_info()
        ) {
            Ok(v) => v,
            Err(e) => return IssueOutcome::RolledBack(e),
        };

        let now = Utc::now().timestamp();
        let record = {
            let _guard = self.alloc_lock.lock().await;

            let mut used = match self.gateway.list_peer_addresses().await {
                Ok(used) => used,
                Err(e) => return IssueOutcome::RolledBack(e),
            };
            // Provisional records reserve addresses the gateway does not know
            // about yet
            match self.db.list_live_keys() {
                Ok(keys) => used.extend(keys.iter().map(|k| k.address)),
                Err(e) => return IssueOutcome::RolledBack(e),
            }

            let address = match self.pool.next_free(&used) {
                Ok(address) => address,
                // Nothing external changed; report immediately, retrying
                // cannot succeed without operator intervention
                Err(e) => return IssueOutcome::RolledBack(e),
            };

            let record = VpnKey {
                id: Uuid::new_v4(),
                name: key_name(user_id, now),
                user_id,
                private_key: keypair.private_key.clone(),
                public_key: keypair.public_key.clone(),
                address,
                server_public_key: server_info.public_key.clone(),
                server_endpoint: server_info.endpoint_host.clone(),
                server_port: server_info.listen_port,
                config_data: String::new(),
                days,
                created_at: now,
                expires_at: now + days as i64 * SECS_PER_DAY,
                status: KeyStatus::Pending,
                payment_id: payment.map(|p| p.id),
            };
            if let Err(e) = self.db.create_vpn_key(&record) {
                return IssueOutcome::RolledBack(e);
            }

            match self.register_and_finalize(&record, payment).await {
                Ok(key) => key,
                Err(outcome) => return outcome,
            }
        };

        self.deliver(&record).await;
        IssueOutcome::Committed(Box::new(record))
    }

    /// A key already exists for this payment: a duplicate confirmation event,
    /// or a retry after an earlier attempt died mid-flight.
    async fn resume(&self, existing: VpnKey, payment: &Payment) -> IssueOutcome {
        if existing.status == KeyStatus::Pending && existing.config_data.is_empty() {
            // Provisional row whose registration was never acknowledged.
            // add_peer is idempotent, so registering again is safe whether or
            // not the earlier mutation landed.
            info!("resuming provisional key {}", existing.name);
            let key = {
                let _guard = self.alloc_lock.lock().await;
                match self.register_and_finalize(&existing, Some(payment)).await {
                    Ok(key) => key,
                    Err(outcome) => return outcome,
                }
            };
            self.deliver(&key).await;
            return IssueOutcome::Committed(Box::new(key));
        }

        if existing.status == KeyStatus::Pending && payment.status == PaymentStatus::Confirmed {
            // Pre-authorized key whose payment just got confirmed
            if let Err(e) = self.db.set_key_status(existing.id, KeyStatus::Active) {
                return IssueOutcome::RolledBack(e);
            }
            let key = VpnKey {
                status: KeyStatus::Active,
                ..existing
            };
            info!("activated pre-authorized key {}", key.name);
            self.deliver(&key).await;
            return IssueOutcome::Committed(Box::new(key));
        }

        IssueOutcome::Committed(Box::new(existing))
    }

    /// Register the peer and finalize the record. On a definite rejection the
    /// provisional row is rolled back; on anything ambiguous the row is left
    /// for the sweep.
    async fn register_and_finalize(
        &self,
        record: &VpnKey,
        payment: Option<&Payment>,
    ) -> std::result::Result<VpnKey, IssueOutcome> {
        match self.gateway.add_peer(&record.public_key, record.address).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                // The mutation may have landed on the gateway before the
                // transport died; only the sweep can tell
                warn!("ambiguous gateway failure for {}: {}", record.name, e);
                return Err(IssueOutcome::NeedsReconciliation {
                    key_name: record.name.clone(),
                    error: e,
                });
            }
            Err(e) => {
                error!("gateway rejected peer {}: {}", record.name, e);
                if let Err(del) = self.db.delete_provisional_key(record.id) {
                    return Err(IssueOutcome::NeedsReconciliation {
                        key_name: record.name.clone(),
                        error: del,
                    });
                }
                return Err(IssueOutcome::RolledBack(e));
            }
        }

        // Peer acked: from here on, failures strand gateway state and must
        // surface as reconciliation work, never silently
        let config = match render::client_config(&ClientConfigParams {
            private_key: &record.private_key,
            address: record.address,
            dns_servers: &self.dns_servers,
            server_public_key: &record.server_public_key,
            endpoint_host: &record.server_endpoint,
            listen_port: record.server_port,
            keepalive_secs: self.keepalive_secs,
        }) {
            Ok(config) => config,
            Err(e) => {
                return Err(IssueOutcome::NeedsReconciliation {
                    key_name: record.name.clone(),
                    error: e,
                })
            }
        };

        let status = match payment {
            // Pre-authorization: the peer is registered but the key only
            // becomes active when the payment is confirmed
            Some(p) if p.status != PaymentStatus::Confirmed => KeyStatus::Pending,
            _ => KeyStatus::Active,
        };
        if let Err(e) = self.db.finalize_vpn_key(record.id, &config, status) {
            return Err(IssueOutcome::NeedsReconciliation {
                key_name: record.name.clone(),
                error: e,
            });
        }

        info!("issued key {} at {} ({} days)", record.name, record.address, record.days);
        Ok(VpnKey {
            config_data: config,
            status,
            ..record.clone()
        })
    }

    async fn deliver(&self, key: &VpnKey) {
        if key.status != KeyStatus::Active {
            return;
        }
        let issued = IssuedKey {
            name: key.name.clone(),
            address: key.address,
            expires_at: key.expires_at,
            config: key.config_data.clone(),
        };
        // Provisioning never depends on delivery succeeding
        if let Err(e) = self.delivery.deliver(key.user_id, &issued).await {
            warn!("delivery of key {} failed: {}", key.name, e);
        }
    }

    /// Revoke a key: remove the peer from the gateway, then mark the record.
    /// Ordering matters: if marking fails the peer is already gone, and the
    /// next reaper cycle retries the (idempotent) removal and the mark.
    pub async fn revoke(&self, key: &VpnKey) -> Result<VpnKey> {
        if key.status == KeyStatus::Revoked {
            return Ok(key.clone());
        }
        self.gateway.remove_peer(&key.public_key).await?;
        self.db.set_key_status(key.id, KeyStatus::Revoked)?;
        info!("revoked key {} ({})", key.name, key.address);
        Ok(VpnKey {
            status: KeyStatus::Revoked,
            ..key.clone()
        })
    }

    pub async fn revoke_by_name(&self, name: &str) -> Result<VpnKey> {
        let key = self
            .db
            .get_vpn_key_by_name(name)?
            .ok_or_else(|| Error::NotFound {
                kind: "vpn_key".to_string(),
                id: name.to_string(),
            })?;
        self.revoke(&key).await
    }

    /// Converge gateway and storage: remove peers in the managed range with
    /// no live record, and clear provisional rows stranded past the timeout.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = Utc::now().timestamp();
        let mut report = ReconcileReport::default();

        let peers = self.gateway.list_peers().await?;
        let live = self.db.list_live_keys()?;

        for peer in &peers {
            let Some(address) = peer.address else {
                continue;
            };
            // Peers outside the managed range belong to someone else
            if !self.pool.contains(address) {
                continue;
            }
            if live.iter().any(|k| k.public_key == peer.public_key) {
                continue;
            }
            warn!("removing orphan peer at {} (no matching record)", address);
            match self.gateway.remove_peer(&peer.public_key).await {
                Ok(()) => report.orphan_peers_removed += 1,
                Err(e) => warn!("failed to remove orphan peer at {}: {}", address, e),
            }
        }

        let cutoff = now - self.provisional_timeout_secs;
        for key in self.db.list_stuck_pending(cutoff)? {
            // The peer may or may not have made it onto the gateway; removal
            // is idempotent either way
            if let Err(e) = self.gateway.remove_peer(&key.public_key).await {
                warn!("failed to clear stuck provisional {}: {}", key.name, e);
                continue;
            }
            self.db.delete_provisional_key(key.id)?;
            info!("cleared stuck provisional key {}", key.name);
            report.stuck_provisionals_cleared += 1;
        }

        Ok(report)
    }
}

/// user{id}_{timestamp}_{suffix}, unique per issue attempt
fn key_name(user_id: i64, now: i64) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("user{}_{}_{}", user_id, now, suffix)
}
