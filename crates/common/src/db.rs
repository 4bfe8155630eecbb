//! SQLite state store for wirevend
//!
//! The database is the system of record for payment and key metadata; the
//! gateway's peer table is the authority for who can actually connect. The
//! two are kept convergent by the provisioner's reconciliation sweep.

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Payments table
            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                reference TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                method TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                days INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                paid_at INTEGER,
                confirmed_at INTEGER,
                proof_ref TEXT,
                admin_comment TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_payments_user ON payments(user_id);
            CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status, expires_at);

            -- VPN keys table
            CREATE TABLE IF NOT EXISTS vpn_keys (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                user_id INTEGER NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                address TEXT NOT NULL,
                server_public_key TEXT NOT NULL,
                server_endpoint TEXT NOT NULL,
                server_port INTEGER NOT NULL,
                config_data TEXT NOT NULL DEFAULT '',
                days INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payment_id TEXT REFERENCES payments(id)
            );
            -- One key per funding payment
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vpn_keys_payment
                ON vpn_keys(payment_id) WHERE payment_id IS NOT NULL;
            -- Storage-level reservation: no two live keys may hold one address
            CREATE UNIQUE INDEX IF NOT EXISTS idx_vpn_keys_address_live
                ON vpn_keys(address) WHERE status IN ('pending', 'active');
            CREATE INDEX IF NOT EXISTS idx_vpn_keys_user ON vpn_keys(user_id);
            CREATE INDEX IF NOT EXISTS idx_vpn_keys_expiry ON vpn_keys(status, expires_at);
            "#,
        )?;

        Ok(())
    }

    // ========================================================================
    // Payment operations
    // ========================================================================

    pub fn create_payment(&self, payment: &Payment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO payments (id, reference, user_id, amount, method, details, days, status,
                                   created_at, expires_at, paid_at, confirmed_at, proof_ref, admin_comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                payment.id.to_string(),
                payment.reference,
                payment.user_id,
                payment.amount,
                payment.method.to_string(),
                payment.details.to_string(),
                payment.days,
                payment.status.to_string(),
                payment.created_at,
                payment.expires_at,
                payment.paid_at,
                payment.confirmed_at,
                payment.proof_ref,
                payment.admin_comment,
            ],
        )?;
        Ok(())
    }

    pub fn get_payment(&self, id: Uuid) -> Result<Option<Payment>> {
        let conn = self.conn.lock();
        Self::payment_by_id(&conn, id)
    }

    pub fn get_payment_by_reference(&self, reference: &str) -> Result<Option<Payment>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM payments WHERE reference = ?1", PAYMENT_COLS),
            params![reference],
            payment_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Purchaser attaches proof of payment; pending -> paid
    pub fn mark_payment_paid(&self, id: Uuid, proof_ref: &str, now: i64) -> Result<Payment> {
        self.transition_payment(id, PaymentStatus::Paid, |p, conn| {
            if p.status != PaymentStatus::Pending {
                return Err(state_err(p.status, PaymentStatus::Paid));
            }
            conn.execute(
                "UPDATE payments SET status = 'paid', paid_at = ?1, proof_ref = ?2 WHERE id = ?3",
                params![now, proof_ref, p.id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Admin confirms a payment; pending/paid -> confirmed (terminal)
    pub fn confirm_payment(&self, id: Uuid, comment: &str, now: i64) -> Result<Payment> {
        self.transition_payment(id, PaymentStatus::Confirmed, |p, conn| {
            if !matches!(p.status, PaymentStatus::Pending | PaymentStatus::Paid) {
                return Err(state_err(p.status, PaymentStatus::Confirmed));
            }
            conn.execute(
                "UPDATE payments SET status = 'confirmed', confirmed_at = ?1, admin_comment = ?2 WHERE id = ?3",
                params![now, comment, p.id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Admin rejects a payment; pending/paid -> rejected (terminal)
    pub fn reject_payment(&self, id: Uuid, comment: &str) -> Result<Payment> {
        self.transition_payment(id, PaymentStatus::Rejected, |p, conn| {
            if !matches!(p.status, PaymentStatus::Pending | PaymentStatus::Paid) {
                return Err(state_err(p.status, PaymentStatus::Rejected));
            }
            conn.execute(
                "UPDATE payments SET status = 'rejected', admin_comment = ?1 WHERE id = ?2",
                params![comment, p.id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Purchaser abandons a payment; pending -> cancelled (terminal)
    pub fn cancel_payment(&self, id: Uuid) -> Result<Payment> {
        self.transition_payment(id, PaymentStatus::Cancelled, |p, conn| {
            if p.status != PaymentStatus::Pending {
                return Err(state_err(p.status, PaymentStatus::Cancelled));
            }
            conn.execute(
                "UPDATE payments SET status = 'cancelled' WHERE id = ?1",
                params![p.id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Sweep pending payments whose hold has lapsed; returns how many expired
    pub fn expire_stale_payments(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE payments SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?1",
            params![now],
        )?;
        Ok(n)
    }

    fn transition_payment(
        &self,
        id: Uuid,
        _to: PaymentStatus,
        apply: impl FnOnce(&Payment, &Connection) -> Result<()>,
    ) -> Result<Payment> {
        let conn = self.conn.lock();
        let payment = Self::payment_by_id(&conn, id)?.ok_or_else(|| Error::NotFound {
            kind: "payment".to_string(),
            id: id.to_string(),
        })?;
        apply(&payment, &conn)?;
        Self::payment_by_id(&conn, id)?.ok_or_else(|| Error::NotFound {
            kind: "payment".to_string(),
            id: id.to_string(),
        })
    }

    fn payment_by_id(conn: &Connection, id: Uuid) -> Result<Option<Payment>> {
        conn.query_row(
            &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLS),
            params![id.to_string()],
            payment_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    // ========================================================================
    // VPN key operations
    // ========================================================================

    pub fn create_vpn_key(&self, key: &VpnKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vpn_keys (id, name, user_id, private_key, public_key, address,
                                   server_public_key, server_endpoint, server_port, config_data,
                                   days, created_at, expires_at, status, payment_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                key.id.to_string(),
                key.name,
                key.user_id,
                key.private_key,
                key.public_key,
                key.address.to_string(),
                key.server_public_key,
                key.server_endpoint,
                key.server_port,
                key.config_data,
                key.days,
                key.created_at,
                key.expires_at,
                key.status.to_string(),
                key.payment_id.map(|p| p.to_string()),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists {
                    kind: "vpn_key".to_string(),
                    id: key.name.clone(),
                }
            }
            other => Error::from(other),
        })?;
        Ok(())
    }

    pub fn get_vpn_key(&self, id: Uuid) -> Result<Option<VpnKey>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM vpn_keys WHERE id = ?1", KEY_COLS),
            params![id.to_string()],
            key_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_vpn_key_by_name(&self, name: &str) -> Result<Option<VpnKey>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM vpn_keys WHERE name = ?1", KEY_COLS),
            params![name],
            key_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// The key funded by a payment, if one was ever written.
    /// Backs the exactly-one-key-per-payment idempotency check.
    pub fn key_for_payment(&self, payment_id: Uuid) -> Result<Option<VpnKey>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM vpn_keys WHERE payment_id = ?1", KEY_COLS),
            params![payment_id.to_string()],
            key_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Finalize a provisional key once the gateway has acknowledged the peer.
    /// The final status is `active`, or `pending` for a pre-authorized key
    /// whose funding payment has not been confirmed yet; either way the
    /// rendered config marks the row as acknowledged.
    pub fn finalize_vpn_key(&self, id: Uuid, config_data: &str, status: KeyStatus) -> Result<()> {
        if !matches!(status, KeyStatus::Active | KeyStatus::Pending) {
            return Err(Error::InvalidStateTransition {
                from: "pending".to_string(),
                to: status.to_string(),
            });
        }
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE vpn_keys SET status = ?1, config_data = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![status.to_string(), config_data, id.to_string()],
        )?;
        if n == 0 {
            return Err(Error::InvalidStateTransition {
                from: "non-pending".to_string(),
                to: status.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a provisional key whose gateway registration never happened.
    /// Refuses to touch rows that left the pending state.
    pub fn delete_provisional_key(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM vpn_keys WHERE id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    pub fn set_key_status(&self, id: Uuid, status: KeyStatus) -> Result<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE vpn_keys SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id.to_string()],
        )?;
        if n == 0 {
            return Err(Error::NotFound {
                kind: "vpn_key".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Active keys whose expiry has passed; the reaper's work list
    pub fn list_expired_active(&self, now: i64) -> Result<Vec<VpnKey>> {
        self.list_keys_where("status = 'active' AND expires_at <= ?1", params![now])
    }

    /// Keys that hold an address reservation (pending or active)
    pub fn list_live_keys(&self) -> Result<Vec<VpnKey>> {
        self.list_keys_where("status IN ('pending', 'active')", params![])
    }

    /// Provisional rows older than the cutoff, stranded by a crash or an
    /// ambiguous gateway ack; the reconciliation sweep's work list.
    /// An empty config distinguishes a stranded row from a pre-authorized
    /// key that was acknowledged and is waiting on payment confirmation.
    pub fn list_stuck_pending(&self, cutoff: i64) -> Result<Vec<VpnKey>> {
        self.list_keys_where(
            "status = 'pending' AND config_data = '' AND created_at <= ?1",
            params![cutoff],
        )
    }

    pub fn list_user_keys(&self, user_id: i64) -> Result<Vec<VpnKey>> {
        self.list_keys_where("user_id = ?1", params![user_id])
    }

    fn list_keys_where(
        &self,
        predicate: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<VpnKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM vpn_keys WHERE {} ORDER BY created_at DESC",
            KEY_COLS, predicate
        ))?;
        let rows = stmt.query_map(params, key_from_row)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

const PAYMENT_COLS: &str = "id, reference, user_id, amount, method, details, days, status, \
                            created_at, expires_at, paid_at, confirmed_at, proof_ref, admin_comment";

const KEY_COLS: &str = "id, name, user_id, private_key, public_key, address, server_public_key, \
                        server_endpoint, server_port, config_data, days, created_at, expires_at, \
                        status, payment_id";

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
        reference: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        method: row.get::<_, String>(4)?.parse().unwrap_or(PaymentMethod::Card),
        details: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        days: row.get(6)?,
        status: row.get::<_, String>(7)?.parse().unwrap_or_default(),
        created_at: row.get(8)?,
        expires_at: row.get(9)?,
        paid_at: row.get(10)?,
        confirmed_at: row.get(11)?,
        proof_ref: row.get(12)?,
        admin_comment: row.get(13)?,
    })
}

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VpnKey> {
    Ok(VpnKey {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
        name: row.get(1)?,
        user_id: row.get(2)?,
        private_key: row.get(3)?,
        public_key: row.get(4)?,
        address: row
            .get::<_, String>(5)?
            .parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::UNSPECIFIED),
        server_public_key: row.get(6)?,
        server_endpoint: row.get(7)?,
        server_port: row.get(8)?,
        config_data: row.get(9)?,
        days: row.get(10)?,
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
        status: row.get::<_, String>(13)?.parse().unwrap_or_default(),
        payment_id: row
            .get::<_, Option<String>>(14)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

fn state_err(from: PaymentStatus, to: PaymentStatus) -> Error {
    Error::InvalidStateTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PAYMENT_HOLD_SECS, SECS_PER_DAY};

    fn sample_payment(now: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            reference: format!("PAY-20260801-{:08X}", now as u64 as u32),
            user_id: 42,
            amount: 300.0,
            method: PaymentMethod::Card,
            details: serde_json::json!({"card_number": "5536 9138 1234 5678"}),
            days: 30,
            status: PaymentStatus::Pending,
            created_at: now,
            expires_at: now + PAYMENT_HOLD_SECS,
            paid_at: None,
            confirmed_at: None,
            proof_ref: None,
            admin_comment: None,
        }
    }

    fn sample_key(now: i64, payment_id: Option<Uuid>) -> VpnKey {
        VpnKey {
            id: Uuid::new_v4(),
            name: format!("user42_{}_abc123", now),
            user_id: 42,
            private_key: "priv".to_string(),
            public_key: "pub".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            server_public_key: "spub".to_string(),
            server_endpoint: "vpn.example.com".to_string(),
            server_port: 51820,
            config_data: String::new(),
            days: 30,
            created_at: now,
            expires_at: now + 30 * SECS_PER_DAY,
            status: KeyStatus::Pending,
            payment_id,
        }
    }

    #[test]
    fn test_payment_lifecycle() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let payment = sample_payment(now);
        db.create_payment(&payment).unwrap();

        let paid = db.mark_payment_paid(payment.id, "upload-1", now + 60).unwrap();
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert_eq!(paid.paid_at, Some(now + 60));

        let confirmed = db.confirm_payment(payment.id, "looks good", now + 120).unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);

        // Terminal: further transitions refused
        assert!(matches!(
            db.reject_payment(payment.id, "nope"),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_rejected_payment_is_terminal() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let payment = sample_payment(now);
        db.create_payment(&payment).unwrap();
        db.reject_payment(payment.id, "no proof").unwrap();

        assert!(matches!(
            db.confirm_payment(payment.id, "", now),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_expire_stale_payments() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let stale = sample_payment(now - PAYMENT_HOLD_SECS - 10);
        let fresh = sample_payment(now);
        db.create_payment(&stale).unwrap();
        db.create_payment(&fresh).unwrap();

        assert_eq!(db.expire_stale_payments(now).unwrap(), 1);
        assert_eq!(
            db.get_payment(stale.id).unwrap().unwrap().status,
            PaymentStatus::Expired
        );
        assert_eq!(
            db.get_payment(fresh.id).unwrap().unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[test]
    fn test_one_key_per_payment() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let payment = sample_payment(now);
        db.create_payment(&payment).unwrap();

        db.create_vpn_key(&sample_key(now, Some(payment.id))).unwrap();
        let mut second = sample_key(now + 1, Some(payment.id));
        second.address = Ipv4Addr::new(10, 0, 0, 3);
        assert!(matches!(
            db.create_vpn_key(&second),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_live_address_reservation() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        db.create_vpn_key(&sample_key(now, None)).unwrap();

        // Same address while the first key is live
        let mut clash = sample_key(now + 1, None);
        clash.name = "other".to_string();
        assert!(db.create_vpn_key(&clash).is_err());
    }

    #[test]
    fn test_revoked_key_frees_address() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let key = sample_key(now, None);
        db.create_vpn_key(&key).unwrap();
        db.finalize_vpn_key(key.id, "[Interface]", KeyStatus::Active).unwrap();
        db.set_key_status(key.id, KeyStatus::Revoked).unwrap();

        let mut reuse = sample_key(now + 1, None);
        reuse.name = "reissue".to_string();
        db.create_vpn_key(&reuse).unwrap();
    }

    #[test]
    fn test_provisional_promotion_and_rollback() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;
        let key = sample_key(now, None);
        db.create_vpn_key(&key).unwrap();

        db.finalize_vpn_key(key.id, "[Interface]\n", KeyStatus::Active).unwrap();
        let loaded = db.get_vpn_key(key.id).unwrap().unwrap();
        assert_eq!(loaded.status, KeyStatus::Active);
        assert_eq!(loaded.config_data, "[Interface]\n");

        // Active rows are not provisional; rollback refuses them
        assert!(!db.delete_provisional_key(key.id).unwrap());

        let mut other = sample_key(now + 1, None);
        other.name = "victim".to_string();
        other.address = Ipv4Addr::new(10, 0, 0, 3);
        db.create_vpn_key(&other).unwrap();
        assert!(db.delete_provisional_key(other.id).unwrap());
        assert!(db.get_vpn_key(other.id).unwrap().is_none());
    }

    #[test]
    fn test_expired_scan() {
        let db = Database::open_memory().unwrap();
        let now = 1_700_000_000;

        let mut gone = sample_key(now - 40 * SECS_PER_DAY, None);
        gone.expires_at = now - 10 * SECS_PER_DAY;
        db.create_vpn_key(&gone).unwrap();
        db.finalize_vpn_key(gone.id, "x", KeyStatus::Active).unwrap();

        let mut live = sample_key(now, None);
        live.name = "live".to_string();
        live.address = Ipv4Addr::new(10, 0, 0, 3);
        db.create_vpn_key(&live).unwrap();
        db.finalize_vpn_key(live.id, "x", KeyStatus::Active).unwrap();

        let expired = db.list_expired_active(now).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, gone.id);
    }
}
