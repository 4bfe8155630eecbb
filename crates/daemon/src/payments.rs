//! Payment workflow
//!
//! Payments are created with a fixed day count and amount taken from the
//! price table at purchase time. The purchaser attaches proof, an admin
//! confirms or rejects, and unpaid payments expire after a short hold.
//! Confirmation is terminal and is what entitles the purchaser to a key;
//! the provisioner enforces that at most one key is ever issued per payment.

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use wirevend_common::{
    Database, Error, Payment, PaymentMethod, PaymentStatus, Result, PAYMENT_HOLD_SECS,
};

use crate::config::PaymentConfig;

pub struct PaymentService {
    db: Database,
    config: PaymentConfig,
}

impl PaymentService {
    pub fn new(db: Database, config: PaymentConfig) -> Self {
        Self { db, config }
    }

    /// Open a payment for `days` of access
    pub fn create(&self, user_id: i64, days: u32, method: PaymentMethod) -> Result<Payment> {
        if days < self.config.min_days || days > self.config.max_days {
            return Err(Error::InvalidInput(format!(
                "purchase must be between {} and {} days, got {}",
                self.config.min_days, self.config.max_days, days
            )));
        }

        let now = Utc::now().timestamp();
        let amount = days as f64 * self.config.price_per_day;
        let payment = Payment {
            id: Uuid::new_v4(),
            reference: generate_reference(),
            user_id,
            amount,
            method,
            details: payment_details(method, amount),
            days,
            status: PaymentStatus::Pending,
            created_at: now,
            expires_at: now + PAYMENT_HOLD_SECS,
            paid_at: None,
            confirmed_at: None,
            proof_ref: None,
            admin_comment: None,
        };
        self.db.create_payment(&payment)?;

        info!(
            "payment {} opened: user {} bought {} days for {}",
            payment.reference, user_id, days, amount
        );
        Ok(payment)
    }

    /// Purchaser attaches proof of payment
    pub fn submit_proof(&self, id: Uuid, proof_ref: &str) -> Result<Payment> {
        self.db
            .mark_payment_paid(id, proof_ref, Utc::now().timestamp())
    }

    /// Admin confirms; the caller is expected to hand the returned payment to
    /// the provisioner
    pub fn confirm(&self, id: Uuid, comment: &str) -> Result<Payment> {
        let payment = self.db.confirm_payment(id, comment, Utc::now().timestamp())?;
        info!("payment {} confirmed", payment.reference);
        Ok(payment)
    }

    /// Admin rejects with a reason shown to the purchaser
    pub fn reject(&self, id: Uuid, comment: &str) -> Result<Payment> {
        let payment = self.db.reject_payment(id, comment)?;
        info!("payment {} rejected: {}", payment.reference, comment);
        Ok(payment)
    }

    /// Purchaser abandons an unpaid payment
    pub fn cancel(&self, id: Uuid) -> Result<Payment> {
        self.db.cancel_payment(id)
    }

    pub fn by_reference(&self, reference: &str) -> Result<Payment> {
        self.db
            .get_payment_by_reference(reference)?
            .ok_or_else(|| Error::NotFound {
                kind: "payment".to_string(),
                id: reference.to_string(),
            })
    }
}

/// Human-facing payment reference, e.g. PAY-20260801-1A2B3C4D
fn generate_reference() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("PAY-{}-{}", date, suffix)
}

/// Transfer comment the purchaser must attach so the payment can be matched
fn transfer_comment() -> String {
    format!(
        "VPN-{}",
        Uuid::new_v4().simple().to_string()[..6].to_uppercase()
    )
}

/// Method-specific transfer details shown to the purchaser
fn payment_details(method: PaymentMethod, amount: f64) -> serde_json::Value {
    let comment = transfer_comment();
    match method {
        PaymentMethod::Card => json!({
            "bank_name": "Tinkoff",
            "card_number": "5536 9138 1234 5678",
            "cardholder": "IVANOV IVAN",
            "amount": amount,
            "comment": comment,
        }),
        PaymentMethod::Qiwi => json!({
            "wallet": "+79001234567",
            "amount": amount,
            "comment": comment,
        }),
        PaymentMethod::Sberbank => json!({
            "card_number": "5469 3800 1234 5678",
            "amount": amount,
            "comment": comment,
        }),
        PaymentMethod::Yoomoney => json!({
            "wallet": "410011234567890",
            "amount": amount,
            "comment": comment,
        }),
        PaymentMethod::Webmoney => json!({
            "wallet": "R123456789012",
            "amount": amount,
            "comment": comment,
        }),
        PaymentMethod::Crypto => json!({
            "wallet": "0x742d35Cc6634C0532925a3b844Bc9e0a3A3A3A3A",
            "crypto": "USDT (TRC20)",
            "amount": amount,
            "comment": comment,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirevend_common::Database;

    fn service() -> PaymentService {
        PaymentService::new(Database::open_memory().unwrap(), PaymentConfig::default())
    }

    #[test]
    fn test_amount_and_days_fixed_at_purchase() {
        let svc = service();
        let payment = svc.create(42, 30, PaymentMethod::Card).unwrap();
        assert_eq!(payment.amount, 300.0);
        assert_eq!(payment.days, 30);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.expires_at - payment.created_at, PAYMENT_HOLD_SECS);
    }

    #[test]
    fn test_day_bounds() {
        let svc = service();
        assert!(svc.create(42, 0, PaymentMethod::Card).is_err());
        assert!(svc.create(42, 366, PaymentMethod::Card).is_err());
        assert!(svc.create(42, 365, PaymentMethod::Card).is_ok());
    }

    #[test]
    fn test_reference_shape() {
        let reference = generate_reference();
        assert!(reference.starts_with("PAY-"));
        let parts: Vec<_> = reference.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_details_carry_comment() {
        for method in [
            PaymentMethod::Card,
            PaymentMethod::Qiwi,
            PaymentMethod::Sberbank,
            PaymentMethod::Yoomoney,
            PaymentMethod::Webmoney,
            PaymentMethod::Crypto,
        ] {
            let details = payment_details(method, 100.0);
            let comment = details["comment"].as_str().unwrap();
            assert!(comment.starts_with("VPN-"));
        }
    }

    #[test]
    fn test_admin_flow() {
        let svc = service();
        let payment = svc.create(42, 7, PaymentMethod::Qiwi).unwrap();
        svc.submit_proof(payment.id, "upload-99").unwrap();
        let confirmed = svc.confirm(payment.id, "matched transfer").unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);

        // Confirmation is terminal; a second admin action is refused
        assert!(svc.reject(payment.id, "oops").is_err());
    }

    #[test]
    fn test_lookup_by_reference() {
        let svc = service();
        let payment = svc.create(7, 1, PaymentMethod::Crypto).unwrap();
        let found = svc.by_reference(&payment.reference).unwrap();
        assert_eq!(found.id, payment.id);
        assert!(svc.by_reference("PAY-00000000-NOPE").is_err());
    }
}
