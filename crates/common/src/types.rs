//! Core types for wirevend

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Seconds in a day, used for key expiry math
pub const SECS_PER_DAY: i64 = 86_400;

/// How long an unpaid payment is held open before it expires
pub const PAYMENT_HOLD_SECS: i64 = 30 * 60;

/// VPN key lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Provisional: record written, gateway registration not yet acknowledged
    Pending,
    Active,
    Revoked,
    Expired,
}

impl Default for KeyStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Revoked => write!(f, "revoked"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown key status: {}", s)),
        }
    }
}

/// Payment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// Purchaser submitted proof, awaiting admin review
    Paid,
    Confirmed,
    Rejected,
    Cancelled,
    Expired,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PaymentStatus {
    /// Terminal statuses are immutable and never provision a key,
    /// except `Confirmed` which triggers exactly one provisioning attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown payment status: {}", s)),
        }
    }
}

/// Supported payment methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Qiwi,
    Webmoney,
    Sberbank,
    Yoomoney,
    Crypto,
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card => write!(f, "card"),
            Self::Qiwi => write!(f, "qiwi"),
            Self::Webmoney => write!(f, "webmoney"),
            Self::Sberbank => write!(f, "sberbank"),
            Self::Yoomoney => write!(f, "yoomoney"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "qiwi" => Ok(Self::Qiwi),
            "webmoney" => Ok(Self::Webmoney),
            "sberbank" => Ok(Self::Sberbank),
            "yoomoney" => Ok(Self::Yoomoney),
            "crypto" => Ok(Self::Crypto),
            _ => Err(format!("unknown payment method: {}", s)),
        }
    }
}

/// A payment record
///
/// `days` is fixed at purchase time from the price table and is never
/// recomputed from the amount afterwards, so a price change between purchase
/// and confirmation cannot change what was bought.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    /// Human-facing reference, e.g. PAY-20260801-1A2B3C4D
    pub reference: String,
    pub user_id: i64,
    pub amount: f64,
    pub method: PaymentMethod,
    /// Method-specific transfer details shown to the purchaser
    pub details: serde_json::Value,
    pub days: u32,
    pub status: PaymentStatus,
    pub created_at: i64,
    /// Unpaid payments expire after a short hold, independent of key expiry
    pub expires_at: i64,
    pub paid_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    /// Reference to the purchaser's proof of payment (e.g. an upload id)
    pub proof_ref: Option<String>,
    pub admin_comment: Option<String>,
}

impl Payment {
    pub fn is_expired(&self, now: i64) -> bool {
        self.status == PaymentStatus::Pending && now > self.expires_at
    }
}

/// A provisioned VPN key
///
/// Never deleted once active: revoked and expired rows are retained as an
/// audit record of who held which address and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnKey {
    pub id: Uuid,
    pub name: String,
    pub user_id: i64,
    pub private_key: String,
    pub public_key: String,
    pub address: Ipv4Addr,
    /// Gateway snapshot at issue time
    pub server_public_key: String,
    pub server_endpoint: String,
    pub server_port: u16,
    /// Rendered client profile; empty until the peer is acknowledged
    pub config_data: String,
    pub days: u32,
    pub created_at: i64,
    pub expires_at: i64,
    pub status: KeyStatus,
    pub payment_id: Option<Uuid>,
}

impl VpnKey {
    pub fn is_active(&self, now: i64) -> bool {
        self.status == KeyStatus::Active && self.expires_at > now
    }

    pub fn days_left(&self, now: i64) -> i64 {
        if !self.is_active(now) {
            return 0;
        }
        (self.expires_at - now).max(0) / SECS_PER_DAY
    }
}

/// Gateway identity recovered from its running configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub public_key: String,
    pub listen_port: u16,
    pub endpoint_host: String,
}

/// Payload handed to the delivery collaborator once a key is committed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedKey {
    pub name: String,
    pub address: Ipv4Addr,
    pub expires_at: i64,
    pub config: String,
}
