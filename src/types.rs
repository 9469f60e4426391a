use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A physical store that accepts purchases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreLocation {
    /// The ID of the store.
    pub id: String,
    /// The display name of the store.
    pub name: String,
    /// The street address of the store.
    pub address: String,
    /// The latitude of the store center, in degrees.
    pub latitude: f64,
    /// The longitude of the store center, in degrees.
    pub longitude: f64,
    /// The allowed distance from the center, in meters.
    pub radius: f64,
}

/// A coordinate reported by a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    /// The latitude, in degrees.
    pub latitude: f64,
    /// The longitude, in degrees.
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A loyalty program customer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    /// The ID of the customer.
    pub id: Uuid,
    /// The name of the customer, if known.
    pub name: Option<String>,
    /// The phone number of the customer.
    pub phone: String,
    /// The cashback balance available for redemption.
    pub balance: Decimal,
}

/// The kind of ledger event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Purchase,
    Redemption,
}

/// The approval state of a transaction. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Redemption => "redemption",
        }
    }
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(TransactionType::Purchase),
            "redemption" => Ok(TransactionType::Redemption),
            other => anyhow::bail!("unknown transaction type: {other}"),
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "approved" => Ok(TransactionStatus::Approved),
            "rejected" => Ok(TransactionStatus::Rejected),
            other => anyhow::bail!("unknown transaction status: {other}"),
        }
    }
}

/// A purchase or redemption recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    /// The ID of the transaction.
    pub id: Uuid,
    /// The ID of the customer who owns the transaction.
    pub customer_id: Uuid,
    /// Whether this is a purchase or a redemption.
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// The purchase or redemption amount, always positive.
    pub amount: Decimal,
    /// The cashback earned by a purchase. Zero for redemptions.
    pub cashback_amount: Decimal,
    /// The approval state.
    pub status: TransactionStatus,
    /// The timestamp when the transaction was created.
    pub created_at: DateTime<Utc>,
    /// The store whose geofence accepted the purchase.
    pub store_id: Option<String>,
    /// The coordinates reported when the purchase was created.
    pub location: Option<Coordinates>,
}

impl Transaction {
    pub fn is_approved_purchase(&self) -> bool {
        self.kind == TransactionType::Purchase && self.status == TransactionStatus::Approved
    }

    pub fn is_approved_redemption(&self) -> bool {
        self.kind == TransactionType::Redemption && self.status == TransactionStatus::Approved
    }
}

/// A transaction joined with its owning customer.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionWithCustomer {
    #[serde(flatten)]
    pub transaction: Transaction,
    /// The owning customer, as currently stored.
    pub customer: Customer,
}
