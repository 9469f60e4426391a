//! Persistence collaborators for customers and transactions.

mod memory;
mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{Decision, Settlement};
use crate::metrics::DateRange;
use crate::types::{Customer, Transaction, TransactionWithCustomer};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Storage used by the ledger and the metrics pipeline.
///
/// `settle` must run the status check, the balance check and both writes as
/// one atomic unit per customer.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Returns the customer with `phone`, creating it with a zero balance.
    async fn find_or_create_customer(&self, phone: &str, name: Option<&str>) -> Result<Customer>;

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>>;

    /// Looks a customer up by phone without registering it.
    async fn customer_by_phone(&self, phone: &str) -> Result<Option<Customer>>;

    async fn customers(&self) -> Result<Vec<Customer>>;

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()>;

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Transactions created within `range` (all when `None`), newest first,
    /// joined with their owning customer.
    async fn transactions(&self, range: Option<DateRange>) -> Result<Vec<TransactionWithCustomer>>;

    /// Moves a pending transaction to its terminal status and applies the
    /// resulting balance change.
    async fn settle(&self, id: Uuid, decision: Decision) -> Result<Settlement, LedgerError>;
}
