//! Postgres-backed store.
//!
//! Expected tables:
//!
//! ```sql
//! CREATE TABLE customers (
//!     id      UUID PRIMARY KEY,
//!     name    TEXT,
//!     phone   TEXT NOT NULL UNIQUE,
//!     balance NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (balance >= 0)
//! );
//!
//! CREATE TABLE transactions (
//!     id              UUID PRIMARY KEY,
//!     customer_id     UUID NOT NULL REFERENCES customers (id),
//!     type            TEXT NOT NULL,
//!     amount          NUMERIC(12, 2) NOT NULL CHECK (amount > 0),
//!     cashback_amount NUMERIC(12, 2) NOT NULL DEFAULT 0,
//!     status          TEXT NOT NULL DEFAULT 'pending',
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     store_id        TEXT,
//!     latitude        DOUBLE PRECISION,
//!     longitude       DOUBLE PRECISION
//! );
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::LedgerStore;
use crate::error::LedgerError;
use crate::ledger::{self, Decision, Settlement};
use crate::metrics::DateRange;
use crate::types::{Coordinates, Customer, Transaction, TransactionWithCustomer};

const TRANSACTION_COLUMNS: &str = "t.id, t.customer_id, t.type, t.amount, t.cashback_amount, \
     t.status, t.created_at, t.store_id, t.latitude, t.longitude";

#[derive(FromRow)]
struct CustomerRow {
    id: Uuid,
    name: Option<String>,
    phone: String,
    balance: Decimal,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            id: row.id,
            name: row.name,
            phone: row.phone,
            balance: row.balance,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    customer_id: Uuid,
    #[sqlx(rename = "type")]
    kind: String,
    amount: Decimal,
    cashback_amount: Decimal,
    status: String,
    created_at: DateTime<Utc>,
    store_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = anyhow::Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let location = match (row.latitude, row.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        };
        Ok(Transaction {
            id: row.id,
            customer_id: row.customer_id,
            kind: row.kind.parse()?,
            amount: row.amount,
            cashback_amount: row.cashback_amount,
            status: row.status.parse()?,
            created_at: row.created_at,
            store_id: row.store_id,
            location,
        })
    }
}

#[derive(FromRow)]
struct JoinedRow {
    #[sqlx(flatten)]
    transaction: TransactionRow,
    customer_name: Option<String>,
    customer_phone: String,
    customer_balance: Decimal,
}

impl TryFrom<JoinedRow> for TransactionWithCustomer {
    type Error = anyhow::Error;

    fn try_from(row: JoinedRow) -> Result<Self> {
        let transaction = Transaction::try_from(row.transaction)?;
        let customer = Customer {
            id: transaction.customer_id,
            name: row.customer_name,
            phone: row.customer_phone,
            balance: row.customer_balance,
        };
        Ok(TransactionWithCustomer {
            transaction,
            customer,
        })
    }
}

/// Store backed by a Postgres pool. Settlement runs in a database
/// transaction holding row locks on the transaction and its customer.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> LedgerError {
    LedgerError::unavailable(err.into())
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn find_or_create_customer(&self, phone: &str, name: Option<&str>) -> Result<Customer> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"INSERT INTO customers (id, name, phone, balance) VALUES ($1, $2, $3, 0)
         ON CONFLICT (phone) DO UPDATE SET name = COALESCE(customers.name, EXCLUDED.name)
         RETURNING id, name, phone, balance"#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(phone)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert customer")?;
        Ok(row.into())
    }

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"SELECT id, name, phone, balance FROM customers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Customer::from))
    }

    async fn customer_by_phone(&self, phone: &str) -> Result<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"SELECT id, name, phone, balance FROM customers WHERE phone = $1"#,
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up customer by phone")?;
        Ok(row.map(Customer::from))
    }

    async fn customers(&self) -> Result<Vec<Customer>> {
        let rows =
            sqlx::query_as::<_, CustomerRow>(r#"SELECT id, name, phone, balance FROM customers"#)
                .fetch_all(&self.pool)
                .await
                .context("failed to load customers")?;
        Ok(rows.into_iter().map(Customer::from).collect())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO transactions
         (id, customer_id, type, amount, cashback_amount, status, created_at, store_id, latitude, longitude)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(transaction.id)
        .bind(transaction.customer_id)
        .bind(transaction.kind.as_str())
        .bind(transaction.amount)
        .bind(transaction.cashback_amount)
        .bind(transaction.status.as_str())
        .bind(transaction.created_at)
        .bind(transaction.store_id.as_deref())
        .bind(transaction.location.map(|l| l.latitude))
        .bind(transaction.location.map(|l| l.longitude))
        .execute(&self.pool)
        .await
        .context("failed to insert transaction")?;
        Ok(())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = $1");
        sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn transactions(&self, range: Option<DateRange>) -> Result<Vec<TransactionWithCustomer>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS}, c.name AS customer_name, c.phone AS customer_phone, \
             c.balance AS customer_balance \
             FROM transactions t JOIN customers c ON c.id = t.customer_id \
             WHERE ($1::timestamptz IS NULL OR t.created_at >= $1) \
             AND ($2::timestamptz IS NULL OR t.created_at <= $2) \
             ORDER BY t.created_at DESC"
        );
        let rows = sqlx::query_as::<_, JoinedRow>(&sql)
            .bind(range.map(|r| r.start))
            .bind(range.map(|r| r.end))
            .fetch_all(&self.pool)
            .await
            .context("failed to load transactions")?;

        rows.into_iter()
            .map(TransactionWithCustomer::try_from)
            .collect()
    }

    async fn settle(&self, id: Uuid, decision: Decision) -> Result<Settlement, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(tx.as_mut())
            .await
            .map_err(unavailable)?
            .ok_or(LedgerError::TransactionNotFound(id))?;
        let current = Transaction::try_from(row).map_err(LedgerError::unavailable)?;

        let balance: Decimal =
            sqlx::query_scalar(r#"SELECT balance FROM customers WHERE id = $1 FOR UPDATE"#)
                .bind(current.customer_id)
                .fetch_optional(tx.as_mut())
                .await
                .map_err(unavailable)?
                .ok_or(LedgerError::CustomerNotFound(current.customer_id))?;

        // Dropping `tx` on an early return rolls back and releases the locks.
        let new_balance = ledger::settle(&current, balance, decision)?;
        let status = decision.target_status();

        sqlx::query(r#"UPDATE transactions SET status = $2 WHERE id = $1"#)
            .bind(id)
            .bind(status.as_str())
            .execute(tx.as_mut())
            .await
            .map_err(unavailable)?;

        if new_balance != balance {
            sqlx::query(r#"UPDATE customers SET balance = $2 WHERE id = $1"#)
                .bind(current.customer_id)
                .bind(new_balance)
                .execute(tx.as_mut())
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;

        let mut transaction = current;
        transaction.status = status;
        Ok(Settlement {
            transaction,
            balance: new_balance,
        })
    }
}
