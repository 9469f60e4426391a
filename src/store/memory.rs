use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::LedgerStore;
use crate::error::LedgerError;
use crate::ledger::{self, Decision, Settlement};
use crate::metrics::DateRange;
use crate::types::{Customer, Transaction, TransactionWithCustomer};

#[derive(Default)]
struct State {
    customers: HashMap<Uuid, Customer>,
    phones: HashMap<String, Uuid>,
    transactions: HashMap<Uuid, Transaction>,
}

/// Process-local store. A single lock serializes every settlement.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_or_create_customer(&self, phone: &str, name: Option<&str>) -> Result<Customer> {
        let mut state = self.state.lock().await;

        if let Some(id) = state.phones.get(phone).copied() {
            let customer = state
                .customers
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("phone index points at missing customer {id}"))?;
            if customer.name.is_none() {
                customer.name = name.map(str::to_string);
            }
            return Ok(customer.clone());
        }

        let customer = Customer {
            id: Uuid::new_v4(),
            name: name.map(str::to_string),
            phone: phone.to_string(),
            balance: Decimal::ZERO,
        };
        state.phones.insert(customer.phone.clone(), customer.id);
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn customer(&self, id: Uuid) -> Result<Option<Customer>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn customer_by_phone(&self, phone: &str) -> Result<Option<Customer>> {
        let state = self.state.lock().await;
        Ok(state
            .phones
            .get(phone)
            .and_then(|id| state.customers.get(id))
            .cloned())
    }

    async fn customers(&self) -> Result<Vec<Customer>> {
        Ok(self.state.lock().await.customers.values().cloned().collect())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.customers.contains_key(&transaction.customer_id) {
            anyhow::bail!("unknown customer {}", transaction.customer_id);
        }
        if state.transactions.contains_key(&transaction.id) {
            anyhow::bail!("transaction {} already exists", transaction.id);
        }
        state
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn transactions(&self, range: Option<DateRange>) -> Result<Vec<TransactionWithCustomer>> {
        let state = self.state.lock().await;

        let mut rows = state
            .transactions
            .values()
            .filter(|t| range.is_none_or(|r| r.contains(t.created_at)))
            .map(|t| -> Result<TransactionWithCustomer> {
                let customer = state
                    .customers
                    .get(&t.customer_id)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("transaction {} has no customer", t.id))?;
                Ok(TransactionWithCustomer {
                    transaction: t.clone(),
                    customer,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        rows.sort_by(|a, b| b.transaction.created_at.cmp(&a.transaction.created_at));
        Ok(rows)
    }

    async fn settle(&self, id: Uuid, decision: Decision) -> Result<Settlement, LedgerError> {
        let mut state = self.state.lock().await;

        let current = state
            .transactions
            .get(&id)
            .cloned()
            .ok_or(LedgerError::TransactionNotFound(id))?;
        let balance = state
            .customers
            .get(&current.customer_id)
            .map(|c| c.balance)
            .ok_or(LedgerError::CustomerNotFound(current.customer_id))?;

        let new_balance = ledger::settle(&current, balance, decision)?;

        let mut transaction = current;
        transaction.status = decision.target_status();
        state.transactions.insert(id, transaction.clone());
        if let Some(customer) = state.customers.get_mut(&transaction.customer_id) {
            customer.balance = new_balance;
        }

        Ok(Settlement {
            transaction,
            balance: new_balance,
        })
    }
}
