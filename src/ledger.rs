//! Transaction ledger.
//!
//! Transactions are created `pending` and settle exactly once, to either
//! `approved` or `rejected`. The customer balance only moves when a
//! transaction is approved:
//!
//! ```text
//!   pending ──approve──► approved   purchase: balance += cashback_amount
//!      │                            redemption: balance -= amount
//!      └────reject─────► rejected   no balance effect
//! ```

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::geofence::{GeofenceMatch, GeofenceValidator};
use crate::store::LedgerStore;
use crate::types::{Coordinates, Customer, Transaction, TransactionStatus, TransactionType};

/// 5%.
pub const DEFAULT_CASHBACK_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

/// 9999999999.99, the largest value a `NUMERIC(12, 2)` column holds. Caps
/// transaction amounts and customer balances alike.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0xD4A5_0FFF, 0xE8, 0, false, 2);

/// Refuses amounts that are not positive or exceed [`MAX_AMOUNT`].
pub fn check_amount(amount: Decimal) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO || amount > MAX_AMOUNT {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn target_status(self) -> TransactionStatus {
        match self {
            Decision::Approve => TransactionStatus::Approved,
            Decision::Reject => TransactionStatus::Rejected,
        }
    }
}

/// The outcome of a successful approval or rejection.
#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    /// The transaction in its terminal state.
    pub transaction: Transaction,
    /// The customer balance after the settlement.
    pub balance: Decimal,
}

/// Cashback earned on `amount`, rounded to cents.
pub fn cashback_for(amount: Decimal, rate: Decimal) -> Decimal {
    (amount * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Computes the balance that results from settling `transaction` against
/// `balance`. Callers must hold the customer's balance exclusively for the
/// duration of the read, this call and the write.
pub fn settle(
    transaction: &Transaction,
    balance: Decimal,
    decision: Decision,
) -> Result<Decimal, LedgerError> {
    if transaction.status.is_terminal() {
        return Err(LedgerError::InvalidTransition {
            id: transaction.id,
            status: transaction.status,
        });
    }

    match (decision, transaction.kind) {
        (Decision::Reject, _) => Ok(balance),
        (Decision::Approve, TransactionType::Purchase) => balance
            .checked_add(transaction.cashback_amount)
            .filter(|b| *b <= MAX_AMOUNT)
            .ok_or(LedgerError::BalanceLimit(transaction.customer_id)),
        (Decision::Approve, TransactionType::Redemption) => {
            if transaction.amount > balance {
                return Err(LedgerError::InsufficientBalance {
                    available: balance,
                    requested: transaction.amount,
                });
            }
            balance
                .checked_sub(transaction.amount)
                .ok_or(LedgerError::BalanceLimit(transaction.customer_id))
        }
    }
}

/// Creates and settles purchases and redemptions.
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    geofence: GeofenceValidator,
    cashback_rate: Decimal,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, geofence: GeofenceValidator, cashback_rate: Decimal) -> Self {
        Self {
            store,
            geofence,
            cashback_rate,
        }
    }

    pub fn geofence(&self) -> &GeofenceValidator {
        &self.geofence
    }

    /// Returns the customer registered under `phone`, registering it on first contact.
    pub async fn customer_by_phone(
        &self,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Customer, LedgerError> {
        self.store
            .find_or_create_customer(phone, name)
            .await
            .map_err(LedgerError::unavailable)
    }

    pub async fn customer(&self, id: Uuid) -> Result<Customer, LedgerError> {
        self.store
            .customer(id)
            .await
            .map_err(LedgerError::unavailable)?
            .ok_or(LedgerError::CustomerNotFound(id))
    }

    pub async fn transaction(&self, id: Uuid) -> Result<Transaction, LedgerError> {
        self.store
            .transaction(id)
            .await
            .map_err(LedgerError::unavailable)?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    pub async fn create_purchase(
        &self,
        customer_id: Uuid,
        amount: Decimal,
        location: Option<Coordinates>,
    ) -> Result<Transaction, LedgerError> {
        let matched = self.check_purchase(amount, location)?;
        let customer = self.customer(customer_id).await?;
        self.record_purchase(&customer, amount, matched, location).await
    }

    /// Records a purchase for the customer registered under `phone`. The
    /// customer is only registered once the amount and location pass.
    pub async fn create_purchase_by_phone(
        &self,
        phone: &str,
        name: Option<&str>,
        amount: Decimal,
        location: Option<Coordinates>,
    ) -> Result<Transaction, LedgerError> {
        let matched = self.check_purchase(amount, location)?;
        let customer = self.customer_by_phone(phone, name).await?;
        self.record_purchase(&customer, amount, matched, location).await
    }

    fn check_purchase(
        &self,
        amount: Decimal,
        location: Option<Coordinates>,
    ) -> Result<GeofenceMatch, LedgerError> {
        check_amount(amount)?;
        self.geofence.validate(location).inspect_err(|e| {
            warn!(?location, "purchase refused by geofence: {e}");
        })
    }

    async fn record_purchase(
        &self,
        customer: &Customer,
        amount: Decimal,
        matched: GeofenceMatch,
        location: Option<Coordinates>,
    ) -> Result<Transaction, LedgerError> {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            kind: TransactionType::Purchase,
            amount,
            cashback_amount: cashback_for(amount, self.cashback_rate),
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            store_id: Some(matched.store_id),
            location,
        };
        self.insert(&transaction).await?;

        info!(
            id = %transaction.id,
            customer_id = %customer.id,
            %amount,
            store = ?transaction.store_id,
            "purchase created"
        );
        Ok(transaction)
    }

    /// Creates a pending redemption. The balance is checked again on approval.
    pub async fn create_redemption(
        &self,
        customer_id: Uuid,
        amount: Decimal,
    ) -> Result<Transaction, LedgerError> {
        check_amount(amount)?;
        let customer = self.customer(customer_id).await?;
        self.record_redemption(&customer, amount).await
    }

    /// Creates a pending redemption for the customer registered under
    /// `phone`. An unknown phone has nothing to redeem and is not registered.
    pub async fn create_redemption_by_phone(
        &self,
        phone: &str,
        amount: Decimal,
    ) -> Result<Transaction, LedgerError> {
        check_amount(amount)?;
        let customer = self
            .store
            .customer_by_phone(phone)
            .await
            .map_err(LedgerError::unavailable)?
            .ok_or_else(|| {
                warn!(%amount, "redemption for unregistered phone");
                LedgerError::InsufficientBalance {
                    available: Decimal::ZERO,
                    requested: amount,
                }
            })?;
        self.record_redemption(&customer, amount).await
    }

    async fn record_redemption(
        &self,
        customer: &Customer,
        amount: Decimal,
    ) -> Result<Transaction, LedgerError> {
        let customer_id = customer.id;
        if amount > customer.balance {
            warn!(%customer_id, %amount, balance = %customer.balance, "redemption exceeds balance");
            return Err(LedgerError::InsufficientBalance {
                available: customer.balance,
                requested: amount,
            });
        }

        let transaction = Transaction {
            id: Uuid::new_v4(),
            customer_id,
            kind: TransactionType::Redemption,
            amount,
            cashback_amount: Decimal::ZERO,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            store_id: None,
            location: None,
        };
        self.insert(&transaction).await?;

        info!(id = %transaction.id, %customer_id, %amount, "redemption created");
        Ok(transaction)
    }

    pub async fn approve(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        self.decide(id, Decision::Approve).await
    }

    pub async fn reject(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        self.decide(id, Decision::Reject).await
    }

    async fn decide(&self, id: Uuid, decision: Decision) -> Result<Settlement, LedgerError> {
        match self.store.settle(id, decision).await {
            Ok(settlement) => {
                info!(
                    %id,
                    status = %settlement.transaction.status,
                    balance = %settlement.balance,
                    "transaction settled"
                );
                Ok(settlement)
            }
            Err(e) => {
                warn!(%id, ?decision, "settlement refused: {e}");
                Err(e)
            }
        }
    }

    async fn insert(&self, transaction: &Transaction) -> Result<(), LedgerError> {
        self.store
            .insert_transaction(transaction)
            .await
            .map_err(LedgerError::unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(kind: TransactionType, amount: Decimal, cashback: Decimal) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            kind,
            amount,
            cashback_amount: cashback,
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            store_id: None,
            location: None,
        }
    }

    #[test]
    fn default_rate_is_five_percent() {
        assert_eq!(DEFAULT_CASHBACK_RATE, Decimal::new(5, 2));
        assert_eq!(
            cashback_for(Decimal::new(10000, 2), DEFAULT_CASHBACK_RATE),
            Decimal::new(500, 2)
        );
        // 0.30 * 0.05 = 0.015, midpoint rounds up
        assert_eq!(
            cashback_for(Decimal::new(30, 2), DEFAULT_CASHBACK_RATE),
            Decimal::new(2, 2)
        );
    }

    #[test]
    fn approving_a_purchase_credits_cashback() {
        let t = pending(TransactionType::Purchase, Decimal::new(10000, 2), Decimal::new(500, 2));
        assert_eq!(
            settle(&t, Decimal::ZERO, Decision::Approve).unwrap(),
            Decimal::new(500, 2)
        );
    }

    #[test]
    fn approving_a_redemption_debits_amount() {
        let t = pending(TransactionType::Redemption, Decimal::new(500, 2), Decimal::ZERO);
        assert_eq!(
            settle(&t, Decimal::new(800, 2), Decision::Approve).unwrap(),
            Decimal::new(300, 2)
        );
        assert_eq!(
            settle(&t, Decimal::new(500, 2), Decision::Approve).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn redemption_over_balance_is_refused() {
        let t = pending(TransactionType::Redemption, Decimal::new(500, 2), Decimal::ZERO);
        let err = settle(&t, Decimal::new(499, 2), Decision::Approve).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[test]
    fn rejection_never_moves_balance() {
        let t = pending(TransactionType::Redemption, Decimal::new(500, 2), Decimal::ZERO);
        assert_eq!(
            settle(&t, Decimal::ZERO, Decision::Reject).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn amounts_are_capped_at_the_column_limit() {
        assert_eq!(MAX_AMOUNT, "9999999999.99".parse::<Decimal>().unwrap());
        assert!(check_amount(MAX_AMOUNT).is_ok());
        assert!(check_amount(Decimal::new(1, 2)).is_ok());
        for bad in [Decimal::ZERO, Decimal::new(-1, 2), MAX_AMOUNT + Decimal::new(1, 2), Decimal::MAX] {
            assert!(matches!(check_amount(bad), Err(LedgerError::InvalidAmount)));
        }
    }

    #[test]
    fn credit_past_the_balance_limit_is_refused() {
        let t = pending(TransactionType::Purchase, MAX_AMOUNT, Decimal::new(100, 2));
        let err = settle(&t, MAX_AMOUNT - Decimal::new(50, 2), Decision::Approve).unwrap_err();
        assert!(matches!(err, LedgerError::BalanceLimit(id) if id == t.customer_id));

        let t = pending(TransactionType::Purchase, Decimal::ONE, Decimal::MAX);
        assert!(matches!(
            settle(&t, Decimal::MAX, Decision::Approve),
            Err(LedgerError::BalanceLimit(_))
        ));

        let t = pending(TransactionType::Purchase, Decimal::ONE, Decimal::new(50, 2));
        assert_eq!(
            settle(&t, MAX_AMOUNT - Decimal::new(50, 2), Decision::Approve).unwrap(),
            MAX_AMOUNT
        );
    }

    #[test]
    fn terminal_states_refuse_any_decision() {
        for status in [TransactionStatus::Approved, TransactionStatus::Rejected] {
            let mut t = pending(TransactionType::Purchase, Decimal::ONE, Decimal::ONE);
            t.status = status;
            for decision in [Decision::Approve, Decision::Reject] {
                assert!(matches!(
                    settle(&t, Decimal::TEN, decision),
                    Err(LedgerError::InvalidTransition { .. })
                ));
            }
        }
    }
}
