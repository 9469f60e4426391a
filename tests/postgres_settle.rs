//! Settlement against a live Postgres. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;

use cashback_ledger::ledger::DEFAULT_CASHBACK_RATE;
use cashback_ledger::store::PgStore;
use cashback_ledger::types::{Coordinates, TransactionStatus};
use cashback_ledger::{GeofenceValidator, Ledger, LedgerError, init_pool};
use rust_decimal::Decimal;
use uuid::Uuid;

const STORE1: Coordinates = Coordinates {
    latitude: -3.859981833155958,
    longitude: -38.63311136233465,
};

const SCHEMA: [&str; 2] = [
    r#"CREATE TABLE IF NOT EXISTS customers (
        id      UUID PRIMARY KEY,
        name    TEXT,
        phone   TEXT NOT NULL UNIQUE,
        balance NUMERIC(12, 2) NOT NULL DEFAULT 0 CHECK (balance >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transactions (
        id              UUID PRIMARY KEY,
        customer_id     UUID NOT NULL REFERENCES customers (id),
        type            TEXT NOT NULL,
        amount          NUMERIC(12, 2) NOT NULL CHECK (amount > 0),
        cashback_amount NUMERIC(12, 2) NOT NULL DEFAULT 0,
        status          TEXT NOT NULL DEFAULT 'pending',
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        store_id        TEXT,
        latitude        DOUBLE PRECISION,
        longitude       DOUBLE PRECISION
    )"#,
];

async fn pg_ledger() -> Ledger {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = init_pool(&url, 8).await.unwrap();
    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    Ledger::new(
        Arc::new(PgStore::new(pool)),
        GeofenceValidator::default(),
        DEFAULT_CASHBACK_RATE,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs DATABASE_URL"]
async fn row_locks_serialize_competing_redemptions() {
    let ledger = Arc::new(pg_ledger().await);
    let phone = format!("test-{}", Uuid::new_v4());
    let customer = ledger.customer_by_phone(&phone, None).await.unwrap();

    let purchase = ledger
        .create_purchase(customer.id, Decimal::new(10000, 2), Some(STORE1))
        .await
        .unwrap();
    let settled = ledger.approve(purchase.id).await.unwrap();
    assert_eq!(settled.balance, Decimal::new(500, 2));

    let mut pending = Vec::new();
    for _ in 0..2 {
        let r = ledger
            .create_redemption(customer.id, Decimal::new(400, 2))
            .await
            .unwrap();
        pending.push(r.id);
    }

    let handles: Vec<_> = pending
        .iter()
        .map(|&id| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.approve(id).await })
        })
        .collect();
    let mut approved = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => approved += 1,
            Err(LedgerError::InsufficientBalance { .. }) => refused += 1,
            Err(e) => panic!("unexpected settlement error: {e}"),
        }
    }
    assert_eq!((approved, refused), (1, 1));

    let balance = ledger.customer(customer.id).await.unwrap().balance;
    assert_eq!(balance, Decimal::new(100, 2));

    let statuses: Vec<_> = statuses_of(&ledger, &pending).await;
    assert!(statuses.contains(&TransactionStatus::Approved));
    assert!(statuses.contains(&TransactionStatus::Pending));

    assert!(matches!(
        ledger.approve(purchase.id).await,
        Err(LedgerError::InvalidTransition { .. })
    ));
}

async fn statuses_of(ledger: &Ledger, ids: &[Uuid]) -> Vec<TransactionStatus> {
    let mut statuses = Vec::new();
    for &id in ids {
        statuses.push(ledger.transaction(id).await.unwrap().status);
    }
    statuses
}
