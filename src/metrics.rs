//! Period metrics and per-customer profiles.
//!
//! Everything here is recomputed per request from the transaction set. Only
//! approved transactions contribute to money totals. Segmentation always
//! looks at each customer's full history relative to "now", while the money
//! totals are scoped to the requested period.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::segment::{self, ActivityStatus};
use crate::store::LedgerStore;
use crate::types::{Customer, Transaction, TransactionType, TransactionWithCustomer};

/// Page size of the transaction listing.
pub const TRANSACTIONS_PER_PAGE: usize = 10;

/// A closed interval of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Returns `None` when `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// From the first instant of `first` through the last millisecond of `last`.
    pub fn days(first: NaiveDate, last: NaiveDate) -> Option<Self> {
        Self::new(start_of_day(first), end_of_day(last))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date) + Duration::days(1) - Duration::milliseconds(1)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

/// Named reporting periods, resolved against "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RangePreset {
    #[serde(rename = "today")]
    Today,
    #[serde(rename = "yesterday")]
    Yesterday,
    #[serde(rename = "last7days")]
    Last7Days,
    #[serde(rename = "last30days")]
    Last30Days,
    #[serde(rename = "thisMonth")]
    ThisMonth,
    #[serde(rename = "lastMonth")]
    LastMonth,
}

impl RangePreset {
    pub fn resolve(self, now: DateTime<Utc>) -> DateRange {
        let today = now.date_naive();
        let (first, last) = match self {
            RangePreset::Today => (today, today),
            RangePreset::Yesterday => {
                let yesterday = today - Duration::days(1);
                (yesterday, yesterday)
            }
            RangePreset::Last7Days => (today - Duration::days(7), today),
            RangePreset::Last30Days => (today - Duration::days(30), today),
            RangePreset::ThisMonth => {
                let first = first_of_month(today);
                let next = first_of_month(first + Duration::days(31));
                (first, next - Duration::days(1))
            }
            RangePreset::LastMonth => {
                let last = first_of_month(today) - Duration::days(1);
                (first_of_month(last), last)
            }
        };
        DateRange {
            start: start_of_day(first),
            end: end_of_day(last),
        }
    }
}

/// Derived purchase history of one customer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CustomerMetrics {
    pub total_purchases: usize,
    pub total_spent: Decimal,
    pub cashback_accrued: Decimal,
    pub last_purchase: Option<DateTime<Utc>>,
    pub status: ActivityStatus,
}

/// Folds the approved purchases of `customer` found in `transactions`.
pub fn compute_customer_metrics<'a>(
    customer: &Customer,
    transactions: impl IntoIterator<Item = &'a Transaction>,
    now: DateTime<Utc>,
) -> CustomerMetrics {
    let mut total_purchases = 0;
    let mut total_spent = Decimal::ZERO;
    let mut cashback_accrued = Decimal::ZERO;
    let mut last_purchase: Option<DateTime<Utc>> = None;

    for t in transactions
        .into_iter()
        .filter(|t| t.customer_id == customer.id && t.is_approved_purchase())
    {
        total_purchases += 1;
        total_spent += t.amount;
        cashback_accrued += t.cashback_amount;
        last_purchase = last_purchase.max(Some(t.created_at));
    }

    CustomerMetrics {
        total_purchases,
        total_spent,
        cashback_accrued,
        last_purchase,
        status: segment::classify(last_purchase, now),
    }
}

/// Aggregate business metrics for a period.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodMetrics {
    pub total_revenue: Decimal,
    pub total_cashback: Decimal,
    pub total_redemptions: Decimal,
    pub average_ticket: Decimal,
    /// Percentage of issued cashback that was redeemed.
    pub redemption_rate: Decimal,
    /// Approved purchases in the period.
    pub total_transactions: usize,
    pub total_customers: usize,
    pub active_customers: usize,
    pub at_risk_customers: usize,
    pub inactive_customers: usize,
    pub cashback_per_customer: Decimal,
    /// Percentage of customers that are at risk.
    pub at_risk_share: Decimal,
}

fn ratio(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Computes period totals from `period` and tier counts from `statuses`.
pub fn compute_period_metrics<'a>(
    period: impl IntoIterator<Item = &'a Transaction>,
    statuses: &[ActivityStatus],
) -> PeriodMetrics {
    let mut total_revenue = Decimal::ZERO;
    let mut total_cashback = Decimal::ZERO;
    let mut total_redemptions = Decimal::ZERO;
    let mut total_transactions = 0usize;

    for t in period {
        if t.is_approved_purchase() {
            total_revenue += t.amount;
            total_cashback += t.cashback_amount;
            total_transactions += 1;
        } else if t.is_approved_redemption() {
            total_redemptions += t.amount;
        }
    }

    let count = |s: ActivityStatus| statuses.iter().filter(|x| **x == s).count();
    let total_customers = statuses.len();
    let at_risk_customers = count(ActivityStatus::AtRisk);
    let customers = Decimal::from(total_customers);

    PeriodMetrics {
        total_revenue,
        total_cashback,
        total_redemptions,
        average_ticket: ratio(total_revenue, Decimal::from(total_transactions)),
        redemption_rate: ratio(total_redemptions, total_cashback) * Decimal::ONE_HUNDRED,
        total_transactions,
        total_customers,
        active_customers: count(ActivityStatus::Active),
        at_risk_customers,
        inactive_customers: count(ActivityStatus::Inactive),
        cashback_per_customer: ratio(total_cashback, customers),
        at_risk_share: ratio(Decimal::from(at_risk_customers), customers) * Decimal::ONE_HUNDRED,
    }
}

/// One row of the customer profile and activity views.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CustomerProfile {
    pub customer_id: Uuid,
    pub name: Option<String>,
    pub phone: String,
    pub balance: Decimal,
    pub total_purchases: usize,
    pub total_spent: Decimal,
    pub average_ticket: Decimal,
    pub cashback_accrued: Decimal,
    pub last_purchase: Option<DateTime<Utc>>,
    pub status: ActivityStatus,
    pub last_activity: String,
}

impl CustomerProfile {
    pub fn new(customer: &Customer, metrics: CustomerMetrics, now: DateTime<Utc>) -> Self {
        Self {
            customer_id: customer.id,
            name: customer.name.clone(),
            phone: customer.phone.clone(),
            balance: customer.balance,
            total_purchases: metrics.total_purchases,
            total_spent: metrics.total_spent,
            average_ticket: ratio(metrics.total_spent, Decimal::from(metrics.total_purchases)),
            cashback_accrued: metrics.cashback_accrued,
            last_purchase: metrics.last_purchase,
            status: metrics.status,
            last_activity: last_activity_label(metrics.last_purchase, now),
        }
    }
}

pub fn last_activity_label(last_purchase: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match last_purchase.map(|t| segment::days_since(t, now)) {
        None => "never purchased".to_string(),
        Some(d) if d <= 0 => "today".to_string(),
        Some(1) => "yesterday".to_string(),
        Some(d) => format!("{d} days ago"),
    }
}

/// Profiles ordered by total spent, highest first.
pub fn by_total_spent(mut profiles: Vec<CustomerProfile>) -> Vec<CustomerProfile> {
    profiles.sort_by(|a, b| b.total_spent.cmp(&a.total_spent));
    profiles
}

/// Profiles ordered by last purchase, most recent first. Customers who never
/// purchased sort as if their last purchase was at the Unix epoch.
pub fn by_recent_activity(mut profiles: Vec<CustomerProfile>) -> Vec<CustomerProfile> {
    profiles.sort_by_key(|p| Reverse(p.last_purchase.unwrap_or(DateTime::UNIX_EPOCH)));
    profiles
}

/// A fully computed report. Never partially populated.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub range: DateRange,
    pub generated_at: DateTime<Utc>,
    pub metrics: PeriodMetrics,
    /// Sorted by total spent.
    pub profiles: Vec<CustomerProfile>,
    /// Sorted by most recent purchase.
    pub activity: Vec<CustomerProfile>,
}

/// Builds a report from already-fetched data.
pub fn build_report(
    range: DateRange,
    history: &[TransactionWithCustomer],
    customers: &[Customer],
    now: DateTime<Utc>,
) -> MetricsReport {
    let mut by_customer: HashMap<Uuid, Vec<&Transaction>> = HashMap::new();
    for row in history {
        by_customer
            .entry(row.transaction.customer_id)
            .or_default()
            .push(&row.transaction);
    }

    let profiles: Vec<CustomerProfile> = customers
        .iter()
        .map(|c| {
            let own = by_customer.get(&c.id).map(Vec::as_slice).unwrap_or_default();
            let metrics = compute_customer_metrics(c, own.iter().copied(), now);
            CustomerProfile::new(c, metrics, now)
        })
        .collect();

    let statuses: Vec<ActivityStatus> = profiles.iter().map(|p| p.status).collect();
    let period = history
        .iter()
        .map(|row| &row.transaction)
        .filter(|t| range.contains(t.created_at));
    let metrics = compute_period_metrics(period, &statuses);

    MetricsReport {
        range,
        generated_at: now,
        metrics,
        activity: by_recent_activity(profiles.clone()),
        profiles: by_total_spent(profiles),
    }
}

/// Which transactions to list.
#[derive(Debug, Clone, Copy)]
pub struct TransactionQuery {
    pub kind: Option<TransactionType>,
    /// 1-based page number.
    pub page: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub items: Vec<TransactionWithCustomer>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

/// Slices an already newest-first listing into one page.
pub fn paginate(rows: Vec<TransactionWithCustomer>, query: TransactionQuery) -> TransactionPage {
    let filtered: Vec<_> = rows
        .into_iter()
        .filter(|r| query.kind.is_none_or(|k| r.transaction.kind == k))
        .collect();
    let total = filtered.len();
    let total_pages = total.div_ceil(TRANSACTIONS_PER_PAGE);
    let page = query.page.max(1);

    let items = filtered
        .into_iter()
        .skip((page - 1).saturating_mul(TRANSACTIONS_PER_PAGE))
        .take(TRANSACTIONS_PER_PAGE)
        .collect();

    TransactionPage {
        items,
        page,
        per_page: TRANSACTIONS_PER_PAGE,
        total,
        total_pages,
    }
}

/// Pulls data from the store and keeps the last report that computed cleanly.
pub struct MetricsAggregator {
    store: Arc<dyn LedgerStore>,
    latest: RwLock<Option<Arc<MetricsReport>>>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            latest: RwLock::new(None),
        }
    }

    /// Computes a fresh report for `range`. On a fetch failure the previous
    /// report is left in place and `DataUnavailable` is returned.
    pub async fn refresh(
        &self,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Result<Arc<MetricsReport>, LedgerError> {
        let history = self.store.transactions(None).await.map_err(|e| {
            warn!("metrics refresh aborted while loading transactions");
            LedgerError::unavailable(e)
        })?;
        let customers = self.store.customers().await.map_err(|e| {
            warn!("metrics refresh aborted while loading customers");
            LedgerError::unavailable(e)
        })?;

        let report = Arc::new(build_report(range, &history, &customers, now));
        debug!(
            customers = customers.len(),
            transactions = history.len(),
            "metrics refreshed"
        );
        *self.latest.write().await = Some(Arc::clone(&report));
        Ok(report)
    }

    /// The last successfully computed report, if any.
    pub async fn latest(&self) -> Option<Arc<MetricsReport>> {
        self.latest.read().await.clone()
    }

    pub async fn transactions(
        &self,
        range: DateRange,
        query: TransactionQuery,
    ) -> Result<TransactionPage, LedgerError> {
        let rows = self
            .store
            .transactions(Some(range))
            .await
            .map_err(LedgerError::unavailable)?;
        Ok(paginate(rows, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionStatus;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn customer(phone: &str) -> Customer {
        Customer {
            id: Uuid::new_v4(),
            name: None,
            phone: phone.to_string(),
            balance: Decimal::ZERO,
        }
    }

    fn tx(
        owner: &Customer,
        kind: TransactionType,
        status: TransactionStatus,
        cents: i64,
        days_ago: i64,
    ) -> Transaction {
        let amount = Decimal::new(cents, 2);
        Transaction {
            id: Uuid::new_v4(),
            customer_id: owner.id,
            kind,
            amount,
            cashback_amount: match kind {
                TransactionType::Purchase => amount * Decimal::new(5, 2),
                TransactionType::Redemption => Decimal::ZERO,
            },
            status,
            created_at: now() - Duration::days(days_ago),
            store_id: None,
            location: None,
        }
    }

    fn joined(owner: &Customer, t: Transaction) -> TransactionWithCustomer {
        TransactionWithCustomer {
            transaction: t,
            customer: owner.clone(),
        }
    }

    #[test]
    fn period_totals_follow_approved_transactions() {
        let c = customer("1");
        let approved = TransactionStatus::Approved;
        let period = vec![
            tx(&c, TransactionType::Purchase, approved, 10000, 0),
            tx(&c, TransactionType::Purchase, approved, 20000, 0),
            tx(&c, TransactionType::Redemption, approved, 500, 0),
            tx(&c, TransactionType::Purchase, TransactionStatus::Pending, 99900, 0),
            tx(&c, TransactionType::Redemption, TransactionStatus::Rejected, 700, 0),
        ];

        let m = compute_period_metrics(&period, &[ActivityStatus::Active]);
        assert_eq!(m.total_revenue, Decimal::new(30000, 2));
        assert_eq!(m.total_cashback, Decimal::new(1500, 2));
        assert_eq!(m.total_redemptions, Decimal::new(500, 2));
        assert_eq!(m.average_ticket, Decimal::new(15000, 2));
        assert_eq!(m.total_transactions, 2);
        assert_eq!(m.redemption_rate.round_dp(1), Decimal::new(333, 1));
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let m = compute_period_metrics(std::iter::empty(), &[]);
        assert_eq!(m.average_ticket, Decimal::ZERO);
        assert_eq!(m.redemption_rate, Decimal::ZERO);
        assert_eq!(m.cashback_per_customer, Decimal::ZERO);
        assert_eq!(m.at_risk_share, Decimal::ZERO);
    }

    #[test]
    fn customer_metrics_only_count_approved_purchases() {
        let c = customer("1");
        let other = customer("2");
        let history = vec![
            tx(&c, TransactionType::Purchase, TransactionStatus::Approved, 10000, 5),
            tx(&c, TransactionType::Purchase, TransactionStatus::Approved, 5000, 2),
            tx(&c, TransactionType::Purchase, TransactionStatus::Rejected, 7000, 0),
            tx(&c, TransactionType::Redemption, TransactionStatus::Approved, 100, 0),
            tx(&other, TransactionType::Purchase, TransactionStatus::Approved, 100, 0),
        ];

        let m = compute_customer_metrics(&c, &history, now());
        assert_eq!(m.total_purchases, 2);
        assert_eq!(m.total_spent, Decimal::new(15000, 2));
        assert_eq!(m.cashback_accrued, Decimal::new(750, 2));
        assert_eq!(m.last_purchase, Some(now() - Duration::days(2)));
        assert_eq!(m.status, ActivityStatus::Active);
    }

    #[test]
    fn report_scopes_money_to_period_but_segments_on_full_history() {
        let recent = customer("recent");
        let lapsing = customer("lapsing");
        let idle = customer("idle");
        let history = vec![
            joined(&recent, tx(&recent, TransactionType::Purchase, TransactionStatus::Approved, 1000, 0)),
            joined(&lapsing, tx(&lapsing, TransactionType::Purchase, TransactionStatus::Approved, 90000, 5)),
        ];
        let range = RangePreset::Today.resolve(now());

        let report = build_report(range, &history, &[idle.clone(), lapsing.clone(), recent.clone()], now());

        assert_eq!(report.metrics.total_revenue, Decimal::new(1000, 2));
        assert_eq!(report.metrics.total_customers, 3);
        assert_eq!(report.metrics.active_customers, 1);
        assert_eq!(report.metrics.at_risk_customers, 1);
        assert_eq!(report.metrics.inactive_customers, 1);

        let by_spent: Vec<_> = report.profiles.iter().map(|p| p.customer_id).collect();
        assert_eq!(by_spent, vec![lapsing.id, recent.id, idle.id]);

        let by_activity: Vec<_> = report.activity.iter().map(|p| p.customer_id).collect();
        assert_eq!(by_activity, vec![recent.id, lapsing.id, idle.id]);
        assert_eq!(report.activity[2].last_activity, "never purchased");
        assert_eq!(report.activity[1].last_activity, "5 days ago");
    }

    #[test]
    fn presets_cover_whole_days() {
        let r = RangePreset::Today.resolve(now());
        assert_eq!(r.start, Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap());
        assert_eq!(
            r.end,
            Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 59).unwrap() + Duration::milliseconds(999)
        );

        let r = RangePreset::Yesterday.resolve(now());
        assert_eq!(r.start.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 14).unwrap());
        assert_eq!(r.end.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 14).unwrap());

        let r = RangePreset::Last7Days.resolve(now());
        assert_eq!(r.start.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 8).unwrap());
        assert_eq!(r.end.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
    }

    #[test]
    fn month_presets_handle_year_boundaries() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();

        let r = RangePreset::ThisMonth.resolve(jan);
        assert_eq!(r.start.date_naive(), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(r.end.date_naive(), NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());

        let r = RangePreset::LastMonth.resolve(jan);
        assert_eq!(r.start.date_naive(), NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        assert_eq!(r.end.date_naive(), NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());

        let feb = Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap();
        let r = RangePreset::ThisMonth.resolve(feb);
        assert_eq!(r.end.date_naive(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn custom_range_rejects_inverted_bounds() {
        let a = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert!(DateRange::days(a, b).is_some());
        assert!(DateRange::days(b, a).is_none());
        assert!(DateRange::days(a, a).is_some());
    }

    #[test]
    fn pagination_filters_by_type_and_slices() {
        let c = customer("1");
        let rows: Vec<_> = (0..23)
            .map(|i| {
                let kind = if i % 2 == 0 {
                    TransactionType::Purchase
                } else {
                    TransactionType::Redemption
                };
                joined(&c, tx(&c, kind, TransactionStatus::Pending, 100, 0))
            })
            .collect();

        let page = paginate(rows.clone(), TransactionQuery { kind: None, page: 3 });
        assert_eq!(page.total, 23);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 3);

        let page = paginate(
            rows,
            TransactionQuery {
                kind: Some(TransactionType::Purchase),
                page: 0,
            },
        );
        assert_eq!(page.page, 1);
        assert_eq!(page.total, 12);
        assert_eq!(page.total_pages, 2);
        assert!(page
            .items
            .iter()
            .all(|r| r.transaction.kind == TransactionType::Purchase));
    }

    #[test]
    fn pages_past_the_end_are_empty() {
        let c = customer("1");
        let rows: Vec<_> = (0..3)
            .map(|_| joined(&c, tx(&c, TransactionType::Purchase, TransactionStatus::Pending, 100, 0)))
            .collect();

        let page = paginate(rows, TransactionQuery { kind: None, page: usize::MAX });
        assert!(page.items.is_empty());
        assert_eq!(page.page, usize::MAX);
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 1);

        let page = paginate(Vec::new(), TransactionQuery { kind: None, page: usize::MAX });
        assert!(page.items.is_empty());
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn activity_labels() {
        assert_eq!(last_activity_label(None, now()), "never purchased");
        assert_eq!(last_activity_label(Some(now()), now()), "today");
        assert_eq!(
            last_activity_label(Some(now() - Duration::hours(30)), now()),
            "yesterday"
        );
        assert_eq!(
            last_activity_label(Some(now() - Duration::days(9)), now()),
            "9 days ago"
        );
    }
}
