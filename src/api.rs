use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, ApiErrorWithMeta, E_BAD_RANGE, E_NOT_FOUND};
use crate::geofence::GeofenceMatch;
use crate::ledger::{Ledger, Settlement};
use crate::metrics::{DateRange, MetricsAggregator, MetricsReport, RangePreset, TransactionQuery};
use crate::responses::{ApiOk, Pagination, RequestMeta, meta_middleware};
use crate::types::{
    Coordinates, StoreLocation, Transaction, TransactionType, TransactionWithCustomer,
};

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The transaction ledger.
    pub ledger: Arc<Ledger>,
    /// The metrics pipeline.
    pub metrics: Arc<MetricsAggregator>,
    /// The application configuration.
    pub config: Config,
}

/// The request to record a purchase.
#[derive(Deserialize)]
pub struct CreatePurchaseRequest {
    /// The phone number identifying the customer.
    pub phone: String,
    /// The customer's name, stored on first contact.
    pub name: Option<String>,
    /// The purchase amount.
    pub amount: Decimal,
    /// The latitude reported by the device.
    pub latitude: Option<f64>,
    /// The longitude reported by the device.
    pub longitude: Option<f64>,
}

/// The request to redeem cashback.
#[derive(Deserialize)]
pub struct CreateRedemptionRequest {
    /// The phone number identifying the customer.
    pub phone: String,
    /// The amount to redeem.
    pub amount: Decimal,
}

/// A device location to check against the store geofences.
#[derive(Deserialize)]
pub struct GeofenceCheckRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// The reporting period and listing filters.
#[derive(Deserialize)]
pub struct RangeParams {
    /// A named period. Defaults to today.
    pub range: Option<RangePreset>,
    /// First day of a custom period. Overrides `range` together with `end`.
    pub start: Option<NaiveDate>,
    /// Last day of a custom period.
    pub end: Option<NaiveDate>,
    /// Only list transactions of this type.
    #[serde(rename = "type")]
    pub kind: Option<TransactionType>,
    /// The 1-based page of the transaction listing.
    pub page: Option<usize>,
}

impl RangeParams {
    fn resolve(&self) -> Result<DateRange, ApiError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => DateRange::days(start, end)
                .ok_or_else(|| ApiError::BadRequest("start must not be after end".into())),
            (None, None) => Ok(self.range.unwrap_or(RangePreset::Today).resolve(Utc::now())),
            _ => Err(ApiError::BadRequest(
                "custom range needs both start and end".into(),
            )),
        }
    }
}

/// The response for a customer's balance.
#[derive(Serialize)]
pub struct BalanceResponse {
    /// The ID of the customer.
    pub customer_id: Uuid,
    /// The customer's balance.
    pub balance: Decimal,
}

fn location(latitude: Option<f64>, longitude: Option<f64>) -> Option<Coordinates> {
    Some(Coordinates::new(latitude?, longitude?))
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stores", get(stores_handler))
        .route("/geofence/check", post(geofence_check_handler))
        .route("/customers/{id}/balance", get(get_balance_handler))
        .route("/purchases", post(create_purchase_handler))
        .route("/redemptions", post(create_redemption_handler))
        .route("/transactions", get(list_transactions_handler))
        .route("/transactions/{id}", get(get_transaction_handler))
        .route("/transactions/{id}/approve", post(approve_handler))
        .route("/transactions/{id}/reject", post(reject_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/latest", get(latest_metrics_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn stores_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiOk<Vec<StoreLocation>> {
    ApiOk::ok(
        "stores fetched",
        st.ledger.geofence().stores().to_vec(),
        meta,
    )
}

async fn geofence_check_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<GeofenceCheckRequest>,
) -> Result<ApiOk<GeofenceMatch>, ApiErrorWithMeta> {
    let matched = st
        .ledger
        .geofence()
        .validate(location(req.latitude, req.longitude))
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("location accepted", matched, meta))
}

async fn get_balance_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<BalanceResponse>, ApiErrorWithMeta> {
    let customer = st
        .ledger
        .customer(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok(
        "balance fetched",
        BalanceResponse {
            customer_id: customer.id,
            balance: customer.balance,
        },
        meta,
    ))
}

async fn create_purchase_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreatePurchaseRequest>,
) -> Result<ApiOk<Transaction>, ApiErrorWithMeta> {
    let transaction = st
        .ledger
        .create_purchase_by_phone(
            &req.phone,
            req.name.as_deref(),
            req.amount,
            location(req.latitude, req.longitude),
        )
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::created("purchase created", transaction, meta))
}

async fn create_redemption_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateRedemptionRequest>,
) -> Result<ApiOk<Transaction>, ApiErrorWithMeta> {
    let transaction = st
        .ledger
        .create_redemption_by_phone(&req.phone, req.amount)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::created("redemption created", transaction, meta))
}

async fn get_transaction_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Transaction>, ApiErrorWithMeta> {
    let transaction = st
        .ledger
        .transaction(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("transaction fetched", transaction, meta))
}

async fn approve_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Settlement>, ApiErrorWithMeta> {
    let settlement = st
        .ledger
        .approve(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("transaction approved", settlement, meta))
}

async fn reject_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Settlement>, ApiErrorWithMeta> {
    let settlement = st
        .ledger
        .reject(id)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("transaction rejected", settlement, meta))
}

async fn list_transactions_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Query(params): Query<RangeParams>,
) -> Result<ApiOk<Vec<TransactionWithCustomer>>, ApiErrorWithMeta> {
    let range = params
        .resolve()
        .map_err(|e| e.with_meta(meta.clone()).with_code(E_BAD_RANGE))?;
    let query = TransactionQuery {
        kind: params.kind,
        page: params.page.unwrap_or(1),
    };

    let page = st
        .metrics
        .transactions(range, query)
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;
    let pagination = Pagination::from(&page);

    Ok(ApiOk::ok("transactions fetched", page.items, meta).paginated(pagination))
}

async fn metrics_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Query(params): Query<RangeParams>,
) -> Result<ApiOk<MetricsReport>, ApiErrorWithMeta> {
    let range = params
        .resolve()
        .map_err(|e| e.with_meta(meta.clone()).with_code(E_BAD_RANGE))?;

    let report = st
        .metrics
        .refresh(range, Utc::now())
        .await
        .map_err(|e| e.with_meta(meta.clone()))?;

    Ok(ApiOk::ok("metrics computed", report.as_ref().clone(), meta))
}

async fn latest_metrics_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<MetricsReport>, ApiErrorWithMeta> {
    let report = st.metrics.latest().await.ok_or_else(|| {
        ApiError::NotFound("no metrics computed yet".into())
            .with_meta(meta.clone())
            .with_code(E_NOT_FOUND)
    })?;

    Ok(ApiOk::ok("latest metrics", report.as_ref().clone(), meta))
}
