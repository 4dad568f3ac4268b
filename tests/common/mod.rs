#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use coupon_service::{
    config::{AppConfig, StoreBackend},
    db,
    entities::OrderActiveModel,
    errors::ServiceError,
    models::{Coupon, NewCoupon, OrderRecord},
    repositories::{
        CouponStore, IncrementOutcome, InMemoryCouponStore, SeaOrmCouponStore, UsageIncrement,
        UsageQuery,
    },
    AppState,
};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    // Every connection to `sqlite::memory:` is its own database
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg
}

/// Fresh migrated SQLite database.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let pool = db::establish_connection_from_app_config(&test_config())
        .await
        .expect("failed to create test database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations in tests");
    Arc::new(pool)
}

pub async fn setup_store() -> (Arc<DatabaseConnection>, Arc<SeaOrmCouponStore>) {
    let db = setup_db().await;
    let store = Arc::new(SeaOrmCouponStore::new(db.clone()));
    (db, store)
}

/// An order row; every field spelling is optional, as in legacy data.
#[derive(Default)]
pub struct OrderSeed {
    pub email: Option<&'static str>,
    pub user_email: Option<&'static str>,
    pub customer_email: Option<&'static str>,
    pub coupon_code: Option<&'static str>,
    pub legacy_coupon_code: Option<&'static str>,
    pub status: Option<&'static str>,
}

pub async fn insert_order(db: &DatabaseConnection, seed: OrderSeed) {
    OrderActiveModel {
        id: Set(Uuid::new_v4()),
        order_number: Set(Some(format!("ORD-{}", &Uuid::new_v4().simple().to_string()[..8]))),
        email: Set(seed.email.map(str::to_string)),
        user_email: Set(seed.user_email.map(str::to_string)),
        customer_email: Set(seed.customer_email.map(str::to_string)),
        coupon_code: Set(seed.coupon_code.map(str::to_string)),
        legacy_coupon_code: Set(seed.legacy_coupon_code.map(str::to_string)),
        status: Set(seed.status.map(str::to_string)),
        total_amount: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("insert order");
}

/// Application router over an arbitrary store.
pub fn test_app(db: Option<Arc<DatabaseConnection>>, store: Arc<dyn CouponStore>) -> Router {
    let mut cfg = test_config();
    if db.is_none() {
        cfg.coupons.store = StoreBackend::InMemory;
    }
    coupon_service::app(AppState::new(cfg, db, store))
}

pub async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => builder.body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// In-memory store whose conditional write always loses the race, as if the
/// coupon changed between validation and the increment.
#[derive(Default)]
pub struct ConflictingStore {
    inner: InMemoryCouponStore,
    writes: AtomicUsize,
}

impl ConflictingStore {
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CouponStore for ConflictingStore {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        self.inner.find_coupon(code).await
    }

    async fn list_coupon_codes(&self) -> Result<Vec<String>, ServiceError> {
        self.inner.list_coupon_codes().await
    }

    async fn count_usages(&self, query: UsageQuery<'_>) -> Result<u64, ServiceError> {
        self.inner.count_usages(query).await
    }

    async fn orders_for_coupon(&self, code: &str) -> Result<Vec<OrderRecord>, ServiceError> {
        self.inner.orders_for_coupon(code).await
    }

    async fn increment_usage(
        &self,
        _increment: UsageIncrement,
    ) -> Result<IncrementOutcome, ServiceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(IncrementOutcome::Conflict)
    }

    async fn overwrite_usage(
        &self,
        coupon_id: Uuid,
        usage_count: u32,
        user_usages: BTreeMap<String, u32>,
    ) -> Result<Option<Coupon>, ServiceError> {
        self.inner
            .overwrite_usage(coupon_id, usage_count, user_usages)
            .await
    }

    async fn insert_coupon(&self, coupon: NewCoupon) -> Result<Coupon, ServiceError> {
        self.inner.insert_coupon(coupon).await
    }
}
