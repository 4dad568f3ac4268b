//! Coupon Service Library
//!
//! Coupon validation, confirmed usage accounting and reconciliation of cached
//! usage counters against order history.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod repositories;
pub mod request_context;
pub mod services;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use utoipa::ToSchema;

use crate::config::{AppConfig, StoreBackend};
use crate::repositories::{CouponStore, InMemoryCouponStore, SeaOrmCouponStore};
use crate::services::CouponService;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    /// `None` when coupons live in the in-memory store
    pub db: Option<Arc<DatabaseConnection>>,
    pub config: AppConfig,
    pub coupons: Arc<CouponService>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Option<Arc<DatabaseConnection>>,
        store: Arc<dyn CouponStore>,
    ) -> Self {
        let coupons = Arc::new(CouponService::new(
            store,
            config.coupons.missing_identifier_policy,
        ));
        Self {
            db,
            config,
            coupons,
        }
    }

    /// Connects the configured store backend, migrating first if asked to.
    pub async fn build(config: AppConfig) -> Result<Self, errors::ServiceError> {
        match config.coupons.store {
            StoreBackend::Database => {
                let db = Arc::new(db::establish_connection_from_app_config(&config).await?);
                if config.auto_migrate {
                    db::run_migrations(&db).await?;
                }
                let store = Arc::new(SeaOrmCouponStore::new(db.clone()));
                Ok(Self::new(config, Some(db), store))
            }
            StoreBackend::InMemory => {
                tracing::warn!("Using the in-memory coupon store; nothing survives a restart");
                Ok(Self::new(config, None, Arc::new(InMemoryCouponStore::new())))
            }
        }
    }

    pub fn coupon_service(&self) -> Arc<CouponService> {
        self.coupons.clone()
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: request_context::current_request_id()
                .map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(api_status))
        .nest("/coupons", handlers::coupons::coupon_routes())
}

/// Full application router with middleware, ready to serve.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api-docs/openapi.json", get(openapi::openapi_json))
        .nest("/api/v1", api_v1_routes())
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .layer(request_context::configure_http_tracing())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        // Outermost, so every span and error body carries the request id
        .layer(axum::middleware::from_fn(
            request_context::request_id_middleware,
        ))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> ApiResult<Value> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "coupon-service",
        "environment": state.config.environment,
        "store": match state.config.coupons.store {
            StoreBackend::Database => "database",
            StoreBackend::InMemory => "in-memory",
        },
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match &state.db {
        Some(db) => match db::check_connection(db).await {
            Ok(_) => "healthy",
            Err(err) => {
                tracing::warn!(error = %err, "database health check failed");
                "unhealthy"
            }
        },
        None => "not_configured",
    };

    let health_data = json!({
        "status": if db_status == "unhealthy" { "unhealthy" } else { "healthy" },
        "checks": {
            "database": db_status,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });

    Ok(Json(ApiResponse::success(health_data)))
}

// Request logging middleware
async fn request_logging_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    tracing::debug!(method = %method, uri = %uri, "Incoming request");

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::request_context::{scope_request_id, RequestId};
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            scope_request_id(RequestId::new("meta-123"), async { ApiResponse::success("ok") })
                .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn metadata_omits_request_id_outside_a_request() {
        let response = ApiResponse::success(1);
        let meta = response.meta.expect("metadata expected");
        assert!(meta.request_id.is_none());
    }
}
