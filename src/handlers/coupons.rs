use crate::{
    handlers::common::{customer_email, is_retryable, parse_amount_field, validate_input},
    models::Coupon,
    services::{CouponDiscount, ReconciliationReport},
    ApiResponse, ApiResult, AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use utoipa::ToSchema;
use validator::Validate;

/// Body of the validate and apply endpoints.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CouponRequest {
    #[validate(length(min = 1, max = 64, message = "Coupon code cannot be empty"))]
    pub code: String,
    /// Order subtotal, as a JSON number or numeric string
    #[serde(default)]
    #[schema(value_type = String, example = "100.00")]
    pub amount: Value,
    /// Customer email; required when the coupon has a per-customer limit
    #[serde(default, alias = "userEmail", alias = "customerEmail")]
    #[validate(length(max = 254))]
    pub email: Option<String>,
}

pub fn coupon_routes() -> Router<AppState> {
    Router::new()
        .route("/validate", post(validate_coupon))
        .route("/apply", post(apply_coupon))
        .route("/reconcile", post(reconcile_all))
        .route("/:code", get(get_coupon))
        .route("/:code/reconcile", post(reconcile_coupon))
}

/// Preview the discount a coupon would give, without recording a use
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = CouponRequest,
    responses(
        (status = 200, description = "Coupon is valid", body = CouponDiscount),
        (status = 400, description = "Invalid amount or missing customer email", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown or inactive coupon", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon expired or exhausted", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse)
    ),
    tag = "coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(payload): Json<CouponRequest>,
) -> ApiResult<CouponDiscount> {
    validate_input(&payload)?;
    let amount = parse_amount_field(&payload.amount)?;

    let discount = state
        .coupon_service()
        .validate_coupon(&payload.code, amount, customer_email(payload.email.as_deref()))
        .await?;
    Ok(Json(ApiResponse::success(discount)))
}

/// Record one use of a coupon for a confirmed order
#[utoipa::path(
    post,
    path = "/api/v1/coupons/apply",
    request_body = CouponRequest,
    responses(
        (status = 200, description = "Coupon applied", body = CouponDiscount),
        (status = 400, description = "Invalid amount or missing customer email", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown or inactive coupon", body = crate::errors::ErrorResponse),
        (status = 409, description = "Coupon changed while being applied", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon expired or exhausted", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse)
    ),
    tag = "coupons"
)]
pub async fn apply_coupon(
    State(state): State<AppState>,
    Json(payload): Json<CouponRequest>,
) -> ApiResult<CouponDiscount> {
    validate_input(&payload)?;
    let amount = parse_amount_field(&payload.amount)?;
    let email = customer_email(payload.email.as_deref());
    let service = state.coupon_service();

    let discount = match service.apply_coupon(&payload.code, amount, email).await {
        Err(err) if is_retryable(&err) => {
            warn!(code = %payload.code, "retrying coupon application after concurrent modification");
            service.apply_coupon(&payload.code, amount, email).await?
        }
        result => result?,
    };
    Ok(Json(ApiResponse::success(discount)))
}

/// Fetch a coupon with its cached counters
#[utoipa::path(
    get,
    path = "/api/v1/coupons/{code}",
    params(("code" = String, Path, description = "Coupon code, any case")),
    responses(
        (status = 200, description = "Coupon found", body = Coupon),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse)
    ),
    tag = "coupons"
)]
pub async fn get_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<Coupon> {
    let coupon = state.coupon_service().get_coupon(&code).await?;
    Ok(Json(ApiResponse::success(coupon)))
}

/// Recompute a coupon's cached counters from order history
#[utoipa::path(
    post,
    path = "/api/v1/coupons/{code}/reconcile",
    params(("code" = String, Path, description = "Coupon code, any case")),
    responses(
        (status = 200, description = "Counters reconciled", body = ReconciliationReport),
        (status = 404, description = "Coupon not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse)
    ),
    tag = "coupons"
)]
pub async fn reconcile_coupon(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> ApiResult<ReconciliationReport> {
    let report = state.coupon_service().reconcile_usage_counts(&code).await?;
    Ok(Json(ApiResponse::success(report)))
}

/// Reconcile every coupon
#[utoipa::path(
    post,
    path = "/api/v1/coupons/reconcile",
    responses(
        (status = 200, description = "All coupons reconciled", body = [ReconciliationReport]),
        (status = 500, description = "Internal server error", body = crate::errors::ErrorResponse)
    ),
    tag = "coupons"
)]
pub async fn reconcile_all(State(state): State<AppState>) -> ApiResult<Vec<ReconciliationReport>> {
    let reports = state.coupon_service().reconcile_all().await?;
    Ok(Json(ApiResponse::success(reports)))
}
