use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Coupon Service API",
        version = "1.0.0",
        description = r#"
# Coupon Service

Validates coupon codes against orders, records confirmed usage and reconciles
cached usage counters with order history.

## Error Handling

Every failure uses the same body; `code` is the machine-readable kind:

```json
{
  "error": "Unprocessable Entity",
  "code": "global_limit_exceeded",
  "message": "Coupon save10 has reached its usage limit of 2",
  "request_id": "3f1c...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "coupons", description = "Coupon validation, application and reconciliation")
    ),
    paths(
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::apply_coupon,
        crate::handlers::coupons::get_coupon,
        crate::handlers::coupons::reconcile_coupon,
        crate::handlers::coupons::reconcile_all,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::handlers::coupons::CouponRequest,
            crate::entities::DiscountType,
            crate::models::Coupon,
            crate::services::CouponDiscount,
            crate::services::ReconciliationReport,
        )
    )
)]
pub struct ApiDocV1;

/// Serves the generated OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}
