use crate::errors::{CouponError, ServiceError};
use rust_decimal::Decimal;
use serde_json::Value;
use validator::Validate;

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input
        .validate()
        .map_err(|e| ServiceError::ValidationError(format!("Validation failed: {}", e)))
}

/// Amount from a JSON body field that may be a number or a numeric string
pub fn parse_amount_field(value: &Value) -> Result<Decimal, ServiceError> {
    crate::services::amount_from_json(value).map_err(ServiceError::from)
}

/// Email from the body, with blank values treated as absent
pub fn customer_email(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|email| !email.is_empty())
}

pub fn is_retryable(err: &ServiceError) -> bool {
    err.coupon_error().map_or(false, CouponError::is_retryable)
}
