use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// Error body returned by every HTTP endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Unprocessable Entity",
    "code": "per_user_limit_exceeded",
    "message": "Coupon save10 has already been used the maximum of 1 time(s) by this customer",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    #[schema(example = "Not Found")]
    pub error: String,
    /// Machine-readable error kind
    #[schema(example = "not_found")]
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Request identifier propagated from `x-request-id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Typed coupon failures. Every rejection the coupon rules can produce is one
/// of these; the caller decides how to phrase it for the customer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouponError {
    #[error("Coupon {code} not found")]
    NotFound { code: String },

    #[error("Coupon {code} is not active")]
    Inactive { code: String },

    #[error("Coupon {code} expired at {expired_at}")]
    Expired {
        code: String,
        expired_at: DateTime<Utc>,
    },

    #[error("Coupon {code} has reached its usage limit of {limit}")]
    GlobalLimitExceeded { code: String, limit: u32 },

    #[error("Coupon {code} has already been used the maximum of {limit} time(s) by this customer")]
    PerUserLimitExceeded { code: String, limit: u32 },

    #[error("Coupon {code} is limited per customer; a customer email is required")]
    IdentifierRequired { code: String },

    #[error("Coupon {code} changed while it was being applied")]
    ConcurrentModification { code: String },

    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },
}

impl CouponError {
    /// Stable machine-readable code for API responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Inactive { .. } => "inactive",
            Self::Expired { .. } => "expired",
            Self::GlobalLimitExceeded { .. } => "global_limit_exceeded",
            Self::PerUserLimitExceeded { .. } => "per_user_limit_exceeded",
            Self::IdentifierRequired { .. } => "identifier_required",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InvalidAmount { .. } => "invalid_amount",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            // Inactive coupons look exactly like unknown ones to shoppers.
            Self::NotFound { .. } | Self::Inactive { .. } => StatusCode::NOT_FOUND,
            Self::Expired { .. }
            | Self::GlobalLimitExceeded { .. }
            | Self::PerUserLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::IdentifierRequired { .. } | Self::InvalidAmount { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::ConcurrentModification { .. } => StatusCode::CONFLICT,
        }
    }

    /// Only concurrent modification is worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error(transparent)]
    Coupon(#[from] CouponError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// The coupon rule that rejected the request, if that is what happened.
    pub fn coupon_error(&self) -> Option<&CouponError> {
        match self {
            Self::Coupon(err) => Some(err),
            _ => None,
        }
    }

    /// Machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Coupon(err) => err.code(),
            Self::DatabaseError(_) => "database_error",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Coupon(err) => err.status_code(),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: crate::request_context::current_request_id().map(|rid| rid.to_string()),
            timestamp: Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
