use serde::Serialize;
use serde_json::Value;

use super::coupon::{normalize_code, normalize_email};
use crate::entities::OrderModel;

/// Document fields that have identified the purchasing customer over time.
pub const CUSTOMER_FIELDS: [&str; 3] = ["email", "userEmail", "customerEmail"];

/// Document fields that have referenced the applied coupon over time.
pub const COUPON_FIELDS: [&str; 2] = ["couponCode", "coupon_code"];

/// Order statuses that never consume coupon usage.
pub const NON_CONSUMING_STATUSES: [&str; 2] = ["cancelled", "failed"];

/// Whether an order with this status counts as a coupon use.
/// Any status other than cancelled/failed counts, including a missing one.
pub fn status_consumes_usage(status: Option<&str>) -> bool {
    match status {
        Some(status) => {
            let status = status.trim().to_lowercase();
            !NON_CONSUMING_STATUSES.contains(&status.as_str())
        }
        None => true,
    }
}

/// Canonical order shape. Every historical field variant is folded in here,
/// so coupon rules never look at raw field names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OrderRecord {
    pub id: Option<String>,
    /// Normalized, de-duplicated
    pub customer_emails: Vec<String>,
    /// Normalized, de-duplicated
    pub coupon_codes: Vec<String>,
    pub status: Option<String>,
}

impl OrderRecord {
    pub fn from_document(doc: &Value) -> Self {
        let id = doc.get("_id").or_else(|| doc.get("id")).and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });

        Self {
            id,
            customer_emails: collect_normalized(
                CUSTOMER_FIELDS.iter().map(|f| doc.get(*f).and_then(Value::as_str)),
                normalize_email,
            ),
            coupon_codes: collect_normalized(
                COUPON_FIELDS.iter().map(|f| doc.get(*f).and_then(Value::as_str)),
                normalize_code,
            ),
            status: doc
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// `code` must already be normalized.
    pub fn references(&self, code: &str) -> bool {
        self.coupon_codes.iter().any(|c| c == code)
    }

    /// `email` must already be normalized.
    pub fn belongs_to(&self, email: &str) -> bool {
        self.customer_emails.iter().any(|e| e == email)
    }

    pub fn consumes_usage(&self) -> bool {
        status_consumes_usage(self.status.as_deref())
    }

    /// Whether this order is one use of `code`, optionally by `customer`.
    pub fn counts_toward(&self, code: &str, customer: Option<&str>) -> bool {
        self.consumes_usage()
            && self.references(code)
            && customer.map_or(true, |email| self.belongs_to(email))
    }
}

impl From<OrderModel> for OrderRecord {
    fn from(model: OrderModel) -> Self {
        Self {
            id: Some(model.id.to_string()),
            customer_emails: collect_normalized(
                [
                    model.email.as_deref(),
                    model.user_email.as_deref(),
                    model.customer_email.as_deref(),
                ],
                normalize_email,
            ),
            coupon_codes: collect_normalized(
                [
                    model.coupon_code.as_deref(),
                    model.legacy_coupon_code.as_deref(),
                ],
                normalize_code,
            ),
            status: model.status,
        }
    }
}

fn collect_normalized<'a, I>(values: I, normalize: fn(&str) -> String) -> Vec<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut out: Vec<String> = Vec::new();
    for value in values.into_iter().flatten() {
        let value = normalize(value);
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
