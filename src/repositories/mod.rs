//! Data-access boundary for coupons and the order history they are counted
//! against.
//!
//! Every store speaks in terms of normalized codes and emails and the
//! canonical [`OrderRecord`]; how historical field variants are matched is
//! the store's business, never the caller's.

use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Coupon, NewCoupon, OrderRecord};

pub mod coupon_repository;
pub mod in_memory;

pub use coupon_repository::SeaOrmCouponStore;
pub use in_memory::InMemoryCouponStore;

/// Filter for an authoritative usage count.
#[derive(Clone, Copy, Debug)]
pub struct UsageQuery<'a> {
    /// Normalized coupon code
    pub code: &'a str,
    /// Normalized customer email; `None` counts every customer
    pub customer: Option<&'a str>,
}

/// One confirmed use of a coupon, written only if the guards still hold.
///
/// The store checks the limits stored on the coupon itself at write time, not
/// the ones the caller saw while validating.
#[derive(Clone, Debug)]
pub struct UsageIncrement {
    pub coupon_id: Uuid,
    /// Per-customer entry to bump; `None` leaves `user_usages` untouched
    pub customer: Option<CustomerIncrement>,
}

#[derive(Clone, Debug)]
pub struct CustomerIncrement {
    /// Normalized email, the key that gets written
    pub key: String,
    /// Count cached under the raw spelling of the email; seeds a new entry
    pub seed: u32,
}

/// Result of the conditional write behind `apply_coupon`.
#[derive(Clone, Debug, PartialEq)]
pub enum IncrementOutcome {
    /// Both counters were incremented; carries the updated coupon.
    Applied(Coupon),
    /// The cached global count already reached `max_uses`.
    GlobalLimitReached,
    /// The customer's cached count already reached `max_usage_per_user`.
    PerUserLimitReached,
    /// The coupon was deleted or deactivated underneath us, or another
    /// writer won a race on the same entry.
    Conflict,
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Point lookup by normalized code, active or not.
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ServiceError>;

    /// Normalized codes of every stored coupon.
    async fn list_coupon_codes(&self) -> Result<Vec<String>, ServiceError>;

    /// Orders that consumed the coupon (status not cancelled/failed),
    /// matching either coupon field and, when given, any customer field.
    async fn count_usages(&self, query: UsageQuery<'_>) -> Result<u64, ServiceError>;

    /// Every order that consumed the coupon, in canonical form.
    async fn orders_for_coupon(&self, code: &str) -> Result<Vec<OrderRecord>, ServiceError>;

    /// Atomic check-and-increment of the cached counters. Nothing is written
    /// unless every guard passes.
    async fn increment_usage(
        &self,
        increment: UsageIncrement,
    ) -> Result<IncrementOutcome, ServiceError>;

    /// Replace the cached counters wholesale. `None` when the coupon is gone.
    async fn overwrite_usage(
        &self,
        coupon_id: Uuid,
        usage_count: u32,
        user_usages: BTreeMap<String, u32>,
    ) -> Result<Option<Coupon>, ServiceError>;

    /// Store a new coupon; the code is normalized on the way in.
    async fn insert_coupon(&self, coupon: NewCoupon) -> Result<Coupon, ServiceError>;
}
