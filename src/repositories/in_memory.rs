use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CouponStore, IncrementOutcome, UsageIncrement, UsageQuery};
use crate::errors::ServiceError;
use crate::models::{normalize_code, Coupon, NewCoupon, OrderRecord};

/// Document-style store held in process memory. Coupons are keyed by
/// normalized code; orders arrive as raw JSON documents and are folded into
/// [`OrderRecord`] on the way in.
#[derive(Debug, Default)]
pub struct InMemoryCouponStore {
    coupons: DashMap<String, Coupon>,
    orders: RwLock<Vec<OrderRecord>>,
}

impl InMemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an order document exactly as the checkout flow wrote it.
    pub async fn insert_order_document(&self, document: Value) -> OrderRecord {
        let record = OrderRecord::from_document(&document);
        self.orders.write().await.push(record.clone());
        record
    }

    pub async fn insert_order_documents<I>(&self, documents: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut orders = self.orders.write().await;
        orders.extend(documents.into_iter().map(|doc| OrderRecord::from_document(&doc)));
    }

    /// Removes a coupon, as an admin would.
    pub fn remove_coupon(&self, code: &str) -> Option<Coupon> {
        self.coupons
            .remove(&normalize_code(code))
            .map(|(_, coupon)| coupon)
    }

    /// Runs `f` while holding the write lock of the coupon's shard.
    fn with_coupon<R>(&self, id: Uuid, f: impl FnOnce(&mut Coupon) -> R) -> Option<R> {
        self.coupons
            .iter_mut()
            .find(|entry| entry.id == id)
            .map(|mut entry| f(entry.value_mut()))
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        Ok(self.coupons.get(code).map(|entry| entry.value().clone()))
    }

    async fn list_coupon_codes(&self) -> Result<Vec<String>, ServiceError> {
        let mut codes: Vec<String> = self.coupons.iter().map(|e| e.key().clone()).collect();
        codes.sort();
        Ok(codes)
    }

    async fn count_usages(&self, query: UsageQuery<'_>) -> Result<u64, ServiceError> {
        let orders = self.orders.read().await;
        let count = orders
            .iter()
            .filter(|order| order.counts_toward(query.code, query.customer))
            .count();
        Ok(count as u64)
    }

    async fn orders_for_coupon(&self, code: &str) -> Result<Vec<OrderRecord>, ServiceError> {
        let orders = self.orders.read().await;
        Ok(orders
            .iter()
            .filter(|order| order.counts_toward(code, None))
            .cloned()
            .collect())
    }

    async fn increment_usage(
        &self,
        increment: UsageIncrement,
    ) -> Result<IncrementOutcome, ServiceError> {
        let outcome = self.with_coupon(increment.coupon_id, |coupon| {
            if !coupon.active {
                return IncrementOutcome::Conflict;
            }
            if let Some(limit) = coupon.global_limit() {
                if coupon.usage_count >= limit {
                    return IncrementOutcome::GlobalLimitReached;
                }
            }

            if let Some(customer) = &increment.customer {
                let current = coupon
                    .user_usages
                    .get(&customer.key)
                    .copied()
                    .unwrap_or(0)
                    .max(customer.seed);
                if let Some(limit) = coupon.per_user_limit() {
                    if current >= limit {
                        return IncrementOutcome::PerUserLimitReached;
                    }
                }
                coupon
                    .user_usages
                    .insert(customer.key.clone(), current.saturating_add(1));
            }

            coupon.usage_count = coupon.usage_count.saturating_add(1);
            coupon.updated_at = Utc::now();
            IncrementOutcome::Applied(coupon.clone())
        });

        Ok(outcome.unwrap_or(IncrementOutcome::Conflict))
    }

    async fn overwrite_usage(
        &self,
        coupon_id: Uuid,
        usage_count: u32,
        user_usages: BTreeMap<String, u32>,
    ) -> Result<Option<Coupon>, ServiceError> {
        Ok(self.with_coupon(coupon_id, |coupon| {
            coupon.usage_count = usage_count;
            coupon.user_usages = user_usages;
            coupon.updated_at = Utc::now();
            coupon.clone()
        }))
    }

    async fn insert_coupon(&self, new: NewCoupon) -> Result<Coupon, ServiceError> {
        new.check()?;
        let code = normalize_code(&new.code);
        let now = Utc::now();

        match self.coupons.entry(code.clone()) {
            Entry::Occupied(_) => Err(ServiceError::InvalidInput(format!(
                "coupon {} already exists",
                code
            ))),
            Entry::Vacant(slot) => {
                let coupon = Coupon {
                    id: Uuid::new_v4(),
                    code,
                    discount_type: new.discount_type,
                    discount_value: new.discount_value,
                    active: new.active,
                    expires_at: new.expires_at,
                    max_uses: new.max_uses,
                    max_usage_per_user: new.max_usage_per_user,
                    usage_count: new.usage_count,
                    user_usages: new.user_usages,
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(coupon.clone());
                Ok(coupon)
            }
        }
    }
}
