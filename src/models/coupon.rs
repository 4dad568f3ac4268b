use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::{CouponModel, CouponUserUsageModel, DiscountType};
use crate::errors::{CouponError, ServiceError};

/// Lookup form of a coupon code.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Lookup form of a customer email; also the key of `Coupon::user_usages`.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A coupon together with its cached usage counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub discount_type: DiscountType,
    #[schema(value_type = String, example = "10")]
    pub discount_value: Decimal,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 or absent means unlimited
    pub max_uses: Option<u32>,
    /// 0 or absent means unlimited
    pub max_usage_per_user: Option<u32>,
    /// Cached global counter, may drift from order history
    pub usage_count: u32,
    /// Cached per-customer counters, may drift from order history
    pub user_usages: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coupon {
    pub fn from_parts(model: CouponModel, usages: Vec<CouponUserUsageModel>) -> Self {
        let mut user_usages = BTreeMap::new();
        for usage in usages {
            let count = clamp_count(usage.usage_count);
            // Duplicate keys cannot come from the unique index, but keep the larger if they do.
            let entry = user_usages.entry(usage.customer_key).or_insert(0);
            *entry = (*entry).max(count);
        }

        Self {
            id: model.id,
            code: model.code,
            discount_type: model.discount_type,
            discount_value: model.discount_value,
            active: model.active,
            expires_at: model.expires_at,
            max_uses: model.max_uses.map(clamp_count),
            max_usage_per_user: model.max_usage_per_user.map(clamp_count),
            usage_count: clamp_count(model.usage_count),
            user_usages,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }

    /// Global cap, `None` when unlimited.
    pub fn global_limit(&self) -> Option<u32> {
        self.max_uses.filter(|limit| *limit > 0)
    }

    /// Per-customer cap, `None` when unlimited.
    pub fn per_user_limit(&self) -> Option<u32> {
        self.max_usage_per_user.filter(|limit| *limit > 0)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at < now)
    }

    /// Cached usage for a customer. Historical entries may be keyed by the raw
    /// email, so both spellings are consulted and the larger wins.
    pub fn cached_usage_for(&self, raw_email: &str, normalized_email: &str) -> u32 {
        let raw = self.user_usages.get(raw_email.trim()).copied().unwrap_or(0);
        let normalized = self.user_usages.get(normalized_email).copied().unwrap_or(0);
        raw.max(normalized)
    }

    /// Discount for an order subtotal; never more than the subtotal itself.
    /// Fails with `InvalidAmount` when the subtotal is too large to price.
    pub fn discount_for(&self, amount: Decimal) -> Result<Decimal, CouponError> {
        let discount = match self.discount_type {
            DiscountType::Percentage => amount
                .checked_mul(self.discount_value)
                .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
                .ok_or_else(|| CouponError::InvalidAmount {
                    reason: format!("{} is too large to discount", amount),
                })?,
            DiscountType::Fixed => self.discount_value,
        };

        let mut discount = discount
            .min(amount)
            .max(Decimal::ZERO)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        discount.rescale(2);
        Ok(discount)
    }
}

pub(crate) fn clamp_count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Input for seeding a coupon into a store.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct NewCoupon {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub max_usage_per_user: Option<u32>,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub user_usages: BTreeMap<String, u32>,
}

fn default_active() -> bool {
    true
}

impl NewCoupon {
    pub fn percentage(code: impl Into<String>, percent: Decimal) -> Self {
        Self::with_discount(code, DiscountType::Percentage, percent)
    }

    pub fn fixed(code: impl Into<String>, amount: Decimal) -> Self {
        Self::with_discount(code, DiscountType::Fixed, amount)
    }

    fn with_discount(code: impl Into<String>, discount_type: DiscountType, value: Decimal) -> Self {
        Self {
            code: code.into(),
            discount_type,
            discount_value: value,
            active: true,
            expires_at: None,
            max_uses: None,
            max_usage_per_user: None,
            usage_count: 0,
            user_usages: BTreeMap::new(),
        }
    }

    pub fn max_uses(mut self, limit: u32) -> Self {
        self.max_uses = Some(limit);
        self
    }

    pub fn max_usage_per_user(mut self, limit: u32) -> Self {
        self.max_usage_per_user = Some(limit);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Pre-populated cached counters, as found in imported data.
    pub fn cached_usage(mut self, total: u32, per_user: &[(&str, u32)]) -> Self {
        self.usage_count = total;
        self.user_usages = per_user
            .iter()
            .map(|(key, count)| ((*key).to_string(), *count))
            .collect();
        self
    }

    /// Field validation plus the discount-value range rules.
    pub fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;
        if normalize_code(&self.code).is_empty() {
            return Err(ServiceError::ValidationError(
                "coupon code must not be blank".into(),
            ));
        }
        if self.discount_value.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "discount_value must not be negative".into(),
            ));
        }
        if self.discount_type == DiscountType::Percentage
            && self.discount_value > Decimal::ONE_HUNDRED
        {
            return Err(ServiceError::ValidationError(
                "percentage discount_value must be between 0 and 100".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coupon(discount_type: DiscountType, value: Decimal) -> Coupon {
        let now = Utc::now();
        Coupon {
            id: Uuid::new_v4(),
            code: "test3".into(),
            discount_type,
            discount_value: value,
            active: true,
            expires_at: None,
            max_uses: Some(0),
            max_usage_per_user: None,
            usage_count: 0,
            user_usages: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fixed_discount_is_capped_at_the_subtotal() {
        let c = coupon(DiscountType::Fixed, dec!(50));
        assert_eq!(c.discount_for(dec!(30)), Ok(dec!(30)));
        assert_eq!(c.discount_for(dec!(80)), Ok(dec!(50)));
    }

    #[test]
    fn percentage_discount_rounds_to_cents() {
        let c = coupon(DiscountType::Percentage, dec!(15));
        assert_eq!(c.discount_for(dec!(100)), Ok(dec!(15)));
        assert_eq!(c.discount_for(dec!(19.99)), Ok(dec!(3.00)));
        assert_eq!(c.discount_for(dec!(0)), Ok(dec!(0)));
    }

    #[test]
    fn oversized_subtotal_is_an_invalid_amount() {
        let c = coupon(DiscountType::Percentage, dec!(50));
        let amount = Decimal::from_scientific("7e28").expect("fits in a decimal");
        assert!(matches!(
            c.discount_for(amount),
            Err(CouponError::InvalidAmount { .. })
        ));

        let fixed = coupon(DiscountType::Fixed, dec!(5));
        assert_eq!(fixed.discount_for(Decimal::MAX), Ok(dec!(5.00)));
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let mut c = coupon(DiscountType::Fixed, dec!(5));
        assert_eq!(c.global_limit(), None);
        assert_eq!(c.per_user_limit(), None);
        c.max_usage_per_user = Some(2);
        assert_eq!(c.per_user_limit(), Some(2));
    }

    #[test]
    fn cached_usage_reads_raw_and_normalized_keys() {
        let mut c = coupon(DiscountType::Fixed, dec!(5));
        c.user_usages.insert("User@Example.com".into(), 2);
        c.user_usages.insert("user@example.com".into(), 1);
        assert_eq!(c.cached_usage_for(" User@Example.com ", "user@example.com"), 2);
        assert_eq!(c.cached_usage_for("other@example.com", "other@example.com"), 0);
    }

    #[test]
    fn from_parts_clamps_negative_counters() {
        let now = Utc::now();
        let model = CouponModel {
            id: Uuid::new_v4(),
            code: "save10".into(),
            discount_type: DiscountType::Percentage,
            discount_value: dec!(10),
            active: true,
            expires_at: None,
            max_uses: Some(-1),
            max_usage_per_user: None,
            usage_count: -3,
            created_at: now,
            updated_at: now,
        };
        let c = Coupon::from_parts(model, vec![]);
        assert_eq!(c.usage_count, 0);
        assert_eq!(c.global_limit(), None);
    }

    #[test]
    fn percentage_over_one_hundred_is_rejected() {
        assert!(NewCoupon::percentage("big", dec!(120)).check().is_err());
        assert!(NewCoupon::fixed("neg", dec!(-1)).check().is_err());
        assert!(NewCoupon::fixed("   ", dec!(1)).check().is_err());
        assert!(NewCoupon::percentage("ok", dec!(100)).check().is_ok());
    }
}
