use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::MissingIdentifierPolicy;
use crate::errors::{CouponError, ServiceError};
use crate::models::{normalize_code, normalize_email, Coupon};
use crate::repositories::{
    CouponStore, CustomerIncrement, IncrementOutcome, UsageIncrement, UsageQuery,
};

/// Outcome of a successful validation or application.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct CouponDiscount {
    #[schema(value_type = String, example = "10.00")]
    pub discount_amount: Decimal,
    pub coupon: Coupon,
    /// Operative global usage the decision was based on (after the increment
    /// for an applied coupon)
    pub global_usage: u64,
    /// Operative usage by the requesting customer, when a per-customer limit
    /// was enforced
    pub customer_usage: Option<u64>,
}

/// What a reconciliation pass changed.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ReconciliationReport {
    pub coupon_id: Uuid,
    pub code: String,
    pub previous_usage_count: u32,
    pub usage_count: u32,
    pub previous_user_usages: BTreeMap<String, u32>,
    pub user_usages: BTreeMap<String, u32>,
}

impl ReconciliationReport {
    pub fn changed(&self) -> bool {
        self.previous_usage_count != self.usage_count
            || self.previous_user_usages != self.user_usages
    }
}

/// Customer side of a validation.
#[derive(Debug)]
struct CustomerUsage {
    key: String,
    /// Cached count under the raw spelling, when it differs from `key`
    raw_seed: u32,
    /// Operative usage, only computed when a per-customer limit exists
    usage: Option<u64>,
}

#[derive(Debug)]
struct Validated {
    coupon: Coupon,
    discount_amount: Decimal,
    global_usage: u64,
    customer: Option<CustomerUsage>,
}

/// Parses a textual amount, e.g. from a CLI flag.
pub fn parse_amount(input: &str) -> Result<Decimal, CouponError> {
    let input = input.trim();
    Decimal::from_str(input)
        .or_else(|_| Decimal::from_scientific(input))
        .map_err(|_| CouponError::InvalidAmount {
            reason: format!("'{}' is not a number", input),
        })
}

/// Accepts a JSON number or a numeric string.
pub fn amount_from_json(value: &Value) -> Result<Decimal, CouponError> {
    match value {
        Value::Number(number) => parse_amount(&number.to_string()),
        Value::String(text) => parse_amount(text),
        Value::Null => Err(CouponError::InvalidAmount {
            reason: "amount is required".into(),
        }),
        other => Err(CouponError::InvalidAmount {
            reason: format!("'{}' is not a number", other),
        }),
    }
}

/// Coupon rules: validation, confirmed application and counter
/// reconciliation.
#[derive(Clone)]
pub struct CouponService {
    store: Arc<dyn CouponStore>,
    missing_identifier_policy: MissingIdentifierPolicy,
}

impl CouponService {
    pub fn new(store: Arc<dyn CouponStore>, missing_identifier_policy: MissingIdentifierPolicy) -> Self {
        Self {
            store,
            missing_identifier_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn CouponStore> {
        &self.store
    }

    /// Preview a discount without touching any counter.
    #[instrument(skip(self, customer))]
    pub async fn validate_coupon(
        &self,
        code: &str,
        amount: Decimal,
        customer: Option<&str>,
    ) -> Result<CouponDiscount, ServiceError> {
        let validated = self.check(code, amount, customer).await.map_err(rejected)?;
        counter!("coupon_service.coupons.validated", 1);

        Ok(CouponDiscount {
            discount_amount: validated.discount_amount,
            global_usage: validated.global_usage,
            customer_usage: validated.customer.and_then(|c| c.usage),
            coupon: validated.coupon,
        })
    }

    /// Validate, then record one use through the store's conditional write.
    /// Nothing is recorded unless every limit still holds at write time.
    #[instrument(skip(self, customer))]
    pub async fn apply_coupon(
        &self,
        code: &str,
        amount: Decimal,
        customer: Option<&str>,
    ) -> Result<CouponDiscount, ServiceError> {
        let validated = self.check(code, amount, customer).await.map_err(rejected)?;
        let coupon = &validated.coupon;

        let increment = UsageIncrement {
            coupon_id: coupon.id,
            customer: validated.customer.as_ref().map(|c| CustomerIncrement {
                key: c.key.clone(),
                seed: c.raw_seed,
            }),
        };

        let outcome = self.store.increment_usage(increment).await?;
        let error = match outcome {
            IncrementOutcome::Applied(updated) => {
                counter!("coupon_service.coupons.applied", 1);
                info!(
                    code = %updated.code,
                    usage_count = updated.usage_count,
                    discount = %validated.discount_amount,
                    "coupon applied"
                );
                return Ok(CouponDiscount {
                    discount_amount: validated.discount_amount,
                    global_usage: validated.global_usage + 1,
                    customer_usage: validated
                        .customer
                        .and_then(|c| c.usage)
                        .map(|usage| usage + 1),
                    coupon: updated,
                });
            }
            IncrementOutcome::GlobalLimitReached => CouponError::GlobalLimitExceeded {
                code: coupon.code.clone(),
                limit: coupon.global_limit().unwrap_or_default(),
            },
            IncrementOutcome::PerUserLimitReached => CouponError::PerUserLimitExceeded {
                code: coupon.code.clone(),
                limit: coupon.per_user_limit().unwrap_or_default(),
            },
            IncrementOutcome::Conflict => CouponError::ConcurrentModification {
                code: coupon.code.clone(),
            },
        };

        warn!(code = %coupon.code, reason = error.code(), "coupon write rejected after validation");
        Err(rejected(error.into()))
    }

    /// Overwrite the cached counters with counts recomputed from order history.
    #[instrument(skip(self))]
    pub async fn reconcile_usage_counts(
        &self,
        code: &str,
    ) -> Result<ReconciliationReport, ServiceError> {
        let key = normalize_code(code);
        let coupon = self
            .store
            .find_coupon(&key)
            .await?
            .ok_or_else(|| CouponError::NotFound { code: key.clone() })?;

        let orders = self.store.orders_for_coupon(&coupon.code).await?;
        let usage_count = u32::try_from(orders.len()).unwrap_or(u32::MAX);

        let mut user_usages: BTreeMap<String, u32> = BTreeMap::new();
        for order in &orders {
            for email in &order.customer_emails {
                *user_usages.entry(email.clone()).or_default() += 1;
            }
        }

        let updated = self
            .store
            .overwrite_usage(coupon.id, usage_count, user_usages)
            .await?
            .ok_or_else(|| CouponError::ConcurrentModification {
                code: coupon.code.clone(),
            })?;

        let report = ReconciliationReport {
            coupon_id: coupon.id,
            code: coupon.code,
            previous_usage_count: coupon.usage_count,
            usage_count: updated.usage_count,
            previous_user_usages: coupon.user_usages,
            user_usages: updated.user_usages,
        };

        counter!("coupon_service.coupons.reconciled", 1);
        if report.changed() {
            info!(
                code = %report.code,
                previous = report.previous_usage_count,
                current = report.usage_count,
                "coupon usage counters reconciled"
            );
        } else {
            debug!(code = %report.code, "coupon usage counters already consistent");
        }
        Ok(report)
    }

    /// Reconcile every stored coupon. Coupons deleted mid-run are skipped.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>, ServiceError> {
        let codes = self.store.list_coupon_codes().await?;
        let mut reports = Vec::with_capacity(codes.len());

        for code in codes {
            match self.reconcile_usage_counts(&code).await {
                Ok(report) => reports.push(report),
                Err(ServiceError::Coupon(
                    err @ (CouponError::NotFound { .. } | CouponError::ConcurrentModification { .. }),
                )) => {
                    warn!(code = %code, error = %err, "coupon disappeared during reconciliation");
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            coupons = reports.len(),
            changed = reports.iter().filter(|r| r.changed()).count(),
            "reconciliation pass finished"
        );
        Ok(reports)
    }

    pub async fn get_coupon(&self, code: &str) -> Result<Coupon, ServiceError> {
        let key = normalize_code(code);
        self.store
            .find_coupon(&key)
            .await?
            .ok_or_else(|| CouponError::NotFound { code: key }.into())
    }

    async fn check(
        &self,
        code: &str,
        amount: Decimal,
        customer: Option<&str>,
    ) -> Result<Validated, ServiceError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(CouponError::InvalidAmount {
                reason: format!("amount {} is negative", amount),
            }
            .into());
        }

        let key = normalize_code(code);
        if key.is_empty() {
            return Err(CouponError::NotFound { code: key }.into());
        }

        let coupon = self
            .store
            .find_coupon(&key)
            .await?
            .ok_or_else(|| CouponError::NotFound { code: key.clone() })?;

        if !coupon.active {
            return Err(CouponError::Inactive { code: key }.into());
        }

        if let Some(expired_at) = coupon.expires_at.filter(|_| coupon.is_expired_at(Utc::now())) {
            return Err(CouponError::Expired {
                code: key,
                expired_at,
            }
            .into());
        }

        // The cache is only a hint; the larger of cache and live count wins.
        let authoritative = self
            .store
            .count_usages(UsageQuery {
                code: &key,
                customer: None,
            })
            .await?;
        let global_usage = authoritative.max(u64::from(coupon.usage_count));
        if authoritative != u64::from(coupon.usage_count) {
            debug!(
                code = %key,
                cached = coupon.usage_count,
                authoritative,
                "cached usage count has drifted from order history"
            );
        }

        if let Some(limit) = coupon.global_limit() {
            if global_usage >= u64::from(limit) {
                return Err(CouponError::GlobalLimitExceeded { code: key, limit }.into());
            }
        }

        let customer = customer.map(str::trim).filter(|raw| !raw.is_empty());
        let customer = match (customer, coupon.per_user_limit()) {
            (Some(raw), limit) => {
                let email = normalize_email(raw);
                let raw_seed = if raw != email {
                    coupon.user_usages.get(raw).copied().unwrap_or(0)
                } else {
                    0
                };

                let usage = match limit {
                    Some(limit) => {
                        let authoritative = self
                            .store
                            .count_usages(UsageQuery {
                                code: &key,
                                customer: Some(&email),
                            })
                            .await?;
                        let cached = coupon.cached_usage_for(raw, &email);
                        let usage = authoritative.max(u64::from(cached));
                        if usage >= u64::from(limit) {
                            return Err(CouponError::PerUserLimitExceeded { code: key, limit }.into());
                        }
                        Some(usage)
                    }
                    None => None,
                };

                Some(CustomerUsage {
                    key: email,
                    raw_seed,
                    usage,
                })
            }
            (None, Some(_)) => match self.missing_identifier_policy {
                MissingIdentifierPolicy::Require => {
                    return Err(CouponError::IdentifierRequired { code: key }.into());
                }
                MissingIdentifierPolicy::Skip => {
                    debug!(code = %key, "no customer email; per-customer limit not enforced");
                    None
                }
            },
            (None, None) => None,
        };

        let discount_amount = coupon.discount_for(amount)?;
        Ok(Validated {
            coupon,
            discount_amount,
            global_usage,
            customer,
        })
    }
}

/// Counts coupon rejections by reason on their way out.
fn rejected(err: ServiceError) -> ServiceError {
    if let Some(coupon_err) = err.coupon_error() {
        counter!("coupon_service.coupons.rejected", 1, "reason" => coupon_err.code());
        debug!(reason = coupon_err.code(), "coupon rejected");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewCoupon;
    use crate::repositories::InMemoryCouponStore;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn setup(coupon: NewCoupon) -> (CouponService, Arc<InMemoryCouponStore>) {
        setup_with_policy(coupon, MissingIdentifierPolicy::Require).await
    }

    async fn setup_with_policy(
        coupon: NewCoupon,
        policy: MissingIdentifierPolicy,
    ) -> (CouponService, Arc<InMemoryCouponStore>) {
        let store = Arc::new(InMemoryCouponStore::new());
        store.insert_coupon(coupon).await.unwrap();
        (CouponService::new(store.clone(), policy), store)
    }

    fn save10() -> NewCoupon {
        NewCoupon::percentage("SAVE10", dec!(10))
            .max_uses(2)
            .max_usage_per_user(1)
    }

    #[tokio::test]
    async fn amount_too_large_to_price_is_invalid_and_records_nothing() {
        let (service, store) = setup(NewCoupon::percentage("half", dec!(50))).await;
        let amount = amount_from_json(&json!("7e28")).unwrap();

        assert_matches!(
            service.validate_coupon("half", amount, None).await,
            Err(ServiceError::Coupon(CouponError::InvalidAmount { .. }))
        );
        assert_matches!(
            service.apply_coupon("half", amount, None).await,
            Err(ServiceError::Coupon(CouponError::InvalidAmount { .. }))
        );
        assert_eq!(store.find_coupon("half").await.unwrap().unwrap().usage_count, 0);
    }

    #[tokio::test]
    async fn save10_walkthrough() {
        let (service, _) = setup(save10()).await;

        let first = service
            .apply_coupon("SAVE10", dec!(100), Some("a@x.com"))
            .await
            .unwrap();
        assert_eq!(first.discount_amount, dec!(10));

        let again = service
            .apply_coupon("SAVE10", dec!(100), Some("a@x.com"))
            .await
            .unwrap_err();
        assert_matches!(
            again,
            ServiceError::Coupon(CouponError::PerUserLimitExceeded { limit: 1, .. })
        );

        let second = service
            .apply_coupon("SAVE10", dec!(100), Some("b@x.com"))
            .await
            .unwrap();
        assert_eq!(second.discount_amount, dec!(10));
        assert_eq!(second.coupon.usage_count, 2);

        let third = service
            .apply_coupon("SAVE10", dec!(100), Some("c@x.com"))
            .await
            .unwrap_err();
        assert_matches!(
            third,
            ServiceError::Coupon(CouponError::GlobalLimitExceeded { limit: 2, .. })
        );
    }

    #[tokio::test]
    async fn code_and_email_matching_ignore_case() {
        let (service, _) = setup(
            NewCoupon::fixed("Test3", dec!(5))
                .max_uses(10)
                .max_usage_per_user(1),
        )
        .await;

        service
            .apply_coupon("test3", dec!(20), Some("User@Example.com"))
            .await
            .unwrap();
        let err = service
            .validate_coupon("  TEST3 ", dec!(20), Some("user@example.com"))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Coupon(CouponError::PerUserLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn validate_does_not_mutate_counters() {
        let (service, store) = setup(save10()).await;
        let before = store.find_coupon("save10").await.unwrap().unwrap();

        for _ in 0..5 {
            service
                .validate_coupon("save10", dec!(40), Some("a@x.com"))
                .await
                .unwrap();
        }

        let after = store.find_coupon("save10").await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn fixed_discount_never_exceeds_amount() {
        let (service, _) = setup(NewCoupon::fixed("fifty", dec!(50))).await;
        let discount = service.validate_coupon("fifty", dec!(30), None).await.unwrap();
        assert_eq!(discount.discount_amount, dec!(30));
    }

    #[tokio::test]
    async fn order_history_outranks_a_stale_cache() {
        let (service, store) = setup(save10()).await;
        store
            .insert_order_documents([
                json!({"userEmail": "A@X.com", "couponCode": "save10", "status": "paid"}),
                json!({"email": "z@x.com", "coupon_code": "SAVE10", "status": "shipped"}),
            ])
            .await;

        let err = service
            .validate_coupon("save10", dec!(10), Some("b@x.com"))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Coupon(CouponError::GlobalLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn per_user_history_counts_across_email_fields() {
        let (service, store) = setup(
            NewCoupon::percentage("save10", dec!(10))
                .max_usage_per_user(1),
        )
        .await;
        store
            .insert_order_document(
                json!({"customerEmail": "a@x.com", "coupon_code": "save10", "status": "delivered"}),
            )
            .await;

        let err = service
            .validate_coupon("save10", dec!(10), Some("A@x.com"))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Coupon(CouponError::PerUserLimitExceeded { .. }));
        assert!(service
            .validate_coupon("save10", dec!(10), Some("b@x.com"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancelled_and_failed_orders_never_count() {
        let (service, store) = setup(save10()).await;
        store
            .insert_order_documents([
                json!({"email": "a@x.com", "couponCode": "save10", "status": "cancelled"}),
                json!({"email": "a@x.com", "couponCode": "save10", "status": "failed"}),
                json!({"email": "b@x.com", "couponCode": "save10", "status": "Cancelled"}),
            ])
            .await;

        let discount = service
            .validate_coupon("save10", dec!(50), Some("a@x.com"))
            .await
            .unwrap();
        assert_eq!(discount.global_usage, 0);
        assert_eq!(discount.customer_usage, Some(0));
    }

    #[tokio::test]
    async fn raw_cache_key_is_honoured() {
        let (service, _) = setup(
            NewCoupon::fixed("legacy", dec!(5))
                .max_usage_per_user(1)
                .cached_usage(1, &[("Ann@Example.com", 1)]),
        )
        .await;

        let err = service
            .validate_coupon("legacy", dec!(10), Some("Ann@Example.com"))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::Coupon(CouponError::PerUserLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn missing_identifier_follows_policy() {
        let (strict, _) = setup(save10()).await;
        let err = strict.validate_coupon("save10", dec!(10), None).await.unwrap_err();
        assert_matches!(err, ServiceError::Coupon(CouponError::IdentifierRequired { .. }));

        let blank = strict
            .validate_coupon("save10", dec!(10), Some("   "))
            .await
            .unwrap_err();
        assert_matches!(blank, ServiceError::Coupon(CouponError::IdentifierRequired { .. }));

        let (lenient, store) = setup_with_policy(save10(), MissingIdentifierPolicy::Skip).await;
        lenient.apply_coupon("save10", dec!(10), None).await.unwrap();
        let coupon = store.find_coupon("save10").await.unwrap().unwrap();
        assert_eq!(coupon.usage_count, 1);
        assert!(coupon.user_usages.is_empty());
    }

    #[tokio::test]
    async fn unlimited_coupon_without_customer_is_fine() {
        let (service, _) = setup(NewCoupon::percentage("open", dec!(25))).await;
        let discount = service.apply_coupon("open", dec!(80), None).await.unwrap();
        assert_eq!(discount.discount_amount, dec!(20));
        assert_eq!(discount.coupon.usage_count, 1);
    }

    #[tokio::test]
    async fn unknown_inactive_and_expired_coupons_fail() {
        let store = Arc::new(InMemoryCouponStore::new());
        store
            .insert_coupon(NewCoupon::fixed("paused", dec!(5)).inactive())
            .await
            .unwrap();
        store
            .insert_coupon(
                NewCoupon::fixed("old", dec!(5)).expires_at(Utc::now() - Duration::days(1)),
            )
            .await
            .unwrap();
        store
            .insert_coupon(
                NewCoupon::fixed("fresh", dec!(5)).expires_at(Utc::now() + Duration::days(1)),
            )
            .await
            .unwrap();
        let service = CouponService::new(store, MissingIdentifierPolicy::Require);

        assert_matches!(
            service.validate_coupon("nope", dec!(10), None).await,
            Err(ServiceError::Coupon(CouponError::NotFound { .. }))
        );
        assert_matches!(
            service.validate_coupon("", dec!(10), None).await,
            Err(ServiceError::Coupon(CouponError::NotFound { .. }))
        );
        assert_matches!(
            service.validate_coupon("PAUSED", dec!(10), None).await,
            Err(ServiceError::Coupon(CouponError::Inactive { .. }))
        );
        assert_matches!(
            service.validate_coupon("old", dec!(10), None).await,
            Err(ServiceError::Coupon(CouponError::Expired { .. }))
        );
        assert!(service.validate_coupon("fresh", dec!(10), None).await.is_ok());
    }

    #[tokio::test]
    async fn negative_amount_is_rejected() {
        let (service, _) = setup(NewCoupon::fixed("five", dec!(5))).await;
        assert_matches!(
            service.validate_coupon("five", dec!(-0.01), None).await,
            Err(ServiceError::Coupon(CouponError::InvalidAmount { .. }))
        );
        assert!(service.validate_coupon("five", dec!(0), None).await.is_ok());
    }

    #[tokio::test]
    async fn removed_coupon_is_not_found_and_conflicts_on_write() {
        let (service, store) = setup(NewCoupon::fixed("brief", dec!(5))).await;
        let coupon = service.get_coupon("brief").await.unwrap();
        store.remove_coupon("brief");

        let outcome = store
            .increment_usage(UsageIncrement {
                coupon_id: coupon.id,
                customer: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::Conflict);
        assert_matches!(
            service.apply_coupon("brief", dec!(10), None).await,
            Err(ServiceError::Coupon(CouponError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn reconcile_overwrites_drifted_counters() {
        let (service, store) = setup(
            NewCoupon::percentage("drift", dec!(10))
                .cached_usage(9, &[("Ghost@x.com", 4), ("a@x.com", 7)]),
        )
        .await;
        store
            .insert_order_documents([
                json!({"email": "a@x.com", "couponCode": "DRIFT", "status": "paid"}),
                json!({"userEmail": "A@x.com", "coupon_code": "drift"}),
                json!({"customerEmail": "b@x.com", "couponCode": "drift", "status": "shipped"}),
                json!({"email": "c@x.com", "couponCode": "drift", "status": "cancelled"}),
                json!({"couponCode": "drift", "status": "paid"}),
            ])
            .await;

        let report = service.reconcile_usage_counts("Drift").await.unwrap();
        assert!(report.changed());
        assert_eq!(report.previous_usage_count, 9);
        assert_eq!(report.usage_count, 4);

        let coupon = service.get_coupon("drift").await.unwrap();
        assert_eq!(coupon.usage_count, 4);
        assert_eq!(
            coupon.user_usages,
            BTreeMap::from([("a@x.com".to_string(), 2), ("b@x.com".to_string(), 1)])
        );

        let again = service.reconcile_usage_counts("drift").await.unwrap();
        assert!(!again.changed());
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_coupon() {
        let (service, store) = setup(NewCoupon::fixed("one", dec!(1)).cached_usage(3, &[])).await;
        store
            .insert_coupon(NewCoupon::fixed("two", dec!(2)))
            .await
            .unwrap();
        store
            .insert_order_document(json!({"email": "a@x.com", "couponCode": "two"}))
            .await;

        let reports = service.reconcile_all().await.unwrap();
        let counts: Vec<_> = reports.iter().map(|r| (r.code.as_str(), r.usage_count)).collect();
        assert_eq!(counts, vec![("one", 0), ("two", 1)]);
    }

    #[test]
    fn amounts_parse_from_text_and_json() {
        assert_eq!(parse_amount(" 19.99 ").unwrap(), dec!(19.99));
        assert_eq!(amount_from_json(&json!(100)).unwrap(), dec!(100));
        assert_eq!(amount_from_json(&json!("12.5")).unwrap(), dec!(12.5));
        assert_matches!(
            amount_from_json(&json!("ten")),
            Err(CouponError::InvalidAmount { .. })
        );
        assert_matches!(
            amount_from_json(&json!(null)),
            Err(CouponError::InvalidAmount { .. })
        );
        assert_matches!(
            amount_from_json(&json!([1])),
            Err(CouponError::InvalidAmount { .. })
        );
    }
}
