use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::{Alias, Expr, Func, IntoColumnRef, SimpleExpr},
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
    TransactionTrait,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CouponStore, IncrementOutcome, UsageIncrement, UsageQuery};
use crate::entities::{
    coupon, coupon_user_usage, order, CouponActiveModel, CouponEntity, CouponModel,
    CouponUserUsageActiveModel, CouponUserUsageEntity, OrderEntity,
};
use crate::errors::ServiceError;
use crate::models::order_record::NON_CONSUMING_STATUSES;
use crate::models::{normalize_code, Coupon, NewCoupon, OrderRecord};

/// `CouponStore` over a SQL database (Postgres or SQLite) through sea-orm.
#[derive(Clone, Debug)]
pub struct SeaOrmCouponStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmCouponStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn load<C: ConnectionTrait>(conn: &C, model: CouponModel) -> Result<Coupon, DbErr> {
        let usages = CouponUserUsageEntity::find()
            .filter(coupon_user_usage::Column::CouponId.eq(model.id))
            .all(conn)
            .await?;
        Ok(Coupon::from_parts(model, usages))
    }
}

/// `LOWER(TRIM(col))`, so stored values compare the way normalized input does.
fn normalized<C: IntoColumnRef>(col: C) -> SimpleExpr {
    Func::lower(Func::cust(Alias::new("TRIM")).arg(Expr::col(col))).into()
}

fn coupon_matches(code: &str) -> Condition {
    Condition::any()
        .add(Expr::expr(normalized(order::Column::CouponCode)).eq(code))
        .add(Expr::expr(normalized(order::Column::LegacyCouponCode)).eq(code))
}

fn customer_matches(email: &str) -> Condition {
    Condition::any()
        .add(Expr::expr(normalized(order::Column::Email)).eq(email))
        .add(Expr::expr(normalized(order::Column::UserEmail)).eq(email))
        .add(Expr::expr(normalized(order::Column::CustomerEmail)).eq(email))
}

/// A NULL status still counts, so it has to be admitted explicitly.
fn consumes_usage() -> Condition {
    Condition::any()
        .add(order::Column::Status.is_null())
        .add(Expr::expr(normalized(order::Column::Status)).is_not_in(NON_CONSUMING_STATUSES))
}

fn usage_condition(query: UsageQuery<'_>) -> Condition {
    let mut condition = Condition::all()
        .add(coupon_matches(query.code))
        .add(consumes_usage());
    if let Some(customer) = query.customer {
        condition = condition.add(customer_matches(customer));
    }
    condition
}

fn to_db_count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl CouponStore for SeaOrmCouponStore {
    async fn find_coupon(&self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        let model = CouponEntity::find()
            .filter(Expr::expr(normalized(coupon::Column::Code)).eq(code))
            .one(self.db.as_ref())
            .await?;

        match model {
            Some(model) => Ok(Some(Self::load(self.db.as_ref(), model).await?)),
            None => Ok(None),
        }
    }

    async fn list_coupon_codes(&self) -> Result<Vec<String>, ServiceError> {
        let codes = CouponEntity::find()
            .select_only()
            .column(coupon::Column::Code)
            .order_by_asc(coupon::Column::Code)
            .into_tuple::<String>()
            .all(self.db.as_ref())
            .await?;
        Ok(codes)
    }

    async fn count_usages(&self, query: UsageQuery<'_>) -> Result<u64, ServiceError> {
        let count = OrderEntity::find()
            .filter(usage_condition(query))
            .count(self.db.as_ref())
            .await?;
        debug!(code = query.code, customer = ?query.customer, count, "counted coupon usage");
        Ok(count)
    }

    async fn orders_for_coupon(&self, code: &str) -> Result<Vec<OrderRecord>, ServiceError> {
        let orders = OrderEntity::find()
            .filter(usage_condition(UsageQuery {
                code,
                customer: None,
            }))
            .order_by_asc(order::Column::CreatedAt)
            .all(self.db.as_ref())
            .await?;
        Ok(orders.into_iter().map(OrderRecord::from).collect())
    }

    async fn increment_usage(
        &self,
        increment: UsageIncrement,
    ) -> Result<IncrementOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        // Check and increment in a single statement; the row stays locked
        // until commit, which also serializes the per-customer write below.
        let updated = CouponEntity::update_many()
            .col_expr(
                coupon::Column::UsageCount,
                Expr::col(coupon::Column::UsageCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(now))
            .filter(coupon::Column::Id.eq(increment.coupon_id))
            .filter(coupon::Column::Active.eq(true))
            .filter(
                Condition::any()
                    .add(coupon::Column::MaxUses.is_null())
                    .add(coupon::Column::MaxUses.lte(0))
                    .add(
                        Expr::col(coupon::Column::UsageCount)
                            .lt(Expr::col(coupon::Column::MaxUses)),
                    ),
            )
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            let current = CouponEntity::find_by_id(increment.coupon_id)
                .one(&txn)
                .await?;
            txn.rollback().await?;
            return Ok(match current {
                Some(model) if model.active => IncrementOutcome::GlobalLimitReached,
                _ => IncrementOutcome::Conflict,
            });
        }

        let Some(model) = CouponEntity::find_by_id(increment.coupon_id)
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(IncrementOutcome::Conflict);
        };

        if let Some(customer) = increment.customer {
            let limit = model.max_usage_per_user.filter(|limit| *limit > 0);
            let seed = to_db_count(customer.seed);
            if limit.map_or(false, |limit| seed >= limit) {
                txn.rollback().await?;
                return Ok(IncrementOutcome::PerUserLimitReached);
            }

            // Raise the normalized entry to the raw-key seed; the guard below
            // then sees max(normalized, raw).
            if seed > 0 {
                CouponUserUsageEntity::update_many()
                    .col_expr(coupon_user_usage::Column::UsageCount, Expr::value(seed))
                    .filter(coupon_user_usage::Column::CouponId.eq(increment.coupon_id))
                    .filter(coupon_user_usage::Column::CustomerKey.eq(customer.key.as_str()))
                    .filter(coupon_user_usage::Column::UsageCount.lt(seed))
                    .exec(&txn)
                    .await?;
            }

            let mut bump = CouponUserUsageEntity::update_many()
                .col_expr(
                    coupon_user_usage::Column::UsageCount,
                    Expr::col(coupon_user_usage::Column::UsageCount).add(1),
                )
                .col_expr(coupon_user_usage::Column::UpdatedAt, Expr::value(now))
                .filter(coupon_user_usage::Column::CouponId.eq(increment.coupon_id))
                .filter(coupon_user_usage::Column::CustomerKey.eq(customer.key.as_str()));
            if let Some(limit) = limit {
                bump = bump.filter(coupon_user_usage::Column::UsageCount.lt(limit));
            }

            if bump.exec(&txn).await?.rows_affected == 0 {
                let existing = CouponUserUsageEntity::find()
                    .filter(coupon_user_usage::Column::CouponId.eq(increment.coupon_id))
                    .filter(coupon_user_usage::Column::CustomerKey.eq(customer.key.as_str()))
                    .one(&txn)
                    .await?;
                if existing.is_some() {
                    txn.rollback().await?;
                    return Ok(IncrementOutcome::PerUserLimitReached);
                }

                let entry = CouponUserUsageActiveModel {
                    id: Set(Uuid::new_v4()),
                    coupon_id: Set(increment.coupon_id),
                    customer_key: Set(customer.key.clone()),
                    usage_count: Set(seed.saturating_add(1)),
                    updated_at: Set(now),
                };
                if let Err(err) = entry.insert(&txn).await {
                    txn.rollback().await?;
                    return match err.sql_err() {
                        Some(SqlErr::UniqueConstraintViolation(_)) => {
                            warn!(
                                coupon_id = %increment.coupon_id,
                                customer = %customer.key,
                                "concurrent first use of coupon by the same customer"
                            );
                            Ok(IncrementOutcome::Conflict)
                        }
                        _ => Err(err.into()),
                    };
                }
            }
        }

        let coupon = Self::load(&txn, model).await?;
        txn.commit().await?;
        Ok(IncrementOutcome::Applied(coupon))
    }

    async fn overwrite_usage(
        &self,
        coupon_id: Uuid,
        usage_count: u32,
        user_usages: BTreeMap<String, u32>,
    ) -> Result<Option<Coupon>, ServiceError> {
        let txn = self.db.begin().await?;
        let Some(model) = CouponEntity::find_by_id(coupon_id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let mut active: CouponActiveModel = model.into();
        active.usage_count = Set(to_db_count(usage_count));
        active.updated_at = Set(now);
        let model = active.update(&txn).await?;

        CouponUserUsageEntity::delete_many()
            .filter(coupon_user_usage::Column::CouponId.eq(coupon_id))
            .exec(&txn)
            .await?;

        if !user_usages.is_empty() {
            let rows = user_usages
                .into_iter()
                .map(|(customer_key, count)| CouponUserUsageActiveModel {
                    id: Set(Uuid::new_v4()),
                    coupon_id: Set(coupon_id),
                    customer_key: Set(customer_key),
                    usage_count: Set(to_db_count(count)),
                    updated_at: Set(now),
                });
            CouponUserUsageEntity::insert_many(rows).exec(&txn).await?;
        }

        let coupon = Self::load(&txn, model).await?;
        txn.commit().await?;
        Ok(Some(coupon))
    }

    async fn insert_coupon(&self, new: NewCoupon) -> Result<Coupon, ServiceError> {
        new.check()?;
        let code = normalize_code(&new.code);
        if self.find_coupon(&code).await?.is_some() {
            return Err(ServiceError::InvalidInput(format!(
                "coupon {} already exists",
                code
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let txn = self.db.begin().await?;

        let model = CouponActiveModel {
            id: Set(id),
            code: Set(code),
            discount_type: Set(new.discount_type),
            discount_value: Set(new.discount_value),
            active: Set(new.active),
            expires_at: Set(new.expires_at),
            max_uses: Set(new.max_uses.map(to_db_count)),
            max_usage_per_user: Set(new.max_usage_per_user.map(to_db_count)),
            usage_count: Set(to_db_count(new.usage_count)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        if !new.user_usages.is_empty() {
            let rows = new
                .user_usages
                .into_iter()
                .map(|(customer_key, count)| CouponUserUsageActiveModel {
                    id: Set(Uuid::new_v4()),
                    coupon_id: Set(id),
                    customer_key: Set(customer_key),
                    usage_count: Set(to_db_count(count)),
                    updated_at: Set(now),
                });
            CouponUserUsageEntity::insert_many(rows).exec(&txn).await?;
        }

        let coupon = Self::load(&txn, model).await?;
        txn.commit().await?;
        Ok(coupon)
    }
}
