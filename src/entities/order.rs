use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orders as written by the checkout and payment flows. The table keeps every
/// historical spelling of the customer and coupon fields side by side:
///
/// | column               | document field   |
/// |----------------------|------------------|
/// | `email`              | `email`          |
/// | `user_email`         | `userEmail`      |
/// | `customer_email`     | `customerEmail`  |
/// | `coupon_code`        | `couponCode`     |
/// | `legacy_coupon_code` | `coupon_code`    |
///
/// Read-only for the coupon service; see `models::OrderRecord` for the
/// canonical shape.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: Option<String>,
    pub email: Option<String>,
    pub user_email: Option<String>,
    pub customer_email: Option<String>,
    pub coupon_code: Option<String>,
    pub legacy_coupon_code: Option<String>,
    pub status: Option<String>,
    pub total_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
