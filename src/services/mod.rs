pub mod coupons;

pub use coupons::{
    amount_from_json, parse_amount, CouponDiscount, CouponService, ReconciliationReport,
};
