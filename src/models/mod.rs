pub mod coupon;
pub mod order_record;

pub use coupon::{normalize_code, normalize_email, Coupon, NewCoupon};
pub use order_record::{status_consumes_usage, OrderRecord};
