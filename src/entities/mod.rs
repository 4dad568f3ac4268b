pub mod coupon;
pub mod coupon_user_usage;
pub mod order;

pub use coupon::{
    ActiveModel as CouponActiveModel, DiscountType, Entity as CouponEntity, Model as CouponModel,
};
pub use coupon_user_usage::{
    ActiveModel as CouponUserUsageActiveModel, Entity as CouponUserUsageEntity,
    Model as CouponUserUsageModel,
};
pub use order::{ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel};
