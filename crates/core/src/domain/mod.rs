pub mod action;
pub mod cart;
pub mod coupon;
pub mod item;
pub mod rule;
