use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::item::ItemId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub item_id: ItemId,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl CartLine {
    pub fn new(item_id: ItemId, quantity: u32, unit_price: Decimal) -> Self {
        Self { item_id, quantity, unit_price }
    }
}

/// Notice surfaced to the shopper after a coupon change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartNotice {
    CouponApplied { code: String, message: String },
    CouponRemoved { code: String },
}

pub const GENERIC_COUPON_APPLIED: &str = "Coupon code applied successfully.";
