use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Active,
    Suspended,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub status: CouponStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_limit: Option<u32>,
    pub usage_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponRejection {
    NotFound,
    Expired,
    Suspended,
    UsageLimitReached,
    /// A manual-entry prerequisite (minimum spend, required items, ...) is unmet.
    PrerequisitesUnmet(String),
}

impl CouponRejection {
    /// Only prerequisite failures may be overridden for auto-applied coupons.
    pub fn is_overridable(&self) -> bool {
        matches!(self, Self::PrerequisitesUnmet(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponVerdict {
    Valid,
    Rejected(CouponRejection),
}

impl CouponVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl Coupon {
    pub fn active(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status: CouponStatus::Active,
            expires_at: None,
            usage_limit: None,
            usage_count: 0,
        }
    }

    /// Existence-independent checks: status, expiry and usage limit.
    pub fn basic_check(&self, now: DateTime<Utc>) -> Result<(), CouponRejection> {
        if self.status == CouponStatus::Suspended {
            return Err(CouponRejection::Suspended);
        }
        if self.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(CouponRejection::Expired);
        }
        if self.usage_limit.is_some_and(|limit| self.usage_count >= limit) {
            return Err(CouponRejection::UsageLimitReached);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Coupon, CouponRejection, CouponStatus};

    #[test]
    fn basic_check_reports_first_failing_constraint() {
        let now = Utc::now();
        assert_eq!(Coupon::active("SAVE10").basic_check(now), Ok(()));

        let mut expired = Coupon::active("OLD");
        expired.expires_at = Some(now - Duration::minutes(1));
        assert_eq!(expired.basic_check(now), Err(CouponRejection::Expired));

        let mut exhausted = Coupon::active("ONCE");
        exhausted.usage_limit = Some(1);
        exhausted.usage_count = 1;
        assert_eq!(exhausted.basic_check(now), Err(CouponRejection::UsageLimitReached));

        let mut suspended = Coupon::active("HOLD");
        suspended.status = CouponStatus::Suspended;
        assert_eq!(suspended.basic_check(now), Err(CouponRejection::Suspended));
    }

    #[test]
    fn only_prerequisite_failures_are_overridable() {
        assert!(CouponRejection::PrerequisitesUnmet("minimum spend".to_owned()).is_overridable());
        assert!(!CouponRejection::Expired.is_overridable());
        assert!(!CouponRejection::UsageLimitReached.is_overridable());
    }
}
