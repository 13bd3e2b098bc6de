use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::status::{PayoutStatus, ReferralStatus};
use crate::types::{Payout, Referral, User};

/// Dashboard figures for one referrer.
///
/// Cancelled referrals count towards `total_referrals` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_referrals: i64,
    pub successful_referrals: i64,
    pub pending_referrals: i64,
    /// Sum of rewards over completed referrals.
    #[serde(with = "rust_decimal::serde::float")]
    pub total_earnings: Decimal,
}

/// Dashboard figures across the whole program.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub total_users: i64,
    /// Users that created at least one referral, whatever its outcome.
    pub active_referrers: i64,
    /// Sum of completed payout amounts.
    #[serde(with = "rust_decimal::serde::float")]
    pub total_payouts: Decimal,
    pub pending_reviews: i64,
}

impl UserStats {
    pub fn from_referrals<'a>(referrals: impl IntoIterator<Item = &'a Referral>) -> Self {
        referrals
            .into_iter()
            .fold(UserStats::default(), |mut acc, r| {
                acc.total_referrals += 1;
                match r.status {
                    ReferralStatus::Completed => {
                        acc.successful_referrals += 1;
                        acc.total_earnings += r.reward_amount;
                    }
                    ReferralStatus::Pending => acc.pending_referrals += 1,
                    ReferralStatus::Cancelled => {}
                }
                acc
            })
    }
}

impl AdminStats {
    pub fn compute(users: &[User], referrals: &[Referral], payouts: &[Payout]) -> Self {
        let referrers: HashSet<i64> = referrals.iter().map(|r| r.referrer_id).collect();
        AdminStats {
            total_users: users.len() as i64,
            active_referrers: users.iter().filter(|u| referrers.contains(&u.id)).count() as i64,
            total_payouts: payouts
                .iter()
                .filter(|p| p.status == PayoutStatus::Completed)
                .map(|p| p.amount)
                .sum(),
            pending_reviews: referrals
                .iter()
                .filter(|r| r.status == ReferralStatus::Pending)
                .count() as i64,
        }
    }
}
