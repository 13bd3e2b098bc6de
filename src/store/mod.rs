//! Persistence layer.
//!
//! Handlers only see [`Storage`]. [`PgStorage`] is the production adapter;
//! [`MemoryStorage`] backs tests and local experiments.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use crate::stats::{AdminStats, UserStats};
use crate::status::{PayoutStatus, ReferralStatus};
use crate::types::{
    BankDetails, BankDetailsInput, NewPayout, NewReferral, NewUser, Payout, Referral, User,
};

/// SQLSTATE for unique_violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {constraint:?}")]
    UniqueViolation { constraint: Option<String> },
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                return StoreError::UniqueViolation {
                    constraint: db_err.constraint().map(str::to_string),
                };
            }
        }
        StoreError::Database(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn get_user(&self, id: i64) -> StoreResult<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    /// Fails with [`StoreError::UniqueViolation`] on a duplicate email or
    /// referral code.
    async fn create_user(&self, user: NewUser) -> StoreResult<User>;

    async fn get_bank_details(&self, user_id: i64) -> StoreResult<Option<BankDetails>>;
    /// Inserts the user's bank details, replacing any existing row.
    async fn upsert_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<BankDetails>;
    /// Returns `None` when the user has no bank details yet.
    async fn update_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<Option<BankDetails>>;

    async fn get_referral(&self, id: i64) -> StoreResult<Option<Referral>>;
    /// The user's referrals, newest first.
    async fn get_referrals(&self, referrer_id: i64) -> StoreResult<Vec<Referral>>;
    /// All referrals, newest first.
    async fn get_all_referrals(&self) -> StoreResult<Vec<Referral>>;
    async fn create_referral(&self, referral: NewReferral) -> StoreResult<Referral>;
    async fn update_referral_status(
        &self,
        id: i64,
        status: ReferralStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Referral>>;
    /// Attaches `user_id` to unlinked referrals addressed to `email`.
    /// Returns the number of referrals linked.
    async fn link_referred_user(&self, email: &str, user_id: i64) -> StoreResult<u64>;

    async fn get_payout(&self, id: i64) -> StoreResult<Option<Payout>>;
    /// The user's payouts, newest first.
    async fn get_payouts(&self, user_id: i64) -> StoreResult<Vec<Payout>>;
    /// All payouts, newest first.
    async fn get_all_payouts(&self) -> StoreResult<Vec<Payout>>;
    async fn create_payout(&self, payout: NewPayout) -> StoreResult<Payout>;
    async fn update_payout_status(
        &self,
        id: i64,
        status: PayoutStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Payout>>;
    /// Those of `referral_ids` already listed on a payout that has not
    /// failed, ascending.
    async fn covered_referral_ids(&self, referral_ids: &[i64]) -> StoreResult<Vec<i64>>;

    async fn get_user_stats(&self, user_id: i64) -> StoreResult<UserStats>;
    async fn get_admin_stats(&self) -> StoreResult<AdminStats>;
}
