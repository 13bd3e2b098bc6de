use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;

use super::{Storage, StoreError, StoreResult};
use crate::stats::{AdminStats, UserStats};
use crate::status::{Lifecycle, PayoutStatus, ReferralStatus};
use crate::types::{
    BankDetails, BankDetailsInput, NewPayout, NewReferral, NewUser, Payout, Referral, User,
};

const USER_COLUMNS: &str = "id, name, email, phone, password, referral_code, is_admin, created_at";
const BANK_COLUMNS: &str =
    "id, user_id, account_holder_name, bank_name, account_number, ifsc_code, created_at";
const REFERRAL_COLUMNS: &str = "id, referrer_id, referred_user_id, referred_email, referred_name, \
     status, reward_amount, created_at, completed_at";
const PAYOUT_COLUMNS: &str =
    "id, user_id, amount, status, referral_ids, created_at, completed_at";

/// Postgres-backed storage.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ReferralRow {
    id: i64,
    referrer_id: i64,
    referred_user_id: Option<i64>,
    referred_email: String,
    referred_name: String,
    status: String,
    reward_amount: Decimal,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReferralRow> for Referral {
    type Error = StoreError;

    fn try_from(row: ReferralRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ReferralStatus>()
            .map_err(|e| StoreError::Corrupt(format!("referral {}: {e}", row.id)))?;
        Ok(Referral {
            id: row.id,
            referrer_id: row.referrer_id,
            referred_user_id: row.referred_user_id,
            referred_email: row.referred_email,
            referred_name: row.referred_name,
            status,
            reward_amount: row.reward_amount,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PayoutRow {
    id: i64,
    user_id: i64,
    amount: Decimal,
    status: String,
    referral_ids: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = StoreError;

    fn try_from(row: PayoutRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<PayoutStatus>()
            .map_err(|e| StoreError::Corrupt(format!("payout {}: {e}", row.id)))?;
        let referral_ids: Vec<i64> = serde_json::from_str(&row.referral_ids)
            .map_err(|e| StoreError::Corrupt(format!("payout {} referral_ids: {e}", row.id)))?;
        Ok(Payout {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            status,
            referral_ids,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserStatsRow {
    total_referrals: i64,
    successful_referrals: i64,
    pending_referrals: i64,
    total_earnings: Decimal,
}

#[derive(sqlx::FromRow)]
struct AdminStatsRow {
    total_users: i64,
    active_referrers: i64,
    total_payouts: Decimal,
    pending_reviews: i64,
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database schema up to date");
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let created = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (name, email, phone, password, referral_code, is_admin)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.password_hash)
        .bind(&user.referral_code)
        .bind(user.is_admin)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn get_bank_details(&self, user_id: i64) -> StoreResult<Option<BankDetails>> {
        let details = sqlx::query_as::<_, BankDetails>(&format!(
            "SELECT {BANK_COLUMNS} FROM bank_details WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(details)
    }

    async fn upsert_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<BankDetails> {
        let saved = sqlx::query_as::<_, BankDetails>(&format!(
            "INSERT INTO bank_details
                 (user_id, account_holder_name, bank_name, account_number, ifsc_code)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id) DO UPDATE SET
                 account_holder_name = EXCLUDED.account_holder_name,
                 bank_name = EXCLUDED.bank_name,
                 account_number = EXCLUDED.account_number,
                 ifsc_code = EXCLUDED.ifsc_code
             RETURNING {BANK_COLUMNS}"
        ))
        .bind(user_id)
        .bind(&details.account_holder_name)
        .bind(&details.bank_name)
        .bind(&details.account_number)
        .bind(&details.ifsc_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn update_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<Option<BankDetails>> {
        let updated = sqlx::query_as::<_, BankDetails>(&format!(
            "UPDATE bank_details SET
                 account_holder_name = $2, bank_name = $3, account_number = $4, ifsc_code = $5
             WHERE user_id = $1
             RETURNING {BANK_COLUMNS}"
        ))
        .bind(user_id)
        .bind(&details.account_holder_name)
        .bind(&details.bank_name)
        .bind(&details.account_number)
        .bind(&details.ifsc_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn get_referral(&self, id: i64) -> StoreResult<Option<Referral>> {
        sqlx::query_as::<_, ReferralRow>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Referral::try_from)
        .transpose()
    }

    async fn get_referrals(&self, referrer_id: i64) -> StoreResult<Vec<Referral>> {
        let rows = sqlx::query_as::<_, ReferralRow>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referrer_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_all_referrals(&self) -> StoreResult<Vec<Referral>> {
        let rows = sqlx::query_as::<_, ReferralRow>(&format!(
            "SELECT {REFERRAL_COLUMNS} FROM referrals ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn create_referral(&self, referral: NewReferral) -> StoreResult<Referral> {
        let row = sqlx::query_as::<_, ReferralRow>(&format!(
            "INSERT INTO referrals
                 (referrer_id, referred_email, referred_name, status, reward_amount)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {REFERRAL_COLUMNS}"
        ))
        .bind(referral.referrer_id)
        .bind(&referral.referred_email)
        .bind(&referral.referred_name)
        .bind(ReferralStatus::INITIAL.as_str())
        .bind(referral.reward_amount)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update_referral_status(
        &self,
        id: i64,
        status: ReferralStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Referral>> {
        sqlx::query_as::<_, ReferralRow>(&format!(
            "UPDATE referrals SET status = $2, completed_at = $3 WHERE id = $1
             RETURNING {REFERRAL_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?
        .map(Referral::try_from)
        .transpose()
    }

    async fn link_referred_user(&self, email: &str, user_id: i64) -> StoreResult<u64> {
        let res = sqlx::query(
            "UPDATE referrals SET referred_user_id = $2
             WHERE lower(referred_email) = lower($1) AND referred_user_id IS NULL",
        )
        .bind(email)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn get_payout(&self, id: i64) -> StoreResult<Option<Payout>> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Payout::try_from)
        .transpose()
    }

    async fn get_payouts(&self, user_id: i64) -> StoreResult<Vec<Payout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE user_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn get_all_payouts(&self) -> StoreResult<Vec<Payout>> {
        let rows = sqlx::query_as::<_, PayoutRow>(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn create_payout(&self, payout: NewPayout) -> StoreResult<Payout> {
        let referral_ids = serde_json::to_string(&payout.referral_ids)
            .map_err(|e| StoreError::Corrupt(format!("referral_ids: {e}")))?;
        let row = sqlx::query_as::<_, PayoutRow>(&format!(
            "INSERT INTO payouts (user_id, amount, status, referral_ids)
             VALUES ($1, $2, $3, $4)
             RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(payout.user_id)
        .bind(payout.amount)
        .bind(PayoutStatus::INITIAL.as_str())
        .bind(referral_ids)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn update_payout_status(
        &self,
        id: i64,
        status: PayoutStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Payout>> {
        sqlx::query_as::<_, PayoutRow>(&format!(
            "UPDATE payouts SET status = $2, completed_at = $3 WHERE id = $1
             RETURNING {PAYOUT_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?
        .map(Payout::try_from)
        .transpose()
    }

    async fn covered_referral_ids(&self, referral_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let covered = sqlx::query_scalar::<_, i64>(
            r#"SELECT DISTINCT covered.id::bigint
               FROM payouts,
                    jsonb_array_elements_text(payouts.referral_ids::jsonb) AS covered(id)
               WHERE payouts.status <> 'failed'
                 AND covered.id::bigint = ANY($1)
               ORDER BY 1"#,
        )
        .bind(referral_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(covered)
    }

    async fn get_user_stats(&self, user_id: i64) -> StoreResult<UserStats> {
        let row = sqlx::query_as::<_, UserStatsRow>(
            r#"SELECT
                   count(*) AS total_referrals,
                   count(*) FILTER (WHERE status = 'completed') AS successful_referrals,
                   count(*) FILTER (WHERE status = 'pending') AS pending_referrals,
                   coalesce(sum(reward_amount) FILTER (WHERE status = 'completed'), 0)
                       AS total_earnings
               FROM referrals
               WHERE referrer_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserStats {
            total_referrals: row.total_referrals,
            successful_referrals: row.successful_referrals,
            pending_referrals: row.pending_referrals,
            total_earnings: row.total_earnings,
        })
    }

    async fn get_admin_stats(&self) -> StoreResult<AdminStats> {
        let row = sqlx::query_as::<_, AdminStatsRow>(
            r#"SELECT
                   (SELECT count(*) FROM users) AS total_users,
                   (SELECT count(*) FROM users
                     WHERE id IN (SELECT referrer_id FROM referrals)) AS active_referrers,
                   (SELECT coalesce(sum(amount) FILTER (WHERE status = 'completed'), 0)
                      FROM payouts) AS total_payouts,
                   (SELECT count(*) FROM referrals WHERE status = 'pending') AS pending_reviews"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AdminStats {
            total_users: row.total_users,
            active_referrers: row.active_referrers,
            total_payouts: row.total_payouts,
            pending_reviews: row.pending_reviews,
        })
    }
}
