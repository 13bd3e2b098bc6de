//! Referral rewards service: users share referral codes, administrators
//! review referrals and track payouts.

mod api;
mod auth;
mod config;
mod error;
mod responses;
mod stats;
mod store;
mod types;

pub mod referral_code;
pub mod status;

use anyhow::Context;
use anyhow::Result;
pub use api::init_router;
pub use auth::{SessionStore, hash_password, verify_password};
pub use crate::config::Config;
pub use error::FieldError;
pub use stats::{AdminStats, UserStats};
pub use status::{PayoutStatus, ReferralStatus};
pub use store::{MemoryStorage, PgStorage, Storage, StoreError, StoreResult};
pub use types::{
    AppState, BankDetails, BankDetailsInput, NewPayout, NewReferral, NewUser, Payout, Referral,
    User,
};
use sqlx::{PgPool, postgres::PgPoolOptions};

/// Initializes the database pool.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    Ok(pool)
}
