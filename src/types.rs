use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::auth::SessionStore;
use crate::config::Config;
use crate::error::{FieldError, field_errors};
use crate::status::{PayoutStatus, ReferralStatus};
use crate::store::Storage;

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The persistence handle.
    pub storage: Arc<dyn Storage>,
    /// Live login sessions.
    pub sessions: SessionStore,
    /// The application configuration.
    pub config: Config,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, config: Config) -> Self {
        Self {
            storage,
            sessions: SessionStore::default(),
            config,
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, Serialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Argon2 PHC string, never sent to clients.
    #[serde(skip_serializing)]
    pub password: String,
    pub referral_code: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Payout destination of a user. At most one per user.
#[derive(Debug, Clone, Serialize, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BankDetails {
    pub id: i64,
    pub user_id: i64,
    pub account_holder_name: String,
    pub bank_name: String,
    pub account_number: String,
    pub ifsc_code: String,
    pub created_at: DateTime<Utc>,
}

/// One recruitment attempt by a referrer.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    /// Set once the referred person registers.
    pub referred_user_id: Option<i64>,
    pub referred_email: String,
    pub referred_name: String,
    pub status: ReferralStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub reward_amount: Decimal,
    pub created_at: DateTime<Utc>,
    /// Non-null iff `status` is completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A reward disbursement covering one or more completed referrals.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub id: i64,
    pub user_id: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub status: PayoutStatus,
    pub referral_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to insert a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub referral_code: String,
    pub is_admin: bool,
}

/// Validated bank details as supplied by the owner.
#[derive(Debug, Clone, PartialEq)]
pub struct BankDetailsInput {
    pub account_holder_name: String,
    pub bank_name: String,
    pub account_number: String,
    pub ifsc_code: String,
}

/// Fields needed to insert a referral. Status is always pending on insert.
#[derive(Debug, Clone)]
pub struct NewReferral {
    pub referrer_id: i64,
    pub referred_email: String,
    pub referred_name: String,
    pub reward_amount: Decimal,
}

/// Fields needed to insert a payout. Status is always pending on insert.
#[derive(Debug, Clone)]
pub struct NewPayout {
    pub user_id: i64,
    pub amount: Decimal,
    pub referral_ids: Vec<i64>,
}

/// Trims an optional text field. Blank input stays present so that length
/// rules can report it.
fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string())
}

fn check(req: &impl Validate) -> Result<(), Vec<FieldError>> {
    req.validate().map_err(|errors| field_errors(&errors))
}

/// The request to register a new account.
#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub name: Option<String>,
    #[validate(required(message = "required"), email(message = "invalid email"))]
    pub email: Option<String>,
    pub phone: Option<String>,
    #[validate(
        required(message = "required"),
        length(min = 8, message = "must be at least 8 characters")
    )]
    pub password: Option<String>,
}

/// Registration fields after validation. The password is still plaintext.
#[derive(Debug)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub password: String,
}

impl RegisterRequest {
    pub fn into_registration(self) -> Result<Registration, Vec<FieldError>> {
        let req = RegisterRequest {
            name: trimmed(self.name),
            email: trimmed(self.email),
            phone: trimmed(self.phone).filter(|p| !p.is_empty()),
            password: self.password,
        };
        check(&req)?;
        Ok(Registration {
            name: req.name.unwrap_or_default(),
            email: req.email.unwrap_or_default().to_lowercase(),
            phone: req.phone,
            password: req.password.unwrap_or_default(),
        })
    }
}

/// The request to open a session.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// The body of POST/PUT /api/bank-details.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BankDetailsRequest {
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub account_holder_name: Option<String>,
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub bank_name: Option<String>,
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub account_number: Option<String>,
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub ifsc_code: Option<String>,
}

impl BankDetailsRequest {
    pub fn into_input(self) -> Result<BankDetailsInput, Vec<FieldError>> {
        let req = BankDetailsRequest {
            account_holder_name: trimmed(self.account_holder_name),
            bank_name: trimmed(self.bank_name),
            account_number: trimmed(self.account_number),
            ifsc_code: trimmed(self.ifsc_code),
        };
        check(&req)?;
        Ok(BankDetailsInput {
            account_holder_name: req.account_holder_name.unwrap_or_default(),
            bank_name: req.bank_name.unwrap_or_default(),
            account_number: req.account_number.unwrap_or_default(),
            ifsc_code: req.ifsc_code.unwrap_or_default().to_uppercase(),
        })
    }
}

/// The body of POST /api/referrals. Unknown fields such as `status` or
/// `rewardAmount` are ignored.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateReferralRequest {
    #[validate(required(message = "required"), email(message = "invalid email"))]
    pub referred_email: Option<String>,
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must not be empty")
    )]
    pub referred_name: Option<String>,
}

impl CreateReferralRequest {
    pub fn into_new_referral(
        self,
        referrer_id: i64,
        reward_amount: Decimal,
    ) -> Result<NewReferral, Vec<FieldError>> {
        let req = CreateReferralRequest {
            referred_email: trimmed(self.referred_email),
            referred_name: trimmed(self.referred_name),
        };
        check(&req)?;
        Ok(NewReferral {
            referrer_id,
            referred_email: req.referred_email.unwrap_or_default().to_lowercase(),
            referred_name: req.referred_name.unwrap_or_default(),
            reward_amount,
        })
    }
}

/// The body of the admin status PATCH endpoints.
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: Option<serde_json::Value>,
}

impl StatusUpdateRequest {
    /// The requested status as text, if it is a string at all.
    pub fn status_str(&self) -> Option<&str> {
        self.status.as_ref().and_then(|v| v.as_str())
    }
}

/// The body of POST /api/admin/payouts.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayoutRequest {
    #[validate(
        required(message = "required"),
        range(min = 1, message = "must be a user id")
    )]
    pub user_id: Option<i64>,
    #[validate(required(message = "required"))]
    pub amount: Option<Decimal>,
    #[validate(
        required(message = "required"),
        length(min = 1, message = "must list at least one referral")
    )]
    pub referral_ids: Option<Vec<i64>>,
}

impl CreatePayoutRequest {
    pub fn into_new_payout(self) -> Result<NewPayout, Vec<FieldError>> {
        let mut errors = check(&self).err().unwrap_or_default();
        if self.amount.is_some_and(|a| a <= Decimal::ZERO) {
            errors.push(FieldError::new("amount", "must be greater than zero"));
        }
        if !errors.is_empty() {
            errors.sort_by(|a, b| a.field.cmp(&b.field));
            return Err(errors);
        }

        let mut referral_ids = self.referral_ids.unwrap_or_default();
        referral_ids.sort_unstable();
        referral_ids.dedup();
        Ok(NewPayout {
            user_id: self.user_id.unwrap_or_default(),
            amount: self.amount.unwrap_or_default(),
            referral_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_request_reports_every_missing_field() {
        let req = CreateReferralRequest {
            referred_email: None,
            referred_name: Some("   ".into()),
        };
        let errors = req.into_new_referral(1, Decimal::from(400)).unwrap_err();
        assert_eq!(
            errors,
            vec![
                FieldError::new("referredEmail", "required"),
                FieldError::new("referredName", "must not be empty"),
            ]
        );
    }

    #[test]
    fn referral_request_ignores_status_and_reward_fields() {
        let req: CreateReferralRequest = serde_json::from_value(serde_json::json!({
            "referredEmail": "Friend@Example.com",
            "referredName": "Friend",
            "status": "completed",
            "rewardAmount": 99999,
        }))
        .unwrap();
        let new = req.into_new_referral(7, Decimal::from(400)).unwrap();
        assert_eq!(new.referrer_id, 7);
        assert_eq!(new.referred_email, "friend@example.com");
        assert_eq!(new.reward_amount, Decimal::from(400));
    }

    #[test]
    fn register_rejects_short_password_and_bad_email() {
        let req = RegisterRequest {
            name: Some("Asha".into()),
            email: Some("not-an-email".into()),
            phone: None,
            password: Some("short".into()),
        };
        let errors = req.into_registration().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["email", "password"]);
    }

    #[test]
    fn payout_request_dedups_referral_ids() {
        let req = CreatePayoutRequest {
            user_id: Some(3),
            amount: Some(Decimal::from(800)),
            referral_ids: Some(vec![4, 2, 4]),
        };
        assert_eq!(req.into_new_payout().unwrap().referral_ids, vec![2, 4]);
    }

    #[test]
    fn payout_request_rejects_non_positive_amount() {
        let req = CreatePayoutRequest {
            user_id: Some(3),
            amount: Some(Decimal::ZERO),
            referral_ids: Some(vec![1]),
        };
        let errors = req.into_new_payout().unwrap_err();
        assert_eq!(
            errors,
            vec![FieldError::new("amount", "must be greater than zero")]
        );
    }

    #[test]
    fn payout_request_reports_missing_fields_by_wire_name() {
        let req: CreatePayoutRequest = serde_json::from_value(serde_json::json!({
            "userId": 3,
            "amount": -5,
            "referralIds": [],
        }))
        .unwrap();
        let fields: Vec<_> = req
            .into_new_payout()
            .unwrap_err()
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert_eq!(fields, vec!["amount", "referralIds"]);
    }

    #[test]
    fn payout_amount_accepts_fractional_numbers_exactly() {
        let req: CreatePayoutRequest = serde_json::from_value(serde_json::json!({
            "userId": 3,
            "amount": 0.1,
            "referralIds": [1],
        }))
        .unwrap();
        assert_eq!(
            req.into_new_payout().unwrap().amount,
            "0.1".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn bank_details_are_trimmed_and_ifsc_upper_cased() {
        let req = BankDetailsRequest {
            account_holder_name: Some(" Ravi Kumar ".into()),
            bank_name: Some("SBI".into()),
            account_number: Some("0001234".into()),
            ifsc_code: Some("sbin0000001".into()),
        };
        let input = req.into_input().unwrap();
        assert_eq!(input.account_holder_name, "Ravi Kumar");
        assert_eq!(input.ifsc_code, "SBIN0000001");
    }

    #[test]
    fn serialized_money_is_a_plain_number() {
        let referral = Referral {
            id: 1,
            referrer_id: 2,
            referred_user_id: None,
            referred_email: "friend@example.com".into(),
            referred_name: "Friend".into(),
            status: ReferralStatus::Pending,
            reward_amount: Decimal::new(40000, 2),
            created_at: Utc::now(),
            completed_at: None,
        };
        let json = serde_json::to_value(&referral).unwrap();
        assert_eq!(json["rewardAmount"], serde_json::json!(400.0));
    }
}
