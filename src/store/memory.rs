use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use super::{Storage, StoreError, StoreResult};
use crate::stats::{AdminStats, UserStats};
use crate::status::{Lifecycle, PayoutStatus, ReferralStatus};
use crate::types::{
    BankDetails, BankDetailsInput, NewPayout, NewReferral, NewUser, Payout, Referral, User,
};

/// In-process storage with the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    bank_details: Vec<BankDetails>,
    referrals: Vec<Referral>,
    payouts: Vec<Payout>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, i64)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

/// Rounds the way Postgres stores into the `NUMERIC(10, 2)` money columns.
fn to_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn unique_violation(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: Some(constraint.to_string()),
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.tables().users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .tables()
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_user(&self, user: NewUser) -> StoreResult<User> {
        let mut t = self.tables();
        if t.users.iter().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(unique_violation("users_email_key"));
        }
        if t.users.iter().any(|u| u.referral_code == user.referral_code) {
            return Err(unique_violation("users_referral_code_key"));
        }
        let created = User {
            id: t.next_id(),
            name: user.name,
            email: user.email,
            phone: user.phone,
            password: user.password_hash,
            referral_code: user.referral_code,
            is_admin: user.is_admin,
            created_at: Utc::now(),
        };
        t.users.push(created.clone());
        Ok(created)
    }

    async fn get_bank_details(&self, user_id: i64) -> StoreResult<Option<BankDetails>> {
        Ok(self
            .tables()
            .bank_details
            .iter()
            .find(|b| b.user_id == user_id)
            .cloned())
    }

    async fn upsert_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<BankDetails> {
        let mut t = self.tables();
        if let Some(existing) = t.bank_details.iter_mut().find(|b| b.user_id == user_id) {
            apply_bank_details(existing, details);
            return Ok(existing.clone());
        }
        let created = BankDetails {
            id: t.next_id(),
            user_id,
            account_holder_name: details.account_holder_name,
            bank_name: details.bank_name,
            account_number: details.account_number,
            ifsc_code: details.ifsc_code,
            created_at: Utc::now(),
        };
        t.bank_details.push(created.clone());
        Ok(created)
    }

    async fn update_bank_details(
        &self,
        user_id: i64,
        details: BankDetailsInput,
    ) -> StoreResult<Option<BankDetails>> {
        let mut t = self.tables();
        Ok(t
            .bank_details
            .iter_mut()
            .find(|b| b.user_id == user_id)
            .map(|existing| {
                apply_bank_details(existing, details);
                existing.clone()
            }))
    }

    async fn get_referral(&self, id: i64) -> StoreResult<Option<Referral>> {
        Ok(self.tables().referrals.iter().find(|r| r.id == id).cloned())
    }

    async fn get_referrals(&self, referrer_id: i64) -> StoreResult<Vec<Referral>> {
        let mut referrals: Vec<Referral> = self
            .tables()
            .referrals
            .iter()
            .filter(|r| r.referrer_id == referrer_id)
            .cloned()
            .collect();
        newest_first(&mut referrals, |r| (r.created_at, r.id));
        Ok(referrals)
    }

    async fn get_all_referrals(&self) -> StoreResult<Vec<Referral>> {
        let mut referrals = self.tables().referrals.clone();
        newest_first(&mut referrals, |r| (r.created_at, r.id));
        Ok(referrals)
    }

    async fn create_referral(&self, referral: NewReferral) -> StoreResult<Referral> {
        let mut t = self.tables();
        let created = Referral {
            id: t.next_id(),
            referrer_id: referral.referrer_id,
            referred_user_id: None,
            referred_email: referral.referred_email,
            referred_name: referral.referred_name,
            status: ReferralStatus::INITIAL,
            reward_amount: to_cents(referral.reward_amount),
            created_at: Utc::now(),
            completed_at: None,
        };
        t.referrals.push(created.clone());
        Ok(created)
    }

    async fn update_referral_status(
        &self,
        id: i64,
        status: ReferralStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Referral>> {
        let mut t = self.tables();
        Ok(t.referrals.iter_mut().find(|r| r.id == id).map(|r| {
            r.status = status;
            r.completed_at = completed_at;
            r.clone()
        }))
    }

    async fn link_referred_user(&self, email: &str, user_id: i64) -> StoreResult<u64> {
        let mut t = self.tables();
        let mut linked = 0;
        for r in t.referrals.iter_mut().filter(|r| {
            r.referred_user_id.is_none() && r.referred_email.eq_ignore_ascii_case(email)
        }) {
            r.referred_user_id = Some(user_id);
            linked += 1;
        }
        Ok(linked)
    }

    async fn get_payout(&self, id: i64) -> StoreResult<Option<Payout>> {
        Ok(self.tables().payouts.iter().find(|p| p.id == id).cloned())
    }

    async fn get_payouts(&self, user_id: i64) -> StoreResult<Vec<Payout>> {
        let mut payouts: Vec<Payout> = self
            .tables()
            .payouts
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        newest_first(&mut payouts, |p| (p.created_at, p.id));
        Ok(payouts)
    }

    async fn get_all_payouts(&self) -> StoreResult<Vec<Payout>> {
        let mut payouts = self.tables().payouts.clone();
        newest_first(&mut payouts, |p| (p.created_at, p.id));
        Ok(payouts)
    }

    async fn create_payout(&self, payout: NewPayout) -> StoreResult<Payout> {
        let mut t = self.tables();
        let created = Payout {
            id: t.next_id(),
            user_id: payout.user_id,
            amount: to_cents(payout.amount),
            status: PayoutStatus::INITIAL,
            referral_ids: payout.referral_ids,
            created_at: Utc::now(),
            completed_at: None,
        };
        t.payouts.push(created.clone());
        Ok(created)
    }

    async fn update_payout_status(
        &self,
        id: i64,
        status: PayoutStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Option<Payout>> {
        let mut t = self.tables();
        Ok(t.payouts.iter_mut().find(|p| p.id == id).map(|p| {
            p.status = status;
            p.completed_at = completed_at;
            p.clone()
        }))
    }

    async fn covered_referral_ids(&self, referral_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let t = self.tables();
        let mut covered: Vec<i64> = t
            .payouts
            .iter()
            .filter(|p| p.status != PayoutStatus::Failed)
            .flat_map(|p| p.referral_ids.iter().copied())
            .filter(|id| referral_ids.contains(id))
            .collect();
        covered.sort_unstable();
        covered.dedup();
        Ok(covered)
    }

    async fn get_user_stats(&self, user_id: i64) -> StoreResult<UserStats> {
        let t = self.tables();
        Ok(UserStats::from_referrals(
            t.referrals.iter().filter(|r| r.referrer_id == user_id),
        ))
    }

    async fn get_admin_stats(&self) -> StoreResult<AdminStats> {
        let t = self.tables();
        Ok(AdminStats::compute(&t.users, &t.referrals, &t.payouts))
    }
}

fn apply_bank_details(existing: &mut BankDetails, details: BankDetailsInput) {
    existing.account_holder_name = details.account_holder_name;
    existing.bank_name = details.bank_name;
    existing.account_number = details.account_number;
    existing.ifsc_code = details.ifsc_code;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str, email: &str, code: &str) -> NewUser {
        NewUser {
            name: name.into(),
            email: email.into(),
            phone: None,
            password_hash: "hash".into(),
            referral_code: code.into(),
            is_admin: false,
        }
    }

    fn new_referral(referrer_id: i64, email: &str) -> NewReferral {
        NewReferral {
            referrer_id,
            referred_email: email.into(),
            referred_name: "Friend".into(),
            reward_amount: Decimal::from(400),
        }
    }

    #[tokio::test]
    async fn duplicate_referral_code_is_rejected_not_overwritten() {
        let store = MemoryStorage::new();
        let first = store
            .create_user(new_user("Ravi", "ravi@example.com", "RA123456"))
            .await
            .unwrap();
        let err = store
            .create_user(new_user("Rachel", "rachel@example.com", "RA123456"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());

        let kept = store.get_user(first.id).await.unwrap().unwrap();
        assert_eq!(kept.email, "ravi@example.com");
        assert!(store.get_user_by_email("rachel@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStorage::new();
        store
            .create_user(new_user("Ravi", "ravi@example.com", "RA000001"))
            .await
            .unwrap();
        let err = store
            .create_user(new_user("Ravi", "RAVI@example.com", "RA000002"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn user_stats_for_two_completed_one_pending() {
        let store = MemoryStorage::new();
        let user = store
            .create_user(new_user("Ravi", "ravi@example.com", "RA000001"))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            let r = store
                .create_referral(new_referral(user.id, &format!("f{i}@example.com")))
                .await
                .unwrap();
            ids.push(r.id);
        }
        for id in &ids[..2] {
            store
                .update_referral_status(*id, ReferralStatus::Completed, Some(Utc::now()))
                .await
                .unwrap();
        }

        let stats = store.get_user_stats(user.id).await.unwrap();
        assert_eq!(stats.total_referrals, 3);
        assert_eq!(stats.successful_referrals, 2);
        assert_eq!(stats.pending_referrals, 1);
        assert_eq!(stats.total_earnings, Decimal::from(800));
    }

    #[tokio::test]
    async fn admin_stats_count_only_users_with_referrals() {
        let store = MemoryStorage::new();
        let mut users = Vec::new();
        for i in 0..5 {
            let u = store
                .create_user(new_user(
                    "User",
                    &format!("u{i}@example.com"),
                    &format!("US00000{i}"),
                ))
                .await
                .unwrap();
            users.push(u);
        }
        let r = store
            .create_referral(new_referral(users[0].id, "a@example.com"))
            .await
            .unwrap();
        store
            .create_referral(new_referral(users[0].id, "b@example.com"))
            .await
            .unwrap();
        store
            .create_referral(new_referral(users[3].id, "c@example.com"))
            .await
            .unwrap();
        store
            .update_referral_status(r.id, ReferralStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();

        let payout = store
            .create_payout(NewPayout {
                user_id: users[0].id,
                amount: Decimal::from(400),
                referral_ids: vec![r.id],
            })
            .await
            .unwrap();
        store
            .update_payout_status(payout.id, PayoutStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        store
            .create_payout(NewPayout {
                user_id: users[3].id,
                amount: Decimal::from(250),
                referral_ids: vec![99],
            })
            .await
            .unwrap();

        let stats = store.get_admin_stats().await.unwrap();
        assert_eq!(stats.total_users, 5);
        assert_eq!(stats.active_referrers, 2);
        assert_eq!(stats.total_payouts, Decimal::from(400));
        assert_eq!(stats.pending_reviews, 2);
    }

    #[tokio::test]
    async fn failed_payouts_release_their_referrals() {
        let store = MemoryStorage::new();
        let paid = store
            .create_payout(NewPayout {
                user_id: 1,
                amount: Decimal::from(400),
                referral_ids: vec![3, 5],
            })
            .await
            .unwrap();
        let failed = store
            .create_payout(NewPayout {
                user_id: 1,
                amount: Decimal::from(400),
                referral_ids: vec![7],
            })
            .await
            .unwrap();
        store
            .update_payout_status(failed.id, PayoutStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(
            store.covered_referral_ids(&[1, 3, 5, 7]).await.unwrap(),
            vec![3, 5]
        );
        store
            .update_payout_status(paid.id, PayoutStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.covered_referral_ids(&[5]).await.unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn amounts_are_kept_to_cents() {
        let store = MemoryStorage::new();
        let payout = store
            .create_payout(NewPayout {
                user_id: 1,
                amount: "12.345".parse().unwrap(),
                referral_ids: vec![1],
            })
            .await
            .unwrap();
        assert_eq!(payout.amount, "12.35".parse::<Decimal>().unwrap());
    }

    #[tokio::test]
    async fn bank_details_upsert_keeps_a_single_row() {
        let store = MemoryStorage::new();
        let input = |bank: &str| BankDetailsInput {
            account_holder_name: "Ravi Kumar".into(),
            bank_name: bank.into(),
            account_number: "0001234".into(),
            ifsc_code: "SBIN0000001".into(),
        };

        assert!(store.update_bank_details(1, input("SBI")).await.unwrap().is_none());
        let first = store.upsert_bank_details(1, input("SBI")).await.unwrap();
        let second = store.upsert_bank_details(1, input("HDFC")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.bank_name, "HDFC");
        let updated = store.update_bank_details(1, input("ICICI")).await.unwrap().unwrap();
        assert_eq!(updated.id, first.id);
        assert_eq!(
            store.get_bank_details(1).await.unwrap().unwrap().bank_name,
            "ICICI"
        );
    }

    #[tokio::test]
    async fn link_referred_user_only_touches_unlinked_matches() {
        let store = MemoryStorage::new();
        let a = store.create_referral(new_referral(1, "new@example.com")).await.unwrap();
        store.create_referral(new_referral(2, "other@example.com")).await.unwrap();

        assert_eq!(store.link_referred_user("NEW@example.com", 9).await.unwrap(), 1);
        assert_eq!(store.link_referred_user("new@example.com", 10).await.unwrap(), 0);
        let linked = store.get_referral(a.id).await.unwrap().unwrap();
        assert_eq!(linked.referred_user_id, Some(9));
        assert_eq!(linked.status, ReferralStatus::Pending);
    }

    #[tokio::test]
    async fn listings_are_newest_first() {
        let store = MemoryStorage::new();
        let first = store.create_referral(new_referral(1, "a@example.com")).await.unwrap();
        let second = store.create_referral(new_referral(1, "b@example.com")).await.unwrap();
        let ids: Vec<i64> = store
            .get_referrals(1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
