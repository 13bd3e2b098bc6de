use chrono::{DateTime, Utc};

/// Digits of the millisecond timestamp kept in a code.
const TIMESTAMP_DIGITS: u32 = 6;

/// Builds a referral code from the first two characters of `name`,
/// upper-cased, followed by the last six digits of `now` in milliseconds.
///
/// Codes are not guaranteed unique; the unique index on
/// `users.referral_code` rejects collisions.
pub fn generate(name: &str, now: DateTime<Utc>) -> String {
    let prefix: String = name
        .trim()
        .chars()
        .take(2)
        .flat_map(char::to_uppercase)
        .collect();
    let millis = now.timestamp_millis().rem_euclid(10_i64.pow(TIMESTAMP_DIGITS));
    format!("{prefix}{millis:0width$}", width = TIMESTAMP_DIGITS as usize)
}
