//! Lifecycle rules for referrals and payouts.
//!
//! Both records start out `pending` and move exactly once, by an
//! administrator, into a terminal state. Only the success state stamps a
//! completion time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A status value that is not part of the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status: {0}")]
pub struct InvalidStatus(pub String);

/// A transition the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot move from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

pub trait Lifecycle: Copy + PartialEq + 'static {
    const INITIAL: Self;

    fn as_str(self) -> &'static str;

    /// The state that marks a successful outcome and carries `completed_at`.
    fn is_success(self) -> bool;

    fn is_terminal(self) -> bool {
        self != Self::INITIAL
    }
}

/// Validates `from -> to` and returns the completion timestamp the record
/// must carry afterwards.
///
/// Re-asserting the initial state is accepted and changes nothing.
pub fn transition<S: Lifecycle>(
    from: S,
    to: S,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TransitionError> {
    if from.is_terminal() {
        return Err(TransitionError {
            from: from.as_str(),
            to: to.as_str(),
        });
    }
    Ok(to.is_success().then_some(now))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Completed,
    Cancelled,
}

impl Lifecycle for ReferralStatus {
    const INITIAL: Self = ReferralStatus::Pending;

    fn as_str(self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Completed => "completed",
            ReferralStatus::Cancelled => "cancelled",
        }
    }

    fn is_success(self) -> bool {
        self == ReferralStatus::Completed
    }
}

impl FromStr for ReferralStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReferralStatus::Pending),
            "completed" => Ok(ReferralStatus::Completed),
            "cancelled" => Ok(ReferralStatus::Cancelled),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl Lifecycle for PayoutStatus {
    const INITIAL: Self = PayoutStatus::Pending;

    fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }

    fn is_success(self) -> bool {
        self == PayoutStatus::Completed
    }
}

impl FromStr for PayoutStatus {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "completed" => Ok(PayoutStatus::Completed),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
