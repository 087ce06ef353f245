use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChildId(pub String);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ChildId {
    fn from(value: &str) -> Self {
        ChildId(value.to_string())
    }
}

impl FromStr for ChildId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChildId(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardId(pub String);

impl fmt::Display for RewardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RewardId {
    fn from(value: &str) -> Self {
        RewardId(value.to_string())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Points(pub i32);

impl Points {
    pub fn zero() -> Self {
        Points(0)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Raised when a stored enum value does not match any known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unrecognized value: {0}")]
pub struct ParseEnumError(pub String);

/// Task lifecycle status. Transition legality lives here and nowhere else;
/// callers request a transition and get the successor status or
/// [`DomainError::InvalidTransition`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
    Approved,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Approved => "approved",
        }
    }

    /// Child hands the task in, optionally with photo proof.
    pub fn submit(self) -> Result<TaskStatus, DomainError> {
        match self {
            TaskStatus::Pending => Ok(TaskStatus::Completed),
            from => Err(DomainError::InvalidTransition {
                from,
                to: TaskStatus::Completed,
            }),
        }
    }

    /// Parent confirms the task. Allowed straight from `pending` so a parent
    /// can mark work done on the child's behalf.
    pub fn approve(self) -> Result<TaskStatus, DomainError> {
        match self {
            TaskStatus::Pending | TaskStatus::Completed => Ok(TaskStatus::Approved),
            from => Err(DomainError::InvalidTransition {
                from,
                to: TaskStatus::Approved,
            }),
        }
    }

    /// Parent declines a handed-in task; it loops back to `pending` with the
    /// completion evidence cleared by the caller.
    pub fn reject(self) -> Result<TaskStatus, DomainError> {
        match self {
            TaskStatus::Completed => Ok(TaskStatus::Pending),
            from => Err(DomainError::InvalidTransition {
                from,
                to: TaskStatus::Pending,
            }),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "approved" => Ok(TaskStatus::Approved),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

/// Progress-grouping bucket for a task. Not used for automatic expiry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePeriod {
    Daily,
    Weekly,
    Monthly,
}

impl ChallengePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengePeriod::Daily => "daily",
            ChallengePeriod::Weekly => "weekly",
            ChallengePeriod::Monthly => "monthly",
        }
    }
}

impl fmt::Display for ChallengePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengePeriod {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(ChallengePeriod::Daily),
            "weekly" => Ok(ChallengePeriod::Weekly),
            "monthly" => Ok(ChallengePeriod::Monthly),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Child {
    pub id: ChildId,
    pub name: String,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
    // Derived values; refreshed from the task/redemption records on every
    // reconciliation, never edited directly.
    pub total_points: Points,
    pub current_points: Points,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub child_id: ChildId,
    pub title: String,
    pub description: String,
    pub points: Points,
    pub status: TaskStatus,
    pub is_recurring: bool,
    pub challenge_period: Option<ChallengePeriod>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub due_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_recurred_at: Option<OffsetDateTime>,
    pub photo_proof: Option<String>,
    pub reward_id: Option<RewardId>,
    // Approved tasks are archived instead of removed so earned points
    // survive deletion.
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub id: RewardId,
    pub title: String,
    pub description: String,
    pub points_required: Points,
    pub claimed: bool,
    pub claimed_by: Option<ChildId>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub paid: bool,
    pub is_active: bool,
}

/// Public view of a login account; never carries the credential hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub role: crate::auth::Role,
    pub family_code: Option<String>,
    pub parent_id: Option<UserId>,
    pub age: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub total: Points,
    pub current: Points,
}

/// Derives a child's balances from the task and reward records.
///
/// `total` sums the points of the child's approved tasks (archived ones
/// included); `current` subtracts the thresholds of rewards the child has
/// claimed. Idempotent and side-effect free; this is the reconciliation
/// path after any mutation.
pub fn balances_for(child_id: &ChildId, tasks: &[Task], rewards: &[Reward]) -> Balance {
    let total: i32 = tasks
        .iter()
        .filter(|t| &t.child_id == child_id && t.status == TaskStatus::Approved)
        .map(|t| t.points.0)
        .sum();
    let spent: i32 = rewards
        .iter()
        .filter(|r| r.claimed && r.claimed_by.as_ref() == Some(child_id))
        .map(|r| r.points_required.0)
        .sum();
    Balance {
        total: Points(total),
        current: Points(total - spent),
    }
}

pub const FAMILY_CODE_LEN: usize = 6;
const FAMILY_CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a 6-character uppercase alphanumeric family code. Uniqueness
/// among parent accounts is the caller's responsibility.
pub fn generate_family_code() -> String {
    let mut rng = rand::thread_rng();
    (0..FAMILY_CODE_LEN)
        .map(|_| FAMILY_CODE_CHARS[rng.gen_range(0..FAMILY_CODE_CHARS.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("family code does not match any parent account")]
    InvalidFamilyCode,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("child not found: {0}")]
    InvalidChild(ChildId),
    #[error("cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("not enough points: have {available}, need {required}")]
    InsufficientPoints { available: i32, required: i32 },
    #[error("reward already claimed")]
    AlreadyClaimed,
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, child: &str, points: i32, status: TaskStatus) -> Task {
        Task {
            id: TaskId::from(id),
            child_id: ChildId::from(child),
            title: "t".into(),
            description: String::new(),
            points: Points(points),
            status,
            is_recurring: false,
            challenge_period: None,
            created_at: now_utc(),
            due_date: None,
            completed_at: None,
            approved_at: None,
            last_recurred_at: None,
            photo_proof: None,
            reward_id: None,
            archived: false,
        }
    }

    fn reward(id: &str, required: i32, claimed_by: Option<&str>) -> Reward {
        Reward {
            id: RewardId::from(id),
            title: "r".into(),
            description: String::new(),
            points_required: Points(required),
            claimed: claimed_by.is_some(),
            claimed_by: claimed_by.map(ChildId::from),
            claimed_at: claimed_by.map(|_| now_utc()),
            expires_at: None,
            paid: false,
            is_active: true,
        }
    }

    #[test]
    fn submit_only_from_pending() {
        assert_eq!(TaskStatus::Pending.submit().unwrap(), TaskStatus::Completed);
        assert!(matches!(
            TaskStatus::Completed.submit(),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert!(TaskStatus::Approved.submit().is_err());
    }

    #[test]
    fn approve_from_pending_or_completed() {
        assert_eq!(TaskStatus::Pending.approve().unwrap(), TaskStatus::Approved);
        assert_eq!(
            TaskStatus::Completed.approve().unwrap(),
            TaskStatus::Approved
        );
        assert_eq!(
            TaskStatus::Approved.approve(),
            Err(DomainError::InvalidTransition {
                from: TaskStatus::Approved,
                to: TaskStatus::Approved,
            })
        );
    }

    #[test]
    fn reject_only_from_completed() {
        assert_eq!(TaskStatus::Completed.reject().unwrap(), TaskStatus::Pending);
        assert!(TaskStatus::Pending.reject().is_err());
        assert!(TaskStatus::Approved.reject().is_err());
    }

    #[test]
    fn balances_derive_from_records() {
        let alice = ChildId::from("alice");
        let tasks = vec![
            task("t1", "alice", 10, TaskStatus::Approved),
            task("t2", "alice", 5, TaskStatus::Pending),
            task("t3", "bob", 7, TaskStatus::Approved),
            task("t4", "alice", 20, TaskStatus::Approved),
        ];
        let rewards = vec![
            reward("r1", 15, Some("alice")),
            reward("r2", 9, Some("bob")),
            reward("r3", 100, None),
        ];
        let b = balances_for(&alice, &tasks, &rewards);
        assert_eq!(b.total, Points(30));
        assert_eq!(b.current, Points(15));
        assert!(b.current <= b.total);
    }

    #[test]
    fn archived_approvals_keep_their_credit() {
        let alice = ChildId::from("alice");
        let mut t = task("t1", "alice", 10, TaskStatus::Approved);
        t.archived = true;
        let b = balances_for(&alice, &[t], &[]);
        assert_eq!(b.total, Points(10));
    }

    #[test]
    fn family_code_shape() {
        let code = generate_family_code();
        assert_eq!(code.len(), FAMILY_CODE_LEN);
        assert!(
            code.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Approved,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert!("expired".parse::<TaskStatus>().is_err());
    }
}
