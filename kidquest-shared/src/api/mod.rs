use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::domain::{ChallengePeriod, TaskStatus};

pub mod endpoints;
#[cfg(feature = "rest-client")]
pub mod rest;

pub const API_V1_PREFIX: &str = "/api/v1";

// Auth
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterReq {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
    /// Required when role == child; ignored for parents (a fresh code is
    /// generated for them).
    pub family_code: Option<String>,
    pub age: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResp {
    pub token: String,
    pub user: UserDto,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserDto {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub family_code: Option<String>,
    pub parent_id: Option<String>,
    pub age: Option<i32>,
    pub created_at: String, // RFC3339 UTC
}

// Children
#[derive(Debug, Serialize, Deserialize)]
pub struct ChildDto {
    pub id: String,
    pub name: String,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
    pub total_points: i32,
    pub current_points: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewChildReq {
    pub name: String,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceDto {
    pub child_id: String,
    pub total_points: i32,
    pub current_points: i32,
}

// Tasks
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDto {
    pub id: String,
    pub child_id: String,
    pub title: String,
    pub description: String,
    pub points: i32,
    pub status: TaskStatus,
    pub is_recurring: bool,
    pub challenge_period: Option<ChallengePeriod>,
    pub created_at: String,           // RFC3339 UTC
    pub due_date: Option<String>,     // RFC3339 UTC
    pub completed_at: Option<String>, // RFC3339 UTC
    pub approved_at: Option<String>,  // RFC3339 UTC
    pub last_recurred_at: Option<String>, // RFC3339 UTC
    pub photo_proof: Option<String>,
    pub reward_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskReq {
    pub child_id: String,
    pub title: String,
    pub description: Option<String>,
    pub points: i32,
    #[serde(default)]
    pub is_recurring: bool,
    pub challenge_period: Option<ChallengePeriod>,
    pub due_date: Option<String>, // RFC3339 UTC
    pub reward_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskReq {
    pub photo_proof: Option<String>,
}

/// Authoritative state after a lifecycle transition: the task itself, the
/// spawned occurrence for recurring approvals, and the owning child's
/// re-derived balance.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskActionResp {
    pub task: TaskDto,
    pub successor: Option<TaskDto>,
    pub balance: BalanceDto,
}

// Rewards
#[derive(Debug, Serialize, Deserialize)]
pub struct RewardDto {
    pub id: String,
    pub title: String,
    pub description: String,
    pub points_required: i32,
    pub claimed: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>, // RFC3339 UTC
    pub expires_at: Option<String>, // RFC3339 UTC
    pub paid: bool,
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRewardReq {
    pub title: String,
    pub description: Option<String>,
    pub points_required: i32,
    pub expires_at: Option<String>, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimReq {
    pub child_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResp {
    pub reward: RewardDto,
    pub balance: BalanceDto,
}
