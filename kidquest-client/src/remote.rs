//! [`Backend`] over the hosted KidQuest API, via the shared REST client.

use async_trait::async_trait;
use kidquest_shared::api::{self, rest};
use kidquest_shared::domain::{
    Balance, Child, ChildId, Points, Reward, RewardId, Task, TaskId, UserAccount, UserId,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::state::{
    ApproveOutcome, Backend, ChildDraft, ClaimOutcome, RewardDraft, Snapshot, SyncError,
    TaskDraft,
};

pub struct RemoteBackend {
    base: String,
    token: String,
}

impl RemoteBackend {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            token: token.into(),
        }
    }

    pub async fn login(
        base: &str,
        email: &str,
        password: &str,
    ) -> Result<(Self, UserAccount), SyncError> {
        let resp = rest::login(
            base,
            &api::AuthReq {
                email: email.to_string(),
                password: password.to_string(),
            },
        )
        .await?;
        let user = user_from(resp.user)?;
        Ok((Self::new(base, resp.token), user))
    }

    pub async fn register(
        base: &str,
        req: &api::RegisterReq,
    ) -> Result<(Self, UserAccount), SyncError> {
        let resp = rest::register(base, req).await?;
        let user = user_from(resp.user)?;
        Ok((Self::new(base, resp.token), user))
    }

    /// Invalidates the session server-side; the backend is dead afterwards.
    pub async fn logout(self) -> Result<(), SyncError> {
        rest::logout(&self.base, &self.token).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn load(&self) -> Result<Snapshot, SyncError> {
        let (children, tasks, rewards) = tokio::try_join!(
            async {
                rest::list_children(&self.base, &self.token)
                    .await
                    .map_err(SyncError::from)
            },
            async {
                rest::list_tasks(&self.base, &self.token)
                    .await
                    .map_err(SyncError::from)
            },
            async {
                rest::list_rewards(&self.base, &self.token)
                    .await
                    .map_err(SyncError::from)
            },
        )?;
        Ok(Snapshot {
            children: children.into_iter().map(child_from).collect(),
            tasks: tasks
                .into_iter()
                .map(task_from)
                .collect::<Result<_, _>>()?,
            rewards: rewards
                .into_iter()
                .map(reward_from)
                .collect::<Result<_, _>>()?,
        })
    }

    async fn create_child(&self, draft: &ChildDraft) -> Result<Child, SyncError> {
        let dto = rest::create_child(
            &self.base,
            &self.token,
            &api::NewChildReq {
                name: draft.name.clone(),
                age: draft.age,
                avatar_url: draft.avatar_url.clone(),
            },
        )
        .await?;
        Ok(child_from(dto))
    }

    async fn delete_child(&self, id: &ChildId) -> Result<(), SyncError> {
        rest::delete_child(&self.base, &self.token, &id.0).await?;
        Ok(())
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError> {
        let dto = rest::create_task(
            &self.base,
            &self.token,
            &api::CreateTaskReq {
                child_id: draft.child_id.0.clone(),
                title: draft.title.clone(),
                description: Some(draft.description.clone()),
                points: draft.points,
                is_recurring: draft.is_recurring,
                challenge_period: draft.challenge_period,
                due_date: fmt_ts_opt(draft.due_date)?,
                reward_id: draft.reward_id.as_ref().map(|r| r.0.clone()),
            },
        )
        .await?;
        task_from(dto)
    }

    async fn submit_task(&self, id: &TaskId, photo: Option<String>) -> Result<Task, SyncError> {
        let dto = rest::submit_task(
            &self.base,
            &self.token,
            &id.0,
            &api::SubmitTaskReq { photo_proof: photo },
        )
        .await?;
        task_from(dto)
    }

    async fn approve_task(&self, id: &TaskId) -> Result<ApproveOutcome, SyncError> {
        let resp = rest::approve_task(&self.base, &self.token, &id.0).await?;
        Ok(ApproveOutcome {
            task: task_from(resp.task)?,
            successor: resp.successor.map(task_from).transpose()?,
            balance: balance_from(&resp.balance),
        })
    }

    async fn reject_task(&self, id: &TaskId) -> Result<Task, SyncError> {
        let dto = rest::reject_task(&self.base, &self.token, &id.0).await?;
        task_from(dto)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError> {
        rest::delete_task(&self.base, &self.token, &id.0).await?;
        Ok(())
    }

    async fn create_reward(&self, draft: &RewardDraft) -> Result<Reward, SyncError> {
        let dto = rest::create_reward(
            &self.base,
            &self.token,
            &api::CreateRewardReq {
                title: draft.title.clone(),
                description: Some(draft.description.clone()),
                points_required: draft.points_required,
                expires_at: fmt_ts_opt(draft.expires_at)?,
            },
        )
        .await?;
        reward_from(dto)
    }

    async fn claim_reward(
        &self,
        id: &RewardId,
        child: &ChildId,
    ) -> Result<ClaimOutcome, SyncError> {
        let resp = rest::claim_reward(
            &self.base,
            &self.token,
            &id.0,
            &api::ClaimReq {
                child_id: child.0.clone(),
            },
        )
        .await?;
        Ok(ClaimOutcome {
            reward: reward_from(resp.reward)?,
            balance: balance_from(&resp.balance),
        })
    }

    async fn mark_fulfilled(&self, id: &RewardId) -> Result<Reward, SyncError> {
        let dto = rest::fulfill_reward(&self.base, &self.token, &id.0).await?;
        reward_from(dto)
    }

    async fn delete_reward(&self, id: &RewardId) -> Result<(), SyncError> {
        rest::delete_reward(&self.base, &self.token, &id.0).await?;
        Ok(())
    }
}

impl From<rest::RestError> for SyncError {
    fn from(e: rest::RestError) -> Self {
        match e {
            rest::RestError::Status { status, body } => {
                // Error responses carry {"error": "..."}; fall back to the
                // raw body for anything else.
                let message = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("error").and_then(|m| m.as_str()).map(String::from))
                    .unwrap_or(body);
                SyncError::Rejected { status, message }
            }
            other => SyncError::Persistence(other.to_string()),
        }
    }
}

fn parse_ts(s: &str) -> Result<OffsetDateTime, SyncError> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| SyncError::Persistence(format!("bad timestamp {s:?}: {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<OffsetDateTime>, SyncError> {
    s.as_deref().map(parse_ts).transpose()
}

fn fmt_ts_opt(ts: Option<OffsetDateTime>) -> Result<Option<String>, SyncError> {
    ts.map(|t| {
        t.format(&Rfc3339)
            .map_err(|e| SyncError::Invalid(format!("bad timestamp: {e}")))
    })
    .transpose()
}

fn child_from(dto: api::ChildDto) -> Child {
    Child {
        id: ChildId(dto.id),
        name: dto.name,
        age: dto.age,
        avatar_url: dto.avatar_url,
        total_points: Points(dto.total_points),
        current_points: Points(dto.current_points),
    }
}

fn task_from(dto: api::TaskDto) -> Result<Task, SyncError> {
    Ok(Task {
        id: TaskId(dto.id),
        child_id: ChildId(dto.child_id),
        title: dto.title,
        description: dto.description,
        points: Points(dto.points),
        status: dto.status,
        is_recurring: dto.is_recurring,
        challenge_period: dto.challenge_period,
        created_at: parse_ts(&dto.created_at)?,
        due_date: parse_ts_opt(dto.due_date)?,
        completed_at: parse_ts_opt(dto.completed_at)?,
        approved_at: parse_ts_opt(dto.approved_at)?,
        last_recurred_at: parse_ts_opt(dto.last_recurred_at)?,
        photo_proof: dto.photo_proof,
        reward_id: dto.reward_id.map(RewardId),
        archived: false,
    })
}

fn reward_from(dto: api::RewardDto) -> Result<Reward, SyncError> {
    Ok(Reward {
        id: RewardId(dto.id),
        title: dto.title,
        description: dto.description,
        points_required: Points(dto.points_required),
        claimed: dto.claimed,
        claimed_by: dto.claimed_by.map(ChildId),
        claimed_at: parse_ts_opt(dto.claimed_at)?,
        expires_at: parse_ts_opt(dto.expires_at)?,
        paid: dto.paid,
        is_active: dto.is_active,
    })
}

fn balance_from(dto: &api::BalanceDto) -> Balance {
    Balance {
        total: Points(dto.total_points),
        current: Points(dto.current_points),
    }
}

fn user_from(dto: api::UserDto) -> Result<UserAccount, SyncError> {
    Ok(UserAccount {
        id: UserId(dto.id),
        email: dto.email,
        name: dto.name,
        role: dto.role,
        family_code: dto.family_code,
        parent_id: dto.parent_id.map(UserId),
        age: dto.age,
        created_at: parse_ts(&dto.created_at)?,
    })
}
