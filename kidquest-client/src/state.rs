//! Client-side state synchronizer.
//!
//! Holds an in-memory snapshot of the family's children, tasks and rewards
//! and keeps it consistent with an authoritative [`Backend`]. Every command
//! validates with the shared domain rules, applies a tentative local
//! mutation, issues the persistence call, and then either replaces the
//! tentative state with the authoritative records returned by the backend or
//! reverts the tentative mutation.

use async_trait::async_trait;
use kidquest_shared::domain::{
    Balance, ChallengePeriod, Child, ChildId, DomainError, Reward, RewardId, Task, TaskId,
    TaskStatus, balances_for, now_utc,
};
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A business rule rejected the command before anything was persisted.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// The record is missing from the local snapshot (stale view).
    #[error("not found: {0}")]
    NotFound(String),
    /// The command input failed validation.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The authoritative store refused the command.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Transport or storage failure. The tentative update has been reverted,
    /// but the command may or may not have reached the store; the next
    /// refresh reconciles either way.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

fn stale(kind: &str, id: &dyn std::fmt::Display) -> SyncError {
    SyncError::NotFound(format!("{kind} not in local snapshot: {id}"))
}

/// Local mirror of the authoritative store.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub children: Vec<Child>,
    pub tasks: Vec<Task>,
    pub rewards: Vec<Reward>,
}

impl Snapshot {
    pub fn child(&self, id: &ChildId) -> Option<&Child> {
        self.children.iter().find(|c| &c.id == id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn reward(&self, id: &RewardId) -> Option<&Reward> {
        self.rewards.iter().find(|r| &r.id == id)
    }

    fn child_mut(&mut self, id: &ChildId) -> Option<&mut Child> {
        self.children.iter_mut().find(|c| &c.id == id)
    }

    fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    fn reward_mut(&mut self, id: &RewardId) -> Option<&mut Reward> {
        self.rewards.iter_mut().find(|r| &r.id == id)
    }

    /// Display order: pending tasks before all other statuses, newest
    /// created first within equal status. Archived tasks are hidden.
    pub fn visible_tasks(&self) -> Vec<&Task> {
        let mut out: Vec<&Task> = self.tasks.iter().filter(|t| !t.archived).collect();
        out.sort_by(|a, b| {
            let rank = |t: &Task| (t.status != TaskStatus::Pending) as u8;
            rank(a)
                .cmp(&rank(b))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        out
    }

    /// Derived balances, recomputed from the records on every call.
    pub fn balances(&self, child: &ChildId) -> Balance {
        balances_for(child, &self.tasks, &self.rewards)
    }

    fn replace_task(&mut self, task: Task) {
        match self.task_mut(&task.id) {
            Some(slot) => *slot = task,
            None => self.tasks.push(task),
        }
    }

    fn replace_reward(&mut self, reward: Reward) {
        match self.reward_mut(&reward.id) {
            Some(slot) => *slot = reward,
            None => self.rewards.push(reward),
        }
    }

    fn apply_balance(&mut self, child: &ChildId, balance: Balance) {
        if let Some(c) = self.child_mut(child) {
            c.total_points = balance.total;
            c.current_points = balance.current;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildDraft {
    pub name: String,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub child_id: ChildId,
    pub title: String,
    pub description: String,
    pub points: i32,
    pub is_recurring: bool,
    pub challenge_period: Option<ChallengePeriod>,
    pub due_date: Option<OffsetDateTime>,
    pub reward_id: Option<RewardId>,
}

#[derive(Debug, Clone)]
pub struct RewardDraft {
    pub title: String,
    pub description: String,
    pub points_required: i32,
    pub expires_at: Option<OffsetDateTime>,
}

/// Authoritative result of an approval: the task, the spawned occurrence for
/// recurring templates, and the re-derived balance.
#[derive(Debug, Clone)]
pub struct ApproveOutcome {
    pub task: Task,
    pub successor: Option<Task>,
    pub balance: Balance,
}

#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub reward: Reward,
    pub balance: Balance,
}

/// Persistence seam: the hosted API in remote mode, a serialized local store
/// otherwise. Mutations return the authoritative records so the synchronizer
/// can replace its tentative state without a full reload.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn load(&self) -> Result<Snapshot, SyncError>;

    async fn create_child(&self, draft: &ChildDraft) -> Result<Child, SyncError>;
    async fn delete_child(&self, id: &ChildId) -> Result<(), SyncError>;

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError>;
    async fn submit_task(&self, id: &TaskId, photo: Option<String>) -> Result<Task, SyncError>;
    async fn approve_task(&self, id: &TaskId) -> Result<ApproveOutcome, SyncError>;
    async fn reject_task(&self, id: &TaskId) -> Result<Task, SyncError>;
    async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError>;

    async fn create_reward(&self, draft: &RewardDraft) -> Result<Reward, SyncError>;
    async fn claim_reward(
        &self,
        id: &RewardId,
        child: &ChildId,
    ) -> Result<ClaimOutcome, SyncError>;
    async fn mark_fulfilled(&self, id: &RewardId) -> Result<Reward, SyncError>;
    async fn delete_reward(&self, id: &RewardId) -> Result<(), SyncError>;
}

/// Application-state service consumed by the presentation layer: command
/// methods per entity plus derived-balance queries.
pub struct AppService<B> {
    backend: B,
    snapshot: Snapshot,
}

impl<B: Backend> AppService<B> {
    pub async fn connect(backend: B) -> Result<Self, SyncError> {
        let snapshot = backend.load().await?;
        Ok(Self { backend, snapshot })
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn balances(&self, child: &ChildId) -> Balance {
        self.snapshot.balances(child)
    }

    /// Reconciliation path: replace the whole snapshot with authoritative
    /// state, correcting any drift left behind by tentative updates.
    pub async fn refresh(&mut self) -> Result<(), SyncError> {
        self.snapshot = self.backend.load().await?;
        Ok(())
    }

    pub async fn create_child(&mut self, draft: ChildDraft) -> Result<Child, SyncError> {
        if draft.name.trim().is_empty() {
            return Err(SyncError::Invalid("name required".into()));
        }
        let child = self.backend.create_child(&draft).await?;
        self.snapshot.children.push(child.clone());
        Ok(child)
    }

    /// Removes the child and everything attributed to them: their tasks and
    /// the claims they made (claimed rewards open up again).
    pub async fn delete_child(&mut self, id: &ChildId) -> Result<(), SyncError> {
        self.backend.delete_child(id).await?;
        self.snapshot.children.retain(|c| &c.id != id);
        self.snapshot.tasks.retain(|t| &t.child_id != id);
        for reward in &mut self.snapshot.rewards {
            if reward.claimed_by.as_ref() == Some(id) {
                reward.claimed = false;
                reward.claimed_by = None;
                reward.claimed_at = None;
            }
        }
        Ok(())
    }

    pub async fn create_task(&mut self, draft: TaskDraft) -> Result<Task, SyncError> {
        if draft.points <= 0 {
            return Err(SyncError::Invalid("points must be positive".into()));
        }
        if self.snapshot.child(&draft.child_id).is_none() {
            return Err(DomainError::InvalidChild(draft.child_id.clone()).into());
        }
        let task = self.backend.create_task(&draft).await?;
        self.snapshot.tasks.push(task.clone());
        Ok(task)
    }

    pub async fn submit_task(
        &mut self,
        id: &TaskId,
        photo: Option<String>,
    ) -> Result<Task, SyncError> {
        let saved = self.snapshot.clone();
        {
            let task = self
                .snapshot
                .task_mut(id)
                .ok_or_else(|| stale("task", id))?;
            task.status = task.status.submit()?;
            task.completed_at = Some(now_utc());
            task.photo_proof = photo.clone();
        }
        match self.backend.submit_task(id, photo).await {
            Ok(task) => {
                self.snapshot.replace_task(task.clone());
                Ok(task)
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "submit failed; reverting tentative update");
                self.snapshot = saved;
                Err(e)
            }
        }
    }

    pub async fn approve_task(&mut self, id: &TaskId) -> Result<ApproveOutcome, SyncError> {
        let saved = self.snapshot.clone();
        let (child_id, points) = {
            let task = self
                .snapshot
                .task_mut(id)
                .ok_or_else(|| stale("task", id))?;
            task.status = task.status.approve()?;
            task.approved_at = Some(now_utc());
            (task.child_id.clone(), task.points.0)
        };
        // Tentative credit for a responsive view; the authoritative balance
        // replaces it below.
        if let Some(child) = self.snapshot.child_mut(&child_id) {
            child.total_points.0 += points;
            child.current_points.0 += points;
        }
        match self.backend.approve_task(id).await {
            Ok(outcome) => {
                self.snapshot.replace_task(outcome.task.clone());
                if let Some(successor) = &outcome.successor {
                    self.snapshot.replace_task(successor.clone());
                }
                self.snapshot.apply_balance(&child_id, outcome.balance);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "approve failed; reverting tentative update");
                self.snapshot = saved;
                Err(e)
            }
        }
    }

    pub async fn reject_task(&mut self, id: &TaskId) -> Result<Task, SyncError> {
        let saved = self.snapshot.clone();
        {
            let task = self
                .snapshot
                .task_mut(id)
                .ok_or_else(|| stale("task", id))?;
            task.status = task.status.reject()?;
            task.completed_at = None;
            task.photo_proof = None;
        }
        match self.backend.reject_task(id).await {
            Ok(task) => {
                self.snapshot.replace_task(task.clone());
                Ok(task)
            }
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "reject failed; reverting tentative update");
                self.snapshot = saved;
                Err(e)
            }
        }
    }

    /// Deletion never reverses an approval's credit: an approved task is
    /// archived locally (and server-side) so the earned sum survives.
    pub async fn delete_task(&mut self, id: &TaskId) -> Result<(), SyncError> {
        self.backend.delete_task(id).await?;
        let approved = self
            .snapshot
            .task(id)
            .map(|t| t.status == TaskStatus::Approved);
        match approved {
            Some(true) => {
                if let Some(task) = self.snapshot.task_mut(id) {
                    task.archived = true;
                }
            }
            Some(false) => self.snapshot.tasks.retain(|t| &t.id != id),
            None => {}
        }
        Ok(())
    }

    pub async fn create_reward(&mut self, draft: RewardDraft) -> Result<Reward, SyncError> {
        if draft.points_required <= 0 {
            return Err(SyncError::Invalid("points_required must be positive".into()));
        }
        let reward = self.backend.create_reward(&draft).await?;
        self.snapshot.rewards.push(reward.clone());
        Ok(reward)
    }

    pub async fn claim_reward(
        &mut self,
        id: &RewardId,
        child: &ChildId,
    ) -> Result<ClaimOutcome, SyncError> {
        // Pre-flight eligibility on the local records. The backend re-derives
        // the balance from its own records before accepting.
        {
            let reward = self.snapshot.reward(id).ok_or_else(|| stale("reward", id))?;
            if reward.claimed {
                return Err(DomainError::AlreadyClaimed.into());
            }
            if self.snapshot.child(child).is_none() {
                return Err(DomainError::InvalidChild(child.clone()).into());
            }
            let balance = self.snapshot.balances(child);
            if balance.current < reward.points_required {
                return Err(DomainError::InsufficientPoints {
                    available: balance.current.0,
                    required: reward.points_required.0,
                }
                .into());
            }
        }
        let saved = self.snapshot.clone();
        let debit = {
            let reward = self
                .snapshot
                .reward_mut(id)
                .ok_or_else(|| stale("reward", id))?;
            reward.claimed = true;
            reward.claimed_by = Some(child.clone());
            reward.claimed_at = Some(now_utc());
            reward.points_required.0
        };
        if let Some(c) = self.snapshot.child_mut(child) {
            c.current_points.0 -= debit;
        }
        match self.backend.claim_reward(id, child).await {
            Ok(outcome) => {
                self.snapshot.replace_reward(outcome.reward.clone());
                self.snapshot.apply_balance(child, outcome.balance);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(reward = %id, error = %e, "claim failed; reverting tentative update");
                self.snapshot = saved;
                Err(e)
            }
        }
    }

    pub async fn mark_fulfilled(&mut self, id: &RewardId) -> Result<Reward, SyncError> {
        let reward = self.backend.mark_fulfilled(id).await?;
        self.snapshot.replace_reward(reward.clone());
        Ok(reward)
    }

    /// Soft delete: the reward leaves the visible list but a recorded claim
    /// stays attributable.
    pub async fn delete_reward(&mut self, id: &RewardId) -> Result<(), SyncError> {
        self.backend.delete_reward(id).await?;
        if let Some(reward) = self.snapshot.reward_mut(id) {
            reward.is_active = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidquest_shared::domain::Points;

    fn child(id: &str) -> Child {
        Child {
            id: ChildId::from(id),
            name: id.to_string(),
            age: None,
            avatar_url: None,
            total_points: Points::zero(),
            current_points: Points::zero(),
        }
    }

    fn task(id: &str, child: &str, points: i32, status: TaskStatus) -> Task {
        Task {
            id: TaskId::from(id),
            child_id: ChildId::from(child),
            title: "title".into(),
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

    fn reward(id: &str, required: i32) -> Reward {
        Reward {
            id: RewardId::from(id),
            title: "prize".into(),
            description: String::new(),
            points_required: Points(required),
            claimed: false,
            claimed_by: None,
            claimed_at: None,
            expires_at: None,
            paid: false,
            is_active: true,
        }
    }

    /// Serves a fixed snapshot and refuses every mutation, standing in for
    /// an unreachable or failing store.
    struct RejectingBackend(Snapshot);

    impl RejectingBackend {
        fn refuse<T>(&self) -> Result<T, SyncError> {
            Err(SyncError::Rejected {
                status: 500,
                message: "refused".into(),
            })
        }
    }

    #[async_trait]
    impl Backend for RejectingBackend {
        async fn load(&self) -> Result<Snapshot, SyncError> {
            Ok(self.0.clone())
        }
        async fn create_child(&self, _draft: &ChildDraft) -> Result<Child, SyncError> {
            self.refuse()
        }
        async fn delete_child(&self, _id: &ChildId) -> Result<(), SyncError> {
            self.refuse()
        }
        async fn create_task(&self, _draft: &TaskDraft) -> Result<Task, SyncError> {
            self.refuse()
        }
        async fn submit_task(
            &self,
            _id: &TaskId,
            _photo: Option<String>,
        ) -> Result<Task, SyncError> {
            self.refuse()
        }
        async fn approve_task(&self, _id: &TaskId) -> Result<ApproveOutcome, SyncError> {
            self.refuse()
        }
        async fn reject_task(&self, _id: &TaskId) -> Result<Task, SyncError> {
            self.refuse()
        }
        async fn delete_task(&self, _id: &TaskId) -> Result<(), SyncError> {
            self.refuse()
        }
        async fn create_reward(&self, _draft: &RewardDraft) -> Result<Reward, SyncError> {
            self.refuse()
        }
        async fn claim_reward(
            &self,
            _id: &RewardId,
            _child: &ChildId,
        ) -> Result<ClaimOutcome, SyncError> {
            self.refuse()
        }
        async fn mark_fulfilled(&self, _id: &RewardId) -> Result<Reward, SyncError> {
            self.refuse()
        }
        async fn delete_reward(&self, _id: &RewardId) -> Result<(), SyncError> {
            self.refuse()
        }
    }

    fn fixture() -> Snapshot {
        Snapshot {
            children: vec![child("alice")],
            tasks: vec![task("t1", "alice", 10, TaskStatus::Pending)],
            rewards: vec![reward("r1", 5)],
        }
    }

    #[tokio::test]
    async fn failed_approve_reverts_tentative_update() {
        let mut svc = AppService::connect(RejectingBackend(fixture())).await.unwrap();
        let err = svc.approve_task(&TaskId::from("t1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 500, .. }));
        let snap = svc.snapshot();
        assert_eq!(snap.task(&TaskId::from("t1")).unwrap().status, TaskStatus::Pending);
        assert_eq!(
            snap.child(&ChildId::from("alice")).unwrap().total_points,
            Points(0)
        );
    }

    #[tokio::test]
    async fn failed_submit_keeps_photo_clear() {
        let mut svc = AppService::connect(RejectingBackend(fixture())).await.unwrap();
        let err = svc
            .submit_task(&TaskId::from("t1"), Some("photo-bytes".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { .. }));
        let t = svc.snapshot().task(&TaskId::from("t1")).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.photo_proof.is_none());
        assert!(t.completed_at.is_none());
    }

    #[tokio::test]
    async fn approve_is_rejected_locally_from_approved() {
        let mut snap = fixture();
        snap.tasks[0].status = TaskStatus::Approved;
        let mut svc = AppService::connect(RejectingBackend(snap)).await.unwrap();
        let err = svc.approve_task(&TaskId::from("t1")).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Domain(DomainError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn claim_with_insufficient_points_never_reaches_backend() {
        // The backend refuses everything, so getting InsufficientPoints back
        // proves the pre-flight check fired first and nothing was mutated.
        let mut svc = AppService::connect(RejectingBackend(fixture())).await.unwrap();
        let err = svc
            .claim_reward(&RewardId::from("r1"), &ChildId::from("alice"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Domain(DomainError::InsufficientPoints {
                available: 0,
                required: 5
            })
        ));
        assert!(!svc.snapshot().reward(&RewardId::from("r1")).unwrap().claimed);
    }

    #[tokio::test]
    async fn visible_tasks_sort_pending_first_then_newest() {
        let mut snap = fixture();
        let mut done = task("t2", "alice", 3, TaskStatus::Approved);
        done.created_at = now_utc() + time::Duration::hours(1);
        let mut newer = task("t3", "alice", 3, TaskStatus::Pending);
        newer.created_at = now_utc() + time::Duration::hours(2);
        snap.tasks.push(done);
        snap.tasks.push(newer);
        let svc = AppService::connect(RejectingBackend(snap)).await.unwrap();
        let order: Vec<&str> = svc
            .snapshot()
            .visible_tasks()
            .iter()
            .map(|t| t.id.0.as_str())
            .collect();
        assert_eq!(order, vec!["t3", "t1", "t2"]);
    }
}
