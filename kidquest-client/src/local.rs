//! Local persistence mode: the whole family state lives in one serialized
//! JSON record with RFC 3339 date strings, written through the debounced
//! writer. Accounts are kept beside it, with credentials in a separate map
//! keyed by account id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use kidquest_shared::auth::Role;
use kidquest_shared::domain::{
    Child, ChildId, DomainError, Points, Reward, RewardId, Task, TaskId, TaskStatus, UserAccount,
    UserId, balances_for, generate_family_code, now_utc,
};

use crate::persist::{DEFAULT_DEBOUNCE, DebouncedWriter};
use crate::state::{
    ApproveOutcome, Backend, ChildDraft, ClaimOutcome, RewardDraft, Snapshot, SyncError,
    TaskDraft,
};

const FAMILY_CODE_ATTEMPTS: usize = 32;

/// On-disk layout of the local mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRecord {
    pub profile: Option<Role>,
    pub children: Vec<Child>,
    pub tasks: Vec<Task>,
    pub rewards: Vec<Reward>,
}

pub struct LocalBackend {
    record: Arc<Mutex<StateRecord>>,
    writer: DebouncedWriter,
}

impl LocalBackend {
    pub async fn open(path: PathBuf, window: Duration) -> Result<Self, SyncError> {
        let record = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                SyncError::Persistence(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateRecord::default(),
            Err(e) => return Err(SyncError::Persistence(e.to_string())),
        };
        Ok(Self {
            record: Arc::new(Mutex::new(record)),
            writer: DebouncedWriter::spawn(path, window),
        })
    }

    pub async fn open_default() -> Result<Self, SyncError> {
        Ok(Self::open(data_dir()?.join("state.json"), DEFAULT_DEBOUNCE).await?)
    }

    pub async fn set_profile(&self, profile: Option<Role>) {
        let mut record = self.record.lock().await;
        record.profile = profile;
        self.persist(&record);
    }

    pub async fn profile(&self) -> Option<Role> {
        self.record.lock().await.profile
    }

    fn persist(&self, record: &StateRecord) {
        match serde_json::to_string_pretty(record) {
            Ok(json) => self.writer.schedule(json),
            Err(e) => tracing::error!(error = %e, "state serialize failed"),
        }
    }

    fn refresh_balances(record: &mut StateRecord) {
        let StateRecord {
            children,
            tasks,
            rewards,
            ..
        } = record;
        for child in children.iter_mut() {
            let balance = balances_for(&child.id, tasks, rewards);
            child.total_points = balance.total;
            child.current_points = balance.current;
        }
    }
}

pub fn data_dir() -> Result<PathBuf, SyncError> {
    directories::ProjectDirs::from("", "", "kidquest")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| SyncError::Persistence("no usable home directory".into()))
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    async fn load(&self) -> Result<Snapshot, SyncError> {
        let mut record = self.record.lock().await;
        Self::refresh_balances(&mut record);
        Ok(Snapshot {
            children: record.children.clone(),
            tasks: record.tasks.clone(),
            rewards: record.rewards.clone(),
        })
    }

    async fn create_child(&self, draft: &ChildDraft) -> Result<Child, SyncError> {
        let mut record = self.record.lock().await;
        let child = Child {
            id: ChildId(Uuid::new_v4().to_string()),
            name: draft.name.clone(),
            age: draft.age,
            avatar_url: draft.avatar_url.clone(),
            total_points: Points::zero(),
            current_points: Points::zero(),
        };
        record.children.push(child.clone());
        self.persist(&record);
        Ok(child)
    }

    async fn delete_child(&self, id: &ChildId) -> Result<(), SyncError> {
        let mut record = self.record.lock().await;
        if !record.children.iter().any(|c| &c.id == id) {
            return Err(SyncError::NotFound(format!("child not found: {id}")));
        }
        record.children.retain(|c| &c.id != id);
        record.tasks.retain(|t| &t.child_id != id);
        for reward in &mut record.rewards {
            if reward.claimed_by.as_ref() == Some(id) {
                reward.claimed = false;
                reward.claimed_by = None;
                reward.claimed_at = None;
            }
        }
        Self::refresh_balances(&mut record);
        self.persist(&record);
        Ok(())
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError> {
        let mut record = self.record.lock().await;
        if draft.points <= 0 {
            return Err(SyncError::Invalid("points must be positive".into()));
        }
        if !record.children.iter().any(|c| c.id == draft.child_id) {
            return Err(DomainError::InvalidChild(draft.child_id.clone()).into());
        }
        let task = Task {
            id: TaskId(Uuid::new_v4().to_string()),
            child_id: draft.child_id.clone(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            points: Points(draft.points),
            status: TaskStatus::Pending,
            is_recurring: draft.is_recurring,
            challenge_period: draft.challenge_period,
            created_at: now_utc(),
            due_date: draft.due_date,
            completed_at: None,
            approved_at: None,
            last_recurred_at: None,
            photo_proof: None,
            reward_id: draft.reward_id.clone(),
            archived: false,
        };
        record.tasks.push(task.clone());
        self.persist(&record);
        Ok(task)
    }

    async fn submit_task(&self, id: &TaskId, photo: Option<String>) -> Result<Task, SyncError> {
        let mut record = self.record.lock().await;
        let idx = live_task_index(&record, id)?;
        let task = &mut record.tasks[idx];
        task.status = task.status.submit()?;
        task.completed_at = Some(now_utc());
        task.photo_proof = photo;
        let task = task.clone();
        self.persist(&record);
        Ok(task)
    }

    async fn approve_task(&self, id: &TaskId) -> Result<ApproveOutcome, SyncError> {
        let mut record = self.record.lock().await;
        let idx = live_task_index(&record, id)?;
        let now = now_utc();
        let approved = {
            let task = &mut record.tasks[idx];
            task.status = task.status.approve()?;
            task.approved_at = Some(now);
            task.clone()
        };
        // Recurring templates spawn their next occurrence on approval.
        let successor = approved.is_recurring.then(|| Task {
            id: TaskId(Uuid::new_v4().to_string()),
            child_id: approved.child_id.clone(),
            title: approved.title.clone(),
            description: approved.description.clone(),
            points: approved.points,
            status: TaskStatus::Pending,
            is_recurring: true,
            challenge_period: approved.challenge_period,
            created_at: now,
            due_date: approved.due_date,
            completed_at: None,
            approved_at: None,
            last_recurred_at: Some(now),
            photo_proof: None,
            reward_id: approved.reward_id.clone(),
            archived: false,
        });
        if let Some(successor) = &successor {
            record.tasks.push(successor.clone());
        }
        Self::refresh_balances(&mut record);
        self.persist(&record);
        let balance = balances_for(&approved.child_id, &record.tasks, &record.rewards);
        Ok(ApproveOutcome {
            task: approved,
            successor,
            balance,
        })
    }

    async fn reject_task(&self, id: &TaskId) -> Result<Task, SyncError> {
        let mut record = self.record.lock().await;
        let idx = live_task_index(&record, id)?;
        let task = &mut record.tasks[idx];
        task.status = task.status.reject()?;
        task.completed_at = None;
        task.photo_proof = None;
        let task = task.clone();
        self.persist(&record);
        Ok(task)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError> {
        let mut record = self.record.lock().await;
        let idx = live_task_index(&record, id)?;
        if record.tasks[idx].status == TaskStatus::Approved {
            record.tasks[idx].archived = true;
        } else {
            record.tasks.remove(idx);
        }
        self.persist(&record);
        Ok(())
    }

    async fn create_reward(&self, draft: &RewardDraft) -> Result<Reward, SyncError> {
        let mut record = self.record.lock().await;
        if draft.points_required <= 0 {
            return Err(SyncError::Invalid("points_required must be positive".into()));
        }
        let reward = Reward {
            id: RewardId(Uuid::new_v4().to_string()),
            title: draft.title.clone(),
            description: draft.description.clone(),
            points_required: Points(draft.points_required),
            claimed: false,
            claimed_by: None,
            claimed_at: None,
            expires_at: draft.expires_at,
            paid: false,
            is_active: true,
        };
        record.rewards.push(reward.clone());
        self.persist(&record);
        Ok(reward)
    }

    async fn claim_reward(
        &self,
        id: &RewardId,
        child: &ChildId,
    ) -> Result<ClaimOutcome, SyncError> {
        let mut record = self.record.lock().await;
        let idx = active_reward_index(&record, id)?;
        if record.rewards[idx].claimed {
            return Err(DomainError::AlreadyClaimed.into());
        }
        if !record.children.iter().any(|c| &c.id == child) {
            return Err(DomainError::InvalidChild(child.clone()).into());
        }
        // Re-derive eligibility from the records rather than the cached
        // child counters.
        let balance = balances_for(child, &record.tasks, &record.rewards);
        let required = record.rewards[idx].points_required;
        if balance.current < required {
            return Err(DomainError::InsufficientPoints {
                available: balance.current.0,
                required: required.0,
            }
            .into());
        }
        {
            let reward = &mut record.rewards[idx];
            reward.claimed = true;
            reward.claimed_by = Some(child.clone());
            reward.claimed_at = Some(now_utc());
        }
        Self::refresh_balances(&mut record);
        self.persist(&record);
        let balance = balances_for(child, &record.tasks, &record.rewards);
        Ok(ClaimOutcome {
            reward: record.rewards[idx].clone(),
            balance,
        })
    }

    async fn mark_fulfilled(&self, id: &RewardId) -> Result<Reward, SyncError> {
        let mut record = self.record.lock().await;
        let idx = active_reward_index(&record, id)?;
        if !record.rewards[idx].claimed {
            return Err(SyncError::Invalid("reward has not been claimed".into()));
        }
        record.rewards[idx].paid = true;
        let reward = record.rewards[idx].clone();
        self.persist(&record);
        Ok(reward)
    }

    async fn delete_reward(&self, id: &RewardId) -> Result<(), SyncError> {
        let mut record = self.record.lock().await;
        let idx = active_reward_index(&record, id)?;
        record.rewards[idx].is_active = false;
        self.persist(&record);
        Ok(())
    }
}

fn live_task_index(record: &StateRecord, id: &TaskId) -> Result<usize, SyncError> {
    record
        .tasks
        .iter()
        .position(|t| &t.id == id && !t.archived)
        .ok_or_else(|| SyncError::NotFound(format!("task not found: {id}")))
}

fn active_reward_index(record: &StateRecord, id: &RewardId) -> Result<usize, SyncError> {
    record
        .rewards
        .iter()
        .position(|r| &r.id == id && r.is_active)
        .ok_or_else(|| SyncError::NotFound(format!("reward not found: {id}")))
}

// ---- accounts ----

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
    pub family_code: Option<String>,
    pub age: Option<i32>,
}

const USERS_FILE: &str = "users.json";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Account registry for the local mode. The public account list and the
/// credential map live in separate files; credentials are bcrypt hashes
/// keyed by account id, never plaintext.
pub struct LocalAccounts {
    dir: PathBuf,
    users: Vec<UserAccount>,
    credentials: HashMap<String, String>,
}

impl LocalAccounts {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        let users = read_json_or_default(&dir.join(USERS_FILE))?;
        let credentials = read_json_or_default(&dir.join(CREDENTIALS_FILE))?;
        Ok(Self {
            dir,
            users,
            credentials,
        })
    }

    pub fn users(&self) -> &[UserAccount] {
        &self.users
    }

    pub fn register(&mut self, account: NewAccount) -> Result<UserAccount, SyncError> {
        if self.users.iter().any(|u| u.email == account.email) {
            return Err(DomainError::DuplicateEmail.into());
        }
        let (family_code, parent_id) = match account.role {
            Role::Parent => (Some(self.allocate_family_code()?), None),
            Role::Child => {
                let supplied = account
                    .family_code
                    .as_deref()
                    .ok_or_else(|| SyncError::Invalid("family code required".into()))?;
                // Case-sensitive match against parent accounts only.
                let parent = self
                    .users
                    .iter()
                    .find(|u| {
                        u.role == Role::Parent && u.family_code.as_deref() == Some(supplied)
                    })
                    .ok_or(DomainError::InvalidFamilyCode)?;
                (None, Some(parent.id.clone()))
            }
        };
        let hash = bcrypt::hash(&account.password, bcrypt::DEFAULT_COST)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        let user = UserAccount {
            id: UserId(Uuid::new_v4().to_string()),
            email: account.email,
            name: account.name,
            role: account.role,
            family_code,
            parent_id,
            age: account.age,
            created_at: now_utc(),
        };
        self.users.push(user.clone());
        self.credentials.insert(user.id.0.clone(), hash);
        self.save()?;
        Ok(user)
    }

    /// Unknown email and wrong password fail identically.
    pub fn login(&self, email: &str, password: &str) -> Result<UserAccount, SyncError> {
        let user = self
            .users
            .iter()
            .find(|u| u.email == email)
            .ok_or(DomainError::InvalidCredentials)?;
        let hash = self
            .credentials
            .get(&user.id.0)
            .ok_or(DomainError::InvalidCredentials)?;
        let ok = bcrypt::verify(password, hash).map_err(|e| {
            tracing::error!(error = %e, "credential verify failed");
            SyncError::Persistence(e.to_string())
        })?;
        if !ok {
            return Err(DomainError::InvalidCredentials.into());
        }
        Ok(user.clone())
    }

    fn allocate_family_code(&self) -> Result<String, SyncError> {
        for _ in 0..FAMILY_CODE_ATTEMPTS {
            let code = generate_family_code();
            if !self
                .users
                .iter()
                .any(|u| u.family_code.as_deref() == Some(code.as_str()))
            {
                return Ok(code);
            }
        }
        Err(SyncError::Persistence(
            "could not allocate a unique family code".into(),
        ))
    }

    fn save(&self) -> Result<(), SyncError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SyncError::Persistence(e.to_string()))?;
        write_json(&self.dir.join(USERS_FILE), &self.users)?;
        write_json(&self.dir.join(CREDENTIALS_FILE), &self.credentials)?;
        Ok(())
    }
}

fn read_json_or_default<T: Default + for<'de> Deserialize<'de>>(
    path: &std::path::Path,
) -> Result<T, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| SyncError::Persistence(format!("corrupt file {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(SyncError::Persistence(e.to_string())),
    }
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<(), SyncError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| SyncError::Persistence(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| SyncError::Persistence(e.to_string()))
}
