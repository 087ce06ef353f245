pub mod models;
pub mod schema;

use chrono::{NaiveDateTime, Utc};
use diesel::dsl::sum;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use kidquest_shared::auth::Role;
use kidquest_shared::domain::{
    ChildId, DomainError, ParseEnumError, TaskStatus, generate_family_code,
};
use models::{
    Child, NewChild, NewRedemption, NewReward, NewSession, NewTask, NewUser, Redemption, Reward,
    Task, User,
};
use tracing::trace;
use uuid::Uuid;

/// Structured error type for all storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A Diesel ORM error (query failure, constraint violation, etc.)
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Failed to acquire or build a connection from the pool.
    #[error("pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    /// A `spawn_blocking` task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A database migration failed to apply.
    #[error("migration error: {0}")]
    Migration(String),

    /// The caller supplied invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested record does not exist in the caller's family scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// A business rule rejected the mutation before any state change.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Owned registration parameters; the password is already hashed by the
/// caller, plaintext never reaches this layer.
#[derive(Debug, Clone)]
pub struct RegisterUser {
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: Role,
    pub family_code: Option<String>,
    pub age: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewTaskParams {
    pub child_id: String,
    pub title: String,
    pub description: String,
    pub points: i32,
    pub is_recurring: bool,
    pub challenge_period: Option<String>,
    pub due_date: Option<NaiveDateTime>,
    pub reward_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRewardParams {
    pub title: String,
    pub description: String,
    pub points_required: i32,
    pub expires_at: Option<NaiveDateTime>,
}

const FAMILY_CODE_ATTEMPTS: usize = 32;

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    pub async fn connect_sqlite(path: &str) -> Result<Self, StorageError> {
        let url = path.to_string();
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(8).build(manager)?;

        // Run pending Diesel migrations on startup (auto-init empty DBs)
        {
            let pool_clone = pool.clone();
            tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
                const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
                let mut conn = pool_clone.get()?;
                configure_sqlite_conn(&mut conn)?;
                conn.run_pending_migrations(MIGRATIONS)
                    .map_err(|e| StorageError::Migration(e.to_string()))?;
                Ok(())
            })
            .await??;
        }

        Ok(Store { pool })
    }

    // ---- accounts ----

    pub async fn register_user(&self, params: RegisterUser) -> Result<User, StorageError> {
        use schema::users;
        let pool = self.pool.clone();
        trace!(email = %params.email, role = ?params.role, "register_user starting");
        tokio::task::spawn_blocking(move || -> Result<User, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            conn.immediate_transaction(|conn| -> Result<User, StorageError> {
                let taken: i64 = users::table
                    .filter(users::email.eq(&params.email))
                    .count()
                    .get_result(conn)?;
                if taken > 0 {
                    return Err(DomainError::DuplicateEmail.into());
                }

                let (family_code, parent_id) = match params.role {
                    Role::Parent => (Some(allocate_family_code(conn)?), None),
                    Role::Child => {
                        let supplied = params.family_code.as_deref().ok_or_else(|| {
                            StorageError::InvalidInput("family code required".into())
                        })?;
                        // Case-sensitive lookup against parent accounts only.
                        let parent: Option<String> = users::table
                            .filter(users::family_code.eq(supplied))
                            .filter(users::role.eq(Role::Parent.as_str()))
                            .select(users::id)
                            .first(conn)
                            .optional()?;
                        let parent = parent.ok_or(DomainError::InvalidFamilyCode)?;
                        (None, Some(parent))
                    }
                };

                let id = Uuid::new_v4().to_string();
                let now = Utc::now().naive_utc();
                let new_user = NewUser {
                    id: &id,
                    email: &params.email,
                    name: &params.name,
                    password_hash: &params.password_hash,
                    role: params.role.as_str(),
                    family_code: family_code.as_deref(),
                    parent_id: parent_id.as_deref(),
                    age: params.age,
                    created_at: now,
                };
                Ok(diesel::insert_into(users::table)
                    .values(&new_user)
                    .get_result::<User>(conn)?)
            })
        })
        .await?
    }

    pub async fn find_user_by_email(&self, email_: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let needle = email_.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users
                .filter(email.eq(&needle))
                .first::<User>(&mut conn)
                .optional()?)
        })
        .await?
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        use schema::users::dsl::*;
        let pool = self.pool.clone();
        let uid = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<User>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(users.filter(id.eq(&uid)).first::<User>(&mut conn).optional()?)
        })
        .await?
    }

    // ---- children ----

    pub async fn create_child(
        &self,
        family: &str,
        name_: &str,
        age_: Option<i32>,
        avatar: Option<&str>,
    ) -> Result<Child, StorageError> {
        use schema::children;
        let pool = self.pool.clone();
        let family = family.to_string();
        let name_owned = name_.to_string();
        let avatar_owned = avatar.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<Child, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let id = Uuid::new_v4().to_string();
            let new_child = NewChild {
                id: &id,
                parent_id: &family,
                name: &name_owned,
                age: age_,
                avatar_url: avatar_owned.as_deref(),
                created_at: Utc::now().naive_utc(),
            };
            Ok(diesel::insert_into(children::table)
                .values(&new_child)
                .get_result::<Child>(&mut conn)?)
        })
        .await?
    }

    /// Children of the family with their derived balances, one grouped sum
    /// per source table instead of a query per child.
    pub async fn list_children_with_balances(
        &self,
        family: &str,
    ) -> Result<Vec<(Child, i32, i32)>, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<(Child, i32, i32)>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{children, reward_redemptions, tasks};
            let rows = children::table
                .filter(children::parent_id.eq(&family))
                .order(children::created_at.asc())
                .load::<Child>(&mut conn)?;

            let earned: Vec<(String, Option<i64>)> = tasks::table
                .inner_join(children::table.on(children::id.eq(tasks::child_id)))
                .filter(children::parent_id.eq(&family))
                .filter(tasks::status.eq(TaskStatus::Approved.as_str()))
                .group_by(tasks::child_id)
                .select((tasks::child_id, sum(tasks::points)))
                .load::<(String, Option<i64>)>(&mut conn)?;
            let spent: Vec<(String, Option<i64>)> = reward_redemptions::table
                .inner_join(
                    children::table.on(children::id.eq(reward_redemptions::child_id)),
                )
                .filter(children::parent_id.eq(&family))
                .group_by(reward_redemptions::child_id)
                .select((
                    reward_redemptions::child_id,
                    sum(reward_redemptions::points_spent),
                ))
                .load::<(String, Option<i64>)>(&mut conn)?;

            let earned: std::collections::HashMap<String, i64> = earned
                .into_iter()
                .map(|(cid, s)| (cid, s.unwrap_or(0)))
                .collect();
            let spent: std::collections::HashMap<String, i64> = spent
                .into_iter()
                .map(|(cid, s)| (cid, s.unwrap_or(0)))
                .collect();

            let out = rows
                .into_iter()
                .map(|c| {
                    let total = *earned.get(&c.id).unwrap_or(&0) as i32;
                    let used = *spent.get(&c.id).unwrap_or(&0) as i32;
                    (c, total, total - used)
                })
                .collect();
            Ok(out)
        })
        .await?
    }

    pub async fn get_child(
        &self,
        family: &str,
        child: &str,
    ) -> Result<Option<Child>, StorageError> {
        use schema::children::dsl::*;
        let pool = self.pool.clone();
        let family = family.to_string();
        let cid = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Child>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            Ok(children
                .filter(parent_id.eq(&family))
                .filter(id.eq(&cid))
                .first::<Child>(&mut conn)
                .optional()?)
        })
        .await?
    }

    /// Removes the child together with its tasks and redemptions. Returns
    /// `false` when the child is not in the caller's family.
    pub async fn delete_child(&self, family: &str, child: &str) -> Result<bool, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let cid = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{children, reward_redemptions, tasks};
            conn.immediate_transaction(|conn| -> Result<bool, StorageError> {
                let found: i64 = children::table
                    .filter(children::parent_id.eq(&family))
                    .filter(children::id.eq(&cid))
                    .count()
                    .get_result(conn)?;
                if found == 0 {
                    return Ok(false);
                }
                diesel::delete(
                    reward_redemptions::table.filter(reward_redemptions::child_id.eq(&cid)),
                )
                .execute(conn)?;
                diesel::delete(tasks::table.filter(tasks::child_id.eq(&cid))).execute(conn)?;
                diesel::delete(children::table.filter(children::id.eq(&cid))).execute(conn)?;
                Ok(true)
            })
        })
        .await?
    }

    /// Derives `(total, current)` for a child from the approved-task and
    /// redemption sums. Never reads a stored counter.
    pub async fn compute_balances(&self, child: &str) -> Result<(i32, i32), StorageError> {
        let pool = self.pool.clone();
        let cid = child.to_string();
        tokio::task::spawn_blocking(move || -> Result<(i32, i32), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            balances_on_conn(&mut conn, &cid)
        })
        .await?
    }

    // ---- tasks ----

    pub async fn create_task(
        &self,
        family: &str,
        params: NewTaskParams,
    ) -> Result<Task, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{children, tasks};
            conn.immediate_transaction(|conn| -> Result<Task, StorageError> {
                let owned: i64 = children::table
                    .filter(children::parent_id.eq(&family))
                    .filter(children::id.eq(&params.child_id))
                    .count()
                    .get_result(conn)?;
                if owned == 0 {
                    return Err(
                        DomainError::InvalidChild(ChildId(params.child_id.clone())).into()
                    );
                }
                let id = Uuid::new_v4().to_string();
                let new_task = NewTask {
                    id: &id,
                    child_id: &params.child_id,
                    title: &params.title,
                    description: &params.description,
                    points: params.points,
                    status: TaskStatus::Pending.as_str(),
                    is_recurring: params.is_recurring,
                    challenge_period: params.challenge_period.as_deref(),
                    due_date: params.due_date,
                    photo_proof: None,
                    reward_id: params.reward_id.as_deref(),
                    created_at: Utc::now().naive_utc(),
                    last_recurred_at: None,
                };
                Ok(diesel::insert_into(tasks::table)
                    .values(&new_task)
                    .get_result::<Task>(conn)?)
            })
        })
        .await?
    }

    /// All live (non-archived) tasks of the family, pending first, newest
    /// created first within equal status.
    pub async fn list_tasks(&self, family: &str) -> Result<Vec<Task>, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<Task>, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{children, tasks};
            let mut rows = tasks::table
                .inner_join(children::table.on(children::id.eq(tasks::child_id)))
                .filter(children::parent_id.eq(&family))
                .filter(tasks::archived.eq(false))
                .select(Task::as_select())
                .load::<Task>(&mut conn)?;
            rows.sort_by(|a, b| {
                let rank = |t: &Task| (t.status != TaskStatus::Pending.as_str()) as u8;
                rank(a)
                    .cmp(&rank(b))
                    .then_with(|| b.created_at.cmp(&a.created_at))
            });
            Ok(rows)
        })
        .await?
    }

    pub async fn submit_task(
        &self,
        family: &str,
        task: &str,
        photo: Option<String>,
    ) -> Result<Task, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let tid = task.to_string();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::tasks;
            conn.immediate_transaction(|conn| -> Result<Task, StorageError> {
                let row = load_task_in_family(conn, &family, &tid)?;
                let next = parse_status(&row.status)?.submit()?;
                Ok(diesel::update(tasks::table.filter(tasks::id.eq(&tid)))
                    .set((
                        tasks::status.eq(next.as_str()),
                        tasks::completed_at.eq(Some(Utc::now().naive_utc())),
                        tasks::photo_proof.eq(photo.as_deref()),
                    ))
                    .get_result::<Task>(conn)?)
            })
        })
        .await?
    }

    /// Approves the task and, for recurring templates, spawns the next
    /// occurrence in the same transaction. The points credit is implicit:
    /// balances are derived from approved rows, so committing the status
    /// change is the credit.
    pub async fn approve_task(
        &self,
        family: &str,
        task: &str,
    ) -> Result<(Task, Option<Task>), StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let tid = task.to_string();
        tokio::task::spawn_blocking(move || -> Result<(Task, Option<Task>), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::tasks;
            conn.immediate_transaction(|conn| -> Result<(Task, Option<Task>), StorageError> {
                let row = load_task_in_family(conn, &family, &tid)?;
                let next = parse_status(&row.status)?.approve()?;
                let now = Utc::now().naive_utc();
                let approved = diesel::update(tasks::table.filter(tasks::id.eq(&tid)))
                    .set((
                        tasks::status.eq(next.as_str()),
                        tasks::approved_at.eq(Some(now)),
                    ))
                    .get_result::<Task>(conn)?;

                let successor = if approved.is_recurring {
                    let id = Uuid::new_v4().to_string();
                    let new_task = NewTask {
                        id: &id,
                        child_id: &approved.child_id,
                        title: &approved.title,
                        description: &approved.description,
                        points: approved.points,
                        status: TaskStatus::Pending.as_str(),
                        is_recurring: true,
                        challenge_period: approved.challenge_period.as_deref(),
                        due_date: approved.due_date,
                        photo_proof: None,
                        reward_id: approved.reward_id.as_deref(),
                        created_at: now,
                        last_recurred_at: Some(now),
                    };
                    Some(
                        diesel::insert_into(tasks::table)
                            .values(&new_task)
                            .get_result::<Task>(conn)?,
                    )
                } else {
                    None
                };
                Ok((approved, successor))
            })
        })
        .await?
    }

    pub async fn reject_task(&self, family: &str, task: &str) -> Result<Task, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let tid = task.to_string();
        tokio::task::spawn_blocking(move || -> Result<Task, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::tasks;
            conn.immediate_transaction(|conn| -> Result<Task, StorageError> {
                let row = load_task_in_family(conn, &family, &tid)?;
                let next = parse_status(&row.status)?.reject()?;
                // Back to pending with the completion evidence cleared.
                Ok(diesel::update(tasks::table.filter(tasks::id.eq(&tid)))
                    .set((
                        tasks::status.eq(next.as_str()),
                        tasks::completed_at.eq(None::<NaiveDateTime>),
                        tasks::photo_proof.eq(None::<String>),
                    ))
                    .get_result::<Task>(conn)?)
            })
        })
        .await?
    }

    /// Approved tasks are archived rather than removed so their credit stays
    /// in the ledger; anything else is deleted outright.
    pub async fn delete_task(&self, family: &str, task: &str) -> Result<bool, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let tid = task.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::tasks;
            conn.immediate_transaction(|conn| -> Result<bool, StorageError> {
                let row = match load_task_in_family(conn, &family, &tid) {
                    Ok(row) => row,
                    Err(StorageError::NotFound(_)) => return Ok(false),
                    Err(e) => return Err(e),
                };
                if parse_status(&row.status)? == TaskStatus::Approved {
                    diesel::update(tasks::table.filter(tasks::id.eq(&tid)))
                        .set(tasks::archived.eq(true))
                        .execute(conn)?;
                } else {
                    diesel::delete(tasks::table.filter(tasks::id.eq(&tid))).execute(conn)?;
                }
                Ok(true)
            })
        })
        .await?
    }

    // ---- rewards ----

    pub async fn create_reward(
        &self,
        family: &str,
        params: NewRewardParams,
    ) -> Result<Reward, StorageError> {
        use schema::rewards;
        let pool = self.pool.clone();
        let family = family.to_string();
        tokio::task::spawn_blocking(move || -> Result<Reward, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let id = Uuid::new_v4().to_string();
            let new_reward = NewReward {
                id: &id,
                parent_id: &family,
                title: &params.title,
                description: &params.description,
                points_required: params.points_required,
                expires_at: params.expires_at,
                created_at: Utc::now().naive_utc(),
            };
            Ok(diesel::insert_into(rewards::table)
                .values(&new_reward)
                .get_result::<Reward>(&mut conn)?)
        })
        .await?
    }

    /// Active rewards of the family, newest first, with the redemption row
    /// (claim record) attached where one exists.
    pub async fn list_rewards(
        &self,
        family: &str,
    ) -> Result<Vec<(Reward, Option<Redemption>)>, StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        tokio::task::spawn_blocking(
            move || -> Result<Vec<(Reward, Option<Redemption>)>, StorageError> {
                let mut conn = pool.get()?;
                configure_sqlite_conn(&mut conn)?;
                use schema::{reward_redemptions, rewards};
                Ok(rewards::table
                    .left_join(reward_redemptions::table)
                    .filter(rewards::parent_id.eq(&family))
                    .filter(rewards::is_active.eq(true))
                    .order(rewards::created_at.desc())
                    .select((
                        Reward::as_select(),
                        Option::<Redemption>::as_select(),
                    ))
                    .load::<(Reward, Option<Redemption>)>(&mut conn)?)
            },
        )
        .await?
    }

    /// Claims the reward for the child. Eligibility is re-derived from the
    /// source records inside the transaction; the optimistic balance a
    /// client may hold is never trusted.
    pub async fn claim_reward(
        &self,
        family: &str,
        reward: &str,
        child: &str,
    ) -> Result<(Reward, Redemption), StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let rid = reward.to_string();
        let cid = child.to_string();
        trace!(reward_id = %rid, child_id = %cid, "claim_reward starting");
        tokio::task::spawn_blocking(move || -> Result<(Reward, Redemption), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{children, reward_redemptions, rewards};
            conn.immediate_transaction(|conn| -> Result<(Reward, Redemption), StorageError> {
                let reward_row: Option<Reward> = rewards::table
                    .filter(rewards::parent_id.eq(&family))
                    .filter(rewards::id.eq(&rid))
                    .filter(rewards::is_active.eq(true))
                    .first::<Reward>(conn)
                    .optional()?;
                let reward_row =
                    reward_row.ok_or_else(|| StorageError::NotFound(format!(
                        "reward not found: {rid}"
                    )))?;

                let already: i64 = reward_redemptions::table
                    .filter(reward_redemptions::reward_id.eq(&rid))
                    .count()
                    .get_result(conn)?;
                if already > 0 {
                    return Err(DomainError::AlreadyClaimed.into());
                }

                let owned: i64 = children::table
                    .filter(children::parent_id.eq(&family))
                    .filter(children::id.eq(&cid))
                    .count()
                    .get_result(conn)?;
                if owned == 0 {
                    return Err(DomainError::InvalidChild(ChildId(cid.clone())).into());
                }

                let (_, current) = balances_on_conn(conn, &cid)?;
                if current < reward_row.points_required {
                    return Err(DomainError::InsufficientPoints {
                        available: current,
                        required: reward_row.points_required,
                    }
                    .into());
                }

                let new_redemption = NewRedemption {
                    reward_id: &rid,
                    child_id: &cid,
                    points_spent: reward_row.points_required,
                    redeemed_at: Utc::now().naive_utc(),
                };
                let redemption = diesel::insert_into(reward_redemptions::table)
                    .values(&new_redemption)
                    .get_result::<Redemption>(conn)?;
                Ok((reward_row, redemption))
            })
        })
        .await?
    }

    /// Marks a claimed reward as physically delivered. Points are untouched.
    pub async fn fulfill_reward(
        &self,
        family: &str,
        reward: &str,
    ) -> Result<(Reward, Redemption), StorageError> {
        let pool = self.pool.clone();
        let family = family.to_string();
        let rid = reward.to_string();
        tokio::task::spawn_blocking(move || -> Result<(Reward, Redemption), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            use schema::{reward_redemptions, rewards};
            conn.immediate_transaction(|conn| -> Result<(Reward, Redemption), StorageError> {
                let found: i64 = rewards::table
                    .filter(rewards::parent_id.eq(&family))
                    .filter(rewards::id.eq(&rid))
                    .count()
                    .get_result(conn)?;
                if found == 0 {
                    return Err(StorageError::NotFound(format!("reward not found: {rid}")));
                }
                let redemption: Option<Redemption> = reward_redemptions::table
                    .filter(reward_redemptions::reward_id.eq(&rid))
                    .first::<Redemption>(conn)
                    .optional()?;
                let redemption = redemption.ok_or_else(|| {
                    StorageError::InvalidInput("reward has not been claimed".into())
                })?;
                let updated = diesel::update(rewards::table.filter(rewards::id.eq(&rid)))
                    .set(rewards::paid.eq(true))
                    .get_result::<Reward>(conn)?;
                Ok((updated, redemption))
            })
        })
        .await?
    }

    /// Soft delete: the reward drops out of listings but historical claims
    /// stay attributable.
    pub async fn delete_reward(&self, family: &str, reward: &str) -> Result<bool, StorageError> {
        use schema::rewards::dsl::*;
        let pool = self.pool.clone();
        let family = family.to_string();
        let rid = reward.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let updated = diesel::update(
                rewards
                    .filter(parent_id.eq(&family))
                    .filter(id.eq(&rid))
                    .filter(is_active.eq(true)),
            )
            .set(is_active.eq(false))
            .execute(&mut conn)?;
            Ok(updated > 0)
        })
        .await?
    }

    // ---- sessions (JWT inactivity windows) ----

    pub async fn create_session(&self, jti_: &str, user: &str) -> Result<(), StorageError> {
        use schema::sessions;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        let u = user.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let new = NewSession {
                jti: &j,
                user_id: &u,
            };
            diesel::insert_into(sessions::table)
                .values(&new)
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn delete_session(&self, jti_: &str) -> Result<bool, StorageError> {
        use schema::sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let deleted = diesel::delete(sessions.filter(jti.eq(&j))).execute(&mut conn)?;
            Ok(deleted > 0)
        })
        .await?
    }

    /// Touch session atomically, but only if it hasn't expired.
    /// Returns `true` if the session was found and updated, `false` otherwise.
    ///
    /// This combines the idle timeout check and the `last_used_at` update into
    /// a single atomic UPDATE, eliminating the race condition between checking
    /// and updating the session.
    pub async fn touch_session_with_cutoff(
        &self,
        jti_: &str,
        cutoff: NaiveDateTime,
    ) -> Result<bool, StorageError> {
        use schema::sessions::dsl::*;
        let pool = self.pool.clone();
        let j = jti_.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, StorageError> {
            let mut conn = pool.get()?;
            configure_sqlite_conn(&mut conn)?;
            let now = Utc::now().naive_utc();
            let updated =
                diesel::update(sessions.filter(jti.eq(&j)).filter(last_used_at.ge(cutoff)))
                    .set(last_used_at.eq(now))
                    .execute(&mut conn)?;
            Ok(updated > 0)
        })
        .await?
    }
}

fn allocate_family_code(conn: &mut SqliteConnection) -> Result<String, StorageError> {
    use schema::users;
    for _ in 0..FAMILY_CODE_ATTEMPTS {
        let code = generate_family_code();
        let taken: i64 = users::table
            .filter(users::family_code.eq(&code))
            .count()
            .get_result(conn)?;
        if taken == 0 {
            return Ok(code);
        }
    }
    Err(StorageError::InvalidInput(
        "could not allocate a unique family code".into(),
    ))
}

fn load_task_in_family(
    conn: &mut SqliteConnection,
    family: &str,
    task: &str,
) -> Result<Task, StorageError> {
    use schema::{children, tasks};
    let row: Option<Task> = tasks::table
        .inner_join(children::table.on(children::id.eq(tasks::child_id)))
        .filter(children::parent_id.eq(family))
        .filter(tasks::id.eq(task))
        .filter(tasks::archived.eq(false))
        .select(Task::as_select())
        .first::<Task>(conn)
        .optional()?;
    row.ok_or_else(|| StorageError::NotFound(format!("task not found: {task}")))
}

fn balances_on_conn(
    conn: &mut SqliteConnection,
    child: &str,
) -> Result<(i32, i32), StorageError> {
    use schema::{reward_redemptions, tasks};
    let earned: Option<i64> = tasks::table
        .filter(tasks::child_id.eq(child))
        .filter(tasks::status.eq(TaskStatus::Approved.as_str()))
        .select(sum(tasks::points))
        .first::<Option<i64>>(conn)?;
    let spent: Option<i64> = reward_redemptions::table
        .filter(reward_redemptions::child_id.eq(child))
        .select(sum(reward_redemptions::points_spent))
        .first::<Option<i64>>(conn)?;
    let total = earned.unwrap_or(0) as i32;
    let current = total - spent.unwrap_or(0) as i32;
    Ok((total, current))
}

fn parse_status(s: &str) -> Result<TaskStatus, StorageError> {
    s.parse()
        .map_err(|e: ParseEnumError| StorageError::InvalidInput(e.to_string()))
}

fn configure_sqlite_conn(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    // Enable WAL for better read/write concurrency and set a busy timeout
    // Ignore the result rows; Diesel's execute is fine for PRAGMAs
    diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
    diesel::sql_query("PRAGMA synchronous=NORMAL;").execute(conn)?;
    diesel::sql_query("PRAGMA busy_timeout=5000;").execute(conn)?;
    diesel::sql_query("PRAGMA foreign_keys=ON;").execute(conn)?;
    Ok(())
}
