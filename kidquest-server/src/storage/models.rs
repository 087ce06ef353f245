use crate::storage::schema::{children, reward_redemptions, rewards, sessions, tasks, users};
use chrono::NaiveDateTime;
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: String,
    pub family_code: Option<String>,
    pub parent_id: Option<String>,
    pub age: Option<i32>,
    pub created_at: NaiveDateTime,
}

impl User {
    /// Family scope the account belongs to: a parent's own id, a child
    /// account's parent back-reference.
    pub fn family_id(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub name: &'a str,
    pub password_hash: &'a str,
    pub role: &'a str,
    pub family_code: Option<&'a str>,
    pub parent_id: Option<&'a str>,
    pub age: Option<i32>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = children)]
#[diesel(belongs_to(User, foreign_key = parent_id))]
pub struct Child {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub age: Option<i32>,
    pub avatar_url: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = children)]
pub struct NewChild<'a> {
    pub id: &'a str,
    pub parent_id: &'a str,
    pub name: &'a str,
    pub age: Option<i32>,
    pub avatar_url: Option<&'a str>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Task {
    pub id: String,
    pub child_id: String,
    pub title: String,
    pub description: String,
    pub points: i32,
    pub status: String,
    pub is_recurring: bool,
    pub challenge_period: Option<String>,
    pub due_date: Option<NaiveDateTime>,
    pub photo_proof: Option<String>,
    pub reward_id: Option<String>,
    pub archived: bool,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub approved_at: Option<NaiveDateTime>,
    pub last_recurred_at: Option<NaiveDateTime>,
}

#[derive(Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub child_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub points: i32,
    pub status: &'a str,
    pub is_recurring: bool,
    pub challenge_period: Option<&'a str>,
    pub due_date: Option<NaiveDateTime>,
    pub photo_proof: Option<&'a str>,
    pub reward_id: Option<&'a str>,
    pub created_at: NaiveDateTime,
    pub last_recurred_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = rewards)]
#[diesel(belongs_to(User, foreign_key = parent_id))]
pub struct Reward {
    pub id: String,
    pub parent_id: String,
    pub title: String,
    pub description: String,
    pub points_required: i32,
    pub expires_at: Option<NaiveDateTime>,
    pub paid: bool,
    pub is_active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = rewards)]
pub struct NewReward<'a> {
    pub id: &'a str,
    pub parent_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub points_required: i32,
    pub expires_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = reward_redemptions)]
#[diesel(belongs_to(Reward, foreign_key = reward_id))]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Redemption {
    pub id: i32,
    pub reward_id: String,
    pub child_id: String,
    pub points_spent: i32,
    pub redeemed_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = reward_redemptions)]
pub struct NewRedemption<'a> {
    pub reward_id: &'a str,
    pub child_id: &'a str,
    pub points_spent: i32,
    pub redeemed_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession<'a> {
    pub jti: &'a str,
    pub user_id: &'a str,
}
