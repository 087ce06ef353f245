use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use super::API_V1_PREFIX;

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

fn enc(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

pub fn auth_register(base: &str) -> String {
    base_join(base, &format!("{}/auth/register", API_V1_PREFIX))
}
pub fn auth_login(base: &str) -> String {
    base_join(base, &format!("{}/auth/login", API_V1_PREFIX))
}
pub fn auth_logout(base: &str) -> String {
    base_join(base, &format!("{}/auth/logout", API_V1_PREFIX))
}
pub fn children(base: &str) -> String {
    base_join(base, &format!("{}/children", API_V1_PREFIX))
}
pub fn child(base: &str, child_id: &str) -> String {
    base_join(base, &format!("{}/children/{}", API_V1_PREFIX, enc(child_id)))
}
pub fn child_balance(base: &str, child_id: &str) -> String {
    base_join(
        base,
        &format!("{}/children/{}/balance", API_V1_PREFIX, enc(child_id)),
    )
}
pub fn tasks(base: &str) -> String {
    base_join(base, &format!("{}/tasks", API_V1_PREFIX))
}
pub fn task(base: &str, task_id: &str) -> String {
    base_join(base, &format!("{}/tasks/{}", API_V1_PREFIX, enc(task_id)))
}
pub fn task_submit(base: &str, task_id: &str) -> String {
    base_join(
        base,
        &format!("{}/tasks/{}/submit", API_V1_PREFIX, enc(task_id)),
    )
}
pub fn task_approve(base: &str, task_id: &str) -> String {
    base_join(
        base,
        &format!("{}/tasks/{}/approve", API_V1_PREFIX, enc(task_id)),
    )
}
pub fn task_reject(base: &str, task_id: &str) -> String {
    base_join(
        base,
        &format!("{}/tasks/{}/reject", API_V1_PREFIX, enc(task_id)),
    )
}
pub fn rewards(base: &str) -> String {
    base_join(base, &format!("{}/rewards", API_V1_PREFIX))
}
pub fn reward(base: &str, reward_id: &str) -> String {
    base_join(base, &format!("{}/rewards/{}", API_V1_PREFIX, enc(reward_id)))
}
pub fn reward_claim(base: &str, reward_id: &str) -> String {
    base_join(
        base,
        &format!("{}/rewards/{}/claim", API_V1_PREFIX, enc(reward_id)),
    )
}
pub fn reward_fulfill(base: &str, reward_id: &str) -> String {
    base_join(
        base,
        &format!("{}/rewards/{}/fulfill", API_V1_PREFIX, enc(reward_id)),
    )
}
