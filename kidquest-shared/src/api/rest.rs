//! Minimal REST client helpers for consumers (clients).

use super::endpoints as ep;
use super::*;
use once_cell::sync::Lazy;
use std::time::Duration;

pub use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("http: {0}")]
    Http(String),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("serde: {0}")]
    Serde(String),
}

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .tcp_keepalive(Some(Duration::from_secs(180)))
        .pool_max_idle_per_host(4)
        .pool_idle_timeout(Duration::from_secs(180))
        .timeout(Duration::from_secs(180))
        .build()
        .expect("failed to build HTTP client")
});

fn mk_client() -> Result<reqwest::Client, RestError> {
    Ok(HTTP_CLIENT.clone())
}

async fn handle_json<T: for<'de> serde::Deserialize<'de>>(
    res: reqwest::Response,
) -> Result<T, RestError> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(RestError::Status {
            status: status.as_u16(),
            body,
        });
    }
    res.json::<T>()
        .await
        .map_err(|e| RestError::Serde(e.to_string()))
}

async fn handle_empty(res: reqwest::Response) -> Result<(), RestError> {
    let status = res.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = res.text().await.unwrap_or_default();
        Err(RestError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

async fn post_json<B: serde::Serialize, T: for<'de> serde::Deserialize<'de>>(
    url: String,
    bearer: Option<&str>,
    body: &B,
) -> Result<T, RestError> {
    let client = mk_client()?;
    let mut req = client.post(url).json(body);
    if let Some(t) = bearer {
        req = req.bearer_auth(t);
    }
    let res = req.send().await.map_err(|e| RestError::Http(e.to_string()))?;
    handle_json(res).await
}

async fn post_empty_body<T: for<'de> serde::Deserialize<'de>>(
    url: String,
    bearer: &str,
) -> Result<T, RestError> {
    let client = mk_client()?;
    let res = client
        .post(url)
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| RestError::Http(e.to_string()))?;
    handle_json(res).await
}

async fn get_json<T: for<'de> serde::Deserialize<'de>>(
    url: String,
    bearer: &str,
) -> Result<T, RestError> {
    let client = mk_client()?;
    let res = client
        .get(url)
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| RestError::Http(e.to_string()))?;
    handle_json(res).await
}

async fn delete(url: String, bearer: &str) -> Result<(), RestError> {
    let client = mk_client()?;
    let res = client
        .delete(url)
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| RestError::Http(e.to_string()))?;
    handle_empty(res).await
}

pub async fn register(base: &str, req: &RegisterReq) -> Result<AuthResp, RestError> {
    post_json(ep::auth_register(base), None, req).await
}

pub async fn login(base: &str, req: &AuthReq) -> Result<AuthResp, RestError> {
    post_json(ep::auth_login(base), None, req).await
}

pub async fn logout(base: &str, bearer: &str) -> Result<(), RestError> {
    let client = mk_client()?;
    let res = client
        .post(ep::auth_logout(base))
        .bearer_auth(bearer)
        .send()
        .await
        .map_err(|e| RestError::Http(e.to_string()))?;
    handle_empty(res).await
}

pub async fn list_children(base: &str, bearer: &str) -> Result<Vec<ChildDto>, RestError> {
    get_json(ep::children(base), bearer).await
}

pub async fn create_child(
    base: &str,
    bearer: &str,
    req: &NewChildReq,
) -> Result<ChildDto, RestError> {
    post_json(ep::children(base), Some(bearer), req).await
}

pub async fn delete_child(base: &str, bearer: &str, child_id: &str) -> Result<(), RestError> {
    delete(ep::child(base, child_id), bearer).await
}

pub async fn child_balance(
    base: &str,
    bearer: &str,
    child_id: &str,
) -> Result<BalanceDto, RestError> {
    get_json(ep::child_balance(base, child_id), bearer).await
}

pub async fn list_tasks(base: &str, bearer: &str) -> Result<Vec<TaskDto>, RestError> {
    get_json(ep::tasks(base), bearer).await
}

pub async fn create_task(
    base: &str,
    bearer: &str,
    req: &CreateTaskReq,
) -> Result<TaskDto, RestError> {
    post_json(ep::tasks(base), Some(bearer), req).await
}

pub async fn submit_task(
    base: &str,
    bearer: &str,
    task_id: &str,
    req: &SubmitTaskReq,
) -> Result<TaskDto, RestError> {
    post_json(ep::task_submit(base, task_id), Some(bearer), req).await
}

pub async fn approve_task(
    base: &str,
    bearer: &str,
    task_id: &str,
) -> Result<TaskActionResp, RestError> {
    post_empty_body(ep::task_approve(base, task_id), bearer).await
}

pub async fn reject_task(base: &str, bearer: &str, task_id: &str) -> Result<TaskDto, RestError> {
    post_empty_body(ep::task_reject(base, task_id), bearer).await
}

pub async fn delete_task(base: &str, bearer: &str, task_id: &str) -> Result<(), RestError> {
    delete(ep::task(base, task_id), bearer).await
}

pub async fn list_rewards(base: &str, bearer: &str) -> Result<Vec<RewardDto>, RestError> {
    get_json(ep::rewards(base), bearer).await
}

pub async fn create_reward(
    base: &str,
    bearer: &str,
    req: &CreateRewardReq,
) -> Result<RewardDto, RestError> {
    post_json(ep::rewards(base), Some(bearer), req).await
}

pub async fn claim_reward(
    base: &str,
    bearer: &str,
    reward_id: &str,
    req: &ClaimReq,
) -> Result<ClaimResp, RestError> {
    post_json(ep::reward_claim(base, reward_id), Some(bearer), req).await
}

pub async fn fulfill_reward(
    base: &str,
    bearer: &str,
    reward_id: &str,
) -> Result<RewardDto, RestError> {
    post_empty_body(ep::reward_fulfill(base, reward_id), bearer).await
}

pub async fn delete_reward(base: &str, bearer: &str, reward_id: &str) -> Result<(), RestError> {
    delete(ep::reward(base, reward_id), bearer).await
}
