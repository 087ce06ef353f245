use axum::http::StatusCode;
use kidquest_server::{server, storage};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;

const REGISTER_PATH: &str = "/api/v1/auth/register";
const LOGIN_PATH: &str = "/api/v1/auth/login";

struct TestServer {
    base: String,
    client: Client,
    handle: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let (addr, handle) = match start_server(&db_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to start server: {e}"),
        };
        Some(Self {
            base: format!("http://{}", addr),
            client: Client::new(),
            handle,
            _tempdir: dir,
        })
    }

    /// Registers an account and returns `(token, user)` from the response.
    async fn register(&self, body: Value) -> (String, Value) {
        let resp = self
            .request_expect("POST", REGISTER_PATH, None, Some(body), StatusCode::OK)
            .await;
        let token = resp
            .get("token")
            .and_then(|v| v.as_str())
            .expect("token missing from register response")
            .to_string();
        (token, resp.get("user").cloned().unwrap())
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let url = format!("{}{}", self.base, path);
        let mut req = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "DELETE" => self.client.delete(&url),
            other => panic!("unsupported method {other}"),
        };
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        let val = if text.is_empty() {
            json!(null)
        } else {
            serde_json::from_str(&text).unwrap_or(json!({"raw": text}))
        };
        (status, val)
    }

    async fn request_expect(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
        expected: StatusCode,
    ) -> Value {
        let (status, value) = self.request(method, path, token, body).await;
        assert_eq!(
            status, expected,
            "{method} {path} returned {status:?} with body {value:?}",
        );
        value
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(
    tmp_db: &Path,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let config = server::AppConfig {
        jwt_secret: "testsecret".into(),
        dev_cors_origin: None,
        listen_port: None,
    };

    let store = storage::Store::connect_sqlite(tmp_db.to_str().unwrap())
        .await
        .expect("db");

    let state = server::AppState::new(config, store);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, handle))
}

fn parent_body(email: &str) -> Value {
    json!({
        "email": email,
        "password": "secret123",
        "name": "Parent",
        "role": "parent",
    })
}

async fn setup_family(server: &TestServer) -> (String, String, String) {
    let (parent_token, parent) = server.register(parent_body("parent@example.com")).await;
    let family_code = parent
        .get("family_code")
        .and_then(|v| v.as_str())
        .expect("parent gets a family code")
        .to_string();
    let child = server
        .request_expect(
            "POST",
            "/api/v1/children",
            Some(&parent_token),
            Some(json!({"name": "Alice", "age": 8})),
            StatusCode::OK,
        )
        .await;
    let child_id = child.get("id").unwrap().as_str().unwrap().to_string();
    (parent_token, family_code, child_id)
}

#[tokio::test]
async fn public_endpoints_work() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server
        .request_expect("GET", "/healthz", None, None, StatusCode::OK)
        .await;
    let (token, user) = server.register(parent_body("parent@example.com")).await;
    assert!(!token.is_empty());
    let code = user.get("family_code").unwrap().as_str().unwrap();
    assert_eq!(code.len(), 6);
    assert!(user.get("password_hash").is_none());

    let login = server
        .request_expect(
            "POST",
            LOGIN_PATH,
            None,
            Some(json!({"email": "parent@example.com", "password": "secret123"})),
            StatusCode::OK,
        )
        .await;
    assert!(login.get("token").and_then(|v| v.as_str()).is_some());

    server
        .request_expect(
            "POST",
            LOGIN_PATH,
            None,
            Some(json!({"email": "parent@example.com", "password": "wrong"})),
            StatusCode::UNAUTHORIZED,
        )
        .await;

    // Logout kills the session even though the token expiry is far away;
    // other sessions of the same account are untouched.
    let second = login.get("token").unwrap().as_str().unwrap();
    server
        .request_expect(
            "POST",
            "/api/v1/auth/logout",
            Some(second),
            None,
            StatusCode::NO_CONTENT,
        )
        .await;
    server
        .request_expect(
            "GET",
            "/api/v1/children",
            Some(second),
            None,
            StatusCode::UNAUTHORIZED,
        )
        .await;
    server
        .request_expect("GET", "/api/v1/children", Some(&token), None, StatusCode::OK)
        .await;
}

#[tokio::test]
async fn registration_rules() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (_, parent) = server.register(parent_body("parent@example.com")).await;
    let code = parent.get("family_code").unwrap().as_str().unwrap();

    // Email uniqueness.
    server
        .request_expect(
            "POST",
            REGISTER_PATH,
            None,
            Some(parent_body("parent@example.com")),
            StatusCode::CONFLICT,
        )
        .await;

    // A family code that matches no parent rejects the registration and
    // creates no account: the login afterwards must fail.
    server
        .request_expect(
            "POST",
            REGISTER_PATH,
            None,
            Some(json!({
                "email": "kid@example.com",
                "password": "kidpass",
                "name": "Kid",
                "role": "child",
                "family_code": "ZZZZ99",
            })),
            StatusCode::BAD_REQUEST,
        )
        .await;
    server
        .request_expect(
            "POST",
            LOGIN_PATH,
            None,
            Some(json!({"email": "kid@example.com", "password": "kidpass"})),
            StatusCode::UNAUTHORIZED,
        )
        .await;

    // Correct code links the child to the parent account.
    let (_, kid) = server
        .register(json!({
            "email": "kid@example.com",
            "password": "kidpass",
            "name": "Kid",
            "role": "child",
            "family_code": code,
        }))
        .await;
    assert_eq!(
        kid.get("parent_id").unwrap().as_str().unwrap(),
        parent.get("id").unwrap().as_str().unwrap()
    );
    assert!(kid.get("family_code").unwrap().is_null());
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let cases: Vec<(&str, &str, Option<Value>)> = vec![
        ("GET", "/api/v1/children", None),
        ("POST", "/api/v1/children", Some(json!({"name": "Alice"}))),
        ("GET", "/api/v1/tasks", None),
        ("GET", "/api/v1/rewards", None),
        ("POST", "/api/v1/tasks/some-task/approve", None),
        (
            "POST",
            "/api/v1/rewards/some-reward/claim",
            Some(json!({"child_id": "alice"})),
        ),
        ("DELETE", "/api/v1/children/alice", None),
    ];
    for (method, path, body) in cases.iter() {
        server
            .request_expect(method, path, None, body.clone(), StatusCode::UNAUTHORIZED)
            .await;
    }
}

#[tokio::test]
async fn role_access_control() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (parent_token, family_code, child_id) = setup_family(&server).await;
    let (child_token, _) = server
        .register(json!({
            "email": "kid@example.com",
            "password": "kidpass",
            "name": "Kid",
            "role": "child",
            "family_code": family_code,
        }))
        .await;

    let task = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({"child_id": child_id, "title": "Homework", "points": 5})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").unwrap().as_str().unwrap().to_string();

    // Children read and submit; they do not administer.
    server
        .request_expect(
            "GET",
            "/api/v1/tasks",
            Some(&child_token),
            None,
            StatusCode::OK,
        )
        .await;
    let forbidden_for_child: Vec<(&str, String, Option<Value>)> = vec![
        (
            "POST",
            "/api/v1/children".into(),
            Some(json!({"name": "Bob"})),
        ),
        (
            "POST",
            "/api/v1/tasks".into(),
            Some(json!({"child_id": child_id, "title": "x", "points": 1})),
        ),
        ("POST", format!("/api/v1/tasks/{task_id}/approve"), None),
        ("POST", format!("/api/v1/tasks/{task_id}/reject"), None),
        ("DELETE", format!("/api/v1/tasks/{task_id}"), None),
        (
            "POST",
            "/api/v1/rewards".into(),
            Some(json!({"title": "x", "points_required": 1})),
        ),
        ("DELETE", format!("/api/v1/children/{child_id}"), None),
    ];
    for (method, path, body) in forbidden_for_child.iter() {
        server
            .request_expect(
                method,
                path,
                Some(&child_token),
                body.clone(),
                StatusCode::FORBIDDEN,
            )
            .await;
    }

    // Submission is the child's move; parents approve on the child's behalf
    // instead of submitting.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/submit"),
            Some(&parent_token),
            Some(json!({})),
            StatusCode::FORBIDDEN,
        )
        .await;
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/submit"),
            Some(&child_token),
            Some(json!({"photo_proof": "data:image/png;base64,AAAA"})),
            StatusCode::OK,
        )
        .await;
}

#[tokio::test]
async fn points_and_claims_scenario() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (parent_token, family_code, child_id) = setup_family(&server).await;
    let (child_token, _) = server
        .register(json!({
            "email": "kid@example.com",
            "password": "kidpass",
            "name": "Kid",
            "role": "child",
            "family_code": family_code,
        }))
        .await;

    let task = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({"child_id": child_id, "title": "Dishes", "points": 10})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").unwrap().as_str().unwrap().to_string();
    assert_eq!(task.get("status").unwrap(), "pending");

    let submitted = server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/submit"),
            Some(&child_token),
            Some(json!({"photo_proof": "data:image/png;base64,AAAA"})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(submitted.get("status").unwrap(), "completed");
    assert!(submitted.get("completed_at").unwrap().as_str().is_some());

    let approved = server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/approve"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        approved.pointer("/task/status").unwrap().as_str().unwrap(),
        "approved"
    );
    assert!(approved.get("successor").unwrap().is_null());
    assert_eq!(
        approved.pointer("/balance/total_points").unwrap().as_i64().unwrap(),
        10
    );
    assert_eq!(
        approved
            .pointer("/balance/current_points")
            .unwrap()
            .as_i64()
            .unwrap(),
        10
    );

    // Approving twice must not double-credit.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/approve"),
            Some(&parent_token),
            None,
            StatusCode::CONFLICT,
        )
        .await;

    let reward = server
        .request_expect(
            "POST",
            "/api/v1/rewards",
            Some(&parent_token),
            Some(json!({"title": "Cinema night", "points_required": 15})),
            StatusCode::OK,
        )
        .await;
    let reward_id = reward.get("id").unwrap().as_str().unwrap().to_string();

    // 10 < 15: claim refused, balance untouched.
    let err = server
        .request_expect(
            "POST",
            &format!("/api/v1/rewards/{reward_id}/claim"),
            Some(&child_token),
            Some(json!({"child_id": child_id})),
            StatusCode::CONFLICT,
        )
        .await;
    assert!(
        err.get("error")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("not enough points")
    );
    let balance = server
        .request_expect(
            "GET",
            &format!("/api/v1/children/{child_id}/balance"),
            Some(&child_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(balance.get("current_points").unwrap().as_i64().unwrap(), 10);

    // Second task approved straight from pending (parent marks it done).
    let second = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({"child_id": child_id, "title": "Laundry", "points": 10})),
            StatusCode::OK,
        )
        .await;
    let second_id = second.get("id").unwrap().as_str().unwrap();
    let approved = server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{second_id}/approve"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        approved
            .pointer("/balance/current_points")
            .unwrap()
            .as_i64()
            .unwrap(),
        20
    );

    let claim = server
        .request_expect(
            "POST",
            &format!("/api/v1/rewards/{reward_id}/claim"),
            Some(&child_token),
            Some(json!({"child_id": child_id})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(claim.pointer("/reward/claimed").unwrap(), true);
    assert_eq!(
        claim.pointer("/reward/claimed_by").unwrap().as_str().unwrap(),
        child_id
    );
    assert_eq!(
        claim
            .pointer("/balance/current_points")
            .unwrap()
            .as_i64()
            .unwrap(),
        5
    );
    assert_eq!(
        claim.pointer("/balance/total_points").unwrap().as_i64().unwrap(),
        20
    );

    // Claimed exactly once.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/rewards/{reward_id}/claim"),
            Some(&child_token),
            Some(json!({"child_id": child_id})),
            StatusCode::CONFLICT,
        )
        .await;

    let fulfilled = server
        .request_expect(
            "POST",
            &format!("/api/v1/rewards/{reward_id}/fulfill"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(fulfilled.get("paid").unwrap(), true);

    // Deleting an approved task does not take the credit back.
    server
        .request_expect(
            "DELETE",
            &format!("/api/v1/tasks/{task_id}"),
            Some(&parent_token),
            None,
            StatusCode::NO_CONTENT,
        )
        .await;
    let tasks = server
        .request_expect(
            "GET",
            "/api/v1/tasks",
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(
        tasks
            .as_array()
            .unwrap()
            .iter()
            .all(|t| t.get("id").unwrap() != task_id.as_str())
    );
    let balance = server
        .request_expect(
            "GET",
            &format!("/api/v1/children/{child_id}/balance"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(balance.get("total_points").unwrap().as_i64().unwrap(), 20);
    assert_eq!(balance.get("current_points").unwrap().as_i64().unwrap(), 5);

    // The children listing carries the same derived numbers.
    let children = server
        .request_expect(
            "GET",
            "/api/v1/children",
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    let alice = &children.as_array().unwrap()[0];
    assert_eq!(alice.get("total_points").unwrap().as_i64().unwrap(), 20);
    assert_eq!(alice.get("current_points").unwrap().as_i64().unwrap(), 5);
}

#[tokio::test]
async fn recurring_task_spawns_successor() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (parent_token, _, child_id) = setup_family(&server).await;

    let task = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({
                "child_id": child_id,
                "title": "Water the plants",
                "points": 3,
                "is_recurring": true,
                "challenge_period": "daily",
            })),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").unwrap().as_str().unwrap();

    let approved = server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/approve"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    let successor = approved.get("successor").unwrap();
    assert_eq!(successor.get("status").unwrap(), "pending");
    assert_eq!(successor.get("title").unwrap(), "Water the plants");
    assert_eq!(successor.get("points").unwrap().as_i64().unwrap(), 3);
    assert_eq!(successor.get("challenge_period").unwrap(), "daily");
    assert_ne!(successor.get("id").unwrap().as_str().unwrap(), task_id);
    assert!(successor.get("last_recurred_at").unwrap().as_str().is_some());
    assert_eq!(
        approved.pointer("/balance/total_points").unwrap().as_i64().unwrap(),
        3
    );

    // Exactly one fresh occurrence, listed ahead of the approved one.
    let tasks = server
        .request_expect(
            "GET",
            "/api/v1/tasks",
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].get("status").unwrap(), "pending");
    assert_eq!(tasks[1].get("status").unwrap(), "approved");
}

#[tokio::test]
async fn reject_flow_clears_completion() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (parent_token, family_code, child_id) = setup_family(&server).await;
    let (child_token, _) = server
        .register(json!({
            "email": "kid@example.com",
            "password": "kidpass",
            "name": "Kid",
            "role": "child",
            "family_code": family_code,
        }))
        .await;

    let task = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({"child_id": child_id, "title": "Tidy room", "points": 4})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").unwrap().as_str().unwrap();

    // A pending task cannot be rejected.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/reject"),
            Some(&parent_token),
            None,
            StatusCode::CONFLICT,
        )
        .await;

    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/submit"),
            Some(&child_token),
            Some(json!({"photo_proof": "data:image/png;base64,BBBB"})),
            StatusCode::OK,
        )
        .await;
    let rejected = server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/reject"),
            Some(&parent_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert_eq!(rejected.get("status").unwrap(), "pending");
    assert!(rejected.get("photo_proof").unwrap().is_null());
    assert!(rejected.get("completed_at").unwrap().is_null());

    // Looping back is allowed: the child can hand it in again.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/submit"),
            Some(&child_token),
            Some(json!({})),
            StatusCode::OK,
        )
        .await;
}

#[tokio::test]
async fn families_are_isolated() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let (parent_token, _, child_id) = setup_family(&server).await;
    let task = server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&parent_token),
            Some(json!({"child_id": child_id, "title": "Dishes", "points": 2})),
            StatusCode::OK,
        )
        .await;
    let task_id = task.get("id").unwrap().as_str().unwrap();

    let (other_token, _) = server.register(parent_body("other@example.com")).await;
    let children = server
        .request_expect(
            "GET",
            "/api/v1/children",
            Some(&other_token),
            None,
            StatusCode::OK,
        )
        .await;
    assert!(children.as_array().unwrap().is_empty());

    // Another family's records are invisible, not merely forbidden.
    server
        .request_expect(
            "POST",
            &format!("/api/v1/tasks/{task_id}/approve"),
            Some(&other_token),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;
    server
        .request_expect(
            "GET",
            &format!("/api/v1/children/{child_id}/balance"),
            Some(&other_token),
            None,
            StatusCode::NOT_FOUND,
        )
        .await;
    server
        .request_expect(
            "POST",
            "/api/v1/tasks",
            Some(&other_token),
            Some(json!({"child_id": child_id, "title": "steal", "points": 1})),
            StatusCode::NOT_FOUND,
        )
        .await;
}
