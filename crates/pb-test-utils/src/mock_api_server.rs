// mock_api_server: An in-process REST server emulating the /v2 endpoints.
//
// Binds to port 0 (random); each test spins up its own isolated instance,
// preloads pushes/devices, and asserts on per-route hit counters.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Mutable server state shared with the test body.
#[derive(Debug, Default)]
struct ApiState {
    valid_token: String,
    user: Value,
    devices: Vec<Value>,
    chats: Vec<Value>,
    /// All pushes, any order; list endpoints sort by `modified` descending.
    pushes: Vec<Value>,
    hits: HashMap<String, u32>,
    /// When set, the next `modified_after` request fails with
    /// `invalid_cursor` and the flag clears.
    invalid_cursor_once: bool,
    /// When set, device nickname updates fail with 404.
    reject_device_update: bool,
    next_device_seq: u32,
}

/// A mock REST server for integration testing.
pub struct MockApiServer {
    addr: SocketAddr,
    state: Arc<Mutex<ApiState>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockApiServer {
    /// Start the server with the given accepted token.
    pub async fn start(valid_token: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let state = Arc::new(Mutex::new(ApiState {
            valid_token: valid_token.to_owned(),
            user: json!({
                "iden": "u-mock",
                "name": "Mock User",
                "email": "mock@example.com",
            }),
            next_device_seq: 1,
            ..ApiState::default()
        }));

        let router = axum::Router::new()
            .route("/v2/users/me", get(get_user))
            .route("/v2/devices", get(get_devices).post(post_device))
            .route("/v2/devices/{iden}", post(post_device_update))
            .route("/v2/chats", get(get_chats))
            .route("/v2/pushes", get(get_pushes).post(post_push))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    /// REST base URL, including the `/v2` prefix.
    pub fn base_url(&self) -> String {
        format!("http://{}/v2", self.addr)
    }

    /// Hit count for a route key, e.g. `"GET /users/me"`,
    /// `"GET /pushes?limit=1"`, `"GET /pushes?modified_after"`,
    /// `"POST /devices"`.
    pub fn hits(&self, key: &str) -> u32 {
        *self.state.lock().unwrap().hits.get(key).unwrap_or(&0)
    }

    pub fn add_push(&self, push: Value) {
        self.state.lock().unwrap().pushes.push(push);
    }

    pub fn add_device(&self, device: Value) {
        self.state.lock().unwrap().devices.push(device);
    }

    pub fn add_chat(&self, chat: Value) {
        self.state.lock().unwrap().chats.push(chat);
    }

    pub fn set_invalid_cursor_once(&self) {
        self.state.lock().unwrap().invalid_cursor_once = true;
    }

    pub fn set_reject_device_update(&self, reject: bool) {
        self.state.lock().unwrap().reject_device_update = reject;
    }

    /// Devices registered via `POST /devices` during the test.
    pub fn registered_devices(&self) -> Vec<Value> {
        self.state.lock().unwrap().devices.clone()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Shared = Arc<Mutex<ApiState>>;

fn count(state: &Shared, key: &str) {
    *state
        .lock()
        .unwrap()
        .hits
        .entry(key.to_owned())
        .or_insert(0) += 1;
}

fn authorized(state: &Shared, headers: &HeaderMap) -> bool {
    let token = headers
        .get("Access-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    token == state.lock().unwrap().valid_token
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"type": "unauthorized", "message": "invalid access token"}})),
    )
        .into_response()
}

async fn get_user(State(state): State<Shared>, headers: HeaderMap) -> Response {
    count(&state, "GET /users/me");
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let user = state.lock().unwrap().user.clone();
    Json(user).into_response()
}

async fn get_devices(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let key = if params.get("active").map(String::as_str) == Some("true") {
        "GET /devices?active=true"
    } else {
        "GET /devices"
    };
    count(&state, key);
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let devices = state.lock().unwrap().devices.clone();
    Json(json!({ "devices": devices })).into_response()
}

async fn post_device(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    count(&state, "POST /devices");
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let mut guard = state.lock().unwrap();
    let iden = format!("d-mock-{}", guard.next_device_seq);
    guard.next_device_seq += 1;
    let mut device = body;
    device["iden"] = json!(iden);
    device["active"] = json!(true);
    guard.devices.push(device.clone());
    drop(guard);
    Json(device).into_response()
}

async fn post_device_update(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(iden): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    count(&state, "POST /devices/{iden}");
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let mut guard = state.lock().unwrap();
    if guard.reject_device_update {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"type": "not_found", "message": "no such device"}})),
        )
            .into_response();
    }
    let nickname = body.get("nickname").cloned().unwrap_or(Value::Null);
    for device in &mut guard.devices {
        if device.get("iden") == Some(&json!(iden.clone())) {
            device["nickname"] = nickname.clone();
            return Json(device.clone()).into_response();
        }
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"type": "not_found", "message": "no such device"}})),
    )
        .into_response()
}

async fn get_chats(State(state): State<Shared>, headers: HeaderMap) -> Response {
    count(&state, "GET /chats");
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let chats = state.lock().unwrap().chats.clone();
    Json(json!({ "chats": chats })).into_response()
}

async fn get_pushes(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(raw) = params.get("modified_after") {
        count(&state, "GET /pushes?modified_after");
        if !authorized(&state, &headers) {
            return unauthorized();
        }
        {
            let mut guard = state.lock().unwrap();
            if guard.invalid_cursor_once {
                guard.invalid_cursor_once = false;
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"type": "invalid_cursor", "message": "cursor expired"}})),
                )
                    .into_response();
            }
        }
        let cutoff: f64 = raw.parse().unwrap_or(0.0);
        let mut pushes = state.lock().unwrap().pushes.clone();
        pushes.retain(|p| p.get("modified").and_then(Value::as_f64).unwrap_or(0.0) > cutoff);
        sort_newest_first(&mut pushes);
        return Json(json!({ "pushes": pushes })).into_response();
    }

    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50);
    count(&state, &format!("GET /pushes?limit={limit}"));
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let mut pushes = state.lock().unwrap().pushes.clone();
    sort_newest_first(&mut pushes);
    pushes.truncate(limit);
    Json(json!({ "pushes": pushes })).into_response()
}

async fn post_push(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    count(&state, "POST /pushes");
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let mut push = body;
    push["iden"] = json!(uuid::Uuid::new_v4().to_string());
    push["created"] = json!(1_700_000_000.0);
    push["modified"] = json!(1_700_000_000.0);
    state.lock().unwrap().pushes.push(push.clone());
    Json(push).into_response()
}

fn sort_newest_first(pushes: &mut [Value]) {
    pushes.sort_by(|a, b| {
        let am = a.get("modified").and_then(Value::as_f64).unwrap_or(0.0);
        let bm = b.get("modified").and_then(Value::as_f64).unwrap_or(0.0);
        bm.partial_cmp(&am).unwrap_or(std::cmp::Ordering::Equal)
    });
}
