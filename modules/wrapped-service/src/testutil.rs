//! In-process Slack API fake used by the client, scraper, and worker tests.
//!
//! Binds a real Axum server on a random loopback port with a scripted
//! responder and a request log, so the production client code is exercised
//! over actual HTTP.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One recorded request to the fake API.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub endpoint: String,
    pub token: String,
    pub params: HashMap<String, String>,
}

pub struct Reply {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body,
        }
    }

    pub fn error(code: &str) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body: json!({ "ok": false, "error": code }),
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Self {
            status: 429,
            retry_after: Some(retry_after),
            body: json!({ "ok": false, "error": "ratelimited" }),
        }
    }
}

type Responder = Box<dyn Fn(&Recorded) -> Reply + Send + Sync>;

struct MockState {
    requests: Mutex<Vec<Recorded>>,
    responder: Responder,
}

pub struct MockSlack {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockSlack {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Recorded) -> Reply + Send + Sync + 'static,
    {
        let state = Arc::new(MockState {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        });

        let app = Router::new()
            .route("/api/:endpoint", get(handle))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}/api"),
            state,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, endpoint: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.endpoint == endpoint)
            .collect()
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string();

    let recorded = Recorded {
        endpoint,
        token,
        params,
    };
    state.requests.lock().unwrap().push(recorded.clone());

    let reply = (state.responder)(&recorded);
    let mut response = (
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK),
        Json(reply.body),
    )
        .into_response();
    if let Some(ra) = reply.retry_after {
        response
            .headers_mut()
            .insert("Retry-After", ra.to_string().parse().unwrap());
    }
    response
}

/// Config with fast delays and a single default worker, for tests.
pub fn test_config() -> crate::config::Config {
    crate::config::Config {
        port: 0,
        db_path: ":memory:".to_string(),
        slack_api_base: String::new(),
        wrapped_year: "2025".to_string(),
        confessions_channel: "confessions".to_string(),
        meta_channel: "meta".to_string(),
        prox_user_id: "UPROX".to_string(),
        site_url: "https://wrapped.test".to_string(),
        retry_rounds: 2,
        batch_size: 3,
        batch_delay_ms: 5,
        job_delay_ms: 5,
        workers_default: 1,
        workers_restricted: 0,
        hackatime_base: String::new(),
        ysws_base: None,
    }
}

// =====================================================
// Response body builders
// =====================================================

pub fn search_total(total: u64) -> Value {
    json!({ "ok": true, "messages": { "total": total } })
}

pub fn conversations_page(channels: Vec<Value>, next_cursor: Option<&str>) -> Value {
    json!({
        "ok": true,
        "channels": channels,
        "response_metadata": { "next_cursor": next_cursor.unwrap_or("") }
    })
}

pub fn public_channel(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

pub fn private_channel(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name, "is_private": true })
}

pub fn im(id: &str, partner: &str) -> Value {
    json!({ "id": id, "is_im": true, "user": partner })
}

pub fn user_info_ok(name: &str, real_name: &str, image: Option<&str>) -> Value {
    json!({
        "ok": true,
        "user": {
            "name": name,
            "real_name": real_name,
            "profile": { "image_192": image, "image_512": image }
        }
    })
}
