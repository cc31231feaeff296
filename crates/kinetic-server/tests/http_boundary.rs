use std::sync::Arc;

use async_trait::async_trait;
use kinetic_coord::{ManualTicker, NewSession, PresenceStatus};
use kinetic_core::{CoordError, ManualClock, Result};
use kinetic_kv::{CacheKeyCodec, KeyOptions, KeyValueStore, KvBackend, ServerInfo, StoreMode};
use kinetic_server::metrics::names;
use kinetic_server::{AppConfig, AppState, ServerBuilder};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    state: AppState,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.rate_limit.default_policy.max = 3;
    cfg.rate_limit.default_policy.window_ms = 60_000;
    cfg
}

async fn start_server(cfg: AppConfig, store: Option<KeyValueStore>) -> TestServer {
    let clock = Arc::new(ManualClock::at_millis(1_700_000_000_000));
    let store = store.unwrap_or_else(|| KeyValueStore::in_memory(clock.clone(), "kinetic"));
    let server = ServerBuilder::new()
        .with_config(cfg)
        .with_clock(clock)
        .with_ticker(Arc::new(ManualTicker::new()))
        .with_store(store)
        .build()
        .await
        .expect("build server");
    let state = server.state().clone();
    let app = server.router();

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
        shutdown: tx,
        handle,
    }
}

#[tokio::test]
async fn rate_limit_rejects_after_max_with_headers() {
    let server = start_server(test_config(), None).await;
    let client = reqwest::Client::new();
    let url = format!("{}/sessions/missing", server.base);

    for expected_remaining in ["2", "1", "0"] {
        let resp = client
            .get(&url)
            .header("x-forwarded-for", "198.51.100.4")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "3");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], expected_remaining);
        assert!(resp.headers().contains_key("x-ratelimit-reset"));
        assert!(!resp.headers().contains_key("x-rate-limit-limit"));
        assert!(resp.headers().contains_key("x-request-id"));
    }

    let resp = client
        .get(&url)
        .header("x-forwarded-for", "198.51.100.4")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(resp.headers()["retry-after"], "40");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["limit"], 3);
    assert_eq!(body["error"]["remaining"], 0);
    assert_eq!(body["error"]["retryAfter"], 40);
    assert_eq!(body["error"]["resetTime"], "2023-11-14T22:14:00Z");

    // A different client has its own counter
    let resp = client
        .get(&url)
        .header("x-forwarded-for", "198.51.100.5")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn legacy_headers_are_emitted_when_enabled() {
    let mut cfg = test_config();
    cfg.rate_limit.legacy_headers = true;
    let server = start_server(cfg, None).await;

    let resp = reqwest::get(format!("{}/admin/stats/cache", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-rate-limit-limit"], "3");
    assert_eq!(resp.headers()["x-rate-limit-remaining"], "2");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "2");

    server.stop().await;
}

#[tokio::test]
async fn bypassed_requests_never_consume_quota() {
    let mut cfg = test_config();
    cfg.rate_limit.default_policy.max = 1;
    let server = start_server(cfg, None).await;
    let client = reqwest::Client::new();

    for _ in 0..5 {
        let resp = client
            .get(format!("{}/healthz", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(!resp.headers().contains_key("x-ratelimit-limit"));
    }

    let session_id = server
        .state
        .sessions
        .create_session(NewSession {
            user_id: "root".into(),
            tenant_id: "t1".into(),
            role: "super_admin".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    for _ in 0..5 {
        let resp = client
            .get(format!("{}/admin/stats/jobs", server.base))
            .header("x-session-id", &session_id)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(!resp.headers().contains_key("x-ratelimit-limit"));
    }

    // Quota is still untouched for an ordinary caller
    let resp = client
        .get(format!("{}/admin/stats/jobs", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");

    server.stop().await;
}

#[tokio::test]
async fn role_header_is_ignored_unless_trusted() {
    let mut cfg = test_config();
    cfg.rate_limit.default_policy.max = 1;
    let server = start_server(cfg, None).await;
    let client = reqwest::Client::new();
    let url = format!("{}/admin/stats/jobs", server.base);

    let statuses = [
        client.get(&url).header("x-user-role", "super_admin").send().await.unwrap().status(),
        client.get(&url).header("x-user-role", "super_admin").send().await.unwrap().status(),
    ];
    assert_eq!(statuses.map(|s| s.as_u16()), [200, 429]);

    // An unknown session id does not grant the role either
    let resp = client
        .get(&url)
        .header("x-session-id", "forged")
        .header("x-user-role", "super_admin")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
    server.stop().await;

    let mut cfg = test_config();
    cfg.rate_limit.default_policy.max = 1;
    cfg.rate_limit.trust_identity_headers = true;
    let server = start_server(cfg, None).await;
    for _ in 0..3 {
        let resp = client
            .get(format!("{}/admin/stats/jobs", server.base))
            .header("x-user-role", "super_admin")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    server.stop().await;
}

#[tokio::test]
async fn healthz_reports_store_mode() {
    let server = start_server(test_config(), None).await;

    let resp = reqwest::get(format!("{}/healthz", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["mode"], "memory");

    server.stop().await;
}

#[tokio::test]
async fn metrics_endpoint_exposes_coordination_counters() {
    let server = start_server(test_config(), None).await;
    let client = reqwest::Client::new();

    client
        .get(format!("{}/sessions/missing", server.base))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/admin/cleanup", server.base))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    for name in [
        names::HTTP_REQUESTS_TOTAL,
        names::RATE_LIMIT_DECISIONS_TOTAL,
        names::PRESENCE_ONLINE_USERS,
    ] {
        assert!(text.contains(name), "missing {name} in:\n{text}");
    }

    server.stop().await;
}

#[tokio::test]
async fn session_lookup_and_user_scoping() {
    let server = start_server(test_config(), None).await;
    let client = reqwest::Client::new();

    let session_id = server
        .state
        .sessions
        .create_session(NewSession {
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            role: "member".into(),
            identity: "ada@example.com".into(),
            address: "10.0.0.1".into(),
            user_agent: "test".into(),
        })
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/sessions/{session_id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sessionId"], session_id.as_str());
    assert_eq!(body["userId"], "u1");

    let resp = client
        .get(format!("{}/sessions/{session_id}?user_id=u2", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    server.stop().await;
}

#[tokio::test]
async fn presence_heartbeat_marks_user_online() {
    let server = start_server(test_config(), None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/presence/heartbeat", server.base))
        .json(&json!({"user_id": "u1", "tenant_id": "t1", "role": "coach"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let record = server.state.presence.get_presence("u1").await.unwrap();
    assert_eq!(record.status, PresenceStatus::Online);
    assert_eq!(
        server.state.presence.online_users(Some("t1")).await,
        vec!["u1".to_string()]
    );

    let resp = reqwest::get(format!("{}/admin/stats/presence", server.base))
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["totalOnline"], 1);
    assert_eq!(body["byTenant"]["t1"], 1);

    server.stop().await;
}

#[tokio::test]
async fn admin_job_controls() {
    let mut cfg = test_config();
    cfg.rate_limit.enabled = false;
    let server = start_server(cfg, None).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/admin/stats/jobs", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["running"], false);
    let ids: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["presence-sweep", "session-index-compaction", "store-stats"]);

    let resp = client
        .post(format!("{}/admin/jobs/store-stats/toggle", server.base))
        .json(&json!({"enabled": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["enabled"], false);

    let resp = client
        .post(format!("{}/admin/jobs/presence-sweep/run", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["jobId"], "presence-sweep");
    assert_eq!(body["success"], true);

    let resp = client
        .post(format!("{}/admin/jobs/nope/run", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{}/admin/jobs/nope/toggle", server.base))
        .json(&json!({"enabled": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn admin_cache_and_store_endpoints() {
    let mut cfg = test_config();
    cfg.rate_limit.enabled = false;
    let server = start_server(cfg, None).await;
    let client = reqwest::Client::new();

    let opts = KeyOptions::default();
    server.state.cache.put("users:1", &json!({"n": 1}), &opts).await;
    server.state.cache.put("users:2", &json!({"n": 2}), &opts).await;
    server.state.cache.put("plans:1", &json!({"n": 3}), &opts).await;
    assert!(server.state.cache.get::<Value>("users:1", &opts).await.is_some());

    let resp = client
        .post(format!("{}/admin/cache/flush", server.base))
        .json(&json!({"pattern": "users:*"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], 2);
    assert!(server.state.cache.get::<Value>("plans:1", &opts).await.is_some());

    let resp = client
        .post(format!("{}/admin/cache/flush", server.base))
        .json(&json!({"pattern": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = client
        .get(format!("{}/admin/stats/cache", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["mode"], "memory");
    assert_eq!(body["keyPrefix"], "kinetic:");
    assert_eq!(body["hits"], 2);
    assert_eq!(body["writes"], 3);

    let body: Value = client
        .get(format!("{}/admin/redis/info", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["mode"], "memory");
    assert!(body["info"].is_object());

    let resp = client
        .post(format!("{}/admin/cleanup", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["presence"]["transitioned"], 0);
    assert!(body["sessions"].is_object());

    let resp = client
        .get(format!("{}/admin/stats/sessions", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    server.stop().await;
}

struct UnreachableBackend;

#[async_trait]
impl KvBackend for UnreachableBackend {
    fn mode(&self) -> StoreMode {
        StoreMode::Redis
    }
    async fn get(&self, _: &str) -> Result<Option<String>> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn set(&self, _: &str, _: &str, _: Option<u64>) -> Result<()> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn del(&self, _: &[String]) -> Result<u64> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn exists(&self, _: &str) -> Result<bool> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn expire(&self, _: &str, _: u64) -> Result<bool> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn ttl(&self, _: &str) -> Result<i64> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn incr(&self, _: &str) -> Result<i64> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn incr_with_expire(&self, _: &str, _: u64) -> Result<i64> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn keys(&self, _: &str) -> Result<Vec<String>> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn info(&self) -> Result<ServerInfo> {
        Err(CoordError::store_unavailable("connection refused"))
    }
    async fn ping(&self) -> Result<()> {
        Err(CoordError::store_unavailable("connection refused"))
    }
}

fn unreachable_store() -> KeyValueStore {
    KeyValueStore::new(Arc::new(UnreachableBackend), CacheKeyCodec::new("kinetic"))
}

#[tokio::test]
async fn store_outage_fails_closed_by_default() {
    let server = start_server(test_config(), Some(unreachable_store())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/presence/heartbeat", server.base))
        .json(&json!({"user_id": "u1", "tenant_id": "t1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "STORE_UNAVAILABLE");

    let resp = client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    server.stop().await;
}

#[tokio::test]
async fn store_outage_fails_open_when_configured() {
    let mut cfg = test_config();
    cfg.rate_limit.fail_open_on_error = true;
    let server = start_server(cfg, Some(unreachable_store())).await;
    let client = reqwest::Client::new();

    // Presence writes are fail-open, so the heartbeat is still accepted
    let resp = client
        .post(format!("{}/presence/heartbeat", server.base))
        .json(&json!({"user_id": "u1", "tenant_id": "t1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    assert!(!resp.headers().contains_key("x-ratelimit-limit"));

    // Session validation surfaces the outage
    let resp = client
        .get(format!("{}/sessions/s1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    server.stop().await;
}
