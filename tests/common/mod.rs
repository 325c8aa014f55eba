//! Shared harness for the end-to-end tests: an in-process router backed by
//! a real (file-backed, per-test) SQLite store, actor fixture seeding, and
//! small request/response helpers around `tower::ServiceExt::oneshot`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sqlx::SqlitePool;
use tower::ServiceExt;

use fedibox::config::{
    ActorCacheConfig, AppConfig, DatabaseConfig, DeliveryConfig, InstanceConfig, LoggingConfig,
    ServerConfig,
};
use fedibox::AppState;

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

fn unique_db_path() -> std::path::PathBuf {
    let n = DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("fedibox-test-{}-{n}-{nanos}.sqlite3", std::process::id()))
}

pub fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "localhost".to_string(),
            protocol: "http".to_string(),
        },
        database: DatabaseConfig {
            path: unique_db_path(),
        },
        delivery: DeliveryConfig {
            max_concurrent_deliveries: 4,
            request_timeout_secs: 3,
            max_retries: 3,
            initial_backoff_secs: 1,
            max_backoff_secs: 2,
        },
        actor_cache: ActorCacheConfig { ttl_secs: 60 },
        instance: InstanceConfig {
            title: "Test Instance".to_string(),
            description: "fedibox test fixture".to_string(),
            contact_email: "admin@localhost".to_string(),
        },
        logging: LoggingConfig {
            level: "error".to_string(),
            format: "pretty".to_string(),
        },
    }
}

pub async fn build_state() -> AppState {
    AppState::new(test_config()).await.expect("build AppState")
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(fedibox::api::outbox_router())
        .with_state(state)
        .merge(fedibox::api::metrics_router())
}

/// A fresh state + router pair sharing one SQLite file, mirroring how
/// `main.rs` assembles the real server.
pub async fn harness() -> (AppState, Router) {
    let state = build_state().await;
    let app = build_app(state.clone());
    (state, app)
}

/// A deterministic RSA keypair, generated once per test binary run and
/// shared by every test that needs one — keygen is too slow to redo per
/// fixture actor.
pub fn shared_keypair() -> &'static (String, String) {
    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
        let public_key = RsaPublicKey::from(&private_key);
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private key")
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key");
        (public_pem, private_pem)
    })
}

/// Seed an actor row directly — there is no provisioning API by design,
/// user/actor creation is out of scope for the outbox pipeline itself.
pub struct ActorFixture<'a> {
    pub iri: &'a str,
    pub username: &'a str,
    pub inbox: &'a str,
    pub shared_inbox: Option<&'a str>,
    pub is_local: bool,
    pub public_key_pem: &'a str,
    pub private_key_pem: Option<&'a str>,
}

pub async fn seed_actor(pool: &SqlitePool, fixture: ActorFixture<'_>) {
    let document = serde_json::json!({
        "id": fixture.iri,
        "type": "Person",
        "preferredUsername": fixture.username,
        "inbox": fixture.inbox,
        "outbox": format!("{}/outbox", fixture.iri),
        "followers": format!("{}/followers", fixture.iri),
        "following": format!("{}/following", fixture.iri),
        "liked": format!("{}/liked", fixture.iri),
        "publicKey": {
            "id": format!("{}#main-key", fixture.iri),
            "owner": fixture.iri,
            "publicKeyPem": fixture.public_key_pem,
        },
    });

    sqlx::query(
        "INSERT INTO actors (iri, preferred_username, inbox, shared_inbox, is_local, public_key_pem, private_key_pem, document, created_at, cached_until) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
    )
    .bind(fixture.iri)
    .bind(fixture.username)
    .bind(fixture.inbox)
    .bind(fixture.shared_inbox)
    .bind(fixture.is_local as i64)
    .bind(fixture.public_key_pem)
    .bind(fixture.private_key_pem)
    .bind(document.to_string())
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .expect("seed actor fixture");
}

pub async fn seed_local_actor(pool: &SqlitePool, iri: &str, username: &str) {
    let (public_key_pem, private_key_pem) = shared_keypair();
    seed_actor(
        pool,
        ActorFixture {
            iri,
            username,
            inbox: &format!("{iri}/inbox"),
            shared_inbox: None,
            is_local: true,
            public_key_pem,
            private_key_pem: Some(private_key_pem),
        },
    )
    .await;
}

pub fn post_request(uri: &str, content_type: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    builder.body(body.into()).expect("build request")
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    post_request(uri, Some("application/activity+json"), body.to_string())
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response body is not JSON")
    };
    (status, json)
}