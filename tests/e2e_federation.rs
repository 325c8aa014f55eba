//! End-to-end coverage of signed outbound delivery: a real loopback HTTP
//! server stands in for a remote instance, and the outbox pipeline's actual
//! delivery engine talks to it over the network exactly as it would to a
//! real peer.

mod common;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::Mutex;

use common::*;

struct Captured {
    headers: axum::http::HeaderMap,
    body: Vec<u8>,
}

struct MockRemote {
    public_key_pem: String,
    actor_iri: String,
    inbox_iri: String,
    captured: Mutex<Vec<Captured>>,
}

async fn remote_actor(State(mock): State<Arc<MockRemote>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "id": mock.actor_iri,
        "type": "Person",
        "inbox": mock.inbox_iri,
        "publicKey": {
            "id": format!("{}#main-key", mock.actor_iri),
            "owner": mock.actor_iri,
            "publicKeyPem": mock.public_key_pem,
        },
    }))
}

async fn remote_inbox(
    State(mock): State<Arc<MockRemote>>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> axum::http::StatusCode {
    mock.captured.lock().await.push(Captured {
        headers,
        body: body.to_vec(),
    });
    axum::http::StatusCode::ACCEPTED
}

/// Start the mock remote instance on a loopback port and return its base
/// URL, the carol actor IRI, and the shared capture state.
async fn spawn_mock_remote() -> (String, String, Arc<MockRemote>) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate rsa key");
    let public_key = RsaPublicKey::from(&private_key);
    let public_key_pem = public_key.to_public_key_pem(LineEnding::LF).expect("encode public key");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let port = listener.local_addr().expect("local addr").port();
    let base = format!("http://127.0.0.1:{port}");
    let actor_iri = format!("{base}/users/carol");

    let mock = Arc::new(MockRemote {
        public_key_pem,
        actor_iri: actor_iri.clone(),
        inbox_iri: format!("{base}/users/carol/inbox"),
        captured: Mutex::new(Vec::new()),
    });

    let router = Router::new()
        .route("/users/carol", get(remote_actor))
        .route("/users/carol/inbox", post(remote_inbox))
        .with_state(mock.clone());

    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock remote server crashed");
    });

    (base, actor_iri, mock)
}

#[tokio::test]
async fn delivery_reaches_a_remote_inbox_with_a_verifiable_signature() {
    let (_base, carol_iri, mock) = spawn_mock_remote().await;

    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let create = serde_json::json!({
        "type": "Create",
        "object": { "type": "Note", "content": "hello carol" },
        "to": [carol_iri],
    });
    let (status, _) = send(&app, post_json("/outbox/alice", create)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let captured = mock.captured.lock().await;
    assert_eq!(captured.len(), 1, "the activity should have reached carol's inbox exactly once");
    let request = &captured[0];

    fedibox::federation::verify_signature(
        "POST",
        "/users/carol/inbox",
        &request.headers,
        Some(&request.body),
        &mock.public_key_pem,
    )
    .expect("the delivered request's signature must verify against alice's key");

    let body_text = String::from_utf8(request.body.clone()).expect("body is utf8 json");
    assert!(
        !body_text.contains("PRIVATE KEY"),
        "the outbound payload must never carry a private key"
    );
}

#[tokio::test]
async fn bto_and_bcc_recipients_are_never_exposed_in_the_delivered_payload() {
    let (_base, carol_iri, mock) = spawn_mock_remote().await;

    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let create = serde_json::json!({
        "type": "Create",
        "object": { "type": "Note", "content": "hello carol" },
        "to": [carol_iri],
        "bcc": ["https://remote.example/users/secret-recipient"],
    });
    let (status, _) = send(&app, post_json("/outbox/alice", create)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let captured = mock.captured.lock().await;
    assert_eq!(captured.len(), 1);
    let body_text = String::from_utf8(captured[0].body.clone()).expect("body is utf8 json");
    assert!(
        !body_text.contains("bcc") && !body_text.contains("secret-recipient"),
        "a blind-copy recipient must never appear in the federated payload"
    );
}

#[tokio::test]
async fn a_blocked_actor_never_receives_a_delivery() {
    let (_base, carol_iri, mock) = spawn_mock_remote().await;

    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let block = serde_json::json!({ "type": "Block", "object": carol_iri });
    let (status, _) = send(&app, post_json("/outbox/alice", block)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let create = serde_json::json!({
        "type": "Create",
        "object": { "type": "Note", "content": "hello carol" },
        "to": [carol_iri],
    });
    let (status, _) = send(&app, post_json("/outbox/alice", create)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    assert!(
        mock.captured.lock().await.is_empty(),
        "a blocked actor must never receive a delivery"
    );
}
