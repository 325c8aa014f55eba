//! End-to-end coverage of the outbox submission/read surface, run against an
//! in-process router backed by a real SQLite file.

mod common;

use common::*;

fn note_create(actor_iri: &str, recipient: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "Create",
        "object": {
            "type": "Note",
            "content": "Say, hello",
        },
        "to": [recipient],
    })
}

#[tokio::test]
async fn submit_rejects_request_with_no_content_type() {
    let (state, app) = harness().await;
    seed_local_actor(state.store.pool(), "http://localhost/actors/alice", "alice").await;

    let (status, body) = send(&app, post_request("/outbox/alice", None, "{}")).await;

    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Resource not found");
}

#[tokio::test]
async fn submit_rejects_activity_with_no_type() {
    let (state, app) = harness().await;
    seed_local_actor(state.store.pool(), "http://localhost/actors/alice", "alice").await;

    let (status, body) = send(&app, post_json("/outbox/alice", serde_json::json!({}))).await;

    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid activity");
}

#[tokio::test]
async fn submit_rejects_unknown_actor() {
    let (_state, app) = harness().await;

    let (status, body) = send(
        &app,
        post_json("/outbox/noone", serde_json::json!({ "type": "Note" })),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "'noone' not found on this instance");
}

#[tokio::test]
async fn submit_stores_a_create_note_with_every_property_listed() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let (status, body) = send(
        &app,
        post_json("/outbox/alice", note_create(alice, "https://remote.example/users/bob")),
    )
    .await;

    assert_eq!(status, axum::http::StatusCode::OK);
    let iri = body["id"].as_str().expect("response carries the new activity id").to_string();

    let stored = state.store.get_activity(&iri).await.unwrap().expect("activity persisted");
    assert_eq!(stored.document["actor"], serde_json::json!([alice]));
    assert_eq!(stored.document["object"][0]["content"], serde_json::json!(["Say, hello"]));
    assert_eq!(stored.document["object"][0]["type"], "Note");

    let (_, outbox) = send(&app, get_request("/outbox/alice?page=true")).await;
    let items = outbox["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["object"]["content"], "Say, hello");
}

#[tokio::test]
async fn submit_wraps_a_bare_object_in_a_synthetic_create() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let bare_note = serde_json::json!({ "type": "Note", "content": "just a note" });
    let (status, body) = send(&app, post_json("/outbox/alice", bare_note)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let iri = body["id"].as_str().unwrap().to_string();
    let stored = state.store.get_activity(&iri).await.unwrap().unwrap();
    assert_eq!(stored.kind, "Create");
    assert_eq!(stored.document["object"][0]["type"], "Note");
    assert_eq!(stored.document["object"][0]["content"], serde_json::json!(["just a note"]));
}

#[tokio::test]
async fn outbox_without_page_param_returns_the_collection_summary() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    for _ in 0..3 {
        send(&app, post_json("/outbox/alice", note_create(alice, "https://remote.example/users/bob"))).await;
    }

    let (status, summary) = send(&app, get_request("/outbox/alice")).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(summary["type"], "OrderedCollection");
    assert_eq!(summary["totalItems"], 3);
    assert!(summary.get("orderedItems").is_none());
    assert_eq!(summary["first"], "http://localhost/actors/alice/outbox?page=true");

    let (_, page) = send(&app, get_request("/outbox/alice?page=true")).await;
    assert_eq!(page["type"], "OrderedCollectionPage");
    assert_eq!(page["totalItems"], 3);
    assert_eq!(page["orderedItems"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn delete_by_a_non_owner_is_rejected_and_leaves_the_object_untouched() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    let bob = "http://localhost/actors/bob";
    seed_local_actor(state.store.pool(), alice, "alice").await;
    seed_local_actor(state.store.pool(), bob, "bob").await;

    let (_, created) = send(
        &app,
        post_json("/outbox/alice", note_create(alice, "https://remote.example/users/carol")),
    )
    .await;
    let activity_iri = created["id"].as_str().unwrap().to_string();
    let activity = state.store.get_activity(&activity_iri).await.unwrap().unwrap();
    let object_iri = activity.document["object"][0]["id"].as_str().unwrap().to_string();

    let delete = serde_json::json!({ "type": "Delete", "object": object_iri });
    let (status, body) = send(&app, post_json("/outbox/bob", delete)).await;

    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "You do not have permission to perform this action");

    let object = state.store.get_object(&object_iri).await.unwrap().unwrap();
    assert!(!object.tombstoned);
}

#[tokio::test]
async fn deleting_the_same_object_twice_is_idempotent() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let (_, created) = send(
        &app,
        post_json("/outbox/alice", note_create(alice, "https://remote.example/users/carol")),
    )
    .await;
    let activity_iri = created["id"].as_str().unwrap().to_string();
    let activity = state.store.get_activity(&activity_iri).await.unwrap().unwrap();
    let object_iri = activity.document["object"][0]["id"].as_str().unwrap().to_string();

    let delete = serde_json::json!({ "type": "Delete", "object": object_iri.clone() });
    let (first_status, _) = send(&app, post_json("/outbox/alice", delete.clone())).await;
    let (second_status, _) = send(&app, post_json("/outbox/alice", delete)).await;

    assert_eq!(first_status, axum::http::StatusCode::OK);
    assert_eq!(second_status, axum::http::StatusCode::OK);

    let object = state.store.get_object(&object_iri).await.unwrap().unwrap();
    assert!(object.tombstoned);
    assert_eq!(object.kind, "Tombstone");
}

#[tokio::test]
async fn undoing_a_follow_deletes_the_original_activity_and_the_following_membership() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;
    let bob = "https://remote.example/users/bob";

    let follow = serde_json::json!({ "type": "Follow", "object": bob });
    let (_, follow_body) = send(&app, post_json("/outbox/alice", follow)).await;
    let follow_iri = follow_body["id"].as_str().unwrap().to_string();

    let (_, following) = send(&app, get_request("/actors/alice/following")).await;
    assert_eq!(following["totalItems"], 1);

    let undo = serde_json::json!({ "type": "Undo", "object": follow_iri });
    let (status, _) = send(&app, post_json("/outbox/alice", undo)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    assert!(
        state.store.get_activity(&follow_iri).await.unwrap().is_none(),
        "Undo must delete the original activity it reverses"
    );

    let (_, following_after) = send(&app, get_request("/actors/alice/following")).await;
    assert_eq!(following_after["totalItems"], 0);
}

#[tokio::test]
async fn rejecting_a_follow_moves_it_to_rejected_and_broadcasts_an_update() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    let bob = "http://localhost/actors/bob";
    seed_local_actor(state.store.pool(), alice, "alice").await;
    seed_local_actor(state.store.pool(), bob, "bob").await;

    let follow = serde_json::json!({ "type": "Follow", "object": alice });
    let (_, follow_body) = send(&app, post_json("/outbox/bob", follow)).await;
    let follow_iri = follow_body["id"].as_str().unwrap().to_string();

    let reject = serde_json::json!({
        "type": "Reject",
        "object": { "id": follow_iri, "type": "Follow", "actor": bob, "object": alice },
    });
    let (status, _) = send(&app, post_json("/outbox/alice", reject)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    assert!(
        state.store.is_member("http://localhost/actors/alice/rejected", bob).await.unwrap(),
        "rejected follower must land in the rejected collection"
    );
    assert!(
        !state.store.is_member("http://localhost/actors/alice/followers", bob).await.unwrap(),
        "a rejected follower must not remain in followers"
    );

    let (_, outbox) = send(&app, get_request("/outbox/alice?page=true")).await;
    let items = outbox["orderedItems"].as_array().unwrap();
    let update = items
        .iter()
        .find(|item| item["type"] == "Update")
        .expect("rejecting a follow synthesizes a collection Update");
    assert_eq!(update["object"]["totalItems"], 0);
    assert_eq!(update["to"], format!("{alice}/followers"));
}

#[tokio::test]
async fn liking_an_object_files_it_under_liked_and_broadcasts_an_update() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    seed_local_actor(state.store.pool(), alice, "alice").await;

    let (_, created) = send(
        &app,
        post_json("/outbox/alice", note_create(alice, "https://remote.example/users/bob")),
    )
    .await;
    let create_iri = created["id"].as_str().unwrap().to_string();
    let activity = state.store.get_activity(&create_iri).await.unwrap().unwrap();
    let object_iri = activity.document["object"][0]["id"].as_str().unwrap().to_string();

    let like = serde_json::json!({ "type": "Like", "object": object_iri });
    let (status, _) = send(&app, post_json("/outbox/alice", like)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let (_, liked) = send(&app, get_request("/actors/alice/liked")).await;
    assert_eq!(liked["totalItems"], 1);

    let (_, outbox) = send(&app, get_request("/outbox/alice?page=true")).await;
    let items = outbox["orderedItems"].as_array().unwrap();
    let update = items
        .iter()
        .find(|item| item["type"] == "Update")
        .expect("liking broadcasts a synthetic Update(liked)");
    assert_eq!(update["object"]["totalItems"], 1);
    assert_eq!(update["to"], format!("{alice}/liked"));
}

#[tokio::test]
async fn accepting_a_follow_broadcasts_a_collection_update_with_the_new_total() {
    let (state, app) = harness().await;
    let alice = "http://localhost/actors/alice";
    let bob = "http://localhost/actors/bob";
    seed_local_actor(state.store.pool(), alice, "alice").await;
    seed_local_actor(state.store.pool(), bob, "bob").await;

    let follow = serde_json::json!({ "type": "Follow", "object": alice });
    let (_, follow_body) = send(&app, post_json("/outbox/bob", follow)).await;
    let follow_iri = follow_body["id"].as_str().unwrap().to_string();

    let accept = serde_json::json!({
        "type": "Accept",
        "object": { "id": follow_iri, "type": "Follow", "actor": bob, "object": alice },
    });
    let (status, _) = send(&app, post_json("/outbox/alice", accept)).await;
    assert_eq!(status, axum::http::StatusCode::OK);

    let (_, members) = send(&app, get_request("/actors/alice/followers")).await;
    assert_eq!(members["totalItems"], 1);

    let (_, outbox) = send(&app, get_request("/outbox/alice?page=true")).await;
    let items = outbox["orderedItems"].as_array().unwrap();
    let update = items
        .iter()
        .find(|item| item["type"] == "Update")
        .expect("accepting a follow synthesizes a collection Update");
    assert_eq!(update["object"]["totalItems"], 1);
    assert_eq!(update["to"], format!("{alice}/followers"));
}
