//! Outbox pipeline (C5)
//!
//! The single entry point a submitted activity passes through: normalize,
//! assign an id if missing, validate media type and shape, run the verb's
//! handler, persist, resolve the audience, and hand off to the delivery
//! engine. Every caller — the HTTP handler and the collection service's
//! synthetic `Update` broadcasts — goes through [`run`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::data::{normalize, EntityId, Store};
use crate::error::AppError;
use crate::events::{OutboxEvent, OutboxEvents};
use crate::federation::{ActorResolver, AudienceResolver, DeliveryEngine};

use super::handlers;

/// Shared state every verb handler and the pipeline itself needs.
pub struct PipelineContext {
    pub store: Arc<Store>,
    pub actor_resolver: Arc<ActorResolver>,
    pub delivery: Arc<DeliveryEngine>,
    pub events: Arc<OutboxEvents>,
    pub base_url: String,
}

/// Accepted content types for a client-submitted activity; anything else
/// is rejected as 404 rather than 415, matching the instance's existing
/// (deliberately quirky) media-type handling.
const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/activity+json",
    "application/ld+json",
    "application/json",
];

pub fn accepts_media_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    ACCEPTED_MEDIA_TYPES.contains(&base)
}

/// Activity-Streams verbs this instance dispatches through [`handlers`].
/// Anything else arriving with a `type` is still an activity (the generic
/// handler persists and delivers it unchanged); a document with no activity
/// verb at all is a bare object and gets wrapped below.
const ACTIVITY_VERBS: &[&str] = &[
    "Create", "Update", "Delete", "Follow", "Accept", "Reject", "TentativeAccept",
    "TentativeReject", "Undo", "Like", "Dislike", "Announce", "Add", "Remove", "Block", "Ignore",
    "Flag", "Invite", "Join", "Leave", "Offer", "Question", "Arrive", "Travel", "View", "Listen",
    "Read", "Move", "Activity", "IntransitiveActivity",
];

/// If `document` (already list/scalar-normalized, `@context` stripped) has
/// no recognized activity verb, wrap it in a synthetic `Create` whose
/// `object` is the original document, copying the audience fields onto the
/// wrapper per the normalizer's bare-object contract.
fn wrap_bare_object(document: Value) -> Value {
    let mut wrapper = serde_json::json!({ "type": "Create", "object": [document] });
    let inner = wrapper["object"][0].clone();
    for field in ["to", "cc", "bto", "bcc", "audience"] {
        if let Some(value) = inner.get(field) {
            wrapper[field] = value.clone();
        }
    }
    wrapper
}

/// Run one activity through the full outbox pipeline and return its
/// assigned IRI. `actor_iri` must be a local actor; the caller (the HTTP
/// handler) is responsible for the ownership check against the
/// authenticated user before calling this.
pub async fn run(
    ctx: &PipelineContext,
    actor_iri: &str,
    raw: Value,
) -> Result<String, AppError> {
    let (document, context) = normalize::normalize(raw);
    let context = context.unwrap_or_else(normalize::default_context);

    let raw_kind = normalize::first_string(&document, "type")
        .ok_or_else(|| AppError::InvalidActivity("Invalid activity".to_string()))?;

    let is_activity = ACTIVITY_VERBS.contains(&raw_kind.as_str());
    let mut document = if is_activity { document } else { wrap_bare_object(document) };
    let kind = if is_activity { raw_kind } else { "Create".to_string() };

    let iri = match document.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = format!("{}/activities/{}", ctx.base_url, EntityId::new());
            document["id"] = Value::String(id.clone());
            id
        }
    };
    document["actor"] = serde_json::json!([actor_iri]);
    if document.get("published").is_none() {
        document["published"] = serde_json::json!([Utc::now().to_rfc3339()]);
    }

    let outcome = handlers::dispatch(ctx, actor_iri, &kind, &mut document).await?;

    let mut collections = vec![format!("{actor_iri}/outbox")];
    collections.extend(outcome.collections);

    ctx.store
        .insert_activity(&iri, &kind, actor_iri, &document, &collections)
        .await?;

    ctx.events.publish(OutboxEvent {
        actor: actor_iri.to_string(),
        activity: document.clone(),
        object: outcome.object,
    });

    use crate::metrics::OUTBOX_ACTIVITIES_TOTAL;
    OUTBOX_ACTIVITIES_TOTAL.with_label_values(&[&kind]).inc();

    let payload = normalize::denormalize(&document, &context);
    deliver(ctx, actor_iri, &iri, &document, payload).await;

    for collection_iri in outcome.collection_updates {
        publish_collection_update(ctx, actor_iri, &collection_iri).await;
    }

    Ok(iri)
}

/// Broadcast a synthetic `Update` announcing that a collection's membership
/// changed (a follower accepted, a named collection edited). Bypasses the
/// verb dispatch table entirely: there is no stored object backing the
/// collection itself for [`handlers::handle_update`] to look up, and
/// re-entering `run()` with an `Update` document would hit exactly that
/// lookup and fail — so this builds, stores, publishes and delivers the
/// synthetic activity directly instead.
///
/// Addressed to the actor's own `followers` collection, per the
/// collection-update-synthesis contract: this is the one mechanism by
/// which a membership change reaches the fediverse at all, so the object
/// embedded is the fresh collection summary (with the post-change
/// `totalItems`), not a bare reference.
async fn publish_collection_update(ctx: &PipelineContext, actor_iri: &str, collection_iri: &str) {
    let total_items = match ctx.store.collection_count(collection_iri).await {
        Ok(n) => n,
        Err(error) => {
            tracing::warn!(%error, collection = %collection_iri, "failed to count collection for update synthesis");
            return;
        }
    };

    let iri = format!("{}/activities/{}", ctx.base_url, EntityId::new());
    let followers = format!("{actor_iri}/followers");
    let (document, context) = normalize::normalize(serde_json::json!({
        "id": iri,
        "type": "Update",
        "actor": actor_iri,
        "to": [followers],
        "object": {
            "id": collection_iri,
            "type": "OrderedCollection",
            "totalItems": total_items,
        },
        "published": Utc::now().to_rfc3339(),
    }));
    let context = context.unwrap_or_else(normalize::default_context);

    let collections = vec![format!("{actor_iri}/outbox")];
    if let Err(error) = ctx
        .store
        .insert_activity(&iri, "Update", actor_iri, &document, &collections)
        .await
    {
        tracing::warn!(%error, collection = %collection_iri, "failed to store synthetic collection update");
        return;
    }

    let object_for_event = document
        .get("object")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned();
    ctx.events.publish(OutboxEvent {
        actor: actor_iri.to_string(),
        activity: document.clone(),
        object: object_for_event,
    });

    let payload = normalize::denormalize(&document, &context);
    deliver(ctx, actor_iri, &iri, &document, payload).await;
}

async fn deliver(
    ctx: &PipelineContext,
    actor_iri: &str,
    activity_iri: &str,
    document: &Value,
    payload: Value,
) {
    let audience = AudienceResolver::new(&ctx.store, &ctx.actor_resolver);
    let targets = match audience.resolve(actor_iri, document).await {
        Ok(targets) => targets,
        Err(error) => {
            tracing::warn!(%error, activity = %activity_iri, "failed to resolve audience, skipping delivery");
            return;
        }
    };

    if targets.is_empty() {
        return;
    }

    let Some(private_key_pem) = lookup_private_key(ctx, actor_iri).await else {
        tracing::error!(actor = %actor_iri, "local actor has no private key, cannot sign delivery");
        return;
    };

    let inboxes = targets.into_iter().map(|t| t.inbox).collect();
    ctx.delivery
        .deliver(activity_iri, actor_iri, &private_key_pem, payload, inboxes)
        .await;
}

async fn lookup_private_key(ctx: &PipelineContext, actor_iri: &str) -> Option<String> {
    sqlx::query_scalar::<_, Option<String>>("SELECT private_key_pem FROM actors WHERE iri = ?")
        .bind(actor_iri)
        .fetch_optional(ctx.store.pool())
        .await
        .ok()
        .flatten()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_media_type_allows_activity_json_with_params() {
        assert!(accepts_media_type(Some(
            "application/activity+json; charset=utf-8"
        )));
    }

    #[test]
    fn accepts_media_type_rejects_unrelated_type() {
        assert!(!accepts_media_type(Some("text/plain")));
    }

    #[test]
    fn accepts_media_type_rejects_missing_header() {
        assert!(!accepts_media_type(None));
    }

    #[test]
    fn wrap_bare_object_lifts_audience_fields_onto_the_synthetic_create() {
        let note = serde_json::json!({
            "type": "Note",
            "content": ["hello"],
            "to": ["https://example.com/bob"],
        });
        let wrapped = wrap_bare_object(note);
        assert_eq!(wrapped["type"], "Create");
        assert_eq!(wrapped["to"], serde_json::json!(["https://example.com/bob"]));
        assert_eq!(wrapped["object"][0]["type"], "Note");
    }
}
