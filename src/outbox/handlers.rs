//! Verb handlers (C6)
//!
//! One function per ActivityPub verb. Each handler validates the
//! activity's shape against store state, applies whatever side effect the
//! verb implies, and returns the list of extra collections (beyond the
//! actor's own outbox) the activity should be filed under.

use chrono::Utc;
use serde_json::Value;

use crate::data::normalize;
use crate::error::AppError;

use super::pipeline::PipelineContext;

/// What a verb handler wants to happen after its own side effect.
#[derive(Default)]
pub struct DispatchOutcome {
    /// Extra collections (besides the actor's outbox) to file this
    /// activity's own iri under.
    pub collections: Vec<String>,
    /// Collections whose membership changed and that should get a
    /// synthetic `Update` broadcast to their subscribers.
    pub collection_updates: Vec<String>,
    /// The object this handler mutated (created, merged, resolved), carried
    /// on the published `OutboxEvent` for observers that cannot re-derive it
    /// from the activity document alone.
    pub object: Option<Value>,
}

impl DispatchOutcome {
    fn filed_under(collection: impl Into<String>) -> Self {
        Self {
            collections: vec![collection.into()],
            collection_updates: Vec::new(),
            object: None,
        }
    }

    fn changed(collection: impl Into<String>) -> Self {
        Self {
            collections: Vec::new(),
            collection_updates: vec![collection.into()],
            object: None,
        }
    }

    fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }
}

pub async fn dispatch(
    ctx: &PipelineContext,
    actor_iri: &str,
    kind: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    match kind {
        "Create" => handle_create(ctx, actor_iri, document).await,
        "Update" => handle_update(ctx, actor_iri, document).await,
        "Delete" => handle_delete(ctx, actor_iri, document).await,
        "Follow" => handle_follow(ctx, actor_iri, document).await,
        "Accept" => handle_accept(ctx, actor_iri, document).await,
        "Reject" => handle_reject(ctx, actor_iri, document).await,
        "Undo" => handle_undo(ctx, actor_iri, document).await,
        "Like" => handle_like(ctx, actor_iri, document).await,
        "Announce" => handle_announce(ctx, actor_iri, document).await,
        "Add" => handle_add(ctx, actor_iri, document).await,
        "Remove" => handle_remove(ctx, actor_iri, document).await,
        "Block" => handle_block(ctx, actor_iri, document).await,
        _ => Ok(DispatchOutcome::default()),
    }
}

fn object_iri(document: &Value) -> Option<String> {
    normalize::first_string(document, "object")
        .or_else(|| {
            document
                .get("object")
                .and_then(Value::as_array)
                .and_then(|items| items.first())
                .and_then(|item| item.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

async fn handle_create(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let object = document
        .get_mut("object")
        .and_then(Value::as_array_mut)
        .and_then(|items| items.first_mut())
        .ok_or_else(|| AppError::MissingTarget("Create requires an object".to_string()))?;

    if object.get("id").and_then(Value::as_str).is_none() {
        let id = format!("{}/objects/{}", ctx.base_url, crate::data::EntityId::new());
        object["id"] = Value::String(id);
    }
    if object.get("attributedTo").is_none() {
        object["attributedTo"] = serde_json::json!([actor_iri]);
    }
    if object.get("published").is_none() {
        object["published"] = serde_json::json!([Utc::now().to_rfc3339()]);
    }

    let object_iri = object["id"].as_str().unwrap().to_string();
    let object_kind = normalize::first_string(object, "type").unwrap_or_else(|| "Object".to_string());
    let attributed_to = normalize::first_string(object, "attributedTo");

    ctx.store
        .upsert_object(&object_iri, &object_kind, attributed_to.as_deref(), object)
        .await?;

    Ok(DispatchOutcome::default().with_object(object.clone()))
}

async fn handle_update(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let incoming = document
        .get("object")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned()
        .ok_or_else(|| AppError::MissingTarget("Update requires an object".to_string()))?;

    let object_iri = incoming
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::MissingTarget("Update object has no id".to_string()))?
        .to_string();

    let existing = ctx
        .store
        .get_object(&object_iri)
        .await?
        .ok_or_else(|| AppError::MissingTarget(format!("unknown object {object_iri}")))?;

    if existing.attributed_to.as_deref() != Some(actor_iri) {
        return Err(AppError::OwnershipViolation);
    }

    let mut merged = existing.document.clone();
    if let (Some(merged_map), Some(incoming_map)) = (merged.as_object_mut(), incoming.as_object()) {
        for (key, value) in incoming_map {
            merged_map.insert(key.clone(), value.clone());
        }
    }

    let object_kind = normalize::first_string(&merged, "type").unwrap_or_else(|| "Object".to_string());
    ctx.store
        .upsert_object(&object_iri, &object_kind, Some(actor_iri), &merged)
        .await?;

    for embedding_record in ctx.store.activities_embedding_object(&object_iri).await? {
        if let Some(mut activity) = ctx.store.get_activity(&embedding_record.iri).await? {
            replace_embedded_object(&mut activity.document, &object_iri, &merged);
            ctx.store
                .replace_activity_document(&embedding_record.iri, &activity.document)
                .await?;
        }
    }

    Ok(DispatchOutcome::default().with_object(merged))
}

fn replace_embedded_object(document: &mut Value, object_iri: &str, replacement: &Value) {
    let Some(object_field) = document.get_mut("object").and_then(Value::as_array_mut) else {
        return;
    };
    for item in object_field.iter_mut() {
        if item.get("id").and_then(Value::as_str) == Some(object_iri) {
            *item = replacement.clone();
        }
    }
}

async fn handle_delete(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &Value,
) -> Result<DispatchOutcome, AppError> {
    let target = extract_delete_target(document)
        .ok_or_else(|| AppError::MissingTarget("Delete requires an object".to_string()))?;

    let existing = ctx
        .store
        .get_object(&target)
        .await?
        .ok_or_else(|| AppError::MissingTarget(format!("unknown object {target}")))?;

    if existing.attributed_to.as_deref() != Some(actor_iri) {
        return Err(AppError::OwnershipViolation);
    }

    ctx.store.tombstone_object(&target).await?;
    Ok(DispatchOutcome::default())
}

fn extract_delete_target(document: &Value) -> Option<String> {
    let object = document.get("object").and_then(Value::as_array)?.first()?;
    if let Some(id) = object.as_str() {
        return Some(id.to_string());
    }
    object.get("id").and_then(Value::as_str).map(str::to_string)
}

async fn handle_follow(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let target = object_iri(document)
        .ok_or_else(|| AppError::MissingTarget("Follow requires an object".to_string()))?;
    ensure_recipient(document, "to", &target);
    ctx.store
        .add_to_collection(&format!("{actor_iri}/following"), &target)
        .await?;
    Ok(DispatchOutcome::default())
}

async fn handle_accept(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let follower = extract_follow_actor(document)
        .ok_or_else(|| AppError::MissingTarget("Accept requires a Follow object".to_string()))?;

    let collection = format!("{actor_iri}/followers");
    ctx.store.add_to_collection(&collection, &follower).await?;
    ensure_recipient(document, "to", &follower);
    Ok(DispatchOutcome::changed(collection))
}

async fn handle_reject(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let follower = extract_follow_actor(document)
        .ok_or_else(|| AppError::MissingTarget("Reject requires a Follow object".to_string()))?;

    let followers = format!("{actor_iri}/followers");
    ctx.store.remove_from_collection(&followers, &follower).await?;
    ctx.store
        .add_to_collection(&format!("{actor_iri}/rejected"), &follower)
        .await?;
    ensure_recipient(document, "to", &follower);

    Ok(DispatchOutcome::changed(followers))
}

fn extract_follow_actor(document: &Value) -> Option<String> {
    let follow = document.get("object").and_then(Value::as_array)?.first()?;
    normalize::first_string(follow, "actor")
}

async fn handle_undo(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let target_iri = object_iri(document)
        .ok_or_else(|| AppError::MissingTarget("Undo requires an object".to_string()))?;

    let original = ctx
        .store
        .get_activity(&target_iri)
        .await?
        .ok_or_else(|| AppError::MissingTarget(format!("unknown activity {target_iri}")))?;

    if original.actor != actor_iri {
        return Err(AppError::OwnershipViolation);
    }

    let mut collection_updates = Vec::new();

    match original.kind.as_str() {
        "Like" => {
            if let Some(liked) = object_iri(&original.document) {
                let collection = format!("{actor_iri}/liked");
                ctx.store.remove_from_collection(&collection, &liked).await?;
                collection_updates.push(collection);
            }
        }
        "Follow" => {
            if let Some(followed) = object_iri(&original.document) {
                ctx.store
                    .remove_from_collection(&format!("{actor_iri}/following"), &followed)
                    .await?;
            }
        }
        "Accept" => {
            if let Some(follower) = extract_follow_actor(&original.document) {
                let collection = format!("{actor_iri}/followers");
                ctx.store.remove_from_collection(&collection, &follower).await?;
                collection_updates.push(collection);
            }
        }
        "Reject" => {
            if let Some(follower) = extract_follow_actor(&original.document) {
                ctx.store
                    .remove_from_collection(&format!("{actor_iri}/rejected"), &follower)
                    .await?;
            }
        }
        "Add" => {
            if let Some((target, object)) = target_and_object(&original.document) {
                ctx.store.remove_from_collection(&target, &object).await?;
                collection_updates.push(target);
            }
        }
        "Remove" => {
            if let Some((target, object)) = target_and_object(&original.document) {
                ctx.store.add_to_collection(&target, &object).await?;
                collection_updates.push(target);
            }
        }
        "Block" => {
            if let Some(blocked) = object_iri(&original.document) {
                ctx.store
                    .remove_from_collection(&format!("{actor_iri}/blocked"), &blocked)
                    .await?;
            }
        }
        _ => {}
    }

    if document.get("to").and_then(|v| v.as_array()).map(|a| a.is_empty()).unwrap_or(true) {
        if let Some(to) = original.document.get("to") {
            document["to"] = to.clone();
        }
    }
    if document.get("cc").and_then(|v| v.as_array()).map(|a| a.is_empty()).unwrap_or(true) {
        if let Some(cc) = original.document.get("cc") {
            document["cc"] = cc.clone();
        }
    }

    ctx.store.delete_activity(&target_iri).await?;

    Ok(DispatchOutcome {
        collections: Vec::new(),
        collection_updates,
        object: None,
    })
}

async fn handle_like(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let target = object_iri(document)
        .ok_or_else(|| AppError::MissingTarget("Like requires an object".to_string()))?;

    let mut resolved_object = None;
    if let Some(object) = ctx.store.get_object(&target).await? {
        document["object"] = serde_json::json!([object.document]);
        if document.get("to").and_then(|v| v.as_array()).map(|a| a.is_empty()).unwrap_or(true) {
            if let Some(attributed_to) = &object.attributed_to {
                ensure_recipient(document, "to", attributed_to);
            }
        }
        resolved_object = Some(object.document);
    }

    // Liking files the activity under `liked` and, per the collection-update
    // synthesis contract, also triggers the synthetic `Update(liked)` every
    // membership change to `followers`/`liked` must produce.
    let collection = format!("{actor_iri}/liked");
    Ok(DispatchOutcome {
        collections: vec![collection.clone()],
        collection_updates: vec![collection],
        object: resolved_object,
    })
}

async fn handle_announce(
    _ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let target = object_iri(document)
        .ok_or_else(|| AppError::MissingTarget("Announce requires an object".to_string()))?;
    document["object"] = serde_json::json!([target]);

    let followers = format!("{actor_iri}/followers");
    ensure_recipient(document, "cc", &followers);
    Ok(DispatchOutcome::default())
}

async fn handle_add(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &Value,
) -> Result<DispatchOutcome, AppError> {
    let (target, object) = target_and_object(document)
        .ok_or_else(|| AppError::MissingTarget("Add requires a target and an object".to_string()))?;

    if !target.starts_with(actor_iri) {
        return Err(AppError::OwnershipViolation);
    }

    ctx.store.add_to_collection(&target, &object).await?;
    Ok(DispatchOutcome::changed(target))
}

async fn handle_remove(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &Value,
) -> Result<DispatchOutcome, AppError> {
    let (target, object) = target_and_object(document)
        .ok_or_else(|| AppError::MissingTarget("Remove requires a target and an object".to_string()))?;

    if !target.starts_with(actor_iri) {
        return Err(AppError::OwnershipViolation);
    }

    ctx.store.remove_from_collection(&target, &object).await?;
    Ok(DispatchOutcome::changed(target))
}

fn target_and_object(document: &Value) -> Option<(String, String)> {
    let target = normalize::first_string(document, "target")?;
    let object = {
        let items = document.get("object").and_then(Value::as_array)?;
        let first = items.first()?;
        first
            .as_str()
            .map(str::to_string)
            .or_else(|| first.get("id").and_then(Value::as_str).map(str::to_string))
    }?;
    Some((target, object))
}

async fn handle_block(
    ctx: &PipelineContext,
    actor_iri: &str,
    document: &mut Value,
) -> Result<DispatchOutcome, AppError> {
    let target = object_iri(document)
        .ok_or_else(|| AppError::MissingTarget("Block requires an object".to_string()))?;

    ctx.store
        .add_to_collection(&format!("{actor_iri}/blocked"), &target)
        .await?;

    strip_recipient(document, "to", &target);
    strip_recipient(document, "cc", &target);
    strip_recipient(document, "audience", &target);

    Ok(DispatchOutcome::default())
}

fn ensure_recipient(document: &mut Value, field: &str, iri: &str) {
    if document.get(field).and_then(Value::as_array).is_none() {
        document[field] = serde_json::json!([]);
    }
    let items = document[field].as_array_mut().expect("field just set to an array");
    if !items.iter().any(|v| v.as_str() == Some(iri)) {
        items.push(Value::String(iri.to_string()));
    }
}

fn strip_recipient(document: &mut Value, field: &str, iri: &str) {
    if let Some(items) = document.get_mut(field).and_then(Value::as_array_mut) {
        items.retain(|v| v.as_str() != Some(iri));
    }
}
