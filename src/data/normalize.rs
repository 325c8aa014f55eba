//! JSON-LD-ish normalization (C1)
//!
//! Pure functions over `serde_json::Value`. No I/O, no knowledge of the
//! store or the HTTP layer — every activity and object passes through
//! [`normalize`] on the way in and [`denormalize`] on the way out, and
//! nothing else is allowed to touch the list-shape of a property.

use serde_json::{Map, Value};

/// Properties that are never list-coerced: structural/identity fields whose
/// value is always a single scalar or a single embedded object.
const SCALAR_PROPERTIES: &[&str] = &["id", "type", "@context"];

/// Local-only fields that must never leave this instance. Stripped by
/// [`denormalize`] regardless of which handler produced the document.
const LOCAL_ONLY_PREFIXES: &[&str] = &["_meta", "_local"];

/// Coerce every non-scalar property of an activity or object into a list,
/// and pull `@context` out into the return value so the store never has to
/// special-case it.
///
/// `{"to": "https://example.com/x"}` becomes `{"to": ["https://example.com/x"]}`.
/// A property already list-shaped, or a language map / typed value
/// (`{"@type": ..., "@value": ...}`), is passed through unchanged. Applies
/// recursively to embedded objects (an `object[0]` Note, a `tag` Mention, a
/// `Follow` embedded in an `Accept`, ...) so every addressable thing shares
/// the one uniform internal shape per the data model's invariant 2,
/// however deep it's nested.
pub fn normalize(mut doc: Value) -> (Value, Option<Value>) {
    let context = doc.as_object_mut().and_then(|map| map.remove("@context"));

    if let Some(map) = doc.as_object_mut() {
        normalize_object(map);
    }

    (doc, context)
}

fn normalize_object(map: &mut Map<String, Value>) {
    let keys: Vec<String> = map.keys().cloned().collect();
    for key in keys {
        if SCALAR_PROPERTIES.contains(&key.as_str()) || is_language_map_property(&key) {
            continue;
        }
        let Some(value) = map.get_mut(&key) else { continue };
        coerce_to_list(value);
        if let Value::Array(items) = value {
            for item in items.iter_mut() {
                if is_typed_value(item) {
                    continue;
                }
                if let Value::Object(inner) = item {
                    normalize_object(inner);
                }
            }
        }
    }
}

/// `nameMap`/`summaryMap`/`contentMap`-style properties hold a language tag
/// → string map directly, per the AS2 "Map" naming convention; coercing
/// one into a list, or recursing into its per-language values as though
/// they were an embedded object's properties, would destroy it.
fn is_language_map_property(key: &str) -> bool {
    key.ends_with("Map")
}

fn coerce_to_list(value: &mut Value) {
    if value.is_array() {
        return;
    }
    if is_typed_value(value) {
        return;
    }
    let owned = value.take();
    *value = Value::Array(vec![owned]);
}

/// A language map (`{"en": "...", "fr": "..."}`) or JSON-LD typed value
/// (`{"@type": "...", "@value": "..."}`) is an object whose shape carries
/// meaning; normalizing it into a one-element list would destroy that
/// meaning, so it is recognized and left alone.
fn is_typed_value(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => map.contains_key("@value") || map.contains_key("@type"),
        None => false,
    }
}

/// Produce the external, de-normalized projection of a stored document:
/// re-attach `@context`, collapse single-element lists back to scalars
/// (the shape most federated software expects on the wire), and strip
/// anything local-only. Recurses into embedded objects, the mirror image
/// of [`normalize`]'s recursive coercion.
pub fn denormalize(doc: &Value, context: &Value) -> Value {
    let mut out = Map::new();
    out.insert("@context".to_string(), context.clone());

    if let Some(map) = doc.as_object() {
        denormalize_object(map, &mut out);
    }

    Value::Object(out)
}

/// Recipient fields that are only ever meaningful for local delivery
/// decisions and must never leave this instance on the wire.
const BLIND_RECIPIENT_PROPERTIES: &[&str] = &["bto", "bcc"];

fn denormalize_object(map: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, value) in map {
        if is_local_only(key)
            || key == "privateKeyPem"
            || BLIND_RECIPIENT_PROPERTIES.contains(&key.as_str())
        {
            continue;
        }
        out.insert(key.clone(), collapse_singleton(value));
    }
}

fn is_local_only(key: &str) -> bool {
    LOCAL_ONLY_PREFIXES
        .iter()
        .any(|prefix| key == *prefix || key.starts_with(&format!("{prefix}.")))
}

fn collapse_singleton(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() == 1 => collapse_item(&items[0]),
        Value::Array(items) if items.is_empty() => Value::Array(vec![]),
        Value::Array(items) => Value::Array(items.iter().map(collapse_item).collect()),
        other => other.clone(),
    }
}

fn collapse_item(item: &Value) -> Value {
    match item {
        Value::Object(inner) if !is_typed_value(item) => {
            let mut out = Map::new();
            denormalize_object(inner, &mut out);
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Default `@context` used when an inbound document did not carry one.
pub fn default_context() -> Value {
    serde_json::json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1"
    ])
}

/// Read a property as a `Vec<String>` of IRIs, accepting both bare-string
/// entries and embedded objects with an `id`. Tolerates a property that was
/// never list-coerced (a nested embedded object's own fields never pass
/// through [`normalize`], and `id`/`type` are always left scalar) as well as
/// the normalized, list-shaped form.
pub fn iri_list(doc: &Value, property: &str) -> Vec<String> {
    match doc.get(property) {
        Some(Value::Array(values)) => values.iter().filter_map(extract_iri).collect(),
        Some(other) => extract_iri(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn extract_iri(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Read a property's first value as a plain string. Accepts a list-shaped
/// property (first element) or a bare scalar, for the same reason
/// [`iri_list`] does.
pub fn first_string(doc: &Value, property: &str) -> Option<String> {
    match doc.get(property) {
        Some(Value::Array(values)) => values.first().and_then(Value::as_str).map(str::to_string),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}
