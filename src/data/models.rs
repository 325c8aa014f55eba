//! Data models
//!
//! Rust structs representing database entities. IDs use ULID and timestamps
//! use chrono, as throughout the rest of the data layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local or cached-remote actor.
///
/// Local actors carry a private key and are the only actors this instance
/// can post an outbox entry on behalf of. Remote actors are cached copies
/// fetched through the actor resolver and are refreshed on TTL expiry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    /// ActivityPub actor IRI, globally unique.
    pub iri: String,
    pub preferred_username: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub is_local: bool,
    /// RSA public key (PEM). Present for both local and remote actors.
    pub public_key_pem: String,
    /// RSA private key (PEM). `None` for remote actors.
    pub private_key_pem: Option<String>,
    /// Full normalized actor document, minus the private key.
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub cached_until: Option<DateTime<Utc>>,
}

// =============================================================================
// Activity / Object
// =============================================================================

/// A stored activity.
///
/// `document` is the normalized internal representation (every property
/// list-shaped, `@context` stripped). `seq` is the opaque, monotonically
/// increasing insertion key used for `getStream` cursors.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub seq: i64,
    pub iri: String,
    pub kind: String,
    pub actor: String,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A stored object (the `object` of some activity, or a standalone object
/// such as an `Actor`'s `icon`). Same normalized-document convention as
/// [`ActivityRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub iri: String,
    pub kind: String,
    pub attributed_to: Option<String>,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tombstoned: bool,
}

// =============================================================================
// Collections
// =============================================================================

/// One membership row: an activity or actor IRI belongs to a named
/// collection (`followers`, `following`, `liked`, `blocked`, `rejected`, an
/// actor's outbox, or a custom collection IRI). `activity_iri` holds an
/// actor IRI rather than an activity IRI for the actor-set collections
/// (`followers`/`following`/`blocked`/`rejected`), reusing one join table
/// instead of a second schema for "a set of IRIs".
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionMembership {
    pub collection_iri: String,
    pub activity_iri: String,
    pub added_at: DateTime<Utc>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// One pending or retrying delivery attempt for a single recipient inbox.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: String,
    pub activity_iri: String,
    pub inbox_uri: String,
    pub signing_actor: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
