//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Actor resolution and caching (C3)
//! - Audience resolution (C4)
//! - Activity delivery with retry/requeue (C8)

pub mod actor_resolver;
pub mod audience;
pub mod delivery;
mod signature;

pub use actor_resolver::{ActorResolver, ResolvedActor};
pub use audience::AudienceResolver;
pub use delivery::{spawn_requeue_sweeper, DeliveryEngine};
pub use signature::{
    extract_actor_domain, extract_signature_key_id, fetch_public_key, key_id_matches_actor,
    sign_request, verify_signature,
};
