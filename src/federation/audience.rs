//! Audience resolver (C4)
//!
//! Expands an activity's `to`/`cc`/`bto`/`bcc`/`audience` properties into a
//! concrete set of delivery targets: follower collections are expanded to
//! their member actors' inboxes, the public collection is dropped (it is
//! never itself an inbox), the sending actor is always dropped even if it
//! addressed itself, shared inboxes are preferred over personal ones when
//! more than one recipient shares a domain, and any actor present in the
//! sender's `blocked` collection is removed before inbox resolution — so a
//! follower-collection expansion can never reach a blocked member either.

use std::collections::HashSet;

use crate::data::{normalize, Store};
use crate::error::AppError;
use crate::federation::actor_resolver::ActorResolver;

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// A concrete delivery target: either a shared inbox serving several
/// recipients, or one recipient's personal inbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub inbox: String,
}

fn recipient_iris(document: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    for property in ["to", "cc", "bto", "bcc", "audience"] {
        out.extend(normalize::iri_list(document, property));
    }
    out.retain(|iri| iri != PUBLIC_COLLECTION);
    out
}

pub struct AudienceResolver<'a> {
    store: &'a Store,
    actor_resolver: &'a ActorResolver,
}

impl<'a> AudienceResolver<'a> {
    pub fn new(store: &'a Store, actor_resolver: &'a ActorResolver) -> Self {
        Self {
            store,
            actor_resolver,
        }
    }

    /// Resolve an activity's recipient properties into distinct inbox
    /// targets, expanding any recipient that is itself a followers
    /// collection (`{actor}/followers`) into its current members, dropping
    /// the sending actor itself, and dropping anything the sending actor has
    /// blocked.
    pub async fn resolve(
        &self,
        sender_actor: &str,
        document: &serde_json::Value,
    ) -> Result<Vec<Target>, AppError> {
        let blocked: HashSet<String> = self
            .store
            .list_members(&format!("{sender_actor}/blocked"))
            .await?
            .into_iter()
            .map(|m| m.activity_iri)
            .collect();

        let mut inboxes: Vec<(String, Option<String>)> = Vec::new();
        let mut seen_actors = HashSet::new();
        // Seeding with the sender drops it from the recipient set below: a
        // duplicate insert (the sender addressing itself, or appearing as
        // its own follower) is rejected by `HashSet::insert` just like any
        // other dedup hit.
        seen_actors.insert(sender_actor.to_string());

        for recipient in recipient_iris(document) {
            if recipient.ends_with("/followers") {
                let members = self.store.list_members(&recipient).await?;
                for member in members {
                    // collection_memberships rows for a followers collection
                    // store the follower actor IRI as the activity_iri.
                    if blocked.contains(&member.activity_iri) {
                        continue;
                    }
                    if seen_actors.insert(member.activity_iri.clone()) {
                        if let Some(pair) = self.resolve_actor_inbox(&member.activity_iri).await? {
                            inboxes.push(pair);
                        }
                    }
                }
                continue;
            }

            if blocked.contains(&recipient) {
                continue;
            }
            if seen_actors.insert(recipient.clone()) {
                if let Some(pair) = self.resolve_actor_inbox(&recipient).await? {
                    inboxes.push(pair);
                }
            }
        }

        Ok(self.prefer_shared_inboxes(inboxes))
    }

    async fn resolve_actor_inbox(
        &self,
        actor_iri: &str,
    ) -> Result<Option<(String, Option<String>)>, AppError> {
        match self.actor_resolver.resolve(actor_iri).await {
            Ok(actor) => Ok(Some((actor.inbox.clone(), actor.shared_inbox.clone()))),
            Err(error) => {
                // Upstream fetch failure: skip this recipient, never fail the request.
                tracing::warn!(actor = %actor_iri, %error, "failed to resolve recipient actor, skipping");
                Ok(None)
            }
        }
    }

    /// Collapse personal inboxes that share a `sharedInbox` into one
    /// delivery to that shared inbox, per spec's "shared inbox preference"
    /// rule — mirrors Mastodon's own optimization.
    fn prefer_shared_inboxes(&self, inboxes: Vec<(String, Option<String>)>) -> Vec<Target> {
        let mut by_shared: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for (_, shared) in &inboxes {
            if let Some(shared) = shared {
                *by_shared.entry(shared.clone()).or_insert(0) += 1;
            }
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for (personal, shared) in inboxes {
            let inbox = match &shared {
                Some(shared_inbox) if by_shared.get(shared_inbox).copied().unwrap_or(0) > 1 => {
                    shared_inbox.clone()
                }
                _ => personal,
            };
            if seen.insert(inbox.clone()) {
                targets.push(Target { inbox });
            }
        }
        targets
    }
}
