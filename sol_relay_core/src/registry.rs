// Subscription registry: relay-assigned ids -> {method, params, owning client}

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub type SubscriptionId = u64;
pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub method: String,
    pub params: Vec<Value>,
    pub client: ClientId,
    /// Subscription number the provider returned for the current connection.
    pub upstream_id: Option<u64>,
    /// `id` of the client's own subscribe request, restored on the reply.
    pub request_id: Value,
    /// Set while the subscribe request sent upstream has not been answered.
    pub awaiting_reply: bool,
}

/// Source of truth for what should be subscribed upstream right now.
///
/// Ids start at 1 and are never reused, so a stale reply can never be
/// routed to a newer entry. Iteration is in ascending id order, which is
/// also the replay order after a reconnect.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    last_id: SubscriptionId,
    entries: BTreeMap<SubscriptionId, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: String, params: Vec<Value>, client: ClientId) -> SubscriptionId {
        self.register_request(method, params, client, Value::Null)
    }

    /// Like `register`, remembering the id the client used for the request.
    pub fn register_request(
        &mut self,
        method: String,
        params: Vec<Value>,
        client: ClientId,
        request_id: Value,
    ) -> SubscriptionId {
        self.last_id += 1;
        let id = self.last_id;
        self.entries.insert(
            id,
            Subscription {
                id,
                method,
                params,
                client,
                upstream_id: None,
                request_id,
                awaiting_reply: true,
            },
        );
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.remove(&id)
    }

    pub fn remove_all_for(&mut self, client: ClientId) -> Vec<Subscription> {
        let ids: Vec<SubscriptionId> = self
            .entries
            .values()
            .filter(|sub| sub.client == client)
            .map(|sub| sub.id)
            .collect();
        ids.into_iter().filter_map(|id| self.entries.remove(&id)).collect()
    }

    pub fn lookup(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_upstream_id(&mut self, id: SubscriptionId, upstream_id: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(sub) => {
                sub.upstream_id = Some(upstream_id);
                true
            }
            None => false,
        }
    }

    /// Upstream numbers die with the connection that issued them.
    pub fn clear_upstream_ids(&mut self) {
        for sub in self.entries.values_mut() {
            sub.upstream_id = None;
        }
    }

    /// Every entry is about to be re-sent upstream and expects a fresh reply.
    pub fn await_replies(&mut self) {
        for sub in self.entries.values_mut() {
            sub.awaiting_reply = true;
        }
    }

    /// Consume the pending subscribe reply for `id`. Returns the owner and
    /// its request id, or `None` when no reply is outstanding.
    pub fn settle_reply(&mut self, id: SubscriptionId) -> Option<(ClientId, Value)> {
        let sub = self.entries.get_mut(&id).filter(|sub| sub.awaiting_reply)?;
        sub.awaiting_reply = false;
        Some((sub.client, sub.request_id.clone()))
    }

    pub fn find_by_upstream_id(&self, client: ClientId, upstream_id: u64) -> Option<SubscriptionId> {
        self.entries
            .values()
            .find(|sub| sub.client == client && sub.upstream_id == Some(upstream_id))
            .map(|sub| sub.id)
    }

    /// Distinct clients owning at least one entry.
    pub fn clients(&self) -> BTreeSet<ClientId> {
        self.entries.values().map(|sub| sub.client).collect()
    }
}
