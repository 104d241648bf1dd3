use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{config::OverflowPolicy, error::ChatError, queue::DeliveryQueue};

/// A joined participant and the queue the broadcaster fills for it.
pub struct ClientState {
    identity: String,
    queue: DeliveryQueue,
}

impl ClientState {
    fn new(identity: String, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            identity,
            queue: DeliveryQueue::new(capacity, policy),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }
}

/// The set of currently joined identities.
///
/// Every access to the map goes through one mutex, and no caller holds it
/// while delivering or waiting: lookups and snapshots hand out `Arc`s and
/// release the lock immediately.
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<ClientState>>>,
    client_capacity: usize,
    overflow: OverflowPolicy,
}

impl ClientRegistry {
    pub fn new(client_capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            client_capacity,
            overflow,
        }
    }

    pub async fn register(&self, identity: &str) -> Result<Arc<ClientState>, ChatError> {
        if identity.is_empty() {
            return Err(ChatError::EmptyIdentity);
        }

        let mut clients = self.clients.lock().await;
        if clients.contains_key(identity) {
            return Err(ChatError::AlreadyExists(identity.to_string()));
        }

        let state = Arc::new(ClientState::new(
            identity.to_string(),
            self.client_capacity,
            self.overflow,
        ));
        clients.insert(identity.to_string(), Arc::clone(&state));
        Ok(state)
    }

    pub async fn lookup(&self, identity: &str) -> Result<Arc<ClientState>, ChatError> {
        let clients = self.clients.lock().await;
        clients
            .get(identity)
            .cloned()
            .ok_or_else(|| ChatError::NotJoined(identity.to_string()))
    }

    /// Removes the entry and closes its queue so a parked Poll wakes up.
    pub async fn remove(&self, identity: &str) -> Result<Arc<ClientState>, ChatError> {
        let removed = self.clients.lock().await.remove(identity);
        let state = removed.ok_or_else(|| ChatError::NotJoined(identity.to_string()))?;
        state.queue().close();
        Ok(state)
    }

    /// Copies the current membership; the lock is released before returning.
    pub async fn snapshot(&self) -> Vec<Arc<ClientState>> {
        let clients = self.clients.lock().await;
        clients.values().cloned().collect()
    }

    pub async fn identities(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut identities: Vec<String> = clients.keys().cloned().collect();
        identities.sort_unstable();
        identities
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(4, OverflowPolicy::DropNewest)
    }

    #[tokio::test]
    async fn rejects_empty_identity_without_mutating() {
        let registry = registry();
        assert_eq!(
            registry.register("").await.err(),
            Some(ChatError::EmptyIdentity)
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn rejects_duplicate_identities() {
        let registry = registry();
        registry.register("alice").await.expect("first join");
        let result = registry.register("alice").await;
        assert_eq!(
            result.err(),
            Some(ChatError::AlreadyExists("alice".into()))
        );
        assert_eq!(registry.identities().await, ["alice"]);
    }

    #[tokio::test]
    async fn lookup_reports_unknown_identities() {
        let registry = registry();
        assert_eq!(
            registry.lookup("ghost").await.err(),
            Some(ChatError::NotJoined("ghost".into()))
        );
    }

    #[tokio::test]
    async fn remove_closes_the_queue_and_frees_the_name() {
        let registry = registry();
        let state = registry.register("alice").await.expect("join");

        registry.remove("alice").await.expect("leave");
        assert!(state.queue().is_closed());
        assert!(registry.lookup("alice").await.is_err());

        registry.register("alice").await.expect("rejoin after leave");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn snapshot_does_not_hold_the_lock() {
        let registry = registry();
        registry.register("alice").await.expect("join");
        let snapshot = registry.snapshot().await;

        // Registration must still make progress while a snapshot is alive.
        registry.register("bob").await.expect("join during snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].identity(), "alice");
    }
}
