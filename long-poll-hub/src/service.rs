use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    broadcaster::{BroadcastCounters, BroadcastStats, Broadcaster, BroadcasterHandle},
    config::HubConfig,
    error::{ChatError, ConfigError},
    message::ChatMessage,
    queue::QueueClosed,
    registry::ClientRegistry,
};

/// The hub's operation surface: Join, Send, Poll and Leave.
///
/// Construction starts the broadcaster task, so it has to happen inside a
/// Tokio runtime. Share it behind an `Arc`; every method takes `&self`.
pub struct ChatService {
    config: HubConfig,
    registry: Arc<ClientRegistry>,
    events: mpsc::Sender<ChatMessage>,
    counters: Arc<BroadcastCounters>,
    broadcaster: Mutex<Option<BroadcasterHandle>>,
}

impl ChatService {
    pub fn start(config: HubConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(ClientRegistry::new(
            config.client_capacity,
            config.overflow,
        ));
        let counters = Arc::new(BroadcastCounters::default());
        let (events, events_rx) = mpsc::channel(config.event_capacity);
        let broadcaster =
            Broadcaster::new(Arc::clone(&registry), events_rx, Arc::clone(&counters)).spawn();

        info!(
            event_capacity = config.event_capacity,
            client_capacity = config.client_capacity,
            overflow = ?config.overflow,
            "hub started"
        );

        Ok(Self {
            config,
            registry,
            events,
            counters,
            broadcaster: Mutex::new(Some(broadcaster)),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub async fn join(&self, identity: &str) -> Result<(), ChatError> {
        if identity.is_empty() {
            return Err(ChatError::EmptyIdentity);
        }
        if self.events.is_closed() {
            return Err(ChatError::HubClosed);
        }

        self.registry.register(identity).await?;
        if let Err(err) = self.publish(ChatMessage::joined(identity)).await {
            // Don't leave a member behind that nobody was told about.
            if let Err(remove_err) = self.registry.remove(identity).await {
                debug!(identity, error = %remove_err, "join rollback found nothing to remove");
            }
            return Err(err);
        }

        info!(identity, "client joined");
        Ok(())
    }

    pub async fn send(&self, identity: &str, text: &str) -> Result<(), ChatError> {
        if text.is_empty() {
            return Err(ChatError::EmptyText);
        }
        self.registry.lookup(identity).await?;

        self.publish(ChatMessage::chat(identity, text)).await
    }

    /// Long-poll for new messages.
    ///
    /// Waits up to `timeout_ms` (the configured default when not positive)
    /// for the first message, then returns it together with whatever else is
    /// already buffered, up to the batch limit. Running out of time yields an
    /// empty batch.
    pub async fn poll(
        &self,
        identity: &str,
        timeout_ms: i64,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        if identity.is_empty() {
            return Err(ChatError::EmptyIdentity);
        }

        let client = self.registry.lookup(identity).await?;
        let wait = self.config.poll_timeout(timeout_ms);

        match timeout(wait, client.queue().recv_batch(self.config.max_batch)).await {
            Ok(Ok(batch)) => {
                debug!(identity, count = batch.len(), "poll delivered");
                Ok(batch)
            }
            Ok(Err(QueueClosed)) => Err(ChatError::NotJoined(identity.to_string())),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Removes the identity and tells the remaining members.
    pub async fn leave(&self, identity: &str) -> Result<(), ChatError> {
        self.registry.remove(identity).await?;
        info!(identity, "client left");

        if let Err(err) = self.publish(ChatMessage::left(identity)).await {
            debug!(identity, error = %err, "leave notice not broadcast");
        }
        Ok(())
    }

    pub async fn members(&self) -> Vec<String> {
        self.registry.identities().await
    }

    pub fn stats(&self) -> BroadcastStats {
        self.counters.snapshot()
    }

    /// Stops the broadcaster and returns the final counters. Later Join and
    /// Send calls fail with [`ChatError::HubClosed`]; calling this twice is
    /// harmless.
    pub async fn shutdown(&self) -> BroadcastStats {
        if let Some(handle) = self.broadcaster.lock().await.take() {
            handle.stop().await;
            info!("hub stopped");
        }
        self.counters.snapshot()
    }

    async fn publish(&self, message: ChatMessage) -> Result<(), ChatError> {
        // Waits while the event queue is full.
        self.events
            .send(message)
            .await
            .map_err(|_| ChatError::HubClosed)
    }
}
