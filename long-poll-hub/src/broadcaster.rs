//! The single sequential fan-out worker.
//!
//! Join, Send and Leave only enqueue events; this task is the one place that
//! turns an event into per-client deliveries. Membership is re-read from the
//! registry for every event, so a client sees every event enqueued after its
//! Join returned.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{message::ChatMessage, queue::PushOutcome, registry::ClientRegistry};

/// Running totals since the hub started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events: u64,
    pub deliveries: u64,
    pub dropped: u64,
    pub suppressed_echoes: u64,
}

#[derive(Default)]
pub struct BroadcastCounters {
    events: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
    suppressed_echoes: AtomicU64,
}

impl BroadcastCounters {
    fn record(&self, report: &FanOutReport) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped, Ordering::Relaxed);
        self.suppressed_echoes
            .fetch_add(report.suppressed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            events: self.events.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            suppressed_echoes: self.suppressed_echoes.load(Ordering::Relaxed),
        }
    }
}

/// Result of delivering one event to the current membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: u64,
    pub dropped: u64,
    pub suppressed: u64,
}

pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    events: mpsc::Receiver<ChatMessage>,
    counters: Arc<BroadcastCounters>,
}

/// Owner's side of a running broadcaster task.
pub struct BroadcasterHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BroadcasterHandle {
    /// Signals the worker and waits for it to exit. Events still sitting in
    /// the queue are not delivered.
    pub async fn stop(self) {
        let BroadcasterHandle { shutdown, task } = self;
        // The worker may already be gone if every sender was dropped.
        let _ = shutdown.send(());
        if let Err(err) = task.await {
            warn!(error = ?err, "broadcaster task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ClientRegistry>,
        events: mpsc::Receiver<ChatMessage>,
        counters: Arc<BroadcastCounters>,
    ) -> Self {
        Self {
            registry,
            events,
            counters,
        }
    }

    pub fn spawn(self) -> BroadcasterHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        BroadcasterHandle { shutdown, task }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        debug!("broadcaster started");

        loop {
            let message = select! {
                biased;
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(message) => message,
                    None => break,
                },
            };

            // A Block-policy push can park here; shutdown must still win.
            select! {
                biased;
                _ = &mut shutdown => break,
                report = fan_out(&self.registry, &message) => {
                    self.counters.record(&report);
                    log_broadcast(&message, &report);
                }
            }
        }

        debug!("broadcaster stopped");
    }
}

/// Delivers one event to every member registered right now.
pub async fn fan_out(registry: &ClientRegistry, message: &ChatMessage) -> FanOutReport {
    let mut report = FanOutReport::default();

    for client in registry.snapshot().await {
        if message.is_echo_for(client.identity()) {
            report.suppressed += 1;
            continue;
        }

        match client.queue().push(message.clone()).await {
            PushOutcome::Delivered => report.delivered += 1,
            PushOutcome::Displaced => {
                report.delivered += 1;
                report.dropped += 1;
            }
            PushOutcome::Dropped => {
                debug!(recipient = client.identity(), "delivery queue full, message dropped");
                report.dropped += 1;
            }
            // Left between the snapshot and the push.
            PushOutcome::Closed => {}
        }
    }

    report
}

fn log_broadcast(message: &ChatMessage, report: &FanOutReport) {
    if message.system {
        info!(
            recipients = report.delivered,
            dropped = report.dropped,
            "{}",
            message.text
        );
    } else {
        info!(
            from = %message.from,
            time = %message.time.format("%H:%M:%S"),
            recipients = report.delivered,
            dropped = report.dropped,
            "{}",
            message.text
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::config::OverflowPolicy;

    async fn registry_with(names: &[&str], capacity: usize) -> Arc<ClientRegistry> {
        let registry = Arc::new(ClientRegistry::new(capacity, OverflowPolicy::DropNewest));
        for name in names {
            registry.register(name).await.expect("register");
        }
        registry
    }

    #[tokio::test]
    async fn chat_messages_skip_their_author() {
        let registry = registry_with(&["alice", "bob", "carol"], 4).await;
        let report = fan_out(&registry, &ChatMessage::chat("alice", "hi")).await;

        assert_eq!(
            report,
            FanOutReport {
                delivered: 2,
                dropped: 0,
                suppressed: 1
            }
        );
        let alice = registry.lookup("alice").await.expect("alice");
        assert!(alice.queue().is_empty());
    }

    #[tokio::test]
    async fn system_messages_reach_their_subject() {
        let registry = registry_with(&["alice", "bob"], 4).await;
        let report = fan_out(&registry, &ChatMessage::joined("alice")).await;

        assert_eq!(report.delivered, 2);
        let alice = registry.lookup("alice").await.expect("alice");
        assert_eq!(alice.queue().len(), 1);
    }

    #[tokio::test]
    async fn full_queue_only_costs_that_client() {
        let registry = registry_with(&["alice", "bob", "carol"], 1).await;
        let bob = registry.lookup("bob").await.expect("bob");
        bob.queue().push(ChatMessage::chat("carol", "backlog")).await;

        let report = fan_out(&registry, &ChatMessage::chat("alice", "hi")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
    }

    #[tokio::test]
    async fn worker_drains_queue_and_stops_on_signal() {
        let registry = registry_with(&["alice", "bob"], 4).await;
        let counters = Arc::new(BroadcastCounters::default());
        let (events, rx) = mpsc::channel(8);
        let handle = Broadcaster::new(Arc::clone(&registry), rx, Arc::clone(&counters)).spawn();

        events
            .send(ChatMessage::chat("alice", "hello"))
            .await
            .expect("enqueue");

        let bob = registry.lookup("bob").await.expect("bob");
        let batch = timeout(Duration::from_secs(1), bob.queue().recv_batch(10))
            .await
            .expect("delivered in time")
            .expect("open queue");
        assert_eq!(batch[0].text, "hello");

        handle.stop().await;
        assert!(events.send(ChatMessage::chat("alice", "late")).await.is_err());
        assert_eq!(counters.snapshot().events, 1);
    }

    #[tokio::test]
    async fn worker_exits_when_all_senders_drop() {
        let registry = registry_with(&[], 4).await;
        let (events, rx) = mpsc::channel::<ChatMessage>(8);
        let handle =
            Broadcaster::new(registry, rx, Arc::new(BroadcastCounters::default())).spawn();

        drop(events);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
