//! Event Bus
//!
//! Fans committed domain events out to registered [`EventHandler`]s and to
//! passive observers on a broadcast channel. The bus is an explicit registry
//! object owned by the engine, never process-wide state.
//!
//! Handlers run in ascending [`EventHandler::priority`] order. A failing
//! handler is retried a bounded number of times, then logged and skipped; it
//! never blocks the other handlers or the publisher.

use crate::db::{DomainEvent, EventKind, EventPublisher};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Broadcast channel capacity for committed domain events
const DOMAIN_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Default priority; lower runs first
pub const DEFAULT_HANDLER_PRIORITY: i32 = 100;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Unique name, used for logging and [`EventBus::unregister`]
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        DEFAULT_HANDLER_PRIORITY
    }

    fn handles(&self, kind: EventKind) -> bool;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    tx: broadcast::Sender<DomainEvent>,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DOMAIN_EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            tx,
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }

    /// Retry a failing handler `max_retries` times, `delay` apart
    pub fn with_retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }

    /// Register a handler, replacing any handler with the same name
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.retain(|h| h.name() != handler.name());
        handlers.push(handler);
        // Stable: equal priorities keep registration order
        handlers.sort_by_key(|h| h.priority());
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() != before
    }

    /// Handler names in dispatch order
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Observe every published event
    ///
    /// Slow receivers lag and lose the oldest events; handlers are the
    /// reliable path.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Deliver one event to every matching handler
    pub async fn dispatch(&self, event: &DomainEvent) {
        let _ = self.tx.send(event.clone());

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.handles(event.kind))
            .cloned()
            .collect();

        for handler in handlers {
            self.run_handler(handler.as_ref(), event).await;
        }
    }

    async fn run_handler(&self, handler: &dyn EventHandler, event: &DomainEvent) {
        let mut attempt: u32 = 0;
        loop {
            match handler.handle(event).await {
                Ok(()) => return,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Handler {} failed on {} {} (attempt {}/{}): {}. Retrying in {:?}...",
                        handler.name(),
                        event.event_type(),
                        event.aggregate_id,
                        attempt,
                        self.max_retries + 1,
                        e,
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Handler {} gave up on {} {} after {} attempt(s): {:#}",
                        handler.name(),
                        event.event_type(),
                        event.aggregate_id,
                        attempt + 1,
                        e
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, events: Vec<DomainEvent>) {
        debug!("Publishing {} event(s)", events.len());
        for event in &events {
            self.dispatch(event).await;
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_names())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
