//! In-process event bus.

use crate::config::SchedulerConfig;
use async_trait::async_trait;
use sluice_core::{Error, Result};
use sluice_core::events::Event;
use sluice_core::ports::{EventBus, EventStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{trace, warn};

/// Fan-out bus backed by a tokio broadcast channel. Each subscriber gets its
/// own receiver; slow subscribers lose the oldest events and see an
/// `EventBus` error in their stream where the gap is.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.event_capacity)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        if self.sender.send(event).is_err() {
            trace!(subject = %subject, "No subscribers for event");
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let mut rx = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if subject_matches(&pattern, &event.subject()) {
                            yield Ok(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(pattern = %pattern, skipped, "Event subscriber lagged");
                        yield Err(Error::EventBus(format!("subscriber lagged, {skipped} events skipped")));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Dot-separated token match: `*` matches one token, `>` matches one or
/// more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
