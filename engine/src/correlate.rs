//! Reply correlation.
//!
//! Dispatch records each attempt under the sending account's identifier;
//! inbound webhook events look that identifier up and flip the matched
//! target to replied. Unmatched events are discarded without error; plenty
//! of inbound traffic originates outside tracked campaigns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{CampaignId, ReplyEvent, TargetId};
use crate::sink::StatusSink;

/// Where a sender key points: the attempt that recorded it.
#[derive(Debug, Clone)]
pub struct AttemptKey {
    pub campaign_id: CampaignId,
    pub target_id: TargetId,
    pub attempt_id: Uuid,
}

/// Sender key → most recent attempt. Written by the scheduler at send
/// time, read by the correlator.
#[derive(Default)]
pub struct CorrelationIndex {
    inner: Mutex<HashMap<String, AttemptKey>>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt under its sender key. The newest attempt wins
    /// when several share a key.
    pub fn record(&self, sender_key: &str, key: AttemptKey) {
        self.inner
            .lock()
            .unwrap()
            .insert(sender_key.to_string(), key);
    }

    pub fn lookup(&self, sender: &str) -> Option<AttemptKey> {
        self.inner.lock().unwrap().get(sender).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Correlator task
// =============================================================================

/// Consumes reply events from the webhook channel and applies them.
///
/// Runs as an independent task: correlation never blocks dispatch, and the
/// webhook handler never waits on it.
pub struct Correlator {
    index: Arc<CorrelationIndex>,
    sink: Arc<StatusSink>,
    rx: mpsc::Receiver<ReplyEvent>,
}

impl Correlator {
    pub fn new(
        index: Arc<CorrelationIndex>,
        sink: Arc<StatusSink>,
        rx: mpsc::Receiver<ReplyEvent>,
    ) -> Self {
        Self { index, sink, rx }
    }

    pub async fn run(mut self) {
        info!("correlator_started");
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        info!("correlator_stopped");
    }

    async fn handle(&self, event: ReplyEvent) {
        // Echoes of our own outbound messages arrive on the same channel.
        if event.sender == event.business_account {
            debug!(sender = %event.sender, "reply_echo_dropped");
            return;
        }

        match self.index.lookup(&event.sender) {
            Some(key) => {
                let transitioned = self
                    .sink
                    .record_reply(&key.campaign_id, key.target_id)
                    .await;
                info!(
                    sender = %event.sender,
                    campaign_id = %key.campaign_id,
                    target_id = key.target_id,
                    attempt_id = %key.attempt_id,
                    transitioned = transitioned,
                    "reply_correlated"
                );
            }
            None => {
                debug!(
                    sender = %event.sender,
                    business_account = %event.business_account,
                    "reply_unmatched_discarded"
                );
            }
        }
    }
}

// =============================================================================
// Webhook payload shape
// =============================================================================

/// Platform delivery payload: one or more entries, each carrying messaging
/// events for one business account.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    /// Business account the events belong to.
    pub id: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
pub struct MessagingEvent {
    pub sender: Party,
    #[serde(default)]
    pub recipient: Option<Party>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<MessageBody>,
}

#[derive(Debug, Deserialize)]
pub struct Party {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: Option<bool>,
}

impl WebhookPayload {
    /// Flatten the nested delivery into reply events, skipping non-message
    /// and echo entries.
    pub fn into_events(self) -> Vec<ReplyEvent> {
        let mut events = Vec::new();
        for entry in self.entry {
            for messaging in entry.messaging {
                let message = match messaging.message {
                    Some(m) => m,
                    None => continue,
                };
                if message.is_echo.unwrap_or(false) {
                    continue;
                }
                events.push(ReplyEvent {
                    business_account: entry.id.clone(),
                    sender: messaging.sender.id,
                    text: message.text.unwrap_or_default(),
                    timestamp: messaging.timestamp.or(entry.time).unwrap_or_default(),
                });
            }
        }
        events
    }
}
