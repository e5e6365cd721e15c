//! Status sink: per-target outcomes flow back to the originating source
//! and into the campaign counters.
//!
//! Write-back is best-effort by contract; the message side-effect already
//! happened and cannot be rolled back, so a failed write is logged and
//! swallowed, never allowed to disturb dispatch. Together with the
//! scheduler, the sink is the only writer of campaign progress counters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::model::{CampaignId, TargetId, TargetStatus};
use crate::source::TargetSource;
use crate::store::MemoryStore;

pub struct StatusSink {
    store: Arc<MemoryStore>,
    /// Each campaign writes back to the source it was committed from.
    sources: RwLock<HashMap<CampaignId, Arc<dyn TargetSource>>>,
}

impl StatusSink {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a campaign to its originating source.
    pub fn register_source(&self, campaign_id: &str, source: Arc<dyn TargetSource>) {
        self.sources
            .write()
            .unwrap()
            .insert(campaign_id.to_string(), source);
    }

    /// Record a terminal outcome for a target: status, counters, write-back.
    pub async fn record_terminal(
        &self,
        campaign_id: &str,
        target_id: TargetId,
        status: TargetStatus,
    ) {
        self.store.update_target(campaign_id, target_id, |t| {
            t.status = status;
            t.last_attempt_at = Some(chrono::Utc::now());
        });

        self.store.update_campaign(campaign_id, |c| match status {
            TargetStatus::Sent => c.progress.sent += 1,
            TargetStatus::Failed => c.progress.failed += 1,
            TargetStatus::Skipped => c.progress.skipped += 1,
            TargetStatus::Replied => c.progress.replied += 1,
            TargetStatus::Pending => {}
        });

        self.write_back(campaign_id, target_id, status).await;
    }

    /// Flip a sent target to replied. Returns whether a transition happened
    /// (replies to targets that never reached `Sent` change nothing).
    pub async fn record_reply(&self, campaign_id: &str, target_id: TargetId) -> bool {
        let mut transitioned = false;
        self.store.update_target(campaign_id, target_id, |t| {
            if t.status == TargetStatus::Sent {
                t.status = TargetStatus::Replied;
                transitioned = true;
            }
        });

        if transitioned {
            self.store
                .update_campaign(campaign_id, |c| c.progress.replied += 1);
            self.write_back(campaign_id, target_id, TargetStatus::Replied)
                .await;
        }
        transitioned
    }

    async fn write_back(&self, campaign_id: &str, target_id: TargetId, status: TargetStatus) {
        let source = {
            let sources = self.sources.read().unwrap();
            sources.get(campaign_id).cloned()
        };
        let source = match source {
            Some(s) => s,
            None => {
                debug!(
                    campaign_id = campaign_id,
                    target_id = target_id,
                    "status_write_back_no_source"
                );
                return;
            }
        };

        match source.write_status(target_id, status.as_str()).await {
            Ok(()) => debug!(
                campaign_id = campaign_id,
                target_id = target_id,
                status = status.as_str(),
                "status_written_back"
            ),
            Err(e) => warn!(
                campaign_id = campaign_id,
                target_id = target_id,
                status = status.as_str(),
                error = %e,
                "status_write_back_failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Campaign, SchedulePolicy, Target};
    use crate::source::StaticSource;

    fn setup() -> (Arc<MemoryStore>, Arc<StaticSource>, StatusSink, String) {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(StaticSource::new(vec!["profile", "message"], vec![]));
        let campaign = Campaign::new("c", "instagram", SchedulePolicy::default());
        let id = campaign.id.clone();
        store.insert_campaign(campaign);
        store.upsert_targets(&id, vec![Target::new(2, "alice".into(), "hi".into())]);
        let sink = StatusSink::new(store.clone());
        sink.register_source(&id, source.clone());
        (store, source, sink, id)
    }

    #[tokio::test]
    async fn test_terminal_outcome_updates_everything() {
        let (store, source, sink, id) = setup();

        sink.record_terminal(&id, 2, TargetStatus::Sent).await;

        let campaign = store.campaign(&id).unwrap();
        assert_eq!(campaign.progress.sent, 1);
        assert_eq!(store.target(&id, 2).unwrap().status, TargetStatus::Sent);
        assert_eq!(source.written_statuses(), vec![(2, "sent".to_string())]);
    }

    #[tokio::test]
    async fn test_reply_only_transitions_sent_targets() {
        let (store, _source, sink, id) = setup();

        // Reply before any send: nothing moves.
        assert!(!sink.record_reply(&id, 2).await);
        assert_eq!(store.campaign(&id).unwrap().progress.replied, 0);

        sink.record_terminal(&id, 2, TargetStatus::Sent).await;
        assert!(sink.record_reply(&id, 2).await);
        // A duplicate reply does not double-count.
        assert!(!sink.record_reply(&id, 2).await);

        let campaign = store.campaign(&id).unwrap();
        assert_eq!(campaign.progress.replied, 1);
        assert_eq!(store.target(&id, 2).unwrap().status, TargetStatus::Replied);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let campaign = Campaign::new("c", "instagram", SchedulePolicy::default());
        let id = campaign.id.clone();
        store.insert_campaign(campaign);
        store.upsert_targets(&id, vec![Target::new(2, "alice".into(), "hi".into())]);

        let sink = StatusSink::new(store.clone());
        sink.record_terminal(&id, 2, TargetStatus::Sent).await;
        assert_eq!(store.campaign(&id).unwrap().progress.sent, 1);
    }
}
