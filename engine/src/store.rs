//! In-process record store for campaigns and targets.
//!
//! Stands in for the out-of-scope persistence layer. Updates go through
//! closures under the write lock so each field keeps a single writer;
//! reads hand out clones, never references into the maps.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::model::{Campaign, CampaignId, Target, TargetId, TargetStatus};

#[derive(Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    /// Targets keyed by campaign, ordered by source row.
    targets: RwLock<HashMap<CampaignId, BTreeMap<TargetId, Target>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        let mut campaigns = self.campaigns.write().unwrap();
        campaigns.insert(campaign.id.clone(), campaign);
    }

    pub fn campaign(&self, id: &str) -> Option<Campaign> {
        self.campaigns.read().unwrap().get(id).cloned()
    }

    /// Apply a mutation to a campaign under the write lock.
    pub fn update_campaign<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Campaign),
    {
        let mut campaigns = self.campaigns.write().unwrap();
        match campaigns.get_mut(id) {
            Some(c) => {
                f(c);
                true
            }
            None => false,
        }
    }

    /// Insert targets that are not already present. Returns how many were
    /// new; re-committing the same rows inserts nothing.
    pub fn upsert_targets(&self, campaign_id: &str, incoming: Vec<Target>) -> usize {
        let mut targets = self.targets.write().unwrap();
        let slot = targets.entry(campaign_id.to_string()).or_default();
        let mut inserted = 0;
        for target in incoming {
            if !slot.contains_key(&target.id) {
                slot.insert(target.id, target);
                inserted += 1;
            }
        }
        inserted
    }

    pub fn target(&self, campaign_id: &str, target_id: TargetId) -> Option<Target> {
        self.targets
            .read()
            .unwrap()
            .get(campaign_id)
            .and_then(|m| m.get(&target_id))
            .cloned()
    }

    pub fn update_target<F>(&self, campaign_id: &str, target_id: TargetId, f: F) -> bool
    where
        F: FnOnce(&mut Target),
    {
        let mut targets = self.targets.write().unwrap();
        match targets.get_mut(campaign_id).and_then(|m| m.get_mut(&target_id)) {
            Some(t) => {
                f(t);
                true
            }
            None => false,
        }
    }

    /// All targets for a campaign, in source-row order.
    pub fn targets(&self, campaign_id: &str) -> Vec<Target> {
        self.targets
            .read()
            .unwrap()
            .get(campaign_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of targets still awaiting dispatch, in source-row order.
    pub fn pending_targets(&self, campaign_id: &str) -> Vec<TargetId> {
        self.targets
            .read()
            .unwrap()
            .get(campaign_id)
            .map(|m| {
                m.values()
                    .filter(|t| t.status == TargetStatus::Pending)
                    .map(|t| t.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn target_count(&self, campaign_id: &str) -> usize {
        self.targets
            .read()
            .unwrap()
            .get(campaign_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}
