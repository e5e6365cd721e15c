//! Account pool and rotation.
//!
//! The pool is the single writer of account health. `acquire` hands out an
//! account for exactly one dispatch attempt (an in-flight flag enforces the
//! one-session-per-account invariant); `release` reports the outcome and
//! drives the health transitions. `acquire` returning `None` is
//! backpressure, not an error.
//!
//! Cool-down is lazy: nothing wakes accounts up on a timer, they become
//! eligible again on the first `acquire` after their interval elapses.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::model::{Account, AccountHealth, RotationStrategy};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Exclusion interval after a challenge or a failure streak.
    pub cooldown: Duration,
    /// Consecutive failures that trip cool-down.
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1800),
            failure_threshold: 3,
        }
    }
}

/// How an attempt ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Handed back without an attempt (spacing or capacity said no);
    /// leaves last-used and the failure tally untouched.
    Unused,
    Sent,
    /// A failure; `penalize` is false for target-structural outcomes.
    Failure { penalize: bool },
    /// Verification challenge detected during the attempt.
    Challenge,
    /// Platform lockout; the account is permanently retired.
    Lockout,
}

struct Slot {
    account: Account,
    in_flight: bool,
    last_used: Option<Instant>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

pub struct AccountPool {
    slots: Mutex<Vec<Slot>>,
    config: PoolConfig,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>, config: PoolConfig) -> Self {
        let slots = accounts
            .into_iter()
            .map(|account| Slot {
                account,
                in_flight: false,
                last_used: None,
                consecutive_failures: 0,
                cooldown_until: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            config,
        }
    }

    /// Hand out a healthy account for one attempt, or `None` when nothing
    /// is available right now.
    pub fn acquire(&self, strategy: RotationStrategy) -> Option<Account> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();

        for slot in slots.iter_mut() {
            expire_cooldown(slot, now);
        }

        let eligible = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_flight && s.account.health == AccountHealth::Healthy);

        let chosen = match strategy {
            // Oldest use first; never-used accounts go to the front.
            RotationStrategy::RoundRobin => eligible
                .min_by_key(|(_, s)| s.last_used.map(|t| (1, t)).unwrap_or((0, now)))
                .map(|(i, _)| i),
            // Stick with the most recently used account until it cools down.
            RotationStrategy::Sticky => eligible
                .max_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i),
        }?;

        let slot = &mut slots[chosen];
        slot.in_flight = true;
        Some(slot.account.clone())
    }

    /// Report an attempt outcome and apply the health transition.
    pub fn release(&self, account_id: &str, outcome: ReleaseOutcome) {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        let slot = match slots.iter_mut().find(|s| s.account.id == account_id) {
            Some(s) => s,
            None => {
                warn!(account_id = account_id, "pool_release_unknown_account");
                return;
            }
        };

        slot.in_flight = false;
        if outcome != ReleaseOutcome::Unused {
            slot.last_used = Some(now);
        }

        match outcome {
            ReleaseOutcome::Unused => {}
            ReleaseOutcome::Sent => {
                slot.consecutive_failures = 0;
            }
            ReleaseOutcome::Failure { penalize: false } => {}
            ReleaseOutcome::Failure { penalize: true } => {
                slot.consecutive_failures += 1;
                if slot.consecutive_failures >= self.config.failure_threshold {
                    slot.account.health = AccountHealth::CoolingDown;
                    slot.cooldown_until = Some(now + self.config.cooldown);
                    info!(
                        account_id = account_id,
                        failures = slot.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "account_cooling_down"
                    );
                }
            }
            ReleaseOutcome::Challenge => {
                slot.account.health = AccountHealth::Challenged;
                slot.cooldown_until = Some(now + self.config.cooldown);
                slot.consecutive_failures = 0;
                warn!(account_id = account_id, "account_challenged");
            }
            ReleaseOutcome::Lockout => {
                slot.account.health = AccountHealth::Locked;
                slot.cooldown_until = None;
                warn!(account_id = account_id, "account_locked");
            }
        }
    }

    /// Accounts that are usable now or can recover on their own. A campaign
    /// only dies when this hits zero (every account locked out).
    pub fn viable_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.account.health != AccountHealth::Locked)
            .count()
    }

    pub fn health_of(&self, account_id: &str) -> Option<AccountHealth> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.account.id == account_id)
            .map(|s| s.account.health)
    }

    /// Current (id, health) snapshot for logging and progress surfaces.
    pub fn snapshot(&self) -> Vec<(String, AccountHealth)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.account.id.clone(), s.account.health))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expire_cooldown(slot: &mut Slot, now: Instant) {
    let recoverable = matches!(
        slot.account.health,
        AccountHealth::CoolingDown | AccountHealth::Challenged
    );
    if recoverable {
        if let Some(until) = slot.cooldown_until {
            if now >= until {
                slot.account.health = AccountHealth::Healthy;
                slot.cooldown_until = None;
                slot.consecutive_failures = 0;
                info!(account_id = %slot.account.id, "account_cooldown_elapsed");
            }
        }
    }
}
