//! Campaign scheduler.
//!
//! One coordinating loop per running campaign. Each pass it computes the
//! next eligible Target/Account pairing under the rate limits, dispatches
//! it onto the bounded worker pool, and folds finished attempts back into
//! target status, campaign counters, and account health. Attempt outcomes
//! are data here; nothing an attempt does can unwind the loop.

pub mod limiter;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::correlate::{AttemptKey, CorrelationIndex};
use crate::error::{AttemptError, ErrorClass};
use crate::model::{
    Account, AttemptOutcome, CampaignStatus, DispatchAttempt, FailReason, TargetId, TargetStatus,
};
use crate::pool::{AccountPool, ReleaseOutcome};
use crate::session::Dispatcher;
use crate::sink::StatusSink;
use crate::store::MemoryStore;

use limiter::{AccountSpacing, RollingWindow};

const SEND_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Control signal for a running campaign loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
}

/// Shared pieces a campaign loop runs against. Process-scoped, built by
/// the engine, torn down with it.
pub struct CampaignRuntime {
    pub store: Arc<MemoryStore>,
    pub pool: Arc<AccountPool>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub sink: Arc<StatusSink>,
    pub correlation: Arc<CorrelationIndex>,
    /// Pool-wide ceiling on concurrent browser sessions.
    pub concurrency: Arc<Semaphore>,
    pub tick: Duration,
    pub max_transient_retries: u8,
}

struct AttemptDone {
    target_id: TargetId,
    account: Account,
    result: Result<(), AttemptError>,
}

/// Run one campaign to a terminal or paused state.
pub async fn run_campaign(
    rt: Arc<CampaignRuntime>,
    campaign_id: String,
    mut control: watch::Receiver<RunSignal>,
) {
    let campaign = match rt.store.campaign(&campaign_id) {
        Some(c) => c,
        None => {
            error!(campaign_id = %campaign_id, "campaign_missing");
            return;
        }
    };

    // Hold for the configured start time; attempts queue, they don't run.
    if let Some(start_at) = campaign.policy.start_at {
        let now = Utc::now();
        if start_at > now {
            let wait = (start_at - now).to_std().unwrap_or_default();
            rt.store
                .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Scheduled);
            info!(
                campaign_id = %campaign_id,
                wait_secs = wait.as_secs(),
                "campaign_waiting_for_start"
            );
            tokio::select! {
                _ = sleep(wait) => {}
                _ = wait_for_pause(&mut control) => {
                    rt.store
                        .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Paused);
                    return;
                }
            }
        }
    }

    rt.store
        .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Running);
    info!(campaign_id = %campaign_id, "campaign_running");

    let policy = campaign.policy.clone();
    let mut window = RollingWindow::new(policy.max_per_day, SEND_WINDOW);
    seed_window(&rt.store, &campaign_id, &mut window);
    let mut spacing = AccountSpacing::new(Duration::from_millis(policy.delay_between_ms));
    let mut queue: VecDeque<TargetId> = rt.store.pending_targets(&campaign_id).into();
    let mut in_flight: JoinSet<AttemptDone> = JoinSet::new();

    info!(
        campaign_id = %campaign_id,
        queued = queue.len(),
        max_per_day = policy.max_per_day,
        delay_between_ms = policy.delay_between_ms,
        "scheduler_started"
    );

    loop {
        // Operator pause wins over everything: stop assigning now, let
        // in-flight attempts reach a terminal state, then park.
        if *control.borrow() == RunSignal::Pause {
            drain(&rt, &campaign_id, &mut in_flight, &mut queue, &mut window).await;
            rt.store
                .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Paused);
            info!(campaign_id = %campaign_id, "campaign_paused");
            return;
        }

        if queue.is_empty() && in_flight.is_empty() {
            rt.store
                .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Completed);
            info!(campaign_id = %campaign_id, "campaign_completed");
            return;
        }

        if rt.pool.viable_count() == 0 {
            drain(&rt, &campaign_id, &mut in_flight, &mut queue, &mut window).await;
            rt.store.update_campaign(&campaign_id, |c| {
                c.status = CampaignStatus::Failed;
                c.failure_reason = Some("all accounts became unhealthy".into());
            });
            warn!(campaign_id = %campaign_id, "campaign_failed_no_accounts");
            return;
        }

        // Daily cap exhausted: auto-pause until the window frees a slot.
        let now = Instant::now();
        if !queue.is_empty() && !window.available(now) {
            if let Some(free_at) = window.next_free(now) {
                rt.store
                    .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Paused);
                info!(
                    campaign_id = %campaign_id,
                    resume_in_secs = free_at.duration_since(now).as_secs(),
                    "campaign_daily_cap_reached"
                );

                let reopened = wait_for_window(
                    &rt,
                    &campaign_id,
                    free_at,
                    &mut control,
                    &mut in_flight,
                    &mut queue,
                    &mut window,
                )
                .await;
                if !reopened {
                    // Operator paused (or the engine went away) while parked.
                    drain(&rt, &campaign_id, &mut in_flight, &mut queue, &mut window).await;
                    rt.store
                        .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Paused);
                    info!(campaign_id = %campaign_id, "campaign_paused");
                    return;
                }

                rt.store
                    .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Running);
                info!(campaign_id = %campaign_id, "campaign_window_reopened");
                continue;
            }
        }

        // Pair the next target with an eligible account.
        let mut dispatched = false;
        if !queue.is_empty() && window.available(now) {
            if let Ok(permit) = rt.concurrency.clone().try_acquire_owned() {
                match rt.pool.acquire(policy.rotation) {
                    Some(account) if spacing.ready(&account.id, now) => {
                        let Some(target_id) = queue.pop_front() else {
                            rt.pool.release(&account.id, ReleaseOutcome::Unused);
                            continue;
                        };
                        match rt.store.target(&campaign_id, target_id) {
                            Some(target) if target.status == TargetStatus::Pending => {
                                spacing.record(&account.id, now);
                                window.charge(now);

                                let dispatcher = Arc::clone(&rt.dispatcher);
                                let snapshot = campaign.clone();
                                debug!(
                                    campaign_id = %campaign_id,
                                    target_id = target_id,
                                    account_id = %account.id,
                                    "attempt_dispatching"
                                );
                                in_flight.spawn(async move {
                                    let result =
                                        dispatcher.dispatch(&snapshot, &target, &account).await;
                                    drop(permit);
                                    AttemptDone {
                                        target_id,
                                        account,
                                        result,
                                    }
                                });
                                dispatched = true;
                            }
                            _ => {
                                // Target gone or already terminal.
                                rt.pool.release(&account.id, ReleaseOutcome::Unused);
                            }
                        }
                    }
                    Some(account) => {
                        // Account still inside its send gap.
                        rt.pool.release(&account.id, ReleaseOutcome::Unused);
                    }
                    None => {
                        // Backpressure, not failure: no healthy account now.
                        drop(permit);
                    }
                }
            }
        }

        // Sleep until something happens: a finished attempt, a control
        // flip, or the next tick. A successful dispatch skips the tick so
        // other accounts can be paired in the same pass.
        tokio::select! {
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                match done {
                    Ok(done) => {
                        handle_done(&rt, &campaign_id, done, &mut queue, &mut window).await;
                    }
                    Err(e) => error!(campaign_id = %campaign_id, error = %e, "attempt_task_panicked"),
                }
            }
            changed = control.changed() => {
                if changed.is_err() {
                    // Engine dropped the control handle; treat as pause.
                    drain(&rt, &campaign_id, &mut in_flight, &mut queue, &mut window).await;
                    rt.store
                        .update_campaign(&campaign_id, |c| c.status = CampaignStatus::Paused);
                    return;
                }
            }
            _ = sleep(rt.tick), if !dispatched => {}
            _ = std::future::ready(()), if dispatched => {}
        }
    }
}

/// Park until the rolling window frees a slot, still reaping in-flight
/// attempts. Returns false when the operator paused instead.
#[allow(clippy::too_many_arguments)]
async fn wait_for_window(
    rt: &Arc<CampaignRuntime>,
    campaign_id: &str,
    free_at: Instant,
    control: &mut watch::Receiver<RunSignal>,
    in_flight: &mut JoinSet<AttemptDone>,
    queue: &mut VecDeque<TargetId>,
    window: &mut RollingWindow,
) -> bool {
    loop {
        tokio::select! {
            _ = sleep_until(free_at) => return true,
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == RunSignal::Pause {
                    return false;
                }
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Ok(done) = done {
                    handle_done(rt, campaign_id, done, queue, window).await;
                }
            }
        }
    }
}

/// Graceful drain: wait for every in-flight attempt to reach a terminal
/// state and record its outcome.
async fn drain(
    rt: &Arc<CampaignRuntime>,
    campaign_id: &str,
    in_flight: &mut JoinSet<AttemptDone>,
    queue: &mut VecDeque<TargetId>,
    window: &mut RollingWindow,
) {
    while let Some(done) = in_flight.join_next().await {
        match done {
            Ok(done) => handle_done(rt, campaign_id, done, queue, window).await,
            Err(e) => error!(campaign_id = %campaign_id, error = %e, "attempt_task_panicked"),
        }
    }
}

/// Fold one finished attempt back into pool, counters, and queue.
async fn handle_done(
    rt: &Arc<CampaignRuntime>,
    campaign_id: &str,
    done: AttemptDone,
    queue: &mut VecDeque<TargetId>,
    window: &mut RollingWindow,
) {
    let AttemptDone {
        target_id,
        account,
        result,
    } = done;

    match result {
        Ok(()) => {
            let attempt = DispatchAttempt {
                id: Uuid::new_v4(),
                campaign_id: campaign_id.to_string(),
                target_id,
                account_id: account.id.clone(),
                sender_key: account.sender_key().to_string(),
                started_at: Utc::now(),
                outcome: AttemptOutcome::Sent,
            };
            rt.correlation.record(
                &attempt.sender_key,
                AttemptKey {
                    campaign_id: attempt.campaign_id.clone(),
                    target_id,
                    attempt_id: attempt.id,
                },
            );
            rt.pool.release(&account.id, ReleaseOutcome::Sent);
            rt.sink
                .record_terminal(campaign_id, target_id, TargetStatus::Sent)
                .await;
            info!(
                campaign_id = %campaign_id,
                target_id = target_id,
                account_id = %account.id,
                attempt_id = %attempt.id,
                "attempt_succeeded"
            );
        }
        Err(err) => {
            window.refund();
            let reason = FailReason::from(&err);
            warn!(
                campaign_id = %campaign_id,
                target_id = target_id,
                account_id = %account.id,
                error = %err,
                reason = ?reason,
                "attempt_failed"
            );

            match err.class() {
                ErrorClass::Authentication => {
                    let outcome = if matches!(err, AttemptError::Locked) {
                        ReleaseOutcome::Lockout
                    } else {
                        ReleaseOutcome::Challenge
                    };
                    rt.pool.release(&account.id, outcome);
                    // The target was never reached; other accounts get it.
                    queue.push_back(target_id);
                }
                ErrorClass::TargetStructural => {
                    rt.pool
                        .release(&account.id, ReleaseOutcome::Failure { penalize: false });
                    rt.sink
                        .record_terminal(campaign_id, target_id, TargetStatus::Skipped)
                        .await;
                }
                ErrorClass::Transient => {
                    rt.pool
                        .release(&account.id, ReleaseOutcome::Failure { penalize: true });
                    let mut attempts = 0;
                    rt.store.update_target(campaign_id, target_id, |t| {
                        t.attempts += 1;
                        attempts = t.attempts;
                    });
                    if attempts <= rt.max_transient_retries {
                        queue.push_back(target_id);
                    } else {
                        rt.sink
                            .record_terminal(campaign_id, target_id, TargetStatus::Failed)
                            .await;
                    }
                }
                ErrorClass::Infrastructure => {
                    // The driver already burned its one alternate-proxy retry.
                    rt.pool
                        .release(&account.id, ReleaseOutcome::Failure { penalize: true });
                    rt.sink
                        .record_terminal(campaign_id, target_id, TargetStatus::Failed)
                        .await;
                }
            }
        }
    }
}

/// Rebuild the rolling window from send timestamps after a restart, so a
/// paused-and-resumed campaign cannot double its daily cap.
fn seed_window(store: &MemoryStore, campaign_id: &str, window: &mut RollingWindow) {
    let now_utc = Utc::now();
    let now = Instant::now();
    for target in store.targets(campaign_id) {
        if matches!(target.status, TargetStatus::Sent | TargetStatus::Replied) {
            if let Some(at) = target.last_attempt_at {
                let age = (now_utc - at).to_std().unwrap_or_default();
                window.backfill(now, age);
            }
        }
    }
}

async fn wait_for_pause(control: &mut watch::Receiver<RunSignal>) {
    loop {
        if *control.borrow() == RunSignal::Pause {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}
