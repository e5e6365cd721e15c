//! Process-scoped engine state and the campaign control surface.
//!
//! One `Engine` value owns the account pool, proxy manager, correlation
//! index, reply channel, and the set of running campaign loops. It is
//! created at daemon start and torn down on shutdown; no ambient
//! singletons, so tests build as many engines per process as they like.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::correlate::{CorrelationIndex, Correlator};
use crate::model::{Account, Campaign, CampaignId, Proxy, ReplyEvent, SchedulePolicy};
use crate::pool::{AccountPool, PoolConfig};
use crate::proxy::ProxyManager;
use crate::schedule::{run_campaign, CampaignRuntime, RunSignal};
use crate::session::runner::BrowserDispatcher;
use crate::session::Dispatcher;
use crate::sink::StatusSink;
use crate::source::{self, ColumnMap, CommitSummary, Preview, TargetSource};
use crate::store::MemoryStore;

/// Capacity of the webhook → correlator channel. Delivery bursts beyond
/// this are dropped with a warning rather than blocking the HTTP handler.
const REPLY_CHANNEL_CAPACITY: usize = 1024;

struct CampaignHandle {
    control: watch::Sender<RunSignal>,
    task: JoinHandle<()>,
}

pub struct Engine {
    config: Config,
    store: Arc<MemoryStore>,
    pool: Arc<AccountPool>,
    proxies: Arc<ProxyManager>,
    sink: Arc<StatusSink>,
    correlation: Arc<CorrelationIndex>,
    dispatcher: Arc<dyn Dispatcher>,
    concurrency: Arc<Semaphore>,
    reply_tx: mpsc::Sender<ReplyEvent>,
    correlator: Mutex<Option<JoinHandle<()>>>,
    campaigns: Mutex<HashMap<CampaignId, CampaignHandle>>,
}

impl Engine {
    /// Build an engine with the production browser dispatcher.
    pub fn new(config: Config, accounts: Vec<Account>, proxies: Vec<Proxy>) -> Arc<Self> {
        let proxy_manager = Arc::new(ProxyManager::new(
            proxies,
            &config.proxy_check_url,
            config.proxy_failure_threshold,
            Duration::from_millis(config.request_timeout_ms),
        ));
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(BrowserDispatcher::new(
            config.clone(),
            Arc::clone(&proxy_manager),
        ));
        Self::with_dispatcher(config, accounts, proxy_manager, dispatcher)
    }

    /// Build an engine around an arbitrary dispatcher (tests hand in a
    /// deterministic one).
    pub fn with_dispatcher(
        config: Config,
        accounts: Vec<Account>,
        proxies: Arc<ProxyManager>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Arc<Self> {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(StatusSink::new(Arc::clone(&store)));
        let correlation = Arc::new(CorrelationIndex::new());
        let pool = Arc::new(AccountPool::new(
            accounts,
            PoolConfig {
                cooldown: Duration::from_secs(config.account_cooldown_secs),
                failure_threshold: config.account_failure_threshold,
            },
        ));

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let correlator_task = tokio::spawn(
            Correlator::new(Arc::clone(&correlation), Arc::clone(&sink), reply_rx).run(),
        );

        let concurrency = Arc::new(Semaphore::new(config.concurrency.max(1)));

        info!(
            accounts = pool.len(),
            proxies = proxies.alive_count(),
            concurrency = config.concurrency,
            "engine_created"
        );

        Arc::new(Self {
            config,
            store,
            pool,
            proxies,
            sink,
            correlation,
            dispatcher,
            concurrency,
            reply_tx,
            correlator: Mutex::new(Some(correlator_task)),
            campaigns: Mutex::new(HashMap::new()),
        })
    }

    /// Sample a source and infer its column mapping; persists nothing.
    pub async fn preview_source(
        &self,
        source: &dyn TargetSource,
        limit: u32,
    ) -> Result<Preview> {
        source::preview(source, limit).await
    }

    /// Create a campaign and commit the source's rows as its target set.
    ///
    /// The column mapping is inferred from the headers unless one is given.
    pub async fn create_campaign(
        &self,
        name: &str,
        platform: &str,
        policy: SchedulePolicy,
        source: Arc<dyn TargetSource>,
        mapping: Option<ColumnMap>,
    ) -> Result<(CampaignId, CommitSummary)> {
        let mapping = match mapping {
            Some(m) => m,
            None => {
                let headers = source.headers().await?;
                source::infer_mapping(&headers)
                    .context("could not infer profile/message columns from headers")?
            }
        };

        let campaign = Campaign::new(name, platform, policy);
        let campaign_id = campaign.id.clone();
        self.store.insert_campaign(campaign);

        let summary = source::commit(source.as_ref(), mapping, &self.store, &campaign_id).await?;
        self.sink.register_source(&campaign_id, source);

        info!(
            campaign_id = %campaign_id,
            name = name,
            platform = platform,
            committed = summary.committed,
            skipped_invalid = summary.skipped_invalid,
            "campaign_created"
        );

        Ok((campaign_id, summary))
    }

    /// Start (or resume) a campaign's scheduler loop. Idempotent: a second
    /// start against a live loop is a no-op and returns false.
    pub fn start(&self, campaign_id: &str) -> Result<bool> {
        if self.store.campaign(campaign_id).is_none() {
            anyhow::bail!("unknown campaign {}", campaign_id);
        }

        let mut campaigns = self.campaigns.lock().unwrap();
        if let Some(handle) = campaigns.get(campaign_id) {
            if !handle.task.is_finished() {
                info!(campaign_id = campaign_id, "campaign_already_running");
                return Ok(false);
            }
        }

        let runtime = Arc::new(CampaignRuntime {
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
            dispatcher: Arc::clone(&self.dispatcher),
            sink: Arc::clone(&self.sink),
            correlation: Arc::clone(&self.correlation),
            concurrency: Arc::clone(&self.concurrency),
            tick: Duration::from_millis(self.config.tick_ms),
            max_transient_retries: self.config.max_transient_retries,
        });

        let (control, control_rx) = watch::channel(RunSignal::Run);
        let task = tokio::spawn(run_campaign(
            runtime,
            campaign_id.to_string(),
            control_rx,
        ));
        campaigns.insert(campaign_id.to_string(), CampaignHandle { control, task });

        info!(campaign_id = campaign_id, "campaign_started");
        Ok(true)
    }

    /// Ask a running campaign to pause. In-flight attempts drain before the
    /// loop parks; this only signals.
    pub fn pause(&self, campaign_id: &str) -> bool {
        let campaigns = self.campaigns.lock().unwrap();
        match campaigns.get(campaign_id) {
            Some(handle) => {
                let signalled = handle.control.send(RunSignal::Pause).is_ok();
                info!(
                    campaign_id = campaign_id,
                    signalled = signalled,
                    "campaign_pause_requested"
                );
                signalled
            }
            None => false,
        }
    }

    /// Snapshot of a campaign, counters included.
    pub fn progress(&self, campaign_id: &str) -> Option<Campaign> {
        self.store.campaign(campaign_id)
    }

    /// Sender half of the webhook → correlator channel.
    pub fn reply_sender(&self) -> mpsc::Sender<ReplyEvent> {
        self.reply_tx.clone()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }

    /// Pause every campaign, wait for the loops to drain, stop the
    /// correlator.
    pub async fn shutdown(&self) {
        let handles: Vec<(CampaignId, CampaignHandle)> = {
            let mut campaigns = self.campaigns.lock().unwrap();
            campaigns.drain().collect()
        };

        let joins = handles.into_iter().map(|(campaign_id, handle)| {
            let _ = handle.control.send(RunSignal::Pause);
            async move { (campaign_id, handle.task.await) }
        });
        for (campaign_id, joined) in futures::future::join_all(joins).await {
            if let Err(e) = joined {
                warn!(campaign_id = %campaign_id, error = %e, "campaign_task_join_failed");
            }
        }

        let correlator = self.correlator.lock().unwrap().take();
        if let Some(task) = correlator {
            task.abort();
        }

        info!("engine_shutdown_complete");
    }
}
