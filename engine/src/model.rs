//! Core domain types shared across the engine.
//!
//! Campaigns, targets, accounts, proxies, dispatch attempts, and reply
//! events. Mutation discipline: the pool owns account health, the
//! scheduler and sink own campaign counters, the engine owns target
//! status during execution. Everything else reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AttemptError;

pub type CampaignId = String;
pub type AccountId = String;
/// Targets are identified by their source row index.
pub type TargetId = u32;

// =============================================================================
// Campaign
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

/// How the pool hands accounts to consecutive targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Cycle accounts by least-recent use.
    RoundRobin,
    /// Reuse the same account until it hits cool-down.
    Sticky,
}

/// Operator-chosen scheduling policy for a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePolicy {
    /// Attempts before this instant are queued, not executed.
    pub start_at: Option<DateTime<Utc>>,
    /// Maximum sends per rolling 24-hour window.
    pub max_per_day: u32,
    /// Minimum delay between consecutive sends from the same account.
    pub delay_between_ms: u64,
    pub rotation: RotationStrategy,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            start_at: None,
            max_per_day: 50,
            delay_between_ms: 45_000,
            rotation: RotationStrategy::RoundRobin,
        }
    }
}

/// Progress counters, the sole user-visible failure signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub sent: u32,
    pub failed: u32,
    pub replied: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub platform: String,
    pub policy: SchedulePolicy,
    pub status: CampaignStatus,
    pub progress: Progress,
    /// Populated when the campaign fails outright (all accounts unhealthy).
    pub failure_reason: Option<String>,
}

impl Campaign {
    pub fn new(name: &str, platform: &str, policy: SchedulePolicy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            platform: platform.to_string(),
            policy,
            status: CampaignStatus::Draft,
            progress: Progress::default(),
            failure_reason: None,
        }
    }
}

// =============================================================================
// Target
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Sent,
    Failed,
    Skipped,
    Replied,
}

impl TargetStatus {
    /// Status string written back to the source row.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Sent => "sent",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
            TargetStatus::Replied => "replied",
        }
    }
}

/// One profile to be messaged, derived from a source row.
///
/// Identity (profile, message, row) is immutable; status and attempt
/// bookkeeping are owned by the engine during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    /// Profile URL or handle.
    pub profile: String,
    /// Personalized message content.
    pub message: String,
    pub status: TargetStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Transient retries consumed so far.
    pub attempts: u8,
}

impl Target {
    pub fn new(id: TargetId, profile: String, message: String) -> Self {
        Self {
            id,
            profile,
            message,
            status: TargetStatus::Pending,
            last_attempt_at: None,
            attempts: 0,
        }
    }
}

// =============================================================================
// Account & Proxy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountHealth {
    Healthy,
    /// Hit a verification challenge; needs human intervention.
    Challenged,
    /// Platform lockout; never reassigned.
    Locked,
    /// Temporarily excluded after consecutive failures.
    CoolingDown,
}

/// A platform identity used to execute attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: String,
    pub password: String,
    /// Base32 TOTP secret, when two-factor is enabled.
    #[serde(default)]
    pub totp_secret: Option<String>,
    /// Platform-scoped identifier recorded as the sender key on dispatch.
    /// Falls back to the username when the platform id is unknown.
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default = "default_health")]
    pub health: AccountHealth,
    #[serde(default)]
    pub proxy_id: Option<String>,
}

fn default_health() -> AccountHealth {
    AccountHealth::Healthy
}

impl Account {
    /// The key recorded on a dispatch attempt for reply correlation.
    pub fn sender_key(&self) -> &str {
        self.sender_id.as_deref().unwrap_or(&self.username)
    }
}

/// Egress proxy descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: String,
    /// e.g. `http://proxy.example.com:8080`
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(skip, default)]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(skip, default = "default_alive")]
    pub alive: bool,
}

fn default_alive() -> bool {
    true
}

// =============================================================================
// Dispatch attempts & replies
// =============================================================================

/// Reason code carried by a failed attempt, consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    Infra,
    Challenge,
    TargetUnavailable,
    UnsupportedTarget,
    Timeout,
    Navigation,
}

impl From<&AttemptError> for FailReason {
    fn from(err: &AttemptError) -> Self {
        match err {
            AttemptError::Launch(_) | AttemptError::Proxy(_) => FailReason::Infra,
            AttemptError::Challenge | AttemptError::Locked => FailReason::Challenge,
            AttemptError::TargetUnavailable => FailReason::TargetUnavailable,
            AttemptError::UnsupportedTarget => FailReason::UnsupportedTarget,
            AttemptError::Timeout(_) => FailReason::Timeout,
            AttemptError::Navigation(_) | AttemptError::Protocol(_) => FailReason::Navigation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum AttemptOutcome {
    Sent,
    Failed { reason: FailReason },
}

/// One execution of the browser state machine against a Target/Account pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub target_id: TargetId,
    pub account_id: AccountId,
    /// The account's own identifier at send time; the reply correlator
    /// indexes against this.
    pub sender_key: String,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Inbound message event from the platform's webhook channel.
///
/// Ephemeral: consumed once and turned into a status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEvent {
    /// The business account the event was delivered for.
    pub business_account: String,
    /// Platform identifier of the message sender.
    pub sender: String,
    pub text: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_status_terminal() {
        assert!(CampaignStatus::Completed.is_terminal());
        assert!(CampaignStatus::Failed.is_terminal());
        assert!(!CampaignStatus::Running.is_terminal());
        assert!(!CampaignStatus::Paused.is_terminal());
    }

    #[test]
    fn test_sender_key_fallback() {
        let mut account = Account {
            id: "acct-1".into(),
            username: "outreach.bot".into(),
            password: "secret".into(),
            totp_secret: None,
            sender_id: None,
            health: AccountHealth::Healthy,
            proxy_id: None,
        };
        assert_eq!(account.sender_key(), "outreach.bot");

        account.sender_id = Some("17841400000000001".into());
        assert_eq!(account.sender_key(), "17841400000000001");
    }

    #[test]
    fn test_fail_reason_from_error() {
        assert_eq!(
            FailReason::from(&AttemptError::Launch("x".into())),
            FailReason::Infra
        );
        assert_eq!(
            FailReason::from(&AttemptError::TargetUnavailable),
            FailReason::TargetUnavailable
        );
        assert_eq!(
            FailReason::from(&AttemptError::Timeout("x".into())),
            FailReason::Timeout
        );
    }

    #[test]
    fn test_account_deserialization_defaults() {
        let json = r#"{
            "id": "acct-1",
            "username": "bot",
            "password": "pw"
        }"#;

        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.health, AccountHealth::Healthy);
        assert!(account.totp_secret.is_none());
        assert!(account.proxy_id.is_none());
    }

    #[test]
    fn test_attempt_outcome_serialization() {
        let outcome = AttemptOutcome::Failed {
            reason: FailReason::UnsupportedTarget,
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"result\":\"failed\""));
        assert!(json.contains("unsupported_target"));
    }
}
