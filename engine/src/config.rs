//! Configuration module for environment variable parsing.
//!
//! All engine tuning comes from environment variables; account and proxy
//! inventories come from JSON files pointed at by env vars.

use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

use crate::model::{Account, Proxy};

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebDriver endpoint driving the browser (chromedriver)
    pub webdriver_url: String,

    /// Run browser sessions headless
    pub headless: bool,

    /// Directory holding one persistent browser profile per account
    pub profiles_dir: String,

    /// Pool-wide ceiling on concurrent browser sessions
    pub concurrency: usize,

    /// Scheduler tick interval in milliseconds
    pub tick_ms: u64,

    /// Timeout for a single element wait inside the driver
    pub step_timeout_ms: u64,

    /// Timeout for page navigation
    pub nav_timeout_ms: u64,

    /// Jittered pause range between driver steps (min, max) in milliseconds
    pub step_delay_ms: (u64, u64),

    /// Transient-failure retries per target before marking it failed
    pub max_transient_retries: u8,

    /// Cool-down interval for an account after suspected detection
    pub account_cooldown_secs: u64,

    /// Consecutive failures before an account enters cool-down
    pub account_failure_threshold: u32,

    /// URL fetched through a proxy to verify liveness
    pub proxy_check_url: String,

    /// Connection failures before a proxy is marked dead
    pub proxy_failure_threshold: u32,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Interval between standing popup-dismissal sweeps
    pub popup_sweep_ms: u64,

    /// Optional pool of user agents to rotate through per session
    pub user_agent_pool: Option<Vec<String>>,

    // =========================================================================
    // Webhook server
    // =========================================================================

    /// Port for the webhook server to listen on
    pub port: u16,

    /// Pre-shared token for webhook GET verification
    pub verify_token: Option<String>,

    /// App secret for X-Hub-Signature-256 payload verification
    pub app_secret: Option<String>,

    // =========================================================================
    // Sheet source
    // =========================================================================

    /// API key for the sheet values API; write-back is skipped when absent
    /// or syntactically implausible
    pub sheets_api_key: Option<String>,

    /// Path to the JSON account inventory
    pub accounts_file: Option<String>,

    /// Path to the JSON proxy inventory
    pub proxies_file: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            webdriver_url: env::var("WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:9515".to_string()),

            headless: parse_bool("BROWSER_HEADLESS", true),

            profiles_dir: env::var("PROFILES_DIR")
                .unwrap_or_else(|_| "/var/lib/reachout/profiles".to_string()),

            concurrency: env::var("ENGINE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),

            tick_ms: env::var("TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),

            step_timeout_ms: env::var("STEP_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15_000),

            nav_timeout_ms: env::var("NAV_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),

            step_delay_ms: parse_range("STEP_DELAY_RANGE_MS", (800, 2500)),

            max_transient_retries: env::var("MAX_TRANSIENT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),

            account_cooldown_secs: env::var("ACCOUNT_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1800),

            account_failure_threshold: env::var("ACCOUNT_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),

            proxy_check_url: env::var("PROXY_CHECK_URL")
                .unwrap_or_else(|_| "https://www.google.com/generate_204".to_string()),

            proxy_failure_threshold: env::var("PROXY_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),

            request_timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),

            popup_sweep_ms: env::var("POPUP_SWEEP_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500),

            user_agent_pool: parse_csv("USER_AGENT_POOL"),

            // Webhook server
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),

            verify_token: env::var("WEBHOOK_VERIFY_TOKEN").ok(),

            app_secret: env::var("WEBHOOK_APP_SECRET").ok(),

            // Sheet source
            sheets_api_key: env::var("SHEETS_API_KEY").ok(),

            accounts_file: env::var("ACCOUNTS_FILE").ok(),

            proxies_file: env::var("PROXIES_FILE").ok(),
        }
    }

    /// Load the account inventory from the configured JSON file.
    pub fn load_accounts(&self) -> Result<Vec<Account>> {
        match &self.accounts_file {
            Some(path) => load_json(path).context("Failed to load accounts file"),
            None => Ok(Vec::new()),
        }
    }

    /// Load the proxy inventory from the configured JSON file.
    pub fn load_proxies(&self) -> Result<Vec<Proxy>> {
        match &self.proxies_file {
            Some(path) => load_json(path).context("Failed to load proxies file"),
            None => Ok(Vec::new()),
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<Vec<T>> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("Failed to read {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path))
}

/// Parse a comma-separated range like "500,5000" into a tuple.
fn parse_range(name: &str, default: (u64, u64)) -> (u64, u64) {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 2 {
        warn!(env_var = name, value = %raw, "Invalid range format, using default");
        return default;
    }

    let min = parts[0].trim().parse::<u64>();
    let max = parts[1].trim().parse::<u64>();

    match (min, max) {
        (Ok(min), Ok(max)) if min <= max => (min, max),
        _ => {
            warn!(env_var = name, value = %raw, "Invalid range values, using default");
            default
        }
    }
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Parse a boolean flag with tolerant spellings.
fn parse_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_valid() {
        env::set_var("TEST_RANGE_RO", "100,500");
        let result = parse_range("TEST_RANGE_RO", (0, 0));
        assert_eq!(result, (100, 500));
        env::remove_var("TEST_RANGE_RO");
    }

    #[test]
    fn test_parse_range_default() {
        let result = parse_range("NONEXISTENT_VAR", (10, 20));
        assert_eq!(result, (10, 20));
    }

    #[test]
    fn test_parse_range_inverted_falls_back() {
        env::set_var("TEST_RANGE_RO_INV", "500,100");
        let result = parse_range("TEST_RANGE_RO_INV", (1, 2));
        assert_eq!(result, (1, 2));
        env::remove_var("TEST_RANGE_RO_INV");
    }

    #[test]
    fn test_parse_csv() {
        env::set_var("TEST_CSV_RO", "foo, bar, baz");
        let result = parse_csv("TEST_CSV_RO");
        assert_eq!(
            result,
            Some(vec!["foo".to_string(), "bar".to_string(), "baz".to_string()])
        );
        env::remove_var("TEST_CSV_RO");
    }

    #[test]
    fn test_parse_bool() {
        env::set_var("TEST_BOOL_RO", "false");
        assert!(!parse_bool("TEST_BOOL_RO", true));
        env::set_var("TEST_BOOL_RO", "YES");
        assert!(parse_bool("TEST_BOOL_RO", false));
        env::remove_var("TEST_BOOL_RO");
        assert!(parse_bool("TEST_BOOL_RO", true));
    }
}
