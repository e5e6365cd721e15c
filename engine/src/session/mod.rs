//! Browser session driver.
//!
//! The state machine in [`runner`] talks to the browser only through the
//! [`Browser`] trait, so the whole login/navigate/compose flow unit-tests
//! against a scripted mock. [`webdriver`] is the production implementation
//! speaking the W3C WebDriver protocol; [`popup`] is the standing popup
//! interceptor that runs for the life of a session.

pub mod popup;
pub mod runner;
pub mod webdriver;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AttemptError;
use crate::model::{Account, Campaign, Target};

/// Opaque element reference returned by the browser.
pub type ElementId = String;

/// The network-bound browser boundary. Every operation may suspend.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), AttemptError>;

    async fn current_url(&self) -> Result<String, AttemptError>;

    /// First element matching the CSS selector, or `None`.
    async fn find(&self, selector: &str) -> Result<Option<ElementId>, AttemptError>;

    async fn click(&self, element: &ElementId) -> Result<(), AttemptError>;

    async fn type_text(&self, element: &ElementId, text: &str) -> Result<(), AttemptError>;

    async fn text_of(&self, element: &ElementId) -> Result<String, AttemptError>;

    async fn close(&self) -> Result<(), AttemptError>;

    /// Poll for an element until it appears or the timeout elapses.
    async fn wait_for(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<ElementId, AttemptError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(el) = self.find(selector).await? {
                return Ok(el);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptError::Timeout(selector.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

/// Executes one dispatch attempt end to end. The scheduler depends on this
/// boundary, not on a concrete browser, so scheduling logic tests with a
/// deterministic stand-in.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        campaign: &Campaign,
        target: &Target,
        account: &Account,
    ) -> Result<(), AttemptError>;
}

// =============================================================================
// Platform flow
// =============================================================================

/// Selectors and URLs describing one platform's login/messaging surface.
///
/// The state machine is platform-agnostic; everything platform-specific
/// lives in this value.
#[derive(Debug, Clone)]
pub struct PlatformFlow {
    /// Base URL handles resolve against (e.g. `https://www.instagram.com`).
    pub base_url: String,
    pub login_url: String,
    pub username_field: String,
    pub password_field: String,
    pub login_button: String,
    /// Two-factor code entry, when the platform asks for one.
    pub totp_field: String,
    pub totp_submit: String,
    /// Present once a session is authenticated.
    pub logged_in_marker: String,
    /// Present once a profile page has rendered.
    pub profile_marker: String,
    pub challenge_markers: Vec<String>,
    pub locked_markers: Vec<String>,
    pub unavailable_markers: Vec<String>,
    /// Dialogs dismissed by the standing popup guard.
    pub popup_dismissers: Vec<String>,
    pub message_button: String,
    pub composer: String,
    pub send_button: String,
    /// Appears after a message is accepted by the platform.
    pub sent_marker: String,
}

impl PlatformFlow {
    pub fn instagram() -> Self {
        Self {
            base_url: "https://www.instagram.com".into(),
            login_url: "https://www.instagram.com/accounts/login/".into(),
            username_field: "input[name='username']".into(),
            password_field: "input[name='password']".into(),
            login_button: "button[type='submit']".into(),
            totp_field: "input[name='verificationCode']".into(),
            totp_submit: "button[type='button']".into(),
            logged_in_marker: "svg[aria-label='Home']".into(),
            profile_marker: "header section".into(),
            challenge_markers: vec![
                "input[name='security_code']".into(),
                "[data-testid='challenge-form']".into(),
            ],
            locked_markers: vec!["[data-testid='account-disabled']".into()],
            unavailable_markers: vec!["main h2.page-unavailable".into()],
            popup_dismissers: vec![
                "button.not-now".into(),
                "[aria-label='Close']".into(),
                "button[data-cookiebanner='accept_button']".into(),
            ],
            message_button: "div[role='button'].message-entry".into(),
            composer: "textarea[placeholder='Message...']".into(),
            send_button: "button[type='submit'].send".into(),
            sent_marker: "div[data-testid='message-sent']".into(),
        }
    }

    /// Pick the flow for a campaign's platform name. Unknown platforms get
    /// the Instagram flow, which is the only one shipped today.
    pub fn for_platform(platform: &str) -> Self {
        match platform.to_lowercase().as_str() {
            "instagram" => Self::instagram(),
            other => {
                tracing::warn!(platform = other, "unknown_platform_using_default_flow");
                Self::instagram()
            }
        }
    }

    /// Resolve a profile identifier (full URL or bare handle) to a page URL.
    pub fn profile_url(&self, identifier: &str) -> String {
        let id = identifier.trim();
        if id.starts_with("http://") || id.starts_with("https://") {
            id.to_string()
        } else {
            format!("{}/{}/", self.base_url, id.trim_start_matches('@'))
        }
    }
}
