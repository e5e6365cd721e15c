//! Per-attempt finite state machine.
//!
//! One `SessionRunner` walks one Target/Account pair through
//! `Init → Authenticated → PopupClear → Navigated → Composing → Sent`,
//! with every transition returning a typed result. The runner only sees
//! the [`Browser`] trait; [`BrowserDispatcher`] is the production harness
//! that launches the real browser around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AttemptError;
use crate::model::{Account, Campaign, Target};
use crate::proxy::{browser_proxy_arg, ProxyManager};
use crate::session::popup::PopupGuard;
use crate::session::webdriver::{LaunchOptions, WebDriver};
use crate::session::{Browser, Dispatcher, PlatformFlow};
use crate::util::totp::totp_now;
use crate::util::user_agent::pick_user_agent;

/// States of the dispatch state machine, in forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    Authenticated,
    PopupClear,
    Navigated,
    Composing,
    Sent,
}

/// Result of advancing one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(Step),
    Done,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Ceiling for a single element wait.
    pub step_timeout: Duration,
    /// Jittered pause range between user-visible actions, in milliseconds.
    pub step_delay_ms: (u64, u64),
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            step_timeout: Duration::from_millis(config.step_timeout_ms),
            step_delay_ms: config.step_delay_ms,
        }
    }
}

pub struct SessionRunner {
    browser: Arc<dyn Browser>,
    flow: PlatformFlow,
    config: RunnerConfig,
    account: Account,
    target: Target,
}

impl SessionRunner {
    pub fn new(
        browser: Arc<dyn Browser>,
        flow: PlatformFlow,
        config: RunnerConfig,
        account: Account,
        target: Target,
    ) -> Self {
        Self {
            browser,
            flow,
            config,
            account,
            target,
        }
    }

    /// Drive the state machine to a terminal state.
    pub async fn run(&self) -> Result<(), AttemptError> {
        let mut step = Step::Init;
        loop {
            debug!(
                target_id = self.target.id,
                account_id = %self.account.id,
                step = ?step,
                "attempt_step"
            );
            step = match self.advance(step).await? {
                Transition::Next(next) => next,
                Transition::Done => {
                    info!(
                        target_id = self.target.id,
                        account_id = %self.account.id,
                        "attempt_sent"
                    );
                    return Ok(());
                }
            };
        }
    }

    /// Execute one step and name the next. Kept separate from [`run`] so
    /// tests can drive individual transitions.
    pub async fn advance(&self, step: Step) -> Result<Transition, AttemptError> {
        match step {
            Step::Init => {
                // The browser was launched by the dispatcher; prove it is
                // responsive before investing in login.
                self.browser.current_url().await?;
                Ok(Transition::Next(Step::Authenticated))
            }
            Step::Authenticated => {
                self.authenticate().await?;
                Ok(Transition::Next(Step::PopupClear))
            }
            Step::PopupClear => {
                // The standing guard owns continuous dismissal; this step is
                // one synchronous sweep so login-time dialogs cannot shadow
                // the upcoming navigation.
                for selector in &self.flow.popup_dismissers {
                    if let Ok(Some(el)) = self.browser.find(selector).await {
                        let _ = self.browser.click(&el).await;
                    }
                }
                Ok(Transition::Next(Step::Navigated))
            }
            Step::Navigated => {
                self.navigate_to_target().await?;
                Ok(Transition::Next(Step::Composing))
            }
            Step::Composing => {
                self.compose_and_send().await?;
                Ok(Transition::Next(Step::Sent))
            }
            Step::Sent => {
                self.confirm_sent().await?;
                Ok(Transition::Done)
            }
        }
    }

    async fn authenticate(&self) -> Result<(), AttemptError> {
        self.browser.goto(&self.flow.login_url).await?;
        self.pause().await;

        // Persistent profiles usually carry a live session.
        if self.browser.find(&self.flow.logged_in_marker).await?.is_some() {
            debug!(account_id = %self.account.id, "login_session_reused");
            return Ok(());
        }

        let username_el = self
            .browser
            .wait_for(&self.flow.username_field, self.config.step_timeout)
            .await?;
        self.browser
            .type_text(&username_el, &self.account.username)
            .await?;
        self.pause().await;

        let password_el = self
            .browser
            .wait_for(&self.flow.password_field, self.config.step_timeout)
            .await?;
        self.browser
            .type_text(&password_el, &self.account.password)
            .await?;
        self.pause().await;

        let submit = self
            .browser
            .wait_for(&self.flow.login_button, self.config.step_timeout)
            .await?;
        self.browser.click(&submit).await?;

        // Post-submit the page lands on exactly one of: a challenge, a
        // lockout notice, a two-factor prompt, or the logged-in shell.
        let deadline = tokio::time::Instant::now() + self.config.step_timeout;
        let mut totp_attempted = false;
        loop {
            for marker in &self.flow.locked_markers {
                if self.browser.find(marker).await?.is_some() {
                    return Err(AttemptError::Locked);
                }
            }
            for marker in &self.flow.challenge_markers {
                if self.browser.find(marker).await?.is_some() {
                    return Err(AttemptError::Challenge);
                }
            }

            if !totp_attempted {
                if let Some(code_el) = self.browser.find(&self.flow.totp_field).await? {
                    let secret = self
                        .account
                        .totp_secret
                        .as_deref()
                        .ok_or(AttemptError::Challenge)?;
                    let code = totp_now(secret).ok_or(AttemptError::Challenge)?;
                    self.browser.type_text(&code_el, &code).await?;
                    if let Some(submit) = self.browser.find(&self.flow.totp_submit).await? {
                        self.browser.click(&submit).await?;
                    }
                    totp_attempted = true;
                }
            }

            if self.browser.find(&self.flow.logged_in_marker).await?.is_some() {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptError::Timeout("login".into()));
            }
            sleep(Duration::from_millis(300)).await;
        }
    }

    async fn navigate_to_target(&self) -> Result<(), AttemptError> {
        let url = self.flow.profile_url(&self.target.profile);
        self.browser.goto(&url).await?;
        self.pause().await;

        let deadline = tokio::time::Instant::now() + self.config.step_timeout;
        loop {
            for marker in &self.flow.unavailable_markers {
                if self.browser.find(marker).await?.is_some() {
                    return Err(AttemptError::TargetUnavailable);
                }
            }
            if self.browser.find(&self.flow.profile_marker).await?.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptError::Timeout("profile page".into()));
            }
            sleep(Duration::from_millis(300)).await;
        }
    }

    async fn compose_and_send(&self) -> Result<(), AttemptError> {
        // The profile page is confirmed rendered, so a missing message
        // button is structural, not slow.
        let button = match self
            .browser
            .wait_for(&self.flow.message_button, self.config.step_timeout)
            .await
        {
            Ok(el) => el,
            Err(AttemptError::Timeout(_)) => return Err(AttemptError::UnsupportedTarget),
            Err(e) => return Err(e),
        };

        self.browser.click(&button).await?;
        self.pause().await;

        let composer = self
            .browser
            .wait_for(&self.flow.composer, self.config.step_timeout)
            .await?;
        self.browser
            .type_text(&composer, &self.target.message)
            .await?;
        self.pause().await;

        match self.browser.find(&self.flow.send_button).await? {
            Some(send) => self.browser.click(&send).await?,
            // Some layouts only submit on Enter.
            None => self.browser.type_text(&composer, "\n").await?,
        }
        Ok(())
    }

    async fn confirm_sent(&self) -> Result<(), AttemptError> {
        let deadline = tokio::time::Instant::now() + self.config.step_timeout;
        loop {
            if self.browser.find(&self.flow.sent_marker).await?.is_some() {
                return Ok(());
            }
            // The composed text disappearing is an equally positive signal.
            if let Some(composer) = self.browser.find(&self.flow.composer).await? {
                if self.browser.text_of(&composer).await?.is_empty() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AttemptError::Timeout("send confirmation".into()));
            }
            sleep(Duration::from_millis(300)).await;
        }
    }

    async fn pause(&self) {
        let (min, max) = self.config.step_delay_ms;
        if max == 0 {
            return;
        }
        let delay_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(min..=max)
        };
        sleep(Duration::from_millis(delay_ms)).await;
    }
}

// =============================================================================
// Production dispatcher
// =============================================================================

/// Launches a real browser per attempt and runs the state machine in it.
pub struct BrowserDispatcher {
    config: Config,
    proxies: Arc<ProxyManager>,
}

impl BrowserDispatcher {
    pub fn new(config: Config, proxies: Arc<ProxyManager>) -> Self {
        Self { config, proxies }
    }

    async fn launch_for(
        &self,
        account: &Account,
    ) -> Result<(Arc<WebDriver>, Option<String>), AttemptError> {
        let first_proxy = self.proxies.assign(account.proxy_id.as_deref(), None);
        match self.try_launch(account, first_proxy.as_ref()).await {
            Ok(driver) => Ok((Arc::new(driver), first_proxy.map(|p| p.id))),
            Err(first_err) => {
                // One infrastructure retry on a different proxy.
                let failed_id = first_proxy.map(|p| {
                    self.proxies.record_failure(&p.id);
                    p.id
                });
                warn!(
                    account_id = %account.id,
                    error = %first_err,
                    "browser_launch_retrying"
                );
                let alternate = self.proxies.assign(None, failed_id.as_deref());
                let driver = self.try_launch(account, alternate.as_ref()).await?;
                Ok((Arc::new(driver), alternate.map(|p| p.id)))
            }
        }
    }

    async fn try_launch(
        &self,
        account: &Account,
        proxy: Option<&crate::model::Proxy>,
    ) -> Result<WebDriver, AttemptError> {
        if let Some(p) = proxy {
            self.proxies.validate(p).await?;
        }

        let opts = LaunchOptions {
            webdriver_url: self.config.webdriver_url.clone(),
            headless: self.config.headless,
            profile_dir: format!("{}/{}", self.config.profiles_dir, account.id),
            proxy_server: proxy.map(browser_proxy_arg),
            user_agent: pick_user_agent(self.config.user_agent_pool.as_deref()),
            nav_timeout_ms: self.config.nav_timeout_ms,
        };
        WebDriver::launch(&opts).await
    }
}

#[async_trait]
impl Dispatcher for BrowserDispatcher {
    async fn dispatch(
        &self,
        campaign: &Campaign,
        target: &Target,
        account: &Account,
    ) -> Result<(), AttemptError> {
        let flow = PlatformFlow::for_platform(&campaign.platform);
        let (browser, proxy_id) = self.launch_for(account).await?;

        let guard = PopupGuard::spawn(
            browser.clone() as Arc<dyn Browser>,
            flow.popup_dismissers.clone(),
            Duration::from_millis(self.config.popup_sweep_ms),
        );

        let runner = SessionRunner::new(
            browser.clone() as Arc<dyn Browser>,
            flow,
            RunnerConfig::from_config(&self.config),
            account.clone(),
            target.clone(),
        );
        let result = runner.run().await;

        let dismissed = guard.stop();
        if dismissed > 0 {
            debug!(
                target_id = target.id,
                dismissed = dismissed,
                "session_popups_dismissed"
            );
        }
        if let Err(e) = browser.close().await {
            warn!(
                account_id = %account.id,
                proxy_id = ?proxy_id,
                error = %e,
                "browser_close_failed"
            );
        }

        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use crate::session::ElementId;

    /// What clicking an element does to the page, in mock terms.
    enum ClickEffect {
        Add(String),
        Remove(String),
        SetText(String, String),
    }

    /// Scripted browser: selectors are element ids, clicks mutate the
    /// visible-selector set according to pre-registered effects.
    pub struct MockBrowser {
        present: Mutex<HashSet<String>>,
        texts: Mutex<HashMap<String, String>>,
        on_click: Mutex<HashMap<String, Vec<ClickEffect>>>,
        clicks: Mutex<Vec<String>>,
        typed: Mutex<Vec<(String, String)>>,
        visited: Mutex<Vec<String>>,
    }

    impl MockBrowser {
        pub fn new() -> Self {
            Self {
                present: Mutex::new(HashSet::new()),
                texts: Mutex::new(HashMap::new()),
                on_click: Mutex::new(HashMap::new()),
                clicks: Mutex::new(Vec::new()),
                typed: Mutex::new(Vec::new()),
                visited: Mutex::new(Vec::new()),
            }
        }

        pub fn set_present(&self, selector: &str) {
            self.present.lock().unwrap().insert(selector.to_string());
        }

        pub fn is_present(&self, selector: &str) -> bool {
            self.present.lock().unwrap().contains(selector)
        }

        pub fn on_click_add(&self, clicked: &str, appears: &str) {
            self.on_click
                .lock()
                .unwrap()
                .entry(clicked.to_string())
                .or_default()
                .push(ClickEffect::Add(appears.to_string()));
        }

        pub fn on_click_remove(&self, clicked: &str, disappears: &str) {
            self.on_click
                .lock()
                .unwrap()
                .entry(clicked.to_string())
                .or_default()
                .push(ClickEffect::Remove(disappears.to_string()));
        }

        pub fn on_click_set_text(&self, clicked: &str, element: &str, text: &str) {
            self.on_click
                .lock()
                .unwrap()
                .entry(clicked.to_string())
                .or_default()
                .push(ClickEffect::SetText(element.to_string(), text.to_string()));
        }

        pub fn typed(&self) -> Vec<(String, String)> {
            self.typed.lock().unwrap().clone()
        }

        pub fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Browser for MockBrowser {
        async fn goto(&self, url: &str) -> Result<(), AttemptError> {
            self.visited.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn current_url(&self) -> Result<String, AttemptError> {
            Ok(self.visited.lock().unwrap().last().cloned().unwrap_or_default())
        }

        async fn find(&self, selector: &str) -> Result<Option<ElementId>, AttemptError> {
            Ok(self
                .present
                .lock()
                .unwrap()
                .contains(selector)
                .then(|| selector.to_string()))
        }

        async fn click(&self, element: &ElementId) -> Result<(), AttemptError> {
            self.clicks.lock().unwrap().push(element.clone());
            let effects = self.on_click.lock().unwrap();
            if let Some(actions) = effects.get(element) {
                let mut present = self.present.lock().unwrap();
                let mut texts = self.texts.lock().unwrap();
                for action in actions {
                    match action {
                        ClickEffect::Add(s) => {
                            present.insert(s.clone());
                        }
                        ClickEffect::Remove(s) => {
                            present.remove(s);
                        }
                        ClickEffect::SetText(el, text) => {
                            texts.insert(el.clone(), text.clone());
                        }
                    }
                }
            }
            Ok(())
        }

        async fn type_text(&self, element: &ElementId, text: &str) -> Result<(), AttemptError> {
            self.typed
                .lock()
                .unwrap()
                .push((element.clone(), text.to_string()));
            self.texts
                .lock()
                .unwrap()
                .insert(element.clone(), text.to_string());
            Ok(())
        }

        async fn text_of(&self, element: &ElementId) -> Result<String, AttemptError> {
            Ok(self
                .texts
                .lock()
                .unwrap()
                .get(element)
                .cloned()
                .unwrap_or_default())
        }

        async fn close(&self) -> Result<(), AttemptError> {
            Ok(())
        }
    }

    fn flow() -> PlatformFlow {
        PlatformFlow::instagram()
    }

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            step_timeout: Duration::from_secs(5),
            // No humanized pacing in unit tests.
            step_delay_ms: (0, 0),
        }
    }

    fn account() -> Account {
        Account {
            id: "acct-1".into(),
            username: "outreach.bot".into(),
            password: "hunter2".into(),
            totp_secret: None,
            sender_id: Some("17841400000000001".into()),
            health: crate::model::AccountHealth::Healthy,
            proxy_id: None,
        }
    }

    fn target() -> Target {
        Target::new(2, "alice".into(), "hey alice, loved your post".into())
    }

    fn runner(browser: Arc<MockBrowser>, account: Account) -> SessionRunner {
        SessionRunner::new(browser, flow(), runner_config(), account, target())
    }

    /// Wire the mock so the profile page renders and messaging works.
    fn script_profile_page(browser: &MockBrowser) {
        let f = flow();
        browser.set_present(&f.profile_marker);
        browser.set_present(&f.message_button);
        browser.on_click_add(&f.message_button, &f.composer);
        browser.on_click_add(&f.message_button, &f.send_button);
        browser.on_click_set_text(&f.send_button, &f.composer, "");
        browser.on_click_add(&f.send_button, &f.sent_marker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_with_reused_session() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.logged_in_marker);
        script_profile_page(&browser);

        let acct = account();
        runner(browser.clone(), acct).run().await.unwrap();

        // The message text went into the composer.
        let typed = browser.typed();
        assert!(typed
            .iter()
            .any(|(el, text)| el == &f.composer && text == "hey alice, loved your post"));
        // Credentials were never re-entered.
        assert!(!typed.iter().any(|(el, _)| el == &f.username_field));
        // Both the login page and the profile page were visited.
        let visited = browser.visited();
        assert_eq!(visited[0], f.login_url);
        assert!(visited[1].ends_with("/alice/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_login_flow() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.username_field);
        browser.set_present(&f.password_field);
        browser.set_present(&f.login_button);
        browser.on_click_add(&f.login_button, &f.logged_in_marker);
        script_profile_page(&browser);

        runner(browser.clone(), account()).run().await.unwrap();

        let typed = browser.typed();
        assert!(typed
            .iter()
            .any(|(el, text)| el == &f.username_field && text == "outreach.bot"));
        assert!(typed
            .iter()
            .any(|(el, text)| el == &f.password_field && text == "hunter2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_with_totp() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.username_field);
        browser.set_present(&f.password_field);
        browser.set_present(&f.login_button);
        browser.on_click_add(&f.login_button, &f.totp_field);
        browser.on_click_add(&f.login_button, &f.totp_submit);
        browser.on_click_add(&f.totp_submit, &f.logged_in_marker);
        script_profile_page(&browser);

        let mut acct = account();
        acct.totp_secret = Some("GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ".into());

        runner(browser.clone(), acct).run().await.unwrap();

        let code_entry = browser
            .typed()
            .into_iter()
            .find(|(el, _)| el == &f.totp_field)
            .expect("totp code typed");
        assert_eq!(code_entry.1.len(), 6);
        assert!(code_entry.1.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_aborts_attempt() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.username_field);
        browser.set_present(&f.password_field);
        browser.set_present(&f.login_button);
        browser.on_click_add(&f.login_button, &f.challenge_markers[0]);

        let err = runner(browser, account()).run().await.unwrap_err();
        assert!(matches!(err, AttemptError::Challenge));
    }

    #[tokio::test(start_paused = true)]
    async fn test_totp_prompt_without_secret_is_a_challenge() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.username_field);
        browser.set_present(&f.password_field);
        browser.set_present(&f.login_button);
        browser.on_click_add(&f.login_button, &f.totp_field);

        let err = runner(browser, account()).run().await.unwrap_err();
        assert!(matches!(err, AttemptError::Challenge));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_profile() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.logged_in_marker);
        browser.set_present(&f.unavailable_markers[0]);

        let err = runner(browser, account()).run().await.unwrap_err();
        assert!(matches!(err, AttemptError::TargetUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_without_message_button_is_unsupported() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.logged_in_marker);
        browser.set_present(&f.profile_marker);

        let err = runner(browser, account()).run().await.unwrap_err();
        assert!(matches!(err, AttemptError::UnsupportedTarget));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_timeout_is_transient() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.username_field);
        browser.set_present(&f.password_field);
        browser.set_present(&f.login_button);
        // Clicking login never lands anywhere.

        let err = runner(browser, account()).run().await.unwrap_err();
        assert!(matches!(err, AttemptError::Timeout(_)));
        assert!(err.retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_falls_back_to_enter_key() {
        let browser = Arc::new(MockBrowser::new());
        let f = flow();
        browser.set_present(&f.logged_in_marker);
        browser.set_present(&f.profile_marker);
        browser.set_present(&f.message_button);
        browser.on_click_add(&f.message_button, &f.composer);
        // No send button appears; the runner should submit with Enter and
        // then see the sent marker.
        browser.set_present(&f.sent_marker);

        runner(browser.clone(), account()).run().await.unwrap();

        let typed = browser.typed();
        assert!(typed.iter().any(|(el, text)| el == &f.composer && text == "\n"));
    }
}
