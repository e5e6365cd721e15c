//! Standing popup interception.
//!
//! Platforms surface modal dialogs at unpredictable points in a session, so
//! dismissal is not a state-machine step: a guard task sweeps the dismiss
//! selectors for the whole session lifetime, clicking whatever shows up,
//! independent of whatever the main flow is doing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::Browser;

pub struct PopupGuard {
    handle: JoinHandle<()>,
    dismissed: Arc<AtomicUsize>,
}

impl PopupGuard {
    /// Attach a guard to a live session. It runs until [`stop`] or drop.
    pub fn spawn(
        browser: Arc<dyn Browser>,
        selectors: Vec<String>,
        sweep_interval: Duration,
    ) -> Self {
        let dismissed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dismissed);

        let handle = tokio::spawn(async move {
            loop {
                for selector in &selectors {
                    // Find/click errors are swallowed: a popup race losing to
                    // the main flow must not disturb the attempt.
                    if let Ok(Some(el)) = browser.find(selector).await {
                        if browser.click(&el).await.is_ok() {
                            counter.fetch_add(1, Ordering::Relaxed);
                            debug!(selector = %selector, "popup_dismissed");
                        }
                    }
                }
                tokio::time::sleep(sweep_interval).await;
            }
        });

        Self { handle, dismissed }
    }

    /// Popups dismissed so far.
    pub fn dismissed(&self) -> usize {
        self.dismissed.load(Ordering::Relaxed)
    }

    pub fn stop(self) -> usize {
        self.handle.abort();
        self.dismissed.load(Ordering::Relaxed)
    }
}

impl Drop for PopupGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::runner::tests::MockBrowser;

    #[tokio::test(start_paused = true)]
    async fn test_guard_dismisses_recurring_popups() {
        let browser = Arc::new(MockBrowser::new());
        browser.set_present("button.not-now");
        browser.on_click_remove("button.not-now", "button.not-now");

        let guard = PopupGuard::spawn(
            browser.clone(),
            vec!["button.not-now".to_string()],
            Duration::from_millis(500),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(guard.dismissed(), 1);
        assert!(!browser.is_present("button.not-now"));

        // The popup comes back mid-session; the guard catches it again.
        browser.set_present("button.not-now");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(guard.stop(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_idle_when_nothing_matches() {
        let browser = Arc::new(MockBrowser::new());
        let guard = PopupGuard::spawn(
            browser,
            vec!["button.not-now".to_string()],
            Duration::from_millis(500),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(guard.stop(), 0);
    }
}
