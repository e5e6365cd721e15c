//! Send-cadence accounting: the rolling daily window and per-account
//! spacing. Both are owned exclusively by the scheduler loop, so neither
//! needs a lock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Rolling send-count window (24 h in production).
///
/// The scheduler charges the window when it dispatches and refunds when the
/// attempt fails, so the cap bounds successful sends without letting
/// in-flight attempts overshoot it. A cap of zero means no cap.
pub struct RollingWindow {
    cap: u32,
    window: Duration,
    sends: VecDeque<Instant>,
}

impl RollingWindow {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap,
            window,
            sends: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.sends.front() {
            if front + self.window <= now {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn available(&mut self, now: Instant) -> bool {
        if self.cap == 0 {
            return true;
        }
        self.prune(now);
        (self.sends.len() as u32) < self.cap
    }

    /// Charge one send against the window.
    pub fn charge(&mut self, now: Instant) {
        if self.cap > 0 {
            self.sends.push_back(now);
        }
    }

    /// Return the most recent charge (the attempt it covered failed).
    pub fn refund(&mut self) {
        self.sends.pop_back();
    }

    /// Seed a charge that happened `age` ago (rebuilding after a restart).
    pub fn backfill(&mut self, now: Instant, age: Duration) {
        if self.cap > 0 && age < self.window {
            let at = now.checked_sub(age).unwrap_or(now);
            // Keep the deque ordered.
            let pos = self.sends.partition_point(|&t| t <= at);
            self.sends.insert(pos, at);
        }
    }

    /// When the window next frees a slot. `None` while it is open.
    pub fn next_free(&mut self, now: Instant) -> Option<Instant> {
        if self.available(now) {
            None
        } else {
            self.sends.front().map(|&front| front + self.window)
        }
    }
}

/// Minimum gap between consecutive sends from the same account.
pub struct AccountSpacing {
    min_gap: Duration,
    last_send: HashMap<String, Instant>,
}

impl AccountSpacing {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_send: HashMap::new(),
        }
    }

    pub fn ready(&self, account_id: &str, now: Instant) -> bool {
        match self.last_send.get(account_id) {
            Some(&last) => now.duration_since(last) >= self.min_gap,
            None => true,
        }
    }

    pub fn record(&mut self, account_id: &str, now: Instant) {
        self.last_send.insert(account_id.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test(start_paused = true)]
    async fn test_window_caps_and_rolls_over() {
        let mut window = RollingWindow::new(3, DAY);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(window.available(start));
            window.charge(start);
        }
        assert!(!window.available(start));
        assert_eq!(window.next_free(start), Some(start + DAY));

        // Just before the roll-over: still closed.
        tokio::time::advance(DAY - Duration::from_secs(1)).await;
        assert!(!window.available(Instant::now()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(window.available(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_reopens_window() {
        let mut window = RollingWindow::new(1, DAY);
        let now = Instant::now();

        window.charge(now);
        assert!(!window.available(now));

        window.refund();
        assert!(window.available(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cap_means_unlimited() {
        let mut window = RollingWindow::new(0, DAY);
        let now = Instant::now();
        for _ in 0..1000 {
            window.charge(now);
        }
        assert!(window.available(now));
        assert_eq!(window.next_free(now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_counts_recent_sends_only() {
        let mut window = RollingWindow::new(2, DAY);
        let now = Instant::now();

        window.backfill(now, Duration::from_secs(3600));
        window.backfill(now, DAY + Duration::from_secs(1)); // outside the window
        assert!(window.available(now));

        window.backfill(now, Duration::from_secs(60));
        assert!(!window.available(now));
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_spacing() {
        let mut spacing = AccountSpacing::new(Duration::from_secs(1));
        let start = Instant::now();

        assert!(spacing.ready("a", start));
        spacing.record("a", start);
        assert!(!spacing.ready("a", start));
        // A different account is unaffected.
        assert!(spacing.ready("b", start));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(spacing.ready("a", Instant::now()));
    }
}
