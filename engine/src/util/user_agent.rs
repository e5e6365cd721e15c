//! User agent rotation utilities.
//!
//! Each browser session gets a user agent picked from the configured pool
//! (or the defaults below), passed to Chrome via `--user-agent`.

use rand::prelude::*;

/// Default user agents if none are configured.
const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Pick a random user agent from the configured pool or defaults.
pub fn pick_user_agent(pool: Option<&[String]>) -> String {
    let mut rng = thread_rng();

    match pool {
        Some(agents) if !agents.is_empty() => agents.choose(&mut rng).unwrap().clone(),
        _ => DEFAULT_USER_AGENTS.choose(&mut rng).unwrap().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_user_agent_default() {
        let ua = pick_user_agent(None);
        assert!(DEFAULT_USER_AGENTS.contains(&ua.as_str()));
    }

    #[test]
    fn test_pick_user_agent_from_pool() {
        let pool = vec!["custom-agent/1.0".to_string()];
        assert_eq!(pick_user_agent(Some(&pool)), "custom-agent/1.0");
    }

    #[test]
    fn test_pick_user_agent_empty_pool_falls_back() {
        let pool: Vec<String> = vec![];
        let ua = pick_user_agent(Some(&pool));
        assert!(DEFAULT_USER_AGENTS.contains(&ua.as_str()));
    }
}
