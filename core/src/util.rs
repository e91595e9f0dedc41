use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Make a notifier that is fulfilled when SIGINT occurs.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("Keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}

/// Upstream retry back-off schedule: 750ms → 1.5s → 3s, with jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 750u64 * (1u64 << (attempt.saturating_sub(1)));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Truncate to at most `max` characters without splitting a code point.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff(1);
        let third = backoff(3);
        assert!(first >= Duration::from_millis(600));
        assert!(first <= Duration::from_millis(900));
        assert!(third >= Duration::from_millis(2400));
        assert!(third <= Duration::from_millis(3600));
    }

    #[test]
    fn truncation_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
