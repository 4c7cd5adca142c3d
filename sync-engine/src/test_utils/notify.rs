use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

/// How long a test waits for a status before giving up.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// An [`Arc<Notify>`] whose waits are bounded, so a status that is never reached fails the
/// test instead of hanging it.
#[derive(Clone)]
pub struct TimedNotify {
    notify: Arc<Notify>,
    timeout_duration: Duration,
}

impl TimedNotify {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self::with_timeout(notify, DEFAULT_NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notify: Arc<Notify>, timeout_duration: Duration) -> Self {
        Self {
            notify,
            timeout_duration,
        }
    }

    /// Waits for the notification.
    ///
    /// # Panics
    ///
    /// Panics when the timeout elapses first.
    pub async fn notified(&self) {
        if timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_err()
        {
            panic!(
                "no notification within {:?}, the awaited status was never reached",
                self.timeout_duration
            );
        }
    }

    /// Waits for the notification, only logging when the timeout elapses first.
    pub async fn try_notified(&self) -> bool {
        let notified = timeout(self.timeout_duration, self.notify.notified())
            .await
            .is_ok();
        if !notified {
            warn!(
                timeout = ?self.timeout_duration,
                "no notification received, the awaited status was never reached"
            );
        }

        notified
    }
}

impl fmt::Debug for TimedNotify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedNotify")
            .field("timeout_duration", &self.timeout_duration)
            .finish()
    }
}
