//! Single-shot, rearmable renewal timer
//!
//! At most one timer is armed at a time. Arming cancels the previous timer
//! through its [`CancellationToken`] and hands out a new ticket id. A firing
//! task runs its callback only after checking that its ticket is still the
//! armed one, so a superseded timer can never act even if cancellation and
//! expiry race.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Armed {
    ticket: u64,
    cancel: CancellationToken,
}

/// Rearmable single-shot timer.
#[derive(Debug, Default)]
pub struct RenewalTimer {
    armed: Mutex<Option<Armed>>,
    next_ticket: AtomicU64,
}

impl RenewalTimer {
    /// Creates a disarmed timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to run `on_fire(ticket)` after `delay`, cancelling any
    /// previously armed timer.
    ///
    /// Returns the new ticket, or `None` when called outside a Tokio runtime
    /// (the timer then stays disarmed).
    pub fn arm<F, Fut>(&self, delay: Duration, on_fire: F) -> Option<u64>
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No async runtime available; renewal timer not armed");
                self.cancel();
                return None;
            }
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        if let Some(previous) = self.lock().replace(Armed {
            ticket,
            cancel: cancel.clone(),
        }) {
            previous.cancel.cancel();
        }

        tracing::debug!(ticket, delay_ms = delay.as_millis() as u64, "Renewal timer armed");

        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::trace!(ticket, "Renewal timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    on_fire(ticket).await;
                }
            }
        });

        Some(ticket)
    }

    /// Cancels the armed timer, if any.
    pub fn cancel(&self) {
        if let Some(armed) = self.lock().take() {
            armed.cancel.cancel();
            tracing::debug!(ticket = armed.ticket, "Renewal timer disarmed");
        }
    }

    /// Whether `ticket` is the currently armed timer.
    pub fn is_current(&self, ticket: u64) -> bool {
        self.lock().as_ref().is_some_and(|armed| armed.ticket == ticket)
    }

    /// Claims the firing of `ticket`: disarms it and returns `true` only if it
    /// was still the armed timer.
    pub fn claim(&self, ticket: u64) -> bool {
        let mut armed = self.lock();
        if armed.as_ref().is_some_and(|a| a.ticket == ticket) {
            *armed = None;
            true
        } else {
            false
        }
    }

    /// Ticket of the armed timer.
    pub fn armed_ticket(&self) -> Option<u64> {
        self.lock().as_ref().map(|armed| armed.ticket)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Armed>> {
        self.armed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RenewalTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
