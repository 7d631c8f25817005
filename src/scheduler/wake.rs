//! Coalesced one-shot wake timer.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Armed {
    deadline: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    armed: Option<Armed>,
    generation: u64,
}

/// Holds at most one pending wake.
///
/// A request never displaces an armed wake that fires sooner; a sooner request
/// aborts and replaces the armed one.
#[derive(Clone, Default)]
pub struct WakeTimer {
    slot: Arc<Mutex<Slot>>,
}

impl WakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `f` to run after `delay`. Returns `false` if an earlier wake is already
    /// armed or no tokio runtime is available.
    pub fn arm<F, Fut>(&self, delay: Duration, f: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = slot.armed.as_ref()
            && !current.handle.is_finished()
            && current.deadline <= deadline
        {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime available, wake not armed");
            return false;
        };

        if let Some(previous) = slot.armed.take() {
            previous.handle.abort();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                // Vacate the slot before running so `f` can arm the next wake.
                let mut slot = shared.lock().unwrap_or_else(|e| e.into_inner());
                if slot.armed.as_ref().is_some_and(|a| a.generation == generation) {
                    slot.armed = None;
                }
            }
            f().await;
        });

        slot.armed = Some(Armed {
            deadline,
            generation,
            handle,
        });
        true
    }

    /// Deadline of the armed wake, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.armed
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    pub fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(armed) = slot.armed.take() {
            armed.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_later_request_does_not_displace_sooner() {
        let timer = WakeTimer::new();
        assert!(timer.arm(Duration::from_secs(5), || async {}));
        let first = timer.deadline().unwrap();

        assert!(!timer.arm(Duration::from_secs(20), || async {}));
        assert_eq!(timer.deadline(), Some(first));

        assert!(timer.arm(Duration::from_secs(1), || async {}));
        assert!(timer.deadline().unwrap() < first);
        timer.cancel();
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_fires_once_and_can_rearm_from_callback() {
        let timer = WakeTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();

        let inner_timer = timer.clone();
        let counter = Arc::clone(&fired);
        timer.arm(Duration::from_millis(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let rearmed = inner_timer.arm(Duration::from_secs(60), || async {});
            let _ = tx.send(rearmed);
        });

        let rearmed = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(rearmed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_armed());
        timer.cancel();
    }
}
