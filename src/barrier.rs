use tokio::sync::watch;

/// The reason a barrier was released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// every expected agency has sent its final batch
    Completed,
    Shutdown,
}

/// A one-shot latch the draw waits on
///
/// the barrier can only be released once, later releases are ignored
/// and the original reason is kept.
#[derive(Debug)]
pub struct CompletionBarrier {
    state: watch::Sender<Option<Release>>,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    /// Releases the barrier
    ///
    /// returns true only for the call that actually released it
    pub fn release(&self, reason: Release) -> bool {
        self.state.send_if_modified(|state| match state {
            Some(_) => false,
            None => {
                *state = Some(reason);
                true
            }
        })
    }

    pub fn released(&self) -> Option<Release> {
        *self.state.borrow()
    }

    /// Waits until the barrier is released and returns the reason
    pub async fn wait(&self) -> Release {
        let mut rx = self.state.subscribe();
        // bound first so the read guard is released before `rx`
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(Release::Shutdown),
            // unreachable while we hold the sender
            Err(_) => Release::Shutdown,
        };

        reason
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{CompletionBarrier, Release};

    #[tokio::test]
    async fn releases_exactly_once() {
        let barrier = CompletionBarrier::new();
        assert_eq!(barrier.released(), None);

        assert!(barrier.release(Release::Completed));
        assert!(!barrier.release(Release::Shutdown));
        assert!(!barrier.release(Release::Completed));

        assert_eq!(barrier.released(), Some(Release::Completed));
        assert_eq!(barrier.wait().await, Release::Completed);
    }

    #[tokio::test]
    async fn wakes_up_a_waiting_task() {
        let barrier = Arc::new(CompletionBarrier::new());

        let waiter = tokio::spawn({
            let barrier = barrier.clone();
            async move { barrier.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        barrier.release(Release::Shutdown);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Release::Shutdown);
    }
}
