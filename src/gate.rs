use tokio::sync::watch;

/// One-shot synchronization barrier.
///
/// Starts closed, opens exactly once and stays open. Any number of tasks may
/// wait on it, waiters registered before or after the opening are all released.
#[derive(Debug)]
pub struct Gate {
    state: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// Open the gate. Return `false` if it was already open.
    pub fn open(&self) -> bool {
        self.state.send_if_modified(|opened| {
            if *opened {
                false
            } else {
                *opened = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the gate is opened.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // sender lives as long as `self`, so the only possible outcome is an opened gate
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_released_on_open() {
        let gate = Arc::new(Gate::new());
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(gate.open());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_only_once() {
        let gate = Gate::new();
        assert!(!gate.is_open());
        assert!(gate.open());
        assert!(!gate.open());
        assert!(gate.is_open());
        // late waiter passes through
        tokio::time::timeout(Duration::from_secs(1), gate.wait())
            .await
            .unwrap();
    }
}
