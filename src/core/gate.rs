//! Counting semaphore bounding in-flight broadcasts and proposals.

use tokio::sync::Semaphore;

/// A counting semaphore whose permits are released by protocol events rather
/// than by scope: a permit taken at broadcast/propose time is handed back
/// when the corresponding delivery or decision happens, usually on another
/// task. Fairness is not required.
#[derive(Debug)]
pub struct SendGate {
    permits: Semaphore,
}

impl SendGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Semaphore::new(capacity),
        }
    }

    /// Blocks while the gate is at capacity.
    pub async fn acquire(&self) {
        // The semaphore is never closed, so this cannot fail.
        let permit = self.permits.acquire().await.expect("gate never closes");
        permit.forget();
    }

    /// Returns one permit and wakes one waiter.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn acquire_consumes_release_restores() {
        let gate = SendGate::new(2);
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(gate.available(), 0);
        gate.release();
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn acquire_blocks_until_release() {
        let gate = Arc::new(SendGate::new(1));
        gate.acquire().await;

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.acquire().await;
            })
        };

        // The waiter cannot finish before someone releases.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.release();
        waiter.await.unwrap();
        assert_eq!(gate.available(), 0);
    }
}
