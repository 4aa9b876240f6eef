use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of simultaneously executing calls.
#[derive(Debug, Clone)]
pub struct Governor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One concurrency slot. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct Permit {
    _inner: OwnedSemaphorePermit,
}

impl Governor {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Permit {
        // The semaphore is never closed, so acquisition cannot fail.
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Permit { _inner: permit },
            Err(_) => unreachable!("governor semaphore closed"),
        }
    }

    /// Take a free slot if one is available right now.
    pub fn try_admit(&self) -> Option<Permit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _inner: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_admit_respects_capacity() {
        let governor = Governor::new(2);
        let a = governor.try_admit();
        let b = governor.try_admit();
        assert!(a.is_some() && b.is_some());
        assert!(governor.try_admit().is_none());
        assert_eq!(governor.in_flight(), 2);

        drop(a);
        assert_eq!(governor.available(), 1);
        assert!(governor.try_admit().is_some());
    }

    #[tokio::test]
    async fn test_permit_released_when_task_panics() {
        let governor = Governor::new(1);
        let permit = governor.admit().await;

        let handle = tokio::spawn(async move {
            let _permit = permit;
            panic!("boom");
        });
        assert!(handle.await.is_err());
        assert_eq!(governor.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_waits_for_release() {
        let governor = Governor::new(1);
        let permit = governor.admit().await;

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.admit().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let _second = waiter.await.unwrap();
        assert_eq!(governor.available(), 0);
    }
}
