use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("concurrency gate is closed")]
pub struct GateClosed;

/// Bounded admission for outbound completion calls.
#[derive(Clone, Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Admission slot; released when dropped.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Waits for a free slot. Fails only after [`ConcurrencyGate::close`].
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.map_err(|_| GateClosed)?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Rejects current and future waiters. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ConcurrencyGate, GateClosed};

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let gate = ConcurrencyGate::new(2);

        let first = gate.acquire().await.expect("first permit");
        let second = gate.acquire().await.expect("second permit");
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);

        drop(first);
        assert_eq!(gate.in_flight(), 1);
        drop(second);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let _permit = gate.acquire().await.expect("permit");
    }

    #[tokio::test(start_paused = true)]
    async fn never_admits_more_than_capacity() {
        let gate = ConcurrencyGate::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.expect("permit");
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_gate_rejects_waiters() {
        let gate = ConcurrencyGate::new(1);
        gate.close();

        assert_eq!(gate.acquire().await.err(), Some(GateClosed));
    }
}
