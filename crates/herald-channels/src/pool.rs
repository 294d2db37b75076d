//! Bounded transport pooling.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use tokio::sync::{Semaphore, SemaphorePermit};

/// A bounded pool of outbound transports (SMTP connections, API clients).
///
/// A transport is checked out for the duration of one send and returned
/// when the guard drops, including on early returns and panics unwinding
/// through the caller. Checkouts beyond the pool size wait until a
/// transport comes back.
pub struct TransportPool<T> {
    transports: Mutex<Vec<T>>,
    permits: Semaphore,
}

impl<T> TransportPool<T> {
    /// Pool the given transports. The pool size is fixed at creation.
    pub fn new(transports: Vec<T>) -> Self {
        let permits = Semaphore::new(transports.len());
        Self {
            transports: Mutex::new(transports),
            permits,
        }
    }

    /// Number of transports currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Check out a transport, waiting for one if the pool is exhausted.
    pub async fn checkout(&self) -> PooledTransport<'_, T> {
        // The semaphore is never closed, and a held permit guarantees a
        // transport is in the vector.
        let permit = self
            .permits
            .acquire()
            .await
            .expect("transport pool semaphore is never closed");
        let transport = self
            .transports
            .lock()
            .expect("transport pool lock poisoned")
            .pop()
            .expect("permit held without an available transport");
        PooledTransport {
            transport: Some(transport),
            pool: self,
            _permit: permit,
        }
    }
}

/// A checked-out transport; returns to the pool on drop.
pub struct PooledTransport<'a, T> {
    transport: Option<T>,
    pool: &'a TransportPool<T>,
    _permit: SemaphorePermit<'a>,
}

impl<T> Deref for PooledTransport<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.transport
            .as_ref()
            .expect("transport taken before drop")
    }
}

impl<T> DerefMut for PooledTransport<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
            .as_mut()
            .expect("transport taken before drop")
    }
}

impl<T> Drop for PooledTransport<'_, T> {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take()
            && let Ok(mut transports) = self.pool.transports.lock()
        {
            // The permit is released after this, so the transport is back
            // before the next checkout proceeds.
            transports.push(transport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn checkout_returns_transport_on_drop() {
        let pool = TransportPool::new(vec!["conn-a"]);
        assert_eq!(pool.available(), 1);

        {
            let conn = pool.checkout().await;
            assert_eq!(*conn, "conn-a");
            assert_eq!(pool.available(), 0);
        }

        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_until_return() {
        let pool = Arc::new(TransportPool::new(vec![0u32]));
        let held = pool.checkout().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut conn = pool.checkout().await;
                *conn += 1;
                *conn
            })
        };

        // The waiter cannot proceed while the transport is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transports_cycle_through_all_waiters() {
        let pool = Arc::new(TransportPool::new(vec![(), ()]));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let _conn = pool.checkout().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pool.available(), 2);
    }
}
