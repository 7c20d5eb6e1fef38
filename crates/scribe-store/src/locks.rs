use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::task::noop_waker_ref;
use tokio::sync::{Mutex, OwnedMutexGuard};

use scribe_core::ids::ThreadId;

/// At most one active turn per thread.
///
/// tokio's mutex queues waiters fairly, so turns on the same thread run in the
/// order they asked for the lock. Use [`ThreadLocks::reserve`] to take a place
/// in that queue before handing the wait to another task. Different threads
/// never contend.
#[derive(Default)]
pub struct ThreadLocks {
    locks: DashMap<ThreadId, Arc<Mutex<()>>>,
}

/// Held for the duration of a turn; releases the thread on drop.
pub struct ThreadGuard {
    thread_id: ThreadId,
    _guard: OwnedMutexGuard<()>,
}

impl ThreadGuard {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }
}

type PendingLock = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// A place in a thread's queue, taken synchronously by [`ThreadLocks::reserve`].
///
/// Dropping it before it is acquired gives the place up.
pub struct Reservation {
    thread_id: ThreadId,
    state: ReservationState,
}

enum ReservationState {
    Ready(OwnedMutexGuard<()>),
    Queued(PendingLock),
}

impl Reservation {
    /// Wait until every earlier reservation on the thread has been released.
    pub async fn acquire(self) -> ThreadGuard {
        let guard = match self.state {
            ReservationState::Ready(guard) => guard,
            ReservationState::Queued(pending) => pending.await,
        };
        ThreadGuard {
            thread_id: self.thread_id,
            _guard: guard,
        }
    }
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, thread_id: &ThreadId) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held across an await.
        let entry = self.locks.entry(thread_id.clone()).or_default();
        Arc::clone(&entry)
    }

    pub async fn acquire(&self, thread_id: &ThreadId) -> ThreadGuard {
        let guard = self.lock_for(thread_id).lock_owned().await;
        ThreadGuard {
            thread_id: thread_id.clone(),
            _guard: guard,
        }
    }

    /// Join the thread's queue now, without awaiting.
    ///
    /// The lock future is polled once here so its waiter is enqueued in call
    /// order; whoever awaits [`Reservation::acquire`] later keeps that place.
    pub fn reserve(&self, thread_id: &ThreadId) -> Reservation {
        let mut pending: PendingLock = Box::pin(self.lock_for(thread_id).lock_owned());
        let mut cx = Context::from_waker(noop_waker_ref());
        let state = match pending.as_mut().poll(&mut cx) {
            Poll::Ready(guard) => ReservationState::Ready(guard),
            Poll::Pending => ReservationState::Queued(pending),
        };
        Reservation {
            thread_id: thread_id.clone(),
            state,
        }
    }

    pub fn try_acquire(&self, thread_id: &ThreadId) -> Option<ThreadGuard> {
        let guard = self.lock_for(thread_id).try_lock_owned().ok()?;
        Some(ThreadGuard {
            thread_id: thread_id.clone(),
            _guard: guard,
        })
    }

    pub fn is_busy(&self, thread_id: &ThreadId) -> bool {
        self.locks
            .get(thread_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of threads with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop entries no turn holds or waits on. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_thread_is_exclusive() {
        let locks = ThreadLocks::new();
        let id = ThreadId::from_raw("t");
        let guard = locks.acquire(&id).await;
        assert_eq!(guard.thread_id(), &id);
        assert!(locks.is_busy(&id));
        assert!(locks.try_acquire(&id).is_none());
        drop(guard);
        assert!(!locks.is_busy(&id));
        assert!(locks.try_acquire(&id).is_some());
    }

    #[tokio::test]
    async fn different_threads_do_not_block() {
        let locks = ThreadLocks::new();
        let _a = locks.acquire(&ThreadId::from_raw("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&ThreadId::from_raw("b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let locks = Arc::new(ThreadLocks::new());
        let id = ThreadId::from_raw("fifo");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.acquire(&id).await;
        let mut handles = Vec::new();
        for n in 0..3 {
            let locks = locks.clone();
            let order = order.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(&id).await;
                order.lock().push(n);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reservations_keep_call_order_across_tasks() {
        let locks = Arc::new(ThreadLocks::new());
        let id = ThreadId::from_raw("queue");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = locks.acquire(&id).await;
        let reservations: Vec<Reservation> = (0..3).map(|_| locks.reserve(&id)).collect();
        // Spawn in reverse so task scheduling alone would invert the order.
        let mut handles = Vec::new();
        for (n, reservation) in reservations.into_iter().enumerate().rev() {
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = reservation.acquire().await;
                order.lock().push(n);
            }));
        }
        tokio::task::yield_now().await;
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn free_thread_reserves_immediately() {
        let locks = ThreadLocks::new();
        let id = ThreadId::from_raw("free");
        let reservation = locks.reserve(&id);
        assert!(locks.is_busy(&id));
        let guard = reservation.acquire().await;
        drop(guard);
        assert!(!locks.is_busy(&id));
    }

    #[tokio::test]
    async fn dropped_reservation_gives_up_its_place() {
        let locks = ThreadLocks::new();
        let id = ThreadId::from_raw("dropped");
        let held = locks.acquire(&id).await;
        let abandoned = locks.reserve(&id);
        let next = locks.reserve(&id);
        drop(abandoned);
        drop(held);
        let guard = tokio::time::timeout(Duration::from_secs(1), next.acquire()).await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn prune_removes_released_entries() {
        let locks = ThreadLocks::new();
        let id = ThreadId::from_raw("done");
        drop(locks.reserve(&id).acquire().await);
        assert_eq!(locks.len(), 1);
        locks.prune();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = ThreadLocks::new();
        let held = locks.acquire(&ThreadId::from_raw("held")).await;
        drop(locks.acquire(&ThreadId::from_raw("idle")).await);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_busy(held.thread_id()));
    }
}
