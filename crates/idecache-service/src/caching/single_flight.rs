use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::utils::defer::defer;

/// The computation a caller was attached to panicked or was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("computation was abandoned before producing a value")]
pub struct Abandoned;

struct Flight<T> {
    id: u64,
    waiters: Vec<oneshot::Sender<T>>,
}

struct Flights<K, T> {
    next_id: u64,
    /// The flight per key that new callers attach to.
    running: HashMap<K, Flight<T>>,
    /// Flights that were forgotten while running. Their waiters are still served, but their
    /// result is not settled.
    detached: HashMap<u64, Vec<oneshot::Sender<T>>>,
}

/// Deduplicates concurrent computations per key.
///
/// The first caller for a key spawns the factory on the runtime. Every caller arriving while it
/// runs is attached to the same computation and receives a clone of its output. Completion is
/// delivered to the waiters in the order they attached. Nothing is memoized here: once a
/// computation finishes, the next call for the key starts a new one.
pub struct SingleFlight<K, T> {
    inner: Arc<Mutex<Flights<K, T>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Flights {
                next_id: 0,
                running: HashMap::new(),
                detached: HashMap::new(),
            })),
        }
    }
}

impl<K, T> fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flights = lock(&self.inner);
        f.debug_struct("SingleFlight")
            .field("running", &flights.running.len())
            .field("detached", &flights.detached.len())
            .finish()
    }
}

fn lock<K, T>(inner: &Mutex<Flights<K, T>>) -> MutexGuard<'_, Flights<K, T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `factory` for `key`, or attaches to the computation already running for it.
    pub fn run<F, Fut>(&self, key: K, factory: F) -> Joined<T>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.run_with(key, || None, factory, |_, _| ())
    }

    /// Like [`run`](Self::run), with two hooks that run under the internal lock.
    ///
    /// `recheck` runs when no computation is pending for `key`. If it yields a value, that value
    /// is returned and nothing is started. `settle` runs once the computation finishes, before
    /// any waiter is woken, unless the flight was [forgotten](Self::forget) in the meantime.
    ///
    /// Together they let a memoizing layer install results without a window in which a caller
    /// sees neither the pending computation nor its stored output.
    pub fn run_with<R, F, Fut, S>(&self, key: K, recheck: R, factory: F, settle: S) -> Joined<T>
    where
        R: FnOnce() -> Option<T>,
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        S: FnOnce(&K, &T) + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let id = {
            let mut flights = lock(&self.inner);
            if let Some(flight) = flights.running.get_mut(&key) {
                flight.waiters.push(sender);
                return Joined::waiting(receiver);
            }
            if let Some(value) = recheck() {
                return Joined::ready(value);
            }

            let id = flights.next_id;
            flights.next_id += 1;
            flights.running.insert(
                key.clone(),
                Flight {
                    id,
                    waiters: vec![sender],
                },
            );
            id
        };

        let on_abandon = {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            defer(move || abandon(&inner, &key, id))
        };
        let future = factory(key.clone());
        let inner = Arc::clone(&self.inner);

        tokio::spawn(
            async move {
                let value = future.await;
                on_abandon.disarm();
                complete(&inner, key, id, value, settle);
            }
            .in_current_span(),
        );

        Joined::waiting(receiver)
    }

    /// Detaches the running computation for `key`.
    ///
    /// Its current waiters still receive its output, but the output is not settled and the next
    /// call for `key` starts a fresh computation. Returns `false` if nothing was running.
    pub fn forget(&self, key: &K) -> bool {
        let mut flights = lock(&self.inner);
        match flights.running.remove(key) {
            Some(flight) => {
                flights.detached.insert(flight.id, flight.waiters);
                true
            }
            None => false,
        }
    }

    /// Detaches every running computation.
    pub fn forget_all(&self) {
        let mut flights = lock(&self.inner);
        let running: Vec<_> = flights.running.drain().map(|(_, flight)| flight).collect();
        for flight in running {
            flights.detached.insert(flight.id, flight.waiters);
        }
    }

    /// Number of keys with a computation that new callers would attach to.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner).running.len()
    }

    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.inner).running.contains_key(key)
    }
}

fn complete<K, T, S>(inner: &Mutex<Flights<K, T>>, key: K, id: u64, value: T, settle: S)
where
    K: Hash + Eq,
    T: Clone,
    S: FnOnce(&K, &T),
{
    let waiters = {
        let mut flights = lock(inner);
        let is_current = flights.running.get(&key).is_some_and(|f| f.id == id);
        if is_current {
            settle(&key, &value);
            flights
                .running
                .remove(&key)
                .map(|f| f.waiters)
                .unwrap_or_default()
        } else {
            flights.detached.remove(&id).unwrap_or_default()
        }
    };

    let mut waiters = waiters;
    let Some(last) = waiters.pop() else {
        return;
    };
    for waiter in waiters {
        // a waiter that went away is simply skipped
        waiter.send(value.clone()).ok();
    }
    last.send(value).ok();
}

fn abandon<K: Hash + Eq, T>(inner: &Mutex<Flights<K, T>>, key: &K, id: u64) {
    let mut flights = lock(inner);
    let dropped = if flights.running.get(key).is_some_and(|f| f.id == id) {
        flights.running.remove(key).map(|f| f.waiters.len())
    } else {
        flights.detached.remove(&id).map(|waiters| waiters.len())
    };
    tracing::error!(
        waiters = dropped.unwrap_or_default(),
        "Computation was abandoned"
    );
}

enum JoinedState<T> {
    Ready(Option<T>),
    Waiting(oneshot::Receiver<T>),
}

/// A caller's handle on a [`SingleFlight`] computation.
///
/// Dropping it detaches only this caller. The computation keeps running for the others.
#[must_use = "futures do nothing unless polled"]
pub struct Joined<T>(JoinedState<T>);

impl<T> Joined<T> {
    fn ready(value: T) -> Self {
        Self(JoinedState::Ready(Some(value)))
    }

    fn waiting(receiver: oneshot::Receiver<T>) -> Self {
        Self(JoinedState::Waiting(receiver))
    }
}

// The value is never pinned, only moved out.
impl<T> Unpin for Joined<T> {}

impl<T> Future for Joined<T> {
    type Output = Result<T, Abandoned>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().0 {
            JoinedState::Ready(value) => Poll::Ready(value.take().ok_or(Abandoned)),
            JoinedState::Waiting(receiver) => Pin::new(receiver).poll(cx).map_err(|_| Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use idecache_test as test;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let group = SingleFlight::<&'static str, u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let first = {
            let calls = Arc::clone(&calls);
            group.run("key", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                released.await.ok();
                42
            })
        };
        let second = {
            let calls = Arc::clone(&calls);
            group.run("key", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            })
        };
        assert_eq!(group.in_flight(), 1);

        release.send(()).unwrap();
        assert_eq!(first.await, Ok(42));
        assert_eq!(second.await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_reach_every_waiter_and_are_not_kept() {
        let group = SingleFlight::<u32, Result<u32, String>>::new();

        let a = group.run(1, |_| async { Err("spawn failed".to_owned()) });
        let b = group.run(1, |_| async { Ok(1) });
        assert_eq!(a.await, Ok(Err("spawn failed".to_owned())));
        assert_eq!(b.await, Ok(Err("spawn failed".to_owned())));

        let c = group.run(1, |_| async { Ok(7) });
        assert_eq!(c.await, Ok(Ok(7)));
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_attach_order() {
        let group = SingleFlight::<u8, u8>::new();
        let (release, released) = oneshot::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut joined = vec![group.run(0, move |_| async move {
            released.await.ok();
            9
        })];
        for _ in 0..3 {
            joined.push(group.run(0, |_| async { 0 }));
        }

        let tasks: Vec<_> = joined
            .into_iter()
            .enumerate()
            .map(|(i, j)| {
                let order = Arc::clone(&order);
                tokio::spawn(async move {
                    let value = j.await.unwrap();
                    order.lock().unwrap().push(i);
                    value
                })
            })
            .collect();
        tokio::task::yield_now().await;
        release.send(()).unwrap();

        for task in tasks {
            assert_eq!(task.await.unwrap(), 9);
        }
        assert_eq!(order.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_settle_runs_before_wakeup() {
        let group = SingleFlight::<u8, u8>::new();
        let settled = Arc::new(AtomicUsize::new(0));

        let joined = {
            let settled = Arc::clone(&settled);
            group.run_with(
                1,
                || None,
                |_| async { 5 },
                move |_, value| {
                    settled.store(*value as usize, Ordering::SeqCst);
                },
            )
        };
        assert_eq!(joined.await, Ok(5));
        assert_eq!(settled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_recheck_short_circuits() {
        let group = SingleFlight::<u8, u8>::new();
        let joined = group.run_with(1, || Some(3), |_| async { 4 }, |_, _| ());
        assert_eq!(group.in_flight(), 0);
        assert_eq!(joined.await, Ok(3));
    }

    #[tokio::test]
    async fn test_forget_detaches_running_flight() {
        let group = SingleFlight::<u8, u8>::new();
        let settled = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let old = {
            let settled = Arc::clone(&settled);
            group.run_with(
                1,
                || None,
                move |_| async move {
                    released.await.ok();
                    1
                },
                move |_, _| {
                    settled.fetch_add(1, Ordering::SeqCst);
                },
            )
        };
        assert!(group.forget(&1));
        assert!(!group.is_running(&1));

        let new = group.run(1, |_| async { 2 });
        assert_eq!(new.await, Ok(2));

        release.send(()).unwrap();
        assert_eq!(old.await, Ok(1));
        assert_eq!(settled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_factory_releases_waiters() {
        test::setup();
        let group = SingleFlight::<u8, u8>::new();

        let a = group.run(1, |_| async {
            if true {
                panic!("factory exploded");
            }
            0
        });
        let b = group.run(1, |_| async { 0 });
        assert_eq!(a.await, Err(Abandoned));
        assert_eq!(b.await, Err(Abandoned));

        assert_eq!(group.run(1, |_| async { 8 }).await, Ok(8));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel() {
        let group = SingleFlight::<u8, u8>::new();
        let (release, released) = oneshot::channel::<()>();

        let first = group.run(1, move |_| async move {
            released.await.ok();
            6
        });
        let second = group.run(1, |_| async { 0 });
        drop(first);

        release.send(()).unwrap();
        assert_eq!(second.await, Ok(6));
    }
}
