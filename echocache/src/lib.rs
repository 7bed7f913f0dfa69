//! Request coalescing for async fetches.
//!
//! [`Request`] guarantees that only one instance of a future is in flight at a
//! time, with every concurrent caller receiving a clone of its output.
//! [`CacheMap`] builds on it to provide a keyed cache where each key has at most
//! one producer running, and values can expire.
#![allow(clippy::arc_with_non_send_sync)]

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Weak},
    time::Instant,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::RecvError;

#[derive(Debug)]
struct RequestInner<T> {
    inflight: Option<Weak<broadcast::Sender<T>>>,
}

impl<T> RequestInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get_reciever(&self) -> Option<broadcast::Receiver<T>> {
        self.inflight
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|tx| tx.subscribe())
    }
}

impl<T> Default for RequestInner<T> {
    fn default() -> Self {
        RequestInner { inflight: None }
    }
}

/// A future resolving to the output of an in-flight [`Request`].
pub struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut reciever: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { reciever.recv().await }),
        }
    }
}

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

/// A coalesced request, which will ensure that only one of
/// these requests can go through to the endpoint.
///
/// The underlying future is spawned onto the tokio runtime, so dropping
/// a [`Handle`] never cancels work that other handles are waiting on.
#[derive(Debug)]
pub struct Request<T> {
    inner: Arc<Mutex<RequestInner<T>>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Request<T> {
    fn default() -> Self {
        Self {
            inner: Default::default(),
        }
    }
}

impl<T> Request<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Get a handle to the one-and-only inflight request for
    /// this request manager.
    ///
    /// `f` is only called when no request is currently in flight.
    pub fn handle<F>(&self, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // We must take the lock at this point to prevent another thread
        // from starting this request simultaneously.
        let mut inner = self.inner.lock();
        if let Some(rx) = inner.get_reciever() {
            tracing::trace!("Found inflight request");
            return Handle::new(rx);
        }

        let (tx, rx) = broadcast::channel::<T>(1);

        let tx = Arc::new(tx);
        inner.inflight = Some(Arc::downgrade(&tx));

        let fut = (f)();

        let shared = Arc::clone(&self.inner);
        tracing::trace!("Launching new request");
        tokio::spawn(async move {
            let res = fut.await;

            // Hold the lock while sending, so that nobody can subscribe
            // after the send and then wait forever.
            let mut inner = shared.lock();
            inner.inflight = None;
            let _ = tx.send(res);
        });

        Handle::new(rx)
    }
}

/// A value produced by a fetch, along with how long it stays fresh.
#[derive(Debug, Clone)]
pub struct Fresh<V> {
    value: V,
    expires: Option<Instant>,
}

impl<V> Fresh<V> {
    /// A value which never expires.
    pub fn forever(value: V) -> Self {
        Self {
            value,
            expires: None,
        }
    }

    /// A value which expires at a fixed instant.
    pub fn until(value: V, expires: Instant) -> Self {
        Self {
            value,
            expires: Some(expires),
        }
    }
}

fn is_fresh(expires: Option<Instant>) -> bool {
    expires.map(|e| e > Instant::now()).unwrap_or(true)
}

enum Slot<V, E> {
    Inflight(Request<Result<V, E>>),
    Ready { value: V, expires: Option<Instant> },
}

type Slots<K, V, E> = Arc<Mutex<HashMap<K, Slot<V, E>>>>;

/// A keyed cache which coalesces concurrent fetches of the same key.
///
/// For each key there is at most one fetch running at a time. Successful
/// results are stored until they expire or are invalidated. Failed
/// results are handed to every waiter and then forgotten, so the next
/// call starts a fresh fetch.
pub struct CacheMap<K, V, E> {
    slots: Slots<K, V, E>,
}

impl<K, V, E> fmt::Debug for CacheMap<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMap")
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

impl<K, V, E> Clone for CacheMap<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, V, E> Default for CacheMap<K, V, E> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

impl<K, V, E> CacheMap<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<RecvError> + 'static,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached value for `key`, or fetch it with `f`.
    ///
    /// If a fetch for `key` is already running, this waits for its
    /// outcome instead of calling `f`.
    pub async fn get_or_fetch<F>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce() -> BoxFut<'static, Result<Fresh<V>, E>> + Send + 'static,
    {
        let handle = {
            let mut slots = self.slots.lock();
            let running = match slots.get(&key) {
                Some(Slot::Ready { value, expires }) if is_fresh(*expires) => {
                    tracing::trace!("Found cached value");
                    return Ok(value.clone());
                }
                Some(Slot::Inflight(request)) => Some(request.clone()),
                _ => None,
            };

            match running {
                // A request whose task died without publishing is restarted here.
                Some(request) => request.handle(self.producer(key, f)),
                None => {
                    let request = Request::default();
                    let handle = request.handle(self.producer(key.clone(), f));
                    slots.insert(key, Slot::Inflight(request));
                    handle
                }
            }
        };

        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(E::from(err)),
        }
    }

    /// Wrap `f` so that its outcome is recorded in the slot map before it is
    /// published to waiters.
    fn producer<F>(&self, key: K, f: F) -> impl FnOnce() -> BoxFut<'static, Result<V, E>>
    where
        F: FnOnce() -> BoxFut<'static, Result<Fresh<V>, E>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        move || -> BoxFut<'static, Result<V, E>> {
            let fut = f();
            Box::pin(async move {
                let outcome = fut.await;
                let mut slots = slots.lock();
                match outcome {
                    Ok(Fresh { value, expires }) => {
                        slots.insert(
                            key,
                            Slot::Ready {
                                value: value.clone(),
                                expires,
                            },
                        );
                        Ok(value)
                    }
                    Err(err) => {
                        if matches!(slots.get(&key), Some(Slot::Inflight(_))) {
                            slots.remove(&key);
                        }
                        Err(err)
                    }
                }
            })
        }
    }

    /// Get the cached value for `key` without fetching.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready { value, expires }) if is_fresh(*expires) => Some(value.clone()),
            _ => None,
        }
    }

    /// Store a value directly, replacing any cached value for `key`.
    ///
    /// An in-flight fetch for `key` is left alone, and will overwrite this
    /// value when it completes.
    pub fn insert(&self, key: K, fresh: Fresh<V>) {
        let mut slots = self.slots.lock();
        if !matches!(slots.get(&key), Some(Slot::Inflight(_))) {
            slots.insert(
                key,
                Slot::Ready {
                    value: fresh.value,
                    expires: fresh.expires,
                },
            );
        }
    }

    /// Drop the cached value for `key`. Returns true if a value was removed.
    ///
    /// In-flight fetches are not affected.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::Ready { .. })) {
            slots.remove(key);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestError {
        Failed(&'static str),
        Abandoned,
    }

    impl From<RecvError> for TestError {
        fn from(_: RecvError) -> Self {
            TestError::Abandoned
        }
    }

    type Map = CacheMap<&'static str, usize, TestError>;

    fn counting(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> impl FnOnce() -> BoxFut<'static, Result<Fresh<usize>, TestError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || -> BoxFut<'static, Result<Fresh<usize>, TestError>> {
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(Fresh::forever(n))
            })
        }
    }

    #[tokio::test]
    async fn request_coalesces_concurrent_callers() {
        let request: Request<usize> = Request::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let calls = Arc::clone(&calls);
                request.handle(move || {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        calls.fetch_add(1, Ordering::SeqCst)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(request.inner.lock().get_reciever().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let map = map.clone();
                let fetch = counting(&calls, Duration::from_millis(25));
                tokio::spawn(async move { map.get_or_fetch("key", fetch).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&"key"), Some(1));
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = map.get_or_fetch("a", counting(&calls, Duration::ZERO));
        let b = map.get_or_fetch("b", counting(&calls, Duration::ZERO));
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok() && b.is_ok());
        assert_ne!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter_and_are_not_cached() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = |calls: &Arc<AtomicUsize>| {
            let calls = Arc::clone(calls);
            move || -> BoxFut<'static, Result<Fresh<usize>, TestError>> {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err(TestError::Failed("upstream"))
                })
            }
        };

        let first = map.get_or_fetch("key", failing(&calls));
        let second = map.get_or_fetch("key", failing(&calls));
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Err(TestError::Failed("upstream")));
        assert_eq!(second, Err(TestError::Failed("upstream")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(map.slots.lock().is_empty());

        let value = map
            .get_or_fetch("key", counting(&calls, Duration::ZERO))
            .await;
        assert_eq!(value, Ok(2));
    }

    #[tokio::test]
    async fn expired_values_are_refetched() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let short = {
            let calls = Arc::clone(&calls);
            move || -> BoxFut<'static, Result<Fresh<usize>, TestError>> {
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Fresh::until(n, Instant::now() + Duration::from_millis(10)))
                })
            }
        };

        assert_eq!(map.get_or_fetch("key", short).await, Ok(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(map.get(&"key"), None);
        assert_eq!(
            map.get_or_fetch("key", counting(&calls, Duration::ZERO))
                .await,
            Ok(2)
        );
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        map.get_or_fetch("key", counting(&calls, Duration::ZERO))
            .await
            .unwrap();
        assert!(map.invalidate(&"key"));
        assert!(!map.invalidate(&"key"));

        let value = map
            .get_or_fetch("key", counting(&calls, Duration::ZERO))
            .await;
        assert_eq!(value, Ok(2));
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_cancel_fetch() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let map = map.clone();
            let fetch = counting(&calls, Duration::from_millis(20));
            let waiter = tokio::spawn(async move { map.get_or_fetch("key", fetch).await });
            tokio::time::sleep(Duration::from_millis(5)).await;
            waiter.abort();
        }

        let value = map
            .get_or_fetch("key", counting(&calls, Duration::ZERO))
            .await;
        assert_eq!(value, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_fetch_is_reported_as_abandoned() {
        let map = Map::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let result = map
            .get_or_fetch("key", || -> BoxFut<'static, Result<Fresh<usize>, TestError>> {
                Box::pin(async {
                    let explode = true;
                    if explode {
                        panic!("fetch exploded");
                    }
                    Ok(Fresh::forever(0))
                })
            })
            .await;
        assert_eq!(result, Err(TestError::Abandoned));

        let value = map
            .get_or_fetch("key", counting(&calls, Duration::ZERO))
            .await;
        assert_eq!(value, Ok(1));
    }
}
