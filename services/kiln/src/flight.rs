//! Request coalescing: one in-flight future per key, shared by every caller
//! that asks while it is running.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

pub(crate) type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

/// Resolves to the result of the in-flight future this handle subscribed to.
pub(crate) struct Handle<T> {
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
    T: Clone + Send + 'static,
{
    fn new(mut receiver: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { receiver.recv().await }),
        }
    }
}

/// A table of in-flight futures keyed by `K`.
///
/// The first caller for a key spawns the work onto the runtime, so a caller
/// that disconnects does not cancel the result for the others.
pub(crate) struct Flights<K, T> {
    inflight: Arc<Mutex<HashMap<K, Weak<broadcast::Sender<T>>>>>,
}

impl<K, T> fmt::Debug for Flights<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flights")
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

impl<K, T> Default for Flights<K, T> {
    fn default() -> Self {
        Self {
            inflight: Default::default(),
        }
    }
}

impl<K, T> Flights<K, T>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + 'static,
    T: Clone + Send + 'static,
{
    /// Join the flight for `key`, starting it with `f` if none is running.
    pub(crate) fn handle<F>(&self, key: K, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // Hold the lock from lookup to registration so two callers can't both launch.
        let mut inflight = self.inflight.lock();
        if let Some(tx) = inflight.get(&key).and_then(Weak::upgrade) {
            tracing::trace!(?key, "joining in-flight request");
            return Handle::new(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel::<T>(1);
        let tx = Arc::new(tx);
        inflight.insert(key.clone(), Arc::downgrade(&tx));

        let fut = (f)();
        let table = Arc::clone(&self.inflight);
        tracing::trace!(?key, "launching request");
        tokio::spawn(async move {
            let res = fut.await;
            // Send under the lock, so nobody subscribes between removal and send.
            let mut inflight = table.lock();
            inflight.remove(&key);
            let _ = tx.send(res);
        });

        Handle::new(rx)
    }

    /// Number of keys with work in flight.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[derive(Debug)]
enum Slot<T> {
    Empty,
    Cached { value: T, expires: Option<Instant> },
}

/// A single value fetched asynchronously and kept until it expires.
///
/// Concurrent refreshes are coalesced.
pub(crate) struct Cached<T> {
    slot: Arc<Mutex<Slot<T>>>,
    refresh: Flights<(), T>,
}

impl<T> fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = matches!(*self.slot.lock(), Slot::Cached { .. });
        f.debug_struct("Cached").field("cached", &cached).finish()
    }
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Empty)),
            refresh: Flights::default(),
        }
    }
}

impl<T> Cached<T>
where
    T: Clone + Send + 'static,
{
    /// Return the cached value, or run `f` to produce one.
    ///
    /// `f` returns the value and how long it may be kept; `None` keeps it
    /// until [`Cached::clear`]. Values for which `keep` returns false are
    /// handed to the callers but never stored.
    pub(crate) async fn get<F>(&self, keep: fn(&T) -> bool, f: F) -> Result<T, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, (T, Option<Duration>)>,
    {
        {
            let slot = self.slot.lock();
            if let Slot::Cached { value, expires } = &*slot {
                if expires.is_none_or(|e| e > Instant::now()) {
                    return Ok(value.clone());
                }
            }
        }

        let slot = Arc::clone(&self.slot);
        self.refresh
            .handle((), move || {
                let fut = f();
                Box::pin(async move {
                    let (value, lifetime) = fut.await;
                    if keep(&value) {
                        *slot.lock() = Slot::Cached {
                            value: value.clone(),
                            expires: lifetime.map(|lifetime| Instant::now() + lifetime),
                        };
                    }
                    value
                })
            })
            .await
    }

    /// Forget the cached value.
    pub(crate) fn clear(&self) {
        *self.slot.lock() = Slot::Empty;
    }
}
