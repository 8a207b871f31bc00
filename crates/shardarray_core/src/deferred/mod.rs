//! Single-assignment values handed from one producer to any number of
//! readers.
//!
//! A `Deferred` is either created already resolved, or as the read half of a
//! pending pair with a `Promise` as the write half. The result is stored once
//! and replayed to every reader, including readers that show up after
//! resolution.

mod join;

pub use join::join_all;

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex};
use shardarray_error::{ArrayError, Result};
use tracing::warn;

type Continuation<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Blocking readers park here.
    cond: Condvar,
    /// Number of live promises that can still resolve this value.
    promises: AtomicUsize,
}

struct State<T> {
    result: Option<Arc<Result<T>>>,
    /// Async readers waiting on resolution, one slot per pending future.
    wakers: Vec<(usize, Waker)>,
    next_waker_key: usize,
    /// Callbacks to run on resolution.
    continuations: Vec<Continuation<T>>,
}

impl<T> Shared<T> {
    fn pending() -> Self {
        Shared {
            state: Mutex::new(State {
                result: None,
                wakers: Vec::new(),
                next_waker_key: 0,
                continuations: Vec::new(),
            }),
            cond: Condvar::new(),
            promises: AtomicUsize::new(1),
        }
    }

    fn resolved(result: Result<T>) -> Self {
        Shared {
            state: Mutex::new(State {
                result: Some(Arc::new(result)),
                wakers: Vec::new(),
                next_waker_key: 0,
                continuations: Vec::new(),
            }),
            cond: Condvar::new(),
            promises: AtomicUsize::new(0),
        }
    }

    /// Store the result and notify everyone waiting on it.
    ///
    /// Returns false without touching the stored value if the value was
    /// already resolved.
    fn resolve(&self, result: Result<T>) -> bool {
        let result = Arc::new(result);

        let mut state = self.state.lock();
        if state.result.is_some() {
            return false;
        }
        state.result = Some(result.clone());
        let wakers = std::mem::take(&mut state.wakers);
        let continuations = std::mem::take(&mut state.continuations);
        std::mem::drop(state);

        self.cond.notify_all();
        for (_, waker) in wakers {
            waker.wake();
        }
        // Continuations may register more continuations on this value, so
        // they run with the lock released.
        for continuation in continuations {
            continuation(&result);
        }

        true
    }

    fn is_resolved(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

fn invalid_error() -> ArrayError {
    ArrayError::failed_precondition("Deferred value is invalid")
}

/// The read half of a single-assignment value.
pub struct Deferred<T> {
    /// None if this deferred value is invalid (no producer and no value).
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Deferred<T> {
    /// Create a pending value along with the promise used to resolve it.
    pub fn pending() -> (Promise<T>, Deferred<T>) {
        let shared = Arc::new(Shared::pending());
        let promise = Promise {
            shared: shared.clone(),
        };
        (
            promise,
            Deferred {
                shared: Some(shared),
            },
        )
    }

    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn failed(error: ArrayError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: Result<T>) -> Self {
        Deferred {
            shared: Some(Arc::new(Shared::resolved(result))),
        }
    }

    /// A deferred value with neither a producer nor a value.
    ///
    /// Anything consuming a deferred value should reject this up front.
    pub const fn invalid() -> Self {
        Deferred { shared: None }
    }

    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Non-blocking check for resolution. Invalid values are never ready.
    pub fn is_ready(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.is_resolved(),
            None => false,
        }
    }

    /// Register a callback to run once this value resolves.
    ///
    /// Runs immediately on the calling thread if the value is already
    /// resolved, otherwise on the thread that resolves it. Invalid values
    /// invoke the callback immediately with an error.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => {
                f(&Err(invalid_error()));
                return;
            }
        };

        let mut state = shared.state.lock();
        match state.result.clone() {
            Some(result) => {
                std::mem::drop(state);
                f(&result);
            }
            None => state.continuations.push(Box::new(f)),
        }
    }

    /// Number of callbacks waiting on resolution.
    #[cfg(test)]
    pub(crate) fn pending_continuations(&self) -> usize {
        match &self.shared {
            Some(shared) => shared.state.lock().continuations.len(),
            None => 0,
        }
    }
}

impl<T> Deferred<T>
where
    T: Clone,
{
    /// Get the result if resolved, without blocking.
    pub fn try_get(&self) -> Option<Result<T>> {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return Some(Err(invalid_error())),
        };
        let state = shared.state.lock();
        state.result.as_ref().map(|r| r.as_ref().clone())
    }

    /// Block the current thread until the value resolves.
    pub fn wait(&self) -> Result<T> {
        let shared = match &self.shared {
            Some(shared) => shared,
            None => return Err(invalid_error()),
        };

        let mut state = shared.state.lock();
        loop {
            if let Some(result) = &state.result {
                return result.as_ref().clone();
            }
            shared.cond.wait(&mut state);
        }
    }
}

impl<T> Deferred<T>
where
    T: Send + Sync + 'static,
{
    /// Derive a new deferred value by applying `f` once this one resolves.
    ///
    /// Errors pass through untouched. Mapping an invalid value produces an
    /// invalid value.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U> + Send + 'static,
    {
        if !self.is_valid() {
            return Deferred::invalid();
        }

        let (promise, mapped) = Deferred::pending();
        self.on_ready(move |result| {
            let result = match result {
                Ok(value) => f(value),
                Err(e) => Err(e.clone()),
            };
            promise.set(result);
        });

        mapped
    }

    /// A signal that resolves when this value resolves, without the payload.
    pub fn ready_signal(&self) -> Deferred<()> {
        self.map(|_| Ok(()))
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.shared {
            None => "invalid",
            Some(shared) => match shared.state.lock().result.as_deref() {
                None => "pending",
                Some(Ok(_)) => "ready",
                Some(Err(_)) => "error",
            },
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T> IntoFuture for Deferred<T>
where
    T: Clone,
{
    type Output = Result<T>;
    type IntoFuture = DeferredFut<T>;

    fn into_future(self) -> Self::IntoFuture {
        DeferredFut {
            shared: self.shared,
            waker_key: None,
        }
    }
}

/// Future resolving to the value of a `Deferred`.
///
/// Dropping this future has no effect on other readers or on resolution.
pub struct DeferredFut<T> {
    shared: Option<Arc<Shared<T>>>,
    /// Key of this future's waker slot, assigned on the first pending poll.
    waker_key: Option<usize>,
}

impl<T> Future for DeferredFut<T>
where
    T: Clone,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let shared = match &this.shared {
            Some(shared) => shared,
            None => return Poll::Ready(Err(invalid_error())),
        };

        let mut guard = shared.state.lock();
        let state = &mut *guard;
        if let Some(result) = &state.result {
            return Poll::Ready(result.as_ref().clone());
        }

        // Only the waker from the most recent poll is kept.
        let key = *this.waker_key.get_or_insert_with(|| {
            let key = state.next_waker_key;
            state.next_waker_key += 1;
            key
        });
        match state.wakers.iter_mut().find(|(k, _)| *k == key) {
            Some((_, waker)) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => state.wakers.push((key, cx.waker().clone())),
        }

        Poll::Pending
    }
}

impl<T> Drop for DeferredFut<T> {
    fn drop(&mut self) {
        if let (Some(shared), Some(key)) = (&self.shared, self.waker_key) {
            shared.state.lock().wakers.retain(|(k, _)| *k != key);
        }
    }
}

impl<T> fmt::Debug for DeferredFut<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredFut").finish_non_exhaustive()
    }
}

/// The write half of a pending `Deferred`.
///
/// Promises may be cloned and handed to multiple producers, but the value may
/// only be set once across all of them. If every promise is dropped without
/// setting a value, readers receive an error instead of waiting forever.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    /// Resolve the deferred value.
    ///
    /// # Panics
    ///
    /// Panics if a value was already set. Readers may have observed the first
    /// value, so overwriting it is a bug in the producer.
    pub fn set(&self, result: Result<T>) {
        if !self.shared.resolve(result) {
            panic!("Deferred value set more than once");
        }
    }

    pub fn set_value(&self, value: T) {
        self.set(Ok(value))
    }

    pub fn set_error(&self, error: ArrayError) {
        self.set(Err(error))
    }

    /// Set the value only if nothing else has. Returns if this call won.
    pub(crate) fn try_set(&self, result: Result<T>) -> bool {
        self.shared.resolve(result)
    }

    pub fn is_set(&self) -> bool {
        self.shared.is_resolved()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.shared.promises.fetch_add(1, Ordering::Relaxed);
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.promises.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let abandoned = self.shared.resolve(Err(ArrayError::internal(
            "Promise dropped before a value was set",
        )));
        if abandoned {
            warn!("promise dropped without a value, readers will receive an error");
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::task::Wake;
    use std::thread;

    use futures::FutureExt;
    use shardarray_error::ErrorKind;

    use super::*;

    #[derive(Default)]
    struct TestWaker {
        wake_count: AtomicUsize,
    }

    impl TestWaker {
        fn load_count(&self) -> usize {
            self.wake_count.load(Ordering::SeqCst)
        }
    }

    impl Wake for TestWaker {
        fn wake(self: Arc<Self>) {
            self.wake_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ready_value_replays() {
        let deferred = Deferred::ready(vec![1, 2, 3]);
        assert!(deferred.is_valid());
        assert!(deferred.is_ready());

        assert_eq!(vec![1, 2, 3], deferred.wait().unwrap());
        assert_eq!(vec![1, 2, 3], deferred.wait().unwrap());
        assert_eq!(vec![1, 2, 3], deferred.clone().wait().unwrap());
    }

    #[test]
    fn set_from_other_thread() {
        let (promise, deferred) = Deferred::<String>::pending();
        assert!(!deferred.is_ready());
        assert!(deferred.try_get().is_none());

        let handle = thread::spawn(move || promise.set_value("hello".to_string()));

        assert_eq!("hello", deferred.wait().unwrap());
        handle.join().unwrap();
        assert!(deferred.is_ready());
    }

    #[test]
    fn error_replayed_to_every_reader() {
        let (promise, deferred) = Deferred::<i32>::pending();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let deferred = deferred.clone();
                thread::spawn(move || deferred.wait())
            })
            .collect();

        promise.set_error(ArrayError::internal("boom"));

        for reader in readers {
            let err = reader.join().unwrap().unwrap_err();
            assert_eq!(ErrorKind::Internal, err.kind());
            assert_eq!("boom", err.message());
        }

        // Late reader.
        let err = deferred.wait().unwrap_err();
        assert_eq!("boom", err.message());
    }

    #[test]
    #[should_panic(expected = "set more than once")]
    fn double_set_panics() {
        let (promise, _deferred) = Deferred::<i32>::pending();
        promise.set_value(1);
        promise.set_value(2);
    }

    #[test]
    fn invalid_value() {
        let deferred = Deferred::<i32>::invalid();
        assert!(!deferred.is_valid());
        assert!(!deferred.is_ready());

        let err = deferred.wait().unwrap_err();
        assert_eq!(ErrorKind::FailedPrecondition, err.kind());

        let mapped = deferred.map(|v| Ok(v + 1));
        assert!(!mapped.is_valid());

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        deferred.on_ready(move |result| {
            assert!(result.is_err());
            called2.store(true, Ordering::SeqCst);
        });
        assert!(called.load(Ordering::SeqCst));

        assert!(!Deferred::<i32>::default().is_valid());
    }

    #[test]
    fn abandoned_promise_resolves_with_error() {
        let (promise, deferred) = Deferred::<i32>::pending();
        let cloned = promise.clone();

        std::mem::drop(promise);
        assert!(!deferred.is_ready());

        std::mem::drop(cloned);
        let err = deferred.wait().unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());
    }

    #[test]
    fn set_promise_drop_keeps_value() {
        let (promise, deferred) = Deferred::pending();
        promise.set_value(7);
        std::mem::drop(promise);
        assert_eq!(7, deferred.wait().unwrap());
    }

    #[test]
    fn poll_before_set() {
        let t0 = Arc::new(TestWaker::default());
        let w0 = Waker::from(t0.clone());
        let mut c0 = Context::from_waker(&w0);

        let (promise, deferred) = Deferred::<i32>::pending();
        let mut fut = deferred.clone().into_future();

        assert_eq!(Poll::Pending, fut.poll_unpin(&mut c0).map(|r| r.unwrap()));
        // Polling again with the same waker shouldn't register it twice.
        assert_eq!(Poll::Pending, fut.poll_unpin(&mut c0).map(|r| r.unwrap()));

        promise.set_value(4);
        assert_eq!(1, t0.load_count());

        assert_eq!(Poll::Ready(4), fut.poll_unpin(&mut c0).map(|r| r.unwrap()));
    }

    #[test]
    fn dropped_future_does_not_affect_others() {
        let t0 = Arc::new(TestWaker::default());
        let t1 = Arc::new(TestWaker::default());
        let w0 = Waker::from(t0.clone());
        let w1 = Waker::from(t1.clone());
        let mut c0 = Context::from_waker(&w0);
        let mut c1 = Context::from_waker(&w1);

        let (promise, deferred) = Deferred::<i32>::pending();

        let mut fut0 = deferred.clone().into_future();
        let mut fut1 = deferred.clone().into_future();
        assert!(fut0.poll_unpin(&mut c0).is_pending());
        assert!(fut1.poll_unpin(&mut c1).is_pending());

        // Caller gave up.
        std::mem::drop(fut0);

        promise.set_value(9);
        assert_eq!(1, t1.load_count());
        assert_eq!(Poll::Ready(9), fut1.poll_unpin(&mut c1).map(|r| r.unwrap()));
        assert_eq!(9, deferred.wait().unwrap());
    }

    fn waker_slots<T>(deferred: &Deferred<T>) -> usize {
        deferred.shared.as_ref().unwrap().state.lock().wakers.len()
    }

    #[test]
    fn repoll_with_new_waker_replaces_old() {
        let (promise, deferred) = Deferred::<i32>::pending();
        let mut fut = deferred.clone().into_future();

        let stale: Vec<_> = (0..16).map(|_| Arc::new(TestWaker::default())).collect();
        for t in &stale {
            let w = Waker::from(t.clone());
            assert!(fut.poll_unpin(&mut Context::from_waker(&w)).is_pending());
        }
        assert_eq!(1, waker_slots(&deferred));

        let latest = Arc::new(TestWaker::default());
        let w = Waker::from(latest.clone());
        let mut cx = Context::from_waker(&w);
        assert!(fut.poll_unpin(&mut cx).is_pending());
        assert_eq!(1, waker_slots(&deferred));

        promise.set_value(2);
        assert_eq!(1, latest.load_count());
        for t in &stale {
            assert_eq!(0, t.load_count());
        }
        assert_eq!(Poll::Ready(2), fut.poll_unpin(&mut cx).map(|r| r.unwrap()));
    }

    #[test]
    fn dropped_future_releases_waker() {
        let (_promise, deferred) = Deferred::<i32>::pending();

        for _ in 0..8 {
            let t = Arc::new(TestWaker::default());
            let w = Waker::from(t.clone());
            let mut fut = deferred.clone().into_future();
            assert!(fut.poll_unpin(&mut Context::from_waker(&w)).is_pending());
            assert_eq!(1, waker_slots(&deferred));
        }
        assert_eq!(0, waker_slots(&deferred));
    }

    #[test]
    fn await_resolved_value() {
        let deferred = Deferred::ready("abc".to_string());
        let got = futures::executor::block_on(deferred.clone().into_future()).unwrap();
        assert_eq!("abc", got);
    }

    #[test]
    fn on_ready_ordering() {
        let (promise, deferred) = Deferred::<i32>::pending();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        deferred.on_ready(move |r| s.lock().push(*r.as_ref().unwrap()));
        assert!(seen.lock().is_empty());

        promise.set_value(3);
        assert_eq!(vec![3], *seen.lock());

        // Already resolved, runs inline.
        let s = seen.clone();
        deferred.on_ready(move |r| s.lock().push(r.as_ref().unwrap() * 2));
        assert_eq!(vec![3, 6], *seen.lock());
    }

    #[test]
    fn ready_signal_follows_source() {
        let (promise, deferred) = Deferred::<Vec<String>>::pending();
        let signal = deferred.ready_signal();
        assert!(!signal.is_ready());

        promise.set_value(vec!["a".to_string()]);
        signal.wait().unwrap();

        let (promise, deferred) = Deferred::<Vec<String>>::pending();
        let signal = deferred.ready_signal();
        promise.set_error(ArrayError::internal("injected error"));
        let err = signal.wait().unwrap_err();
        assert_eq!(ErrorKind::Internal, err.kind());
    }

    #[test]
    fn map_error_from_closure() {
        let deferred = Deferred::ready(4);
        let mapped = deferred.map(|v| {
            if *v > 3 {
                Err(ArrayError::invalid_argument("too big"))
            } else {
                Ok(*v)
            }
        });
        assert_eq!(
            ErrorKind::InvalidArgument,
            mapped.wait().unwrap_err().kind()
        );
    }
}
