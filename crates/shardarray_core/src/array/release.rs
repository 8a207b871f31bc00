use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Callback invoked once the buffers backing an array are no longer needed.
pub type OnDoneWithBuffer = Box<dyn FnOnce() + Send + 'static>;

/// Build a release callback that keeps `storage` alive until the callback
/// runs, then drops it.
pub fn keep_alive<S>(storage: S) -> OnDoneWithBuffer
where
    S: Send + 'static,
{
    Box::new(move || std::mem::drop(storage))
}

/// Runs an `OnDoneWithBuffer` at most once, no matter how many threads race
/// to release.
pub struct ReleaseGuard {
    released: AtomicBool,
    callback: Mutex<Option<OnDoneWithBuffer>>,
}

impl ReleaseGuard {
    pub fn new(callback: Option<OnDoneWithBuffer>) -> Self {
        ReleaseGuard {
            released: AtomicBool::new(false),
            callback: Mutex::new(callback),
        }
    }

    /// Run the callback if nothing has released yet.
    ///
    /// Returns true for the single caller that won the release, even when
    /// there is no callback to run.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Lock only guards the handoff, the callback runs unlocked.
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }

        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseGuard")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;

    fn counting_callback(count: &Arc<AtomicUsize>) -> OnDoneWithBuffer {
        let count = count.clone();
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn release_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let guard = ReleaseGuard::new(Some(counting_callback(&count)));

        assert!(!guard.is_released());
        assert!(guard.release());
        assert!(!guard.release());
        assert!(guard.is_released());
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn release_without_callback() {
        let guard = ReleaseGuard::new(None);
        assert!(guard.release());
        assert!(!guard.release());
    }

    #[test]
    fn concurrent_release() {
        for _ in 0..64 {
            let count = Arc::new(AtomicUsize::new(0));
            let guard = Arc::new(ReleaseGuard::new(Some(counting_callback(&count))));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let guard = guard.clone();
                    thread::spawn(move || guard.release())
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();

            assert_eq!(1, winners);
            assert_eq!(1, count.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn keep_alive_drops_storage_on_release() {
        let storage = Arc::new(vec!["abc".to_string()]);
        let guard = ReleaseGuard::new(Some(keep_alive(storage.clone())));
        assert_eq!(2, Arc::strong_count(&storage));

        guard.release();
        assert_eq!(1, Arc::strong_count(&storage));
    }
}
