use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{Deferred, Promise};

#[derive(Debug)]
struct JoinState<T> {
    /// Inputs that haven't produced a value yet.
    remaining: AtomicUsize,
    /// Values indexed by input position.
    slots: Mutex<Vec<Option<T>>>,
    promise: Promise<Vec<T>>,
}

/// Combine several deferred values into one that resolves to all of their
/// values, in input order.
///
/// Inputs may resolve in any order. The output resolves from the thread that
/// resolves the last input. If any input fails, the output fails with the
/// first error observed and values from the other inputs are discarded.
pub fn join_all<T>(inputs: &[Deferred<T>]) -> Deferred<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    if inputs.is_empty() {
        return Deferred::ready(Vec::new());
    }

    let (promise, joined) = Deferred::pending();
    let state = Arc::new(JoinState {
        remaining: AtomicUsize::new(inputs.len()),
        slots: Mutex::new(vec![None; inputs.len()]),
        promise,
    });

    for (idx, input) in inputs.iter().enumerate() {
        let state = state.clone();
        input.on_ready(move |result| match result {
            Ok(value) => {
                state.slots.lock()[idx] = Some(value.clone());
                if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = std::mem::take(&mut *state.slots.lock())
                        .into_iter()
                        .flatten()
                        .collect();
                    state.promise.try_set(Ok(values));
                }
            }
            Err(e) => {
                // Loses silently if another input already failed.
                state.promise.try_set(Err(e.clone()));
            }
        });
    }

    joined
}
