//! In-flight CSI operation deduplication.
//!
//! CSI sidecars retry aggressively, so the same `CreateVolume` may arrive
//! again while the first call is still running. Calls are keyed by
//! `(method, primary key)`; a caller that finds its key in flight awaits
//! the running operation and receives a clone of its outcome.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Running<T> = Shared<BoxFuture<'static, Result<T, String>>>;
type Inflight<T> = HashMap<String, Running<T>>;

fn lock<T>(inflight: &Mutex<Inflight<T>>) -> MutexGuard<'_, Inflight<T>> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide map of running operations producing `T`
pub struct OpCache<T: Clone> {
    inflight: Arc<Mutex<Inflight<T>>>,
}

impl<T: Clone> Default for OpCache<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone> std::fmt::Debug for OpCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCache").field("inflight", &self.len()).finish()
    }
}

/// Removes the key once the operation task ends, even by panicking.
struct Release<T: Clone> {
    inflight: Arc<Mutex<Inflight<T>>>,
    key: String,
}

impl<T: Clone> Drop for Release<T> {
    fn drop(&mut self) {
        lock(&self.inflight).remove(&self.key);
    }
}

impl<T: Clone> OpCache<T> {
    /// Number of operations in flight
    pub fn len(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// True when nothing is in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> OpCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` for `method`/`key` unless the same operation is already running.
    ///
    /// The operation runs on its own task, so it finishes and keeps its key
    /// even when every caller waiting on it is cancelled. Later callers drop
    /// their `op` and share the running one's outcome.
    pub async fn run<F>(&self, method: &str, key: &str, op: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cache_key = format!("{method}:{key}");
        let running = {
            let mut inflight = lock(&self.inflight);
            if let Some(running) = inflight.get(&cache_key) {
                running.clone()
            } else {
                let release = Release {
                    inflight: Arc::clone(&self.inflight),
                    key: cache_key.clone(),
                };
                let task = tokio::spawn(async move {
                    let _release = release;
                    op.await
                });
                let running = task.map(|joined| joined.map_err(|e| e.to_string())).boxed().shared();
                inflight.insert(cache_key.clone(), running.clone());
                running
            }
        };

        match running.await {
            Ok(outcome) => outcome,
            // The task only fails by panicking or by runtime shutdown
            Err(e) => panic!("{cache_key} did not complete: {e}"),
        }
    }
}
