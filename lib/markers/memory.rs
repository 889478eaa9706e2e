use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use super::{MarkerError, MarkerStore};

/// Process-local marker store.
///
/// Not durable. Used by tests and by callers that want a throwaway queue.
/// `fail_writes` makes every subsequent `put` fail, which is how the fatal
/// watermark path is exercised.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    values: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Synchronous peek used by assertions.
    pub fn snapshot(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.values
            .lock()
            .ok()?
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, MarkerError>> {
        Box::pin(async move {
            let values = self
                .values
                .lock()
                .map_err(|_| MarkerError::Unavailable("memory marker lock poisoned".to_string()))?;
            Ok(values.get(&(namespace.to_string(), key.to_string())).cloned())
        })
    }

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), MarkerError>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(MarkerError::Unavailable(format!(
                    "write to {namespace}/{key} rejected"
                )));
            }
            let mut values = self
                .values
                .lock()
                .map_err(|_| MarkerError::Unavailable("memory marker lock poisoned".to_string()))?;
            values.insert((namespace.to_string(), key.to_string()), value.to_vec());
            Ok(())
        })
    }
}
