//! Durable key-value markers.
//!
//! Consumer offsets and compaction watermarks are tiny values that must survive
//! restarts. They are addressed by `(namespace, key)`; an absent key means the
//! marker was never written.

mod file;
mod memory;
mod pg;

pub use file::FileMarkerStore;
pub use memory::MemoryMarkerStore;
pub use pg::PgMarkerStore;

use diesel_async::pooled_connection::deadpool::PoolError;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("marker io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("marker task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("marker store unavailable: {0}")]
    Unavailable(String),
}

/// Durable `get`/`put` over namespaced keys.
///
/// A successful `put` must be durable before it resolves: callers advance
/// watermarks and offsets on the strength of it.
pub trait MarkerStore: Send + Sync {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, MarkerError>>;

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), MarkerError>>;
}

impl<T> MarkerStore for Arc<T>
where
    T: MarkerStore + ?Sized,
{
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, MarkerError>> {
        (**self).get(namespace, key)
    }

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), MarkerError>> {
        (**self).put(namespace, key, value)
    }
}

pub type SharedMarkerStore = Arc<dyn MarkerStore>;
