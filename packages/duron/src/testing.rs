//! Test fixtures shared by the engine's own tests and, behind the
//! `testing` feature, by downstream crates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use crate::memory::MemoryStore;
use crate::store::Store;

/// A fresh in-memory store, ready to hand to [`crate::Client::builder`].
pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// The same store upcast to the trait object the client expects.
pub fn memory_store_dyn() -> (Arc<MemoryStore>, Arc<dyn Store>) {
    let store = memory_store();
    let dynamic: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    (store, dynamic)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
