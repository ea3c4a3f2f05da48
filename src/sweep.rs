use crate::session::SessionStoreCleanup;
use actix_web::rt;
use std::{sync::Arc, time::Duration};

/// Periodic removal of expired session records.
///
/// Expiry enforcement at request time keeps stale sessions out of
/// responses; this host keeps them out of storage. Each run deletes in
/// bounded batches until a batch comes back short, so one sweep never
/// holds the store for an unbounded amount of work.
pub struct SessionCleanupHost {
    store: Arc<dyn SessionStoreCleanup>,
    interval: Duration,
    batch_size: usize,
}

impl SessionCleanupHost {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    pub fn new(store: Arc<dyn SessionStoreCleanup>, interval: Duration, batch_size: usize) -> Self {
        Self {
            store,
            interval,
            batch_size,
        }
    }

    pub fn with_defaults(store: Arc<dyn SessionStoreCleanup>) -> Self {
        Self::new(store, Self::DEFAULT_INTERVAL, Self::DEFAULT_BATCH_SIZE)
    }

    /// Spawn the sweep loop on the current runtime. The loop stops when
    /// the returned handle is dropped, binding the sweep to the lifetime
    /// of the host application.
    pub fn start(self) -> SessionCleanupHandle {
        let handle = rt::spawn(async move {
            let mut ticker = rt::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        });
        SessionCleanupHandle { handle }
    }

    async fn sweep_once(&self) {
        loop {
            match self.store.delete_expired_sessions(self.batch_size).await {
                Ok(deleted) => {
                    if deleted > 0 {
                        log::debug!("sweep removed {} expired sessions.", deleted);
                    }
                    if deleted < self.batch_size {
                        break;
                    }
                }
                Err(err) => {
                    log::warn!("expired session sweep failed: {}.", err);
                    break;
                }
            }
        }
    }
}

pub struct SessionCleanupHandle {
    handle: rt::task::JoinHandle<()>,
}

impl Drop for SessionCleanupHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
