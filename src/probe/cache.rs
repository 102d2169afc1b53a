//! Connection cache
//!
//! Owns the long-lived broker connections, one per endpoint. Connections are
//! created lazily on the first probe against an endpoint and reused by every
//! later probe until a probe reports a connection-level failure.
//!
//! ## Borrowing
//!
//! `acquire` hands out an `Arc` to the cached connection. Evicting an endpoint
//! removes the entry right away, but the connection is only closed once no
//! in-flight probe holds it any more:
//!
//! ```text
//! evict ──▶ retired ──(last borrow released)──▶ close()
//! ```
//!
//! Retired connections are reaped on every `acquire`, `release` and `evict`.
//!
//! ## Slots
//!
//! Each endpoint owns a slot that is filled at most once. Building a
//! connection only holds that slot, never the whole table, so a slow broker
//! does not stall probes against other endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, trace};

use crate::broker::{BrokerResult, Connection, Connector, Credentials, Endpoint};

type Slot<T> = Arc<OnceCell<Arc<T>>>;

struct CacheState<T> {
    live: HashMap<Endpoint, Slot<T>>,
    retired: Vec<Arc<T>>,
}

impl<T> CacheState<T> {
    fn is_live(&self, endpoint: &Endpoint, slot: &Slot<T>) -> bool {
        self.live
            .get(endpoint)
            .is_some_and(|live| Arc::ptr_eq(live, slot))
    }

    fn retire(&mut self, connection: &Arc<T>) {
        if !self.retired.iter().any(|r| Arc::ptr_eq(r, connection)) {
            self.retired.push(Arc::clone(connection));
        }
    }
}

/// Endpoint → connection table shared by all probes
pub struct ConnectionCache<C: Connector> {
    connector: C,
    state: Mutex<CacheState<C::Connection>>,
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            state: Mutex::new(CacheState {
                live: HashMap::new(),
                retired: Vec::new(),
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Return the cached connection for `endpoint`, creating it if necessary
    ///
    /// No health check is performed on a cached connection. Concurrent probes
    /// against one endpoint wait on the same slot and never create two
    /// connections. A failed construction caches nothing.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> BrokerResult<Arc<C::Connection>> {
        let slot = {
            let mut state = self.state.lock().await;
            reap(&mut state).await;
            Arc::clone(state.live.entry(endpoint.clone()).or_default())
        };

        if let Some(connection) = slot.get() {
            trace!("reusing connection to {endpoint}");
            return Ok(Arc::clone(connection));
        }

        let built = slot
            .get_or_try_init(|| async {
                debug!("creating connection to {endpoint}");
                self.connector.connect(endpoint, credentials).await.map(Arc::new)
            })
            .await
            .map(Arc::clone);

        let mut state = self.state.lock().await;
        let live = state.is_live(endpoint, &slot);
        match built {
            Ok(connection) => {
                if !live {
                    // evicted while it was being built
                    state.retire(&connection);
                }
                Ok(connection)
            }
            Err(e) => {
                if live && !slot.initialized() {
                    state.live.remove(endpoint);
                }
                Err(e)
            }
        }
    }

    /// Give back a connection obtained from [`acquire`](Self::acquire)
    pub async fn release(&self, connection: Arc<C::Connection>) {
        drop(connection);

        let mut state = self.state.lock().await;
        reap(&mut state).await;
    }

    /// Drop the cached connection for `endpoint` so the next probe builds a new one
    ///
    /// Idempotent. The connection is closed as soon as no probe borrows it.
    pub async fn evict(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock().await;

        if let Some(slot) = state.live.remove(endpoint) {
            if let Some(connection) = slot.get() {
                info!("evicted connection to {endpoint}");
                state.retire(connection);
            }
        }

        reap(&mut state).await;
    }

    /// Close every connection, borrowed or not. Used on shutdown.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;

        let live: Vec<_> = state
            .live
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        let retired: Vec<_> = state.retired.drain(..).collect();

        for connection in live.into_iter().chain(retired) {
            connection.close().await;
        }
    }

    pub async fn contains(&self, endpoint: &Endpoint) -> bool {
        self.state
            .lock()
            .await
            .live
            .get(endpoint)
            .is_some_and(|slot| slot.initialized())
    }

    pub async fn len(&self) -> usize {
        self.state
            .lock()
            .await
            .live
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Close retired connections nobody borrows any more
async fn reap<T: Connection>(state: &mut CacheState<T>) {
    if state.retired.is_empty() {
        return;
    }

    let (idle, borrowed): (Vec<_>, Vec<_>) = state
        .retired
        .drain(..)
        .partition(|connection| Arc::strong_count(connection) == 1);
    state.retired = borrowed;

    for connection in idle {
        connection.close().await;
    }
}
