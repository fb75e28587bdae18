//! Bounded per-endpoint connection pool.
//!
//! Capacity is accounted in the registry (`current_connections`), so the
//! check-and-increment happens under the registry's synchronous lock. Idle
//! connections are kept per endpoint key and proven alive before reuse.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::mcp::config::PROBE_COMMAND_TIMEOUT;
use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::Result;
use crate::mcp::registry::EndpointRegistry;
use crate::mcp::transport::{ConnectMode, Connector, RemoteConnection};

const LIVENESS_COMMAND: &str = "echo alive";

/// One reserved capacity slot, returned to the registry on drop.
struct SlotReservation {
    registry: Arc<EndpointRegistry>,
    key: String,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.registry.release_slot(&self.key);
    }
}

/// A checked-out connection. Dropping it closes nothing but still gives
/// the capacity slot back; hand it to [`ConnectionPool::release`] to reuse
/// the connection.
pub struct PooledConnection {
    conn: Box<dyn RemoteConnection>,
    slot: SlotReservation,
}

impl PooledConnection {
    pub fn connection(&self) -> &dyn RemoteConnection {
        self.conn.as_ref()
    }

    pub fn endpoint_key(&self) -> &str {
        &self.slot.key
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    registry: Arc<EndpointRegistry>,
    idle: DashMap<String, Vec<Box<dyn RemoteConnection>>>,
    max_pool_size: usize,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<EndpointRegistry>,
        max_pool_size: usize,
    ) -> Self {
        Self {
            connector,
            registry,
            idle: DashMap::new(),
            max_pool_size,
        }
    }

    /// Check out a live connection to `endpoint`.
    ///
    /// Fails with a connection error when the endpoint is at capacity, and
    /// with the transport error when a new connection cannot be opened.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        let key = endpoint.key();
        self.registry.try_reserve_slot(&key)?;
        let slot = SlotReservation {
            registry: self.registry.clone(),
            key: key.clone(),
        };

        while let Some(conn) = self.pop_idle(&key) {
            if is_alive(conn.as_ref()).await {
                debug!("Reusing pooled connection to {}", key);
                return Ok(PooledConnection { conn, slot });
            }
            debug!("Discarding dead pooled connection to {}", key);
            conn.close().await;
        }

        let conn = self
            .connector
            .connect(endpoint, ConnectMode::Session)
            .await?;
        info!("Opened new connection to {}", key);
        Ok(PooledConnection { conn, slot })
    }

    /// Return a connection. Live connections of registered endpoints go
    /// back to the idle set while it has room; the rest are closed. The slot
    /// is always given back.
    pub async fn release(&self, pooled: PooledConnection) {
        let PooledConnection { conn, slot } = pooled;

        if self.registry.get(&slot.key).is_none() {
            debug!("Endpoint {} was removed, closing connection", slot.key);
        } else if is_alive(conn.as_ref()).await {
            let mut idle = self.idle.entry(slot.key.clone()).or_default();
            if idle.len() < self.max_pool_size {
                idle.push(conn);
                return;
            }
            drop(idle);
            debug!("Idle set for {} is full, closing connection", slot.key);
        } else {
            warn!("Released connection to {} is dead, closing", slot.key);
        }
        conn.close().await;
    }

    /// Close every idle connection.
    pub async fn drain(&self) {
        let keys: Vec<String> = self.idle.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for key in keys {
            closed += self.close_idle(&key).await;
        }
        info!("Connection pool drained, closed {} idle connection(s)", closed);
    }

    /// Close the idle connections of one endpoint.
    ///
    /// Returns how many were closed.
    pub async fn drain_endpoint(&self, key: &str) -> usize {
        let closed = self.close_idle(key).await;
        if closed > 0 {
            info!("Closed {} idle connection(s) to {}", closed, key);
        }
        closed
    }

    async fn close_idle(&self, key: &str) -> usize {
        let Some((_, conns)) = self.idle.remove(key) else {
            return 0;
        };
        let closed = conns.len();
        for conn in conns {
            conn.close().await;
        }
        closed
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.idle.get(key).map(|e| e.len()).unwrap_or(0)
    }

    fn pop_idle(&self, key: &str) -> Option<Box<dyn RemoteConnection>> {
        self.idle.get_mut(key)?.pop()
    }
}

async fn is_alive(conn: &dyn RemoteConnection) -> bool {
    matches!(
        conn.exec(LIVENESS_COMMAND, PROBE_COMMAND_TIMEOUT).await,
        Ok(output) if output.succeeded()
    )
}
