//! Bounded connection pool keyed by transport configuration.
//!
//! Connections are grouped by [`PoolSignature`]; each group holds at most
//! `max_pool_connections` live connections. Acquisition never waits: when every
//! connection of a group is checked out, [`ConnectionPool::acquire`] fails with
//! [`TransportError::PoolExhausted`] and the caller decides whether to retry.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{TlsRootConfig, TransportConfig, TransportSecurity};
use crate::connection::Connection;
use crate::error::TransportError;

/// Proxy identity part of a signature; the password is deliberately left out
/// so it never sits in a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    host: String,
    port: u16,
    username: Option<String>,
}

/// Equality key for pooling: two configurations with the same signature may
/// share connections.
///
/// The per-call SSL mode is not part of the signature; connections switch
/// between default and client-certificate SSL on every checkout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolSignature {
    proxy: Option<ProxyKey>,
    connect_timeout_ms: u64,
    read_timeout_ms: u64,
    tls_roots: TlsRootConfig,
    trusted_ca_file: Option<PathBuf>,
    transport: TransportSecurity,
    sandbox: bool,
    max_connections: usize,
}

impl PoolSignature {
    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            proxy: config.proxy.as_ref().map(|p| ProxyKey {
                host: p.host.clone(),
                port: p.port,
                username: p.username.clone(),
            }),
            connect_timeout_ms: config.connect_timeout_ms,
            read_timeout_ms: config.read_timeout_ms,
            tls_roots: config.tls_roots,
            trusted_ca_file: config.trusted_ca_file.clone(),
            transport: config.transport,
            sandbox: config.runtime_sandbox_mode,
            max_connections: config.max_pool_connections.max(1),
        }
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Point-in-time counters for one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max: usize,
}

struct Slot {
    max: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    live: AtomicUsize,
    // Bumped by shutdown; connections checked out under an older generation
    // are discarded on release instead of going back to the idle list
    generation: AtomicU64,
}

impl Slot {
    fn new(max: usize) -> Self {
        Self {
            max,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(Vec::with_capacity(max)),
            live: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }
}

/// Process-wide (or client-wide) pool of reusable connections.
///
/// Share it between executors with `Arc`. All methods take `&self`.
pub struct ConnectionPool {
    slots: DashMap<PoolSignature, Arc<Slot>>,
    next_id: AtomicU64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("signatures", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Check out a connection for `signature`.
    ///
    /// Reuses an idle connection when one exists, otherwise creates a new one
    /// as long as the signature's bound allows it. The returned guard gives the
    /// connection back on drop, whatever the outcome of the call.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PoolExhausted`] if all connections for the
    /// signature are checked out.
    pub fn acquire(&self, signature: &PoolSignature) -> Result<PooledConnection, TransportError> {
        let slot = self.slot(signature);

        let Ok(permit) = Arc::clone(&slot.permits).try_acquire_owned() else {
            tracing::warn!(max = slot.max, "connection pool exhausted");
            return Err(TransportError::PoolExhausted { max: slot.max });
        };

        let generation = slot.generation.load(Ordering::Acquire);
        let reused = slot.idle.lock().pop();
        let mut conn = if let Some(conn) = reused {
            conn
        } else {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let live = slot.live.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(connection_id = id, live, max = slot.max, "created pooled connection");
            Connection::new(id)
        };
        conn.set_checked_out(true);

        tracing::trace!(connection_id = conn.id(), "connection acquired");
        Ok(PooledConnection {
            conn: Some(conn),
            slot,
            generation,
            _permit: permit,
        })
    }

    /// Counters for `signature`; all zero (with `max` from the signature) if
    /// nothing was ever acquired for it.
    #[must_use]
    pub fn stats(&self, signature: &PoolSignature) -> PoolStats {
        let Some(slot) = self.slots.get(signature).map(|s| Arc::clone(s.value())) else {
            return PoolStats {
                max: signature.max_connections,
                ..PoolStats::default()
            };
        };

        let live = slot.live.load(Ordering::Acquire);
        let idle = slot.idle.lock().len();
        PoolStats {
            live,
            idle,
            in_use: live.saturating_sub(idle),
            max: slot.max,
        }
    }

    /// Drop every idle connection.
    ///
    /// Connections still checked out stay valid until their guards drop; they
    /// are then discarded instead of being reused. Their permits stay counted
    /// against the bound until then, so a later `acquire` never pushes a
    /// signature past `max` live connections.
    pub fn shutdown(&self) {
        let mut dropped = 0usize;
        for entry in &self.slots {
            let slot = entry.value();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            let mut idle = slot.idle.lock();
            dropped += idle.len();
            slot.live.fetch_sub(idle.len(), Ordering::AcqRel);
            idle.clear();
        }
        tracing::debug!(dropped, "connection pool shut down");
    }

    fn slot(&self, signature: &PoolSignature) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(signature) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(signature.clone())
                .or_insert_with(|| Arc::new(Slot::new(signature.max_connections)))
                .value(),
        )
    }
}

/// Checked-out connection. Returns to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    slot: Arc<Slot>,
    generation: u64,
    // Released after the connection is back on the idle list
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection is only taken on drop"))
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("connection is only taken on drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.set_checked_out(false);
            if self.slot.generation.load(Ordering::Acquire) == self.generation {
                tracing::trace!(connection_id = conn.id(), "connection released");
                self.slot.idle.lock().push(conn);
            } else {
                tracing::trace!(connection_id = conn.id(), "connection discarded after shutdown");
                self.slot.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}
