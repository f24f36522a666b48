//! Bounded connection pool
//!
//! - Connections are created lazily, up to `max_size`
//! - Idle connections are validated before reuse and expire after `idle_lifetime`
//! - A connection released unhealthy (or dropped without release) is discarded and its
//!   slot freed so a later `acquire` can create a replacement

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::utils::time::saturating_add;

/// Failure reported by a connection manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConnectionError(pub String);

/// Creates and validates the handles a pool hands out
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new handle
    async fn connect(&self) -> std::result::Result<Self::Connection, ConnectionError>;

    /// Trivial liveness check run before an idle handle is reused
    async fn is_valid(&self, connection: &mut Self::Connection) -> bool;
}

/// Manager for engines whose handlers need no pooled resource
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConnectionManager;

#[async_trait]
impl ConnectionManager for NoopConnectionManager {
    type Connection = ();

    async fn connect(&self) -> std::result::Result<(), ConnectionError> {
        Ok(())
    }

    async fn is_valid(&self, _connection: &mut ()) -> bool {
        true
    }
}

/// Pool bounds and timing
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_lifetime: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be greater than 0".to_string());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        if self.idle_lifetime.is_zero() {
            return Err("idle_lifetime must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Pool occupancy and lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
    pub expired: u64,
    pub validation_failures: u64,
}

struct IdleConnection<C> {
    id: u64,
    connection: C,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    /// Idle + checked out + slots reserved by in-progress acquisitions
    live: usize,
    next_id: u64,
    created: u64,
    discarded: u64,
    expired: u64,
    validation_failures: u64,
}

impl<C> PoolState<C> {
    fn discard_slot(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.discarded += 1;
    }
}

struct PoolShared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<M::Connection>>,
}

/// Frees a live slot unless the acquisition it belongs to completes
struct SlotGuard<'a, C> {
    state: &'a Mutex<PoolState<C>>,
    armed: bool,
}

impl<C> Drop for SlotGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().discard_slot();
        }
    }
}

enum Candidate<C> {
    Reuse(IdleConnection<C>),
    Create(u64),
}

/// Bounded set of reusable resource handles
pub struct ConnectionPool<M: ConnectionManager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(EngineError::InvalidConfiguration)?;

        info!(
            min_size = config.min_size,
            max_size = config.max_size,
            "🏊 POOL: Connection pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    next_id: 0,
                    created: 0,
                    discarded: 0,
                    expired: 0,
                    validation_failures: 0,
                }),
                manager,
                config,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire with the configured default timeout
    pub async fn get(&self) -> Result<PooledConnection<M>> {
        self.acquire(self.shared.config.acquire_timeout).await
    }

    /// Return a validated connection, creating one if the pool is below its maximum.
    /// Waits up to `timeout` when every connection is in use.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>> {
        let start = Instant::now();
        let deadline = saturating_add(start, timeout);

        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.shared.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(EngineError::EngineShutdown),
            Err(_) => {
                debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Connection pool exhausted"
                );
                return Err(EngineError::PoolExhausted {
                    waited: start.elapsed(),
                });
            }
        };

        loop {
            let candidate = self.next_candidate();
            let mut slot = SlotGuard {
                state: &self.shared.state,
                armed: true,
            };

            match candidate {
                Candidate::Reuse(mut idle) => {
                    if self.shared.manager.is_valid(&mut idle.connection).await {
                        slot.armed = false;
                        return Ok(PooledConnection {
                            id: idle.id,
                            connection: Some(idle.connection),
                            created_at: idle.created_at,
                            last_validated_at: Instant::now(),
                            pool: Arc::clone(&self.shared),
                            _permit: permit,
                        });
                    }
                    warn!(connection_id = idle.id, "Idle connection failed validation, discarding");
                    self.shared.state.lock().validation_failures += 1;
                    // slot guard drops here and frees the slot
                }
                Candidate::Create(id) => {
                    let connect = self.shared.manager.connect();
                    let connection = match tokio::time::timeout_at(deadline, connect).await {
                        Ok(Ok(connection)) => connection,
                        Ok(Err(e)) => {
                            return Err(EngineError::ConnectionFailed(e.to_string()));
                        }
                        Err(_) => {
                            return Err(EngineError::ConnectionFailed(
                                "timed out opening connection".to_string(),
                            ));
                        }
                    };
                    slot.armed = false;
                    let now = Instant::now();
                    self.shared.state.lock().created += 1;
                    debug!(connection_id = id, "Opened new pooled connection");
                    return Ok(PooledConnection {
                        id,
                        connection: Some(connection),
                        created_at: now,
                        last_validated_at: now,
                        pool: Arc::clone(&self.shared),
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// Expire stale idle connections, then pop the freshest idle one or reserve a new slot
    fn next_candidate(&self) -> Candidate<M::Connection> {
        let mut state = self.shared.state.lock();
        let idle_lifetime = self.shared.config.idle_lifetime;

        let before = state.idle.len();
        state
            .idle
            .retain(|idle| idle.idle_since.elapsed() <= idle_lifetime);
        let expired = before - state.idle.len();
        if expired > 0 {
            state.live = state.live.saturating_sub(expired);
            state.expired += expired as u64;
            state.discarded += expired as u64;
            debug!(expired, "Expired idle connections");
        }

        match state.idle.pop_back() {
            Some(idle) => Candidate::Reuse(idle),
            None => {
                state.live += 1;
                state.next_id += 1;
                Candidate::Create(state.next_id)
            }
        }
    }

    /// Return a connection to the pool; unhealthy connections are discarded
    pub fn release(&self, connection: PooledConnection<M>, healthy: bool) {
        connection.release(healthy);
    }

    /// Pre-create connections up to `min_size`, returning how many were opened
    pub async fn warm_up(&self) -> Result<usize> {
        let created_before = self.stats().created;
        let mut held = Vec::with_capacity(self.shared.config.min_size);
        for _ in 0..self.shared.config.min_size {
            held.push(self.acquire(self.shared.config.acquire_timeout).await?);
        }
        for connection in held {
            connection.release(true);
        }

        let opened = (self.stats().created - created_before) as usize;
        if opened > 0 {
            info!(opened, "🏊 POOL: Warmed up connection pool");
        }
        Ok(opened)
    }

    /// Stop handing out connections and drop every idle one
    pub fn close(&self) {
        self.shared.semaphore.close();
        let mut state = self.shared.state.lock();
        let idle = state.idle.len();
        state.idle.clear();
        state.live = state.live.saturating_sub(idle);
        state.discarded += idle as u64;
        info!(dropped_idle = idle, "🏊 POOL: Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_size: self.shared.config.max_size,
            live: state.live,
            idle: state.idle.len(),
            in_use: state.live.saturating_sub(state.idle.len()),
            created: state.created,
            discarded: state.discarded,
            expired: state.expired,
            validation_failures: state.validation_failures,
        }
    }
}

/// A checked-out connection. Exactly one worker holds it at a time; dropping it
/// without [`release`](PooledConnection::release) discards it.
pub struct PooledConnection<M: ConnectionManager> {
    id: u64,
    connection: Option<M::Connection>,
    created_at: Instant,
    last_validated_at: Instant,
    pool: Arc<PoolShared<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Pool-unique handle id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_validated_at(&self) -> Instant {
        self.last_validated_at
    }

    /// Mutable access to the underlying handle
    pub fn connection_mut(&mut self) -> Option<&mut M::Connection> {
        self.connection.as_mut()
    }

    /// Return the handle to the idle set if `healthy`, otherwise discard it
    pub fn release(mut self, healthy: bool) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let mut state = self.pool.state.lock();
        if healthy && !self.pool.semaphore.is_closed() {
            state.idle.push_back(IdleConnection {
                id: self.id,
                connection,
                created_at: self.created_at,
                idle_since: Instant::now(),
            });
        } else {
            state.discard_slot();
            debug!(connection_id = self.id, healthy, "Discarded pooled connection");
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if self.connection.take().is_some() {
            self.pool.state.lock().discard_slot();
            warn!(connection_id = self.id, "Pooled connection dropped without release, discarding");
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("in_use", &self.connection.is_some())
            .finish()
    }
}
