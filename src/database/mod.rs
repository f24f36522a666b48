//! # Resource Access
//!
//! Pooled handles to the persistence collaborator (database connections or HTTP
//! sessions). The engine never knows what a handle is; it only creates handles
//! through a [`ConnectionManager`] and checks them with a trivial liveness check
//! before reuse.
//!
//! ## Key Components
//!
//! - [`connection_pool`] - Bounded pool with lazy creation, validation and idle expiry

pub mod connection_pool;

pub use connection_pool::{
    ConnectionError, ConnectionManager, ConnectionPool, NoopConnectionManager, PoolConfig,
    PoolStats, PooledConnection,
};
