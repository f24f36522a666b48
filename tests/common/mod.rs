//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use lookup_engine::config::{CircuitBreakerSettings, RateLimitResourceConfig};
use lookup_engine::{
    ConnectionError, ConnectionManager, EngineConfig, HandlerError, JobContext, JobHandler,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lookup_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Fast retries, generous non-adaptive rate limits, breakers disabled
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers.dequeue_poll_interval_ms = 20;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 200;
    config.retry.multiplier = 2.0;
    config.retry.jitter_factor = 0.1;
    config.rate_limits.default_config = RateLimitResourceConfig {
        capacity: 1_000,
        refill_per_second: 1_000.0,
        adaptive: false,
        ..RateLimitResourceConfig::default()
    };
    config.circuit_breakers = CircuitBreakerSettings {
        enabled: false,
        ..CircuitBreakerSettings::default()
    };
    config
}

/// What a scripted handler does for one identifier and attempt
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Transient,
    Permanent,
    Backpressure,
    Panic,
}

type ScriptFn = dyn Fn(&str, u32) -> Script + Send + Sync;

/// Handler driven by a script, recording the order jobs started in
pub struct ScriptedHandler {
    script: Box<ScriptFn>,
    delay: Duration,
    calls: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    pub fn new(script: impl Fn(&str, u32) -> Script + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delay(
        delay: Duration,
        script: impl Fn(&str, u32) -> Script + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay,
            calls: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(|_, _| Script::Succeed)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Identifiers in the order their first attempt started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    async fn run(&self, context: &JobContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if context.attempt == 1 {
            self.started.lock().push(context.identifier.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match (self.script)(&context.identifier, context.attempt) {
            Script::Succeed => Ok(json!({
                "identifier": context.identifier,
                "attempt": context.attempt,
            })),
            Script::Transient => Err(HandlerError::transient("upstream returned 502")),
            Script::Permanent => Err(HandlerError::permanent("identifier not found")),
            Script::Backpressure => Err(HandlerError::backpressure("429 too many requests")),
            Script::Panic => panic!("scraper crashed on {}", context.identifier),
        }
    }
}

#[async_trait]
impl JobHandler<()> for ScriptedHandler {
    async fn execute(
        &self,
        context: &JobContext,
        _connection: Option<&mut ()>,
    ) -> Result<Value, HandlerError> {
        self.run(context).await
    }
}

#[async_trait]
impl JobHandler<MemoryConnection> for ScriptedHandler {
    async fn execute(
        &self,
        context: &JobContext,
        connection: Option<&mut MemoryConnection>,
    ) -> Result<Value, HandlerError> {
        let Some(connection) = connection else {
            return Err(HandlerError::permanent("no connection supplied"));
        };
        connection.queries += 1;
        let mut value = self.run(context).await?;
        value["connection_id"] = json!(connection.id);
        Ok(value)
    }
}

/// In-memory stand-in for a database connection
#[derive(Debug)]
pub struct MemoryConnection {
    pub id: u64,
    pub queries: u32,
}

/// Opens numbered in-memory connections. Clones share the counter.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnectionManager {
    opened: Arc<AtomicU64>,
}

impl MemoryConnectionManager {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnectionManager {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, ConnectionError> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryConnection { id, queries: 0 })
    }

    async fn is_valid(&self, _connection: &mut MemoryConnection) -> bool {
        true
    }
}
