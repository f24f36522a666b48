//! # Job Handlers
//!
//! A handler performs one identifier's lookup. Handlers are resolved from the job's
//! [`JobKind`] once, at batch submission, through a [`HandlerRegistry`]; a
//! [`HandlerRoute`] also names the rate-limited resource the handler talks to and
//! whether it needs a pooled connection.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::error::{EngineError, HandlerError, Result};
use crate::models::{BatchId, JobId, JobKind, Priority};

/// Everything a handler knows about the job it is running
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub identifier: String,
    pub kind: JobKind,
    pub priority: Priority,
    /// 1-based attempt number
    pub attempt: u32,
    /// Advisory deadline. The handler is expected to abort its own I/O when it passes.
    pub deadline: Option<Instant>,
}

impl JobContext {
    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_past_deadline(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

/// Caller-supplied lookup. Must be safe to run concurrently for different identifiers.
///
/// `connection` is `Some` only when the route was registered with
/// [`HandlerRoute::with_connection`].
#[async_trait]
pub trait JobHandler<C: Send + 'static = ()>: Send + Sync {
    async fn execute(
        &self,
        context: &JobContext,
        connection: Option<&mut C>,
    ) -> std::result::Result<Value, HandlerError>;
}

/// Adapts an async closure into a [`JobHandler`] that ignores the connection
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[async_trait]
impl<C, F, Fut> JobHandler<C> for FnHandler<F>
where
    C: Send + 'static,
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn execute(
        &self,
        context: &JobContext,
        _connection: Option<&mut C>,
    ) -> std::result::Result<Value, HandlerError> {
        (self.f)(context.clone()).await
    }
}

/// A handler plus the resource it is throttled and circuit-broken under
pub struct HandlerRoute<C: Send + 'static = ()> {
    pub handler: Arc<dyn JobHandler<C>>,
    /// Rate limiter / circuit breaker key, e.g. `"api"` or `"scrape:treasurer"`
    pub resource: String,
    pub needs_connection: bool,
}

impl<C: Send + 'static> Clone for HandlerRoute<C> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            resource: self.resource.clone(),
            needs_connection: self.needs_connection,
        }
    }
}

impl<C: Send + 'static> fmt::Debug for HandlerRoute<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRoute")
            .field("resource", &self.resource)
            .field("needs_connection", &self.needs_connection)
            .finish()
    }
}

impl<C: Send + 'static> HandlerRoute<C> {
    pub fn new(handler: Arc<dyn JobHandler<C>>, resource: impl Into<String>) -> Self {
        Self {
            handler,
            resource: resource.into(),
            needs_connection: false,
        }
    }

    /// Acquire a pooled connection for every invocation
    pub fn with_connection(mut self) -> Self {
        self.needs_connection = true;
        self
    }
}

/// Engine-owned map from job kind to handler route
///
/// ```rust
/// use lookup_engine::models::{BatchId, JobId, JobKind, Priority};
/// use lookup_engine::{FnHandler, HandlerError, HandlerRegistry, HandlerRoute, JobContext};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let registry: HandlerRegistry = HandlerRegistry::new().with_route(
///     JobKind::BasicSearch,
///     HandlerRoute::new(
///         Arc::new(FnHandler::new(|ctx: JobContext| async move {
///             Ok::<_, HandlerError>(json!({ "apn": ctx.identifier }))
///         })),
///         "api",
///     ),
/// );
///
/// let route = registry.resolve(JobKind::BasicSearch).unwrap();
/// let context = JobContext {
///     job_id: JobId::new(),
///     batch_id: BatchId::new(),
///     identifier: "123-45-678".to_string(),
///     kind: JobKind::BasicSearch,
///     priority: Priority::Normal,
///     attempt: 1,
///     deadline: None,
/// };
/// let value = route.handler.execute(&context, None).await.unwrap();
/// assert_eq!(value["apn"], "123-45-678");
/// assert!(registry.resolve(JobKind::Enhancement).is_err());
/// # });
/// ```
pub struct HandlerRegistry<C: Send + 'static = ()> {
    routes: DashMap<JobKind, HandlerRoute<C>>,
}

impl<C: Send + 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }
}

impl<C: Send + 'static> fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl<C: Send + 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the route for `kind`
    pub fn register(&self, kind: JobKind, route: HandlerRoute<C>) {
        info!(
            kind = %kind,
            resource = %route.resource,
            needs_connection = route.needs_connection,
            "📚 REGISTRY: Handler registered"
        );
        self.routes.insert(kind, route);
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_route(self, kind: JobKind, route: HandlerRoute<C>) -> Self {
        self.register(kind, route);
        self
    }

    pub fn resolve(&self, kind: JobKind) -> Result<HandlerRoute<C>> {
        self.routes
            .get(&kind)
            .map(|route| route.value().clone())
            .ok_or(EngineError::NoHandlerRegistered(kind))
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.routes.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.routes.iter().map(|entry| *entry.key()).collect();
        kinds.sort_by_key(|kind| kind.to_string());
        kinds
    }
}
