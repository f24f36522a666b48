//! # Structured Logging Module
//!
//! Environment-aware structured logging for the engine's async workers. The engine
//! only emits `tracing` events; a caller that wants them printed calls
//! [`init_structured_logging`] once at startup.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::{BatchId, JobId};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Output format for the console layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Install the engine's subscriber once per process; later calls are no-ops
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = current_environment();
        let format = configured_format();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&environment)));

        let layer = match format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .boxed(),
        };

        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Subscriber already installed by the host application, keeping it"
            );
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            format = ?format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Deployment environment name, `development` when unset
fn current_environment() -> String {
    std::env::var("LOOKUP_ENGINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Filter directive used when `RUST_LOG` is not set
fn default_directive(environment: &str) -> &'static str {
    if environment.eq_ignore_ascii_case("production") {
        "lookup_engine=info,warn"
    } else {
        "lookup_engine=debug,info"
    }
}

fn configured_format() -> LogFormat {
    parse_log_format(std::env::var("LOOKUP_ENGINE_LOG_FORMAT").ok().as_deref())
}

fn parse_log_format(value: Option<&str>) -> LogFormat {
    match value {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Log structured data for job operations
pub fn log_job_operation(
    operation: &str,
    job_id: JobId,
    batch_id: BatchId,
    identifier: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        batch_id = %batch_id,
        identifier = %identifier,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔧 JOB_OPERATION"
    );
}

/// Log structured data for batch operations
pub fn log_batch_operation(
    operation: &str,
    batch_id: BatchId,
    total: Option<usize>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        batch_id = %batch_id,
        total = total,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 BATCH_OPERATION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}
