//! Tracing setup and the log-backed audit hook.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Audit events rendered as structured log lines.
pub mod audit;

pub use audit::TracingAuditHook;
