//! Tracing/logging setup shared by every binary in the workspace.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::TracingSettings;

/// Initialize process-wide observability with default settings
/// (`info`, JSON output).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&TracingSettings::default());
}

/// Initialize process-wide observability with explicit settings.
pub fn init_with(settings: &TracingSettings) {
    tracing::init(settings);
}
