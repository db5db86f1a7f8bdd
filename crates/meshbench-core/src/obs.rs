//! Structured observability hooks for run and scope lifecycle events.
//!
//! This module provides:
//! - The run-scoped tracing span every pipeline run is instrumented with
//! - Emission functions for run, stage and scope transitions
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).
//! For JSON output, pass `--json` to the CLI.

use tracing::{info, warn};

/// Build (without entering) the span for a run, for use with `Instrument`.
pub fn run_span(run_id: &str, topology: &str, environment: &str) -> tracing::Span {
    tracing::info_span!(
        "meshbench.run",
        run_id = %run_id,
        topology = %topology,
        environment = %environment,
    )
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, topology: &str, environment: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        topology = %topology,
        environment = %environment,
    );
}

/// Emit event: run finished with duration and outcome.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

pub fn emit_stage_finished(stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_scope_active(resource: &str) {
    info!(event = "scope.active", resource = %resource);
}

pub fn emit_scope_torn_down(resource: &str, on_error: bool) {
    info!(event = "scope.torn_down", resource = %resource, on_error = on_error);
}

pub fn emit_scope_retained(resource: &str) {
    warn!(event = "scope.retained", resource = %resource);
}

/// Emit event: teardown failed (warning level, never re-raised over an earlier error).
pub fn emit_scope_teardown_failed(resource: &str, error: &dyn std::fmt::Display) {
    warn!(event = "scope.teardown_failed", resource = %resource, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_carries_identity() {
        let span = run_span("test-run-id", "fanout", "none");
        let _entered = span.enter();
        emit_run_started("test-run-id", "fanout", "none");
    }
}
