//! Structured lifecycle events for a test run.
//!
//! Every event carries an `event` field so log pipelines can filter on it.

use tracing::{info, warn, Span};

/// Run-scoped span; attach it to the run future with `Instrument`.
///
/// ```ignore
/// run(config).instrument(run_span("3f0c...")).await
/// ```
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("testrig.run", run_id = %run_id)
}

/// Emit `run.started`.
pub fn emit_run_started(run_id: &str, config_digest: &str, distributed: bool, tia: bool) {
    info!(
        event = "run.started",
        run_id = %run_id,
        config_digest = %config_digest,
        distributed = distributed,
        tia = tia,
    );
}

/// Emit `run.finished` with the final outcome.
pub fn emit_run_finished(run_id: &str, outcome: &str, executions: usize, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        outcome = %outcome,
        executions = executions,
        duration_ms = duration_ms,
    );
}

/// Impact selector moved to a new state.
pub fn emit_tia_state(state: &str) {
    info!(event = "tia.state", state = %state);
}

/// Impact analysis abandoned; the run continues unfiltered.
pub fn emit_tia_fallback(reason: &dyn std::fmt::Display) {
    warn!(event = "tia.fallback", reason = %reason);
}

/// Emit `selection.classified` for the impact helper's answer.
pub fn emit_selection(kind: &str, count: usize) {
    info!(event = "selection.classified", kind = %kind, count = count);
}

/// Emit `attempt.finished` once per engine invocation.
pub fn emit_attempt_finished(attempt: u32, exit_code: i32, failed: usize, duration_ms: u64) {
    info!(
        event = "attempt.finished",
        attempt = attempt,
        exit_code = exit_code,
        failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit `rerun.decision`, admitted or not.
pub fn emit_rerun_decision(admitted: bool, failed: usize, total: usize, reason: &str) {
    info!(
        event = "rerun.decision",
        admitted = admitted,
        failed = failed,
        total = total,
        reason = %reason,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _entered = span.enter();
        emit_selection("full", 3);
    }
}
