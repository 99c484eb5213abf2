//! Engine invocation and the rerun loop.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use testrig_core::obs::{emit_attempt_finished, emit_rerun_decision};
use testrig_core::{ExecutionAttempt, RerunPolicy, Result, RunOutcome};
use tracing::{info, warn};

use crate::engine::TestEngine;
use crate::invocation::{Invocation, InvocationBuilder, Selection};
use crate::process::ProcessOutput;
use crate::report::TestReport;
use crate::rerun::RerunGate;

/// Everything a dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub outcome: RunOutcome,
    pub attempts: Vec<ExecutionAttempt>,
    pub report_files: Vec<PathBuf>,
}

struct AttemptRun {
    attempt: ExecutionAttempt,
    report: Option<TestReport>,
    output: ProcessOutput,
}

/// Runs the engine for one selection, rerunning failures when allowed.
pub struct ExecutionDispatcher<'a> {
    engine: &'a dyn TestEngine,
    builder: &'a InvocationBuilder,
    rerun: &'a RerunPolicy,
    deadline: Option<Instant>,
}

impl<'a> ExecutionDispatcher<'a> {
    /// `builder` carries the persisted settings path used by every attempt.
    pub fn new(
        engine: &'a dyn TestEngine,
        builder: &'a InvocationBuilder,
        rerun: &'a RerunPolicy,
    ) -> Self {
        Self {
            engine,
            builder,
            rerun,
            deadline: None,
        }
    }

    /// Stop starting new attempts after `deadline`.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `selection`. Only a launch failure of the engine is an error.
    pub async fn run(&self, selection: &Selection, ignore_failures: bool) -> Result<DispatchResult> {
        let mut attempts = Vec::new();
        let mut report_files = Vec::new();

        if let Selection::Tests(names) = selection {
            if names.is_empty() {
                warn!("selection is empty, nothing to execute");
                return Ok(DispatchResult {
                    outcome: RunOutcome::Succeeded,
                    attempts,
                    report_files,
                });
            }
        }

        if self.deadline_passed() {
            return Ok(DispatchResult {
                outcome: RunOutcome::failed("deadline elapsed before the first test run"),
                attempts,
                report_files,
            });
        }

        info!(selection = selection.name(), "dispatching test run");
        let invocation = self.builder.build(selection, 0)?;
        let first_report = invocation.report_path.clone();
        let first = self.execute(&invocation).await;
        if let Err(e) = invocation.cleanup() {
            warn!(error = %e, "could not remove response file");
        }
        let first = first?;

        let total = first.report.as_ref().map(|r| r.total).unwrap_or(0);
        let mut failing = first.attempt.failed_test_ids.clone();
        let mut last_output = first.output;
        let mut passed = last_output.success() && failing.is_empty();
        if first.report.is_some() {
            report_files.push(first_report);
        }
        attempts.push(first.attempt);

        if !passed && self.rerun.enabled && !failing.is_empty() {
            for n in 1..=self.rerun.max_attempts {
                let verdict = RerunGate::evaluate(&self.rerun.admission, failing.len(), total);
                emit_rerun_decision(verdict.admitted, verdict.failed, verdict.total, &verdict.message);
                if !verdict.admitted {
                    warn!(reason = %verdict.message, "not rerunning failed tests");
                    break;
                }
                if self.deadline_passed() {
                    warn!(attempt = n, "deadline reached, abandoning remaining reruns");
                    break;
                }

                info!(attempt = n, failing = failing.len(), "rerunning failed tests");
                let invocation = self.builder.rerun(&failing, n);
                let mut run = self.execute(&invocation).await?;

                match &run.report {
                    Some(report) => {
                        // A name leaves the set only when none of its rows failed.
                        failing.retain(|t| {
                            report.failed.contains(t) || !report.passed.contains(t)
                        });
                        report_files.push(invocation.report_path.clone());
                    }
                    None if run.output.success() => failing.clear(),
                    None => {}
                }
                run.attempt.failed_test_ids = failing.clone();
                attempts.push(run.attempt);
                last_output = run.output;

                if failing.is_empty() {
                    info!(attempt = n, "all previously failing tests passed on rerun");
                    break;
                }
            }
            passed = failing.is_empty();
        }

        let outcome = if passed {
            RunOutcome::Succeeded
        } else {
            let reason = failure_reason(&failing, &last_output);
            if ignore_failures {
                warn!(reason = %reason, "test failures ignored");
                RunOutcome::Succeeded
            } else {
                RunOutcome::failed(reason)
            }
        };

        Ok(DispatchResult {
            outcome,
            attempts,
            report_files,
        })
    }

    async fn execute(&self, invocation: &Invocation) -> Result<AttemptRun> {
        let started_at = Utc::now();
        let start = Instant::now();

        let output = match self.engine.execute(invocation).await {
            Ok(output) => output,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "test engine run did not complete");
                ProcessOutput {
                    exit_code: -1,
                    stderr: e.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..Default::default()
                }
            }
        };

        let report = match TestReport::read(&invocation.report_path).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, report = %invocation.report_path.display(), "ignoring unreadable report");
                None
            }
        };
        let failed: BTreeSet<String> = report
            .as_ref()
            .map(|r| r.failed.clone())
            .unwrap_or_default();

        emit_attempt_finished(
            invocation.attempt,
            output.exit_code,
            failed.len(),
            output.duration_ms,
        );

        Ok(AttemptRun {
            attempt: ExecutionAttempt {
                attempt: invocation.attempt,
                mode: invocation.mode.clone(),
                exit_code: output.exit_code,
                failed_test_ids: failed,
                total_tests: report.as_ref().map(|r| r.total).unwrap_or(0),
                duration_ms: output.duration_ms,
                started_at,
            },
            report,
            output,
        })
    }
}

fn failure_reason(failing: &BTreeSet<String>, last: &ProcessOutput) -> String {
    if failing.is_empty() {
        let tail = last.stderr_tail(3);
        if tail.is_empty() {
            format!("test engine exited with code {}", last.exit_code)
        } else {
            format!("test engine exited with code {}: {tail}", last.exit_code)
        }
    } else {
        let shown: Vec<&str> = failing.iter().take(5).map(String::as_str).collect();
        let more = failing.len().saturating_sub(shown.len());
        let mut reason = format!("{} test(s) failed: {}", failing.len(), shown.join(", "));
        if more > 0 {
            reason.push_str(&format!(" and {more} more"));
        }
        reason
    }
}
