//! Rerun admission for failed tests.

use serde::{Deserialize, Serialize};
use testrig_core::RerunAdmission;

/// Whether a failing set may be rerun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunVerdict {
    pub admitted: bool,
    pub failed: usize,
    pub total: usize,
    pub message: String,
}

/// Rerun admission rules.
pub struct RerunGate;

impl RerunGate {
    /// Evaluate `failed` out of `total` executed tests against `admission`.
    ///
    /// - count based: at most `max_failed_tests` distinct failures
    /// - percentage based: at most `threshold_percent` of the executed tests
    pub fn evaluate(admission: &RerunAdmission, failed: usize, total: usize) -> RerunVerdict {
        let total = total.max(failed);
        let (admitted, message) = if failed == 0 {
            (false, "no failed tests to rerun".to_string())
        } else {
            match *admission {
                RerunAdmission::CountBased { max_failed_tests } => {
                    if failed > max_failed_tests {
                        (
                            false,
                            format!("{failed} failed tests exceed the rerun limit of {max_failed_tests}"),
                        )
                    } else {
                        (true, format!("{failed} failed tests within limit {max_failed_tests}"))
                    }
                }
                RerunAdmission::PercentageBased { threshold_percent } => {
                    if failed * 100 > threshold_percent as usize * total {
                        (
                            false,
                            format!(
                                "{failed} of {total} tests failed, above the {threshold_percent}% rerun threshold"
                            ),
                        )
                    } else {
                        (
                            true,
                            format!("{failed} of {total} tests failed, within {threshold_percent}%"),
                        )
                    }
                }
            }
        };
        RerunVerdict {
            admitted,
            failed,
            total,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_based() {
        let admission = RerunAdmission::CountBased { max_failed_tests: 5 };
        assert!(RerunGate::evaluate(&admission, 3, 100).admitted);
        assert!(RerunGate::evaluate(&admission, 5, 100).admitted);
        let verdict = RerunGate::evaluate(&admission, 6, 100);
        assert!(!verdict.admitted);
        assert!(verdict.message.contains("exceed"));
    }

    #[test]
    fn test_percentage_based() {
        let admission = RerunAdmission::PercentageBased {
            threshold_percent: 30,
        };
        assert!(RerunGate::evaluate(&admission, 30, 100).admitted);
        assert!(!RerunGate::evaluate(&admission, 31, 100).admitted);
        assert!(RerunGate::evaluate(&admission, 1, 4).admitted);
        assert!(!RerunGate::evaluate(&admission, 2, 4).admitted);
    }

    #[test]
    fn test_nothing_failed_is_not_admitted() {
        let verdict = RerunGate::evaluate(&RerunAdmission::default(), 0, 10);
        assert!(!verdict.admitted);
    }

    #[test]
    fn test_unknown_total_uses_failed_count() {
        let admission = RerunAdmission::PercentageBased {
            threshold_percent: 50,
        };
        let verdict = RerunGate::evaluate(&admission, 3, 0);
        assert_eq!(verdict.total, 3);
        assert!(!verdict.admitted);
    }
}
