//! Transition function for the summary lifecycle.
//!
//! Every move is decided here from (current status, gate result, failures so far); the
//! storage layer only applies the returned [`Transition`]. Rows never move backwards except
//! for staying in place on a retry.

use serde::Serialize;
use std::fmt;

use super::types::SummaryStatus;

/// Three-valued answer from the region re-verification call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RegionVerdict {
    ConfirmedRelated { rationale: String },
    ConfirmedUnrelated { rationale: String },
    Inconclusive { reason: String },
}

/// What a gate observed for one row.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult {
    /// Output of the `pending` classification step.
    Classified {
        passes_threshold: bool,
        region_related: bool,
        sentiment_in_scope: bool,
    },
    Region(RegionVerdict),
    Importance { accepted: bool },
    /// Collaborator error or timeout.
    CallFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Transition {
    /// Move forward to `to`.
    Advance { to: SummaryStatus },
    /// Region gate says unrelated: flag flips to external and the row joins the external filter.
    RegionOverturned,
    /// Stay in place with one more recorded failure.
    RetryLater,
    /// Region gate retries exhausted: export as region-related rather than drop.
    FailOpen,
    /// Retries exhausted on a gate with no safe default.
    GiveUp,
}

impl Transition {
    pub fn next_status(&self, current: SummaryStatus) -> SummaryStatus {
        match self {
            Transition::Advance { to } => *to,
            Transition::RegionOverturned => SummaryStatus::PendingExternalFilter,
            Transition::RetryLater => current,
            Transition::FailOpen => SummaryStatus::ReadyForExport,
            Transition::GiveUp => SummaryStatus::Failed,
        }
    }

    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Transition::RetryLater | Transition::FailOpen | Transition::GiveUp
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidTransition {
    pub status: SummaryStatus,
    pub result: GateResult,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {} on {:?}", self.status, self.result)
    }
}

impl std::error::Error for InvalidTransition {}

/// Decides the next step for a row in `status` given the gate's result.
///
/// `failures_so_far` is the gate's failure counter before this attempt.
pub fn transition(
    status: SummaryStatus,
    result: &GateResult,
    failures_so_far: i64,
    max_retries: i64,
) -> Result<Transition, InvalidTransition> {
    let exhausted = failures_so_far + 1 >= max_retries;

    let next = match (status, result) {
        (
            SummaryStatus::Pending,
            GateResult::Classified {
                passes_threshold,
                region_related,
                sentiment_in_scope,
            },
        ) => {
            let to = if !passes_threshold {
                SummaryStatus::FilteredOut
            } else if *region_related {
                SummaryStatus::PendingBeijingGate
            } else if *sentiment_in_scope {
                SummaryStatus::PendingExternalFilter
            } else {
                SummaryStatus::FilteredOut
            };
            Transition::Advance { to }
        }
        (SummaryStatus::Pending, GateResult::CallFailed) => {
            if exhausted {
                Transition::GiveUp
            } else {
                Transition::RetryLater
            }
        }

        (SummaryStatus::PendingBeijingGate, GateResult::Region(verdict)) => match verdict {
            RegionVerdict::ConfirmedRelated { .. } => Transition::Advance {
                to: SummaryStatus::ReadyForExport,
            },
            RegionVerdict::ConfirmedUnrelated { .. } => Transition::RegionOverturned,
            RegionVerdict::Inconclusive { .. } => region_failure(exhausted),
        },
        (SummaryStatus::PendingBeijingGate, GateResult::CallFailed) => region_failure(exhausted),

        (SummaryStatus::PendingExternalFilter, GateResult::Importance { accepted }) => {
            Transition::Advance {
                to: if *accepted {
                    SummaryStatus::ReadyForExport
                } else {
                    SummaryStatus::FilteredOut
                },
            }
        }
        (SummaryStatus::PendingExternalFilter, GateResult::CallFailed) => {
            if exhausted {
                Transition::GiveUp
            } else {
                Transition::RetryLater
            }
        }

        (status, result) => {
            return Err(InvalidTransition {
                status,
                result: result.clone(),
            })
        }
    };

    Ok(next)
}

fn region_failure(exhausted: bool) -> Transition {
    if exhausted {
        Transition::FailOpen
    } else {
        Transition::RetryLater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Position in the lifecycle; transitions never decrease it.
    fn stage(status: SummaryStatus) -> u8 {
        match status {
            SummaryStatus::Pending => 0,
            SummaryStatus::PendingBeijingGate => 1,
            SummaryStatus::PendingExternalFilter => 2,
            SummaryStatus::ReadyForExport | SummaryStatus::FilteredOut | SummaryStatus::Failed => 3,
        }
    }

    const ALL_STATUSES: [SummaryStatus; 6] = [
        SummaryStatus::Pending,
        SummaryStatus::PendingBeijingGate,
        SummaryStatus::PendingExternalFilter,
        SummaryStatus::ReadyForExport,
        SummaryStatus::FilteredOut,
        SummaryStatus::Failed,
    ];

    fn all_results() -> Vec<GateResult> {
        let mut results = vec![
            GateResult::CallFailed,
            GateResult::Importance { accepted: true },
            GateResult::Importance { accepted: false },
            GateResult::Region(RegionVerdict::ConfirmedRelated {
                rationale: "mentions Haidian".to_string(),
            }),
            GateResult::Region(RegionVerdict::ConfirmedUnrelated {
                rationale: "Beijing only as a metonym".to_string(),
            }),
            GateResult::Region(RegionVerdict::Inconclusive {
                reason: "unparseable".to_string(),
            }),
        ];
        for passes_threshold in [true, false] {
            for region_related in [true, false] {
                for sentiment_in_scope in [true, false] {
                    results.push(GateResult::Classified {
                        passes_threshold,
                        region_related,
                        sentiment_in_scope,
                    });
                }
            }
        }
        results
    }

    #[test]
    fn test_classification_routes() {
        let route = |passes_threshold, region_related, sentiment_in_scope| {
            transition(
                SummaryStatus::Pending,
                &GateResult::Classified {
                    passes_threshold,
                    region_related,
                    sentiment_in_scope,
                },
                0,
                3,
            )
            .unwrap()
            .next_status(SummaryStatus::Pending)
        };

        assert_eq!(route(false, true, true), SummaryStatus::FilteredOut);
        assert_eq!(route(true, true, false), SummaryStatus::PendingBeijingGate);
        assert_eq!(route(true, false, true), SummaryStatus::PendingExternalFilter);
        assert_eq!(route(true, false, false), SummaryStatus::FilteredOut);
    }

    #[test]
    fn test_region_gate_fails_open_after_retries() {
        let status = SummaryStatus::PendingBeijingGate;
        let timeout = GateResult::CallFailed;

        assert_eq!(transition(status, &timeout, 0, 3), Ok(Transition::RetryLater));
        assert_eq!(transition(status, &timeout, 1, 3), Ok(Transition::RetryLater));
        let third = transition(status, &timeout, 2, 3).unwrap();
        assert_eq!(third, Transition::FailOpen);
        assert_eq!(third.next_status(status), SummaryStatus::ReadyForExport);
        assert!(third.counts_as_failure());

        let inconclusive = GateResult::Region(RegionVerdict::Inconclusive {
            reason: "no answer".to_string(),
        });
        assert_eq!(transition(status, &inconclusive, 2, 3), Ok(Transition::FailOpen));
    }

    #[test]
    fn test_region_gate_overturn_moves_to_external_filter() {
        let result = GateResult::Region(RegionVerdict::ConfirmedUnrelated {
            rationale: "different city".to_string(),
        });
        let t = transition(SummaryStatus::PendingBeijingGate, &result, 2, 3).unwrap();
        assert_eq!(t, Transition::RegionOverturned);
        assert_eq!(
            t.next_status(SummaryStatus::PendingBeijingGate),
            SummaryStatus::PendingExternalFilter
        );
        assert!(!t.counts_as_failure());
    }

    #[test]
    fn test_external_filter_gives_up_after_retries() {
        let status = SummaryStatus::PendingExternalFilter;
        assert_eq!(
            transition(status, &GateResult::CallFailed, 1, 3),
            Ok(Transition::RetryLater)
        );
        let last = transition(status, &GateResult::CallFailed, 2, 3).unwrap();
        assert_eq!(last.next_status(status), SummaryStatus::Failed);

        let rejected = transition(status, &GateResult::Importance { accepted: false }, 0, 3);
        assert_eq!(
            rejected.unwrap().next_status(status),
            SummaryStatus::FilteredOut
        );
    }

    #[test]
    fn test_transition_is_total_and_never_moves_backwards() {
        for status in ALL_STATUSES {
            for result in all_results() {
                for failures in 0..4 {
                    match transition(status, &result, failures, 3) {
                        Ok(t) => {
                            let next = t.next_status(status);
                            assert!(stage(next) >= stage(status), "{:?} -> {:?}", status, next);
                            if next == status {
                                assert_eq!(t, Transition::RetryLater);
                            }
                            assert!(!status.is_terminal());
                        }
                        Err(e) => assert_eq!(e.status, status),
                    }
                }
            }
        }
    }

    #[test]
    fn test_terminal_statuses_reject_every_result() {
        for status in [
            SummaryStatus::ReadyForExport,
            SummaryStatus::FilteredOut,
            SummaryStatus::Failed,
        ] {
            for result in all_results() {
                assert!(transition(status, &result, 0, 3).is_err());
            }
        }
    }
}
