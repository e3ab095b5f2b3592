//! Resource budget for one dimension's production call.

use serde::{Deserialize, Serialize};

use repolore_shared::OutputKind;

/// Limits handed to the production agent for a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_iterations: u32,
    pub search_budget: u32,
    pub search_budget_grace: u32,
    pub max_submits: u32,
    pub soft_submit_limit: u32,
    pub idle_rounds_to_exit: u32,
}

/// Base profile; every other profile overrides a subset of it.
const BASE: Budget = Budget {
    max_iterations: 30,
    search_budget: 8,
    search_budget_grace: 4,
    max_submits: 6,
    soft_submit_limit: 4,
    idle_rounds_to_exit: 2,
};

/// Signal count above which the large profile applies.
const LARGE_SIGNAL_THRESHOLD: usize = 15;
/// Signal count above which the medium profile applies.
const MEDIUM_SIGNAL_THRESHOLD: usize = 5;

/// Derive the budget for a dimension from its output kind and signal count.
///
/// Rules are evaluated in order: digest-only, large (> 15 signals),
/// medium (> 5 signals), base.
pub fn compute_budget(output: OutputKind, signal_count: usize) -> Budget {
    if output == OutputKind::DigestOnly {
        return Budget {
            max_submits: 0,
            soft_submit_limit: 0,
            max_iterations: 15,
            search_budget: 5,
            ..BASE
        };
    }

    if signal_count > LARGE_SIGNAL_THRESHOLD {
        Budget {
            max_submits: 15,
            soft_submit_limit: 8,
            search_budget: 5,
            idle_rounds_to_exit: 3,
            ..BASE
        }
    } else if signal_count > MEDIUM_SIGNAL_THRESHOLD {
        Budget {
            max_submits: 10,
            soft_submit_limit: 6,
            search_budget: 6,
            ..BASE
        }
    } else {
        BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_only_never_submits() {
        for count in [0, 3, 10, 40] {
            let budget = compute_budget(OutputKind::DigestOnly, count);
            assert_eq!(budget.max_submits, 0);
            assert_eq!(budget.soft_submit_limit, 0);
            assert_eq!(budget.max_iterations, 15);
            assert_eq!(budget.search_budget, 5);
        }
    }

    #[test]
    fn profiles_by_signal_count() {
        let base = compute_budget(OutputKind::Candidates, 5);
        assert_eq!(base, BASE);
        assert_eq!(base.search_budget_grace, 4);
        assert_eq!(base.idle_rounds_to_exit, 2);

        let medium = compute_budget(OutputKind::Candidates, 6);
        assert_eq!(medium.max_submits, 10);
        assert_eq!(medium.soft_submit_limit, 6);
        assert_eq!(medium.search_budget, 6);

        let medium_edge = compute_budget(OutputKind::Dual, 15);
        assert_eq!(medium_edge.max_submits, 10);

        let large = compute_budget(OutputKind::Dual, 16);
        assert_eq!(large.max_submits, 15);
        assert_eq!(large.soft_submit_limit, 8);
        assert_eq!(large.search_budget, 5);
        assert_eq!(large.idle_rounds_to_exit, 3);
        assert_eq!(large.max_iterations, 30);
    }

    #[test]
    fn deterministic() {
        for count in 0..30 {
            assert_eq!(
                compute_budget(OutputKind::Candidates, count),
                compute_budget(OutputKind::Candidates, count)
            );
        }
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_string(&BASE).expect("serialize");
        assert!(json.contains(r#""maxSubmits":6"#));
        assert!(json.contains(r#""idleRoundsToExit":2"#));
    }
}
