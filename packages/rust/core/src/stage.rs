//! Uniform attempt / fallback template for per-dimension stages.

use std::future::Future;

use tracing::warn;

use repolore_shared::{RepoloreError, Result};

/// The fallible steps a dimension goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Evidence,
    Signals,
    Production,
}

impl Stage {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Evidence => "evidence",
            Self::Signals => "signals",
            Self::Production => "production",
        }
    }
}

/// How a stage settled.
#[derive(Debug)]
pub(crate) enum StageOutcome<T> {
    /// The primary attempt succeeded.
    Done(T),
    /// The primary attempt failed and the fallback produced a value.
    Recovered { value: T, cause: RepoloreError },
    /// Nothing produced a value.
    Failed(RepoloreError),
}

impl<T> StageOutcome<T> {
    #[cfg(test)]
    pub(crate) fn value(self) -> Option<T> {
        match self {
            Self::Done(v) | Self::Recovered { value: v, .. } => Some(v),
            Self::Failed(_) => None,
        }
    }
}

/// Run `attempt`; on failure log it and run `fallback` instead.
///
/// When the fallback fails too, the original cause is reported.
pub(crate) async fn attempt_with_fallback<T, A, F, B>(
    stage: Stage,
    dim_id: &str,
    attempt: A,
    fallback: F,
) -> StageOutcome<T>
where
    A: Future<Output = Result<T>>,
    F: FnOnce() -> B,
    B: Future<Output = Result<T>>,
{
    let cause = match attempt.await {
        Ok(value) => return StageOutcome::Done(value),
        Err(e) => e,
    };
    warn!(stage = stage.name(), dimension = dim_id, error = %cause, "stage failed, using fallback");

    match fallback().await {
        Ok(value) => StageOutcome::Recovered { value, cause },
        Err(e) => {
            warn!(stage = stage.name(), dimension = dim_id, error = %e, "fallback failed too");
            StageOutcome::Failed(cause)
        }
    }
}

/// Run `attempt` with no fallback, logging a failure.
pub(crate) async fn attempt<T, A>(stage: Stage, dim_id: &str, attempt: A) -> StageOutcome<T>
where
    A: Future<Output = Result<T>>,
{
    match attempt.await {
        Ok(value) => StageOutcome::Done(value),
        Err(e) => {
            warn!(stage = stage.name(), dimension = dim_id, error = %e, "stage failed");
            StageOutcome::Failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_skips_fallback() {
        let outcome = attempt_with_fallback(
            Stage::Signals,
            "a",
            async { Ok::<_, RepoloreError>(1) },
            || async { Err(RepoloreError::Signal("fallback ran".into())) },
        )
        .await;
        assert!(matches!(outcome, StageOutcome::Done(1)));
    }

    #[tokio::test]
    async fn failure_runs_fallback_and_keeps_cause() {
        let outcome: StageOutcome<i32> = attempt_with_fallback(
            Stage::Signals,
            "a",
            async { Err(RepoloreError::Signal("bad".into())) },
            || async { Ok(2) },
        )
        .await;
        match outcome {
            StageOutcome::Recovered { value, cause } => {
                assert_eq!(value, 2);
                assert!(cause.to_string().contains("bad"));
            }
            other => panic!("expected Recovered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn double_failure_reports_original_cause() {
        let outcome: StageOutcome<u8> = attempt_with_fallback(
            Stage::Evidence,
            "a",
            async { Err(RepoloreError::evidence("a", "first")) },
            || async { Err(RepoloreError::evidence("a", "second")) },
        )
        .await;
        match outcome {
            StageOutcome::Failed(e) => assert!(e.to_string().contains("first")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_attempt() {
        let ok = attempt(Stage::Production, "a", async { Ok::<_, RepoloreError>("x") }).await;
        assert_eq!(ok.value(), Some("x"));
        let failed: StageOutcome<()> = attempt(Stage::Evidence, "a", async {
            Err(RepoloreError::evidence("a", "boom"))
        })
        .await;
        assert!(failed.value().is_none());
    }
}
