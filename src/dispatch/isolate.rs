//! The per-unit fault-isolation combinator.
//!
//! Every unit runs through [`isolate`], which turns errors, panics and
//! timeouts into an [`Outcome`]. Nothing a target does can escape it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Outcome;
use crate::error::{BatchError, Result};
use crate::target::TargetResponse;

/// Runs `call` under a deadline, catching errors and panics.
///
/// When the deadline passes, `cancel` is fired for targets that can observe
/// it and the call is dropped; whatever it would have produced is discarded.
pub async fn isolate<F>(deadline: Duration, cancel: CancellationToken, call: F) -> Outcome
where
    F: Future<Output = Result<TargetResponse>>,
{
    let guarded = AssertUnwindSafe(call).catch_unwind();

    match tokio::time::timeout(deadline, guarded).await {
        Ok(Ok(Ok(response))) => Outcome::Success(response),
        Ok(Ok(Err(e))) => Outcome::Failure(e),
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            warn!("Isolated panic in target call: {message}");
            Outcome::Failure(BatchError::target(format!("target panicked: {message}")))
        }
        Err(_) => {
            cancel.cancel();
            Outcome::TimedOut
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_success_passes_through() {
        let outcome = isolate(DEADLINE, CancellationToken::new(), async {
            Ok(TargetResponse::empty("done"))
        })
        .await;
        match outcome {
            Outcome::Success(response) => assert_eq!(response.details, "done"),
            other => panic!("Expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_becomes_failure() {
        let outcome = isolate(DEADLINE, CancellationToken::new(), async {
            Err(BatchError::target("refused"))
        })
        .await;
        assert!(matches!(outcome, Outcome::Failure(BatchError::Target(ref m)) if m == "refused"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let outcome = isolate(DEADLINE, CancellationToken::new(), async {
            if DEADLINE > Duration::ZERO {
                panic!("malformed response");
            }
            Ok(TargetResponse::empty("unreachable"))
        })
        .await;
        match outcome {
            Outcome::Failure(e) => assert!(e.to_string().contains("malformed response")),
            other => panic!("Expected Failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let cancel = CancellationToken::new();
        let outcome = isolate(Duration::from_millis(20), cancel.clone(), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(TargetResponse::empty("too late"))
        })
        .await;
        assert!(matches!(outcome, Outcome::TimedOut));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
