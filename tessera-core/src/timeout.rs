//! Deadline helper for async operations

use crate::{TesseraError, TesseraResult};
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline. An elapsed deadline becomes `TesseraError::Timeout`.
///
/// The inner future is dropped on timeout, which is how operations are
/// cancelled. Side effects it already produced are not rolled back.
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> TesseraResult<T>
where
    F: Future<Output = TesseraResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(TesseraError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let result = with_timeout("fast", Duration::from_millis(100), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_is_timeout() {
        let result: TesseraResult<()> = with_timeout("slow", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("slow"));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: TesseraResult<()> = with_timeout("failing", Duration::from_secs(1), async {
            Err(TesseraError::storage("memory", "down"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::StorageUnavailable);
    }
}
