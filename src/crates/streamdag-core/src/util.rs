//! Small helpers shared across the engine.

use std::time::Duration;

/// Sleep for `seconds`, or forever when `seconds` is negative.
///
/// Call sites use a negative duration to disable a timeout without changing
/// the shape of their select.
pub async fn after_or_never(seconds: i64) {
    if seconds < 0 {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(Duration::from_secs(seconds as u64)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_fires_immediately() {
        tokio::time::timeout(Duration::from_millis(100), after_or_never(0))
            .await
            .expect("zero-second timer must fire");
    }

    #[tokio::test]
    async fn test_negative_never_fires() {
        let timed = tokio::time::timeout(Duration::from_millis(30), after_or_never(-1)).await;
        assert!(timed.is_err(), "negative duration must block forever");
    }
}
