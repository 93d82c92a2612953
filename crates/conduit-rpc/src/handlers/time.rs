// crates/conduit-rpc/src/handlers/time.rs
//
// Time stream handler: emits the current time on a fixed interval until the
// caller cancels (or after `limit` values, if given).

use std::time::Duration;

use chrono::{Local, SecondsFormat, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use conduit_core::error::RpcError;

/// Default emission interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Optional knobs for a time stream call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeStreamRequest {
    /// Stop (with a normal completion) after this many values.
    #[serde(default)]
    pub limit: Option<u64>,
}

/// One tick of the time stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeData {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub timestamp: String,
    /// Local wall-clock time for display.
    pub formatted: String,
}

impl TimeData {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            formatted: now
                .with_timezone(&Local)
                .format("%-m/%-d/%Y, %-I:%M:%S %p")
                .to_string(),
        }
    }
}

/// Build the time stream. The first value is produced immediately; later
/// values follow every `interval`. Stops as soon as `cancel` fires.
pub fn time_stream(
    interval: Duration,
    request: TimeStreamRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<TimeData, RpcError>> + Send + 'static {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ticks = stream::unfold((ticker, cancel), |(mut ticker, cancel)| async move {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = ticker.tick() => Some((Ok(TimeData::now()), (ticker, cancel))),
        }
    });

    match request.limit {
        Some(limit) => ticks
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .left_stream(),
        None => ticks.right_stream(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limit_completes_the_stream() {
        let request = TimeStreamRequest { limit: Some(3) };
        let items: Vec<_> = time_stream(Duration::from_millis(1), request, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        for item in items {
            let data = item.unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(&data.timestamp).is_ok());
            assert!(!data.formatted.is_empty());
        }
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let cancel = CancellationToken::new();
        let mut s = Box::pin(time_stream(
            Duration::from_millis(5),
            TimeStreamRequest::default(),
            cancel.clone(),
        ));
        assert!(s.next().await.is_some());
        cancel.cancel();
        assert!(s.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn values_follow_the_interval() {
        let started = tokio::time::Instant::now();
        let request = TimeStreamRequest { limit: Some(3) };
        let items: Vec<_> = time_stream(Duration::from_millis(50), request, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
