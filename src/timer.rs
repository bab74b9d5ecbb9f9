/// Wall-clock timing of data operations with slow-query warnings
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_WARN_THRESHOLD: Duration = Duration::from_millis(1000);

/// Times futures and logs one warning for each that runs past its threshold.
///
/// Timing never changes the outcome: the wrapped future's output, error or not,
/// is returned as is. Clones share the slow-query counter.
#[derive(Debug, Clone)]
pub struct QueryTimer {
    warn_threshold: Duration,
    slow_queries: Arc<AtomicU64>,
}

impl Default for QueryTimer {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_THRESHOLD)
    }
}

impl QueryTimer {
    pub fn new(warn_threshold: Duration) -> Self {
        Self {
            warn_threshold,
            slow_queries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn warn_threshold(&self) -> Duration {
        self.warn_threshold
    }

    /// Operations that exceeded their threshold so far
    pub fn slow_queries(&self) -> u64 {
        self.slow_queries.load(Ordering::Relaxed)
    }

    pub async fn time<F>(&self, operation: &str, fut: F) -> F::Output
    where
        F: Future,
    {
        self.time_with(operation, self.warn_threshold, fut).await
    }

    /// Like `time` with a threshold for this call only
    pub async fn time_with<F>(&self, operation: &str, threshold: Duration, fut: F) -> F::Output
    where
        F: Future,
    {
        let started = Instant::now();
        let output = fut.await;
        let elapsed = started.elapsed();

        if elapsed > threshold {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "Slow query"
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use std::io;
    use std::sync::Mutex;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        fn count(&self, needle: &str) -> usize {
            self.text().lines().filter(|line| line.contains(needle)).count()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture() -> (CapturedLogs, DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_warns_once() {
        let (logs, _guard) = capture();
        let timer = QueryTimer::new(Duration::from_millis(100));

        let value = timer
            .time("read:user:1", async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                42
            })
            .await;

        assert_eq!(value, 42);
        assert_eq!(logs.count("Slow query"), 1);
        let text = logs.text();
        assert!(text.contains("operation=\"read:user:1\""));
        assert!(text.contains("elapsed_ms=15"));
        assert!(text.contains("threshold_ms=100"));
        assert_eq!(timer.slow_queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_is_silent() {
        let (logs, _guard) = capture();
        let timer = QueryTimer::new(Duration::from_millis(100));

        timer
            .time("write", tokio::time::sleep(Duration::from_millis(20)))
            .await;

        assert_eq!(logs.count("Slow query"), 0);
        assert_eq!(timer.slow_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_pass_through_and_are_timed() {
        let (logs, _guard) = capture();
        let timer = QueryTimer::new(Duration::from_millis(10));

        let result: Result<(), DataError> = timer
            .time("write", async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(DataError::query("constraint violation"))
            })
            .await;

        assert!(matches!(result, Err(DataError::Query { .. })));
        assert_eq!(logs.count("Slow query"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_threshold() {
        let (logs, _guard) = capture();
        let timer = QueryTimer::default();
        assert_eq!(timer.warn_threshold(), DEFAULT_WARN_THRESHOLD);

        timer
            .time_with(
                "report",
                Duration::from_millis(5),
                tokio::time::sleep(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(logs.count("Slow query"), 1);

        // Clones share the counter
        assert_eq!(timer.clone().slow_queries(), 1);
    }
}
