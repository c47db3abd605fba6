//! Opening connection handles with bounded, cancellable retries.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::driver::{ConnectProperties, Driver, DriverError, RawConnection};
use crate::{Error, Result};

/// Attempts on which the whole error chain is logged.
const VERBOSE_EVERY: u32 = 3;

/// Exponential backoff schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(initial_wait: Duration, max_wait: Duration, max_attempts: u32) -> Self {
        Self {
            initial_wait,
            max_wait,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Wait after the `attempt`-th failure (1-based): doubles each time, capped
    /// at `max_wait`.
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_wait
            .saturating_mul(1_u32 << exponent)
            .min(self.max_wait)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30 * 60), 12)
    }
}

/// Opens [`ConnectionHandle`]s through an injected [`Driver`].
#[derive(Clone)]
pub struct Connector {
    driver: Arc<dyn Driver>,
    properties: ConnectProperties,
    schema: Option<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl Connector {
    pub fn new(
        driver: Arc<dyn Driver>,
        properties: ConnectProperties,
        schema: Option<String>,
    ) -> Self {
        Self {
            driver,
            properties,
            schema,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share an externally owned token; cancelling it interrupts retry waits.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn properties(&self) -> &ConnectProperties {
        &self.properties
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Open a handle in the given commit mode, retrying failed connects.
    pub async fn connect(&self, auto_commit: bool) -> Result<ConnectionHandle> {
        debug!(
            driver = self.driver.name(),
            url = %self.properties.url(),
            auto_commit,
            "Connecting"
        );
        let raw = self.connect_with_retry().await?;
        ConnectionHandle::open(raw, auto_commit, self.schema.as_deref()).await
    }

    /// Surfaces the first failure once attempts run out; the last one is only
    /// logged.
    async fn connect_with_retry(&self) -> Result<Box<dyn RawConnection>> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut first_error: Option<DriverError> = None;
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt += 1;
            let err = match self.driver.connect(&self.properties).await {
                Ok(raw) => return Ok(raw),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    "Giving up connecting to {}: {}",
                    self.properties.url(),
                    describe_chain(err.as_ref())
                );
                return Err(Error::Connection {
                    source: first_error.unwrap_or(err),
                });
            }

            let wait = self.retry.wait_for(attempt);
            log_retry(attempt, max_attempts, wait, &err);
            if first_error.is_none() {
                first_error = Some(err);
            }
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(attempt, "Connection retry cancelled");
                    return Err(Error::Cancelled);
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}

fn log_retry(attempt: u32, max_attempts: u32, wait: Duration, err: &DriverError) {
    if attempt % VERBOSE_EVERY == 0 {
        warn!(
            attempt,
            max_attempts,
            "Connection attempt failed, retrying in {wait:?}: {}",
            describe_chain(err.as_ref())
        );
    } else {
        info!(
            attempt,
            max_attempts, "Connection attempt failed, retrying in {wait:?}: {err}"
        );
    }
}

/// `outer: inner: ...` rendering of an error and its sources.
fn describe_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}


#[cfg(test)]
mod log_tests {
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("attempt {0} refused")]
    struct Refused(u32, #[source] io::Error);

    #[derive(Default)]
    struct RefusingDriver {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Driver for RefusingDriver {
        async fn connect(
            &self,
            _properties: &ConnectProperties,
        ) -> std::result::Result<Box<dyn RawConnection>, DriverError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(Box::new(Refused(attempt, io::Error::other("connection refused"))))
        }

        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_third_retry_logs_the_whole_chain() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let properties = ConnectProperties::new("memory", 5432, "test", "loader", "");
        let connector = Connector::new(Arc::new(RefusingDriver::default()), properties, None)
            .with_retry_policy(RetryPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(1800),
                7,
            ));
        let err = connector.connect(true).await.err().unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(err.to_string(), "attempt 1 refused");

        let output = logs.contents();
        let retries: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("retrying in"))
            .collect();
        assert_eq!(retries.len(), 6, "{output}");
        for (index, line) in retries.iter().enumerate() {
            let attempt = index + 1;
            if attempt % 3 == 0 {
                assert!(line.contains("WARN"), "{line}");
                assert!(
                    line.contains(&format!("attempt {attempt} refused: connection refused")),
                    "{line}"
                );
            } else {
                assert!(line.contains("INFO"), "{line}");
                assert!(line.contains(&format!("attempt {attempt} refused")), "{line}");
                assert!(!line.contains("connection refused"), "{line}");
            }
        }

        let giving_up = output
            .lines()
            .find(|line| line.contains("Giving up"))
            .unwrap();
        assert!(giving_up.contains("WARN"), "{giving_up}");
        assert!(
            giving_up.contains("attempt 7 refused: connection refused"),
            "{giving_up}"
        );
    }
}
