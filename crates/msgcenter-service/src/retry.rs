//! Bounded retry with randomized backoff and reconnect between attempts.

use std::future::Future;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::handler::Handler;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_BACKOFF_MS)
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
        }
    }

    /// A single attempt, no backoff.
    pub const fn once() -> Self {
        Self::new(1, 0)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// Backoff where each wait is the previous one plus up to twice a random
/// share of it, so every step grows by a factor in `[1, 3]`.
pub struct Backoff {
    current: Duration,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self {
            current: initial,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let prev_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let extra_ms = if prev_ms == 0 {
            0
        } else {
            self.rng.gen_range(0..=prev_ms)
        };
        self.current = delay.saturating_add(Duration::from_millis(extra_ms.saturating_mul(2)));
        delay
    }
}

/// Run `op` under `policy`.
///
/// Returns `None` when `cancel` fires or the operation reports
/// [`Error::Cancelled`]; nothing must be reported to the caller in that case.
/// Retryable failures sleep, grow the backoff and call `reconnect` before the
/// next attempt. Non-retryable failures, from `op` or from `reconnect`, end
/// the loop immediately.
pub async fn run_with_retry<Op, OpFut, Re, ReFut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: Op,
    mut reconnect: Re,
) -> Option<Result<()>>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<()>>,
    Re: FnMut() -> ReFut,
    ReFut: Future<Output = Result<()>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = Backoff::new(policy.initial_backoff());
    let mut reconnect_error: Option<Error> = None;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            r = op() => r,
            _ = cancel.cancelled() => return None,
        };

        let err = match result {
            Ok(()) => return Some(Ok(())),
            Err(Error::Cancelled) => return None,
            Err(e) if !e.is_retryable() => return Some(Err(e)),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            // A failed reconnect explains a NotConnected better than itself.
            let last = match (err, reconnect_error) {
                (Error::NotConnected, Some(re)) => re,
                (err, _) => err,
            };
            tracing::warn!(attempts = attempt, error = %last, "giving up after retries");
            return Some(Err(last));
        }

        let delay = backoff.next_delay();
        tracing::info!(
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return None,
        }

        let reconnected = tokio::select! {
            r = reconnect() => r,
            _ = cancel.cancelled() => return None,
        };
        match reconnected {
            Ok(()) => reconnect_error = None,
            Err(Error::Cancelled) => return None,
            Err(e) if !e.is_retryable() => return Some(Err(e)),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "reconnect before retry failed");
                reconnect_error = Some(e);
            }
        }
    }
}

/// Deliver the outcome of one correlated operation.
///
/// Ids above zero always get `on_result`; otherwise only failures are
/// reported, through `on_error`.
pub fn report(handler: &dyn Handler, id: i64, result: &Result<()>) {
    let error = result.as_ref().err();
    if id > 0 {
        handler.on_result(id, error);
    } else if let Some(e) = error {
        handler.on_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn net() -> Error {
        Error::Network("connection reset".into())
    }

    #[test]
    fn backoff_grows_by_at_most_three_times() {
        let mut backoff = Backoff::new(Duration::from_millis(1000));
        let mut prev = backoff.next_delay();
        assert_eq!(prev, Duration::from_millis(1000));
        for _ in 0..8 {
            let next = backoff.next_delay();
            assert!(next >= prev, "{next:?} < {prev:?}");
            assert!(next <= prev * 3, "{next:?} > 3 * {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn zero_backoff_stays_zero() {
        let mut backoff = Backoff::new(Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1000);

        let outcome = run_with_retry(
            &policy,
            &CancellationToken::new(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(net())
                } else {
                    Ok(())
                }
            },
            || async {
                reconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(outcome, Some(Ok(())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_network_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 10);

        let outcome = run_with_retry(
            &policy,
            &CancellationToken::new(),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network(format!("attempt {n}")))
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(outcome, Some(Err(Error::Network("attempt 2".into()))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);

        let outcome = run_with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth("rejected".into()))
            },
            || async {
                reconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(outcome, Some(Err(Error::Auth("rejected".into()))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_during_reconnect_stops_the_loop() {
        let calls = AtomicU32::new(0);

        let outcome = run_with_retry(
            &RetryPolicy::new(5, 10),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(net())
            },
            || async { Err(Error::Auth("token expired".into())) },
        )
        .await;

        assert_eq!(outcome, Some(Err(Error::Auth("token expired".into()))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_explains_not_connected() {
        let outcome = run_with_retry(
            &RetryPolicy::new(2, 10),
            &CancellationToken::new(),
            || async { Err(Error::NotConnected) },
            || async { Err(Error::Network("refused".into())) },
        )
        .await;

        assert_eq!(outcome, Some(Err(Error::Network("refused".into()))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_reports_nothing() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let outcome = run_with_retry(
            &RetryPolicy::new(3, 60_000),
            &cancel,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                cancel.cancel();
                Err(net())
            },
            || async { Ok(()) },
        )
        .await;

        assert_eq!(outcome, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_error_reports_nothing() {
        let outcome = run_with_retry(
            &RetryPolicy::default(),
            &CancellationToken::new(),
            || async { Err(Error::Cancelled) },
            || async { Ok(()) },
        )
        .await;
        assert_eq!(outcome, None);
    }

    #[derive(Default)]
    struct Recorder {
        results: Mutex<Vec<(i64, Option<Error>)>>,
        errors: Mutex<Vec<Error>>,
    }

    impl Handler for Recorder {
        fn on_result(&self, id: i64, error: Option<&Error>) {
            self.results.lock().unwrap().push((id, error.cloned()));
        }

        fn on_error(&self, error: &Error) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn report_routes_by_correlation_id() {
        let recorder = Recorder::default();

        report(&recorder, 7, &Ok(()));
        report(&recorder, 8, &Err(net()));
        report(&recorder, 0, &Ok(()));
        report(&recorder, -1, &Err(Error::Auth("no".into())));

        let results = recorder.results.lock().unwrap();
        assert_eq!(*results, vec![(7, None), (8, Some(net()))]);
        let errors = recorder.errors.lock().unwrap();
        assert_eq!(*errors, vec![Error::Auth("no".into())]);
    }
}
