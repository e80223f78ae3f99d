//! Tests for `RetryPolicy`: backoff timing, exclusions, timeouts.

use std::error::Error as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use skjold::{ErrorKind, Result, RetryConfig, RetryPolicy, SkjoldError};

/// Operation that fails `failures` times with `fail_with`, then returns the call count.
struct FailThenSucceed {
    failures: u32,
    fail_with: fn() -> SkjoldError,
    calls: AtomicU32,
    started: Mutex<Vec<Instant>>,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn() -> SkjoldError) -> Arc<Self> {
        Arc::new(Self {
            failures,
            fail_with,
            calls: AtomicU32::new(0),
            started: Mutex::new(Vec::new()),
        })
    }

    async fn call(&self) -> Result<u32> {
        self.started.lock().unwrap().push(Instant::now());
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err((self.fail_with)())
        } else {
            Ok(n)
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

fn operation_error() -> SkjoldError {
    SkjoldError::Operation("connection reset".into())
}

#[tokio::test(start_paused = true)]
async fn success_after_two_failures_backs_off_exponentially() {
    let op = FailThenSucceed::new(2, operation_error);
    let policy = RetryPolicy::default();

    let result = policy.execute(&[], || op.call()).await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(op.call_count(), 3);
    assert_eq!(op.gaps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
}

#[tokio::test(start_paused = true)]
async fn first_success_does_not_retry() {
    let op = FailThenSucceed::new(0, operation_error);
    let start = Instant::now();
    let result = RetryPolicy::default().execute(&[], || op.call()).await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_wrap_last_error() {
    let op = FailThenSucceed::new(u32::MAX, operation_error);
    let err = RetryPolicy::default()
        .execute(&[], || op.call())
        .await
        .unwrap_err();

    assert_eq!(op.call_count(), 3);
    match &err {
        SkjoldError::Generation { attempts, source } => {
            assert_eq!(*attempts, 3);
            assert_eq!(source.kind(), ErrorKind::Operation);
        }
        other => panic!("expected Generation, got {other:?}"),
    }
    assert!(err.to_string().contains("failed after 3 attempts"));
    assert!(err.to_string().contains("connection reset"));
    assert!(err.source().is_some());
}

#[tokio::test(start_paused = true)]
async fn delay_is_capped_at_max_delay() {
    let op = FailThenSucceed::new(4, operation_error);
    let policy = RetryPolicy::new(
        RetryConfig::new()
            .max_attempts(5)
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(5)),
    );

    policy.execute(&[], || op.call()).await.unwrap();
    assert_eq!(
        op.gaps(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(5),
            Duration::from_secs(5),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn excluded_kind_is_not_retried() {
    let op = FailThenSucceed::new(1, || SkjoldError::InvalidResponse("bad json".into()));
    let err = RetryPolicy::default()
        .execute(&[ErrorKind::InvalidResponse], || op.call())
        .await
        .unwrap_err();

    assert_eq!(op.call_count(), 1);
    assert!(matches!(err, SkjoldError::InvalidResponse(ref m) if m == "bad json"));
}

#[tokio::test(start_paused = true)]
async fn non_excluded_kind_is_still_retried() {
    let op = FailThenSucceed::new(1, operation_error);
    let result = RetryPolicy::default()
        .execute(&[ErrorKind::InvalidResponse], || op.call())
        .await;
    assert_eq!(result.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out_and_is_retried() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(RetryConfig::new().timeout(Duration::from_secs(1)));

    let result = policy
        .execute(&[], || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(n)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn every_attempt_timing_out_reports_timeout_cause() {
    let policy = RetryPolicy::new(
        RetryConfig::new()
            .max_attempts(2)
            .timeout(Duration::from_millis(500)),
    );

    let err = policy
        .execute(&[], || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Generation);
    assert!(matches!(err.root_cause(), SkjoldError::Timeout(d) if *d == Duration::from_millis(500)));
}

#[tokio::test(start_paused = true)]
async fn timeout_can_be_excluded() {
    let calls = AtomicU32::new(0);
    let policy = RetryPolicy::new(RetryConfig::new().timeout(Duration::from_secs(1)));

    let err = policy
        .execute(&[ErrorKind::Timeout], || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn disabled_config_makes_one_attempt() {
    let op = FailThenSucceed::new(1, operation_error);
    let err = RetryPolicy::new(RetryConfig::disabled())
        .execute(&[], || op.call())
        .await
        .unwrap_err();
    assert_eq!(op.call_count(), 1);
    assert!(matches!(err, SkjoldError::Generation { attempts: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn wrapped_operation_can_be_called_repeatedly() {
    let op = FailThenSucceed::new(1, operation_error);
    let wrapped = RetryPolicy::default()
        .wrap(|| op.call())
        .excluding([ErrorKind::InvalidResponse]);

    assert_eq!(wrapped.call().await.unwrap(), 2);
    assert_eq!(wrapped.call().await.unwrap(), 3);
}
