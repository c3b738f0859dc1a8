// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded exponential backoff for transient backend failures

use crate::config::RetryConfig;
use crate::error::BackendError;
use backon::{ExponentialBuilder, Retryable};
use diagnostics::*;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Outcome of a retried call plus the number of attempts it took
pub(crate) struct Attempted<T> {
    pub result: Result<T, BackendError>,
    pub attempts: usize,
}

fn backoff(policy: &RetryConfig, max_attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(policy.min_delay())
        .with_max_delay(policy.max_delay())
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Run `op` up to `max_attempts` times, retrying only transient failures
pub(crate) async fn with_retry<T, F, Fut>(
    what: &str,
    policy: &RetryConfig,
    max_attempts: usize,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = AtomicUsize::new(0);
    let result = (|| {
        attempts.fetch_add(1, Ordering::Relaxed);
        op()
    })
    .retry(backoff(policy, max_attempts))
    .sleep(tokio::time::sleep)
    .when(BackendError::is_transient)
    .notify(|err: &BackendError, delay: Duration| {
        let error = err.to_string();
        let delay_ms = delay.as_millis() as u64;
        log_warn!(
            "retrying {what} in {delay_ms}ms after transient failure: {error}",
            what: what,
            delay_ms: delay_ms,
            error: error.as_str()
        );
    })
    .await;

    Attempted {
        result,
        attempts: attempts.load(Ordering::Relaxed),
    }
}

/// [`with_retry`] using the policy's own attempt budget, dropping the count
pub(crate) async fn retry_backend<T, F, Fut>(
    what: &str,
    policy: &RetryConfig,
    op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    with_retry(what, policy, policy.max_attempts, op).await.result
}
