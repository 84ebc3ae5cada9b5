use super::{Judge, JudgeVerdict};
use crate::config::RetryConfig;
use crate::context::ContextBlock;
use crate::error::JudgeInvocationError;
use crate::query::Query;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Retries transient judge failures with exponential backoff.
///
/// Each failed attempt waits an increasing period before the next one. Stops
/// after `max_attempts` calls, when `max_elapsed_secs` runs out, or at the
/// first permanent error. see <https://docs.rs/backoff/latest/backoff/> for
/// the backoff parameters.
#[derive(Debug, Clone)]
pub struct JudgeWithBackoff<J> {
    inner: J,
    config: RetryConfig,
}

impl<J> JudgeWithBackoff<J> {
    pub fn new(judge: J, config: RetryConfig) -> Self {
        Self {
            inner: judge,
            config,
        }
    }

    fn strategy(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::default()
            .with_initial_interval(Duration::from_millis(self.config.initial_interval_ms))
            .with_multiplier(self.config.multiplier)
            .with_randomization_factor(self.config.randomization_factor)
            .with_max_elapsed_time(Some(Duration::from_secs(self.config.max_elapsed_secs)))
            .build()
    }
}

#[async_trait]
impl<J: Judge> Judge for JudgeWithBackoff<J> {
    async fn judge(
        &self,
        query: &Query,
        context: &ContextBlock,
    ) -> Result<JudgeVerdict, JudgeInvocationError> {
        let max_attempts = self.config.max_attempts.max(1);
        let inner = &self.inner;
        let mut attempts = 0u32;

        let op = || {
            attempts += 1;
            let attempt = attempts;
            async move {
                inner.judge(query, context).await.map_err(|err| {
                    if !err.is_transient() || attempt >= max_attempts {
                        return backoff::Error::Permanent(err);
                    }

                    warn!(
                        query = query.position,
                        attempt,
                        max_attempts,
                        error = %err,
                        "transient judge failure, retrying"
                    );
                    match err.retry_after() {
                        Some(wait) => backoff::Error::retry_after(err, wait),
                        None => backoff::Error::transient(err),
                    }
                })
            }
        };

        backoff::future::retry(self.strategy(), op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerdictParseError;
    use crate::judge::Score;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Failure {
        Transient,
        RateLimited,
        Permanent,
    }

    #[derive(Debug, Clone)]
    struct FlakyJudge {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        failure: Failure,
    }

    impl FlakyJudge {
        fn new(fail_first: usize, failure: Failure) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first,
                failure,
            }
        }
    }

    #[async_trait]
    impl Judge for FlakyJudge {
        async fn judge(
            &self,
            _query: &Query,
            _context: &ContextBlock,
        ) -> Result<JudgeVerdict, JudgeInvocationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(match self.failure {
                    Failure::Transient => JudgeInvocationError::Network("connection reset".into()),
                    Failure::RateLimited => JudgeInvocationError::RateLimited {
                        message: "429".into(),
                        retry_after: Some(Duration::from_millis(5)),
                    },
                    Failure::Permanent => {
                        JudgeInvocationError::InvalidVerdict(VerdictParseError::MissingScore)
                    }
                });
            }
            Ok(JudgeVerdict::new(Score::new(4).unwrap(), Some("ok".into())))
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_interval_ms: 5,
            multiplier: 1.5,
            randomization_factor: 0.0,
            max_elapsed_secs: 10,
        }
    }

    async fn run(judge: &JudgeWithBackoff<FlakyJudge>) -> Result<JudgeVerdict, JudgeInvocationError> {
        judge
            .judge(&Query::new(0, "q"), &ContextBlock::empty())
            .await
    }

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let flaky = FlakyJudge::new(2, Failure::Transient);
        let calls = flaky.calls.clone();
        let judge = JudgeWithBackoff::new(flaky, fast_retry());

        let verdict = run(&judge).await.unwrap();

        assert_eq!(verdict.score.value(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let flaky = FlakyJudge::new(10, Failure::Transient);
        let calls = flaky.calls.clone();
        let judge = JudgeWithBackoff::new(flaky, fast_retry());

        let err = run(&judge).await.unwrap_err();

        assert!(matches!(err, JudgeInvocationError::Network(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let flaky = FlakyJudge::new(1, Failure::Permanent);
        let calls = flaky.calls.clone();
        let judge = JudgeWithBackoff::new(flaky, fast_retry());

        let err = run(&judge).await.unwrap_err();

        assert!(matches!(err, JudgeInvocationError::InvalidVerdict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_is_retried() {
        let flaky = FlakyJudge::new(1, Failure::RateLimited);
        let calls = flaky.calls.clone();
        let judge = JudgeWithBackoff::new(flaky, fast_retry());

        assert!(run(&judge).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_attempt_config_never_retries() {
        let flaky = FlakyJudge::new(1, Failure::Transient);
        let calls = flaky.calls.clone();
        let config = RetryConfig {
            max_attempts: 1,
            ..fast_retry()
        };
        let judge = JudgeWithBackoff::new(flaky, config);

        assert!(run(&judge).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
