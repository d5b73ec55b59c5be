//! Remote List Fetcher: a fresh profile list on every mount, bounded retry, and
//! supersession so a late response from an older mount can never be applied.

use crate::profile::Profile;
use crate::remote::{FetchError, ProfileSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-delay retry bound for list requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Zero is treated as one.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

pub struct RemoteListFetcher {
    source: Arc<dyn ProfileSource>,
    policy: RetryPolicy,
    include_tokens: bool,
    generation: AtomicU64,
}

impl RemoteListFetcher {
    pub fn new(source: Arc<dyn ProfileSource>, policy: RetryPolicy, include_tokens: bool) -> Self {
        Self {
            source,
            policy,
            include_tokens,
            generation: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &Arc<dyn ProfileSource> {
        &self.source
    }

    /// Generation of the most recently started fetch.
    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn superseded(&self, generation: u64) -> bool {
        self.latest_generation() != generation
    }

    /// Fetches the raw remote list. Nothing is cached between calls.
    ///
    /// Transient errors are retried up to the policy bound. Starting another fetch makes
    /// this one return [`FetchError::Superseded`] at its next checkpoint, including when
    /// its response has already arrived.
    pub async fn fetch(&self) -> Result<Vec<Profile>, FetchError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = self.source.list_profiles(self.include_tokens).await;
            if self.superseded(generation) {
                tracing::debug!(generation, attempt, "profile fetch superseded; discarding result");
                return Err(FetchError::Superseded);
            }
            match result {
                Ok(profiles) => {
                    tracing::debug!(generation, attempt, count = profiles.len(), "profile list fetched");
                    return Ok(profiles);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_attempts = attempts,
                        "profile fetch failed; retrying in {:?}",
                        self.policy.delay
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    if self.superseded(generation) {
                        return Err(FetchError::Superseded);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "profile fetch failed");
                    return Err(e);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedSource;
    use super::*;

    fn fetcher(source: Arc<ScriptedSource>) -> RemoteListFetcher {
        RemoteListFetcher::new(source, RetryPolicy::default(), false)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(503),
            Err(503),
            Ok(vec![Profile::new(1, "Alpha")]),
        ]));
        let started = tokio::time::Instant::now();
        let list = fetcher(source.clone()).fetch().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(source.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let source = Arc::new(ScriptedSource::new(vec![Err(500)]));
        let err = fetcher(source.clone()).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 500, .. }));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![Err(404)]));
        let err = fetcher(source.clone()).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_fetch_supersedes_older() {
        let source = Arc::new(
            ScriptedSource::new(vec![
                Ok(vec![Profile::new(1, "Old")]),
                Ok(vec![Profile::new(2, "New")]),
            ])
            .with_delay(Duration::from_millis(100)),
        );
        let fetcher = Arc::new(fetcher(source));
        let first = {
            let f = Arc::clone(&fetcher);
            tokio::spawn(async move { f.fetch().await })
        };
        tokio::task::yield_now().await;
        let second = fetcher.fetch().await.unwrap();
        assert_eq!(second[0].id, 2);
        assert!(matches!(first.await.unwrap(), Err(FetchError::Superseded)));
    }
}
