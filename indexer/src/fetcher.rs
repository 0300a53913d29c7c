use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::{Address, Bytes};
use tokio::{
    sync::Mutex,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, warn};

use crate::{
    chain::{EndpointRotation, LogFilter, LogSource},
    error::{FetchError, SourceError},
    meter::CostMeter,
    types::LogRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Total attempts per logical call, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub min_interval: Duration,
}

impl FetchPolicy {
    /// Delay before the given zero-based retry: `base_delay * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            min_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub attempts: u32,
}

/// Spaces and retries calls against an ordered set of log-source endpoints.
///
/// Each instance owns its own call clock, so independent workers never
/// throttle one another.
pub struct RateLimitedFetcher {
    sources: Vec<Arc<dyn LogSource>>,
    rotation: EndpointRotation,
    policy: FetchPolicy,
    last_call: Mutex<Option<Instant>>,
    meter: Arc<CostMeter>,
}

impl RateLimitedFetcher {
    /// `sources` must already be ordered as configured; `rotation` is built
    /// from their endpoint labels and the preferred pattern.
    pub fn new(
        sources: Vec<Arc<dyn LogSource>>,
        preferred_pattern: Option<&str>,
        policy: FetchPolicy,
    ) -> Self {
        let labels: Vec<&str> = sources.iter().map(|s| s.endpoint()).collect();
        let rotation = EndpointRotation::new(&labels, preferred_pattern);
        Self {
            sources,
            rotation,
            policy,
            last_call: Mutex::new(None),
            meter: Arc::new(CostMeter::new()),
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Requests sent by this fetcher so far, priced per method.
    pub fn meter(&self) -> &Arc<CostMeter> {
        &self.meter
    }

    pub async fn fetch_logs(&self, filter: &LogFilter) -> Result<Fetched<Vec<LogRecord>>, FetchError> {
        self.call("eth_getLogs", |source| {
            let filter = filter.clone();
            async move { source.get_logs(&filter).await }
        })
        .await
    }

    pub async fn head_block(&self) -> Result<Fetched<u64>, FetchError> {
        self.call("eth_blockNumber", |source| async move { source.head_block().await })
            .await
    }

    pub async fn block_timestamp(&self, block_number: u64) -> Result<Fetched<u64>, FetchError> {
        self.call("eth_getBlockByNumber", |source| async move {
            source.block_timestamp(block_number).await
        })
        .await
    }

    pub async fn eth_call(&self, to: Address, input: Bytes) -> Result<Fetched<Bytes>, FetchError> {
        self.call("eth_call", |source| {
            let input = input.clone();
            async move { source.call(to, input).await }
        })
        .await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, request: F) -> Result<Fetched<T>, FetchError>
    where
        F: Fn(Arc<dyn LogSource>) -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        if self.rotation.is_empty() {
            return Err(FetchError::NoEndpoints);
        }

        let attempts = self.policy.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.backoff(attempt - 1);
                debug!(op, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                sleep(delay).await;
            }

            let mut tried = Vec::with_capacity(self.rotation.len());
            while let Some(index) = self.rotation.pick_next(&tried) {
                tried.push(index);
                let source = self.sources[index].clone();
                let endpoint = source.endpoint().to_string();

                self.pace().await;
                self.meter.track(op);
                match request(source).await {
                    Ok(value) => {
                        return Ok(Fetched {
                            value,
                            attempts: attempt + 1,
                        });
                    }
                    Err(err) if !err.is_retryable() => {
                        warn!(op, %endpoint, error = %err, "non-retryable source error");
                        return Err(FetchError::NonRetryable {
                            op,
                            endpoint,
                            source: err,
                        });
                    }
                    Err(err) => {
                        warn!(op, %endpoint, attempt = attempt + 1, error = %err, "transient source error");
                        last_error = Some(err);
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            op,
            attempts,
            last: last_error.unwrap_or_else(|| SourceError::Transport("no attempt made".into())),
        })
    }

    /// Waits out the remainder of `min_interval` since this instance's previous call.
    async fn pace(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.policy.min_interval;
            if Instant::now() < ready_at {
                sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
    };

    use alloy::primitives::B256;
    use async_trait::async_trait;

    use super::*;

    struct ScriptedSource {
        label: String,
        script: StdMutex<VecDeque<Result<u64, SourceError>>>,
        calls: StdMutex<Vec<Instant>>,
    }

    impl ScriptedSource {
        fn new(label: &str, script: Vec<Result<u64, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_string(),
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self) -> Result<u64, SourceError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(1))
        }
    }

    #[async_trait]
    impl LogSource for ScriptedSource {
        fn endpoint(&self) -> &str {
            &self.label
        }

        async fn head_block(&self) -> Result<u64, SourceError> {
            self.next()
        }

        async fn get_logs(&self, _filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
            self.next().map(|_| Vec::new())
        }

        async fn block_timestamp(&self, _block_number: u64) -> Result<u64, SourceError> {
            self.next()
        }

        async fn call(&self, _to: Address, input: Bytes) -> Result<Bytes, SourceError> {
            self.next().map(|_| input)
        }
    }

    fn server_error() -> Result<u64, SourceError> {
        Err(SourceError::Http {
            status: 500,
            body: "internal error".into(),
        })
    }

    fn policy(min_interval_ms: u64) -> FetchPolicy {
        FetchPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = FetchPolicy {
            max_delay: Duration::from_millis(5000),
            ..policy(0)
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(5000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_server_errors_then_success_takes_three_seconds() {
        let source = ScriptedSource::new("https://node", vec![server_error(), server_error(), Ok(42)]);
        let fetcher = RateLimitedFetcher::new(vec![source.clone() as Arc<dyn LogSource>], None, policy(100));

        let started = Instant::now();
        let fetched = fetcher.head_block().await.unwrap();

        assert_eq!(fetched.value, 42);
        assert_eq!(fetched.attempts, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_without_retry() {
        let source = ScriptedSource::new(
            "https://node",
            vec![Err(SourceError::Http {
                status: 400,
                body: "bad range".into(),
            })],
        );
        let fetcher = RateLimitedFetcher::new(vec![source.clone() as Arc<dyn LogSource>], None, policy(0));

        let err = fetcher.head_block().await.unwrap_err();
        assert!(matches!(err, FetchError::NonRetryable { .. }));
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_retries() {
        let source = ScriptedSource::new(
            "https://node",
            vec![server_error(), server_error(), server_error(), Ok(7)],
        );
        let fetcher = RateLimitedFetcher::new(vec![source.clone() as Arc<dyn LogSource>], None, policy(0));

        let err = fetcher.head_block().await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_to_next_endpoint_within_one_attempt() {
        let fallback = ScriptedSource::new("https://fallback", vec![Ok(9)]);
        let preferred = ScriptedSource::new(
            "https://preferred",
            vec![Err(SourceError::Rpc {
                code: 429,
                message: "rate limited".into(),
            })],
        );
        let fetcher = RateLimitedFetcher::new(
            vec![fallback.clone() as Arc<dyn LogSource>, preferred.clone()],
            Some("preferred"),
            policy(0),
        );

        let started = Instant::now();
        let fetched = fetcher.block_timestamp(1).await.unwrap();
        assert_eq!(fetched.value, 9);
        assert_eq!(fetched.attempts, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(preferred.calls().len(), 1);
        assert_eq!(fallback.calls().len(), 1);

        // No sticky failover: the next call starts at the preferred endpoint again.
        fetcher.block_timestamp(2).await.unwrap();
        assert_eq!(preferred.calls().len(), 2);
        assert_eq!(fallback.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_spaced_by_min_interval() {
        let source = ScriptedSource::new("https://node", Vec::new());
        let fetcher = RateLimitedFetcher::new(vec![source.clone() as Arc<dyn LogSource>], None, policy(500));
        let filter = LogFilter {
            addresses: vec![Address::ZERO],
            topics: vec![B256::ZERO],
            token_ids: Vec::new(),
            from_block: 1,
            to_block: 2,
        };

        for _ in 0..3 {
            fetcher.fetch_logs(&filter).await.unwrap();
        }

        let calls = source.calls();
        assert_eq!(calls[1] - calls[0], Duration::from_millis(500));
        assert_eq!(calls[2] - calls[1], Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_fetchers_do_not_share_a_clock() {
        let a = ScriptedSource::new("https://a", Vec::new());
        let b = ScriptedSource::new("https://b", Vec::new());
        let first = RateLimitedFetcher::new(vec![a.clone() as Arc<dyn LogSource>], None, policy(500));
        let second = RateLimitedFetcher::new(vec![b.clone() as Arc<dyn LogSource>], None, policy(500));

        let started = Instant::now();
        first.head_block().await.unwrap();
        second.head_block().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meter_counts_every_endpoint_request() {
        let source = ScriptedSource::new("https://node", vec![server_error(), Ok(5)]);
        let fetcher = RateLimitedFetcher::new(vec![source.clone() as Arc<dyn LogSource>], None, policy(0));

        fetcher.head_block().await.unwrap();
        let echoed = fetcher
            .eth_call(Address::ZERO, Bytes::from_static(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(echoed.value, Bytes::from_static(&[1, 2]));

        let summary = fetcher.meter().summary();
        assert_eq!(summary.by_method["eth_blockNumber"].count, 2);
        assert_eq!(summary.by_method["eth_call"].count, 1);
        assert_eq!(summary.total_credits, 2 + 10);
    }

    #[tokio::test]
    async fn test_no_endpoints() {
        let fetcher = RateLimitedFetcher::new(Vec::new(), None, policy(0));
        assert!(matches!(
            fetcher.head_block().await,
            Err(FetchError::NoEndpoints)
        ));
    }
}
