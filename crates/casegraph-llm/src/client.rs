use crate::rate_limiter::RateLimiter;
use async_trait::async_trait;
use casegraph_core::{
    Cache, CaseGraphError, CompletionRequest, FunctionCall, LlmConfig, LlmProvider, Result,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Counters for LLM client traffic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LlmClientMetrics {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_tokens: u64,
    pub total_duration_ms: f64,
    pub errors: u64,
}

/// Snapshot of client metrics with derived rates.
#[derive(Debug, Clone, Serialize)]
pub struct LlmClientMetricsSnapshot {
    #[serde(flatten)]
    pub counters: LlmClientMetrics,
    pub cache_hit_rate: f64,
    pub avg_duration_ms: f64,
    pub avg_tokens_per_request: f64,
}

/// Rate-limited, caching, retrying wrapper around an `LlmProvider`.
///
/// Completion responses are cached under a deterministic sha256 key;
/// function-calling responses are never cached. Each model gets its own
/// token-bucket limiter.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    cache: Option<Arc<dyn Cache>>,
    config: LlmConfig,
    limiters: DashMap<String, Arc<RateLimiter>>,
    metrics: Mutex<LlmClientMetrics>,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self {
            provider,
            cache: None,
            config,
            limiters: DashMap::new(),
            metrics: Mutex::new(LlmClientMetrics::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Deterministic cache key: sha256 hex of canonical JSON of
    /// `{prompt, system_prompt, temperature, model}` with sorted keys.
    pub fn cache_key(
        prompt: &str,
        system_prompt: Option<&str>,
        temperature: f64,
        model: &str,
    ) -> String {
        let key_data = serde_json::json!({
            "prompt": prompt,
            "system_prompt": system_prompt,
            "temperature": temperature,
            "model": model,
        });
        let canonical = serde_json::to_string(&key_data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn metrics(&self) -> LlmClientMetricsSnapshot {
        let counters = self.metrics.lock().clone();
        let requests = counters.total_requests.max(1) as f64;
        LlmClientMetricsSnapshot {
            cache_hit_rate: counters.cache_hits as f64 / requests,
            avg_duration_ms: counters.total_duration_ms / requests,
            avg_tokens_per_request: counters.total_tokens as f64 / requests,
            counters,
        }
    }

    fn limiter_for(&self, model: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(
                    self.config.requests_per_minute,
                    self.config.tokens_per_minute,
                ))
            })
            .clone()
    }

    fn record_outcome(&self, start: Instant, tokens: usize, failed: bool) {
        let mut metrics = self.metrics.lock();
        metrics.total_duration_ms += start.elapsed().as_secs_f64() * 1000.0;
        if failed {
            metrics.errors += 1;
        } else {
            metrics.total_tokens += tokens as u64;
        }
    }

    /// Runs `op` with exponential backoff: delays of
    /// `retry_delay * 2^attempt` between tries.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..=self.config.retry_attempts {
            if attempt > 0 {
                let delay = self.config.retry_delay_seconds * 2f64.powi(attempt as i32 - 1);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                warn!(
                    attempt,
                    max_attempts = self.config.retry_attempts,
                    "retrying LLM request"
                );
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| CaseGraphError::Llm("All retry attempts failed".to_string())))
    }
}

#[async_trait]
impl LlmProvider for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let start = Instant::now();
        self.metrics.lock().total_requests += 1;

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        let cache_ttl = self.config.cache_ttl_seconds.map(Duration::from_secs);

        let key = Self::cache_key(
            &request.prompt,
            request.system_prompt.as_deref(),
            request.temperature,
            &model,
        );

        if let (Some(cache), Some(_)) = (&self.cache, cache_ttl) {
            if let Ok(Some(Value::String(cached))) = cache.get(&key).await {
                self.metrics.lock().cache_hits += 1;
                debug!(model, "completion cache hit");
                self.record_outcome(start, 0, false);
                return Ok(cached);
            }
            self.metrics.lock().cache_misses += 1;
        }

        let mut tokens = self.provider.estimate_tokens(&request.prompt);
        if let Some(system_prompt) = &request.system_prompt {
            tokens += self.provider.estimate_tokens(system_prompt);
        }

        self.limiter_for(&model).wait_if_needed(tokens).await;

        let response = self
            .with_retry(|| self.provider.complete(request.clone()))
            .await;

        match response {
            Ok(text) => {
                if let (Some(cache), Some(ttl)) = (&self.cache, cache_ttl) {
                    if let Err(e) = cache.set(&key, Value::String(text.clone()), Some(ttl)).await {
                        warn!(error = %e, "failed to cache completion");
                    }
                }
                self.record_outcome(start, tokens, false);
                Ok(text)
            }
            Err(e) => {
                self.record_outcome(start, tokens, true);
                Err(e)
            }
        }
    }

    async fn complete_with_functions(
        &self,
        prompt: &str,
        functions: &[Value],
        system_prompt: Option<&str>,
        temperature: f64,
    ) -> Result<FunctionCall> {
        let start = Instant::now();
        self.metrics.lock().total_requests += 1;

        let mut tokens = self.provider.estimate_tokens(prompt);
        if let Some(system_prompt) = system_prompt {
            tokens += self.provider.estimate_tokens(system_prompt);
        }
        // Function definitions ride along in the prompt.
        tokens += serde_json::to_string(functions)
            .map(|s| s.len() / 4)
            .unwrap_or(0);

        self.limiter_for(&self.config.model).wait_if_needed(tokens).await;

        let response = self
            .with_retry(|| {
                self.provider
                    .complete_with_functions(prompt, functions, system_prompt, temperature)
            })
            .await;

        match response {
            Ok(call) => {
                self.record_outcome(start, tokens, false);
                Ok(call)
            }
            Err(e) => {
                self.record_outcome(start, tokens, true);
                Err(e)
            }
        }
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.provider.estimate_tokens(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casegraph_cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
            }
        }

        fn failing_first(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(CaseGraphError::Llm("transient failure".to_string()));
            }
            Ok(format!("echo: {}", request.prompt))
        }

        async fn complete_with_functions(
            &self,
            _prompt: &str,
            _functions: &[Value],
            _system_prompt: Option<&str>,
            _temperature: f64,
        ) -> Result<FunctionCall> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FunctionCall {
                function: Some("lookup".to_string()),
                arguments: serde_json::json!({}),
            })
        }

        fn estimate_tokens(&self, text: &str) -> usize {
            text.len() / 4
        }
    }

    fn quick_config() -> LlmConfig {
        LlmConfig {
            retry_delay_seconds: 0.01,
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn cache_keys_are_deterministic_and_sensitive() {
        let a = LlmClient::cache_key("p", Some("s"), 0.7, "m");
        let b = LlmClient::cache_key("p", Some("s"), 0.7, "m");
        let c = LlmClient::cache_key("p", Some("s"), 0.8, "m");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn second_identical_completion_hits_cache() {
        let provider = Arc::new(CountingProvider::new());
        let client = LlmClient::new(provider.clone(), quick_config())
            .with_cache(Arc::new(MemoryCache::new(100)));

        let request = CompletionRequest::new("hello").with_temperature(0.3);
        let first = client.complete(request.clone()).await.unwrap();
        let second = client.complete(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let snapshot = client.metrics();
        assert_eq!(snapshot.counters.cache_hits, 1);
        assert_eq!(snapshot.counters.cache_misses, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(CountingProvider::failing_first(2));
        let client = LlmClient::new(provider.clone(), quick_config());

        let response = client
            .complete(CompletionRequest::new("retry me"))
            .await
            .unwrap();
        assert_eq!(response, "echo: retry me");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let provider = Arc::new(CountingProvider::failing_first(10));
        let client = LlmClient::new(provider, quick_config());

        let result = client.complete(CompletionRequest::new("doomed")).await;
        assert!(result.is_err());
        assert_eq!(client.metrics().counters.errors, 1);
    }

    #[tokio::test]
    async fn function_calls_are_never_cached() {
        let provider = Arc::new(CountingProvider::new());
        let client = LlmClient::new(provider.clone(), quick_config())
            .with_cache(Arc::new(MemoryCache::new(100)));

        for _ in 0..2 {
            client
                .complete_with_functions("act", &[], None, 0.7)
                .await
                .unwrap();
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
