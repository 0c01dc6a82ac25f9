use crate::metrics::{EngineMetrics, EngineMetricsSnapshot};
use casegraph_core::{
    AnalysisRequest, AnalysisResult, AnalysisStrategy, AnalysisType, Cache, EngineConfig,
    GraphBackend, LlmProvider,
};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub type PreProcessHook = Box<dyn Fn(AnalysisRequest) -> AnalysisRequest + Send + Sync>;
pub type PostProcessHook = Box<dyn Fn(AnalysisResult) -> AnalysisResult + Send + Sync>;

/// Routes analysis requests to strategies, caching successful results,
/// enforcing deadlines, and collecting metrics.
///
/// Strategy resolution is first-match over registration order; callers
/// control priority by registering in the order they want consulted. The
/// engine never raises: every failure becomes a `success == false` result.
pub struct AnalysisEngine {
    llm: Arc<dyn LlmProvider>,
    graph: Arc<dyn GraphBackend>,
    strategies: RwLock<Vec<Arc<dyn AnalysisStrategy>>>,
    cache: Option<Arc<dyn Cache>>,
    config: EngineConfig,
    pre_process: Option<PreProcessHook>,
    post_process: Option<PostProcessHook>,
    metrics: Mutex<EngineMetrics>,
}

impl AnalysisEngine {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        graph: Arc<dyn GraphBackend>,
        config: EngineConfig,
    ) -> Self {
        Self {
            llm,
            graph,
            strategies: RwLock::new(Vec::new()),
            cache: None,
            config,
            pre_process: None,
            post_process: None,
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_pre_process(mut self, hook: PreProcessHook) -> Self {
        self.pre_process = Some(hook);
        self
    }

    pub fn with_post_process(mut self, hook: PostProcessHook) -> Self {
        self.post_process = Some(hook);
        self
    }

    pub fn add_strategy(&self, strategy: Arc<dyn AnalysisStrategy>) {
        self.strategies.write().push(strategy);
        info!("added analysis strategy");
    }

    pub fn remove_strategy(&self, strategy: &Arc<dyn AnalysisStrategy>) {
        self.strategies
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, strategy));
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.read().len()
    }

    pub fn llm(&self) -> Arc<dyn LlmProvider> {
        self.llm.clone()
    }

    pub fn graph(&self) -> Arc<dyn GraphBackend> {
        self.graph.clone()
    }

    /// Execute a single analysis request.
    pub async fn analyze(&self, request: AnalysisRequest) -> AnalysisResult {
        let start = Instant::now();

        if self.config.collect_metrics {
            self.metrics.lock().record_request(request.analysis_type);
        }

        let request = match &self.pre_process {
            Some(hook) => hook(request),
            None => request,
        };

        let cache_key = self.cache_enabled().then(|| Self::cache_key(&request));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Ok(Some(cached)) = cache.get(key).await {
                if let Ok(result) = AnalysisResult::from_value(cached) {
                    debug!(analysis_type = %request.analysis_type, "cache hit");
                    return self.post_processed(result);
                }
            }
        }

        let strategy = self.find_strategy(request.analysis_type);
        let result = match strategy {
            Some(strategy) => self.run_strategy(strategy, &request).await,
            None => {
                let message = format!(
                    "No strategy found for analysis type: {}",
                    request.analysis_type
                );
                error!("{message}");
                self.error_result(request.clone(), vec![message], start)
            }
        };

        if self.config.collect_metrics {
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.metrics
                .lock()
                .record_outcome(result.success, duration_ms, &result.errors);
        }

        if result.success {
            if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                if let Ok(value) = result.to_value() {
                    let ttl = Duration::from_secs(self.config.cache_ttl_seconds);
                    if let Err(e) = cache.set(key, value, Some(ttl)).await {
                        debug!(error = %e, "failed to cache analysis result");
                    }
                }
            }
        }

        self.post_processed(result)
    }

    /// Execute many requests concurrently. Output order matches input order
    /// and individual failures never abort siblings.
    pub async fn analyze_batch(&self, requests: Vec<AnalysisRequest>) -> Vec<AnalysisResult> {
        join_all(requests.into_iter().map(|request| self.analyze(request))).await
    }

    pub fn get_metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = EngineMetrics::default();
    }

    /// Deterministic cache key: sha256 hex of canonical JSON of
    /// `{type, parameters, context, constraints}` with sorted keys.
    pub fn cache_key(request: &AnalysisRequest) -> String {
        let key_data = serde_json::json!({
            "type": request.analysis_type.as_str(),
            "parameters": request.parameters,
            "context": request.context,
            "constraints": request.constraints,
        });
        let canonical = serde_json::to_string(&key_data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn cache_enabled(&self) -> bool {
        self.config.enable_caching && self.cache.is_some()
    }

    fn find_strategy(&self, analysis_type: AnalysisType) -> Option<Arc<dyn AnalysisStrategy>> {
        self.strategies
            .read()
            .iter()
            .find(|strategy| strategy.can_handle(analysis_type))
            .cloned()
    }

    async fn run_strategy(
        &self,
        strategy: Arc<dyn AnalysisStrategy>,
        request: &AnalysisRequest,
    ) -> AnalysisResult {
        let start = Instant::now();
        let fut = strategy.analyze(request, self.llm.as_ref(), self.graph.as_ref());

        match self.config.timeout_seconds {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs(seconds), fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        let message = format!("Analysis timed out after {seconds} seconds");
                        error!("{message}");
                        self.error_result(request.clone(), vec![message], start)
                    }
                }
            }
            None => fut.await,
        }
    }

    fn post_processed(&self, result: AnalysisResult) -> AnalysisResult {
        match &self.post_process {
            Some(hook) => hook(result),
            None => result,
        }
    }

    fn error_result(
        &self,
        request: AnalysisRequest,
        errors: Vec<String>,
        start: Instant,
    ) -> AnalysisResult {
        let mut result = AnalysisResult::failure(request, errors)
            .with_duration_ms(start.elapsed().as_secs_f64() * 1000.0);
        result.timestamp = Utc::now();
        result
    }
}
