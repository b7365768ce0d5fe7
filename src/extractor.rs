//! The decision core shared by the middleware and the provider.
//!
//! Every extraction goes through `Extractor::fetch`: the cache is consulted
//! first, misses run the client under the caller's retry policy and results
//! are stored before being handed back. Both call paths therefore agree on
//! cache keys, error classification and stats.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::cache::{ExtractionCache, Fetched};
use crate::client::{CallOptions, ExtractionClient, HttpExtractionClient};
use crate::config::AutoExtractConfig;
use crate::error::{AutoExtractError, Result};
use crate::query::{ExtractionRequest, ExtractionResult};
use crate::retry::RetryPolicy;
use crate::stats::ExtractionStats;

#[derive(Clone)]
pub struct Extractor {
    client: Arc<dyn ExtractionClient>,
    cache: Arc<ExtractionCache>,
    stats: Arc<ExtractionStats>,
    config: Arc<AutoExtractConfig>,
}

impl Extractor {
    /// Creates the HTTP client and opens the configured cache.
    pub fn new(config: Arc<AutoExtractConfig>) -> Result<Self> {
        let client = Arc::new(HttpExtractionClient::new(&config)?);
        let cache = Arc::new(ExtractionCache::from_settings(&config.cache, &config.api_key)?);
        Ok(Self::from_parts(config, client, cache, Arc::new(ExtractionStats::new())))
    }

    pub fn from_parts(
        config: Arc<AutoExtractConfig>,
        client: Arc<dyn ExtractionClient>,
        cache: Arc<ExtractionCache>,
        stats: Arc<ExtractionStats>,
    ) -> Self {
        info!("Initializing Extractor with cache: {}", cache.describe());
        Self {
            client,
            cache,
            stats,
            config,
        }
    }

    pub fn config(&self) -> &Arc<AutoExtractConfig> {
        &self.config
    }

    pub fn stats(&self) -> &Arc<ExtractionStats> {
        &self.stats
    }

    pub fn cache(&self) -> &Arc<ExtractionCache> {
        &self.cache
    }

    /// Returns the result for `request` from the cache or from the API.
    pub async fn fetch(
        &self,
        request: &ExtractionRequest,
        policy: &RetryPolicy,
        options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<Fetched> {
        self.cache
            .fetch(request, move || {
                policy.call_with_retry(cancel, move |attempt| {
                    self.attempt(request, options, attempt)
                })
            })
            .await
    }

    async fn attempt(
        &self,
        request: &ExtractionRequest,
        options: &CallOptions,
        attempt: u32,
    ) -> Result<ExtractionResult> {
        self.stats.inc_value("autoextract/total/attempts/count");
        trace!("AutoExtract attempt {} for {}", attempt, request.url());

        let start = Instant::now();
        let result = self.client.extract(request, options).await?;
        let latency = start.elapsed();
        self.stats.record_latency(latency);
        debug!("AutoExtract response for {} in {:?}", request.url(), latency);

        self.interpret(request, result)
    }

    /// Turns a per-query `error` into a `QueryError`, unless it is allowed.
    fn interpret(&self, request: &ExtractionRequest, result: Value) -> Result<ExtractionResult> {
        let message = match result.get("error") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        };

        if let Some(message) = message {
            if !self.config.is_allowed_response_error(&message) {
                let query = result.get("query").cloned().unwrap_or_else(|| request.to_query());
                return Err(AutoExtractError::QueryError { query, message });
            }
            debug!("Allowed AutoExtract error for {}: {}", request.url(), message);
        }
        Ok(ExtractionResult::from_api_result(request, result))
    }
}
