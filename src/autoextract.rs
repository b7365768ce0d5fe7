//! AutoExtract downloader middleware.
//!
//! `AutoExtractMiddleware` intercepts requests that opted in through their
//! `autoextract` meta, sends them to the extraction API instead of the target
//! site and answers them with a synthetic response carrying the extracted
//! data. It must be the first middleware of the chain: once it answers a
//! request the rest of the chain, and the downloader, are bypassed.
//!
//! The crawler runs `process_request` under the middleware manager's lock, so
//! the API call never happens inside it. The first pass over a request tags
//! its download slot and starts the extraction as a background task under the
//! slot's semaphore. The request then goes back to the scheduler with
//! `MiddlewareAction::Retry` after the configured poll interval. The pass
//! that finds the task finished answers with `ReturnResponse`. Cache hits are
//! answered on the first pass.
//!
//! Failures that are still retryable after the middleware's own retry policy
//! (one attempt by default) come back as a 429 response so the crawler's
//! retry machinery can reschedule the request. Everything else is returned as
//! an error.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use spider_util::error::SpiderError;
use spider_util::request::Request;
use spider_util::response::Response;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::{Fetched, cache_key};
use crate::client::CallOptions;
use crate::config::AutoExtractConfig;
use crate::error::{AutoExtractError, Result};
use crate::extractor::Extractor;
use crate::gate::{AUTOEXTRACT_META, PROCESSED_META, RequestGate, meta_value};
use crate::middleware::{Middleware, MiddlewareAction};
use crate::page_type::PageType;
use crate::query::ExtractionRequest;
use crate::retry::RetryPolicy;
use crate::slots::{SlotsSemaphore, slot_key};
use crate::task_manager::TaskManager;

const EMPTY_BODY: &str = "<body></body>";
const DOWNLOAD_SLOT_META: &str = "download_slot";

/// A finished extraction waiting for its request to come back.
struct Outcome {
    result: Result<Fetched>,
    start_ts: f64,
    latency: Duration,
}

enum Pending {
    Running,
    Done(Outcome),
}

/// Downloader middleware answering opted-in requests with extraction results.
///
/// Use [`AutoExtractMiddleware::builder`] and register it before every other
/// middleware. Build it from the provider's extractor to share the cache and
/// stats between both call paths.
pub struct AutoExtractMiddleware {
    extractor: Extractor,
    gate: RequestGate,
    retry_policy: RetryPolicy,
    task_manager: TaskManager,
    slots: Arc<SlotsSemaphore>,
    pending: Arc<DashMap<String, Pending>>,
}

impl AutoExtractMiddleware {
    pub fn builder() -> AutoExtractMiddlewareBuilder {
        AutoExtractMiddlewareBuilder::default()
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    /// Extractions started and not yet picked up by their request.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn config(&self) -> &AutoExtractConfig {
        self.extractor.config()
    }

    fn poll_later(&self, request: Request) -> MiddlewareAction<Request> {
        MiddlewareAction::Retry(Box::new(request), self.config().poll_interval)
    }

    /// Starts the extraction in the background. The request's slot is tagged
    /// before anything is sent.
    fn dispatch(
        &self,
        request: &Request,
        key: String,
        extraction: ExtractionRequest,
        headers: HeaderMap,
    ) {
        let slot = slot_key(&request.url, self.config().slot_policy);
        if let Some(slot) = &slot {
            request
                .meta
                .insert(Cow::Borrowed(DOWNLOAD_SLOT_META), json!(slot));
        }

        let options = CallOptions {
            timeout: Some(self.config().attempt_timeout()),
            headers,
        };
        let extractor = self.extractor.clone();
        let retry_policy = self.retry_policy.clone();
        let task_manager = self.task_manager.clone();
        let slots = Arc::clone(&self.slots);
        let pending = Arc::clone(&self.pending);

        self.pending.insert(key.clone(), Pending::Running);
        tokio::spawn(async move {
            let start_ts = unix_ts();
            let started = Instant::now();
            let fetch =
                extractor.fetch(&extraction, &retry_policy, &options, task_manager.token());
            let result = match slot {
                Some(slot) => {
                    task_manager
                        .run(async { slots.run(&slot, fetch).await? })
                        .await
                }
                None => task_manager.run(fetch).await,
            };
            trace!("Extraction for {} finished", extraction.url());
            pending.insert(
                key,
                Pending::Done(Outcome {
                    result,
                    start_ts,
                    latency: started.elapsed(),
                }),
            );
        });
    }

    fn answer(
        &self,
        request: Request,
        outcome: Outcome,
    ) -> std::result::Result<MiddlewareAction<Request>, SpiderError> {
        let Outcome {
            result,
            start_ts,
            latency,
        } = outcome;

        match result {
            Ok(fetched) => {
                if fetched.cached {
                    self.extractor.stats().inc_value("autoextract/cached_count");
                }
                debug!(
                    "AutoExtract response for {} in {:.3}s (cached: {})",
                    request.url,
                    latency.as_secs_f64(),
                    fetched.cached
                );
                request.meta.insert(
                    Cow::Borrowed(PROCESSED_META),
                    json!({"original_url": request.url.as_str(), "timing": {"start_ts": start_ts}}),
                );
                Ok(MiddlewareAction::ReturnResponse(self.success_response(
                    &request, fetched, start_ts, latency,
                )))
            }
            Err(error)
                if error.is_retryable()
                    || matches!(error, AutoExtractError::RetryExhausted { .. }) =>
            {
                self.extractor.stats().inc_value("autoextract/retry_count");
                info!(
                    "AutoExtract call for {} will be retried by the crawler: {}",
                    request.url, error
                );
                Ok(MiddlewareAction::ReturnResponse(
                    self.throttled_response(&request, &error),
                ))
            }
            Err(error) => {
                self.record_failure(&request, &error, latency);
                Err(error.into())
            }
        }
    }

    fn success_response(
        &self,
        request: &Request,
        fetched: Fetched,
        start_ts: f64,
        latency: Duration,
    ) -> Response {
        let result = fetched.result;
        let mut timing = Map::new();
        timing.insert("start_ts".into(), json!(start_ts));
        timing.insert("end_ts".into(), json!(start_ts + latency.as_secs_f64()));
        timing.insert("latency".into(), json!(latency.as_secs_f64()));

        let mut data = Map::new();
        data.insert("original_url".into(), json!(request.url.as_str()));
        data.insert("timing".into(), Value::Object(timing));
        data.insert(result.page_type.as_str().into(), result.payload);

        let body = result.raw_html.unwrap_or_else(|| EMPTY_BODY.to_string());
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );

        let mut response = synthetic(request, StatusCode::OK, headers, Bytes::from(body));
        response
            .meta
            .insert(Cow::Borrowed(AUTOEXTRACT_META), Value::Object(data));
        response.cached = fetched.cached;
        response
    }

    /// A 429 the crawler will retry. The processed marker is removed so the
    /// retried request is intercepted again.
    fn throttled_response(&self, request: &Request, error: &AutoExtractError) -> Response {
        request.meta.remove(PROCESSED_META);
        let mut settings = match meta_value(request, AUTOEXTRACT_META) {
            Some(Value::Object(settings)) => settings,
            _ => Map::new(),
        };
        settings.insert("error".into(), json!(error.to_string()));

        let response = synthetic(
            request,
            StatusCode::TOO_MANY_REQUESTS,
            HeaderMap::new(),
            Bytes::new(),
        );
        response
            .meta
            .insert(Cow::Borrowed(AUTOEXTRACT_META), Value::Object(settings));
        response
    }

    fn record_failure(&self, request: &Request, error: &AutoExtractError, latency: Duration) {
        let stats = self.extractor.stats();
        stats.inc_value("autoextract/errors/total_count");
        stats.inc_value(format!("autoextract/errors/type_count{}", error.summarize()));
        warn!(
            "AutoExtract failure after {:.3}s for {}: {}",
            latency.as_secs_f64(),
            request.url,
            error
        );
    }
}

#[async_trait]
impl<C: Send + Sync> Middleware<C> for AutoExtractMiddleware {
    fn name(&self) -> &str {
        "AutoExtractMiddleware"
    }

    async fn process_request(
        &mut self,
        _client: &C,
        mut request: Request,
    ) -> std::result::Result<MiddlewareAction<Request>, SpiderError> {
        if !self.gate.should_extract(&request)? {
            trace!(
                "Request {} is not enabled for AutoExtract, continuing",
                request.url
            );
            return Ok(MiddlewareAction::Continue(request));
        }
        let extraction = self.gate.resolve(&request)?;
        let key = cache_key(&extraction);

        let finished = self
            .pending
            .remove_if(&key, |_, pending| matches!(pending, Pending::Done(_)));
        if let Some((_, Pending::Done(outcome))) = finished {
            return self.answer(request, outcome);
        }
        if self.pending.contains_key(&key) {
            trace!("Extraction for {} is still running", request.url);
            return Ok(self.poll_later(request));
        }

        let headers = self.gate.extra_headers(&request)?;
        request.headers.remove(COOKIE);
        request.meta.remove("proxy");
        self.extractor.stats().inc_value("autoextract/request_count");

        let start_ts = unix_ts();
        let started = Instant::now();
        match self.extractor.cache().get(&extraction).await {
            Ok(Some(result)) => {
                let outcome = Outcome {
                    result: Ok(Fetched {
                        result,
                        cached: true,
                    }),
                    start_ts,
                    latency: started.elapsed(),
                };
                return self.answer(request, outcome);
            }
            Ok(None) => {}
            Err(error) => {
                let outcome = Outcome {
                    result: Err(error),
                    start_ts,
                    latency: started.elapsed(),
                };
                return self.answer(request, outcome);
            }
        }

        debug!(
            "Sending {} to AutoExtract as {}",
            request.url,
            extraction.page_type()
        );
        self.dispatch(&request, key, extraction, headers);
        Ok(self.poll_later(request))
    }
}

/// Builder for `AutoExtractMiddleware`.
#[derive(Default)]
pub struct AutoExtractMiddlewareBuilder {
    config: Option<Arc<AutoExtractConfig>>,
    extractor: Option<Extractor>,
    spider_page_type: Option<PageType>,
    retry_policy: Option<RetryPolicy>,
    task_manager: Option<TaskManager>,
}

impl AutoExtractMiddlewareBuilder {
    /// Configuration used to create a dedicated extractor.
    pub fn config(mut self, config: Arc<AutoExtractConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Reuses an extractor, e.g. the one of an `AutoExtractProvider`, so that
    /// both call paths share cache and stats.
    pub fn extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Page type declared by the spider.
    pub fn spider_page_type(mut self, page_type: PageType) -> Self {
        self.spider_page_type = Some(page_type);
        self
    }

    /// Retry policy for each intercepted request. Defaults to one attempt.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Runs extractions under `task_manager`, e.g. the provider's, so that a
    /// single `cancel_all` stops both paths.
    pub fn task_manager(mut self, task_manager: TaskManager) -> Self {
        self.task_manager = Some(task_manager);
        self
    }

    pub fn build(self) -> Result<AutoExtractMiddleware> {
        let extractor = match (self.extractor, self.config) {
            (Some(extractor), _) => extractor,
            (None, Some(config)) => Extractor::new(config)?,
            (None, None) => {
                return Err(AutoExtractError::ConfigurationError(
                    "AutoExtractMiddleware needs a configuration or an extractor".to_string(),
                ));
            }
        };

        let mut gate = RequestGate::new(Arc::clone(extractor.config()));
        if let Some(page_type) = self.spider_page_type {
            gate = gate.with_spider_page_type(page_type);
        }
        let retry_policy = self.retry_policy.unwrap_or_else(RetryPolicy::none);
        let slots = SlotsSemaphore::new(extractor.config().concurrent_requests_per_domain);

        info!(
            "Initializing AutoExtractMiddleware with config: {:?}, retry policy: {:?}, {}",
            extractor.config(),
            retry_policy,
            slots
        );
        Ok(AutoExtractMiddleware {
            extractor,
            gate,
            retry_policy,
            task_manager: self.task_manager.unwrap_or_default(),
            slots: Arc::new(slots),
            pending: Arc::new(DashMap::new()),
        })
    }
}

/// A response for `request` carrying a copy of its meta.
fn synthetic(request: &Request, status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let response = Response {
        url: request.url.clone(),
        status,
        headers,
        body,
        request_url: request.url.clone(),
        meta: Default::default(),
        cached: false,
    };
    for entry in request.meta.iter() {
        response
            .meta
            .insert(entry.key().clone(), entry.value().clone());
    }
    response
}

fn unix_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
