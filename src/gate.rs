//! Decides whether a crawl request is routed through the extraction API and
//! turns the ones that are into `ExtractionRequest`s.
//!
//! Requests opt in through their `autoextract` meta entry:
//!
//! ```json
//! {"autoextract": {"enabled": true, "pageType": "product", "extra": {"articleBodyRaw": false}}}
//! ```

use std::str::FromStr;
use std::sync::Arc;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use spider_util::request::Request;

use crate::config::AutoExtractConfig;
use crate::error::{AutoExtractError, Result};
use crate::page_type::PageType;
use crate::query::ExtractionRequest;

/// Meta key holding the per-request extraction settings.
pub const AUTOEXTRACT_META: &str = "autoextract";
/// Meta key set on requests that were already intercepted once.
pub const PROCESSED_META: &str = "_autoextract_processed";

/// Opt-in checks and request translation for the middleware path.
///
/// The gate is pure: it reads request meta and never mutates the request.
#[derive(Debug, Clone)]
pub struct RequestGate {
    config: Arc<AutoExtractConfig>,
    spider_page_type: Option<PageType>,
}

impl RequestGate {
    pub fn new(config: Arc<AutoExtractConfig>) -> Self {
        Self {
            config,
            spider_page_type: None,
        }
    }

    /// Page type declared by the spider, used when a request does not name one.
    pub fn with_spider_page_type(mut self, page_type: PageType) -> Self {
        self.spider_page_type = Some(page_type);
        self
    }

    /// True when `request` opted in and was not intercepted already.
    ///
    /// An opted-in request must be a GET and must resolve to a page type.
    pub fn should_extract(&self, request: &Request) -> Result<bool> {
        let settings = meta_value(request, AUTOEXTRACT_META);
        let enabled = settings
            .as_ref()
            .and_then(|s| s.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !enabled || request.meta.contains_key(PROCESSED_META) {
            return Ok(false);
        }

        if request.method != Method::GET {
            return Err(AutoExtractError::ConfigurationError(
                "Only GET requests are supported by AutoExtract".to_string(),
            ));
        }
        self.page_type(request)?;
        Ok(true)
    }

    /// Resolves the page type: request meta first, then the spider, then the
    /// configuration.
    pub fn page_type(&self, request: &Request) -> Result<PageType> {
        let from_meta = setting(request, "pageType");

        match from_meta {
            Some(Value::String(name)) => PageType::from_str(&name),
            Some(other) => Err(AutoExtractError::ConfigurationError(format!(
                "Invalid pageType value: {other}"
            ))),
            None => self
                .spider_page_type
                .or(self.config.page_type)
                .ok_or_else(|| {
                    AutoExtractError::ConfigurationError(format!(
                        "Page type not set for {}",
                        request.url
                    ))
                }),
        }
    }

    /// Builds the extraction request for an opted-in crawl request.
    pub fn resolve(&self, request: &Request) -> Result<ExtractionRequest> {
        let page_type = self.page_type(request)?;
        let extra = match setting(request, "extra") {
            None | Some(Value::Null) => Default::default(),
            Some(Value::Object(extra)) => extra,
            Some(other) => {
                return Err(AutoExtractError::ConfigurationError(format!(
                    "Invalid type for autoextract extra: expected an object, got {other}"
                )));
            }
        };

        Ok(ExtractionRequest::new(request.url.clone(), page_type).with_extra(extra))
    }

    /// Additional HTTP headers for the API call, from `autoextract.headers`.
    pub fn extra_headers(&self, request: &Request) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(values) = setting(request, "headers") else {
            return Ok(headers);
        };
        let Value::Object(values) = values else {
            return Err(AutoExtractError::ConfigurationError(
                "autoextract headers must be an object".to_string(),
            ));
        };

        for (name, value) in values {
            let invalid = || AutoExtractError::ConfigurationError(format!("Invalid header {name}"));
            let value = value.as_str().ok_or_else(invalid)?;
            let name_parsed = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value_parsed = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.insert(name_parsed, value_parsed);
        }
        Ok(headers)
    }
}

/// Copy of the meta value stored under `key`.
pub fn meta_value(request: &Request, key: &str) -> Option<Value> {
    request.meta.get(key).map(|entry| entry.value().clone())
}

fn setting(request: &Request, name: &str) -> Option<Value> {
    meta_value(request, AUTOEXTRACT_META).and_then(|settings| settings.get(name).cloned())
}
