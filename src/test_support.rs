//! Fakes shared by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{CallOptions, ExtractionClient};
use crate::config::AutoExtractConfig;
use crate::error::Result;
use crate::page_type::PageType;
use crate::query::ExtractionRequest;

type Responder = dyn Fn(&ExtractionRequest, u32) -> Result<Value> + Send + Sync;

/// Client answering from a closure that gets the request and the 0-based
/// call index.
pub struct ScriptedClient {
    respond: Box<Responder>,
    calls: AtomicU32,
    seen: Mutex<Vec<ExtractionRequest>>,
    options: Mutex<Vec<CallOptions>>,
}

impl ScriptedClient {
    pub fn new(
        respond: impl Fn(&ExtractionRequest, u32) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<ExtractionRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Options of every call, in call order.
    pub fn options(&self) -> Vec<CallOptions> {
        self.options.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionClient for ScriptedClient {
    async fn extract(&self, request: &ExtractionRequest, options: &CallOptions) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        self.options.lock().unwrap().push(options.clone());
        (self.respond)(request, call)
    }
}

/// Configuration with a key and `article` as default page type.
pub fn test_config() -> AutoExtractConfig {
    AutoExtractConfig::builder()
        .api_key("apikey")
        .page_type(PageType::Article)
        .build_with_env(|_| None)
        .unwrap()
}
