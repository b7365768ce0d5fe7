//! Commonly used items from the `spider-autoextract` crate.

pub use std::sync::Arc;

pub use spider_util::error::SpiderError;
pub use spider_util::request::Request;
pub use spider_util::response::Response;

pub use crate::autoextract::AutoExtractMiddleware;
pub use crate::cache::{CacheStore, ExtractionCache, FileStore, NoCache};
pub use crate::client::{ExtractionClient, HttpExtractionClient};
pub use crate::config::{AutoExtractConfig, CacheSettings, SlotPolicy};
pub use crate::error::{AutoExtractError, Result};
pub use crate::extractor::Extractor;
pub use crate::page_type::PageType;
pub use crate::provider::{
    ArticleData, AutoExtractProvider, Capability, DataProvider, HtmlPage, Injected, PageInput,
    ProductData, ProviderRegistry, find_html, find_page,
};
pub use crate::query::{ExtractionRequest, ExtractionResult};
pub use crate::retry::RetryPolicy;
pub use crate::task_manager::TaskManager;

#[cfg(feature = "collection-cache")]
pub use crate::cache::CollectionStore;

pub use crate::middleware::{Middleware, MiddlewareAction};
