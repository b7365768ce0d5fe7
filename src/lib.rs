//! # spider-autoextract
//!
//! Integrates an AutoExtract-style extraction API into `spider-lib` crawlers.
//!
//! ## Overview
//!
//! The crate offers two ways of getting structured data for a page, both
//! going through the same [`Extractor`](extractor::Extractor), so they share
//! the cache, the retry policy and stats:
//!
//! - **Middleware**: [`AutoExtractMiddleware`](autoextract::AutoExtractMiddleware)
//!   intercepts requests whose meta opts in, calls the API instead of the
//!   target site and answers with a synthetic response carrying the result.
//! - **Provider**: [`AutoExtractProvider`](provider::AutoExtractProvider)
//!   hands typed inputs (`ArticleData`, `ProductData`, page html, ...) to
//!   consumers through a [`ProviderRegistry`](provider::ProviderRegistry).
//!
//! Results can be cached on disk or in a remote job collection, keyed by a
//! fingerprint of the query so that both paths hit the same entries.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_autoextract::prelude::*;
//!
//! let config = Arc::new(
//!     AutoExtractConfig::builder()
//!         .page_type(PageType::Product)
//!         .cache_file("autoextract", true)
//!         .build()?,
//! );
//! let extractor = Extractor::new(config)?;
//!
//! let middleware = AutoExtractMiddleware::builder()
//!     .extractor(extractor.clone())
//!     .build()?;
//! let provider = AutoExtractProvider::builder()
//!     .extractor(extractor)
//!     .build()?;
//! ```

pub mod autoextract;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod middleware;
pub mod page_type;
pub mod provider;
pub mod query;
pub mod retry;
pub mod slots;
pub mod stats;
pub mod task_manager;

pub mod prelude;

#[cfg(test)]
mod test_support;

pub use error::{AutoExtractError, Result};
pub use spider_util::request::Request;
pub use spider_util::response::Response;
