//! The downloader middleware seam.
//!
//! `AutoExtractMiddleware` implements the crawler's own `Middleware` trait, so
//! it registers with `spider-core` like any other downloader middleware. The
//! trait and its `MiddlewareAction` are re-exported here for callers that
//! only depend on this crate.

pub use spider_middleware::middleware::{Middleware, MiddlewareAction};
