//! Extraction results as injectable, typed inputs.
//!
//! Consumers ask for capabilities (extracted data of some page type, or the
//! page html) and a `ProviderRegistry` routes each request to the provider
//! registered for those capabilities. `AutoExtractProvider` serves all of
//! them with at most one API query per page type, fetching the html along
//! with one of the data queries when both are wanted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use spider_util::request::Request;
use tracing::{debug, error, info, trace};
use url::Url;

use crate::client::CallOptions;
use crate::config::AutoExtractConfig;
use crate::error::{AutoExtractError, Result};
use crate::extractor::Extractor;
use crate::page_type::PageType;
use crate::query::{ExtractionRequest, ExtractionResult};
use crate::retry::RetryPolicy;
use crate::slots::{SlotsSemaphore, get_domain};
use crate::task_manager::TaskManager;

/// What a consumer can ask a provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Data(PageType),
    Html,
}

/// Extracted data of one page type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageData {
    pub page_type: PageType,
    pub data: Value,
}

/// Html of a page as rendered by the extraction API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlPage {
    pub url: Url,
    pub html: String,
}

/// A value handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Injected {
    Data(PageData),
    Html(HtmlPage),
}

impl Injected {
    pub fn capability(&self) -> Capability {
        match self {
            Injected::Data(page) => Capability::Data(page.page_type),
            Injected::Html(_) => Capability::Html,
        }
    }
}

/// A typed wrapper around the data of one page type.
pub trait PageInput: Sized {
    const PAGE_TYPE: PageType;

    fn from_page_data(page: PageData) -> Self;

    fn capability() -> Capability {
        Capability::Data(Self::PAGE_TYPE)
    }
}

macro_rules! page_inputs {
    ($($name:ident => $page_type:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
            pub struct $name {
                pub data: Value,
            }

            impl PageInput for $name {
                const PAGE_TYPE: PageType = PageType::$page_type;

                fn from_page_data(page: PageData) -> Self {
                    Self { data: page.data }
                }
            }
        )*
    };
}

page_inputs! {
    ArticleData => Article,
    ArticleListData => ArticleList,
    CommentsData => Comments,
    ForumPostsData => ForumPosts,
    JobPostingData => JobPosting,
    ProductData => Product,
    ProductListData => ProductList,
    RealEstateData => RealEstate,
    ReviewsData => Reviews,
    VehicleData => Vehicle,
}

/// Finds the typed input `T` among provided values.
pub fn find_page<T: PageInput>(injected: &[Injected]) -> Option<T> {
    injected.iter().find_map(|value| match value {
        Injected::Data(page) if page.page_type == T::PAGE_TYPE => {
            Some(T::from_page_data(page.clone()))
        }
        _ => None,
    })
}

pub fn find_html(injected: &[Injected]) -> Option<&HtmlPage> {
    injected.iter().find_map(|value| match value {
        Injected::Html(page) => Some(page),
        _ => None,
    })
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<Capability>;

    /// Provides one value per requested capability.
    async fn provide(&self, request: &Request, wanted: &[Capability]) -> Result<Vec<Injected>>;
}

/// Routes capabilities to the provider registered for them.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<Capability, Arc<dyn DataProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` for all of its capabilities, replacing previous
    /// registrations of the same capabilities.
    pub fn register(&mut self, provider: Arc<dyn DataProvider>) {
        for capability in provider.capabilities() {
            trace!("Registering {} for {:?}", provider.name(), capability);
            self.providers.insert(capability, Arc::clone(&provider));
        }
    }

    pub fn provider_for(&self, capability: Capability) -> Option<&Arc<dyn DataProvider>> {
        self.providers.get(&capability)
    }

    /// Calls each involved provider once with the capabilities it serves.
    pub async fn resolve(&self, request: &Request, wanted: &[Capability]) -> Result<Vec<Injected>> {
        let mut groups: Vec<(Arc<dyn DataProvider>, Vec<Capability>)> = Vec::new();
        for &capability in wanted {
            let provider = self.provider_for(capability).ok_or_else(|| {
                AutoExtractError::ConfigurationError(format!(
                    "No provider registered for {capability:?}"
                ))
            })?;
            match groups.iter_mut().find(|(p, _)| Arc::ptr_eq(p, provider)) {
                Some((_, capabilities)) => capabilities.push(capability),
                None => groups.push((Arc::clone(provider), vec![capability])),
            }
        }

        let mut injected = Vec::new();
        for (provider, capabilities) in groups {
            injected.extend(provider.provide(request, &capabilities).await?);
        }
        Ok(injected)
    }
}

/// Provides extraction results for every page type, plus the page html.
pub struct AutoExtractProvider {
    extractor: Extractor,
    per_domain_semaphore: SlotsSemaphore,
    task_manager: TaskManager,
    retry_policy: RetryPolicy,
    page_type_for_html: PageType,
}

impl AutoExtractProvider {
    pub fn builder() -> AutoExtractProviderBuilder {
        AutoExtractProviderBuilder::default()
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn per_domain_semaphore(&self) -> &SlotsSemaphore {
        &self.per_domain_semaphore
    }

    /// The queries needed to serve `wanted` for `url`.
    pub fn plan(&self, url: &Url, wanted: &[Capability]) -> Vec<ExtractionRequest> {
        let mut page_types: Vec<PageType> = Vec::new();
        for capability in wanted {
            if let Capability::Data(page_type) = capability
                && !page_types.contains(page_type)
            {
                page_types.push(*page_type);
            }
        }

        let html_page_type = if !wanted.contains(&Capability::Html) {
            None
        } else if page_types.contains(&self.page_type_for_html) {
            Some(self.page_type_for_html)
        } else if let Some(first) = page_types.first() {
            Some(*first)
        } else {
            page_types.push(self.page_type_for_html);
            Some(self.page_type_for_html)
        };

        page_types
            .into_iter()
            .map(|page_type| {
                ExtractionRequest::new(url.clone(), page_type)
                    .with_extra([("articleBodyRaw".to_string(), json!(false))])
                    .with_full_html(html_page_type == Some(page_type))
            })
            .collect()
    }

    async fn fetch_one(&self, request: &ExtractionRequest, slot: &str) -> Result<ExtractionResult> {
        let stats = self.extractor.stats();
        let page_type = request.page_type().as_str();
        for scope in ["total", page_type] {
            stats.inc_value(format!("autoextract/{scope}/pages/count"));
        }

        let options = CallOptions::default();
        let fetch = self.extractor.fetch(
            request,
            &self.retry_policy,
            &options,
            self.task_manager.token(),
        );
        let outcome = self
            .task_manager
            .run(async { self.per_domain_semaphore.run(slot, fetch).await? })
            .await;

        match outcome {
            Ok(fetched) => {
                for scope in ["total", page_type] {
                    stats.inc_value(format!("autoextract/{scope}/pages/success"));
                    if request.full_html() {
                        stats.inc_value(format!("autoextract/{scope}/pages/html"));
                    }
                }
                debug!(
                    "Provided {} for {} (cached: {})",
                    page_type,
                    request.url(),
                    fetched.cached
                );
                Ok(fetched.result)
            }
            Err(AutoExtractError::Cancelled) => {
                for scope in ["total", page_type] {
                    stats.inc_value(format!("autoextract/{scope}/pages/cancelled"));
                }
                Err(AutoExtractError::Cancelled)
            }
            Err(err) => {
                for scope in ["total", page_type] {
                    stats.inc_value(format!("autoextract/{scope}/pages/errors"));
                }
                stats.inc_value(format!("autoextract/total/pages/errors{}", err.summarize()));
                if err.is_account_disabled() {
                    error!("AutoExtract account is disabled, stopping: {}", err);
                    self.task_manager.cancel_all();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DataProvider for AutoExtractProvider {
    fn name(&self) -> &str {
        "AutoExtractProvider"
    }

    fn capabilities(&self) -> Vec<Capability> {
        PageType::ALL
            .iter()
            .map(|&page_type| Capability::Data(page_type))
            .chain([Capability::Html])
            .collect()
    }

    async fn provide(&self, request: &Request, wanted: &[Capability]) -> Result<Vec<Injected>> {
        let queries = self.plan(&request.url, wanted);
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let slot = get_domain(&request.url);
        trace!(
            "Providing {:?} for {} with {} queries ({})",
            wanted,
            request.url,
            queries.len(),
            self.per_domain_semaphore
        );

        let results =
            try_join_all(queries.iter().map(|query| self.fetch_one(query, &slot))).await?;

        let mut injected = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            if query.full_html() {
                let html = result.raw_html.clone().ok_or_else(|| {
                    AutoExtractError::InvalidResponse(format!(
                        "html was requested but is missing from the result for {}",
                        request.url
                    ))
                })?;
                injected.push(Injected::Html(HtmlPage {
                    url: request.url.clone(),
                    html,
                }));
            }
            if wanted.contains(&Capability::Data(result.page_type)) {
                injected.push(Injected::Data(PageData {
                    page_type: result.page_type,
                    data: result.payload,
                }));
            }
        }
        Ok(injected)
    }
}

/// Builder for `AutoExtractProvider`.
#[derive(Default)]
pub struct AutoExtractProviderBuilder {
    config: Option<Arc<AutoExtractConfig>>,
    extractor: Option<Extractor>,
    task_manager: Option<TaskManager>,
    retry_policy: Option<RetryPolicy>,
    page_type_for_html: Option<PageType>,
    cancel_on_ctrl_c: bool,
}

impl AutoExtractProviderBuilder {
    pub fn config(mut self, config: Arc<AutoExtractConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Reuses an extractor shared with the middleware.
    pub fn extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn task_manager(mut self, task_manager: TaskManager) -> Self {
        self.task_manager = Some(task_manager);
        self
    }

    /// Defaults to `max_query_error_retries` attempts.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Page type queried when only the html is wanted. Defaults to product.
    pub fn page_type_for_html(mut self, page_type: PageType) -> Self {
        self.page_type_for_html = Some(page_type);
        self
    }

    /// Cancels every provider task on Ctrl-C. Needs a running Tokio runtime.
    pub fn cancel_on_ctrl_c(mut self, enabled: bool) -> Self {
        self.cancel_on_ctrl_c = enabled;
        self
    }

    pub fn build(self) -> Result<AutoExtractProvider> {
        let extractor = match (self.extractor, self.config) {
            (Some(extractor), _) => extractor,
            (None, Some(config)) => Extractor::new(config)?,
            (None, None) => {
                return Err(AutoExtractError::ConfigurationError(
                    "AutoExtractProvider needs a configuration or an extractor".to_string(),
                ));
            }
        };
        let config = Arc::clone(extractor.config());
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::new().max_attempts(config.max_query_error_retries));
        let task_manager = self.task_manager.unwrap_or_default();
        if self.cancel_on_ctrl_c {
            task_manager.cancel_on_ctrl_c();
        }

        let provider = AutoExtractProvider {
            per_domain_semaphore: SlotsSemaphore::new(config.concurrent_requests_per_domain),
            extractor,
            task_manager,
            retry_policy,
            page_type_for_html: self.page_type_for_html.unwrap_or(PageType::Product),
        };
        info!(
            "Initializing AutoExtractProvider with config: {:?}, retry policy: {:?}, {}",
            config, provider.retry_policy, provider.per_domain_semaphore
        );
        Ok(provider)
    }
}
