//! Extraction schemas supported by the API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AutoExtractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PageType {
    Article,
    ArticleList,
    Comments,
    ForumPosts,
    JobPosting,
    Product,
    ProductList,
    RealEstate,
    Reviews,
    Vehicle,
}

impl PageType {
    pub const ALL: [PageType; 10] = [
        PageType::Article,
        PageType::ArticleList,
        PageType::Comments,
        PageType::ForumPosts,
        PageType::JobPosting,
        PageType::Product,
        PageType::ProductList,
        PageType::RealEstate,
        PageType::Reviews,
        PageType::Vehicle,
    ];

    /// Name used on the wire and as the result key.
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Article => "article",
            PageType::ArticleList => "articleList",
            PageType::Comments => "comments",
            PageType::ForumPosts => "forumPosts",
            PageType::JobPosting => "jobPosting",
            PageType::Product => "product",
            PageType::ProductList => "productList",
            PageType::RealEstate => "realEstate",
            PageType::Reviews => "reviews",
            PageType::Vehicle => "vehicle",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageType {
    type Err = AutoExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PageType::ALL
            .into_iter()
            .find(|page_type| page_type.as_str() == s)
            .ok_or_else(|| {
                AutoExtractError::ConfigurationError(format!("Invalid pageType value: {s}"))
            })
    }
}
