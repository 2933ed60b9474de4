//! Enrichment text for published messages.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::OnceCell;

use crate::{PublishError, Result};

/// Text used when a source has nothing to offer.
pub const FALLBACK_TEXT: &str = "Good Day";

/// Supplies a piece of text for each published message.
///
/// Sources never fail a run: an empty or unreachable source yields
/// [`FALLBACK_TEXT`].
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn next_text(&self) -> String;
}

fn pick(items: &[String]) -> String {
    if items.is_empty() {
        return FALLBACK_TEXT.to_string();
    }
    let index = rand::rng().random_range(0..items.len());
    items[index].clone()
}

/// Random pick from a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticContent {
    items: Vec<String>,
}

impl StaticContent {
    pub fn new<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// A source that always yields [`FALLBACK_TEXT`].
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentSource for StaticContent {
    async fn next_text(&self) -> String {
        pick(&self.items)
    }
}

/// Random pick from a JSON array of strings served over HTTP.
///
/// The list is fetched on first use and cached for the lifetime of the
/// source, including when the fetch failed.
pub struct HttpContent {
    client: reqwest::Client,
    url: String,
    items: OnceCell<Vec<String>>,
}

impl HttpContent {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Content(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            items: OnceCell::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> std::result::Result<Vec<String>, reqwest::Error> {
        self.client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<String>>()
            .await
    }

    async fn items(&self) -> &[String] {
        self.items
            .get_or_init(|| async {
                match self.fetch().await {
                    Ok(items) => {
                        tracing::info!(url = %self.url, count = items.len(), "loaded content list");
                        items
                    }
                    Err(error) => {
                        tracing::warn!(url = %self.url, %error, "content list unavailable, using fallback");
                        Vec::new()
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl ContentSource for HttpContent {
    async fn next_text(&self) -> String {
        pick(self.items().await)
    }
}
