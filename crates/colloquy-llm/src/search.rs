use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use colloquy_core::errors::GatewayError;
use colloquy_core::provider::{SearchHit, SearchService};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Web search over a bearer-authenticated JSON endpoint that answers with
/// `data.webPages.value[]`.
pub struct WebSearchClient {
    client: Client,
    url: String,
    token: String,
    enabled: bool,
}

impl WebSearchClient {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        enabled: bool,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
            enabled,
        })
    }

    /// Disabled or token-less clients never hit the network.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.token.is_empty()
    }

    async fn fetch(&self, query: &str) -> Result<Vec<SearchHit>, GatewayError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "query": query,
                "freshness": "oneWeek",
                "summary": true,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(status, body));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        parse_hits(&body)
    }
}

#[async_trait]
impl SearchService for WebSearchClient {
    #[instrument(skip(self), fields(enabled = self.enabled))]
    async fn search(&self, query: &str) -> Vec<SearchHit> {
        if !self.is_active() {
            return Vec::new();
        }
        match self.fetch(query).await {
            Ok(hits) => {
                debug!(hits = hits.len(), "search completed");
                hits
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "search failed");
                Vec::new()
            }
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    data: Option<SearchData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    web_pages: Option<WebPages>,
}

#[derive(Deserialize)]
struct WebPages {
    #[serde(default)]
    value: Vec<WebPage>,
}

#[derive(Deserialize)]
struct WebPage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    summary: Option<String>,
    snippet: Option<String>,
}

/// Read hits from a search response body. A missing `webPages` block means
/// no hits; a body that is not JSON is an error.
pub fn parse_hits(body: &str) -> Result<Vec<SearchHit>, GatewayError> {
    let parsed: SearchResponse =
        serde_json::from_str(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    let pages = parsed
        .data
        .and_then(|d| d.web_pages)
        .map(|w| w.value)
        .unwrap_or_default();
    Ok(pages
        .into_iter()
        .map(|p| SearchHit {
            name: p.name,
            url: p.url,
            summary: p
                .summary
                .filter(|s| !s.is_empty())
                .or(p.snippet.filter(|s| !s.is_empty())),
        })
        .collect())
}

/// Render hits as numbered source blocks separated by blank lines. No hits
/// renders as the empty string.
pub fn format_search_results(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let mut block = format!("Source {}: {}\nLink: {}", i + 1, hit.name, hit.url);
            if let Some(summary) = &hit.summary {
                block.push_str("\nSummary: ");
                block.push_str(summary);
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
