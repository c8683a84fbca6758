//! Degraded-mode search through the host platform's own endpoints.

use crate::error::{Result, SearchError};
use crate::query::QueryRequest;
use crate::response::{ResponseSource, SearchResponse};
use crate::state::DEFAULT_ROWS;
use async_trait::async_trait;
use serde_json::Value as Json;
use std::time::Duration;

const SUGGEST_RESULTS: &[&str] = &["resources", "results", "products"];
const COLLECTION_RESULTS: &[&str] = &["products"];

/// Re-issues a query against a simpler search backend. Facets, boosts and
/// counts are not available there, only the entities.
#[async_trait]
pub trait NativeSearch: Send + Sync {
    async fn search(&self, request: &QueryRequest) -> Result<SearchResponse>;
}

/// Storefront browse (`/collections/<handle>/products.json`) and predictive
/// search (`/search/suggest.json`).
pub struct StorefrontFallback {
    client: reqwest::Client,
    base_url: String,
}

impl StorefrontFallback {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, request: &QueryRequest) -> (String, &'static [&'static str]) {
        let attributes = &request.attributes;
        let rows = attributes.rows.unwrap_or(DEFAULT_ROWS);
        match attributes.search.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => (
                format!(
                    "{}/search/suggest.json?q={}&resources%5Btype%5D=product&resources%5Blimit%5D={}",
                    self.base_url,
                    urlencoding::encode(text),
                    rows.min(10)
                ),
                SUGGEST_RESULTS,
            ),
            _ => (
                format!(
                    "{}/collections/{}/products.json?limit={}&page={}",
                    self.base_url,
                    urlencoding::encode(attributes.collection.as_deref().unwrap_or("all")),
                    rows.min(250),
                    attributes.page.unwrap_or(1)
                ),
                COLLECTION_RESULTS,
            ),
        }
    }
}

#[async_trait]
impl NativeSearch for StorefrontFallback {
    async fn search(&self, request: &QueryRequest) -> Result<SearchResponse> {
        let (url, path) = self.url_for(request);
        tracing::debug!(url = %url, "Native search");

        let transport_error = |status: Option<u16>, message: String| SearchError::Transport {
            host: self.base_url.clone(),
            status,
            message,
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(None, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport_error(Some(status.as_u16()), body));
        }

        let body: Json = response
            .json()
            .await
            .map_err(|e| SearchError::Decode(format!("Failed to decode storefront response: {}", e)))?;
        let entities = path
            .iter()
            .try_fold(&body, |node, key| node.get(key))
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();

        let mut decoded = SearchResponse::empty(ResponseSource::Fallback);
        decoded.entities = entities;
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_collection_browse() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/collections/socks/products.json")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("limit".into(), "12".into()),
                Matcher::UrlEncoded("page".into(), "3".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"products": [{"id": 1}, {"id": 2}]}"#)
            .create_async()
            .await;

        let fallback = StorefrontFallback::new(&server.url(), Duration::from_secs(5)).unwrap();
        let request = Query::new()
            .collection("socks")
            .paginate(12)
            .page(3)
            .build()
            .unwrap();
        let response = fallback.search(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.entities.len(), 2);
        assert!(response.is_fallback());
        assert_eq!(response.count, None);
    }

    #[tokio::test]
    async fn test_text_search_uses_suggest_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/search/suggest.json")
            .match_query(Matcher::UrlEncoded("q".into(), "wool socks".into()))
            .with_status(200)
            .with_body(r#"{"resources": {"results": {"products": [{"id": 9}]}}}"#)
            .create_async()
            .await;

        let fallback = StorefrontFallback::new(&server.url(), Duration::from_secs(5)).unwrap();
        let request = Query::new().search("wool socks").build().unwrap();
        let response = fallback.search(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.entities, vec![serde_json::json!({"id": 9})]);
    }

    #[tokio::test]
    async fn test_storefront_failure_is_transport_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/collections/all/products.json")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let fallback = StorefrontFallback::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = fallback
            .search(&Query::new().build().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Transport { status: Some(503), .. }));
    }
}
