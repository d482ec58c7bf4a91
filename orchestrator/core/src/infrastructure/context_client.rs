// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Context Retrieval Client
//!
//! HTTP client for the external context / vector-search collaborator. The
//! relay only forwards `{query, filters, limit}` and consumes the ranked hits;
//! scoring happens on the other side.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::domain::envelope::{ContextHit, ContextRequest, ContextResult};
use crate::domain::node_config::ContextConfig;

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    results: Vec<ContextHit>,
}

pub struct ContextClient {
    endpoint: String,
    client: Client,
}

impl ContextClient {
    pub fn new(config: &ContextConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build context HTTP client")?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            client,
        })
    }

    /// Forward the request and return at most `request.limit` hits, best first.
    pub async fn retrieve(&self, request: &ContextRequest) -> Result<ContextResult> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Context service unreachable at {}", self.endpoint))?
            .error_for_status()
            .context("Context service returned an error status")?;

        let body: ContextResponse = response
            .json()
            .await
            .context("Context service returned an invalid body")?;

        let mut results = body.results;
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(request.limit as usize);
        debug!(query = %request.query, hits = results.len(), "Context retrieved");
        Ok(ContextResult { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retrieve_orders_and_limits_hits() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/search")
            .match_body(mockito::Matcher::PartialJson(json!({"query": "login selector", "limit": 2})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"results": [
                    {"id": "a", "score": 0.2, "content": "old"},
                    {"id": "b", "score": 0.9, "content": "best"},
                    {"id": "c", "score": 0.5}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let client = ContextClient::new(&ContextConfig {
            endpoint: format!("{}/search", server.url()),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        let result = client
            .retrieve(&ContextRequest {
                query: "login selector".into(),
                filters: Map::new(),
                limit: 2,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        let ids: Vec<&str> = result.results.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_retrieve_surfaces_error_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/search").with_status(503).create_async().await;
        let client = ContextClient::new(&ContextConfig {
            endpoint: format!("{}/search", server.url()),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        let request = ContextRequest {
            query: "q".into(),
            filters: Map::new(),
            limit: 5,
        };
        assert!(client.retrieve(&request).await.is_err());
    }
}
