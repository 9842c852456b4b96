//! Tavily backend: `POST https://api.tavily.com/search`, key sent as a
//! bearer token.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{send_json, SearchBackend, SearchQuery, SearchResponse, SearchResult};
use crate::capabilities::CapabilityError;

const ENDPOINT: &str = "https://api.tavily.com/search";

#[derive(Serialize)]
struct Request<'a> {
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    include_answer: bool,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl From<Reply> for SearchResponse {
    fn from(reply: Reply) -> Self {
        let results = reply
            .results
            .into_iter()
            .map(|hit| SearchResult {
                title: hit.title,
                url: hit.url,
                snippet: hit.content,
            })
            .collect();
        SearchResponse {
            // Tavily sends an empty string when it has no answer.
            summary: reply.answer.filter(|a| !a.trim().is_empty()),
            results,
        }
    }
}

pub(super) struct TavilyBackend {
    client: Client,
    api_key: String,
}

impl TavilyBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
        }
    }

    fn body<'a>(query: SearchQuery<'a>) -> Request<'a> {
        Request {
            query: query.text,
            max_results: query.limit,
            search_depth: "basic",
            include_answer: true,
        }
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    async fn search(&self, query: SearchQuery<'_>) -> Result<SearchResponse, CapabilityError> {
        let request = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&Self::body(query));
        let reply: Reply = send_json("tavily", request).await?;
        Ok(reply.into())
    }

    fn provider_name(&self) -> &str {
        "tavily"
    }
}
