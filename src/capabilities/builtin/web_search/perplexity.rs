//! Perplexity backend: Sonar chat completions
//! (`POST https://api.perplexity.ai/chat/completions`, bearer auth).
//!
//! The assistant's answer becomes the summary. Results come from the
//! structured `search_results` list when present, from bare `citations`
//! otherwise.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{send_json, SearchBackend, SearchQuery, SearchResponse, SearchResult};
use crate::capabilities::CapabilityError;

const ENDPOINT: &str = "https://api.perplexity.ai/chat/completions";

const SYSTEM_PROMPT: &str = "Answer the search query concisely and factually.";

#[derive(Serialize)]
struct Request<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    citations: Vec<String>,
    #[serde(default)]
    search_results: Vec<Source>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct Source {
    title: String,
    url: String,
    #[serde(default)]
    snippet: Option<String>,
}

impl From<Reply> for SearchResponse {
    fn from(reply: Reply) -> Self {
        let summary = reply.choices.into_iter().next().map(|c| c.message.content);

        let results = if !reply.search_results.is_empty() {
            reply
                .search_results
                .into_iter()
                .map(|source| SearchResult {
                    title: source.title,
                    url: source.url,
                    snippet: source.snippet.unwrap_or_default(),
                })
                .collect()
        } else {
            reply
                .citations
                .into_iter()
                .enumerate()
                .map(|(i, url)| SearchResult {
                    title: format!("Source {}", i + 1),
                    url,
                    snippet: String::new(),
                })
                .collect()
        };

        SearchResponse { summary, results }
    }
}

pub(super) struct PerplexityBackend {
    client: Client,
    api_key: String,
    model: String,
}

impl PerplexityBackend {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn body<'a>(&'a self, query: SearchQuery<'a>) -> Request<'a> {
        Request {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Message {
                    role: "user",
                    content: query.text,
                },
            ],
        }
    }
}

#[async_trait]
impl SearchBackend for PerplexityBackend {
    /// Sonar has no result count; the caller truncates to `query.limit`.
    async fn search(&self, query: SearchQuery<'_>) -> Result<SearchResponse, CapabilityError> {
        let request = self
            .client
            .post(ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&self.body(query));
        let reply: Reply = send_json("perplexity", request).await?;
        Ok(reply.into())
    }

    fn provider_name(&self) -> &str {
        "perplexity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(reply: serde_json::Value) -> SearchResponse {
        SearchResponse::from(serde_json::from_value::<Reply>(reply).unwrap())
    }

    #[test]
    fn test_request_body() {
        let backend = PerplexityBackend::new("k", "sonar-pro");
        let body = backend.body(SearchQuery {
            text: "rust",
            limit: 5,
        });
        let body = serde_json::to_value(body).unwrap();
        assert_eq!(body["model"], "sonar-pro");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "rust"}));
    }

    #[test]
    fn test_structured_results_win_over_citations() {
        let response = map(json!({
            "choices": [{"message": {"role": "assistant", "content": "Summary text."}}],
            "citations": ["https://a.com"],
            "search_results": [
                {"title": "Structured", "url": "https://structured.example", "snippet": "Detailed."},
                {"title": "Bare", "url": "https://bare.example"}
            ]
        }));
        assert_eq!(response.summary.as_deref(), Some("Summary text."));
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].snippet, "Detailed.");
        assert!(response.results[1].snippet.is_empty());
    }

    #[test]
    fn test_citations_fallback() {
        let response = map(json!({
            "choices": [{"message": {"role": "assistant", "content": "Answer."}}],
            "citations": ["https://a.com", "https://b.com"]
        }));
        let titles: Vec<_> = response.results.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["Source 1", "Source 2"]);
        assert_eq!(response.results[1].url, "https://b.com");
    }

    #[test]
    fn test_empty_reply() {
        let response = map(json!({}));
        assert!(response.summary.is_none());
        assert!(response.results.is_empty());
    }
}
