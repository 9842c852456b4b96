//! Builtin capability: fetch a URL and extract readable text content.
//!
//! Snippets call `url_fetch.fetch(url)` when they have a specific URL and
//! need the page content. HTML is converted to clean plain text and
//! truncated so one page cannot flood the sandbox output.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::capabilities::{
    Capability, CapabilityDescriptor, CapabilityError, CapabilityProvider, MethodSignature,
};

/// Maximum raw response body size (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum text returned to the snippet (in characters).
const MAX_TEXT_OUTPUT: usize = 20_000;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Text wrapping width for html2text conversion.
const TEXT_WIDTH: usize = 100;

/// User-Agent header sent with requests.
const USER_AGENT: &str = "FluuxCodemode/0.1 (+https://github.com/processone/fluux-codemode)";

/// Catalog entry for the `url_fetch` capability.
pub struct UrlFetchProvider {
    descriptor: CapabilityDescriptor,
}

impl UrlFetchProvider {
    pub fn new() -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(
                "url_fetch",
                "Fetch a web page and extract its readable text.",
            )
            .method(
                MethodSignature::new(
                    "fetch",
                    "Fetches an http(s) URL. Returns {url, status, content_type, text, \
                     truncated}; HTML is converted to plain text.",
                )
                .param("url", "string"),
            )
            .example(
                "let page = url_fetch.fetch(\"https://www.rust-lang.org\")\n\
                 print(page.status, page.content_type)\n\
                 return slice(page.text, 0, 500)",
            ),
        }
    }
}

impl Default for UrlFetchProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProvider for UrlFetchProvider {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    fn instantiate(&self) -> Arc<dyn Capability> {
        Arc::new(UrlFetch::new())
    }
}

/// Live `url_fetch` handle for one execution.
pub struct UrlFetch {
    client: reqwest::Client,
}

impl UrlFetch {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }

    async fn fetch(&self, url_str: &str) -> Result<Value, CapabilityError> {
        let parsed = url::Url::parse(url_str)
            .map_err(|e| CapabilityError::InvalidParams(format!("invalid URL: {e}")))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(CapabilityError::InvalidParams(format!(
                    "unsupported scheme '{scheme}' (only http/https)"
                )));
            }
        }

        debug!("Fetching URL: {url_str}");

        let response = self.client.get(parsed).send().await.map_err(|e| {
            warn!("URL fetch failed: {e}");
            CapabilityError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Api {
                service: "url_fetch".to_string(),
                status: status.as_u16(),
                body: String::new(),
            });
        }

        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                return Err(too_large(len as usize));
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();

        let body = response.bytes().await?;
        if body.len() > MAX_RESPONSE_SIZE {
            return Err(too_large(body.len()));
        }

        let text = extract_text(&content_type, &body);
        let (text, truncated) = truncate_chars(text.trim());

        Ok(json!({
            "url": url_str,
            "status": status.as_u16(),
            "content_type": content_type,
            "text": text,
            "truncated": truncated,
        }))
    }
}

impl Default for UrlFetch {
    fn default() -> Self {
        Self::new()
    }
}

fn too_large(len: usize) -> CapabilityError {
    CapabilityError::Other(format!(
        "response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)"
    ))
}

/// Returns true if the content type looks like HTML.
fn is_html(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml")
}

/// Returns true if the content type is textual (plain, json, xml, etc.).
fn is_text(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/") || ct.contains("application/json") || ct.contains("application/xml")
}

/// Extract readable text from raw bytes based on content type.
fn extract_text(content_type: &str, body: &[u8]) -> String {
    if is_html(content_type) {
        html2text::from_read(body, TEXT_WIDTH)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned())
    } else if is_text(content_type) {
        String::from_utf8_lossy(body).into_owned()
    } else {
        let text = String::from_utf8_lossy(body);
        if text.chars().take(200).any(|c| c == '\0') {
            format!("Cannot extract text from binary content ({content_type})")
        } else {
            text.into_owned()
        }
    }
}

/// Truncates at a character boundary.
fn truncate_chars(text: &str) -> (String, bool) {
    if text.chars().count() > MAX_TEXT_OUTPUT {
        (text.chars().take(MAX_TEXT_OUTPUT).collect(), true)
    } else {
        (text.to_string(), false)
    }
}

#[async_trait]
impl Capability for UrlFetch {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        if method != "fetch" {
            return Err(CapabilityError::UnknownMethod(method.to_string()));
        }
        let url = params["url"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParams("`url` must be a string".into()))?;
        self.fetch(url).await
    }
}
