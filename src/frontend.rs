//! Line-delimited JSON front-end.
//!
//! Each input line is one request:
//!
//! ```text
//! {"id": 1, "op": "discover", "query": "basic"}
//! {"id": 2, "op": "quick_start", "service": "web_search"}
//! {"id": 3, "op": "execute", "code": "print('hi')", "timeout_secs": 5}
//! ```
//!
//! Each response is one line carrying the request id. Requests are handled
//! concurrently, so responses may come back out of order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::sandbox::{ExecutionRequest, Sandbox};

/// Responses waiting to be written before request handlers are slowed down.
const RESPONSE_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Json,
    #[serde(flatten)]
    op: Operation,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Operation {
    Discover {
        #[serde(default = "default_query")]
        query: String,
    },
    QuickStart {
        service: String,
    },
    Execute(ExecuteParams),
}

fn default_query() -> String {
    "basic".to_string()
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    code: String,
    timeout_secs: Option<f64>,
    output_cap: Option<usize>,
    #[serde(default)]
    variables: Map<String, Json>,
    capabilities: Option<Vec<String>>,
}

impl ExecuteParams {
    /// Oversized timeouts are clamped to `max_timeout_secs`; negative and
    /// NaN ones are refused.
    fn into_request(self, max_timeout_secs: f64) -> Result<ExecutionRequest, String> {
        let timeout = self
            .timeout_secs
            .map(|secs| {
                if secs.is_nan() || secs < 0.0 {
                    return Err(format!("invalid timeout_secs: {secs}"));
                }
                Duration::try_from_secs_f64(secs.min(max_timeout_secs))
                    .map_err(|_| format!("invalid timeout_secs: {secs}"))
            })
            .transpose()?;
        Ok(ExecutionRequest {
            code: self.code,
            timeout,
            output_cap: self.output_cap,
            variables: self.variables,
            capabilities: self.capabilities,
        })
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub id: Json,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(id: Json, result: Json) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Json, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Handles one request line. A finished execution is always `ok`, whatever
/// its status; `ok: false` means the request itself could not be served.
pub async fn handle_line(sandbox: &Sandbox, line: &str) -> Response {
    let raw: Json = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => return Response::err(Json::Null, format!("invalid JSON: {e}")),
    };
    let id = raw.get("id").cloned().unwrap_or(Json::Null);
    let request: Request = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => return Response::err(id, format!("invalid request: {e}")),
    };

    let outcome = match request.op {
        Operation::Discover { query } => {
            debug!("discover {query}");
            sandbox
                .discover(&query)
                .map_err(|e| e.to_string())
                .and_then(|catalog| serde_json::to_value(catalog).map_err(|e| e.to_string()))
        }
        Operation::QuickStart { service } => sandbox
            .quick_start(&service)
            .map(Json::String)
            .map_err(|e| e.to_string()),
        Operation::Execute(params) => {
            match params.into_request(sandbox.config().max_timeout_secs) {
                Ok(request) => {
                    let result = sandbox.execute(request).await;
                    serde_json::to_value(result).map_err(|e| e.to_string())
                }
                Err(e) => Err(e),
            }
        }
    };

    match outcome {
        Ok(result) => Response::ok(request.id, result),
        Err(e) => Response::err(request.id, e),
    }
}

/// Serves requests from `reader` until end of input, writing one response
/// line per request to `writer`. Returns once every response is written.
pub async fn serve<R, W>(sandbox: Arc<Sandbox>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(RESPONSE_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!("Serving requests");
    let mut lines = reader.lines();
    let mut handlers = JoinSet::new();
    // Finished handlers are reaped as they complete, so a long session
    // only holds the requests still in flight.
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let sandbox = Arc::clone(&sandbox);
                let tx = tx.clone();
                handlers.spawn(async move {
                    let response = handle_line(&sandbox, &line).await;
                    match serde_json::to_string(&response) {
                        Ok(encoded) => {
                            if tx.send(encoded).await.is_err() {
                                warn!("Response writer is gone, dropping response");
                            }
                        }
                        Err(e) => error!("Failed to encode response: {e}"),
                    }
                });
                debug!("{} request(s) in flight", handlers.len());
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                log_joined(joined);
            }
        }
    }

    while let Some(joined) = handlers.join_next().await {
        log_joined(joined);
    }
    drop(tx);
    writer_task.await??;
    info!("Input closed, all responses written");
    Ok(())
}

fn log_joined(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Request handler failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::MockProvider;
    use crate::capabilities::RegistryBuilder;
    use crate::config::SandboxConfig;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    fn sandbox() -> Sandbox {
        let mut builder = RegistryBuilder::new();
        builder.register(Box::new(MockProvider::new("github"))).unwrap();
        Sandbox::new(Arc::new(builder.build()), SandboxConfig::default())
    }

    async fn handle(line: &str) -> Response {
        handle_line(&sandbox(), line).await
    }

    #[tokio::test]
    async fn test_discover() {
        let response = handle(r#"{"id": 1, "op": "discover"}"#).await;
        assert!(response.ok);
        assert_eq!(response.id, json!(1));
        let result = response.result.unwrap();
        assert_eq!(result["tier"], "basic");
        assert_eq!(result["services"][0]["name"], "github");

        let response = handle(r#"{"id": 2, "op": "discover", "query": "jira"}"#).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("jira"));
    }

    #[tokio::test]
    async fn test_quick_start() {
        let response = handle(r#"{"id": "a", "op": "quick_start", "service": "github"}"#).await;
        assert_eq!(response.result, Some(json!("return github.echo(\"hi\")")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute() {
        let response = handle(
            r#"{"id": 3, "op": "execute", "code": "print(name)\nreturn github.add(1, 2)",
                "variables": {"name": "x"}, "timeout_secs": 5}"#,
        )
        .await;
        assert!(response.ok);
        let result = response.result.unwrap();
        assert_eq!(result["status"], "success");
        assert_eq!(result["stdout"], "x\n");
        assert_eq!(result["return_value"], 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_execution_is_still_ok() {
        let response = handle(r#"{"id": 4, "op": "execute", "code": "eval(\"1\")"}"#).await;
        assert!(response.ok);
        assert_eq!(response.result.unwrap()["status"], "security_violation");
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let response = handle("not json").await;
        assert!(!response.ok);
        assert_eq!(response.id, Json::Null);

        let response = handle(r#"{"id": 5, "op": "launch"}"#).await;
        assert!(!response.ok);
        assert_eq!(response.id, json!(5));

        let response = handle(r#"{"id": 6, "op": "execute"}"#).await;
        assert!(response.error.unwrap().contains("code"));

        let response =
            handle(r#"{"id": 7, "op": "execute", "code": "1", "timeout_secs": -1}"#).await;
        assert!(response.error.unwrap().contains("timeout_secs"));
    }

    fn params(timeout_secs: Option<f64>) -> ExecuteParams {
        ExecuteParams {
            code: "return 1".into(),
            timeout_secs,
            output_cap: None,
            variables: Map::new(),
            capabilities: None,
        }
    }

    #[test]
    fn test_oversized_timeout_is_clamped() {
        for secs in [1e300, f64::INFINITY, 500.0] {
            let request = params(Some(secs)).into_request(120.0).unwrap();
            assert_eq!(request.timeout, Some(Duration::from_secs(120)), "{secs}");
        }
        let request = params(Some(2.5)).into_request(120.0).unwrap();
        assert_eq!(request.timeout, Some(Duration::from_millis(2_500)));
        assert!(params(None).into_request(120.0).unwrap().timeout.is_none());
    }

    #[test]
    fn test_negative_or_nan_timeout_is_refused() {
        for secs in [-1.0, -0.5, f64::NAN] {
            let err = params(Some(secs)).into_request(120.0).unwrap_err();
            assert!(err.contains("invalid timeout_secs"), "{err}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_huge_timeout_executes() {
        let response =
            handle(r#"{"id": 8, "op": "execute", "code": "return 1", "timeout_secs": 1e300}"#)
                .await;
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.result.unwrap()["status"], "success");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_answers_every_line() {
        let input = concat!(
            r#"{"id": 1, "op": "execute", "code": "return 1"}"#,
            "\n\n",
            r#"{"id": 2, "op": "discover", "query": "full"}"#,
            "\n",
            r#"{"id": 3, "op": "quick_start", "service": "nope"}"#,
            "\n",
        );
        let (client, server) = tokio::io::duplex(1 << 20);
        serve(Arc::new(sandbox()), BufReader::new(input.as_bytes()), server)
            .await
            .unwrap();

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();

        let mut ids: Vec<i64> = output
            .lines()
            .map(|line| serde_json::from_str::<Json>(line).unwrap()["id"].as_i64().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_long_session_answers_while_input_stays_open() {
        let (mut input, server_in) = tokio::io::duplex(1 << 16);
        let (client_out, server_out) = tokio::io::duplex(1 << 16);
        let session = tokio::spawn(serve(
            Arc::new(sandbox()),
            BufReader::new(server_in),
            server_out,
        ));

        let mut responses = BufReader::new(client_out).lines();
        for id in 0..200 {
            let line = format!("{{\"id\": {id}, \"op\": \"execute\", \"code\": \"return {id}\"}}\n");
            input.write_all(line.as_bytes()).await.unwrap();
            let response = responses.next_line().await.unwrap().unwrap();
            let response: Json = serde_json::from_str(&response).unwrap();
            assert_eq!(response["id"], id);
            assert_eq!(response["result"]["return_value"], id);
        }

        drop(input);
        session.await.unwrap().unwrap();
        assert!(responses.next_line().await.unwrap().is_none());
    }
}
