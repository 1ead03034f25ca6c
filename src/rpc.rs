//! JSON-RPC 2.0 client for the execution backend.
//!
//! Two transports speak the same protocol: a persistent TCP socket carrying
//! newline-delimited JSON (the backend's native framing) and plain HTTP
//! POST. Every call carries a timeout; transport failures reconnect and
//! retry with exponential backoff plus jitter, protocol errors surface as
//! typed values immediately (retrying a malformed request cannot help).
//!
//! An optional transcript recorder captures every request/response pair;
//! bug-report archives and the replay backend are built from it.

use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Protocol version string sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error code for a request the backend could not parse.
pub const CODE_PARSE: i64 = -32700;
/// Error code for a structurally invalid request.
pub const CODE_INVALID_REQUEST: i64 = -32600;
/// Error code for an unknown method.
pub const CODE_UNKNOWN_METHOD: i64 = -32601;
/// Error code for bad parameters.
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// Error code for an implication the backend could not decide.
pub const CODE_IMPLICATION_FAILED: i64 = -32003;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The transport kept failing after every retry.
    #[error("backend transport failed after {attempts} attempts: {reason}")]
    Transport { attempts: u32, reason: String },
    /// A single call exceeded its deadline on every retry.
    #[error("backend call `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    /// The backend answered with a protocol-level error object.
    #[error("backend protocol error {code}: {message}")]
    Protocol { code: i64, message: String, data: Option<Value> },
    /// `implies` came back undecided (code -32003). Not retryable; the
    /// proof records the node as undecided and moves on.
    #[error("implication check failed: {0}")]
    ImplicationFailed(String),
    /// The response was not valid JSON-RPC.
    #[error("malformed backend response: {0}")]
    BadResponse(String),
}

impl RpcError {
    /// Map a JSON-RPC error object to a typed error.
    fn from_error_object(error: &Value) -> RpcError {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if code == CODE_IMPLICATION_FAILED {
            return RpcError::ImplicationFailed(message);
        }
        RpcError::Protocol { code, message, data: error.get("data").cloned() }
    }
}

/// Where and how to reach the backend server.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Newline-delimited JSON over a persistent TCP connection.
    Tcp { addr: String },
    /// One HTTP POST per request.
    Http { url: String },
}

/// One recorded request/response exchange.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub method: String,
    pub request: Value,
    pub response: Value,
}

/// The full exchange history of a proof run, in call order.
///
/// Several clients (one per worker) may record into one transcript; the
/// handle form below makes that sharing explicit.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub entries: Vec<TranscriptEntry>,
}

/// A transcript shared between clients and the bug-report writer.
pub type TranscriptHandle = std::sync::Arc<std::sync::Mutex<Transcript>>;

/// A fresh shared transcript.
pub fn transcript_handle() -> TranscriptHandle {
    TranscriptHandle::default()
}

enum Connection {
    Tcp(Option<BufStream<TcpStream>>),
    Http(reqwest::Client),
}

/// A JSON-RPC 2.0 client with per-call timeout and bounded retry.
pub struct JsonRpcClient {
    transport: Transport,
    connection: Connection,
    timeout: Duration,
    max_retries: u32,
    next_id: u64,
    transcript: Option<TranscriptHandle>,
}

impl JsonRpcClient {
    pub fn new(transport: Transport, timeout: Duration, max_retries: u32) -> Self {
        let connection = match &transport {
            Transport::Tcp { .. } => Connection::Tcp(None),
            Transport::Http { .. } => Connection::Http(reqwest::Client::new()),
        };
        JsonRpcClient {
            transport,
            connection,
            timeout,
            max_retries,
            next_id: 0,
            transcript: None,
        }
    }

    /// Record request/response pairs into `transcript` (for bug reports).
    pub fn record_transcript(&mut self, transcript: TranscriptHandle) {
        self.transcript = Some(transcript);
    }

    /// Issue one JSON-RPC call and return its `result`.
    pub async fn request(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.next_id += 1;
        let id = self.next_id;
        let envelope = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });

        let mut last_failure = String::new();
        let mut attempts = 0;
        while attempts <= self.max_retries {
            attempts += 1;
            if attempts > 1 {
                let backoff = backoff_delay(attempts - 2);
                debug!(method, attempt = attempts, ?backoff, "retrying backend call");
                tokio::time::sleep(backoff).await;
            }

            let outcome = tokio::time::timeout(self.timeout, self.exchange(&envelope)).await;
            let response = match outcome {
                Err(_elapsed) => {
                    warn!(method, timeout = ?self.timeout, "backend call timed out");
                    last_failure = format!("timed out after {:?}", self.timeout);
                    self.reset_connection();
                    continue;
                }
                Ok(Err(reason)) => {
                    warn!(method, %reason, "backend transport failure");
                    last_failure = reason;
                    self.reset_connection();
                    continue;
                }
                Ok(Ok(response)) => response,
            };

            if let Some(handle) = &self.transcript {
                if let Ok(mut t) = handle.lock() {
                    t.entries.push(TranscriptEntry {
                        method: method.to_string(),
                        request: envelope.clone(),
                        response: response.clone(),
                    });
                }
            }
            return interpret_response(&response, id);
        }

        if last_failure.starts_with("timed out") {
            return Err(RpcError::Timeout { method: method.to_string(), timeout: self.timeout });
        }
        Err(RpcError::Transport { attempts, reason: last_failure })
    }

    fn reset_connection(&mut self) {
        if let Connection::Tcp(conn) = &mut self.connection {
            *conn = None;
        }
    }

    /// One send/receive on the underlying transport. Errors here are
    /// transport-level and retryable; stringly typed on purpose so TCP and
    /// HTTP failures flow through the same retry loop.
    async fn exchange(&mut self, envelope: &Value) -> Result<Value, String> {
        match (&self.transport, &mut self.connection) {
            (Transport::Tcp { addr }, Connection::Tcp(conn)) => {
                if conn.is_none() {
                    let stream =
                        TcpStream::connect(addr).await.map_err(|e| format!("connect {addr}: {e}"))?;
                    *conn = Some(BufStream::new(stream));
                }
                let stream = match conn.as_mut() {
                    Some(s) => s,
                    None => return Err("connection lost".to_string()),
                };
                let mut line = envelope.to_string();
                line.push('\n');
                stream
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| format!("send: {e}"))?;
                stream.flush().await.map_err(|e| format!("send: {e}"))?;

                let mut reply = String::new();
                let read = stream
                    .read_line(&mut reply)
                    .await
                    .map_err(|e| format!("recv: {e}"))?;
                if read == 0 {
                    return Err("socket closed".to_string());
                }
                serde_json::from_str(&reply).map_err(|e| format!("recv: invalid JSON: {e}"))
            }
            (Transport::Http { url }, Connection::Http(client)) => {
                let response = client
                    .post(url)
                    .json(envelope)
                    .send()
                    .await
                    .map_err(|e| format!("post {url}: {e}"))?;
                response
                    .json::<Value>()
                    .await
                    .map_err(|e| format!("recv: invalid JSON: {e}"))
            }
            _ => Err("transport/connection mismatch".to_string()),
        }
    }
}

/// Validate the response envelope and extract the result.
fn interpret_response(response: &Value, expect_id: u64) -> Result<Value, RpcError> {
    let obj = response
        .as_object()
        .ok_or_else(|| RpcError::BadResponse(format!("not an object: {response}")))?;
    if let Some(error) = obj.get("error") {
        return Err(RpcError::from_error_object(error));
    }
    match obj.get("id").and_then(Value::as_u64) {
        Some(id) if id == expect_id => {}
        other => {
            return Err(RpcError::BadResponse(format!(
                "response id {other:?} does not match request id {expect_id}"
            )))
        }
    }
    obj.get("result")
        .cloned()
        .ok_or_else(|| RpcError::BadResponse("response without result".to_string()))
}

/// Exponential backoff with jitter: 100ms * 2^n plus up to 50ms.
fn backoff_delay(retry: u32) -> Duration {
    let base = Duration::from_millis(100) * 2u32.saturating_pow(retry.min(6));
    base + Duration::from_millis(rand::thread_rng().gen_range(0..50))
}

/// A backend server process owned by the driver.
///
/// Extra options from `KORE_EXEC_OPTS` are appended to the command line,
/// mirroring how the backend toolchain reads that variable. The child is
/// killed when the handle drops.
pub struct BackendProcess {
    child: tokio::process::Child,
}

impl BackendProcess {
    pub fn spawn(command: &str) -> std::io::Result<BackendProcess> {
        let mut words = command.split_whitespace();
        let program = words.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty server command")
        })?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(words);
        if let Ok(opts) = std::env::var("KORE_EXEC_OPTS") {
            cmd.args(opts.split_whitespace());
        }
        cmd.kill_on_drop(true);
        let child = cmd.spawn()?;
        Ok(BackendProcess { child })
    }

    pub async fn shutdown(mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A one-shot backend: reads newline-delimited requests, answers with
    /// `respond(request)`.
    async fn serve(listener: TcpListener, respond: fn(&Value) -> Value) {
        let Ok((stream, _)) = listener.accept().await else { return };
        let mut stream = BufStream::new(stream);
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let request: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => return,
            };
            let mut reply = respond(&request).to_string();
            reply.push('\n');
            if stream.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            if stream.flush().await.is_err() {
                return;
            }
        }
    }

    async fn client_for(respond: fn(&Value) -> Value) -> JsonRpcClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, respond));
        JsonRpcClient::new(Transport::Tcp { addr }, Duration::from_secs(1), 0)
    }

    #[tokio::test]
    async fn request_roundtrip_over_tcp() {
        let mut client = client_for(|req| {
            json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {"echo": req["params"]["x"]},
            })
        })
        .await;

        let result = client.request("execute", json!({"x": 41})).await.unwrap();
        assert_eq!(result, json!({"echo": 41}));

        // ids are monotone and matched per call
        let again = client.request("execute", json!({"x": 42})).await.unwrap();
        assert_eq!(again, json!({"echo": 42}));
    }

    #[tokio::test]
    async fn protocol_errors_are_typed() {
        let mut client = client_for(|req| {
            json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32601, "message": "method not found"},
            })
        })
        .await;

        let err = client.request("nope", json!({})).await.unwrap_err();
        match err {
            RpcError::Protocol { code, message, .. } => {
                assert_eq!(code, CODE_UNKNOWN_METHOD);
                assert!(message.contains("not found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn implication_failure_is_not_a_protocol_error() {
        let mut client = client_for(|req| {
            json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32003, "message": "implication check failed"},
            })
        })
        .await;

        let err = client.request("implies", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::ImplicationFailed(_)));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_rejected() {
        let mut client = client_for(|_req| {
            json!({"jsonrpc": "2.0", "id": 999, "result": {}})
        })
        .await;

        let err = client.request("execute", json!({})).await.unwrap_err();
        assert!(matches!(err, RpcError::BadResponse(_)));
    }

    #[tokio::test]
    async fn transport_failure_reports_attempts() {
        // nothing is listening on this port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut client =
            JsonRpcClient::new(Transport::Tcp { addr }, Duration::from_millis(200), 1);
        let err = client.request("execute", json!({})).await.unwrap_err();
        match err {
            RpcError::Transport { attempts, .. } => assert_eq!(attempts, 2),
            RpcError::Timeout { .. } => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transcript_records_exchanges() {
        let mut client = client_for(|req| {
            json!({"jsonrpc": "2.0", "id": req["id"], "result": []})
        })
        .await;
        let handle = transcript_handle();
        client.record_transcript(handle.clone());

        client.request("add-module", json!({"module": "LEMMAS"})).await.unwrap();
        let transcript = handle.lock().unwrap();
        assert_eq!(transcript.entries.len(), 1);
        assert_eq!(transcript.entries[0].method, "add-module");
        assert_eq!(transcript.entries[0].request["params"]["module"], json!("LEMMAS"));
    }
}
