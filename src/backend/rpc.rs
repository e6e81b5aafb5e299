//! JSON-RPC `getwork` backend client.
//!
//! Polls the upstream node on a fixed cadence, switching to long polling
//! whenever the node advertises an `X-Long-Polling` URL. Block height
//! changes arrive through the `X-Blocknum` response header.

use super::{AssignedWork, Backend, BackendEvents, BackendUrl};
use crate::core::constants::WORK_SIZE;
use crate::core::Target;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Poll cadence used while recovering when the configured askrate is zero.
const RECOVERY_ASKRATE: u64 = 15;

/// Result submissions are padded to the full 128-byte getwork frame.
const SUBMIT_PADDING: usize = 48;

#[derive(Serialize)]
struct GetworkRequest {
    method: &'static str,
    params: Vec<String>,
    id: u32,
}

impl GetworkRequest {
    fn fetch() -> Self {
        Self {
            method: "getwork",
            params: Vec::new(),
            id: 1,
        }
    }

    fn submit(result: String) -> Self {
        Self {
            method: "getwork",
            params: vec![result],
            id: 1,
        }
    }
}

#[derive(Debug)]
enum PollError {
    /// Transport or response-shape problem
    Transport(String),
    /// The upstream answered with a JSON-RPC error object
    Upstream(String),
}

struct PollOutcome {
    work: AssignedWork,
    long_poll: Option<String>,
    block: Option<u64>,
    /// Whether this was a plain RPC poll; only those update the long-poll
    /// path, pushes merely re-arm it.
    rpc: bool,
}

enum PollKind<'a> {
    Rpc,
    LongPoll(&'a str),
}

/// Backend client for a Bitcoin-node JSON-RPC upstream.
pub struct RpcBackend {
    http: reqwest::Client,
    url: BackendUrl,
    askrate: u64,
    kick: Notify,
}

impl RpcBackend {
    /// Create a client; it does nothing until [`RpcBackend::spawn`].
    pub fn new(url: BackendUrl, askrate: u64) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder().build()?;
        Ok(Arc::new(Self {
            http,
            url,
            askrate,
            kick: Notify::new(),
        }))
    }

    /// Start the poll loop, reporting into the given handler.
    pub fn spawn(self: &Arc<Self>, events: Arc<dyn BackendEvents>) {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run(events).await });
    }

    async fn run(self: Arc<Self>, events: Arc<dyn BackendEvents>) {
        let mut connected = false;
        let mut block: Option<u64> = None;
        let mut long_poll: Option<String> = None;

        loop {
            let outcome = match &long_poll {
                Some(path) => {
                    let url = self.resolve(path);
                    tokio::select! {
                        res = self.poll(PollKind::LongPoll(&url)) => res,
                        // The provider wants work mid long-poll; interrupt
                        // and issue a plain poll, the long poll re-arms on
                        // the next pass.
                        _ = self.kick.notified() => self.poll(PollKind::Rpc).await,
                    }
                }
                None => self.poll(PollKind::Rpc).await,
            };

            match outcome {
                Ok(poll) => {
                    if !connected {
                        connected = true;
                        events.on_connect();
                    }
                    events.on_work(poll.work);
                    if let Some(height) = poll.block {
                        if block != Some(height) {
                            block = Some(height);
                            events.on_block(height);
                        }
                    }
                    if poll.rpc {
                        if long_poll != poll.long_poll {
                            match &poll.long_poll {
                                Some(url) => debug!("upstream offers long polling at {}", url),
                                None => debug!("upstream stopped offering long polling"),
                            }
                        }
                        long_poll = poll.long_poll;
                    }
                }
                Err(err) => {
                    match err {
                        PollError::Upstream(msg) => {
                            warn!("upstream error: {}", msg);
                            events.on_message(&msg);
                        }
                        PollError::Transport(msg) => warn!("backend poll failed: {}", msg),
                    }
                    if connected {
                        connected = false;
                        events.on_disconnect();
                    } else {
                        events.on_failure();
                    }
                    long_poll = None;
                }
            }

            if long_poll.is_none() {
                self.wait_for_next_poll(connected).await;
            }
        }
    }

    /// Sleep until the next scheduled poll or an explicit work request. A
    /// zero askrate disables scheduled polling entirely while connected but
    /// still retries while the upstream is unreachable.
    async fn wait_for_next_poll(&self, connected: bool) {
        if connected && self.askrate == 0 {
            self.kick.notified().await;
            return;
        }

        let askrate = if self.askrate > 0 {
            self.askrate
        } else {
            RECOVERY_ASKRATE
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(askrate)) => {}
            _ = self.kick.notified() => {}
        }
    }

    async fn poll(&self, kind: PollKind<'_>) -> std::result::Result<PollOutcome, PollError> {
        let rpc = matches!(kind, PollKind::Rpc);
        let request = match kind {
            PollKind::Rpc => self
                .http
                .post(self.url.http_url())
                .json(&GetworkRequest::fetch()),
            PollKind::LongPoll(url) => self.http.get(url),
        };

        let response = request
            .basic_auth(&self.url.username, Some(&self.url.password))
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PollError::Transport(format!(
                "upstream returned HTTP {}",
                response.status()
            )));
        }

        let long_poll = response
            .headers()
            .get("x-long-polling")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let block = response
            .headers()
            .get("x-blocknum")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let body = response
            .text()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;
        let work = parse_getwork(&body)?;

        Ok(PollOutcome {
            work,
            long_poll,
            block,
            rpc,
        })
    }

    /// Resolve a long-poll URL, which may be absolute or relative to the
    /// backend origin.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.url.origin(), path)
        } else {
            format!("{}/{}", self.url.origin(), path)
        }
    }
}

#[async_trait]
impl Backend for RpcBackend {
    fn request_work(&self) {
        self.kick.notify_one();
    }

    async fn submit(&self, result: &[u8]) -> Result<bool> {
        let mut padded = result.to_vec();
        padded.resize(padded.len() + SUBMIT_PADDING, 0);

        let response = self
            .http
            .post(self.url.http_url())
            .basic_auth(&self.url.username, Some(&self.url.password))
            .json(&GetworkRequest::submit(hex::encode(padded)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::protocol(format!(
                "submission rejected with HTTP {}",
                response.status()
            )));
        }
        let value: Value = response.json().await?;

        if value.get("error").is_some_and(|e| !e.is_null()) {
            return Ok(false);
        }
        Ok(value.get("result").is_some_and(truthy))
    }
}

/// Parse a getwork response body into a work assignment.
fn parse_getwork(body: &str) -> std::result::Result<AssignedWork, PollError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PollError::Transport(format!("unparseable response: {}", e)))?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified upstream error");
        return Err(PollError::Upstream(message.to_string()));
    }

    let result = value
        .get("result")
        .filter(|r| !r.is_null())
        .ok_or_else(|| PollError::Transport("response carries no result".into()))?;

    let data_hex = result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| PollError::Transport("result carries no data".into()))?;
    let mut data = hex::decode(data_hex)
        .map_err(|e| PollError::Transport(format!("bad data hex: {}", e)))?;
    if data.len() < WORK_SIZE {
        return Err(PollError::Transport(format!(
            "short work data: {} bytes",
            data.len()
        )));
    }
    data.truncate(WORK_SIZE);

    let mask = result.get("mask").and_then(Value::as_u64).unwrap_or(32);
    if mask > 32 {
        return Err(PollError::Transport(format!("bad work mask: {}", mask)));
    }

    let target_hex = result
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| PollError::Transport("result carries no target".into()))?;
    let target_bytes = hex::decode(target_hex)
        .map_err(|e| PollError::Transport(format!("bad target hex: {}", e)))?;
    let target = Target::from_slice(&target_bytes)
        .map_err(|e| PollError::Transport(e.to_string()))?;

    Ok(AssignedWork {
        data,
        mask: mask as u8,
        target,
    })
}

/// Truthiness of a JSON-RPC result, matching loose upstream conventions.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(data_len: usize, mask: Option<u64>) -> String {
        let data = "ab".repeat(data_len);
        let target = "00".repeat(32);
        match mask {
            Some(mask) => format!(
                r#"{{"result":{{"data":"{}","mask":{},"target":"{}"}},"error":null,"id":1}}"#,
                data, mask, target
            ),
            None => format!(
                r#"{{"result":{{"data":"{}","target":"{}"}},"error":null,"id":1}}"#,
                data, target
            ),
        }
    }

    #[test]
    fn test_parse_getwork_truncates_padding() {
        let work = parse_getwork(&body(128, Some(30))).unwrap();
        assert_eq!(work.data.len(), WORK_SIZE);
        assert_eq!(work.mask, 30);
    }

    #[test]
    fn test_parse_getwork_defaults_mask() {
        let work = parse_getwork(&body(80, None)).unwrap();
        assert_eq!(work.mask, 32);
    }

    #[test]
    fn test_parse_getwork_rejects_short_data() {
        assert!(parse_getwork(&body(79, None)).is_err());
    }

    #[test]
    fn test_parse_getwork_rejects_oversized_mask() {
        assert!(parse_getwork(&body(80, Some(33))).is_err());
    }

    #[test]
    fn test_parse_getwork_upstream_error() {
        let body = r#"{"result":null,"error":{"code":-10,"message":"no work"},"id":1}"#;
        match parse_getwork(body) {
            Err(PollError::Upstream(msg)) => assert_eq!(msg, "no work"),
            _ => panic!("expected upstream error"),
        }
    }

    #[test]
    fn test_parse_getwork_garbage() {
        assert!(matches!(
            parse_getwork("it broke"),
            Err(PollError::Transport(_))
        ));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&serde_json::json!(true)));
        assert!(truthy(&serde_json::json!(1)));
        assert!(truthy(&serde_json::json!("ok")));
        assert!(!truthy(&serde_json::json!(false)));
        assert!(!truthy(&serde_json::json!(0)));
        assert!(!truthy(&serde_json::json!("")));
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_resolve_long_poll_url() {
        let url: BackendUrl = "http://u:p@127.0.0.1:8332".parse().unwrap();
        let client = RpcBackend::new(url, 10).unwrap();

        assert_eq!(
            client.resolve("/lp"),
            "http://127.0.0.1:8332/lp".to_string()
        );
        assert_eq!(client.resolve("lp"), "http://127.0.0.1:8332/lp".to_string());
        assert_eq!(
            client.resolve("http://other:99/lp"),
            "http://other:99/lp".to_string()
        );
    }
}
