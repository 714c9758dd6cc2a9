//! JSON-RPC 2.0 ledger client.
//!
//! Maps the three collaborator operations onto the methods `getBlockHeight`,
//! `broadcastVote` and `submitTransfer`, posted to the endpoint URL. Timeouts
//! are enforced by the connection manager, not here.

use async_trait::async_trait;
use guard_core::{ChainId, LedgerClient, LedgerConnector, LedgerError, VotePayload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

fn decode_response<T: DeserializeOwned>(response: RpcResponse) -> Result<T, LedgerError> {
    if let Some(error) = response.error {
        return Err(LedgerError::Rejected(format!("{} (code {})", error.message, error.code)));
    }
    let result = response.result.unwrap_or(Value::Null);
    serde_json::from_value(result)
        .map_err(|e| LedgerError::Transport(format!("malformed result: {}", e)))
}

fn map_transport_error(endpoint: &str, error: reqwest::Error) -> LedgerError {
    if error.is_connect() {
        LedgerError::Unreachable(endpoint.to_string())
    } else if error.is_timeout() {
        LedgerError::Timeout { endpoint: endpoint.to_string(), timeout_ms: 0 }
    } else {
        LedgerError::Transport(error.to_string())
    }
}

pub struct JsonRpcLedgerClient {
    http: reqwest::Client,
    chain: ChainId,
    endpoint: String,
    next_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(http: reqwest::Client, chain: ChainId, endpoint: impl Into<String>) -> Self {
        JsonRpcLedgerClient {
            http,
            chain,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.endpoint, e))?;

        if response.status().is_server_error() {
            let status = response.status();
            return Err(LedgerError::Transport(format!("{} answered {}", self.endpoint, status)));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| map_transport_error(&self.endpoint, e))?;
        decode_response(body)
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn get_block_height(&self) -> Result<u64, LedgerError> {
        self.request("getBlockHeight", json!([])).await
    }

    async fn broadcast_vote(&self, payload: &VotePayload) -> Result<(), LedgerError> {
        let _: Value = self.request("broadcastVote", json!([payload])).await?;
        Ok(())
    }

    async fn submit_transfer(
        &self,
        destination: &ChainId,
        asset: &str,
        amount: u64,
    ) -> Result<String, LedgerError> {
        let transfer = json!({
            "source": self.chain,
            "destination": destination,
            "asset": asset,
            "amount": amount,
        });
        self.request("submitTransfer", json!([transfer])).await
    }
}

/// Builds JSON-RPC clients that share one HTTP connection pool.
#[derive(Clone, Default)]
pub struct JsonRpcConnector {
    http: reqwest::Client,
}

impl JsonRpcConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerConnector for JsonRpcConnector {
    fn connect(&self, chain: &ChainId, endpoint: &str) -> Arc<dyn LedgerClient> {
        Arc::new(JsonRpcLedgerClient::new(self.http.clone(), chain.clone(), endpoint))
    }
}
