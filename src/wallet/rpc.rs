//! JSON-RPC 1.0 client for phored.
//!
//! `NodeRpc` is the seam the rest of the wallet talks to; `RpcClient` is
//! the HTTP implementation and tests substitute an in-memory node.

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::WalletConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListUnspentResult {
    pub txid: String,
    pub vout: u32,
    #[serde(default)]
    pub address: String,
    pub script_pub_key: String,
    pub amount: f64,
    pub confirmations: i64,
    #[serde(default)]
    pub spendable: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GetTransactionDetail {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub category: String,
    pub amount: f64,
    #[serde(default)]
    pub vout: u32,
    #[serde(default)]
    pub involveswatchonly: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GetTransactionResult {
    pub txid: String,
    pub amount: f64,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub blocktime: i64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub timereceived: i64,
    #[serde(default)]
    pub details: Vec<GetTransactionDetail>,
    #[serde(default)]
    pub hex: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BlockHeaderVerbose {
    pub hash: String,
    pub height: i64,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub previousblockhash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InfoResult {
    pub blocks: i64,
    #[serde(default)]
    pub connections: i64,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default)]
    pub relayfee: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WalletInfoResult {
    pub balance: f64,
    #[serde(default)]
    pub unconfirmed_balance: f64,
    #[serde(default)]
    pub immature_balance: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ListTransactionsResult {
    pub txid: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub category: String,
    pub amount: f64,
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub timereceived: i64,
    #[serde(default)]
    pub involveswatchonly: bool,
}

/// Calls phored exposes to the wallet.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Escape hatch for methods without a typed wrapper.
    async fn raw_request(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    async fn list_unspent(&self) -> Result<Vec<ListUnspentResult>> {
        decode(self.raw_request("listunspent", vec![]).await?)
    }

    async fn get_transaction(&self, txid: &str, include_watch_only: bool) -> Result<GetTransactionResult> {
        decode(self.raw_request("gettransaction", vec![json!(txid), json!(include_watch_only)]).await?)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String> {
        decode(self.raw_request("sendrawtransaction", vec![json!(hex::encode(raw))]).await?)
    }

    async fn get_block_header_verbose(&self, hash: &str) -> Result<BlockHeaderVerbose> {
        decode(self.raw_request("getblockheader", vec![json!(hash), json!(true)]).await?)
    }

    async fn get_info(&self) -> Result<InfoResult> {
        decode(self.raw_request("getinfo", vec![]).await?)
    }

    async fn get_best_block_hash(&self) -> Result<String> {
        decode(self.raw_request("getbestblockhash", vec![]).await?)
    }

    async fn get_block_count(&self) -> Result<i64> {
        decode(self.raw_request("getblockcount", vec![]).await?)
    }

    async fn import_address_rescan(&self, address: &str, account: &str, rescan: bool) -> Result<()> {
        self.raw_request("importaddress", vec![json!(address), json!(account), json!(rescan)])
            .await
            .map(|_| ())
    }

    async fn get_account_address(&self, account: &str) -> Result<String> {
        decode(self.raw_request("getaccountaddress", vec![json!(account)]).await?)
    }

    async fn get_new_address(&self, account: &str) -> Result<String> {
        decode(self.raw_request("getnewaddress", vec![json!(account)]).await?)
    }

    async fn dump_priv_key(&self, address: &str) -> Result<String> {
        decode(self.raw_request("dumpprivkey", vec![json!(address)]).await?)
    }

    async fn get_wallet_info(&self) -> Result<WalletInfoResult> {
        decode(self.raw_request("getwalletinfo", vec![]).await?)
    }

    async fn list_transactions(&self, account: &str) -> Result<Vec<ListTransactionsResult>> {
        decode(
            self.raw_request("listtransactions", vec![json!(account), json!(10_000), json!(0), json!(true)])
                .await?,
        )
    }

    async fn stop(&self) -> Result<()> {
        self.raw_request("stop", vec![]).await.map(|_| ())
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::RpcDecode(e.to_string()))
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// HTTP POST JSON-RPC 1.0 with basic auth, no TLS.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(host: &str, user: &str, password: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RpcUnreachable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("http://{}/", host),
            user: user.to_string(),
            password: password.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(cfg: &WalletConfig) -> Result<Self> {
        Self::new(&cfg.rpc_host, &cfg.rpc_user, &cfg.rpc_password, cfg.rpc_timeout())
    }
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn raw_request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("rpc {} #{}", method, id);
        let body = RpcRequest { jsonrpc: "1.0", id, method, params };
        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::RpcUnreachable(format!("{}: {}", method, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::RpcUnreachable(format!("{}: {}", method, e)))?;
        // phored answers errors with HTTP 500 and a JSON body
        let parsed: RpcResponse = serde_json::from_str(&text).map_err(|e| {
            Error::RpcDecode(format!("{} (status {}): {}", method, status, e))
        })?;
        if let Some(err) = parsed.error {
            return Err(Error::Rpc { code: err.code, message: err.message });
        }
        Ok(parsed.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    async fn handle(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(req): Json<Value>,
    ) -> Json<Value> {
        let method = req["method"].as_str().unwrap_or_default().to_string();
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        seen.calls.lock().unwrap().push((method.clone(), auth));
        let id = req["id"].clone();
        match method.as_str() {
            "getblockcount" => Json(json!({"result": 1234, "error": null, "id": id})),
            "getwalletinfo" => Json(json!({
                "result": {"balance": 1.5, "unconfirmed_balance": 0.25}, "error": null, "id": id
            })),
            _ => Json(json!({
                "result": null, "error": {"code": -32601, "message": "Method not found"}, "id": id
            })),
        }
    }

    async fn spawn_node() -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new().route("/", post(handle)).with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr.to_string(), seen)
    }

    #[tokio::test]
    async fn typed_calls_decode_results() {
        let (host, seen) = spawn_node().await;
        let client = RpcClient::new(&host, "user", "pass", Duration::from_secs(5)).unwrap();
        assert_eq!(client.get_block_count().await.unwrap(), 1234);
        let info = client.get_wallet_info().await.unwrap();
        assert_eq!(info.balance, 1.5);
        assert_eq!(info.unconfirmed_balance, 0.25);

        let calls = seen.calls.lock().unwrap();
        assert_eq!(calls[0].0, "getblockcount");
        // base64("user:pass")
        assert_eq!(calls[0].1.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn daemon_errors_are_typed() {
        let (host, _) = spawn_node().await;
        let client = RpcClient::new(&host, "u", "p", Duration::from_secs(5)).unwrap();
        match client.raw_request("bogus", vec![]).await {
            Err(Error::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("unexpected {:?}", other),
        }
        // result shape mismatch is a decode error
        assert!(matches!(client.get_best_block_hash().await, Err(Error::RpcDecode(_)) | Err(Error::Rpc { .. })));
    }

    #[tokio::test]
    async fn unreachable_daemon() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = RpcClient::new(&addr.to_string(), "u", "p", Duration::from_secs(2)).unwrap();
        assert!(matches!(client.get_block_count().await, Err(Error::RpcUnreachable(_))));
    }
}
