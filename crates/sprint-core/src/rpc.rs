// Upstream JSON-RPC client (spec.md §4.2, §6). POSTs
// `getblockchaininfo`/`getmempoolinfo` with optional HTTP Basic auth
// sourced from secured memory, 3s total budget, up to 3 retries with
// 100·attempt ms linear delay.

use crate::secure::SecureBytes;
use crate::wire::{BlockchainInfoResult, MempoolInfoResult, RpcEnvelope, RpcRequest};
use log::{debug, warn};
use reqwest::Client;
use std::time::Duration;

const TOTAL_BUDGET: Duration = Duration::from_secs(3);
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct TipResult {
    pub hash: String,
    pub height: i64,
}

pub struct RpcClient {
    client: Client,
    url: String,
    user: SecureBytes,
    password: SecureBytes,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, user: SecureBytes, password: SecureBytes) -> Self {
        Self {
            client: Client::builder()
                .timeout(TOTAL_BUDGET)
                .build()
                .expect("reqwest client with a fixed timeout always builds"),
            url: url.into(),
            user,
            password,
        }
    }

    fn auth_header(&self) -> Option<String> {
        if self.user.is_empty() && self.password.is_empty() {
            None
        } else {
            Some(self.user.basic_auth_header(&self.password))
        }
    }

    /// Fetch the current tip. An empty `bestblockhash` is treated as a
    /// failure (spec.md §4.2).
    pub async fn get_tip(&self) -> Result<TipResult, String> {
        let result: BlockchainInfoResult = self.call("getblockchaininfo").await?;
        if result.bestblockhash.is_empty() {
            return Err("empty bestblockhash".to_string());
        }
        Ok(TipResult {
            hash: result.bestblockhash,
            height: result.blocks,
        })
    }

    pub async fn get_mempool_info(&self) -> Result<MempoolInfoResult, String> {
        self.call("getmempoolinfo").await
    }

    async fn call<T: for<'de> serde::Deserialize<'de>>(&self, method: &str) -> Result<T, String> {
        let body = RpcRequest::new(method);
        let mut last_err = String::new();

        for attempt in 1..=MAX_RETRIES {
            let mut req = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(auth) = self.auth_header() {
                req = req.header("Authorization", auth);
            }

            match req.send().await {
                Ok(resp) => match resp.json::<RpcEnvelope<T>>().await {
                    Ok(envelope) => {
                        if let Some(err) = envelope.error {
                            last_err = format!("rpc error {}: {}", err.code, err.message);
                        } else if let Some(result) = envelope.result {
                            return Ok(result);
                        } else {
                            last_err = "rpc response had neither result nor error".to_string();
                        }
                    }
                    Err(e) => last_err = format!("decode error: {e}"),
                },
                Err(e) => last_err = format!("request error: {e}"),
            }

            if attempt < MAX_RETRIES {
                debug!("[rpc] {method} attempt {attempt} failed: {last_err}, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
        }

        warn!("[rpc] {method} failed after {MAX_RETRIES} attempts: {last_err}");
        Err(last_err)
    }
}
