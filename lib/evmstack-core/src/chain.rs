//! HTTP calls the orchestrator makes against the node, the gateway, the search engine, and remote reference
//! endpoints.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A chain client error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ChainError {
    /// The request failed or the response could not be decoded.
    #[snafu(display("Request to '{}' failed.", url))]
    Http {
        /// Requested URL.
        url: String,

        /// Error source.
        source: reqwest::Error,
    },

    /// The endpoint answered with a JSON-RPC error.
    #[snafu(display("JSON-RPC error from '{}': {}", url, error))]
    Rpc {
        /// Requested URL.
        url: String,

        /// Error object returned.
        error: Value,
    },

    /// The response did not have the expected shape.
    #[snafu(display("Unexpected response from '{}': missing '{}'.", url, field))]
    UnexpectedResponse {
        /// Requested URL.
        url: String,

        /// Field that was expected.
        field: &'static str,
    },
}

impl ChainError {
    /// Returns `true` if the endpoint could not be connected to at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Http { source, .. } if source.is_connect())
    }
}

/// Subset of the node's `get_info` response.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ChainInfo {
    /// Current head block number.
    pub head_block_num: u64,

    /// Last irreversible block number.
    #[serde(default)]
    pub last_irreversible_block_num: u64,

    /// Chain ID.
    #[serde(default)]
    pub chain_id: String,
}

/// Minimal HTTP client for node, gateway, and search engine endpoints.
#[derive(Clone)]
pub struct ChainClient {
    http: reqwest::Client,
}

impl ChainClient {
    /// Creates a new `ChainClient`.
    ///
    /// # Errors
    ///
    /// If the underlying HTTP client cannot be built, an error will be returned.
    pub fn new() -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(Http { url: "<client>" })?;
        Ok(Self { http })
    }

    /// Calls `/v1/chain/get_info` on a node API endpoint such as `http://127.0.0.1:8888`.
    ///
    /// # Errors
    ///
    /// If the request fails, an error will be returned.
    pub async fn get_info(&self, endpoint: &str) -> Result<ChainInfo, ChainError> {
        let url = format!("{}/v1/chain/get_info", endpoint.trim_end_matches('/'));
        self.http
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context(Http { url: url.as_str() })?
            .json::<ChainInfo>()
            .await
            .context(Http { url })
    }

    /// Returns the head block number of a node API endpoint.
    ///
    /// # Errors
    ///
    /// If the request fails, an error will be returned.
    pub async fn head_block(&self, endpoint: &str) -> Result<u64, ChainError> {
        self.get_info(endpoint).await.map(|info| info.head_block_num)
    }

    /// Calls `eth_getBlockByNumber` on a gateway endpoint such as `http://127.0.0.1:7000/evm`.
    ///
    /// `block` is a hex quantity (`0x1b4`) or a tag such as `latest`.
    ///
    /// # Errors
    ///
    /// If the request fails, the endpoint returns an error, or the block does not exist, an error will be returned.
    pub async fn eth_get_block_by_number(&self, endpoint: &str, block: &str) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "eth_getBlockByNumber",
            "params": [block, false],
            "id": 1,
        });
        let response = self
            .http
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context(Http { url: endpoint })?
            .json::<Value>()
            .await
            .context(Http { url: endpoint })?;

        if let Some(error) = response.get("error") {
            return Rpc {
                url: endpoint,
                error: error.clone(),
            }
            .fail();
        }
        response
            .get("result")
            .filter(|result| !result.is_null())
            .cloned()
            .context(UnexpectedResponse {
                url: endpoint,
                field: "result",
            })
    }

    /// Returns the highest block number indexed in the search engine under `index_pattern`, or `None` if nothing is
    /// indexed yet.
    ///
    /// # Errors
    ///
    /// If the request fails, an error will be returned.
    pub async fn max_indexed_block(&self, search_url: &str, index_pattern: &str) -> Result<Option<u64>, ChainError> {
        let url = format!("{}/{}/_search", search_url.trim_end_matches('/'), index_pattern);
        let body = json!({
            "size": 0,
            "aggs": { "max_block": { "max": { "field": "block_num" } } },
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .context(Http { url: url.as_str() })?
            .json::<Value>()
            .await
            .context(Http { url: url.as_str() })?;

        let max = response
            .pointer("/aggregations/max_block")
            .context(UnexpectedResponse {
                url,
                field: "aggregations.max_block",
            })?;
        Ok(max.get("value").and_then(Value::as_f64).map(|value| value as u64))
    }

    /// Registers an index pattern with the dashboard.
    ///
    /// # Errors
    ///
    /// If the request fails or the dashboard does not answer with JSON, an error will be returned.
    pub async fn register_index_pattern(&self, dashboard_url: &str, title: &str) -> Result<Value, ChainError> {
        let url = format!("{}/api/index_patterns/index_pattern", dashboard_url.trim_end_matches('/'));
        let body = json!({
            "index_pattern": {
                "title": title,
                "timeFieldName": "@timestamp",
            }
        });
        self.http
            .post(&url)
            .header("kbn-xsrf", "true")
            .json(&body)
            .send()
            .await
            .context(Http { url: url.as_str() })?
            .json::<Value>()
            .await
            .context(Http { url })
    }
}
