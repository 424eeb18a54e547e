//! HTTP client for a dpasswd node
//!
//! Thin wrapper over the control-plane API. Secrets are sealed with
//! [`envelope::seal`] before [`Client::add_secret`] sends them.

pub mod envelope;

use crate::common::{Error, Result};
use reqwest::{Client as HttpClient, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Success body: `{"message": ..., "data": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: HttpClient,
}

impl Client {
    /// `addr` may be `host:port` or a full `http://` URL.
    pub fn new(addr: &str) -> Result<Self> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base_url, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `/db/<key>` with the key percent-encoded as one path segment
    fn key_url(&self, key: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.url("/db"))
            .map_err(|e| Error::Http(format!("invalid URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Http(format!("invalid base URL: {}", self.base_url)))?
            .push(key);
        Ok(url)
    }

    /// Store `value` under `key` as-is.
    pub async fn put(&self, key: &str, value: Value) -> Result<ApiResponse<Value>> {
        let res = self
            .http
            .post(self.url("/db"))
            .json(&json!({ "key": key, "value": value }))
            .send()
            .await?;
        parse(res).await
    }

    pub async fn get(&self, key: &str) -> Result<ApiResponse<Value>> {
        let res = self.http.get(self.key_url(key)?).send().await?;
        parse(res).await
    }

    pub async fn delete(&self, key: &str) -> Result<ApiResponse<Value>> {
        let res = self
            .http
            .delete(self.key_url(key)?)
            .send()
            .await?;
        parse(res).await
    }

    /// Seal `secret` under `password` and store it.
    pub async fn add_secret(&self, key: &str, secret: &[u8], password: &[u8]) -> Result<()> {
        let sealed = envelope::seal(secret, password)?;
        self.put(key, Value::String(sealed)).await?;
        Ok(())
    }

    /// Fetch and open a secret stored by [`Client::add_secret`].
    pub async fn get_secret(&self, key: &str, password: &[u8]) -> Result<Vec<u8>> {
        let res = self.get(key).await?;
        let sealed = res
            .data
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Encryption(format!("value of {} is not a sealed secret", key)))?;
        envelope::open(sealed, password)
    }

    pub async fn join(
        &self,
        node_id: &str,
        raft_address: &str,
    ) -> Result<ApiResponse<BTreeMap<String, String>>> {
        let res = self
            .http
            .post(self.url("/raft/join"))
            .json(&json!({ "node_id": node_id, "raft_address": raft_address }))
            .send()
            .await?;
        parse(res).await
    }

    pub async fn remove(&self, node_id: &str) -> Result<ApiResponse<BTreeMap<String, String>>> {
        let res = self
            .http
            .post(self.url("/raft/remove"))
            .json(&json!({ "node_id": node_id }))
            .send()
            .await?;
        parse(res).await
    }

    pub async fn stats(&self) -> Result<ApiResponse<BTreeMap<String, String>>> {
        let res = self.http.get(self.url("/raft/stats")).send().await?;
        parse(res).await
    }
}

async fn parse<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    let body = res.bytes().await?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        return Err(Error::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(serde_json::from_slice(&body)?)
}
