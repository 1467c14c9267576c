use std::time::Duration;

use netsync_types::{Aggregation, MacAddr, Network, Nic, NicPatch};
use reqwest::header::{HeaderMap, ETAG, IF_MATCH};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NapiError {
    #[error("transport error talking to NetAPI: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected NetAPI status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// GET/PUT outcome. 404 is not an error: reconcilers branch on it.
#[derive(Debug)]
pub enum Fetched<T> {
    Found { body: T, etag: Option<String> },
    Missing,
}

/// DELETE outcome. 404 and 412 drive distinct transitions.
#[derive(Debug, PartialEq, Eq)]
pub enum Deleted {
    Done,
    Missing,
    Conflict,
}

/// Thin wrapper over the network API. Shares one pooled client; every
/// response's Etag is surfaced, never parsed.
#[derive(Clone)]
pub struct NapiClient {
    http: reqwest::Client,
    base: String,
}

impl NapiClient {
    pub fn new(base: &str) -> Result<Self, NapiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get_nic(&self, mac: MacAddr) -> Result<Fetched<Nic>, NapiError> {
        let resp = self
            .http
            .get(format!("{}/nics/{mac}", self.base))
            .send()
            .await?;
        fetched(resp).await
    }

    /// Registers a NIC NetAPI does not know about. `check_owner` is
    /// disabled: the node is authoritative for what exists on it.
    pub async fn create_nic(&self, mac: MacAddr, nic: &Nic) -> Result<(Nic, Option<String>), NapiError> {
        let resp = self
            .http
            .post(format!("{}/nics/{mac}", self.base))
            .json(&with_check_owner(nic))
            .send()
            .await?;
        created(resp).await
    }

    /// Pushes local-authoritative fields up. A 404 means NetAPI dropped
    /// the NIC between our GET and this PUT.
    pub async fn update_nic(
        &self,
        mac: MacAddr,
        patch: &NicPatch,
    ) -> Result<Fetched<Nic>, NapiError> {
        let resp = self
            .http
            .put(format!("{}/nics/{mac}", self.base))
            .json(&with_check_owner(patch))
            .send()
            .await?;
        fetched(resp).await
    }

    /// Optimistic-concurrency DELETE: the caller must hold a current Etag.
    pub async fn delete_nic(&self, mac: MacAddr, etag: &str) -> Result<Deleted, NapiError> {
        let resp = self
            .http
            .delete(format!("{}/nics/{mac}", self.base))
            .header(IF_MATCH, etag)
            .send()
            .await?;
        deleted(resp).await
    }

    pub async fn get_network(&self, uuid: Uuid) -> Result<Fetched<Network>, NapiError> {
        let resp = self
            .http
            .get(format!("{}/networks/{uuid}", self.base))
            .send()
            .await?;
        fetched(resp).await
    }

    pub async fn get_aggregation(&self, id: &str) -> Result<Fetched<Aggregation>, NapiError> {
        let resp = self
            .http
            .get(format!("{}/aggregations/{id}", self.base))
            .send()
            .await?;
        fetched(resp).await
    }

    pub async fn create_aggregation(
        &self,
        aggr: &Aggregation,
    ) -> Result<(Aggregation, Option<String>), NapiError> {
        let resp = self
            .http
            .post(format!("{}/aggregations", self.base))
            .json(&with_check_owner(aggr))
            .send()
            .await?;
        created(resp).await
    }

    pub async fn delete_aggregation(&self, id: &str, etag: &str) -> Result<Deleted, NapiError> {
        let resp = self
            .http
            .delete(format!("{}/aggregations/{id}", self.base))
            .header(IF_MATCH, etag)
            .send()
            .await?;
        deleted(resp).await
    }
}

fn etag_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn with_check_owner<T: serde::Serialize>(body: &T) -> serde_json::Value {
    let mut value = serde_json::to_value(body).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("check_owner".into(), serde_json::Value::Bool(false));
    }
    value
}

async fn fetched<T: serde::de::DeserializeOwned>(resp: Response) -> Result<Fetched<T>, NapiError> {
    match resp.status() {
        StatusCode::NOT_FOUND => Ok(Fetched::Missing),
        status if status.is_success() => {
            let etag = etag_of(resp.headers());
            let body = resp.json().await?;
            Ok(Fetched::Found { body, etag })
        }
        status => Err(status_error(status, resp).await),
    }
}

async fn created<T: serde::de::DeserializeOwned>(
    resp: Response,
) -> Result<(T, Option<String>), NapiError> {
    let status = resp.status();
    if status.is_success() {
        let etag = etag_of(resp.headers());
        let body = resp.json().await?;
        Ok((body, etag))
    } else {
        Err(status_error(status, resp).await)
    }
}

async fn deleted(resp: Response) -> Result<Deleted, NapiError> {
    match resp.status() {
        StatusCode::NOT_FOUND => Ok(Deleted::Missing),
        StatusCode::PRECONDITION_FAILED => Ok(Deleted::Conflict),
        status if status.is_success() => Ok(Deleted::Done),
        status => Err(status_error(status, resp).await),
    }
}

async fn status_error(status: StatusCode, resp: Response) -> NapiError {
    let body = resp.text().await.unwrap_or_default();
    NapiError::Status { status, body }
}
