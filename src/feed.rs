//! HTTP boundary to the OData service: a thin GET-with-basic-auth client
//! behind the [`FeedTransport`] trait so pagers can be tested offline.
use crate::schema::SchemaCatalog;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::debug;

const JSON_FORMAT_FILTER: &str = "?$format=json;odata=nometadata&";

/// A completed HTTP exchange, reduced to what the pagers need.
#[derive(Debug, Clone)]
pub struct FeedResponse {
    pub status: u16,
    pub body: String,
}

impl FeedResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<FeedResponse>;
}

#[derive(Clone)]
pub struct FeedClient {
    http: Client,
    login: String,
    password: String,
}

impl fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedClient")
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl FeedClient {
    pub fn new(login: String, password: String, timeout_secs: u64) -> Self {
        let http = Client::builder()
            .user_agent("odata-sync/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            http,
            login,
            password,
        }
    }
}

#[async_trait]
impl FeedTransport for FeedClient {
    async fn get(&self, url: &str) -> Result<FeedResponse> {
        debug!(%url, "sending feed request");
        let res = self
            .http
            .get(url)
            .basic_auth(&self.login, Some(&self.password))
            .send()
            .await
            .context("failed to reach feed")?;
        let status = res.status().as_u16();
        let body = res.text().await.context("failed to read feed body")?;
        Ok(FeedResponse { status, body })
    }
}

/// Ensure a data request asks for the JSON envelope format.
pub fn ensure_json_format(url: &str) -> String {
    if url.contains(JSON_FORMAT_FILTER) {
        url.to_string()
    } else if url.contains('?') {
        url.replacen('?', JSON_FORMAT_FILTER, 1)
    } else {
        format!("{url}{JSON_FORMAT_FILTER}")
    }
}

/// Fetch and parse the service's `$metadata` document. Single attempt; a
/// windowed run cannot proceed without the catalog.
pub async fn fetch_metadata(
    transport: &dyn FeedTransport,
    base_url: &str,
) -> Result<SchemaCatalog> {
    let url = format!("{base_url}$metadata");
    let response = transport.get(&url).await?;
    if !response.is_ok() {
        return Err(anyhow!(
            "metadata request failed with status {}",
            response.status
        ));
    }
    SchemaCatalog::parse(&response.body).context("failed to parse feed metadata")
}
