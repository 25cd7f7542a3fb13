//! Consul HTTP implementation of [`CatalogClient`].
//!
//! Uses the catalog endpoints as blocking queries:
//!
//! - `GET /v1/catalog/services?index=<i>&wait=<s>s`
//! - `GET /v1/catalog/service/<name>?index=<i>&wait=<s>s`
//!
//! The change index comes back in the `X-Consul-Index` response header.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Url};
use sd_core::{ConfigError, RegistryConfig};
use serde::de::DeserializeOwned;

use crate::catalog::{CatalogClient, CatalogNode, Indexed, ServiceTags};
use crate::error::{CatalogError, WatchError};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra time on top of the blocking wait before a request is abandoned.
///
/// Consul adds up to `wait / 16` of jitter to every blocking query.
const REQUEST_SLACK: Duration = Duration::from_secs(5);

/// A catalog client talking to one Consul agent.
///
/// # Examples
///
/// ```
/// use sd_core::RegistryConfig;
/// use sd_watcher::ConsulClient;
///
/// let config = RegistryConfig::new(["127.0.0.1:8500"], ["prod"]);
/// let client = ConsulClient::from_config(&config).unwrap();
/// assert_eq!(client.base_url().as_str(), "http://127.0.0.1:8500/");
/// ```
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: Client,
    base: Url,
    datacenter: Option<String>,
    token: Option<String>,
}

impl ConsulClient {
    /// Builds a client for the first configured address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoAddress`] if no address is configured,
    /// [`ConfigError::InvalidAddress`] if the first address is malformed, or
    /// [`WatchError::Client`] if the HTTP client cannot be built.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, WatchError> {
        let address = config.primary_address().ok_or(ConfigError::NoAddress)?;
        let base = parse_address(address)?;
        let http = Client::builder().build().map_err(WatchError::Client)?;

        Ok(Self {
            http,
            base,
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
        })
    }

    /// Returns the agent URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Builds the URL of a blocking query against `segments` under `/v1/`.
    fn query_url(&self, segments: &[&str], last_index: u64, max_wait: Duration) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("index", &last_index.to_string())
                .append_pair("wait", &format_wait(max_wait));
            if let Some(dc) = &self.datacenter {
                query.append_pair("dc", dc);
            }
        }
        url
    }

    fn request(&self, url: Url, max_wait: Duration) -> RequestBuilder {
        let request = self
            .http
            .get(url)
            .timeout(max_wait + max_wait / 16 + REQUEST_SLACK);
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn blocking_query<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<T>, CatalogError> {
        let url = self.query_url(segments, last_index, max_wait);
        tracing::trace!(%url, "Issuing blocking query");

        let response = self.request(url, max_wait).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_owned()
            } else {
                body.trim().to_owned()
            };
            return Err(CatalogError::status(status.as_u16(), message));
        }

        let index = parse_index(response.headers())?;
        let value = response.json::<T>().await?;
        Ok(Indexed::new(index, value))
    }
}

#[async_trait]
impl CatalogClient for ConsulClient {
    async fn list_services(
        &self,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<ServiceTags>, CatalogError> {
        self.blocking_query(&["catalog", "services"], last_index, max_wait)
            .await
    }

    async fn list_instances(
        &self,
        service: &str,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<Vec<CatalogNode>>, CatalogError> {
        self.blocking_query(&["catalog", "service", service], last_index, max_wait)
            .await
    }
}

/// Parses a configured agent address into a base URL.
///
/// Addresses without a scheme (`127.0.0.1:8500`) are treated as plain HTTP.
fn parse_address(address: &str) -> Result<Url, ConfigError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::invalid_address(address, "address is empty"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| ConfigError::invalid_address(address, e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid_address(
            address,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::invalid_address(address, "missing host"));
    }
    Ok(url)
}

/// Formats a blocking wait as a Consul duration, keeping sub-second precision.
fn format_wait(wait: Duration) -> String {
    if wait.subsec_nanos() == 0 {
        format!("{}s", wait.as_secs())
    } else {
        format!("{}ms", wait.as_millis())
    }
}

fn parse_index(headers: &HeaderMap) -> Result<u64, CatalogError> {
    let value = headers.get(INDEX_HEADER).ok_or(CatalogError::MissingIndex)?;
    let text = value
        .to_str()
        .map_err(|_| CatalogError::InvalidIndex(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;
    text.trim()
        .parse()
        .map_err(|_| CatalogError::InvalidIndex(text.to_owned()))
}
