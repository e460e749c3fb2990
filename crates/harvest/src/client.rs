// Shared HTTP fetch client: one connection pool per job, browser-like headers,
// transport retry, and per-call timeouts chosen by the caller.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::HarvestError;
use crate::config::{DownloaderConfig, TlsPolicy};
use crate::proxy::build_proxy_from_config;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Builds the pooled reqwest client described by `config`.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, HarvestError> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(config.effective_headers())
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        });

    if config.tls_policy == TlsPolicy::AcceptInvalidCerts {
        warn!("TLS certificate verification is disabled for this job");
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(proxy_config) = &config.proxy {
        builder = builder.proxy(build_proxy_from_config(proxy_config)?);
    } else if !config.use_system_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|e| HarvestError::configuration(format!("failed to build HTTP client: {e}")))
}

/// Cheap-to-clone handle around the pooled client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
    origin_headers: HeaderMap,
    send_origin_headers: bool,
}

impl HttpClient {
    pub fn new(config: &DownloaderConfig) -> Result<Self, HarvestError> {
        Ok(Self {
            client: create_client(config)?,
            retry: config.retry.clone(),
            origin_headers: HeaderMap::new(),
            send_origin_headers: config.send_origin_headers,
        })
    }

    /// Returns a handle that sends `Origin`/`Referer` taken from `manifest_url`.
    pub fn with_origin(&self, manifest_url: &Url) -> Self {
        let mut handle = self.clone();
        if !self.send_origin_headers {
            return handle;
        }

        let origin = manifest_url.origin();
        if !origin.is_tuple() {
            return handle;
        }
        let origin = origin.ascii_serialization();
        match (
            HeaderValue::from_str(&origin),
            HeaderValue::from_str(&format!("{origin}/")),
        ) {
            (Ok(origin_value), Ok(referer_value)) => {
                handle.origin_headers.insert(ORIGIN, origin_value);
                handle.origin_headers.insert(REFERER, referer_value);
                debug!(origin = %origin, "Using manifest origin for request headers");
            }
            _ => warn!(origin = %origin, "Manifest origin is not a valid header value"),
        }
        handle
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// GET `url`, retrying transient failures. Non-2xx statuses are errors.
    pub async fn get(
        &self,
        url: &Url,
        timeout: Duration,
        operation: &'static str,
        token: &CancellationToken,
    ) -> Result<Response, HarvestError> {
        retry_with_backoff(&self.retry, token, |attempt| {
            let request = self
                .client
                .get(url.clone())
                .headers(self.origin_headers.clone())
                .timeout(timeout);
            async move {
                trace!(url = %url, attempt, operation, "Sending request");
                let result = async {
                    let response = request.send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        return Err(HarvestError::http_status(status, url.as_str(), operation));
                    }
                    Ok(response)
                }
                .await;
                RetryAction::from_result(result)
            }
        })
        .await
    }

    /// GET `url` and decode the body as text.
    pub async fn get_text(
        &self,
        url: &Url,
        timeout: Duration,
        operation: &'static str,
        token: &CancellationToken,
    ) -> Result<String, HarvestError> {
        let response = self.get(url, timeout, operation, token).await?;
        let text = tokio::select! {
            _ = token.cancelled() => return Err(HarvestError::Cancelled),
            text = response.text() => text?,
        };
        Ok(text)
    }
}
