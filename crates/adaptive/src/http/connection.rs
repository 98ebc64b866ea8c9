// Connections: request parameters, the factory seam and the reqwest backend
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RANGE};
use tracing::{debug, info};
use url::Url;

use crate::config::HttpConfig;
use crate::error::TransportError;
use crate::proxy::build_proxy_from_config;

pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Key under which idle connections are pooled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
}

/// Target of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    url: Url,
}

impl ConnectionParams {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw).map_err(|e| TransportError::invalid_url(raw, e.to_string()))?;
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Anything that is not plain HTTP(S).
    pub fn is_local(&self) -> bool {
        !matches!(self.url.scheme(), "http" | "https")
    }

    pub fn pool_key(&self) -> PoolKey {
        PoolKey {
            scheme: self.url.scheme().to_string(),
            host: self.url.host_str().unwrap_or_default().to_ascii_lowercase(),
            port: self.url.port_or_known_default(),
            username: self.url.username().to_string(),
        }
    }
}

/// Headers and body of a successful request.
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl Response {
    /// Whether the server honoured a range request.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Issues a GET. `range` is a complete `Range` header value.
    async fn request(
        &self,
        params: &ConnectionParams,
        range: Option<&str>,
    ) -> Result<Response, TransportError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, params: &ConnectionParams) -> bool;

    async fn create(&self, params: &ConnectionParams)
    -> Result<Arc<dyn Connection>, TransportError>;
}

/// HTTP(S) connections backed by a shared reqwest client.
pub struct ReqwestFactory {
    client: Client,
}

impl ReqwestFactory {
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConnectionFactory for ReqwestFactory {
    fn name(&self) -> &'static str {
        "reqwest"
    }

    fn accepts(&self, params: &ConnectionParams) -> bool {
        !params.is_local()
    }

    async fn create(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(ReqwestConnection {
            client: self.client.clone(),
        }))
    }
}

struct ReqwestConnection {
    client: Client,
}

#[async_trait]
impl Connection for ReqwestConnection {
    async fn request(
        &self,
        params: &ConnectionParams,
        range: Option<&str>,
    ) -> Result<Response, TransportError> {
        let mut request = self.client.get(params.url().clone());
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::http_status(
                status,
                params.as_str(),
                "GET",
            ));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Response {
            status: status.as_u16(),
            content_type,
            content_length: response.content_length(),
            body: response.bytes_stream().map_err(TransportError::from).boxed(),
        })
    }
}

/// Builds the reqwest client shared by all connections.
pub fn create_client(config: &HttpConfig) -> Result<Client, TransportError> {
    install_rustls_provider();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        client_builder = client_builder.proxy(build_proxy_from_config(proxy_config)?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy");
    } else if !config.use_system_proxy {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled");
    }

    client_builder.build().map_err(TransportError::from)
}
