use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::Method;
use reqwest::{Client as ReqwestClient, ClientBuilder as ReqwestBuilder};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::native::{NativeFactory, ReqwestFactory};
use crate::pool::{Pool, PoolConfig};
use crate::request::{RequestOptions, TransportOptions};
use crate::response::ResponsePromise;

/// Main entry point for pooled requests
///
/// Every verb takes [`RequestOptions`], waits for a free transport and
/// returns the [`ResponsePromise`] of the request it sent.
///
/// # Examples
///
/// ```rust,no_run
/// use xhrpool::{Client, RequestOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = Client::new();
///     let payload = client
///         .get(RequestOptions::new().url("https://example.com/api/items").param("page", 1))
///         .await?
///         .outcome()
///         .await?;
///     println!("{}", payload);
///     Ok(())
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    pool: Pool,
    base_url: Option<Url>,
}

impl Client {
    /// Create a client with a default pool of reqwest-backed transports
    pub fn new() -> Self {
        Self {
            pool: Pool::default(),
            base_url: None,
        }
    }

    /// Create a new client builder
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Send a GET request
    pub async fn get(&self, options: RequestOptions) -> Result<ResponsePromise> {
        self.request(Method::GET, options).await
    }

    /// Send a POST request
    pub async fn post(&self, options: RequestOptions) -> Result<ResponsePromise> {
        self.request(Method::POST, options).await
    }

    /// Send a PUT request
    pub async fn put(&self, options: RequestOptions) -> Result<ResponsePromise> {
        self.request(Method::PUT, options).await
    }

    /// Send a DELETE request
    pub async fn delete(&self, options: RequestOptions) -> Result<ResponsePromise> {
        self.request(Method::DELETE, options).await
    }

    /// Send a HEAD request
    pub async fn head(&self, options: RequestOptions) -> Result<ResponsePromise> {
        self.request(Method::HEAD, options).await
    }

    /// Send a request with any method
    ///
    /// The URL comes from `options`, else from the client's default options,
    /// and is resolved against the base URL if one is set. Fails with
    /// [`Error::PoolExhausted`] when no transport frees up.
    pub async fn request(&self, method: Method, options: RequestOptions) -> Result<ResponsePromise> {
        let url = options
            .url
            .as_deref()
            .or(self.pool.defaults().url.as_deref())
            .ok_or_else(|| Error::invalid_request("Request options must include a URL"))?;
        let url = self.resolve(url)?;
        let options = options.method(method).url(url);

        let promise = ResponsePromise::new(None, options.context.clone());
        let transport = self.pool.acquire().await?;
        debug!(transport = transport.id(), url = ?options.url, "dispatching request");

        promise.set_promiser(transport.clone());
        transport.set_options(&options);

        transport
            .send_with(None, None, Some(promise))
            .map_err(|err| {
                self.pool.release(&transport);
                err
            })
    }

    /// The pool serving this client
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get the base URL if set
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    fn resolve(&self, url: &str) -> Result<String> {
        match &self.base_url {
            Some(base) => Ok(base.join(url)?.to_string()),
            None => Ok(url.to_string()),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for clients with a custom pool, defaults or backend
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use xhrpool::ClientBuilder;
///
/// let client = ClientBuilder::new()
///     .max_pool_size(4)
///     .poll_period(Duration::from_millis(100))
///     .timeout(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// assert_eq!(client.pool().config().max_size, 4);
/// ```
pub struct ClientBuilder {
    pool_config: PoolConfig,
    defaults: TransportOptions,
    reqwest_builder: Option<ReqwestBuilder>,
    native_factory: Option<Arc<dyn NativeFactory>>,
    base_url: Option<String>,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            defaults: TransportOptions::default(),
            reqwest_builder: None,
            native_factory: None,
            base_url: None,
        }
    }

    /// Set the maximum number of transports
    pub fn max_pool_size(mut self, max_size: usize) -> Self {
        self.pool_config = self.pool_config.max_size(max_size);
        self
    }

    /// Set how often a full pool is checked for a free transport
    pub fn poll_period(mut self, period: Duration) -> Self {
        self.pool_config = self.pool_config.poll_period(period);
        self
    }

    /// Set how many times a full pool is checked before giving up
    pub fn max_poll_attempts(mut self, attempts: u32) -> Self {
        self.pool_config = self.pool_config.max_poll_attempts(attempts);
        self
    }

    /// Replace the whole pool configuration
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Merge `overrides` into the defaults every transport starts from
    pub fn default_options(mut self, overrides: &RequestOptions) -> Self {
        self.defaults.merge(overrides);
        self
    }

    /// Set a default header for all requests
    pub fn default_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| Error::config(format!("Invalid header name {}: {}", name, e)))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::config(format!("Invalid header value for {}: {}", name, e)))?;
        self.defaults.headers.insert(name, value);
        Ok(self)
    }

    /// Set the total timeout of the reqwest backend
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.reqwest_builder = Some(self.reqwest().timeout(timeout));
        self
    }

    /// Set the connection timeout of the reqwest backend
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.reqwest_builder = Some(self.reqwest().connect_timeout(timeout));
        self
    }

    /// Use another native request backend
    ///
    /// Timeouts set on this builder only apply to the reqwest backend.
    pub fn native_factory(mut self, factory: Arc<dyn NativeFactory>) -> Self {
        self.native_factory = Some(factory);
        self
    }

    /// Resolve relative request URLs against `url`
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    fn reqwest(&mut self) -> ReqwestBuilder {
        self.reqwest_builder.take().unwrap_or_else(ReqwestClient::builder)
    }

    /// Build the client
    pub fn build(self) -> Result<Client> {
        let factory: Arc<dyn NativeFactory> = match (self.native_factory, self.reqwest_builder) {
            (Some(factory), _) => factory,
            (None, Some(builder)) => Arc::new(ReqwestFactory::new(builder.build()?)),
            (None, None) => Arc::new(ReqwestFactory::default()),
        };
        let base_url = self.base_url.as_deref().map(Url::parse).transpose()?;

        Ok(Client {
            pool: Pool::new(self.pool_config, factory, self.defaults)?,
            base_url,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
