use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::driver::{MultiplexDriver, TransferDriver};
use crate::engine::dispatch::{Engine, PreparedRequest};
use crate::engine::middleware::{run_chain, Middleware, RequestDescriptor};
use crate::error::Error;
use crate::format;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::options::Options;
use crate::policy::UrlPolicy;
use crate::promise::{Promise, Resolution};
use crate::response::Response;
use crate::util::{is_absolute_url, join_base_path, normalize_method};

type DriverFactory = Arc<dyn Fn() -> Box<dyn TransferDriver> + Send + Sync>;

/// A promise-based HTTP client.
///
/// Requests are admitted to a bounded-concurrency dispatch engine and
/// multiplexed over one transfer driver; callers hold [`Promise`] handles
/// that settle when the transfer completes. Every `with_*` method returns a
/// new client with fresh engine state; the receiver is never modified.
/// Dropping a client tears down its driver and closes every pooled handle;
/// requests still queued at that point stay pending.
///
/// ```no_run
/// use pledge::Client;
///
/// let client = Client::new()
///     .with_base_url("https://api.example.com")
///     .with_retry(2, std::time::Duration::from_millis(200), [429, 502, 503, 504])
///     .as_json();
///
/// let response = client.get("/v1/items").send().wait(None)?;
/// println!("{}", response.status());
/// # Ok::<(), pledge::Error>(())
/// ```
#[derive(Clone)]
pub struct Client {
    options: Options,
    middlewares: Vec<Arc<dyn Middleware>>,
    url_policy: Option<Arc<dyn UrlPolicy>>,
    driver_factory: DriverFactory,
    engine: Engine,
    metrics: ClientMetrics,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// A client over the shipped transfer driver with default options.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self::with_driver(
            || Box::new(MultiplexDriver::new()) as Box<dyn TransferDriver>,
            options,
        )
    }

    /// A client over a custom transfer driver. The factory is invoked once
    /// now and once per configuration clone, so clones share no driver
    /// state.
    pub fn with_driver<F>(driver_factory: F, options: Options) -> Self
    where
        F: Fn() -> Box<dyn TransferDriver> + Send + Sync + 'static,
    {
        let metrics = ClientMetrics::new();
        let engine = Engine::new(driver_factory(), &options, metrics.clone());
        Self {
            options,
            middlewares: Vec::new(),
            url_policy: None,
            driver_factory: Arc::new(driver_factory),
            engine,
            metrics,
        }
    }

    fn rebuild(
        &self,
        options: Options,
        middlewares: Vec<Arc<dyn Middleware>>,
        url_policy: Option<Arc<dyn UrlPolicy>>,
    ) -> Self {
        let metrics = ClientMetrics::new();
        let engine = Engine::new((self.driver_factory)(), &options, metrics.clone());
        Self {
            options,
            middlewares,
            url_policy,
            driver_factory: Arc::clone(&self.driver_factory),
            engine,
            metrics,
        }
    }

    fn with_changed_options(&self, options: Options) -> Self {
        self.rebuild(options, self.middlewares.clone(), self.url_policy.clone())
    }

    pub fn with_base_url(&self, base_url: impl Into<String>) -> Self {
        self.with_changed_options(self.options.clone().with_base_url(base_url))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_changed_options(self.options.clone().with_read_timeout(timeout))
    }

    pub fn with_connect_timeout(&self, timeout: Duration) -> Self {
        self.with_changed_options(self.options.clone().with_connect_timeout(timeout))
    }

    pub fn with_user_agent(&self, user_agent: impl Into<String>) -> Self {
        self.with_changed_options(self.options.clone().with_user_agent(user_agent))
    }

    pub fn with_header(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_changed_options(self.options.clone().with_default_header(name, value))
    }

    pub fn with_headers<I, K, V>(&self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.with_changed_options(self.options.clone().with_default_headers(headers))
    }

    pub fn with_proxy(&self, proxy: impl Into<String>) -> Self {
        self.with_changed_options(self.options.clone().with_proxy(proxy))
    }

    pub fn without_tls_verification(&self) -> Self {
        self.with_changed_options(self.options.clone().with_verify_tls(false))
    }

    pub fn with_bearer_token(&self, token: impl AsRef<str>) -> Self {
        self.with_header("Authorization", format!("Bearer {}", token.as_ref()))
    }

    pub fn with_basic_auth(&self, user: impl AsRef<str>, password: impl AsRef<str>) -> Self {
        let credentials = format!("{}:{}", user.as_ref(), password.as_ref());
        self.with_header(
            "Authorization",
            format!("Basic {}", BASE64_STANDARD.encode(credentials)),
        )
    }

    /// Presets the default content type to JSON, so structured bodies are
    /// JSON-encoded at dispatch.
    pub fn as_json(&self) -> Self {
        self.with_header("Content-Type", "application/json")
    }

    /// Presets the default content type to form encoding.
    pub fn as_form(&self) -> Self {
        self.with_header("Content-Type", "application/x-www-form-urlencoded")
    }

    pub fn with_http2(&self, enabled: bool) -> Self {
        self.with_changed_options(self.options.clone().with_http2(enabled))
    }

    pub fn with_tcp_keep_alive(&self, enabled: bool) -> Self {
        self.with_changed_options(self.options.clone().with_tcp_keep_alive(enabled))
    }

    pub fn with_max_pool_size(&self, max_pool_size: usize) -> Self {
        self.with_changed_options(self.options.clone().with_max_pool_size(max_pool_size))
    }

    pub fn with_max_concurrent(&self, max_concurrent: usize) -> Self {
        self.with_changed_options(self.options.clone().with_max_concurrent(max_concurrent))
    }

    pub fn with_retry(
        &self,
        attempts: usize,
        delay: Duration,
        status_codes: impl IntoIterator<Item = u16>,
    ) -> Self {
        self.with_changed_options(self.options.clone().with_retry(attempts, delay, status_codes))
    }

    pub fn with_options_value(&self, options: Options) -> Self {
        self.with_changed_options(options)
    }

    pub fn with_middleware(&self, middleware: impl Middleware + 'static) -> Self {
        let mut middlewares = self.middlewares.clone();
        middlewares.push(Arc::new(middleware));
        self.rebuild(self.options.clone(), middlewares, self.url_policy.clone())
    }

    pub fn with_middlewares<I>(&self, middlewares: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        let mut chain = self.middlewares.clone();
        chain.extend(middlewares);
        self.rebuild(self.options.clone(), chain, self.url_policy.clone())
    }

    pub fn with_url_policy(&self, policy: impl UrlPolicy + 'static) -> Self {
        self.rebuild(
            self.options.clone(),
            self.middlewares.clone(),
            Some(Arc::new(policy)),
        )
    }

    /// Starts a request with a free-form method name. Unknown methods are
    /// reported when the request is sent; casing is normalized.
    pub fn request(&self, method: &str, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, normalize_method(method), url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::GET), url.into())
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::POST), url.into())
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::PUT), url.into())
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::PATCH), url.into())
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::DELETE), url.into())
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::HEAD), url.into())
    }

    pub fn options_request(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Ok(Method::OPTIONS), url.into())
    }

    /// Applies the JSON content-type preset to `data` and dispatches in one
    /// step.
    pub fn json(&self, method: &str, url: impl Into<String>, data: Value) -> Promise<Response> {
        self.request(method, url)
            .header("Content-Type", "application/json")
            .body(data)
            .send()
    }

    /// Dispatches every entry and fulfills with a key → response map once
    /// all succeed; rejects on the first failure. The aggregate promise is
    /// wired to this client's tick, so waiting on it advances this engine.
    pub fn concurrent<K>(
        &self,
        requests: Vec<(K, RequestBuilder<'_>)>,
    ) -> Promise<BTreeMap<String, Response>>
    where
        K: Into<String>,
    {
        let mut keys = Vec::with_capacity(requests.len());
        let mut promises = Vec::with_capacity(requests.len());
        for (key, builder) in requests {
            keys.push(key.into());
            promises.push(builder.send());
        }

        let aggregate = Promise::all(promises);
        aggregate.set_tick(Some(self.engine.tick_fn()));
        aggregate.then(move |values| {
            let mut output = BTreeMap::new();
            for (key, value) in keys.into_iter().zip(values) {
                output.insert(key, value);
            }
            Ok(Resolution::Value(output))
        })
    }

    /// Dispatches every entry and settles with the first settlement.
    pub fn race<K>(&self, requests: Vec<(K, RequestBuilder<'_>)>) -> Promise<Response>
    where
        K: Into<String>,
    {
        let promises = requests
            .into_iter()
            .map(|(_, builder)| builder.send())
            .collect();
        let winner = Promise::race(promises);
        winner.set_tick(Some(self.engine.tick_fn()));
        winner
    }

    /// One unit of engine progress: admit, drive, demux, re-admit.
    pub fn tick(&self) {
        self.engine.tick();
    }

    /// Ticks until nothing is active or queued, or the budget elapses.
    /// Returning on timeout does not cancel or reject anything in flight.
    pub fn wait(&self, timeout: Option<Duration>) {
        self.engine.wait(timeout);
    }

    pub fn has_pending(&self) -> bool {
        self.engine.has_pending()
    }

    pub fn pending_count(&self) -> usize {
        self.engine.pending_count()
    }

    pub fn queued_count(&self) -> usize {
        self.engine.queued_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics_snapshot()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn absolute_url(&self, url: &str) -> String {
        if is_absolute_url(url) {
            url.to_owned()
        } else {
            join_base_path(self.options.base_url(), url)
        }
    }

    fn dispatch(&self, descriptor: RequestDescriptor) -> Promise<Response> {
        let terminal = |request: RequestDescriptor| self.submit_prepared(request);
        run_chain(&self.middlewares, &terminal, descriptor)
    }

    /// The pluggable predicate runs at the submission boundary, after the
    /// middleware chain, so it screens the url that is actually dispatched
    /// rather than the one the caller started with.
    fn enforce_url_policy(&self, url: &str) -> Result<(), Error> {
        let Some(policy) = &self.url_policy else {
            return Ok(());
        };
        if let Ok(parsed) = url::Url::parse(url)
            && !policy.allows(&parsed)
        {
            debug!(url = %url, "request rejected by url policy");
            return Err(Error::UrlRejected {
                url: url.to_owned(),
            });
        }
        Ok(())
    }

    fn submit_prepared(&self, descriptor: RequestDescriptor) -> Promise<Response> {
        match self.prepare(descriptor) {
            Ok(prepared) => self.engine.submit(prepared),
            Err(error) => Promise::rejected(error),
        }
    }

    /// Resolves the descriptor against the client options: absolute url with
    /// query appended, defaults merged under request headers, body
    /// serialized per the effective content type.
    fn prepare(&self, descriptor: RequestDescriptor) -> Result<PreparedRequest, Error> {
        let absolute = self.absolute_url(&descriptor.url);
        let url = format::build_url(&absolute, &descriptor.query);
        self.enforce_url_policy(&url)?;
        let merged = format::merge_headers(&descriptor.headers, &self.options.default_header_values());
        let body = format::format_params(&descriptor.body, &merged)?;
        let mut headers = format::wire_headers(&merged)?;
        if body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            let preset = format::content_type(&merged);
            let value =
                HeaderValue::from_str(&preset).map_err(|source| Error::InvalidHeaderValue {
                    name: "Content-Type".to_owned(),
                    message: source.to_string(),
                })?;
            headers.insert(CONTENT_TYPE, value);
        }

        Ok(PreparedRequest {
            method: descriptor.method,
            url,
            headers,
            body: body.map(Bytes::from),
            attempt: descriptor.attempt.max(1),
        })
    }
}

/// Assembles one request. Obtained from the client verb methods; finished
/// with [`RequestBuilder::send`], which hands the request to the middleware
/// chain and returns the caller-visible promise.
pub struct RequestBuilder<'a> {
    client: &'a Client,
    method: Result<Method, Error>,
    url: String,
    headers: Vec<(String, Value)>,
    query: Vec<(String, String)>,
    body: Value,
}

impl<'a> RequestBuilder<'a> {
    fn new(client: &'a Client, method: Result<Method, Error>, url: String) -> Self {
        Self {
            client,
            method,
            url,
            headers: Vec::new(),
            query: Vec::new(),
            body: Value::Null,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.headers
            .extend(headers.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(name, value)| (name.into(), value.into())));
        self
    }

    /// Serializes a typed value into query pairs.
    pub fn query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| Error::Serialize {
            message: source.to_string(),
        })?;
        self.query.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    /// Sets the request body as a dynamically typed value; it is serialized
    /// at dispatch according to the effective content type.
    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn text(self, body: impl Into<String>) -> Self {
        self.body(Value::String(body.into()))
    }

    pub fn json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(|source| Error::Serialize {
            message: source.to_string(),
        })?;
        Ok(self
            .header("Content-Type", "application/json")
            .body(value))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload).map_err(|source| Error::Serialize {
            message: source.to_string(),
        })?;
        Ok(self
            .header("Content-Type", "application/x-www-form-urlencoded")
            .text(encoded))
    }

    /// Validates the method, runs the middleware chain, and dispatches.
    /// Invalid input surfaces as an already-rejected promise.
    pub fn send(self) -> Promise<Response> {
        let method = match self.method {
            Ok(method) => method,
            Err(error) => return Promise::rejected(error),
        };
        let descriptor = RequestDescriptor {
            method,
            url: self.url,
            headers: self.headers,
            query: self.query,
            body: self.body,
            attempt: 1,
        };
        self.client.dispatch(descriptor)
    }
}
