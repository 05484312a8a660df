use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::Value;

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("pledge/", env!("CARGO_PKG_VERSION"));

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_REDIRECTS: u32 = 5;
const DEFAULT_MAX_CONCURRENT: usize = 50;
const DEFAULT_MAX_POOL_SIZE: usize = 8;

/// Immutable per-client settings. Every `with_*` method consumes the value
/// and returns a new one; an `Options` already handed to a client never
/// changes underneath it.
#[derive(Clone, Debug)]
pub struct Options {
    base_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    follow_redirects: bool,
    max_redirects: u32,
    verify_tls: bool,
    user_agent: Option<String>,
    proxy: Option<String>,
    default_headers: Vec<(String, String)>,
    retry_attempts: usize,
    retry_delay: Duration,
    retry_status_codes: BTreeSet<u16>,
    http2: bool,
    tcp_keep_alive: bool,
    max_concurrent: usize,
    max_pool_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            verify_tls: true,
            user_agent: None,
            proxy: None,
            default_headers: Vec::new(),
            retry_attempts: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_status_codes: default_retry_status_codes(),
            http2: false,
            tcp_keep_alive: true,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

fn default_retry_status_codes() -> BTreeSet<u16> {
    [429_u16, 502, 503, 504].into_iter().collect()
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_follow_redirects(mut self, follow_redirects: bool) -> Self {
        self.follow_redirects = follow_redirects;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets a default header, replacing any existing entry whose name
    /// matches case-insensitively (last writer wins, including casing).
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self
            .default_headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            *slot = (name, value);
        } else {
            self.default_headers.push((name, value));
        }
        self
    }

    pub fn with_default_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self = self.with_default_header(name, value);
        }
        self
    }

    pub fn with_retry(
        mut self,
        attempts: usize,
        delay: Duration,
        status_codes: impl IntoIterator<Item = u16>,
    ) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = delay.max(Duration::from_millis(1));
        self.retry_status_codes = status_codes.into_iter().collect();
        self
    }

    pub fn with_http2(mut self, http2: bool) -> Self {
        self.http2 = http2;
        self
    }

    pub fn with_tcp_keep_alive(mut self, tcp_keep_alive: bool) -> Self {
        self.tcp_keep_alive = tcp_keep_alive;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    pub fn verify_tls(&self) -> bool {
        self.verify_tls
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn default_headers(&self) -> &[(String, String)] {
        &self.default_headers
    }

    pub fn retry_attempts(&self) -> usize {
        self.retry_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn retry_status_codes(&self) -> &BTreeSet<u16> {
        &self.retry_status_codes
    }

    pub fn http2(&self) -> bool {
        self.http2
    }

    pub fn tcp_keep_alive(&self) -> bool {
        self.tcp_keep_alive
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub(crate) fn effective_user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Default headers as dynamically typed values, ready to merge under
    /// per-request headers. The user agent rides along unless overridden.
    pub(crate) fn default_header_values(&self) -> Vec<(String, Value)> {
        let mut headers: Vec<(String, Value)> = Vec::with_capacity(self.default_headers.len() + 1);
        headers.push((
            "User-Agent".to_owned(),
            Value::String(self.effective_user_agent().to_owned()),
        ));
        for (name, value) in &self.default_headers {
            if let Some(slot) = headers
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                *slot = (name.clone(), Value::String(value.clone()));
            } else {
                headers.push((name.clone(), Value::String(value.clone())));
            }
        }
        headers
    }
}
