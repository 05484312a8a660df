use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::HeaderValue;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::driver::{
    TransferConfig, TransferDriver, TransferFailure, TransferHandle, TransferOutcome, WireResponse,
};
use crate::error::Error;
use crate::util::{
    is_redirect_status, redirect_location, redirect_method, resolve_redirect_uri, same_origin,
    sanitize_headers_for_redirect,
};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

type TransferBody = Full<Bytes>;
type DirectClient = HyperClient<HttpsConnector<HttpConnector>, TransferBody>;
type ProxiedClient = HyperClient<HttpsConnector<Tunnel<HttpConnector>>, TransferBody>;

#[derive(Clone)]
enum TransportClient {
    Direct(DirectClient),
    Proxied(ProxiedClient),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<TransferBody>,
    ) -> Result<http::Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
        match self {
            Self::Direct(client) => client.request(request).await,
            Self::Proxied(client) => client.request(request).await,
        }
    }
}

/// The transport options that force a fresh hyper client when they change
/// between admissions of the same handle.
#[derive(Clone, Debug, PartialEq, Eq)]
struct TransportSignature {
    verify_tls: bool,
    http2: bool,
    proxy: Option<String>,
    connect_timeout: Duration,
    tcp_keep_alive: bool,
}

impl TransportSignature {
    fn of(config: &TransferConfig) -> Self {
        Self {
            verify_tls: config.verify_tls,
            http2: config.http2,
            proxy: config.proxy.clone(),
            connect_timeout: config.connect_timeout,
            tcp_keep_alive: config.tcp_keep_alive,
        }
    }
}

struct MultiplexTransfer {
    id: u64,
    config: Option<TransferConfig>,
    client: Option<(TransportSignature, TransportClient)>,
}

impl TransferHandle for MultiplexTransfer {
    fn transfer_id(&self) -> u64 {
        self.id
    }

    fn configure(&mut self, config: TransferConfig) {
        self.config = Some(config);
    }

    fn reset(&mut self) {
        // Request state goes, the cached client (and its kept-alive
        // connections) stays.
        self.config = None;
    }

    fn close(&mut self) {
        self.config = None;
        self.client = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The shipped driver: transfers run as tasks on a tokio runtime owned by
/// the driver, and completions come home over a channel that `wait_ready`
/// and `drain` service.
pub struct MultiplexDriver {
    runtime: Option<Runtime>,
    completions_tx: Sender<TransferOutcome>,
    completions_rx: Receiver<TransferOutcome>,
    ready: Vec<TransferOutcome>,
    in_flight: HashMap<u64, Box<dyn TransferHandle>>,
    next_transfer_id: u64,
}

impl MultiplexDriver {
    pub fn new() -> Self {
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            runtime: None,
            completions_tx,
            completions_rx,
            ready: Vec::new(),
            in_flight: HashMap::new(),
            next_transfer_id: 1,
        }
    }

    fn ensure_runtime(&mut self, method: &Method, url: &str) -> Result<(), Error> {
        if self.runtime.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pledge-transfer")
            .enable_all()
            .build()
            .map_err(|source| Error::Transport {
                method: method.clone(),
                url: url.to_owned(),
                message: format!("failed to start transfer runtime: {source}"),
            })?;
        self.runtime = Some(runtime);
        Ok(())
    }
}

impl Default for MultiplexDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferDriver for MultiplexDriver {
    fn allocate(&mut self) -> Box<dyn TransferHandle> {
        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        Box::new(MultiplexTransfer {
            id,
            config: None,
            client: None,
        })
    }

    fn admit(&mut self, mut handle: Box<dyn TransferHandle>) -> Result<(), Error> {
        let transfer_id = handle.transfer_id();
        let (config, client) = {
            let Some(transfer) = handle.as_any_mut().downcast_mut::<MultiplexTransfer>() else {
                return Err(Error::Transport {
                    method: Method::GET,
                    url: String::new(),
                    message: "handle was not allocated by this driver".to_owned(),
                });
            };
            let Some(config) = transfer.config.clone() else {
                return Err(Error::Transport {
                    method: Method::GET,
                    url: String::new(),
                    message: "handle admitted without a configured transfer".to_owned(),
                });
            };

            let signature = TransportSignature::of(&config);
            let client = match &transfer.client {
                Some((existing, client)) if *existing == signature => client.clone(),
                _ => {
                    let built = build_transport_client(&signature).map_err(|message| {
                        Error::Transport {
                            method: config.method.clone(),
                            url: config.url.clone(),
                            message,
                        }
                    })?;
                    transfer.client = Some((signature, built.clone()));
                    built
                }
            };
            (config, client)
        };

        let uri: Uri = config.url.parse().map_err(|_| Error::InvalidUrl {
            url: config.url.clone(),
        })?;

        self.ensure_runtime(&config.method, &config.url)?;
        let Some(runtime) = &self.runtime else {
            return Err(Error::Transport {
                method: config.method.clone(),
                url: config.url.clone(),
                message: "transfer runtime unavailable".to_owned(),
            });
        };

        debug!(transfer_id, url = %config.url, method = %config.method, "transfer admitted");
        let completions = self.completions_tx.clone();
        runtime.spawn(async move {
            let result = execute_transfer(client, uri, config).await;
            if completions
                .send(TransferOutcome {
                    transfer_id,
                    result,
                })
                .is_err()
            {
                warn!(transfer_id, "completion channel closed before delivery");
            }
        });
        self.in_flight.insert(transfer_id, handle);
        Ok(())
    }

    fn perform(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(outcome) = self.completions_rx.try_recv() {
            self.ready.push(outcome);
            progressed = true;
        }
        progressed
    }

    fn wait_ready(&mut self, timeout: Duration) {
        if !self.ready.is_empty() {
            return;
        }
        if let Ok(outcome) = self.completions_rx.recv_timeout(timeout) {
            self.ready.push(outcome);
        }
    }

    fn drain(&mut self) -> Vec<TransferOutcome> {
        while let Ok(outcome) = self.completions_rx.try_recv() {
            self.ready.push(outcome);
        }
        std::mem::take(&mut self.ready)
    }

    fn reclaim(&mut self, transfer_id: u64) -> Option<Box<dyn TransferHandle>> {
        self.in_flight.remove(&transfer_id)
    }

    fn close(&mut self) {
        for (_, mut handle) in self.in_flight.drain() {
            handle.close();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for MultiplexDriver {
    fn drop(&mut self) {
        self.close();
    }
}

async fn execute_transfer(
    client: TransportClient,
    uri: Uri,
    config: TransferConfig,
) -> Result<WireResponse, TransferFailure> {
    let mut uri = uri;
    let mut method = config.method.clone();
    let mut headers = config.headers.clone();
    let mut body = config.body.clone();
    let mut redirects = 0_u32;

    loop {
        let request = build_request(&method, &uri, &headers, body.clone())?;
        let response = tokio::time::timeout(config.read_timeout, client.request(request))
            .await
            .map_err(|_| transfer_timeout(config.read_timeout))?
            .map_err(|error| TransferFailure {
                message: describe_transport_error(&error),
            })?;

        let status = response.status();
        if config.follow_redirects && is_redirect_status(status) && redirects < config.max_redirects
            && let Some(location) = redirect_location(response.headers())
            && let Some(next_uri) = resolve_redirect_uri(&uri, &location)
        {
            let next_method = redirect_method(&method, status);
            let method_changed = next_method == Method::GET && method != Method::GET;
            let crossed_origin = !same_origin(&uri, &next_uri);
            sanitize_headers_for_redirect(&mut headers, method_changed, crossed_origin);
            if method_changed {
                body = None;
            }
            debug!(status = status.as_u16(), location = %next_uri, "following redirect");
            method = next_method;
            uri = next_uri;
            redirects += 1;
            continue;
        }

        let response_headers = response.headers().clone();
        let collected = tokio::time::timeout(config.read_timeout, response.into_body().collect())
            .await
            .map_err(|_| transfer_timeout(config.read_timeout))?
            .map_err(|error| TransferFailure {
                message: format!("failed to read response body: {error}"),
            })?;

        return Ok(WireResponse {
            status,
            headers: response_headers,
            body: collected.to_bytes(),
        });
    }
}

fn transfer_timeout(timeout: Duration) -> TransferFailure {
    TransferFailure {
        message: format!("transfer timed out after {}ms", timeout.as_millis()),
    }
}

fn build_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Option<Bytes>,
) -> Result<Request<TransferBody>, TransferFailure> {
    let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(body.unwrap_or_default()))
        .map_err(|error| TransferFailure {
            message: format!("failed to build request: {error}"),
        })
}

fn describe_transport_error(error: &hyper_util::client::legacy::Error) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn build_transport_client(signature: &TransportSignature) -> Result<TransportClient, String> {
    let tls_config = build_tls_config(signature.verify_tls)?;
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_connect_timeout(Some(signature.connect_timeout));
    connector.set_keepalive(signature.tcp_keep_alive.then_some(TCP_KEEP_ALIVE_INTERVAL));

    match &signature.proxy {
        None => {
            let https = wrap_tls(tls_config, signature.http2, connector);
            let client = HyperClient::builder(TokioExecutor::new())
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .build(https);
            Ok(TransportClient::Direct(client))
        }
        Some(proxy) => {
            let (proxy_uri, authorization) = parse_proxy(proxy)?;
            let mut tunnel = Tunnel::new(proxy_uri, connector);
            if let Some(authorization) = authorization {
                tunnel = tunnel.with_auth(authorization);
            }
            let https = wrap_tls(tls_config, signature.http2, tunnel);
            let client = HyperClient::builder(TokioExecutor::new())
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .build(https);
            Ok(TransportClient::Proxied(client))
        }
    }
}

fn wrap_tls<C>(tls_config: rustls::ClientConfig, http2: bool, connector: C) -> HttpsConnector<C> {
    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http();
    if http2 {
        builder
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector)
    } else {
        builder.enable_http1().wrap_connector(connector)
    }
}

fn build_tls_config(verify_tls: bool) -> Result<rustls::ClientConfig, String> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|error| format!("failed to initialize tls: {error}"))?;

    if verify_tls {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(builder
            .with_root_certificates(root_store)
            .with_no_client_auth());
    }

    let verifier = DisabledVerification {
        provider: rustls::crypto::ring::default_provider(),
    };
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Accepts any server certificate. Installed only when the client was built
/// with TLS verification turned off.
#[derive(Debug)]
struct DisabledVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl rustls::client::danger::ServerCertVerifier for DisabledVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn parse_proxy(proxy: &str) -> Result<(Uri, Option<HeaderValue>), String> {
    let parsed =
        url::Url::parse(proxy).map_err(|error| format!("invalid proxy url {proxy}: {error}"))?;
    if parsed.scheme() != "http" {
        return Err(format!(
            "proxy url must use the http scheme, got {}",
            parsed.scheme()
        ));
    }
    let Some(host) = parsed.host_str() else {
        return Err("proxy url is missing a host".to_owned());
    };
    let port = parsed.port_or_known_default().unwrap_or(80);

    let authorization = if !parsed.username().is_empty() || parsed.password().is_some() {
        let credentials = format!("{}:{}", parsed.username(), parsed.password().unwrap_or(""));
        let encoded = BASE64_STANDARD.encode(credentials);
        let value = HeaderValue::from_str(&format!("Basic {encoded}"))
            .map_err(|error| format!("invalid proxy credentials: {error}"))?;
        Some(value)
    } else {
        None
    };

    let uri: Uri = format!("http://{host}:{port}")
        .parse()
        .map_err(|error| format!("invalid proxy url {proxy}: {error}"))?;
    Ok((uri, authorization))
}
