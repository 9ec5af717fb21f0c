//! Fetch orchestrator.
//!
//! `DohTransport` owns the address cache, the Alt-Svc cache and the TLS
//! policy, and drives a fetch end to end: resolve the host, choose HTTP/2 or
//! HTTP/3, send, classify failures, validate the negotiated TLS session and
//! decode the body. TLS policy transitions persist across fetches; protocol
//! fallback (HTTP/3 to HTTP/2) never leaves a single fetch.

use std::io::Read as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::uri::PathAndQuery;
use http::{header, Method, Request, Uri};
use parking_lot::RwLock;
use sha2::{Digest, Sha512};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::alt_svc::{parse_alt_svc, AltSvcCache, H3_BROKEN};
use crate::bootstrap::BootstrapResolver;
use crate::cache::AddressCache;
use crate::connect::{trim_ip_brackets, Dialer, ProxyDialer};
use crate::error::{Result, TransportError};
use crate::http2::{HttpClient, HttpProtocol, WireResponse};
use crate::http3::H3Client;
use crate::tls::{
    classify_failure, TlsFailureKind, TlsPolicy, TlsSummary, TlsVersion, TLS12_SAFE, TLS13_SAFE,
};
use crate::{TransportConfig, EXPIRED_CACHED_IP_GRACE_TTL, MAX_DNS_PACKET_SIZE};

const MIME_DNS_MESSAGE: &str = "application/dns-message";
const MIME_ODOH_MESSAGE: &str = "application/oblivious-dns-message";

/// A completed fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Decoded response body.
    pub body: Vec<u8>,
    /// HTTP status code, guaranteed to be in the 2xx range.
    pub status: u16,
    /// What the TLS session negotiated.
    pub tls: TlsSummary,
    /// Wall-clock time of the successful attempt.
    pub rtt: Duration,
}

/// Knobs the HTTP clients are built from; kept so rebuilds can reconstruct
/// them without the original `TransportConfig`.
struct ClientSettings {
    timeout: Duration,
    keepalive: Duration,
    disable_keepalives: bool,
    http3: bool,
    use_ipv4: bool,
    use_ipv6: bool,
    prefer_ipv6: bool,
}

/// Encrypted-HTTP upstream transport.
///
/// All shared state lives on the transport object, so tests and embedders can
/// run several independent transports in one process.
pub struct DohTransport {
    user_agent: String,
    retry_with_h2: bool,
    http3_probe: bool,
    settings: ClientSettings,
    address_cache: Arc<AddressCache>,
    alt_svc: AltSvcCache,
    resolver: BootstrapResolver,
    tls: RwLock<TlsPolicy>,
    h2_client: RwLock<Arc<HttpClient>>,
    h3_client: RwLock<Option<Arc<H3Client>>>,
    rebuilding: AtomicBool,
    has_tls_connected: AtomicU8,
    drop_tls13: AtomicBool,
    drop_tls12: AtomicBool,
    proxy_dialer: Option<Arc<dyn ProxyDialer>>,
    http_proxy: Option<Uri>,
}

impl DohTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_proxy_dialer(config, None)
    }

    /// Builds a transport that routes TCP through the supplied dialer.
    /// HTTP/3 is disabled in that case; QUIC cannot ride a TCP-only proxy.
    pub fn with_proxy_dialer(
        config: TransportConfig,
        proxy_dialer: Option<Arc<dyn ProxyDialer>>,
    ) -> Result<Self> {
        let http_proxy = config
            .http_proxy
            .as_deref()
            .map(|raw| {
                raw.parse::<Uri>()
                    .map_err(|err| TransportError::Config(format!("invalid proxy URL [{raw}]: {err}")))
            })
            .transpose()?;
        let address_cache = Arc::new(AddressCache::new(config.timeout));
        let resolver = BootstrapResolver::new(&config)?;
        let mut policy = TlsPolicy::new(&config);
        let settings = ClientSettings {
            timeout: config.timeout,
            keepalive: config.keepalive,
            disable_keepalives: config.disable_keepalives,
            http3: config.http3,
            use_ipv4: config.use_ipv4,
            use_ipv6: config.use_ipv6,
            prefer_ipv6: config.prefer_ipv6,
        };
        let (h2_client, h3_client) =
            build_clients(&mut policy, &address_cache, &settings, &proxy_dialer, &http_proxy)?;
        Ok(Self {
            user_agent: config.user_agent,
            retry_with_h2: config.retry_with_h2,
            http3_probe: config.http3_probe,
            settings,
            address_cache,
            alt_svc: AltSvcCache::new(),
            resolver,
            tls: RwLock::new(policy),
            h2_client: RwLock::new(h2_client),
            h3_client: RwLock::new(h3_client),
            rebuilding: AtomicBool::new(false),
            has_tls_connected: AtomicU8::new(0),
            drop_tls13: AtomicBool::new(false),
            drop_tls12: AtomicBool::new(false),
            proxy_dialer,
            http_proxy,
        })
    }

    /// Marks the proxy's own resolvers as usable (or not) for bootstrap
    /// resolution.
    pub fn set_internal_resolver_ready(&self, ready: bool) {
        self.resolver.set_ready(ready);
    }

    /// Test levers: treat responses negotiated at the given version as
    /// handshake failures, to exercise the downgrade machinery end to end.
    pub fn set_tls_drop(&self, drop_tls13: bool, drop_tls12: bool) {
        self.drop_tls13.store(drop_tls13, Ordering::SeqCst);
        self.drop_tls12.store(drop_tls12, Ordering::SeqCst);
    }

    /// Rebuilds the HTTP clients from the current TLS policy.
    ///
    /// Single-flight: a concurrent rebuild logs and returns, and fetches fail
    /// fast with [`TransportError::Rebuilding`] while one is running.
    pub fn rebuild_transport(&self) {
        if self.rebuilding.swap(true, Ordering::SeqCst) {
            info!("transport rebuild already in progress");
            return;
        }
        info!("rebuilding transport");
        self.h2_client.read().close_idle_connections();
        let rebuilt = {
            let mut policy = self.tls.write();
            build_clients(
                &mut policy,
                &self.address_cache,
                &self.settings,
                &self.proxy_dialer,
                &self.http_proxy,
            )
        };
        match rebuilt {
            Ok((h2_client, h3_client)) => {
                *self.h2_client.write() = h2_client;
                *self.h3_client.write() = h3_client;
                info!("transport rebuild complete");
            }
            Err(err) => error!("transport rebuild failed, keeping the previous clients: {err}"),
        }
        self.rebuilding.store(false, Ordering::SeqCst);
    }

    /// Resolves `host` into the address cache unless a fresh entry (or one
    /// being updated) already exists. On resolution failure, stale addresses
    /// are kept alive for a grace period.
    async fn resolve_and_update_cache(&self, host: &str, is_stamp: bool) -> Result<()> {
        if self.proxy_dialer.is_some() || self.http_proxy.is_some() {
            return Ok(());
        }
        if trim_ip_brackets(host).parse::<IpAddr>().is_ok() {
            return Ok(());
        }
        let cached = self.address_cache.lookup(host);
        if !cached.ips.is_empty() && (!cached.expired || cached.updating) {
            return Ok(());
        }
        self.address_cache.mark_updating(host);

        match self.resolver.resolve(host, is_stamp).await {
            Ok(resolved) if !resolved.ips.is_empty() => {
                self.address_cache.save(host, resolved.ips, resolved.ttl);
                Ok(())
            }
            Ok(_) => {
                debug!("no usable address found for [{host}]");
                Ok(())
            }
            Err(err) => {
                if cached.ips.is_empty() {
                    return Err(err);
                }
                info!("using stale cached addresses of [{host}] for a grace period");
                self.address_cache
                    .extend_grace(host, cached.ips, EXPIRED_CACHED_IP_GRACE_TTL);
                Ok(())
            }
        }
    }

    /// Issues one HTTP request to `url` and returns the decoded body.
    ///
    /// `timeout` is clamped to the configured transport timeout; `None` (or
    /// zero) means the configured value. With `compress`, body-less requests
    /// advertise gzip and the response is transparently decoded.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch(
        &self,
        method: Method,
        url: &Uri,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: Option<&[u8]>,
        timeout: Option<Duration>,
        compress: bool,
    ) -> Result<FetchResponse> {
        if self.rebuilding.load(Ordering::SeqCst) {
            return Err(TransportError::Rebuilding);
        }
        let deadline = match timeout {
            Some(value) if !value.is_zero() && value < self.settings.timeout => value,
            _ => self.settings.timeout,
        };
        let (host, port) = split_host_port(url)?;
        if self.proxy_dialer.is_none() && host.ends_with(".onion") {
            return Err(TransportError::OnionWithoutProxy);
        }

        let authority = format!("{host}:{port}");
        let h3_client = self.h3_client.read().clone();
        let mut use_h3 = false;
        let mut has_alt_support = false;
        if h3_client.is_some() {
            if self.http3_probe {
                debug!("probing HTTP/3 transport for [{authority}]");
                use_h3 = true;
            } else if let Some(alt_port) = self.alt_svc.get(&authority) {
                has_alt_support = true;
                if alt_port != H3_BROKEN {
                    if alt_port == port {
                        debug!("using HTTP/3 transport for [{authority}]");
                        use_h3 = true;
                    } else {
                        debug!(
                            "ignoring Alt-Svc hint for [{authority}]: port {alt_port} does not match"
                        );
                        has_alt_support = false;
                    }
                }
            }
        }

        let mut url = url.clone();
        if let Some(body) = body {
            url = with_body_hash(&url, body)?;
        }
        let accept_gzip = body.is_none() && compress;
        let is_stamp = url.to_string().contains(".md");

        if self.rebuilding.load(Ordering::SeqCst) {
            return Err(TransportError::Rebuilding);
        }
        if let Err(err) = self.resolve_and_update_cache(&host, is_stamp).await {
            error!(
                "unable to resolve [{host}] - make sure the system resolver works, \
                 or that bootstrap_resolvers are set to resolvers that can be reached"
            );
            return Err(err);
        }

        if let Some(body) = body {
            if body.len() > MAX_DNS_PACKET_SIZE {
                return Err(TransportError::OversizedBody);
            }
        } else if method == Method::POST {
            return Err(TransportError::EmptyBody);
        }
        let body_bytes = body.map(Bytes::copy_from_slice);

        let make_request = || {
            build_request(
                &method,
                &url,
                accept,
                content_type,
                &self.user_agent,
                accept_gzip,
                body.map(<[u8]>::len),
            )
        };

        let h2_client = self.h2_client.read().clone();
        let mut expected_protocol = if use_h3 {
            HttpProtocol::H3
        } else {
            HttpProtocol::H2
        };
        let start = Instant::now();
        let mut result = match (use_h3, h3_client.as_ref()) {
            (true, Some(h3)) => {
                send_with_deadline(
                    deadline,
                    h3.request(&host, port, make_request()?, body_bytes.clone()),
                )
                .await
            }
            _ => {
                send_with_deadline(
                    deadline,
                    h2_client.request(&host, port, make_request()?, body_bytes.clone()),
                )
                .await
            }
        };
        let mut rtt = start.elapsed();

        let mut h3_dropped = false;
        if use_h3 && result.is_err() {
            debug!("HTTP/3 request failed for [{authority}], negative-caching and falling back");
            self.alt_svc.insert(&authority, H3_BROKEN);
            if self.retry_with_h2 {
                if self.rebuilding.load(Ordering::SeqCst) {
                    h2_client.close_idle_connections();
                    return Err(TransportError::Rebuilding);
                }
                h3_dropped = true;
                expected_protocol = HttpProtocol::H2;
                let retry_start = Instant::now();
                result = send_with_deadline(
                    deadline,
                    h2_client.request(&host, port, make_request()?, body_bytes.clone()),
                )
                .await;
                rtt = retry_start.elapsed();
            }
        }

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.handle_request_error(&h2_client, &err, rtt, deadline);
                return Err(err);
            }
        };

        // Controlled drop levers turn a finished session at the matching
        // version into a handshake failure.
        if let Some(tls) = response.tls {
            let dropped = match tls.version {
                TlsVersion::Tls13 => self.drop_tls13.load(Ordering::SeqCst),
                TlsVersion::Tls12 => self.drop_tls12.load(Ordering::SeqCst),
            };
            if dropped {
                let err = TransportError::TlsHandshake;
                self.handle_request_error(&h2_client, &err, rtt, deadline);
                return Err(err);
            }
        }

        if response.protocol != expected_protocol {
            return Err(TransportError::ProtocolMismatch);
        }

        if !response.status.is_success() {
            let err = TransportError::HttpStatus(response.status.as_u16());
            info!("HTTP client error: {err} - closing idle connections");
            h2_client.close_idle_connections();
            return Err(err);
        }

        if !h3_dropped && h3_client.is_some() && !has_alt_support {
            // A negative entry must survive a successful probe; parsing the
            // header again would resurrect a known-broken endpoint.
            if self.http3_probe && self.alt_svc.get(&authority) == Some(H3_BROKEN) {
                debug!("skipping Alt-Svc parsing for [{authority}]: previously failed HTTP/3");
            } else if let Some(alt_port) = parse_alt_svc(&response.headers, port) {
                info!("Alt-Svc advertised HTTP/3 on port {alt_port} for [{authority}]");
                self.alt_svc.insert(&authority, alt_port);
            }
        }

        let tls = self.validate_tls(&response, is_stamp)?;
        let status = response.status.as_u16();
        let body = decode_body(response, accept_gzip)?;
        Ok(FetchResponse {
            body,
            status,
            tls,
            rtt,
        })
    }

    /// Closes pooled connections and feeds TLS-level failures into the
    /// policy state machine, rebuilding the clients when it transitions.
    fn handle_request_error(
        &self,
        h2_client: &HttpClient,
        err: &TransportError,
        rtt: Duration,
        deadline: Duration,
    ) {
        info!("HTTP client error: {err} - closing idle connections");
        h2_client.close_idle_connections();
        if rtt >= deadline {
            info!("connection deadline exceeded");
        }
        let Some(kind) = classify_failure(err) else {
            return;
        };
        let max_version = self.tls.read().max_version;
        match max_version {
            TlsVersion::Tls13 => {
                if kind == TlsFailureKind::Handshake && rtt < deadline {
                    let rebuild = self.tls.write().note_tls13_failure();
                    if rebuild {
                        self.rebuild_transport();
                    }
                }
            }
            TlsVersion::Tls12 => {
                let mut policy = self.tls.write();
                if policy.keep_cipher_suite && rtt < deadline {
                    let outcome =
                        policy.note_tls12_failure(self.has_tls_connected.load(Ordering::SeqCst));
                    drop(policy);
                    if outcome.reset_counter {
                        self.has_tls_connected.store(0, Ordering::SeqCst);
                    }
                    if outcome.rebuild {
                        self.rebuild_transport();
                    }
                }
            }
        }
    }

    /// Enforces that the negotiated session matches the policy and sits in
    /// the safe-suite allow-lists, adopting the server's TLS 1.2 cipher when
    /// the policy is waiting for one.
    fn validate_tls(&self, response: &WireResponse, is_stamp: bool) -> Result<TlsSummary> {
        let summary = response.tls.ok_or(TransportError::MissingTls)?;
        let max_version = self.tls.read().max_version;
        if summary.version != max_version {
            return Err(TransportError::UnexpectedTlsVersion);
        }
        match summary.version {
            TlsVersion::Tls13 => {
                if let Some(cipher) = summary.cipher_suite {
                    if !TLS13_SAFE.contains(&cipher) {
                        return Err(TransportError::UnsafeTls(cipher));
                    }
                }
            }
            TlsVersion::Tls12 => {
                let cipher = summary.cipher_suite.ok_or(TransportError::MissingTls)?;
                if !TLS12_SAFE.contains(&cipher) {
                    return Err(TransportError::UnsafeTls(cipher));
                }
                let adopted = {
                    let mut policy = self.tls.write();
                    // Resolver-list hosts are public frontends; their suite
                    // may not fit the actual resolver.
                    !is_stamp && policy.adopt_server_cipher(cipher)
                };
                if adopted {
                    self.has_tls_connected.store(0, Ordering::SeqCst);
                    self.rebuild_transport();
                }
                let _ = self.has_tls_connected.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |count| (count < 10).then_some(count + 1),
                );
            }
        }
        Ok(summary)
    }

    /// GET without compression.
    pub async fn get(
        &self,
        url: &Uri,
        accept: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        self.fetch(Method::GET, url, accept, None, None, timeout, false)
            .await
    }

    /// GET advertising gzip; the body comes back decoded.
    pub async fn get_with_compression(
        &self,
        url: &Uri,
        accept: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        self.fetch(Method::GET, url, accept, None, None, timeout, true)
            .await
    }

    pub async fn post(
        &self,
        url: &Uri,
        accept: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        self.fetch(
            Method::POST,
            url,
            accept,
            content_type,
            Some(body),
            timeout,
            false,
        )
        .await
    }

    async fn doh_like_query(
        &self,
        media_type: &'static str,
        use_get: bool,
        url: &Uri,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        if use_get {
            let url = with_query_param(url, "dns", &URL_SAFE_NO_PAD.encode(body))?;
            return self.get(&url, Some(media_type), timeout).await;
        }
        self.post(url, Some(media_type), Some(media_type), body, timeout)
            .await
    }

    /// DNS-over-HTTPS query: POST with `application/dns-message`, or GET with
    /// the base64url-encoded message in the `dns` query parameter.
    pub async fn doh_query(
        &self,
        use_get: bool,
        url: &Uri,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        self.doh_like_query(MIME_DNS_MESSAGE, use_get, url, body, timeout)
            .await
    }

    /// Oblivious DoH query; identical shape with the ODoH media type.
    pub async fn odoh_query(
        &self,
        use_get: bool,
        url: &Uri,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<FetchResponse> {
        self.doh_like_query(MIME_ODOH_MESSAGE, use_get, url, body, timeout)
            .await
    }
}

fn build_clients(
    policy: &mut TlsPolicy,
    cache: &Arc<AddressCache>,
    settings: &ClientSettings,
    proxy_dialer: &Option<Arc<dyn ProxyDialer>>,
    http_proxy: &Option<Uri>,
) -> Result<(Arc<HttpClient>, Option<Arc<H3Client>>)> {
    let h2_config = Arc::new(policy.build_client_config()?);
    let dialer = Dialer {
        cache: cache.clone(),
        timeout: settings.timeout,
        proxy_dialer: proxy_dialer.clone(),
        http_proxy: http_proxy.clone(),
    };
    let h2_client = Arc::new(HttpClient::new(
        dialer,
        h2_config,
        settings.keepalive,
        !settings.disable_keepalives,
    ));
    // QUIC is TLS 1.3 only and cannot ride a TCP proxy; under a TLS 1.2
    // policy every HTTP/3 attempt would fail its handshake anyway.
    let h3_client = if settings.http3
        && proxy_dialer.is_none()
        && policy.max_version == TlsVersion::Tls13
    {
        let h3_config = Arc::new(policy.build_h3_client_config()?);
        Some(Arc::new(H3Client::new(
            cache.clone(),
            h3_config,
            settings.use_ipv4,
            settings.use_ipv6,
            settings.prefer_ipv6,
        )))
    } else {
        None
    };
    Ok((h2_client, h3_client))
}

async fn send_with_deadline<F>(deadline: Duration, request: F) -> Result<WireResponse>
where
    F: std::future::Future<Output = Result<WireResponse>>,
{
    match timeout(deadline, request).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

fn build_request(
    method: &Method,
    url: &Uri,
    accept: Option<&str>,
    content_type: Option<&str>,
    user_agent: &str,
    accept_gzip: bool,
    content_length: Option<usize>,
) -> Result<Request<()>> {
    let mut builder = Request::builder()
        .method(method.clone())
        .uri(url.clone())
        .header(header::USER_AGENT, user_agent)
        .header(header::CACHE_CONTROL, "max-stale");
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT, accept);
    }
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    if accept_gzip {
        builder = builder.header(header::ACCEPT_ENCODING, "gzip");
    }
    if let Some(length) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    builder
        .body(())
        .map_err(|err| TransportError::InvalidUrl(err.to_string()))
}

fn split_host_port(url: &Uri) -> Result<(String, u16)> {
    let host = url
        .host()
        .ok_or_else(|| TransportError::InvalidUrl(format!("no host in [{url}]")))?;
    Ok((host.to_string(), url.port_u16().unwrap_or(443)))
}

/// Binds an integrity tag to the request: the hex of the first 32 bytes of
/// SHA-512 of the body, carried as the `body_hash` query parameter.
fn with_body_hash(url: &Uri, body: &[u8]) -> Result<Uri> {
    let digest = Sha512::digest(body);
    with_query_param(url, "body_hash", &hex::encode(&digest[..32]))
}

/// Sets `key=value` in the URL query, replacing an existing `key`.
fn with_query_param(url: &Uri, key: &str, value: &str) -> Result<Uri> {
    let path = url.path();
    let mut pairs: Vec<String> = url
        .query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some(key))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    pairs.push(format!("{key}={value}"));
    let path_and_query = format!("{path}?{}", pairs.join("&"));

    let mut parts = url.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query.as_str())
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|err| TransportError::InvalidUrl(err.to_string()))
}

/// Applies the compression contract: gzip must arrive exactly when it was
/// requested, and the decoded body stays within the global length cap.
fn decode_body(response: WireResponse, accept_gzip: bool) -> Result<Vec<u8>> {
    let encoding = response
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);
    match (accept_gzip, encoding.as_deref()) {
        (true, Some("gzip")) => {
            let mut decoder =
                GzDecoder::new(&response.body[..]).take((crate::MAX_HTTP_BODY_LENGTH + 1) as u64);
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded)?;
            if decoded.len() > crate::MAX_HTTP_BODY_LENGTH {
                return Err(TransportError::BodyTooLarge);
            }
            Ok(decoded)
        }
        (false, Some(_)) => Err(TransportError::UnexpectedCompression),
        (true, Some(_)) => Err(TransportError::WrongEncoding),
        (true, None) => Err(TransportError::MissingCompression),
        (false, None) => Ok(response.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};
    use std::io::Write as _;

    fn transport(config: TransportConfig) -> DohTransport {
        DohTransport::new(config).unwrap()
    }

    fn cache_host(t: &DohTransport, host: &str) {
        t.address_cache.save(
            host,
            vec!["127.0.0.1".parse().unwrap()],
            Duration::from_secs(300),
        );
    }

    /// Query parameters are appended, and an existing key is replaced.
    #[test]
    fn query_param_append_and_replace() {
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let with_param = with_query_param(&url, "dns", "AAAA").unwrap();
        assert_eq!(with_param.query(), Some("dns=AAAA"));

        let url: Uri = "https://example.test/dns-query?body_hash=old&x=1".parse().unwrap();
        let replaced = with_query_param(&url, "body_hash", "new").unwrap();
        assert_eq!(replaced.query(), Some("x=1&body_hash=new"));
    }

    /// `body_hash` is the hex of the first 32 bytes of SHA-512 of the body,
    /// and an existing tag is replaced rather than duplicated.
    #[test]
    fn body_hash_binding() {
        let body = [0x00u8, 0x01, 0x02];
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let bound = with_body_hash(&url, &body).unwrap();
        let value = bound.query().unwrap().strip_prefix("body_hash=").unwrap().to_string();
        assert_eq!(value.len(), 64);
        assert_eq!(value, hex::encode(&Sha512::digest(body)[..32]));

        let rebound = with_body_hash(&bound, &[0x03u8]).unwrap();
        let query = rebound.query().unwrap();
        assert_eq!(query.matches("body_hash=").count(), 1);
        assert_ne!(query, bound.query().unwrap());
    }

    /// The `dns` GET parameter base64url-decodes back to the exact body.
    #[test]
    fn doh_get_parameter_roundtrip() {
        let body = b"\x00\x00\x01\x00\x00\x01";
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let encoded = with_query_param(&url, "dns", &URL_SAFE_NO_PAD.encode(body)).unwrap();
        let query = encoded.query().unwrap();
        let value = query.strip_prefix("dns=").unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(value).unwrap(), body);
    }

    /// Authorities default to port 443.
    #[test]
    fn authority_splitting() {
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        assert_eq!(split_host_port(&url).unwrap(), ("example.test".to_string(), 443));
        let url: Uri = "https://example.test:8443/dns-query".parse().unwrap();
        assert_eq!(split_host_port(&url).unwrap(), ("example.test".to_string(), 8443));
    }

    /// Requests carry the standing header set and an exact content length.
    #[test]
    fn request_headers() {
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let request = build_request(
            &Method::POST,
            &url,
            Some("application/dns-message"),
            Some("application/dns-message"),
            "doh-transport",
            false,
            Some(3),
        )
        .unwrap();
        let headers = request.headers();
        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "doh-transport");
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "max-stale");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "3");
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());

        let get = build_request(&Method::GET, &url, None, None, "doh-transport", true, None)
            .unwrap();
        assert_eq!(get.headers().get(header::ACCEPT_ENCODING).unwrap(), "gzip");
    }

    fn wire_response(headers: HeaderMap, body: Vec<u8>) -> WireResponse {
        WireResponse {
            status: StatusCode::OK,
            headers,
            body,
            tls: Some(TlsSummary {
                version: TlsVersion::Tls13,
                cipher_suite: Some(4865),
            }),
            protocol: HttpProtocol::H2,
        }
    }

    /// A gzip response to a gzip request decodes back to the original bytes.
    #[test]
    fn gzip_decode_roundtrip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"sdns://resolver-list").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let decoded = decode_body(wire_response(headers, compressed), true).unwrap();
        assert_eq!(decoded, b"sdns://resolver-list");
    }

    /// Compression must arrive exactly when requested.
    #[test]
    fn compression_mismatches() {
        let mut gzip_headers = HeaderMap::new();
        gzip_headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        assert!(matches!(
            decode_body(wire_response(gzip_headers.clone(), vec![1]), false),
            Err(TransportError::UnexpectedCompression)
        ));

        let mut br_headers = HeaderMap::new();
        br_headers.insert(header::CONTENT_ENCODING, "br".parse().unwrap());
        assert!(matches!(
            decode_body(wire_response(br_headers, vec![1]), true),
            Err(TransportError::WrongEncoding)
        ));

        assert!(matches!(
            decode_body(wire_response(HeaderMap::new(), vec![1]), true),
            Err(TransportError::MissingCompression)
        ));

        let plain = decode_body(wire_response(HeaderMap::new(), vec![1, 2]), false).unwrap();
        assert_eq!(plain, vec![1, 2]);
    }

    /// `.onion` hosts are rejected before any resolution when no proxy
    /// dialer is configured.
    #[tokio::test]
    async fn onion_requires_proxy() {
        let t = transport(TransportConfig::default());
        let url: Uri = "https://resolver.onion/dns-query".parse().unwrap();
        let err = t.get(&url, None, None).await.unwrap_err();
        assert!(matches!(err, TransportError::OnionWithoutProxy));
    }

    /// POST requires a body.
    #[tokio::test]
    async fn post_without_body_fails() {
        let t = transport(TransportConfig::default());
        cache_host(&t, "example.test");
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let err = t
            .fetch(Method::POST, &url, None, None, None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::EmptyBody));
    }

    /// Bodies above the DNS packet limit are rejected before sending.
    #[tokio::test]
    async fn oversized_body_fails() {
        let t = transport(TransportConfig::default());
        cache_host(&t, "example.test");
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let body = vec![0u8; MAX_DNS_PACKET_SIZE + 1];
        let err = t
            .post(&url, None, Some("application/dns-message"), &body, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::OversizedBody));
    }

    /// While a rebuild is marked in progress, fetches fail fast.
    #[tokio::test]
    async fn fetch_fails_during_rebuild() {
        let t = transport(TransportConfig::default());
        t.rebuilding.store(true, Ordering::SeqCst);
        let url: Uri = "https://example.test/dns-query".parse().unwrap();
        let err = t.get(&url, None, None).await.unwrap_err();
        assert!(matches!(err, TransportError::Rebuilding));
    }

    /// When re-resolution fails, stale cached addresses are refreshed for
    /// the grace period instead of failing the fetch.
    #[tokio::test]
    async fn stale_addresses_get_grace_period() {
        let t = transport(TransportConfig::default());
        t.address_cache.save(
            "example.test",
            vec!["203.0.113.7".parse().unwrap()],
            Duration::from_secs(300),
        );
        t.address_cache.force_expire("example.test");

        // Internal resolvers not ready, fallback disabled: resolution fails,
        // the stale entry carries the fetch.
        t.resolve_and_update_cache("example.test", false)
            .await
            .unwrap();
        let found = t.address_cache.lookup("example.test");
        assert!(!found.expired);
        assert_eq!(found.ips, vec!["203.0.113.7".parse::<IpAddr>().unwrap()]);
        let expiration = t.address_cache.expiration_of("example.test").unwrap();
        assert!(expiration <= Instant::now() + EXPIRED_CACHED_IP_GRACE_TTL);
    }

    /// Without a cached entry the same failure is surfaced to the caller.
    #[tokio::test]
    async fn resolution_failure_without_stale_entry() {
        let t = transport(TransportConfig::default());
        let err = t
            .resolve_and_update_cache("unknown.test", false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Resolution { .. }));
    }

    /// An HTTP/3 failure negative-caches the authority and retries over
    /// HTTP/2 within the same fetch.
    #[tokio::test]
    async fn h3_failure_negative_caches_and_falls_back() {
        let t = transport(TransportConfig {
            http3: true,
            http3_probe: true,
            ..TransportConfig::default()
        });
        assert!(t.h3_client.read().is_some());
        cache_host(&t, "h3fail.test");
        let url: Uri = "https://h3fail.test:9/dns-query".parse().unwrap();
        let err = t
            .get(&url, None, Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(!matches!(err, TransportError::Rebuilding));
        assert_eq!(t.alt_svc.get("h3fail.test:9"), Some(H3_BROKEN));
    }

    /// IP-literal hosts bypass resolution entirely.
    #[tokio::test]
    async fn ip_literal_needs_no_resolution() {
        let t = transport(TransportConfig::default());
        t.resolve_and_update_cache("203.0.113.7", false)
            .await
            .unwrap();
        assert!(t.address_cache.lookup("203.0.113.7").ips.is_empty());
    }
}
