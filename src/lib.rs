//! Encrypted upstream transport for DNS proxies.
//!
//! This library implements the HTTP side of an encrypted DNS proxy: it issues
//! HTTP/2 and HTTP/3 requests to upstream DoH/ODoH resolvers and resolver-list
//! servers, without ever re-entering the proxy's own DNS listener. It combines
//! a per-host address cache with stale-grace reuse, a bootstrap resolver for
//! cold starts, an Alt-Svc driven HTTP/3 promotion cache, and a TLS policy
//! engine that can degrade from TLS 1.3 to TLS 1.2 and back in response to
//! handshake failures.
//!
//! The transport treats request and response bodies as opaque bytes; DNS
//! message semantics, resolver selection and retry across resolvers are the
//! caller's concern.

pub mod alt_svc;
pub mod bootstrap;
pub mod cache;
pub mod connect;
pub mod error;
pub mod http2;
pub mod http3;
pub mod tls;
pub mod transport;

use std::path::PathBuf;
use std::time::Duration;

pub use connect::ProxyDialer;
pub use error::{Result, TransportError};
pub use tls::{TlsSummary, TlsVersion};
pub use transport::{DohTransport, FetchResponse};

/// Bootstrap resolver used when none is configured.
pub const DEFAULT_BOOTSTRAP_RESOLVER: &str = "9.9.9.9:53";
/// How long an idle upstream connection may be kept around.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);
/// Default deadline for a whole fetch.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-query deadline when talking to a single bootstrap resolver.
pub const RESOLVER_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// TTL assigned to addresses obtained from the operating system resolver.
pub const SYSTEM_RESOLVER_IP_TTL: Duration = Duration::from_secs(12 * 60 * 60);
/// Floor applied to every TTL before an address is cached.
pub const MIN_RESOLVER_IP_TTL: Duration = Duration::from_secs(4 * 60 * 60);
/// Upper bound of the random jitter added to cached-address TTLs.
pub const RESOLVER_IP_TTL_MAX_JITTER: Duration = Duration::from_secs(15 * 60);
/// How long expired cached addresses remain usable when re-resolution fails.
pub const EXPIRED_CACHED_IP_GRACE_TTL: Duration = Duration::from_secs(15 * 60);

/// Largest DNS message accepted as a request body, also advertised via EDNS0.
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
/// Largest HTTP response body the transport will read.
pub const MAX_HTTP_BODY_LENGTH: usize = 4_000_000;

pub(crate) const DEFAULT_USER_AGENT: &str = "doh-transport";

/// Transport protocol the bootstrap resolver tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MainProto {
    #[default]
    Udp,
    Tcp,
}

/// User-facing transport knobs.
///
/// The struct is the configuration boundary of the transport; parsing a
/// configuration file into it is the caller's job.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Value of the `User-Agent` header on every upstream request.
    pub user_agent: String,
    /// Deadline for a whole fetch; per-call timeouts are clamped to it.
    pub timeout: Duration,
    /// Idle lifetime of reusable upstream connections.
    pub keepalive: Duration,
    /// Open a fresh connection for every request.
    pub disable_keepalives: bool,
    /// Retry once over HTTP/2 after an HTTP/3 failure.
    pub retry_with_h2: bool,
    pub use_ipv4: bool,
    pub use_ipv6: bool,
    /// Prefer the IPv6 family when both are usable and nothing is cached.
    pub prefer_ipv6: bool,
    /// Protocol the bootstrap resolver tries first.
    pub main_proto: MainProto,
    /// The proxy's own resolvers, used once the proxy is operational.
    pub internal_resolvers: Vec<String>,
    /// Plain `IP:port` resolvers trusted for initial address resolution.
    pub bootstrap_resolvers: Vec<String>,
    /// Never fall through to bootstrap or system DNS for ordinary queries.
    pub no_fallback: bool,
    /// Never consult the operating system resolver.
    pub ignore_system_dns: bool,
    /// Enable the QUIC transport.
    pub http3: bool,
    /// Always try HTTP/3 first for eligible requests.
    pub http3_probe: bool,
    /// Start with a TLS 1.2 policy instead of TLS 1.3.
    pub force_tls12: bool,
    pub tls_disable_session_tickets: bool,
    /// Explicit cipher suites by IANA numeric identifier.
    pub tls_cipher_suite: Option<Vec<u16>>,
    /// NSS-format key log destination, for traffic inspection.
    pub tls_key_log_file: Option<PathBuf>,
    /// Extra root CA bundle (PEM) appended to the system trust store.
    pub root_ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS.
    pub client_cert_file: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS.
    pub client_key_file: Option<PathBuf>,
    /// Outbound HTTP CONNECT proxy URL.
    pub http_proxy: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            disable_keepalives: true,
            retry_with_h2: true,
            use_ipv4: true,
            use_ipv6: false,
            prefer_ipv6: false,
            main_proto: MainProto::Udp,
            internal_resolvers: Vec::new(),
            bootstrap_resolvers: vec![DEFAULT_BOOTSTRAP_RESOLVER.to_string()],
            no_fallback: true,
            ignore_system_dns: true,
            http3: false,
            http3_probe: false,
            force_tls12: false,
            tls_disable_session_tickets: true,
            tls_cipher_suite: None,
            tls_key_log_file: None,
            root_ca_file: None,
            client_cert_file: None,
            client_key_file: None,
            http_proxy: None,
        }
    }
}
