//! TCP dialing and TLS session establishment.
//!
//! The dialer substitutes cached addresses for DNS resolution: the fetch
//! orchestrator has already populated the address cache by the time a dial
//! happens, so the TCP layer never resolves hostnames itself except as a
//! logged last resort. Outbound SOCKS-style dialers and HTTP CONNECT proxies
//! replace the direct connect when configured.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use rustls::pki_types::ServerName;
use rustls::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::cache::AddressCache;
use crate::error::{Result, TransportError};
use crate::tls::{TlsSummary, TlsVersion};

/// Streams the transport can speak TLS over.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Caller-supplied outbound dialer (SOCKS or similar). When configured it
/// replaces direct TCP connects entirely; HTTP/3 is unavailable through it.
pub trait ProxyDialer: Send + Sync {
    fn dial(
        &self,
        host: &str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Box<dyn AsyncReadWrite>>> + Send + '_>>;
}

/// Dials upstream authorities using cached addresses.
pub(crate) struct Dialer {
    pub(crate) cache: Arc<AddressCache>,
    pub(crate) timeout: Duration,
    pub(crate) proxy_dialer: Option<Arc<dyn ProxyDialer>>,
    pub(crate) http_proxy: Option<Uri>,
}

impl Dialer {
    pub(crate) async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn AsyncReadWrite>> {
        if let Some(proxy) = &self.proxy_dialer {
            let stream = timeout(self.timeout, proxy.dial(host, port))
                .await
                .map_err(|_| TransportError::Timeout)??;
            return Ok(stream);
        }
        if let Some(proxy) = &self.http_proxy {
            return self.dial_via_connect(proxy, host, port).await;
        }
        let addr = self.target_addr(host, port).await?;
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    /// Picks the address to dial: an IP literal as-is, otherwise the first
    /// cached address. The OS resolver is the last line; in well-behaved
    /// flows the cache was already filled before dialing.
    async fn target_addr(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = trim_ip_brackets(host).parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let cached = self.cache.lookup(host);
        if let Some(ip) = cached.ips.first() {
            debug!("[{host}] dialing cached address {ip}");
            return Ok(SocketAddr::new(*ip, port));
        }
        warn!("[{host}] address was not cached before dialing");
        let mut addrs = lookup_host((host, port)).await?;
        addrs.next().ok_or_else(|| TransportError::Resolution {
            host: host.to_string(),
            reason: "no addresses from the system resolver".to_string(),
        })
    }

    /// Tunnels through an HTTP proxy with a `CONNECT` request.
    async fn dial_via_connect(
        &self,
        proxy: &Uri,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn AsyncReadWrite>> {
        let proxy_host = proxy
            .host()
            .ok_or_else(|| TransportError::Proxy("HTTP proxy URL has no host".to_string()))?;
        let proxy_port = proxy.port_u16().unwrap_or(80);

        let mut stream = timeout(self.timeout, async {
            let mut addrs = lookup_host((proxy_host, proxy_port)).await?;
            let addr = addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "proxy host did not resolve")
            })?;
            TcpStream::connect(addr).await
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        let connect =
            format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        stream.write_all(connect.as_bytes()).await?;
        stream.flush().await?;

        // Read the proxy's status line and headers, nothing more.
        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            if response.len() >= 4096 {
                return Err(TransportError::Proxy(
                    "oversized response to CONNECT".to_string(),
                ));
            }
            let read = stream.read(&mut byte).await?;
            if read == 0 {
                return Err(TransportError::Proxy(
                    "proxy closed the connection during CONNECT".to_string(),
                ));
            }
            response.push(byte[0]);
        }
        let status_line = String::from_utf8_lossy(&response);
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);
        if !(200..300).contains(&status) {
            return Err(TransportError::Proxy(format!(
                "proxy refused CONNECT with status {status}"
            )));
        }
        Ok(Box::new(stream))
    }

    /// Dials and completes a TLS handshake, returning the stream together
    /// with what was negotiated. Anything but ALPN `h2` is rejected here:
    /// HTTP/1.x upstreams are never acceptable.
    pub(crate) async fn connect_tls(
        &self,
        host: &str,
        port: u16,
        tls_config: Arc<rustls::ClientConfig>,
    ) -> Result<(TlsStream<Box<dyn AsyncReadWrite>>, TlsSummary)> {
        let tcp = self.dial(host, port).await?;
        let server_name = ServerName::try_from(trim_ip_brackets(host).to_string())
            .map_err(|_| TransportError::InvalidUrl(format!("invalid server name: {host}")))?;
        let connector = TlsConnector::from(tls_config);
        let stream = timeout(self.timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (_, session) = stream.get_ref();
        let version = match session.protocol_version() {
            Some(ProtocolVersion::TLSv1_3) => TlsVersion::Tls13,
            Some(ProtocolVersion::TLSv1_2) => TlsVersion::Tls12,
            _ => return Err(TransportError::UnexpectedTlsVersion),
        };
        let cipher_suite = session
            .negotiated_cipher_suite()
            .map(|suite| u16::from(suite.suite()));
        if session.alpn_protocol() != Some(b"h2") {
            return Err(TransportError::ProtocolMismatch);
        }
        debug!(
            "TLS session established with {host}:{port} ({version:?}, cipher {cipher_suite:?})"
        );
        Ok((
            stream,
            TlsSummary {
                version,
                cipher_suite,
            },
        ))
    }
}

/// IPv6 literals arrive bracketed from URL authorities.
pub(crate) fn trim_ip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}
