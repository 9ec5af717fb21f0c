//! HTTP/3 client over quinn.
//!
//! Each request binds a fresh ephemeral UDP socket and opens an early-data
//! QUIC connection with the SNI set to the original hostname, never the IP.
//! QUIC mandates TLS 1.3 and the offered suites are restricted to the safe
//! set, so the response summary carries the version without a cipher id.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use http::Request;
use quinn::crypto::rustls::QuicClientConfig;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::cache::AddressCache;
use crate::connect::trim_ip_brackets;
use crate::error::{Result, TransportError};
use crate::http2::{HttpProtocol, WireResponse};
use crate::tls::{TlsSummary, TlsVersion};
use crate::MAX_HTTP_BODY_LENGTH;

/// QUIC-backed HTTP/3 client.
pub(crate) struct H3Client {
    cache: Arc<AddressCache>,
    tls_config: Arc<rustls::ClientConfig>,
    use_ipv4: bool,
    use_ipv6: bool,
    prefer_ipv6: bool,
}

impl H3Client {
    pub(crate) fn new(
        cache: Arc<AddressCache>,
        tls_config: Arc<rustls::ClientConfig>,
        use_ipv4: bool,
        use_ipv6: bool,
        prefer_ipv6: bool,
    ) -> Self {
        Self {
            cache,
            tls_config,
            use_ipv4,
            use_ipv6,
            prefer_ipv6,
        }
    }

    /// Picks the remote address from the cache, falling back to the system
    /// resolver with the configured family preference.
    async fn remote_addr(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = trim_ip_brackets(host).parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let cached = self.cache.lookup(host);
        if let Some(ip) = cached.ips.first() {
            return Ok(SocketAddr::new(*ip, port));
        }
        warn!("[{host}] address was not cached before the HTTP/3 dial");
        let want_v6 = self.use_ipv6 && (self.prefer_ipv6 || !self.use_ipv4);
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        addrs
            .iter()
            .find(|addr| addr.is_ipv6() == want_v6)
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TransportError::Resolution {
                host: host.to_string(),
                reason: "no addresses from the system resolver".to_string(),
            })
    }

    pub(crate) async fn request(
        &self,
        host: &str,
        port: u16,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<WireResponse> {
        let remote = self.remote_addr(host, port).await?;
        debug!("dialing {remote} for HTTP/3");

        let bind = if remote.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;

        let quic_tls = QuicClientConfig::try_from((*self.tls_config).clone())
            .map_err(|err| TransportError::H3(format!("quic tls config: {err}")))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));
        let mut transport = quinn::TransportConfig::default();
        // Clients never accept peer-initiated bidirectional streams; the uni
        // streams cover SETTINGS, both QPACK directions and GREASE.
        transport.max_concurrent_bidi_streams(3u32.into());
        transport.max_concurrent_uni_streams(4u32.into());
        transport.datagram_receive_buffer_size(None);
        transport.datagram_send_buffer_size(0);
        client_config.transport_config(Arc::new(transport));
        endpoint.set_default_client_config(client_config);

        let sni = trim_ip_brackets(host);
        let connecting = endpoint
            .connect(remote, sni)
            .map_err(|err| TransportError::H3(format!("connect: {err}")))?;
        let connection = match connecting.into_0rtt() {
            Ok((connection, _accepted)) => connection,
            Err(connecting) => connecting
                .await
                .map_err(|err| TransportError::H3(format!("handshake: {err}")))?,
        };
        let quic_handle = connection.clone();

        let h3_connection = h3_quinn::Connection::new(connection);
        let (mut driver, mut send_request) = h3::client::new(h3_connection)
            .await
            .map_err(|err| TransportError::H3(format!("setup: {err}")))?;
        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        let result = Self::exchange(&mut send_request, request, body).await;
        quic_handle.close(0u32.into(), b"");
        result
    }

    async fn exchange(
        send_request: &mut h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<WireResponse> {
        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(|err| TransportError::H3(format!("send_request: {err}")))?;
        if let Some(body) = body {
            stream
                .send_data(body)
                .await
                .map_err(|err| TransportError::H3(format!("send_data: {err}")))?;
        }
        stream
            .finish()
            .await
            .map_err(|err| TransportError::H3(format!("finish: {err}")))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|err| TransportError::H3(format!("recv_response: {err}")))?;
        let status = response.status();
        let headers = response.headers().clone();

        let mut body = Vec::new();
        while let Some(mut chunk) = stream
            .recv_data()
            .await
            .map_err(|err| TransportError::H3(format!("recv_data: {err}")))?
        {
            while chunk.has_remaining() {
                let piece = chunk.chunk();
                body.extend_from_slice(piece);
                let advance = piece.len();
                chunk.advance(advance);
            }
            if body.len() > MAX_HTTP_BODY_LENGTH {
                return Err(TransportError::BodyTooLarge);
            }
        }

        Ok(WireResponse {
            status,
            headers,
            body,
            tls: Some(TlsSummary {
                version: TlsVersion::Tls13,
                cipher_suite: None,
            }),
            protocol: HttpProtocol::H3,
        })
    }
}
