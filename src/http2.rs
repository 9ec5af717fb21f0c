//! HTTP/2 client over a hand-driven `h2` connection.
//!
//! HTTP/1.1 is never acceptable upstream, so instead of a general-purpose
//! client the transport performs its own TLS handshake (ALPN `h2`) and drives
//! the `h2` connection directly. That keeps the negotiated TLS state visible
//! for validation, which a pooled general-purpose client would hide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::SendRequest;
use http::{HeaderMap, Request, StatusCode};
use parking_lot::Mutex;
use tracing::debug;

use crate::connect::Dialer;
use crate::error::{Result, TransportError};
use crate::tls::TlsSummary;
use crate::MAX_HTTP_BODY_LENGTH;

/// Wire protocol a response actually arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpProtocol {
    H2,
    H3,
}

/// A fully read upstream response, body still raw (possibly gzip).
pub(crate) struct WireResponse {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) tls: Option<TlsSummary>,
    pub(crate) protocol: HttpProtocol,
}

#[derive(Clone)]
struct PooledConn {
    send: SendRequest<Bytes>,
    tls: TlsSummary,
    last_used: Instant,
}

/// HTTP/2 client bound to the address cache through its dialer.
pub(crate) struct HttpClient {
    dialer: Dialer,
    tls_config: Arc<rustls::ClientConfig>,
    keepalive: Duration,
    reuse_connections: bool,
    pool: Mutex<HashMap<String, PooledConn>>,
}

impl HttpClient {
    pub(crate) fn new(
        dialer: Dialer,
        tls_config: Arc<rustls::ClientConfig>,
        keepalive: Duration,
        reuse_connections: bool,
    ) -> Self {
        Self {
            dialer,
            tls_config,
            keepalive,
            reuse_connections,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Drops every pooled connection. Called on request errors and on every
    /// transport rebuild.
    pub(crate) fn close_idle_connections(&self) {
        self.pool.lock().clear();
    }

    async fn connection(&self, host: &str, port: u16) -> Result<(SendRequest<Bytes>, TlsSummary)> {
        let authority = format!("{host}:{port}");
        if self.reuse_connections {
            let pooled = self.pool.lock().get(&authority).cloned();
            if let Some(conn) = pooled {
                if conn.last_used.elapsed() <= self.keepalive {
                    match conn.send.clone().ready().await {
                        Ok(send) => {
                            debug!("reusing idle connection to {authority}");
                            self.pool.lock().entry(authority).and_modify(|entry| {
                                entry.last_used = Instant::now();
                            });
                            return Ok((send, conn.tls));
                        }
                        Err(err) => {
                            debug!("pooled connection to {authority} is dead: {err}");
                            self.pool.lock().remove(&authority);
                        }
                    }
                } else {
                    self.pool.lock().remove(&authority);
                }
            }
        }

        let (stream, tls) = self
            .dialer
            .connect_tls(host, port, self.tls_config.clone())
            .await?;
        let (send, connection) = h2::client::handshake(stream).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("h2 connection terminated: {err}");
            }
        });
        let send = send.ready().await?;
        if self.reuse_connections {
            self.pool.lock().insert(
                authority,
                PooledConn {
                    send: send.clone(),
                    tls,
                    last_used: Instant::now(),
                },
            );
        }
        Ok((send, tls))
    }

    /// Sends one request and reads the whole response body, bounded by
    /// `MAX_HTTP_BODY_LENGTH`.
    pub(crate) async fn request(
        &self,
        host: &str,
        port: u16,
        request: Request<()>,
        body: Option<Bytes>,
    ) -> Result<WireResponse> {
        let (mut send, tls) = self.connection(host, port).await?;

        let end_of_stream = body.is_none();
        let (response, mut send_stream) = send.send_request(request, end_of_stream)?;
        if let Some(body) = body {
            send_stream.send_data(body, true)?;
        }

        let mut response = response.await?;
        let status = response.status();
        let headers = response.headers().clone();

        let recv_stream = response.body_mut();
        let mut body = Vec::new();
        while let Some(chunk) = recv_stream.data().await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            let _ = recv_stream.flow_control().release_capacity(chunk.len());
            if body.len() > MAX_HTTP_BODY_LENGTH {
                return Err(TransportError::BodyTooLarge);
            }
        }

        Ok(WireResponse {
            status,
            headers,
            body,
            tls: Some(tls),
            protocol: HttpProtocol::H2,
        })
    }
}
