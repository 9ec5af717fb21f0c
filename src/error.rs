//! Error types for the upstream transport

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("HTTP/3 error: {0}")]
    H3(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("rebuilding transport")]
    Rebuilding,

    #[error("unable to resolve [{host}]: {reason}")]
    Resolution { host: String, reason: String },

    #[error("onion service is not reachable without Tor")]
    OnionWithoutProxy,

    #[error("request failed: empty body")]
    EmptyBody,

    #[error("request is bigger than allowed dns packet size")]
    OversizedBody,

    #[error("request failed: protocol mismatch")]
    ProtocolMismatch,

    #[error("response carries no TLS state")]
    MissingTls,

    #[error("tls handshake failure")]
    TlsHandshake,

    #[error("unexpected TLS version in response")]
    UnexpectedTlsVersion,

    #[error("unsafe TLS usage (cipher suite {0})")]
    UnsafeTls(u16),

    #[error("webserver returned status {0}")]
    HttpStatus(u16),

    #[error("response body exceeds maximum length")]
    BodyTooLarge,

    #[error("response has compression without requesting it")]
    UnexpectedCompression,

    #[error("compress is set but response has incorrect encoding")]
    WrongEncoding,

    #[error("compress is set but response has no encoding")]
    MissingCompression,

    #[error("connection timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;
