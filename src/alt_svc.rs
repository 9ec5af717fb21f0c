//! Alt-Svc driven HTTP/3 promotion cache.
//!
//! Maps a request authority (`host:port`) to the UDP port advertised for
//! HTTP/3, or to `0` once HTTP/3 is known to be broken for that authority.

use std::collections::HashMap;

use http::header::ALT_SVC;
use http::HeaderMap;
use parking_lot::RwLock;
use tracing::debug;

/// `Alt-Svc` port meaning "HTTP/3 failed here, do not try again".
pub const H3_BROKEN: u16 = 0;

const MAX_ALT_SVC_HEADERS: usize = 8;
const MAX_ALT_SVC_TOKENS: usize = 16;

/// Authority → alternative HTTP/3 port (or the negative sentinel).
#[derive(Default)]
pub struct AltSvcCache {
    entries: RwLock<HashMap<String, u16>>,
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, authority: &str) -> Option<u16> {
        self.entries.read().get(authority).copied()
    }

    pub fn insert(&self, authority: &str, alt_port: u16) {
        debug!("caching alt port {alt_port} for [{authority}]");
        self.entries
            .write()
            .insert(authority.to_string(), alt_port);
    }
}

/// Extracts the advertised HTTP/3 port from a response's `Alt-Svc` headers.
///
/// Only `h3=":N"` tokens are understood; the first port that parses wins.
/// When an `h3` token is present but no port parses, the request port is
/// returned so the authority is still promoted. At most
/// `MAX_ALT_SVC_HEADERS` header lines and `MAX_ALT_SVC_TOKENS` tokens per
/// line are examined.
pub fn parse_alt_svc(headers: &HeaderMap, request_port: u16) -> Option<u16> {
    let mut saw_h3 = false;
    for value in headers.get_all(ALT_SVC).iter().take(MAX_ALT_SVC_HEADERS) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for token in value.split(';').take(MAX_ALT_SVC_TOKENS) {
            let token = token.trim();
            if let Some(rest) = token.strip_prefix("h3=\":") {
                saw_h3 = true;
                if let Some(port) = rest.strip_suffix('"') {
                    if let Ok(port) = port.parse::<u16>() {
                        return Some(port);
                    }
                }
            } else if token.starts_with("h3=") {
                saw_h3 = true;
            }
        }
    }
    saw_h3.then_some(request_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(ALT_SVC, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    /// A plain `h3=":8443"` advertisement yields the advertised port.
    #[test]
    fn parses_h3_port() {
        let map = headers(&["h3=\":8443\"; ma=86400"]);
        assert_eq!(parse_alt_svc(&map, 443), Some(8443));
    }

    /// The first port that parses wins over later headers.
    #[test]
    fn first_parsed_port_wins() {
        let map = headers(&["h3=\":8443\"", "h3=\":9443\""]);
        assert_eq!(parse_alt_svc(&map, 443), Some(8443));
    }

    /// An unparsable h3 token still promotes the authority on its request port.
    #[test]
    fn falls_back_to_request_port() {
        let map = headers(&["h3=\"alt.example:443\"; ma=60"]);
        assert_eq!(parse_alt_svc(&map, 443), Some(443));
    }

    /// Hints for other protocols are ignored entirely.
    #[test]
    fn ignores_non_h3_tokens() {
        let map = headers(&["h2=\":443\"; ma=60", "spdy/3.1=\":443\""]);
        assert_eq!(parse_alt_svc(&map, 443), None);
        assert_eq!(parse_alt_svc(&HeaderMap::new(), 443), None);
    }

    /// Header lines beyond the cap are not examined.
    #[test]
    fn header_line_cap() {
        let mut values = vec!["ma=60"; 8];
        values.push("h3=\":8443\"");
        let map = headers(&values);
        assert_eq!(parse_alt_svc(&map, 443), None);
    }

    /// Tokens beyond the per-line cap are not examined.
    #[test]
    fn token_cap() {
        let mut line = "ma=60; ".repeat(16);
        line.push_str("h3=\":8443\"");
        let map = headers(&[line.as_str()]);
        assert_eq!(parse_alt_svc(&map, 443), None);
    }

    /// Cache stores, overwrites, and reports the negative sentinel.
    #[test]
    fn cache_roundtrip() {
        let cache = AltSvcCache::new();
        assert_eq!(cache.get("example.test:443"), None);
        cache.insert("example.test:443", 8443);
        assert_eq!(cache.get("example.test:443"), Some(8443));
        cache.insert("example.test:443", H3_BROKEN);
        assert_eq!(cache.get("example.test:443"), Some(0));
    }
}
