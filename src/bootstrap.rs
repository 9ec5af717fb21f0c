//! Bootstrap resolver for upstream hostnames.
//!
//! Resolving the hostname of an encrypted resolver must not go through the
//! proxy's own DNS listener, so this resolver talks plain DNS (UDP or TCP)
//! straight to a configured set of `IP:port` upstreams, falling back to the
//! operating system resolver as a last resort.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hickory_proto::op::{Edns, Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::{
    MainProto, TransportConfig, MAX_DNS_PACKET_SIZE, RESOLVER_READ_TIMEOUT,
    SYSTEM_RESOLVER_IP_TTL,
};

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub ips: Vec<IpAddr>,
    pub ttl: Duration,
}

#[derive(Clone, Copy)]
enum ListKind {
    Internal,
    Bootstrap,
}

/// Plain-DNS resolver over explicit `IP:port` upstreams.
pub struct BootstrapResolver {
    internal: Mutex<Vec<SocketAddr>>,
    bootstrap: Mutex<Vec<SocketAddr>>,
    main_proto: MainProto,
    no_fallback: bool,
    ignore_system_dns: bool,
    use_ipv4: bool,
    use_ipv6: bool,
    ready: AtomicBool,
}

impl BootstrapResolver {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            internal: Mutex::new(parse_resolver_list(
                &config.internal_resolvers,
                "internal_resolvers",
            )?),
            bootstrap: Mutex::new(parse_resolver_list(
                &config.bootstrap_resolvers,
                "bootstrap_resolvers",
            )?),
            main_proto: config.main_proto,
            no_fallback: config.no_fallback,
            ignore_system_dns: config.ignore_system_dns,
            use_ipv4: config.use_ipv4,
            use_ipv6: config.use_ipv6,
            ready: AtomicBool::new(false),
        })
    }

    /// Flags the proxy's own resolvers as confirmed working; from then on
    /// they are tried before the bootstrap set.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Resolves `host`, walking internal resolvers, bootstrap resolvers and
    /// finally the system resolver, subject to the fallback policy.
    ///
    /// `is_stamp` marks resolver-list fetches, which are allowed to reach the
    /// bootstrap set even under `no_fallback`; without that window the
    /// encrypted transport could never cold-start.
    pub async fn resolve(&self, host: &str, is_stamp: bool) -> Result<Resolved> {
        let protos = self.proto_order();
        let mut last_err = TransportError::Resolution {
            host: host.to_string(),
            reason: "internal resolvers are not usable yet".to_string(),
        };

        if self.is_ready() {
            for proto in protos {
                match self.resolve_using_servers(proto, host, ListKind::Internal).await {
                    Ok(resolved) => {
                        debug!("[{host}] resolved via internal resolvers over {proto:?}");
                        return Ok(resolved);
                    }
                    Err(err) => last_err = err,
                }
            }
        } else {
            debug!("[{host}] internal resolvers are not usable yet");
        }

        if !self.no_fallback || is_stamp {
            if self.bootstrap.lock().is_empty() {
                warn!("bootstrap resolver list is empty");
                last_err = TransportError::Resolution {
                    host: host.to_string(),
                    reason: "bootstrap resolver list is empty".to_string(),
                };
            } else {
                for proto in protos {
                    info!("resolving server host [{host}] using bootstrap resolvers over {proto:?}");
                    match self.resolve_using_servers(proto, host, ListKind::Bootstrap).await {
                        Ok(resolved) => return Ok(resolved),
                        Err(err) => last_err = err,
                    }
                }
            }
        }

        if !self.no_fallback && !self.ignore_system_dns {
            info!("bootstrap resolvers did not respond, trying the system resolver as a last resort");
            match self.resolve_using_system(host).await {
                Ok(resolved) => return Ok(resolved),
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }

    fn proto_order(&self) -> [MainProto; 2] {
        match self.main_proto {
            MainProto::Udp => [MainProto::Udp, MainProto::Tcp],
            MainProto::Tcp => [MainProto::Tcp, MainProto::Udp],
        }
    }

    async fn resolve_using_servers(
        &self,
        proto: MainProto,
        host: &str,
        kind: ListKind,
    ) -> Result<Resolved> {
        let servers = match kind {
            ListKind::Internal => self.internal.lock().clone(),
            ListKind::Bootstrap => self.bootstrap.lock().clone(),
        };
        if servers.is_empty() {
            return Err(TransportError::Resolution {
                host: host.to_string(),
                reason: "empty resolver list".to_string(),
            });
        }
        let mut last_err = TransportError::Resolution {
            host: host.to_string(),
            reason: "no resolver answered".to_string(),
        };
        for (index, server) in servers.iter().enumerate() {
            match self.resolve_using_resolver(proto, host, *server).await {
                Ok(resolved) if !resolved.ips.is_empty() => {
                    info!("resolution of [{host}] succeeded with resolver {server} over {proto:?}");
                    if index > 0 {
                        self.promote(kind, *server);
                    }
                    return Ok(resolved);
                }
                Ok(_) => {
                    debug!("[{host}] resolver {server} returned no address records");
                    last_err = TransportError::Resolution {
                        host: host.to_string(),
                        reason: format!("no address records from {server}"),
                    };
                }
                Err(err) => {
                    debug!("unable to resolve [{host}] using resolver [{server}] ({proto:?}): {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Moves a resolver that just answered to the front of its list, so
    /// subsequent resolutions try the working resolver first.
    fn promote(&self, kind: ListKind, server: SocketAddr) {
        let mut servers = match kind {
            ListKind::Internal => self.internal.lock(),
            ListKind::Bootstrap => self.bootstrap.lock(),
        };
        if let Some(position) = servers.iter().position(|s| *s == server) {
            servers.swap(0, position);
        }
    }

    async fn resolve_using_resolver(
        &self,
        proto: MainProto,
        host: &str,
        server: SocketAddr,
    ) -> Result<Resolved> {
        let mut query_types = Vec::with_capacity(2);
        if self.use_ipv4 {
            query_types.push(RecordType::A);
        }
        if self.use_ipv6 {
            query_types.push(RecordType::AAAA);
        }

        let mut ips = Vec::new();
        let mut rr_ttl = 0u32;
        let mut last_err = None;
        for query_type in query_types {
            let (id, query) = build_query(host, query_type)?;
            let answer = match proto {
                MainProto::Udp => exchange_udp(&query, server).await,
                MainProto::Tcp => exchange_tcp(&query, server).await,
            };
            let buf = match answer {
                Ok(buf) => buf,
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            };
            let response = match Message::from_vec(&buf) {
                Ok(response) => response,
                Err(err) => {
                    last_err = Some(TransportError::Dns(format!(
                        "invalid response from {server}: {err}"
                    )));
                    continue;
                }
            };
            if response.id() != id {
                last_err = Some(TransportError::Dns(format!(
                    "mismatched response id from {server}"
                )));
                continue;
            }
            last_err = None;
            for record in response.answers() {
                if record.record_type() != query_type {
                    continue;
                }
                match record.data() {
                    Some(RData::A(a)) => ips.push(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => ips.push(IpAddr::V6(aaaa.0)),
                    _ => continue,
                }
                rr_ttl = record.ttl();
            }
        }

        // The last query type's status decides: a failed AAAA query spoils
        // the resolver even when the A query answered, and the ladder moves
        // on rather than accept the partial set.
        if let Some(err) = last_err {
            return Err(err);
        }
        Ok(Resolved {
            ips,
            ttl: Duration::from_secs(u64::from(rr_ttl)),
        })
    }

    async fn resolve_using_system(&self, host: &str) -> Result<Resolved> {
        if self.ignore_system_dns {
            warn!("[{host}] system resolver is disabled but was reached");
            return Err(TransportError::Resolution {
                host: host.to_string(),
                reason: "system resolver is disabled".to_string(),
            });
        }
        let addrs = lookup_host((host, 0u16))
            .await
            .map_err(|err| TransportError::Resolution {
                host: host.to_string(),
                reason: format!("system resolver: {err}"),
            })?;
        let ips: Vec<IpAddr> = addrs
            .map(|addr| addr.ip())
            .filter(|ip| (self.use_ipv4 && ip.is_ipv4()) || (self.use_ipv6 && ip.is_ipv6()))
            .collect();
        if ips.is_empty() {
            return Err(TransportError::Resolution {
                host: host.to_string(),
                reason: "system resolver returned no usable addresses".to_string(),
            });
        }
        Ok(Resolved {
            ips,
            ttl: SYSTEM_RESOLVER_IP_TTL,
        })
    }
}

fn parse_resolver_list(list: &[String], what: &str) -> Result<Vec<SocketAddr>> {
    list.iter()
        .map(|entry| {
            entry.parse::<SocketAddr>().map_err(|_| {
                TransportError::Config(format!("{what}: [{entry}] is not an IP:port"))
            })
        })
        .collect()
}

/// Builds a recursion-desired query with an EDNS0 OPT RR advertising the
/// maximum DNS packet size. Returns the message id for response matching.
fn build_query(host: &str, query_type: RecordType) -> Result<(u16, Vec<u8>)> {
    let fqdn = if host.ends_with('.') {
        host.to_string()
    } else {
        format!("{host}.")
    };
    let name = Name::from_str(&fqdn)
        .map_err(|err| TransportError::Dns(format!("invalid host name [{host}]: {err}")))?;

    let id = rand::random::<u16>();
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, query_type));

    let mut edns = Edns::new();
    edns.set_version(0);
    edns.set_max_payload(MAX_DNS_PACKET_SIZE as u16);
    edns.set_dnssec_ok(true);
    *message.extensions_mut() = Some(edns);

    let bytes = message
        .to_vec()
        .map_err(|err| TransportError::Dns(format!("unable to encode query: {err}")))?;
    Ok((id, bytes))
}

async fn exchange_udp(query: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
    timeout(RESOLVER_READ_TIMEOUT, async {
        let bind = if server.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let read = socket.recv(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}

async fn exchange_tcp(query: &[u8], server: SocketAddr) -> Result<Vec<u8>> {
    timeout(RESOLVER_READ_TIMEOUT, async {
        let mut stream = TcpStream::connect(server).await?;
        let len = (query.len() as u16).to_be_bytes();
        stream.write_all(&len).await?;
        stream.write_all(query).await?;
        stream.flush().await?;

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await?;
        let expected = usize::from(u16::from_be_bytes(len));
        let mut buf = vec![0u8; expected];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| TransportError::Timeout)?
}
