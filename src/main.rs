//! One-shot DoH query through the transport, for manual testing.
//!
//! Usage: `doh-transport [--get] [--http3] [--bootstrap IP:port] [--name example.com] [url]`

use std::str::FromStr;
use std::time::Duration;

use doh_transport::{DohTransport, TransportConfig};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("doh_transport=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let use_get = args.iter().any(|a| a == "--get");
    let http3 = args.iter().any(|a| a == "--http3");
    let name = flag_value(&args, "--name").unwrap_or_else(|| "example.com".to_string());
    let bootstrap = flag_value(&args, "--bootstrap");
    let url = args
        .iter()
        .skip(1)
        .find(|a| a.starts_with("https://"))
        .cloned()
        .unwrap_or_else(|| "https://dns.quad9.net/dns-query".to_string());

    let mut config = TransportConfig {
        http3,
        ..TransportConfig::default()
    };
    if let Some(bootstrap) = bootstrap {
        config.bootstrap_resolvers = vec![bootstrap];
    }

    info!("querying {name} via {url}");
    let transport = DohTransport::new(config)?;

    let mut query = Message::new();
    // A zero id lets the response be cached by intermediaries.
    query.set_id(0);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_str(&format!("{name}."))?, RecordType::A));
    let body = query.to_vec()?;

    let url = url.parse()?;
    let response = transport
        .doh_query(use_get, &url, &body, Some(Duration::from_secs(10)))
        .await?;

    info!(
        "status {} over {:?} in {:?}",
        response.status, response.tls.version, response.rtt
    );
    let message = Message::from_vec(&response.body)?;
    for record in message.answers() {
        println!("{record}");
    }
    Ok(())
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
