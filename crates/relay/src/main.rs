use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use podlink_relay::{serve, RelayConfig, Result};
use podlink_transport::quic_config;

#[derive(Parser, Debug)]
#[command(name = "podlink-relay", about = "Tunnel relay for podlink")]
struct Args {
    /// UDP address to accept tunnels on.
    #[arg(long, default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// Host that forwarded ports are dialled on.
    #[arg(long, default_value = "127.0.0.1")]
    target_host: String,

    /// How long a data stream waits for its error stream, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pair_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    // stdout carries the startup banner only; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quinn=warn,rustls=warn")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!("relay exited with error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cert = quic_config::generate_self_signed_cert()?;
    let fingerprint = quic_config::fingerprint_hex(&cert.fingerprint);
    let server_config = quic_config::build_server_config(cert.cert_der, cert.key_der)?;
    let endpoint = quinn::Endpoint::server(server_config, args.listen)?;
    let local_addr = endpoint.local_addr()?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "RELAY_READY")?;
        writeln!(stdout, "LISTEN={local_addr}")?;
        writeln!(stdout, "FINGERPRINT={fingerprint}")?;
        stdout.flush()?;
    }

    info!(%local_addr, target_host = %args.target_host, "relay ready");

    let config = Arc::new(RelayConfig {
        target_host: args.target_host,
        pair_timeout: Duration::from_millis(args.pair_timeout_ms),
    });

    tokio::select! {
        () = serve(endpoint.clone(), config) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received Ctrl-C, closing tunnels");
            endpoint.close(0u32.into(), b"relay shutdown");
        }
    }
    endpoint.wait_idle().await;
    Ok(())
}
