use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use hostgate::{
    adapters::{upstream::https_client, CertificateGate},
    config::{mapping, RunConfig},
    core::RoutingTable,
    server, tracing_setup,
    utils::BufferPool,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "TLS-terminating reverse proxy with automatic Let's Encrypt certificates"
)]
struct Args {
    /// Address of the TLS listener
    #[arg(long, default_value = "0.0.0.0:443")]
    addr: SocketAddr,

    /// Address of the plain-HTTP redirect listener; empty to disable
    #[arg(long = "http", default_value = "0.0.0.0:80")]
    http_addr: String,

    /// Path to the hostname/backend mapping file
    #[arg(long = "map", default_value = "mapping.txt")]
    map: PathBuf,

    /// Directory for cached certificates and ACME account keys
    #[arg(long, default_value = "/var/cache/letsencrypt")]
    cache_dir: PathBuf,

    /// Contact email registered with the ACME account
    #[arg(long)]
    email: Option<String>,

    /// Add Strict-Transport-Security to every HTTPS response
    #[arg(long)]
    hsts: bool,

    /// Maximum duration for reading a request; 0s disables
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    rto: Duration,

    /// Maximum duration for writing a response; 0s disables
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    wto: Duration,

    /// Drop connections idle longer than this; requires --rto 0s --wto 0s
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    idle: Duration,

    /// Use the Let's Encrypt staging directory instead of production
    #[arg(long)]
    staging: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (duration > Duration::ZERO).then_some(duration)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    tracing_setup::init_tracing(args.json_logs);

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if rustls::crypto::CryptoProvider::install_default(provider).is_err() {
        tracing::warn!("a rustls crypto provider was already installed");
    }

    let cfg = RunConfig {
        https_addr: args.addr,
        http_addr: if args.http_addr.is_empty() {
            None
        } else {
            Some(
                args.http_addr
                    .parse()
                    .wrap_err("invalid --http listen address")?,
            )
        },
        mapping: args.map,
        cache_dir: args.cache_dir,
        email: args.email,
        hsts: args.hsts,
        read_timeout: non_zero(args.rto),
        write_timeout: non_zero(args.wto),
        idle_timeout: non_zero(args.idle),
        production: !args.staging,
    };
    cfg.validate()?;

    let mapping = mapping::load(&cfg.mapping)?;
    let table = RoutingTable::build(&mapping, &https_client(), &BufferPool::default())?;
    let gate = CertificateGate::new(
        table.hostnames(),
        &cfg.cache_dir,
        cfg.email.as_deref(),
        cfg.production,
    )?;

    server::run(cfg, table, gate).await
}
