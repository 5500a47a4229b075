use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;

use ferry_na::loopback::Fabric;
use ferry_util::Time;

pub(crate) mod client;
pub(crate) mod config;
pub(crate) mod logging;
pub(crate) mod proto;
pub(crate) mod server;

use client::ClientStats;
use config::Config;
use server::Server;

#[derive(Debug, Clone, Parser)]
#[command(name = "Ferry Service")]
struct Opts {
    /// Ferry config path
    #[arg(short, long, default_value = "ferryd.toml")]
    config: PathBuf,
    #[arg(long)]
    no_ansi: bool,
    /// Number of clients, overriding the config file
    #[arg(long)]
    clients: Option<usize>,
}

fn main() -> Result<()> {
    // load config
    let opts = Opts::parse();
    let mut config = Config::from_path(&opts.config)?;
    if let Some(clients) = opts.clients {
        config.server.clients = clients;
    }
    config.validate()?;

    // init log setting from "FERRY_LOG"
    logging::init_log(&config, !opts.no_ansi)?;
    tracing::info!("ferryd starting at {}", ferry_util::time::stamp());

    let fabric = Fabric::new();
    let server = Server::new(Arc::new(fabric.endpoint()), config.context)?;
    let addr = server.addr();
    let clients = config.server.clients;
    let start = Time::now();

    let stats = crossbeam::thread::scope(|s| -> Result<Vec<ClientStats>> {
        let handles: Vec<_> = (0..clients)
            .map(|i| {
                let (fabric, addr, config) = (&fabric, &addr, &config);
                s.spawn(move |_| client::run(fabric, addr, i, config))
            })
            .collect();

        let served = server.serve(
            clients,
            config.server.progress_timeout_ms,
            config.server.rpc_timeout_ms,
        );
        let mut stats = Vec::with_capacity(clients);
        for h in handles {
            let result = h.join().map_err(|_| anyhow!("client thread panicked"))?;
            stats.push(result?);
        }
        served?;
        Ok(stats)
    })
    .map_err(|_| anyhow!("client thread panicked"))??;

    let elapsed = Time::now() - start;
    let bytes: u64 = stats.iter().map(|s| s.uploaded + s.downloaded).sum();
    tracing::info!(
        "{} clients moved {} bytes in {} ({:.2} MB/s)",
        clients,
        bytes,
        elapsed,
        bytes as f64 / elapsed.to_seconds().max(1e-6) / 1e6
    );
    Ok(())
}
