// Exchange server - signalling and per-call UDP relays

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use intercom::config::ServerConfig;
use intercom::exchange::Exchange;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Voice intercom exchange server")]
struct Args {
    /// Path to the server configuration file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("usage: server -f <config-file>");
            std::process::exit(2);
        }
    };

    info!("initialising exchange");
    let mut exchange = Exchange::bind(&config)?;
    info!("exchange started");
    exchange.run()
}
