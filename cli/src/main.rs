//! `emberd`: the Ember node binary.
//!
//! Wires the blockchain processor to configuration and logging,
//! bootstraps genesis, starts the download loop, and optionally forges
//! with a supplied secret phrase. Peer transport is pluggable; the
//! stock binary starts isolated and relies on the embedding deployment
//! to provide connectivity.

use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use clap::Parser;
use ember_config::Config;
use ember_core::prelude::*;
use ember_core::processor::GenerationError;
use ember_data_model::{block::Block, constants::epoch_time};
use ember_logger::prelude::*;
use eyre::WrapErr;

#[derive(Debug, Parser)]
#[command(name = "emberd", about = "Ember proof-of-stake cryptocurrency node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rescan the whole chain at startup.
    #[arg(long)]
    force_scan: bool,

    /// Re-validate every block during the startup scan.
    #[arg(long)]
    force_validate: bool,

    /// Forge blocks with this secret phrase.
    #[arg(long, value_name = "SECRET_PHRASE")]
    forge: Option<String>,
}

/// A peer set with nobody in it. Deployments replace this with a real
/// transport.
struct IsolatedNetwork;

impl PeerNetwork for IsolatedNetwork {
    fn connected_peers(&self) -> Vec<Arc<dyn Peer>> {
        Vec::new()
    }

    fn broadcast_block(&self, _block: &Block) {}
}

fn main() -> eyre::Result<()> {
    ember_logger::init();
    let args = Args::parse();

    let mut config =
        Config::load(args.config.as_deref()).wrap_err("configuration is unusable")?;
    if args.force_validate {
        config.force_validate = true;
    }
    info!(network = %config.network, "starting emberd");

    let processor = BlockchainProcessor::new(&config)
        .map_err(|error| eyre::eyre!("embedded genesis is invalid: {error}"))?;
    processor
        .init(args.force_scan || config.force_scan)
        .map_err(|error| eyre::eyre!("node initialization failed: {error}"))?;

    let head = processor
        .db()
        .last_block()
        .expect("chain is bootstrapped after init");
    info!(height = head.height(), id = %head.id(), "blockchain ready");

    if config.peers.is_empty() {
        warn!("no peers configured, running isolated");
    }
    let network: Arc<dyn PeerNetwork> = Arc::new(IsolatedNetwork);
    processor.set_peer_network(Arc::clone(&network));
    let _downloader = Downloader::start(Arc::clone(&processor), network);

    match args.forge {
        Some(secret_phrase) => forge_loop(&processor, &secret_phrase),
        None => loop {
            thread::park();
        },
    }
}

/// Try to forge a block every ten seconds. Losing the stake lottery is
/// routine and only logged at debug level.
fn forge_loop(processor: &Arc<BlockchainProcessor>, secret_phrase: &str) -> ! {
    info!("forging enabled");
    loop {
        thread::sleep(Duration::from_secs(10));
        match processor.generate_block(secret_phrase, epoch_time()) {
            Ok(()) => {}
            Err(GenerationError::Push(error)) => debug!(%error, "not our turn to forge"),
            Err(error) => warn!(%error, "block generation failed"),
        }
    }
}
