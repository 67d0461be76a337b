use anyhow::{Context, Result};
use clap::Parser;
use color_print::cformat;
use ra_mutex::{log, poisson::Poisson, Node, NodeConfig, RATE};
use std::path::PathBuf;

/// Peer that competes with its group for a shared critical section.
#[derive(Parser, Debug)]
#[command(name = "ra-mutex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; flags given on the command line override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:5001.
    #[arg(short, long)]
    listen: Option<String>,

    /// Comma-separated peer addresses.
    #[arg(short, long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Critical-section requests per second.
    #[arg(long, default_value_t = RATE)]
    rate: f64,

    /// Stop after this many rounds (runs forever when absent).
    #[arg(long)]
    rounds: Option<u64>,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => NodeConfig::new(
                self.listen.clone().context("--listen or --config is required")?,
                Vec::new(),
            ),
        };

        if let Some(listen) = &self.listen {
            config.listen_address = listen.clone();
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    log::init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.rate > 0., "--rate must be positive");
    let config = cli.node_config()?;

    let node = Node::start(config).await?;
    node.wait_for_peers(node.coordinator().registry().total()).await;

    let coordinator = node.coordinator();
    let mut think = Poisson::new(cli.rate, cli.seed);
    let mut work = Poisson::new(cli.rate * 4., cli.seed.wrapping_add(1));
    let mut round = 0u64;

    while cli.rounds.map_or(true, |rounds| round < rounds) {
        tokio::time::sleep(think.next_delay()).await;

        let section = coordinator.lock().await?;
        log::info(&cformat!(
            "<yellow, bold>Holding</yellow, bold> the critical section (round {round})."
        ));
        tokio::time::sleep(work.next_delay()).await;
        section.release().await?;

        round += 1;
    }

    Ok(())
}
