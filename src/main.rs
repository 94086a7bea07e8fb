use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dse::{config::DseConfig, launcher, logging::init_logging};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dse-node")]
#[command(about = "Distributed services engine node", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "DSE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `node_id` from the configuration file
    #[arg(short, long, env = "DSE_NODE_ID")]
    node_id: Option<String>,

    /// Overrides `logging.level`; `RUST_LOG` still wins
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<DseConfig> {
        let mut config = match &self.config {
            Some(path) => DseConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => {
                let node_id = self
                    .node_id
                    .clone()
                    .context("--node-id is required without a configuration file")?;
                DseConfig::new(node_id)
            }
        };
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    let _log_guard = init_logging(&config.logging).context("initialising logging")?;

    let handle = launcher::launch(config).await?;
    info!("Press Ctrl+C to shut down");

    signal::ctrl_c().await?;
    info!("Shutting down node {}", handle.node.node_id());
    if let Err(e) = handle.shutdown().await {
        error!("Shutdown finished with errors: {}", e);
    }
    Ok(())
}
