//! Node binary

use clap::Parser;
use dpasswd::{Config, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dpasswd-node")]
#[command(about = "dpasswd storage node with Raft consensus")]
#[command(version)]
struct Cli {
    /// TOML config file (DPASSWD_* environment variables apply on top)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node ID
    #[arg(long)]
    id: Option<String>,

    /// Bind address for HTTP
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Bind address for Raft peer traffic
    #[arg(long)]
    raft_addr: Option<SocketAddr>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Start a new cluster with this node as its only voter
    #[arg(long)]
    bootstrap: bool,

    /// Seed the store from a snapshot image before serving
    #[arg(long)]
    restore: Option<PathBuf>,
}

impl Cli {
    /// Flags given on the command line win over file and environment.
    fn merge_into(&self, config: &mut Config) {
        if let Some(id) = &self.id {
            config.node_id = id.clone();
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(addr) = self.raft_addr {
            config.raft_addr = addr;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.bootstrap {
            config.bootstrap = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    cli.merge_into(&mut config);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut node = Node::new(config);
    if let Some(path) = cli.restore {
        node = node.restore_from(path);
    }
    node.serve().await?;

    Ok(())
}
