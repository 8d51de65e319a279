use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use swarmshare::{ActivityLog, Coordinator, PeerConfig, PeerId, ACTIVITY_TARGET};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(name = "peer_process", about = "Run one peer of a file-sharing swarm", version)]
struct Cli {
    /// Roster id of this peer, e.g. 1001
    peer_id: String,

    #[arg(long, value_name = "DIR", env = "SWARMSHARE_CONFIG_DIR", default_value = ".", help = "Directory holding Common.cfg and PeerInfo.cfg")]
    config_dir: PathBuf,

    #[arg(long, value_name = "DIR", env = "SWARMSHARE_WORK_DIR", default_value = ".", help = "Directory containing the peer_<id> file directories")]
    work_dir: PathBuf,

    #[arg(long, value_name = "DIR", env = "SWARMSHARE_LOG_DIR", default_value = ".", help = "Directory for log_peer_<id>.log")]
    log_dir: PathBuf,

    #[arg(long, value_name = "FILTER", env = "SWARMSHARE_LOG", default_value = "info", help = "Diagnostic log filter for stderr")]
    log_level: String,
}

fn init_tracing(cli: &Cli, peer: &PeerId) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&cli.log_dir)?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(cli.log_dir.join(format!("log_peer_{peer}.log")))?;

    let activity = fmt::layer()
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_filter(Targets::new().with_target(ACTIVITY_TARGET, Level::INFO));

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let diagnostics = fmt::layer().with_writer(std::io::stderr).with_filter(filter);

    tracing_subscriber::registry().with(diagnostics).with(activity).try_init()?;
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let peer_id = PeerId::new(cli.peer_id.clone());
    init_tracing(&cli, &peer_id)?;

    let config = PeerConfig::load(peer_id.clone(), &cli.config_dir, &cli.work_dir)?;
    info!(peer = %peer_id, file = %config.file_path().display(), "configuration loaded");
    let coordinator = Coordinator::start(config, ActivityLog::new(peer_id)).await?;

    tokio::select! {
        _ = coordinator.wait_finished() => info!("swarm complete, exiting"),
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("interrupted, shutting down");
            coordinator.shutdown().await;
            coordinator.wait_finished().await;
        }
    }
    Ok(())
}
