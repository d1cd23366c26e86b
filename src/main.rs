use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

// Include generated proto code.
pub mod csi {
    #![allow(clippy::all)]
    tonic::include_proto!("csi.v1");
}

mod builders;
mod config;
mod coordinator;
mod descriptor;
mod error;
mod identity;
mod janitor;
mod keyed_lock;
mod materializer;
mod mount;
mod node;
mod resolver;
mod subprocess;
mod uploader;

use config::{Args, Config};
use coordinator::VolumeCoordinator;
use csi::identity_server::IdentityServer;
use csi::node_server::NodeServer;
use identity::IdentityService;
use node::NodeService;
use resolver::ArtifactResolver;
use subprocess::{try_run, Capture};

const PLUGIN_NAME: &str = "nix.csi.store";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Arc::new(Config::from_args(args)?);

    info!(node_id = %config.node_name, endpoint = %config.socket_path.display(), "starting nix-csi-node");

    janitor::sweep(
        Path::new("/proc/stat"),
        &config.csi_root,
        &config.csi_volumes,
        &config.csi_gcroots,
        &config.proc_stat_snapshot(),
    )?;

    let current_system = detect_current_system().await?;
    info!(current_system, "resolved builtins.currentSystem");

    let builders_file = config.csi_root.join("builders");
    let resolver = ArtifactResolver::new(current_system, builders_file, config.pod_ip.clone());
    let coordinator = Arc::new(VolumeCoordinator::new(config.clone(), resolver));

    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let stream = UnixListenerStream::new(listener);

    let identity = IdentityService::new(PLUGIN_NAME.to_string(), env!("CARGO_PKG_VERSION").to_string());
    let node = NodeService::new(config.node_name.clone(), coordinator);

    info!(socket = %config.socket_path.display(), "listening");

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node))
        .serve_with_incoming(stream)
        .await?;

    Ok(())
}

async fn detect_current_system() -> anyhow::Result<String> {
    let args = vec![
        "eval".to_string(),
        "--raw".to_string(),
        "--impure".to_string(),
        "--expr".to_string(),
        "builtins.currentSystem".to_string(),
    ];
    let output = try_run("nix", &args, Capture::Captured).await?;
    Ok(output.stdout.trim().to_string())
}
