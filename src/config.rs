use std::path::PathBuf;

use clap::Parser;

/// CLI flags layered under the environment variables the orchestrator
/// injects into the plugin container. Parsed once in `main` and handed
/// down as an `Arc<Config>`.
#[derive(Parser, Debug)]
#[command(author, version, about = "CSI node plugin for content-addressed closures", long_about = None)]
pub struct Args {
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    #[arg(long, env = "NIX_CSI_ROOT", default_value = "/nix/var/nix-csi")]
    pub csi_root: PathBuf,

    #[arg(long, env = "NIX_CSI_GCROOTS", default_value = "/nix/var/nix/gcroots/nix-csi")]
    pub gcroots_root: PathBuf,
}

/// Fully resolved runtime configuration: CLI flags plus the environment
/// variables the orchestrator is documented to inject. Built once at
/// startup so every later read is infallible.
#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub csi_root: PathBuf,
    pub csi_volumes: PathBuf,
    pub csi_gcroots: PathBuf,
    pub node_name: String,
    pub namespace: String,
    pub pod_ip: String,
    pub build_cache_enabled: bool,
}

impl Config {
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let socket_path = args
            .endpoint
            .strip_prefix("unix://")
            .unwrap_or(&args.endpoint)
            .into();

        let node_name = std::env::var("KUBE_NODE_NAME")
            .map_err(|_| anyhow::anyhow!("KUBE_NODE_NAME must be set by the orchestrator"))?;
        let namespace = std::env::var("KUBE_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let pod_ip = std::env::var("KUBE_POD_IP").unwrap_or_default();
        let build_cache_enabled = std::env::var("BUILD_CACHE")
            .map(|v| v == "true")
            .unwrap_or(false);

        let csi_volumes = args.csi_root.join("volumes");

        Ok(Self {
            socket_path,
            csi_volumes,
            csi_root: args.csi_root,
            csi_gcroots: args.gcroots_root,
            node_name,
            namespace,
            pod_ip,
            build_cache_enabled,
        })
    }

    pub fn volume_root(&self, volume_id: &str) -> PathBuf {
        self.csi_volumes.join(volume_id)
    }

    pub fn gcroot_path(&self, volume_id: &str) -> PathBuf {
        self.csi_gcroots.join(volume_id)
    }

    pub fn proc_stat_snapshot(&self) -> PathBuf {
        self.csi_root.join("proc_stat")
    }
}
