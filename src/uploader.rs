//! Best-effort fan-out of a newly realized closure to a remote cache.
//! Scheduled by the coordinator only after a successful reply to the
//! orchestrator, and only when `BUILD_CACHE=true`. Failures here must
//! never propagate back to the RPC caller — this module only logs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::keyed_lock::KeyedLocks;
use crate::subprocess::{try_run, Capture};

const REMOTE_CACHE: &str = "ssh-ng://nix@nix-cache";
const MAX_ATTEMPTS: u32 = 6;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

pub struct Uploader {
    path_locks: KeyedLocks<String>,
}

impl Uploader {
    pub fn new() -> Self {
        Self {
            path_locks: KeyedLocks::new(),
        }
    }

    /// Spawns the upload as a detached task. Never returns an error —
    /// `coordinator` calls this after it has already replied to the
    /// caller, so there is nobody left to hand a failure to.
    pub fn schedule(self: Arc<Self>, artifact_path: String) {
        tokio::spawn(async move {
            self.upload(&artifact_path).await;
        });
    }

    async fn upload(&self, artifact_path: &str) {
        let lock = self.path_locks.get(&artifact_path.to_string());
        let _guard = lock.lock_owned().await;

        let paths = match self.closure_outputs(artifact_path).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(artifact = artifact_path, error = %err, "failed to enumerate closure for cache upload");
                return;
            }
        };
        if paths.is_empty() {
            return;
        }

        for attempt in 1..=MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_BACKOFF).await;

            let mut args = vec!["copy".to_string(), "--to".to_string(), REMOTE_CACHE.to_string()];
            args.extend(paths.iter().cloned());

            match try_run("nix", &args, Capture::Captured).await {
                Ok(_) => {
                    info!(artifact = artifact_path, attempt, "uploaded closure to remote cache");
                    return;
                }
                Err(err) => {
                    warn!(artifact = artifact_path, attempt, error = %err, "cache upload attempt failed");
                }
            }

            tokio::time::sleep(RETRY_BACKOFF).await;
        }

        warn!(artifact = artifact_path, attempts = MAX_ATTEMPTS, "giving up on cache upload");
    }

    async fn closure_outputs(&self, artifact_path: &str) -> anyhow::Result<Vec<String>> {
        let output = try_run(
            "nix",
            &[
                "path-info".to_string(),
                "--recursive".to_string(),
                "--derivation".to_string(),
                artifact_path.to_string(),
            ],
            Capture::Captured,
        )
        .await?;

        let mut paths: Vec<String> = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        if !paths.iter().any(|p| p == artifact_path) {
            paths.push(artifact_path.to_string());
        }
        paths.sort();
        paths.dedup();
        paths.retain(|p| !p.ends_with(".drv"));
        Ok(paths)
    }
}

impl Default for Uploader {
    fn default() -> Self {
        Self::new()
    }
}
