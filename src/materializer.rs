//! Populates a per-volume sub-store from a resolved artifact path:
//! closure query, host garbage root, hard-link farm, sub-store
//! database, and the in-sub-store garbage roots. Every step is fatal
//! on failure and triggers rollback of everything materialized so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use moka::future::Cache;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::subprocess::{try_run, Capture};

const CLOSURE_TTL: Duration = Duration::from_secs(60);

/// Computes and caches transitive closures, and owns the global
/// semaphore that serializes the hard-link copy step (the linking
/// tool does not tolerate concurrent invocations over overlapping
/// trees).
pub struct ClosureMaterializer {
    closures: Cache<PathBuf, Arc<Vec<String>>>,
    link_semaphore: Arc<Semaphore>,
}

impl ClosureMaterializer {
    pub fn new() -> Self {
        Self {
            closures: Cache::builder().time_to_live(CLOSURE_TTL).build(),
            link_semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    async fn closure_of(&self, artifact_path: &Path) -> Result<Arc<Vec<String>>> {
        if let Some(cached) = self.closures.get(&artifact_path.to_path_buf()).await {
            return Ok(cached);
        }

        let output = try_run(
            "nix",
            &["path-info".to_string(), "--recursive".to_string(), artifact_path.display().to_string()],
            Capture::Captured,
        )
        .await?;

        let paths: Vec<String> = output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
        let paths = Arc::new(paths);
        self.closures.insert(artifact_path.to_path_buf(), paths.clone()).await;
        Ok(paths)
    }

    /// Builds the sub-store rooted at `volume_root` for `artifact_path`,
    /// pinning it at `gcroot_path` on the host store. On any failure,
    /// rolls back the host garbage root and the sub-store directory
    /// before returning the error.
    pub async fn materialize(&self, artifact_path: &Path, volume_root: &Path, gcroot_path: &Path) -> Result<()> {
        match self.materialize_inner(artifact_path, volume_root, gcroot_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.rollback(volume_root, gcroot_path).await;
                Err(err)
            }
        }
    }

    async fn materialize_inner(&self, artifact_path: &Path, volume_root: &Path, gcroot_path: &Path) -> Result<()> {
        let closure = self.closure_of(artifact_path).await?;

        try_run(
            "nix",
            &[
                "build".to_string(),
                "--out-link".to_string(),
                gcroot_path.display().to_string(),
                artifact_path.display().to_string(),
            ],
            Capture::Captured,
        )
        .await?;

        let store_root = volume_root.join("nix/store");
        {
            let _permit = self
                .link_semaphore
                .acquire()
                .await
                .expect("link semaphore is never closed");

            let mut rsync_args = vec![
                "--one-file-system".to_string(),
                "--recursive".to_string(),
                "--links".to_string(),
                "--hard-links".to_string(),
                "--mkpath".to_string(),
            ];
            rsync_args.extend(closure.iter().cloned());
            rsync_args.push(store_root.display().to_string());

            try_run("rsync", &rsync_args, Capture::Captured).await?;
        }

        let state_dir = volume_root.join("nix/var/nix");
        std::fs::create_dir_all(&state_dir).context("failed to create sub-store state directory")?;

        let mut init_db_args = vec![state_dir.display().to_string()];
        init_db_args.extend(closure.iter().cloned());
        try_run("nix_init_db", &init_db_args, Capture::Captured).await?;

        let in_store_gcroot = state_dir.join("gcroots/result");
        try_run(
            "nix",
            &[
                "build".to_string(),
                "--store".to_string(),
                volume_root.display().to_string(),
                "--out-link".to_string(),
                in_store_gcroot.display().to_string(),
                artifact_path.display().to_string(),
            ],
            Capture::Captured,
        )
        .await?;

        let result_link = volume_root.join("nix/var/result");
        try_run(
            "nix",
            &[
                "build".to_string(),
                "--store".to_string(),
                volume_root.display().to_string(),
                "--out-link".to_string(),
                result_link.display().to_string(),
                artifact_path.display().to_string(),
            ],
            Capture::Captured,
        )
        .await?;

        info!(artifact = %artifact_path.display(), closure_size = closure.len(), "materialized sub-store");
        Ok(())
    }

    /// Removes the host garbage root and recursively deletes the
    /// sub-store. Exposed so the coordinator can reuse it when a
    /// later step (the mount) fails after materialization succeeded.
    pub async fn rollback(&self, volume_root: &Path, gcroot_path: &Path) {
        if let Err(err) = std::fs::remove_file(gcroot_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %gcroot_path.display(), error = %err, "failed to remove host garbage root during rollback");
            }
        }
        if let Err(err) = std::fs::remove_dir_all(volume_root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %volume_root.display(), error = %err, "failed to remove sub-store during rollback");
            }
        }
    }
}

impl Default for ClosureMaterializer {
    fn default() -> Self {
        Self::new()
    }
}
