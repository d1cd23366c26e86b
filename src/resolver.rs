//! Turns a volume's content key into a concrete, locally present
//! content-address path, fetching or building as needed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use futures::future::join_all;
use moka::future::Cache;
use tracing::Level;

use crate::builders;
use crate::descriptor::ContentKey;
use crate::error::{NixCsiError, NixCsiResult};
use crate::keyed_lock::KeyedLocks;
use crate::subprocess::{run, try_run, Capture};

const REMOTE_CACHE_STORE: &str = "ssh-ng://nix@nix-cache";
const REMOTE_CACHE_SUBSTITUTER: &str = "ssh-ng://nix@nix-cache?trusted=1&priority=20";
const RESOLVED_PATH_TTL: Duration = Duration::from_secs(60);

/// Turns descriptor content keys into store paths guaranteed to exist
/// locally by the time resolution succeeds. Holds the short-TTL
/// resolved-path cache and the per-content-key serialization lock.
pub struct ArtifactResolver {
    current_system: String,
    builders_file: PathBuf,
    pod_ip: String,
    resolved_paths: Cache<String, PathBuf>,
    content_locks: KeyedLocks<String>,
}

impl ArtifactResolver {
    pub fn new(current_system: String, builders_file: PathBuf, pod_ip: String) -> Self {
        Self {
            current_system,
            builders_file,
            pod_ip,
            resolved_paths: Cache::builder().time_to_live(RESOLVED_PATH_TTL).build(),
            content_locks: KeyedLocks::new(),
        }
    }

    pub fn current_system(&self) -> &str {
        &self.current_system
    }

    /// Resolves `content` to a store path, writing the host garbage
    /// root at `gcroot_path` along the way for content keys that
    /// require a build. Never returns a path that does not exist.
    pub async fn resolve(&self, content: &ContentKey, gcroot_path: &Path) -> NixCsiResult<PathBuf> {
        let path = match content {
            ContentKey::StorePath(store_path) => self.resolve_store_path(store_path, gcroot_path).await?,
            ContentKey::FlakeRef(flake_ref) => self.resolve_flake_ref(flake_ref, gcroot_path).await?,
            ContentKey::NixExpr(expression) => self.resolve_nix_expr(expression, gcroot_path).await?,
        };

        if !path.exists() {
            return Err(NixCsiError::bad_request(format!(
                "resolution completed but {} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn cached_existing(&self, key: &str) -> Option<PathBuf> {
        let cached = self.resolved_paths.get(key).await?;
        cached.exists().then_some(cached)
    }

    async fn remote_cache_substituter(&self) -> Option<String> {
        let reachable = try_run(
            "nix",
            &["store".to_string(), "ping".to_string(), "--store".to_string(), REMOTE_CACHE_STORE.to_string()],
            Capture::Captured,
        )
        .await
        .map(|out| out.success())
        .unwrap_or(false);

        reachable.then(|| REMOTE_CACHE_SUBSTITUTER.to_string())
    }

    async fn resolve_store_path(&self, store_path: &str, gcroot_path: &Path) -> NixCsiResult<PathBuf> {
        if let Some(cached) = self.cached_existing(store_path).await {
            return Ok(cached);
        }

        let path = PathBuf::from(store_path);
        if path.exists() {
            self.resolved_paths.insert(store_path.to_string(), path.clone()).await;
            return Ok(path);
        }

        let mut args = vec!["build".to_string()];
        if let Some(substituter) = self.remote_cache_substituter().await {
            args.extend(["--extra-substituters".to_string(), substituter]);
        }
        args.extend(["--out-link".to_string(), gcroot_path.display().to_string(), store_path.to_string()]);

        try_run("nix", &args, Capture::Console(Level::DEBUG))
            .await
            .map_err(|err| NixCsiError::bad_request(err.to_string()))?;

        if path.exists() {
            self.resolved_paths.insert(store_path.to_string(), path.clone()).await;
        }
        Ok(path)
    }

    async fn resolve_flake_ref(&self, flake_ref: &str, gcroot_path: &Path) -> NixCsiResult<PathBuf> {
        if let Some(cached) = self.cached_existing(flake_ref).await {
            return Ok(cached);
        }

        let args = vec![
            "build".to_string(),
            "--print-out-paths".to_string(),
            "--out-link".to_string(),
            gcroot_path.display().to_string(),
            flake_ref.to_string(),
        ];
        let output = try_run("nix", &args, Capture::Console(Level::DEBUG))
            .await
            .map_err(|err| NixCsiError::bad_request(err.to_string()))?;

        let resolved = first_output_path(&output.stdout)?;
        self.resolved_paths.insert(flake_ref.to_string(), resolved.clone()).await;
        Ok(resolved)
    }

    async fn resolve_nix_expr(&self, expression: &str, gcroot_path: &Path) -> NixCsiResult<PathBuf> {
        let lock = self.content_locks.get(&expression.to_string());
        let _guard = lock.lock_owned().await;
        self.resolve_nix_expr_locked(expression, gcroot_path).await
    }

    async fn resolve_nix_expr_locked(&self, expression: &str, gcroot_path: &Path) -> NixCsiResult<PathBuf> {
        let expr_file = tempfile::NamedTempFile::new()
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(expression.as_bytes())?;
                Ok(f)
            })
            .context("failed to write expression to a temporary file")
            .map_err(NixCsiError::Internal)?;
        let expr_path = expr_file.path().to_path_buf();

        let mut path = match self.cached_existing(expression).await {
            Some(cached) => cached,
            None => {
                let eval_args = vec![
                    "eval".to_string(),
                    "--raw".to_string(),
                    "--impure".to_string(),
                    "--expr".to_string(),
                    format!("(import {} {{}}).outPath", expr_path.display()),
                ];
                let eval = try_run("nix", &eval_args, Capture::Captured)
                    .await
                    .map_err(|err| NixCsiError::bad_request(err.to_string()))?;
                let predicted = PathBuf::from(eval.stdout.trim());
                self.resolved_paths.insert(expression.to_string(), predicted.clone()).await;

                // Cheap substituter-only attempt; a miss just falls through to the full build below.
                let _ = run(
                    "nix",
                    &["build".to_string(), "--no-link".to_string(), predicted.display().to_string()],
                    Capture::Captured,
                )
                .await;
                predicted
            }
        };

        if !path.exists() {
            let mut args = vec![
                "build".to_string(),
                "--print-out-paths".to_string(),
                "--out-link".to_string(),
                gcroot_path.display().to_string(),
            ];
            if let Some(substituter) = self.remote_cache_substituter().await {
                args.extend(["--extra-substituters".to_string(), substituter]);
            }

            let builders = self.reachable_builders().await;
            if !builders.is_empty() {
                args.push("--builders".to_string());
                args.push(builders.join(";"));
            }
            args.extend(["--file".to_string(), expr_path.display().to_string()]);

            let output = try_run("nix", &args, Capture::Console(Level::DEBUG))
                .await
                .map_err(|err| NixCsiError::bad_request(err.to_string()))?;
            path = first_output_path(&output.stdout)?;
            self.resolved_paths.insert(expression.to_string(), path.clone()).await;
        }

        Ok(path)
    }

    /// Probes every candidate builder IP concurrently and returns the
    /// reachable ones as `ssh-ng://` URIs. Never includes this pod's
    /// own IP (P7) — `candidate_builder_ips` already filters it out.
    async fn reachable_builders(&self) -> Vec<String> {
        let candidates = builders::candidate_builder_ips(&self.builders_file, &self.pod_ip);
        let probes = candidates.into_iter().map(|ip| async move {
            let uri = format!("ssh-ng://nix@{ip}");
            let args = vec!["store".to_string(), "ping".to_string(), "--store".to_string(), uri.clone()];
            let reachable = try_run("nix", &args, Capture::Captured).await.map(|o| o.success()).unwrap_or(false);
            reachable.then(|| format!("{uri}?trusted=1"))
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}

fn first_output_path(stdout: &str) -> NixCsiResult<PathBuf> {
    stdout
        .lines()
        .next()
        .map(|line| PathBuf::from(line.trim()))
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| NixCsiError::bad_request("build produced no output path"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_output_path_takes_first_line_only() {
        let path = first_output_path("/nix/store/aaa-hello\n/nix/store/bbb-world\n").unwrap();
        assert_eq!(path, PathBuf::from("/nix/store/aaa-hello"));
    }

    #[test]
    fn first_output_path_rejects_empty_output() {
        assert!(first_output_path("").is_err());
    }
}
