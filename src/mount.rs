//! Chooses bind vs overlay mount strategy and performs/reverses
//! mounts idempotently, per the exit-code-32 "already mounted"
//! convention of the `mount` tool.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::subprocess::{run, Capture};

const ALREADY_MOUNTED: i32 = 32;

/// Ensures `volume_root/nix` (or an overlay of it) is mounted at
/// `target_path`. Creates `target_path` if absent. A `readonly`
/// mount is a bind mount sharing inodes with the sub-store; a
/// read-write mount is an overlay with a dedicated `upperdir`/`workdir`
/// under `volume_root` so writes never touch the sub-store's lower
/// layer.
pub async fn mount(volume_root: &Path, target_path: &Path, readonly: bool) -> Result<()> {
    std::fs::create_dir_all(target_path)
        .with_context(|| format!("failed to create target path {}", target_path.display()))?;

    let lower = volume_root.join("nix");
    let args: Vec<String> = if readonly {
        vec![
            "--verbose".to_string(),
            "--bind".to_string(),
            "-o".to_string(),
            "ro".to_string(),
            lower.display().to_string(),
            target_path.display().to_string(),
        ]
    } else {
        let upper = volume_root.join("upperdir");
        let work = volume_root.join("workdir");
        std::fs::create_dir_all(&upper).context("failed to create upperdir")?;
        std::fs::create_dir_all(&work).context("failed to create workdir")?;
        vec![
            "--verbose".to_string(),
            "-t".to_string(),
            "overlay".to_string(),
            "overlay".to_string(),
            "-o".to_string(),
            format!("rw,lowerdir={},upperdir={},workdir={}", lower.display(), upper.display(), work.display()),
            target_path.display().to_string(),
        ]
    };

    let output = run("mount", &args, Capture::Captured).await?;
    if output.success() {
        info!(target = %target_path.display(), readonly, "mounted volume");
        return Ok(());
    }
    if output.status == ALREADY_MOUNTED {
        info!(target = %target_path.display(), "already mounted, treating as success");
        return Ok(());
    }

    anyhow::bail!("mount {} failed (status={}): {}", target_path.display(), output.status, output.combined)
}

/// Probes whether `target_path` is currently a mountpoint.
pub async fn is_mounted(target_path: &Path) -> Result<bool> {
    Ok(run("mountpoint", &["--quiet".to_string(), target_path.display().to_string()], Capture::Captured)
        .await?
        .success())
}

/// Unmounts `target_path` if it is currently a mountpoint. Succeeds
/// if nothing is mounted there, and also succeeds if the unmount
/// command reports failure but the path is no longer a mountpoint by
/// the time it returns (a race with another unmounter is not an error).
pub async fn unmount(target_path: &Path) -> Result<()> {
    let probe = run("mountpoint", &["--quiet".to_string(), target_path.display().to_string()], Capture::Captured).await?;
    if !probe.success() {
        return Ok(());
    }

    let output = run("umount", &["--verbose".to_string(), target_path.display().to_string()], Capture::Captured).await?;
    if output.success() {
        info!(target = %target_path.display(), "unmounted volume");
        return Ok(());
    }

    let still_mounted = run("mountpoint", &["--quiet".to_string(), target_path.display().to_string()], Capture::Captured)
        .await?
        .success();
    if !still_mounted {
        info!(target = %target_path.display(), "umount reported failure but target is no longer a mountpoint");
        return Ok(());
    }

    anyhow::bail!("umount {} failed (status={}): {}", target_path.display(), output.status, output.combined)
}
