//! Reboot-aware startup sweep. Overlay and bind mounts do not survive
//! a reboot, so without this sweep stale sub-stores accumulate and
//! garbage roots pin closures nothing references any more. Runs once,
//! before the server starts accepting connections.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Parses the integer following the `btime` token out of a
/// `/proc/stat`-shaped file.
pub fn kernel_boot_time(stat_file: &Path) -> Result<i64> {
    let contents = std::fs::read_to_string(stat_file)
        .with_context(|| format!("failed to read {}", stat_file.display()))?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest
                .trim()
                .parse::<i64>()
                .with_context(|| format!("btime token in {} is not an integer", stat_file.display()));
        }
    }
    anyhow::bail!("no btime token found in {}", stat_file.display())
}

/// Compares the current boot epoch against the recorded snapshot and
/// purges `csi_volumes`/`csi_gcroots` on mismatch, then refreshes the
/// snapshot. `stat_file` is parameterized for testability; production
/// callers pass `/proc/stat`.
pub fn sweep(stat_file: &Path, csi_root: &Path, csi_volumes: &Path, csi_gcroots: &Path, snapshot_path: &Path) -> Result<()> {
    std::fs::create_dir_all(csi_root).with_context(|| format!("failed to create {}", csi_root.display()))?;

    let current_boot_time = kernel_boot_time(stat_file)?;
    let needs_purge = if snapshot_path.exists() {
        match kernel_boot_time(snapshot_path) {
            Ok(recorded) => recorded != current_boot_time,
            Err(err) => {
                warn!(error = %err, "boot snapshot unparseable, treating as a reboot");
                true
            }
        }
    } else {
        false
    };

    if needs_purge {
        info!("kernel boot epoch changed since last startup, purging stale volumes and gcroots");
        for dir in [csi_volumes, csi_gcroots] {
            if dir.exists() {
                std::fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
    }

    std::fs::create_dir_all(csi_volumes).with_context(|| format!("failed to create {}", csi_volumes.display()))?;
    std::fs::create_dir_all(csi_gcroots).with_context(|| format!("failed to create {}", csi_gcroots.display()))?;

    std::fs::copy(stat_file, snapshot_path)
        .with_context(|| format!("failed to snapshot {} to {}", stat_file.display(), snapshot_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_stat(dir: &Path, name: &str, btime: i64) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("cpu  0 0 0 0\nbtime {btime}\nprocesses 1\n")).unwrap();
        path
    }

    #[test]
    fn first_startup_does_not_purge_and_writes_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let stat = write_stat(tmp.path(), "proc_stat_live", 1000);
        let root = tmp.path().join("root");
        let volumes = root.join("volumes");
        let gcroots = root.join("gcroots");
        let snapshot = root.join("proc_stat");

        fs::create_dir_all(&volumes).unwrap();
        fs::write(volumes.join("marker"), b"x").unwrap();

        sweep(&stat, &root, &volumes, &gcroots, &snapshot).unwrap();

        assert!(volumes.join("marker").exists());
        assert_eq!(kernel_boot_time(&snapshot).unwrap(), 1000);
    }

    #[test]
    fn changed_boot_epoch_purges_volumes_and_gcroots() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let volumes = root.join("volumes");
        let gcroots = root.join("gcroots");
        let snapshot = root.join("proc_stat");

        fs::create_dir_all(&volumes).unwrap();
        fs::write(volumes.join("stale-vol"), b"x").unwrap();
        write_stat(&root, "proc_stat", 1000);

        let stat_now = write_stat(tmp.path(), "proc_stat_live", 2000);

        sweep(&stat_now, &root, &volumes, &gcroots, &snapshot).unwrap();

        assert!(!volumes.join("stale-vol").exists());
        assert!(volumes.is_dir());
        assert!(gcroots.is_dir());
        assert_eq!(kernel_boot_time(&snapshot).unwrap(), 2000);
    }

    #[test]
    fn corrupt_snapshot_is_treated_as_a_reboot() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let volumes = root.join("volumes");
        let gcroots = root.join("gcroots");
        let snapshot = root.join("proc_stat");

        fs::create_dir_all(&volumes).unwrap();
        fs::write(volumes.join("stale-vol"), b"x").unwrap();
        fs::write(&snapshot, b"garbage, no btime token here").unwrap();

        let stat_now = write_stat(tmp.path(), "proc_stat_live", 42);

        sweep(&stat_now, &root, &volumes, &gcroots, &snapshot).unwrap();

        assert!(!volumes.join("stale-vol").exists());
    }
}
