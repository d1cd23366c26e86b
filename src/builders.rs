//! Consumes the remote-builder host file rendered by the (out of
//! scope) cluster-side discovery daemon. This module does no
//! discovery of its own and does not cache the file's contents —
//! only the resolved, reachability-probed list downstream is cached.

use std::path::Path;

/// Reads one candidate builder IP per line from `host_file`, excluding
/// this pod's own IP so a build can never be offloaded to itself
/// (P7). A missing file is not an error: it means no builders have
/// been discovered yet, so an empty list is returned.
pub fn candidate_builder_ips(host_file: &Path, self_pod_ip: &str) -> Vec<String> {
    let contents = match std::fs::read_to_string(host_file) {
        Ok(contents) => contents,
        Err(_) => return Vec::new(),
    };

    contents
        .lines()
        .map(str::trim)
        .filter(|ip| !ip.is_empty() && *ip != self_pod_ip)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_host_file_yields_empty_list() {
        let ips = candidate_builder_ips(Path::new("/nonexistent/builders"), "10.0.0.1");
        assert!(ips.is_empty());
    }

    #[test]
    fn self_pod_ip_is_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let host_file = tmp.path().join("builders");
        std::fs::write(&host_file, "10.0.0.1\n10.0.0.2\n10.0.0.3\n").unwrap();

        let ips = candidate_builder_ips(&host_file, "10.0.0.2");

        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.3".to_string()]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let host_file = tmp.path().join("builders");
        std::fs::write(&host_file, "10.0.0.1\n\n  \n10.0.0.2\n").unwrap();

        let ips = candidate_builder_ips(&host_file, "");

        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }
}
