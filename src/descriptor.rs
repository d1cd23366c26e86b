//! The three mutually exclusive `volume_context` shapes, lifted into
//! a tagged union at the RPC boundary so the resolver, materializer,
//! and coordinator never re-inspect the raw map.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{NixCsiError, NixCsiResult};

/// Which of the three recognized `volume_context` keys described the
/// volume. `cache_key` is what the resolver's and coordinator's
/// per-content-key locks and caches are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKey {
    /// Direct content-address path under `/nix/store`, keyed under
    /// the node's current system triple (e.g. `x86_64-linux`).
    StorePath(String),
    /// A symbolic artifact reference such as a flake output.
    FlakeRef(String),
    /// An inline expression producing a derivation.
    NixExpr(String),
}

impl ContentKey {
    pub fn cache_key(&self) -> &str {
        match self {
            ContentKey::StorePath(s) | ContentKey::FlakeRef(s) | ContentKey::NixExpr(s) => s,
        }
    }

    fn from_context(context: &HashMap<String, String>, current_system: &str) -> NixCsiResult<Self> {
        let direct = context.get(current_system);
        let flake_ref = context.get("flakeRef");
        let nix_expr = context.get("nixExpr");

        match (direct, flake_ref, nix_expr) {
            (Some(path), None, None) => Ok(ContentKey::StorePath(path.clone())),
            (None, Some(flake), None) => Ok(ContentKey::FlakeRef(flake.clone())),
            (None, None, Some(expr)) => Ok(ContentKey::NixExpr(expr.clone())),
            (None, None, None) => Err(NixCsiError::bad_request(format!(
                "volume_context must set exactly one of `{current_system}`, `flakeRef`, `nixExpr`; none were present"
            ))),
            _ => Err(NixCsiError::bad_request(format!(
                "volume_context must set exactly one of `{current_system}`, `flakeRef`, `nixExpr`; more than one were present"
            ))),
        }
    }
}

/// A fully parsed and validated `NodePublishVolume`/`NodeUnpublishVolume`
/// request. Constructing one is the only place in this crate that
/// touches the raw request fields.
#[derive(Debug, Clone)]
pub struct VolumeDescriptor {
    pub volume_id: String,
    pub target_path: PathBuf,
    pub readonly: bool,
    pub content: ContentKey,
}

impl VolumeDescriptor {
    pub fn parse(
        volume_id: String,
        target_path: String,
        readonly: bool,
        context: HashMap<String, String>,
        current_system: &str,
    ) -> NixCsiResult<Self> {
        if volume_id.is_empty() {
            return Err(NixCsiError::bad_request("volume_id is required"));
        }
        if target_path.is_empty() {
            return Err(NixCsiError::bad_request("target_path is required"));
        }
        let content = ContentKey::from_context(&context, current_system)?;
        Ok(Self {
            volume_id,
            target_path: PathBuf::from(target_path),
            readonly,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn direct_store_path_is_recognized() {
        let descriptor = VolumeDescriptor::parse(
            "v1".to_string(),
            "/mnt/v1".to_string(),
            true,
            ctx(&[("x86_64-linux", "/nix/store/aaa-hello")]),
            "x86_64-linux",
        )
        .unwrap();
        assert_eq!(descriptor.content, ContentKey::StorePath("/nix/store/aaa-hello".to_string()));
    }

    #[test]
    fn flake_ref_is_recognized() {
        let descriptor = VolumeDescriptor::parse(
            "v2".to_string(),
            "/mnt/v2".to_string(),
            false,
            ctx(&[("flakeRef", "github:NixOS/nixpkgs#hello")]),
            "x86_64-linux",
        )
        .unwrap();
        assert_eq!(descriptor.content, ContentKey::FlakeRef("github:NixOS/nixpkgs#hello".to_string()));
    }

    #[test]
    fn empty_context_is_rejected() {
        let err = VolumeDescriptor::parse("v3".to_string(), "/mnt/v3".to_string(), false, ctx(&[]), "x86_64-linux")
            .unwrap_err();
        assert!(matches!(err, NixCsiError::BadRequest(_)));
    }

    #[test]
    fn conflicting_keys_are_rejected() {
        let err = VolumeDescriptor::parse(
            "v4".to_string(),
            "/mnt/v4".to_string(),
            false,
            ctx(&[("flakeRef", "a"), ("nixExpr", "b")]),
            "x86_64-linux",
        )
        .unwrap_err();
        assert!(matches!(err, NixCsiError::BadRequest(_)));
    }

    #[test]
    fn missing_volume_id_is_rejected() {
        let err = VolumeDescriptor::parse(
            String::new(),
            "/mnt/v5".to_string(),
            false,
            ctx(&[("nixExpr", "x")]),
            "x86_64-linux",
        )
        .unwrap_err();
        assert!(matches!(err, NixCsiError::BadRequest(_)));
    }
}
