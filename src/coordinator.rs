//! Orchestrates resolve → materialize → mount for publish, and the
//! reverse for unpublish, holding the per-volume lock for the full
//! duration of each operation (§4.2). This is the only module that
//! sequences the resolver, materializer, and mount manager together.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::descriptor::VolumeDescriptor;
use crate::error::{NixCsiError, NixCsiResult};
use crate::keyed_lock::KeyedLocks;
use crate::materializer::ClosureMaterializer;
use crate::mount;
use crate::resolver::ArtifactResolver;
use crate::uploader::Uploader;

pub struct VolumeCoordinator {
    config: Arc<Config>,
    resolver: ArtifactResolver,
    materializer: ClosureMaterializer,
    uploader: Arc<Uploader>,
    volume_locks: KeyedLocks<String>,
}

impl VolumeCoordinator {
    pub fn new(config: Arc<Config>, resolver: ArtifactResolver) -> Self {
        Self {
            config,
            resolver,
            materializer: ClosureMaterializer::new(),
            uploader: Arc::new(Uploader::new()),
            volume_locks: KeyedLocks::new(),
        }
    }

    pub fn current_system(&self) -> &str {
        self.resolver.current_system()
    }

    pub async fn publish(&self, descriptor: VolumeDescriptor) -> NixCsiResult<()> {
        let lock = self.volume_locks.get(&descriptor.volume_id);
        let _guard = lock.lock_owned().await;

        let volume_root = self.config.volume_root(&descriptor.volume_id);
        let gcroot_path = self.config.gcroot_path(&descriptor.volume_id);

        let already_mounted = mount::is_mounted(&descriptor.target_path).await.map_err(NixCsiError::Internal)?;
        if already_mounted && volume_root.exists() {
            info!(volume_id = %descriptor.volume_id, "publish is idempotent, target already mounted");
            return Ok(());
        }

        let artifact_path = self.resolver.resolve(&descriptor.content, &gcroot_path).await?;

        self.materializer
            .materialize(&artifact_path, &volume_root, &gcroot_path)
            .await
            .map_err(NixCsiError::Internal)?;

        if let Err(err) = mount::mount(&volume_root, &descriptor.target_path, descriptor.readonly).await {
            self.materializer.rollback(&volume_root, &gcroot_path).await;
            return Err(NixCsiError::Internal(err));
        }

        info!(
            volume_id = %descriptor.volume_id,
            content_key = descriptor.content.cache_key(),
            readonly = descriptor.readonly,
            "published volume"
        );

        if self.config.build_cache_enabled {
            self.uploader.clone().schedule(artifact_path.display().to_string());
        }

        Ok(())
    }

    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> NixCsiResult<()> {
        let lock = self.volume_locks.get(&volume_id.to_string());
        let _guard = lock.lock_owned().await;

        mount::unmount(target_path).await.map_err(NixCsiError::Internal)?;

        let gcroot_path = self.config.gcroot_path(volume_id);
        let volume_root = self.config.volume_root(volume_id);
        self.materializer.rollback(&volume_root, &gcroot_path).await;

        info!(volume_id, "unpublished volume");
        Ok(())
    }
}
