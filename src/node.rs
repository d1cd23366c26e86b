use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::coordinator::VolumeCoordinator;
use crate::csi::{
    node_server::Node, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest,
    NodeUnstageVolumeResponse,
};
use crate::descriptor::VolumeDescriptor;
use crate::error::NixCsiError;

pub struct NodeService {
    node_id: String,
    coordinator: Arc<VolumeCoordinator>,
}

impl NodeService {
    pub fn new(node_id: String, coordinator: Arc<VolumeCoordinator>) -> Self {
        Self { node_id, coordinator }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        // This core implements no Stage/Unstage, stats, or expansion — every
        // mount/unmount happens inside NodePublish/NodeUnpublish.
        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities: vec![] }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    async fn node_stage_volume(
        &self,
        _request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        Err(Status::from(NixCsiError::Unimplemented("NodeStageVolume")))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        Err(Status::from(NixCsiError::Unimplemented("NodeUnstageVolume")))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();

        let descriptor = VolumeDescriptor::parse(
            req.volume_id,
            req.target_path,
            req.readonly,
            req.volume_context,
            self.coordinator.current_system(),
        )?;

        self.coordinator.publish(descriptor).await?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::from(NixCsiError::bad_request("volume_id is required")));
        }
        if req.target_path.is_empty() {
            return Err(Status::from(NixCsiError::bad_request("target_path is required")));
        }

        self.coordinator
            .unpublish(&req.volume_id, std::path::Path::new(&req.target_path))
            .await?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::from(NixCsiError::Unimplemented("NodeGetVolumeStats")))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::from(NixCsiError::Unimplemented("NodeExpandVolume")))
    }
}
