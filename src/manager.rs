//! Top-level resource manager.
//!
//! Owns one [`ResourceServer`] per configured resource name and the node-wide
//! entry points: bring every configured pool up, route legacy claim requests
//! to the right pool, and tear everything down on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::DpError;
use crate::pool::ResourcePool;
use crate::server::{ResourceServer, ServerOptions};
use crate::sysfs::SysFs;
use crate::types::{ResourceConfig, ResourceConfigList, VfInfo};

/// Maps a pod reference (namespace + name) to the pod identifier used in
/// allocation bookkeeping.
///
/// The legacy claim protocol identifies pods by namespace and name, while
/// allocations are recorded under the orchestrator's pod UID; the resolver
/// bridges the two.  Production wires this to the node agent; tests supply
/// a table.
#[async_trait]
pub trait PodIdentityResolver: Send + Sync {
    async fn resolve_pod_identity(&self, namespace: &str, name: &str) -> Result<String, DpError>;
}

/// One server per resource name, plus the shared host handles.
pub struct ResourceManager {
    sysfs: SysFs,
    opts: ServerOptions,
    checkpoint_dir: PathBuf,
    servers: DashMap<String, Arc<ResourceServer>>,
}

impl ResourceManager {
    pub fn new(sysfs: SysFs, opts: ServerOptions, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            sysfs,
            opts,
            checkpoint_dir: checkpoint_dir.into(),
            servers: DashMap::new(),
        }
    }

    /// Bring one resource pool up: replay its checkpoint, discover devices,
    /// start its socket, and spawn its lifecycle watch.
    pub async fn add_resource(&self, config: ResourceConfig) -> Result<(), DpError> {
        let name = config.resource_name.clone();
        if self.servers.contains_key(&name) {
            return Err(DpError::InvalidArgument(format!(
                "resource {name:?} is already served"
            )));
        }

        let checkpoint = CheckpointStore::new(&self.checkpoint_dir, &name);
        let pool = ResourcePool::new(config, self.sysfs.clone(), checkpoint);
        pool.restore().await;

        let server = Arc::new(ResourceServer::new(pool, self.opts.clone()));
        server.init().await?;
        server.start().await?;
        tokio::spawn(Arc::clone(&server).watch());

        info!(resource = %name, "resource server running");
        self.servers.insert(name, server);
        Ok(())
    }

    /// Bring up every entry of a parsed configuration.
    ///
    /// A resource that fails to start is logged and skipped so one bad entry
    /// does not take down its siblings.  Returns how many servers came up.
    pub async fn start_from_config(&self, list: ResourceConfigList) -> usize {
        let mut started = 0;
        for config in list.resource_list {
            let name = config.resource_name.clone();
            match self.add_resource(config).await {
                Ok(()) => started += 1,
                Err(e) => warn!(resource = %name, error = %e, "resource failed to start, skipping"),
            }
        }
        started
    }

    /// Stop every server and forget it.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, server)) = self.servers.remove(&name) {
                if let Err(e) = server.stop().await {
                    error!(resource = %name, error = %e, "error stopping resource server");
                }
            }
        }
    }

    /// Look up a running server by resource name.
    pub fn server(&self, resource_name: &str) -> Option<Arc<ResourceServer>> {
        self.servers.get(resource_name).map(|e| Arc::clone(e.value()))
    }

    /// Legacy claim path: hand the pod's next unclaimed device of
    /// `resource_name` to the caller.
    pub async fn claim_device<R: PodIdentityResolver + ?Sized>(
        &self,
        resolver: &R,
        namespace: &str,
        pod_name: &str,
        resource_name: &str,
    ) -> Result<VfInfo, DpError> {
        let server = self.server(resource_name).ok_or_else(|| {
            DpError::InvalidArgument(format!("unknown resource {resource_name:?}"))
        })?;
        let pod_uid = resolver.resolve_pod_identity(namespace, pod_name).await?;
        server.pool().claim_next(&pod_uid).await
    }

    /// Legacy claim path: return the pod's first claimed device of
    /// `resource_name`.
    pub async fn release_device<R: PodIdentityResolver + ?Sized>(
        &self,
        resolver: &R,
        namespace: &str,
        pod_name: &str,
        resource_name: &str,
    ) -> Result<String, DpError> {
        let server = self.server(resource_name).ok_or_else(|| {
            DpError::InvalidArgument(format!("unknown resource {resource_name:?}"))
        })?;
        let pod_uid = resolver.resolve_pod_identity(namespace, pod_name).await?;
        server.pool().release_claim(&pod_uid).await
    }
}
