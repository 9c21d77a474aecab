//! Per-resource plugin server.
//!
//! A [`ResourceServer`] owns one [`ResourcePool`] and its socket lifecycle:
//! bind, self-dial handshake, the health-probe loop, restart after a failed
//! registration, and teardown.  It implements both protocol surfaces, so the
//! transport server dispatches straight into it.
//!
//! Three signals steer a running server:
//!
//! * **terminate** (broadcast) — every open `ListAndWatch` stream ends.
//! * **update** (broadcast) — every open stream re-sends the device list.
//! * **restart** (mpsc, capacity 1) — the watch loop tears the socket down
//!   and brings it back up after a settling delay.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::DpError;
use crate::plugin::{DeviceListSink, DevicePlugin};
use crate::pool::ResourcePool;
use crate::registration::Registration;
use crate::transport::{DpClient, DpServer};
use crate::types::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, DevicePluginOptions,
    ListAndWatchResponse, PluginInfo, PreStartContainerRequest, PreStartContainerResponse,
    RegistrationStatus, DIAL_TIMEOUT_SECS, ENV_VAR_PREFIX, HEALTH_PROBE_INTERVAL_SECS,
    PLUGIN_TYPE_DEVICE_PLUGIN, RESOURCE_PREFIX, RESTART_SETTLE_SECS, SOCK_DIR, SOCK_SUFFIX,
    SUPPORTED_VERSIONS,
};

/// Tunable knobs of a [`ResourceServer`]; defaults match production paths
/// and intervals, tests shrink them.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Directory the plugin socket is created in.
    pub sock_dir: PathBuf,
    /// Resource-name prefix used when the pool config has no override.
    pub prefix: String,
    /// Socket file-name suffix.
    pub suffix: String,
    /// Delay between health-probe cycles.
    pub probe_interval: Duration,
    /// Settling delay before a restart attempt.
    pub restart_delay: Duration,
    /// Timeout for the post-start self-dial handshake.
    pub dial_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            sock_dir: PathBuf::from(SOCK_DIR),
            prefix: RESOURCE_PREFIX.to_owned(),
            suffix: SOCK_SUFFIX.to_owned(),
            probe_interval: Duration::from_secs(HEALTH_PROBE_INTERVAL_SECS),
            restart_delay: Duration::from_secs(RESTART_SETTLE_SECS),
            dial_timeout: Duration::from_secs(DIAL_TIMEOUT_SECS),
        }
    }
}

/// State of one serving generation, replaced wholesale on restart.
struct Serving {
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<Result<(), DpError>>,
    probe_task: JoinHandle<()>,
}

/// Socket server for a single resource pool.
pub struct ResourceServer {
    pool: Arc<ResourcePool>,
    opts: ServerOptions,
    term_tx: broadcast::Sender<()>,
    update_tx: broadcast::Sender<()>,
    restart_tx: mpsc::Sender<()>,
    restart_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Mutex<Option<mpsc::Receiver<()>>>,
    serving: Mutex<Option<Serving>>,
}

impl ResourceServer {
    pub fn new(pool: ResourcePool, opts: ServerOptions) -> Self {
        let (term_tx, _) = broadcast::channel(16);
        let (update_tx, _) = broadcast::channel(16);
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            pool: Arc::new(pool),
            opts,
            term_tx,
            update_tx,
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            serving: Mutex::new(None),
        }
    }

    /// The pool this server fronts.
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Absolute path of this server's socket file.
    pub fn socket_path(&self) -> PathBuf {
        self.opts
            .sock_dir
            .join(format!("{}.{}", self.pool.resource_name(), self.opts.suffix))
    }

    /// Effective resource-name prefix: pool override, else server default.
    fn prefix(&self) -> &str {
        self.pool
            .config()
            .resource_prefix
            .as_deref()
            .unwrap_or(&self.opts.prefix)
    }

    /// Populate the pool inventory.  A failed scan here is fatal for this
    /// resource: serving an empty list instead would silently mask it.
    pub async fn init(&self) -> Result<(), DpError> {
        self.pool.discover_devices().await
    }

    /// Bind the socket, start serving, and verify with a self-dial.
    ///
    /// A stale socket file left by a previous process is removed first.
    /// If the self-dial fails the server is torn down and the error
    /// propagated; a socket that cannot be dialed would register but never
    /// serve.
    #[instrument(skip(self), fields(resource = %self.pool.resource_name()))]
    pub async fn start(self: &Arc<Self>) -> Result<(), DpError> {
        self.cleanup_socket().await?;
        let path = self.socket_path();

        let (server, shutdown_tx) = DpServer::bind(&path, Arc::clone(self))?;
        let serve_task = tokio::spawn(server.serve());

        if let Err(e) = DpClient::connect_timeout(&path, self.opts.dial_timeout).await {
            error!(error = %e, "self-dial handshake failed, tearing server down");
            let _ = shutdown_tx.send(true);
            let _ = serve_task.await;
            self.cleanup_socket().await?;
            return Err(e);
        }

        // The probe task belongs to this serving generation: it observes the
        // same shutdown channel as the accept loop, so a restart never leaves
        // an orphan prober behind.
        let probe_task = {
            let pool = Arc::clone(&self.pool);
            let update_tx = self.update_tx.clone();
            let interval = self.opts.probe_interval;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    match pool.probe().await {
                        Ok(true) => {
                            debug!("device health changed, notifying watchers");
                            let _ = update_tx.send(());
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "health probe failed"),
                    }
                    tokio::select! {
                        biased;
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            })
        };

        let mut serving = self.serving.lock().await;
        *serving = Some(Serving {
            shutdown_tx,
            serve_task,
            probe_task,
        });
        info!(path = %path.display(), "plugin server started");
        Ok(())
    }

    /// Stop serving and remove the socket file.  Idempotent.
    #[instrument(skip(self), fields(resource = %self.pool.resource_name()))]
    pub async fn stop(&self) -> Result<(), DpError> {
        let Some(serving) = self.serving.lock().await.take() else {
            return Ok(());
        };
        let _ = self.term_tx.send(());
        let _ = self.stop_tx.try_send(());
        self.shutdown_serving(serving).await;
        self.cleanup_socket().await?;
        info!("plugin server stopped");
        Ok(())
    }

    /// Tear the socket down and bring it back up, ending all open streams.
    #[instrument(skip(self), fields(resource = %self.pool.resource_name()))]
    pub async fn restart(self: &Arc<Self>) -> Result<(), DpError> {
        if let Some(serving) = self.serving.lock().await.take() {
            let _ = self.term_tx.send(());
            self.shutdown_serving(serving).await;
            self.cleanup_socket().await?;
        }
        self.start().await
    }

    /// React to lifecycle signals until the server is stopped.
    ///
    /// Runs on its own task; a restart request (from a failed registration)
    /// is honored after a settling delay so a crashing node agent cannot
    /// drive a tight rebind loop.
    pub async fn watch(self: Arc<Self>) {
        let mut restart_rx = match self.restart_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("lifecycle watch started twice");
                return;
            }
        };
        let mut stop_rx = match self.stop_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    debug!("lifecycle watch exiting");
                    return;
                }
                req = restart_rx.recv() => {
                    if req.is_none() {
                        return;
                    }
                    info!(delay = ?self.opts.restart_delay, "restart requested, settling");
                    tokio::time::sleep(self.opts.restart_delay).await;
                    if let Err(e) = self.restart().await {
                        error!(error = %e, "restart failed, giving up on this resource");
                        return;
                    }
                }
            }
        }
    }

    async fn shutdown_serving(&self, serving: Serving) {
        let _ = serving.shutdown_tx.send(true);
        match serving.serve_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "serve loop exited with error"),
            Err(e) => warn!(error = %e, "serve task panicked"),
        }
        if let Err(e) = serving.probe_task.await {
            warn!(error = %e, "probe task panicked");
        }
    }

    async fn cleanup_socket(&self) -> Result<(), DpError> {
        match tokio::fs::remove_file(self.socket_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DpError::transport(e)),
        }
    }
}

/// Build the exported environment key for one env map entry:
/// `PCIDEVICE_<PREFIX>_<KEY>`, dots mapped to underscores, uppercased.
fn export_env_key(prefix: &str, key: &str) -> String {
    format!("{ENV_VAR_PREFIX}_{prefix}_{key}")
        .replace('.', "_")
        .to_uppercase()
}

#[async_trait]
impl Registration for ResourceServer {
    async fn get_info(&self) -> Result<PluginInfo, DpError> {
        Ok(PluginInfo {
            plugin_type: PLUGIN_TYPE_DEVICE_PLUGIN.to_owned(),
            name: format!("{}/{}", self.prefix(), self.pool.resource_name()),
            endpoint: self.socket_path().to_string_lossy().into_owned(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| (*v).to_owned()).collect(),
        })
    }

    async fn notify_registration_status(&self, status: RegistrationStatus) -> Result<(), DpError> {
        if status.plugin_registered {
            info!(resource = %self.pool.resource_name(), "plugin registered");
        } else {
            warn!(
                resource = %self.pool.resource_name(),
                error = %status.error,
                "registration failed, scheduling restart",
            );
            // A full channel means a restart is already pending.
            let _ = self.restart_tx.try_send(());
        }
        Ok(())
    }
}

#[async_trait]
impl DevicePlugin for ResourceServer {
    async fn get_device_plugin_options(&self) -> Result<DevicePluginOptions, DpError> {
        Ok(DevicePluginOptions {
            pre_start_required: false,
        })
    }

    async fn list_and_watch(&self, sink: DeviceListSink) -> Result<(), DpError> {
        // Subscribe before the initial snapshot so no update between the two
        // is lost; a spurious resend is harmless.
        let mut term_rx = self.term_tx.subscribe();
        let mut update_rx = self.update_tx.subscribe();

        sink.send(ListAndWatchResponse {
            devices: self.pool.get_devices().await,
        })
        .await?;

        loop {
            tokio::select! {
                biased;
                _ = term_rx.recv() => {
                    // Terminate, whatever the recv result: a lagged or closed
                    // terminate channel still means "stop streaming".
                    debug!(resource = %self.pool.resource_name(), "device stream terminated");
                    return Ok(());
                }
                changed = update_rx.recv() => {
                    match changed {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            sink.send(ListAndWatchResponse {
                                devices: self.pool.get_devices().await,
                            })
                            .await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn allocate(&self, req: AllocateRequest) -> Result<AllocateResponse, DpError> {
        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for creq in &req.container_requests {
            info!(
                resource = %self.pool.resource_name(),
                pod_uid = %creq.pod_uid,
                container = %creq.container_name,
                devices = ?creq.devices_ids,
                "allocation requested",
            );
            self.pool.allocate(&creq.pod_uid, &creq.devices_ids).await?;

            let devices = self.pool.get_device_specs(&creq.devices_ids).await;
            let mounts = self.pool.get_mounts().await;
            let envs = self
                .pool
                .get_envs(&creq.devices_ids)
                .await
                .into_iter()
                .map(|(k, v)| (export_env_key(self.prefix(), &k), v))
                .collect();

            container_responses.push(ContainerAllocateResponse {
                envs,
                mounts,
                devices,
            });
        }
        Ok(AllocateResponse {
            container_responses,
        })
    }

    async fn pre_start_container(
        &self,
        _req: PreStartContainerRequest,
    ) -> Result<PreStartContainerResponse, DpError> {
        Ok(PreStartContainerResponse::default())
    }
}
