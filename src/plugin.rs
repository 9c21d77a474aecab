//! Device-plugin service trait.
//!
//! The device-plugin service is the allocation-facing surface of a resource
//! pool:
//!
//! 1. **GetDevicePluginOptions** — static plugin options.
//! 2. **ListAndWatch** — long-lived device list stream.
//! 3. **Allocate** — resolve device specs / envs / mounts for containers.
//! 4. **PreStartContainer** — no-op acknowledgment.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DpError;
use crate::types::{
    AllocateRequest, AllocateResponse, DevicePluginOptions, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse,
};

/// Write side of a `ListAndWatch` stream.
///
/// The transport server owns the read side and forwards every snapshot to
/// the connected client as a `DeviceList` frame.  [`send`](Self::send) fails
/// once the client has gone away, which tells the handler to return.
pub struct DeviceListSink {
    tx: mpsc::Sender<ListAndWatchResponse>,
}

impl DeviceListSink {
    /// Wrap a channel sender as a sink.
    pub fn new(tx: mpsc::Sender<ListAndWatchResponse>) -> Self {
        Self { tx }
    }

    /// Push one device list snapshot to the stream.
    pub async fn send(&self, resp: ListAndWatchResponse) -> Result<(), DpError> {
        self.tx
            .send(resp)
            .await
            .map_err(|_| DpError::Transport("list-and-watch stream closed".to_owned()))
    }
}

/// Device-plugin service — device advertisement and allocation.
#[async_trait]
pub trait DevicePlugin: Send + Sync {
    /// Return static plugin options.
    async fn get_device_plugin_options(&self) -> Result<DevicePluginOptions, DpError>;

    /// Serve the device list stream: send the current list immediately, then
    /// block, re-sending the full list on every health change, until the
    /// stream is terminated.  Returning `Ok(())` ends the stream normally.
    async fn list_and_watch(&self, sink: DeviceListSink) -> Result<(), DpError>;

    /// Resolve device specs, environment values and mounts for every
    /// container in the batch.  A single unusable device fails the whole
    /// call.
    async fn allocate(&self, req: AllocateRequest) -> Result<AllocateResponse, DpError>;

    /// Acknowledge a pre-start hook.  This plugin never requires one.
    async fn pre_start_container(
        &self,
        req: PreStartContainerRequest,
    ) -> Result<PreStartContainerResponse, DpError>;
}
