//! Socket server that serves one resource pool's protocol surfaces and
//! dispatches incoming requests to the appropriate trait implementations.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, instrument, warn};

use crate::error::DpError;
use crate::message::DpMessage;
use crate::plugin::{DeviceListSink, DevicePlugin};
use crate::registration::Registration;
use crate::transport::codec::{read_frame, write_frame};

/// A plugin server that accepts Unix-socket connections and dispatches
/// [`DpMessage`] requests to a [`Registration`] + [`DevicePlugin`]
/// implementation.
pub struct DpServer<T> {
    listener: UnixListener,
    handler: Arc<T>,
    shutdown: watch::Receiver<bool>,
}

impl<T> DpServer<T>
where
    T: Registration + DevicePlugin + 'static,
{
    /// Bind a new server socket at `path`.
    ///
    /// The returned [`watch::Sender`] shuts the accept loop down; dropping
    /// it has the same effect.  The caller owns removal of the socket file.
    pub fn bind(path: &Path, handler: Arc<T>) -> Result<(Self, watch::Sender<bool>), DpError> {
        let listener = UnixListener::bind(path).map_err(DpError::transport)?;
        let (tx, rx) = watch::channel(false);
        debug!(path = %path.display(), "plugin socket bound");
        Ok((
            Self {
                listener,
                handler,
                shutdown: rx,
            },
            tx,
        ))
    }

    /// Accept connections until shutdown is signalled.
    ///
    /// Each accepted connection is handled on its own Tokio task; a
    /// `ListAndWatch` request keeps its connection open until the handler
    /// terminates the stream.
    pub async fn serve(mut self) -> Result<(), DpError> {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    // Either an explicit shutdown or the sender was dropped.
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
                incoming = self.listener.accept() => {
                    match incoming {
                        Ok((stream, _)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    warn!(error = %e, "plugin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "incoming plugin connection failed");
                        }
                    }
                }
            }
        }
    }

    /// Process all requests on a single connection.
    async fn handle_connection(stream: UnixStream, handler: Arc<T>) -> Result<(), DpError> {
        let (mut reader, mut writer) = stream.into_split();

        while let Some(request) = read_frame(&mut reader).await? {
            debug!(%request, "plugin request received");

            if matches!(request, DpMessage::ListAndWatch) {
                // Streaming call: forward every snapshot the handler emits
                // until it terminates the stream, then close the connection.
                let (tx, mut rx) = mpsc::channel(16);
                let h = Arc::clone(&handler);
                let stream_task =
                    tokio::spawn(async move { h.list_and_watch(DeviceListSink::new(tx)).await });

                while let Some(resp) = rx.recv().await {
                    write_frame(&mut writer, &DpMessage::DeviceList(resp)).await?;
                }

                match stream_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "list-and-watch handler failed"),
                    Err(e) => error!(error = %e, "list-and-watch task panicked"),
                }
                return Ok(());
            }

            let response = Self::dispatch(&*handler, request).await;
            write_frame(&mut writer, &response).await?;
        }
        Ok(())
    }

    /// Map a unary [`DpMessage`] request to the correct trait method call and
    /// wrap the result in a response [`DpMessage`].
    #[instrument(skip_all)]
    async fn dispatch(handler: &T, request: DpMessage) -> DpMessage {
        match request {
            // --- Registration ------------------------------------------------
            DpMessage::GetInfo => match handler.get_info().await {
                Ok(info) => DpMessage::PluginInfoResponse(info),
                Err(e) => DpMessage::Error(e),
            },
            DpMessage::NotifyRegistrationStatus(status) => {
                match handler.notify_registration_status(status).await {
                    Ok(()) => DpMessage::RegistrationStatusAck,
                    Err(e) => DpMessage::Error(e),
                }
            }

            // --- Device plugin ------------------------------------------------
            DpMessage::GetDevicePluginOptions => {
                match handler.get_device_plugin_options().await {
                    Ok(opts) => DpMessage::DevicePluginOptionsResponse(opts),
                    Err(e) => DpMessage::Error(e),
                }
            }
            DpMessage::Allocate(req) => match handler.allocate(req).await {
                Ok(resp) => DpMessage::AllocateResponse(resp),
                Err(e) => DpMessage::Error(e),
            },
            DpMessage::PreStartContainer(req) => match handler.pre_start_container(req).await {
                Ok(resp) => DpMessage::PreStartContainerAck(resp),
                Err(e) => DpMessage::Error(e),
            },

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                DpMessage::Error(DpError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }
}
