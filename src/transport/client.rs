//! Socket client used by the node agent side of the protocol, by the
//! server's own self-dial handshake, and by tests.

use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;
use tracing::debug;

use crate::error::DpError;
use crate::message::DpMessage;
use crate::transport::codec::{read_frame, write_frame};
use crate::types::ListAndWatchResponse;

/// A lightweight plugin client: one connection, sequential requests.
pub struct DpClient {
    stream: UnixStream,
}

impl DpClient {
    /// Connect to the plugin socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self, DpError> {
        let stream = UnixStream::connect(path).await.map_err(DpError::transport)?;
        debug!(path = %path.display(), "plugin connection established");
        Ok(Self { stream })
    }

    /// Connect with a bounded timeout, retrying until the socket accepts.
    ///
    /// Used for the post-`Start` self-dial handshake: the listener is bound
    /// before `Start` returns, but serving happens on a separate task, so
    /// the first attempts may race it.
    pub async fn connect_timeout(path: &Path, timeout: Duration) -> Result<Self, DpError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(Self { stream }),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(DpError::Transport(format!(
                            "handshake with {} timed out: {e}",
                            path.display()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Send a unary request and wait for the corresponding response frame.
    pub async fn request(&mut self, msg: &DpMessage) -> Result<DpMessage, DpError> {
        write_frame(&mut self.stream, msg).await?;
        let response = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| DpError::Transport("connection closed before response".to_owned()))?;
        debug!(%response, "plugin response received");
        Ok(response)
    }

    /// Open the `ListAndWatch` stream on this connection.
    ///
    /// After this call, [`next_device_list`](Self::next_device_list) yields
    /// snapshots until the server terminates the stream.
    pub async fn start_watch(&mut self) -> Result<(), DpError> {
        write_frame(&mut self.stream, &DpMessage::ListAndWatch).await
    }

    /// Read the next device list snapshot; `Ok(None)` when the server has
    /// ended the stream.
    pub async fn next_device_list(&mut self) -> Result<Option<ListAndWatchResponse>, DpError> {
        match read_frame(&mut self.stream).await? {
            Some(DpMessage::DeviceList(resp)) => Ok(Some(resp)),
            Some(DpMessage::Error(e)) => Err(e),
            Some(other) => Err(DpError::Transport(format!(
                "unexpected frame on watch stream: {other}"
            ))),
            None => Ok(None),
        }
    }
}
