//! Protocol messages exchanged on the plugin socket.
//!
//! [`DpMessage`] is the top-level envelope for all request and response
//! variants of both protocol surfaces: the node agent's plugin registration
//! service and the device-plugin allocation service.

use serde::{Deserialize, Serialize};

use crate::error::DpError;
use crate::types::*;

/// Top-level message envelope for the plugin socket.
///
/// Each connection carries one request followed by one response, except for
/// [`DpMessage::ListAndWatch`], which leaves the connection open and streams
/// a [`DpMessage::DeviceList`] frame on every device-state change until the
/// server terminates the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DpMessage {
    // ----- Requests --------------------------------------------------------
    /// Query plugin identity (registration surface).
    GetInfo,
    /// Push the outcome of the registration handshake (registration surface).
    NotifyRegistrationStatus(RegistrationStatus),

    /// Query plugin options (device-plugin surface).
    GetDevicePluginOptions,
    /// Open the long-lived device list stream (device-plugin surface).
    ListAndWatch,
    /// Allocate devices for one or more containers (device-plugin surface).
    Allocate(AllocateRequest),
    /// Pre-start hook; acknowledged without action (device-plugin surface).
    PreStartContainer(PreStartContainerRequest),

    // ----- Responses -------------------------------------------------------
    /// Plugin identity.
    PluginInfoResponse(PluginInfo),
    /// Registration status acknowledgment (no payload).
    RegistrationStatusAck,
    /// Plugin options.
    DevicePluginOptionsResponse(DevicePluginOptions),
    /// One device list snapshot on the `ListAndWatch` stream.
    DeviceList(ListAndWatchResponse),
    /// Allocation result.
    AllocateResponse(AllocateResponse),
    /// Pre-start acknowledgment.
    PreStartContainerAck(PreStartContainerResponse),

    /// An error occurred.
    Error(DpError),
}

impl std::fmt::Display for DpMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetInfo => f.write_str("GetInfo"),
            Self::NotifyRegistrationStatus(s) => {
                write!(f, "NotifyRegistrationStatus(registered={})", s.plugin_registered)
            }
            Self::GetDevicePluginOptions => f.write_str("GetDevicePluginOptions"),
            Self::ListAndWatch => f.write_str("ListAndWatch"),
            Self::Allocate(req) => {
                write!(f, "Allocate(containers={})", req.container_requests.len())
            }
            Self::PreStartContainer(req) => {
                write!(f, "PreStartContainer(devices={})", req.devices_ids.len())
            }
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::RegistrationStatusAck => f.write_str("RegistrationStatusAck"),
            Self::DevicePluginOptionsResponse(opts) => {
                write!(f, "DevicePluginOptions(preStart={})", opts.pre_start_required)
            }
            Self::DeviceList(resp) => write!(f, "DeviceList(count={})", resp.devices.len()),
            Self::AllocateResponse(resp) => {
                write!(f, "AllocateResponse(containers={})", resp.container_responses.len())
            }
            Self::PreStartContainerAck(_) => f.write_str("PreStartContainerAck"),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_roundtrip() {
        let msg = DpMessage::Allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                pod_uid: "pod-1".into(),
                container_name: "ctr".into(),
                devices_ids: vec!["0000:02:00.1".into()],
            }],
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: DpMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, DpMessage::Allocate(_)));
    }

    #[test]
    fn error_message_roundtrip() {
        let msg = DpMessage::Error(DpError::unknown_device("0000:02:00.1"));
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: DpMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(matches!(de, DpMessage::Error(DpError::DeviceUnusable { .. })));
    }

    #[test]
    fn display_formatting() {
        assert_eq!(DpMessage::GetInfo.to_string(), "GetInfo");
        assert_eq!(DpMessage::ListAndWatch.to_string(), "ListAndWatch");
        let msg = DpMessage::DeviceList(ListAndWatchResponse { devices: vec![] });
        assert_eq!(msg.to_string(), "DeviceList(count=0)");
    }
}
