//! # libsriovdp — SR-IOV network device plugin for RK8s nodes
//!
//! `libsriovdp` advertises SR-IOV virtual functions (and other PCI network
//! devices) to the node agent over the device-plugin protocol, served as
//! JSON frames on Unix sockets instead of gRPC.  It follows the RK8s
//! architecture conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: devices, selectors, protocol payloads. |
//! | [`error`] | [`DpError`] enum covering all failure modes. |
//! | [`message`] | [`DpMessage`] protocol envelope for the socket transport. |
//! | [`registration`] | [`Registration`] trait — plugin handshake with the node agent. |
//! | [`plugin`] | [`DevicePlugin`] trait — device advertisement & allocation. |
//! | [`transport`] | Unix-socket client/server with length-prefixed JSON frames. |
//! | [`sysfs`] | Read-only PCI/netdev introspection rooted at a configurable path. |
//! | [`scanner`] | Selector-driven device discovery. |
//! | [`infoprovider`] | Driver-specific device nodes, mounts, and env values. |
//! | [`device`] | Immutable per-device records built at discovery time. |
//! | [`pool`] | Per-resource inventory, health, and allocation bookkeeping. |
//! | [`checkpoint`] | Crash-safe persistence of pod-to-device mappings. |
//! | [`server`] | Socket lifecycle: start, self-dial, probe loop, restart. |
//! | [`config`] | Per-node resource configuration parsing and validation. |
//! | [`manager`] | One server per resource plus the legacy claim entry points. |

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod infoprovider;
pub mod manager;
pub mod message;
pub mod plugin;
pub mod pool;
pub mod registration;
pub mod scanner;
pub mod server;
pub mod sysfs;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use error::DpError;
pub use manager::{PodIdentityResolver, ResourceManager};
pub use message::DpMessage;
pub use plugin::{DeviceListSink, DevicePlugin};
pub use pool::ResourcePool;
pub use registration::Registration;
pub use server::{ResourceServer, ServerOptions};
pub use sysfs::SysFs;
pub use types::*;
