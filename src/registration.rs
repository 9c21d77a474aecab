//! Plugin registration service trait.
//!
//! The registration service is how the node agent discovers a plugin after
//! finding its socket: it asks for identity via `GetInfo` and later pushes
//! the handshake outcome via `NotifyRegistrationStatus`.

use async_trait::async_trait;

use crate::error::DpError;
use crate::types::{PluginInfo, RegistrationStatus};

/// Registration service — plugin identity and handshake outcome.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Return the plugin type, advertised resource name, socket endpoint and
    /// supported protocol versions.
    async fn get_info(&self) -> Result<PluginInfo, DpError>;

    /// Receive the registration outcome.  A failed registration must not
    /// fail the process; implementations schedule an asynchronous restart
    /// instead.
    async fn notify_registration_status(&self, status: RegistrationStatus)
        -> Result<(), DpError>;
}
