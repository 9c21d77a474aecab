//! Per-node resource configuration.
//!
//! The daemon reads one JSON document describing every resource pool it
//! should advertise.  Parsing validates the whole list up front so a broken
//! entry fails fast instead of surfacing as a half-registered plugin later.

use std::path::Path;

use tracing::debug;

use crate::error::DpError;
use crate::types::ResourceConfigList;

/// Parse and validate a resource configuration document.
///
/// Every `resourceName` must be non-empty, consist only of alphanumerics and
/// underscores (it becomes part of a socket file name and an environment
/// variable), and be unique within the list.
pub fn parse_resource_config(raw: &str) -> Result<ResourceConfigList, DpError> {
    let list: ResourceConfigList = serde_json::from_str(raw)
        .map_err(|e| DpError::InvalidArgument(format!("malformed resource config: {e}")))?;

    let mut seen = std::collections::HashSet::new();
    for rc in &list.resource_list {
        if rc.resource_name.is_empty() {
            return Err(DpError::InvalidArgument(
                "resource config entry with empty resourceName".to_owned(),
            ));
        }
        if !rc
            .resource_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DpError::InvalidArgument(format!(
                "invalid resourceName {:?}: only alphanumerics and underscores are allowed",
                rc.resource_name
            )));
        }
        if !seen.insert(rc.resource_name.as_str()) {
            return Err(DpError::InvalidArgument(format!(
                "duplicate resourceName {:?}",
                rc.resource_name
            )));
        }
    }

    debug!(resources = list.resource_list.len(), "resource config parsed");
    Ok(list)
}

/// Read and parse the resource configuration file at `path`.
pub async fn load_resource_config(path: &Path) -> Result<ResourceConfigList, DpError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        DpError::InvalidArgument(format!("cannot read config {}: {e}", path.display()))
    })?;
    parse_resource_config(&raw)
}
