use std::collections::HashSet;

use hive_protocol::Device;

use crate::session::{Connection, SessionState};
use crate::store::DataContext;

/// Whether the user session on `connection` may see `device` under the
/// access-key permission `action`.
///
/// Administrators see every device, clients only devices in one of their
/// networks. An access key narrows this by action, host, network and device.
pub fn is_device_accessible(
    store: &dyn DataContext,
    connection: &Connection,
    session: &SessionState,
    device: &Device,
    action: &str,
) -> bool {
    let Some(user) = session.user() else {
        return false;
    };

    if !user.is_admin() {
        let Some(network_id) = device.network_id else {
            return false;
        };
        let networks = connection.user_networks(|| match store.users().get(user.id) {
            Ok(Some(stored)) => stored.network_ids.into_iter().collect(),
            Ok(None) => HashSet::new(),
            Err(e) => {
                tracing::error!(user = user.id, "failed to load user networks: {e}");
                HashSet::new()
            }
        });
        if !networks.contains(&network_id) {
            return false;
        }
    }

    match session.access_key() {
        None => true,
        Some(key) => key
            .permissions_for(action, connection.host())
            .any(|p| {
                p.is_network_allowed(device.network_id.unwrap_or(0)) && p.is_device_allowed(&device.guid)
            }),
    }
}
