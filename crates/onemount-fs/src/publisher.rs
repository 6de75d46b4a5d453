//! D-Bus status publisher
//!
//! Emits a `StatusChanged(id, path, status)` signal on the session bus for
//! desktop integrations (file-manager emblems, tray indicators). Entirely
//! optional: when no session bus is reachable the engine falls back to the
//! no-op publisher and the xattr contract alone.

use tracing::{debug, warn};
use zbus::Connection;

use onemount_core::domain::{FileStatus, ItemId};
use onemount_core::ports::IStatusPublisher;

/// Bus path the signals are emitted on.
const OBJECT_PATH: &str = "/org/onemount/Status";

/// Interface name of the signal.
const INTERFACE: &str = "org.onemount.Status";

/// Session-bus status publisher.
pub struct DbusPublisher {
    connection: Connection,
}

impl DbusPublisher {
    /// Connects to the session bus.
    pub async fn connect() -> anyhow::Result<Self> {
        let connection = Connection::session().await?;
        debug!("status publisher connected to session bus");
        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl IStatusPublisher for DbusPublisher {
    async fn publish(&self, id: &ItemId, path: &str, status: &FileStatus) {
        let result = self
            .connection
            .emit_signal(
                None::<zbus::names::BusName<'_>>,
                OBJECT_PATH,
                INTERFACE,
                "StatusChanged",
                &(id.as_str(), path, status.to_string().as_str()),
            )
            .await;
        if let Err(e) = result {
            // never let the desktop surface stall the engine
            warn!(id = %id, error = %e, "status signal emission failed");
        }
    }
}
