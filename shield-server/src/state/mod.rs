pub mod presence;
pub mod registry;

pub use presence::{ConnId, PresenceState};
pub use registry::{ParticipantRecord, Registry};

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;

use crate::mailer::MailQueue;
use crate::messages::ServerEvent;

/// Registry and channel table. Both sit behind one lock so a request or
/// event never observes one of them half-updated relative to the other.
pub struct ShieldState {
    pub registry: Registry,
    pub presence: PresenceState,
}

impl ShieldState {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            presence: PresenceState::new(),
        }
    }

    /// Join `identity`'s channel on `conn_id`. If the identity is locatable,
    /// announce it to every connection with a `user-online` event.
    pub fn announce_presence(&mut self, conn_id: &ConnId, identity: &str) -> Option<ServerEvent> {
        let first_connection = !self.presence.is_online(identity);
        if let Some(previous) = self.presence.join(conn_id, identity) {
            info!("Connection {} moved from {} to {}", conn_id, previous, identity);
        }
        if first_connection {
            info!("{} is online", identity);
        }

        let rec = self.registry.get(identity).ok()?;
        let coords = rec.coordinates()?;
        let online = ServerEvent::UserOnline {
            identity: identity.to_string(),
            lat: coords.lat,
            lon: coords.lon,
            alerting: rec.alerting,
        };
        self.presence.broadcast_all(&online);
        Some(online)
    }

    /// Drop all volatile state; open sockets see their outbound channel close.
    pub fn teardown(&mut self) {
        info!(
            "Tearing down state ({} participants known)",
            self.registry.len()
        );
        self.presence.clear();
        self.registry.clear();
    }
}

pub type SharedState = Arc<Mutex<ShieldState>>;

/// Everything a request handler needs.
pub struct AppState {
    pub shield: SharedState,
    pub mail: MailQueue,
    pub frontend_dir: PathBuf,
}

impl AppState {
    pub fn new(mail: MailQueue, frontend_dir: PathBuf) -> Self {
        Self {
            shield: Arc::new(Mutex::new(ShieldState::new())),
            mail,
            frontend_dir,
        }
    }
}
