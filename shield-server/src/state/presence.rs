use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::messages::ServerEvent;

pub type ConnId = String;

/// Outbound half of a connection. The socket writer task owns the receiver.
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

/// Per-identity channel membership (identity <-> live connections).
pub struct PresenceState {
    /// Every live connection, joined or not.
    sinks: HashMap<ConnId, EventSink>,
    /// conn_id -> identity it has announced
    presence_conns: HashMap<ConnId, String>,
    /// identity -> conn_ids currently joined under it
    presence_users: HashMap<String, HashSet<ConnId>>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            presence_conns: HashMap::new(),
            presence_users: HashMap::new(),
        }
    }

    /// Register the outbound sink for a freshly accepted connection.
    pub fn attach(&mut self, conn_id: &ConnId, sink: EventSink) {
        self.sinks.insert(conn_id.clone(), sink);
    }

    /// Connection closed: leave its channel and drop the sink.
    pub fn detach(&mut self, conn_id: &ConnId) -> Option<String> {
        self.sinks.remove(conn_id);
        self.leave(conn_id)
    }

    /// Join `identity`'s channel. A connection belongs to one channel at a time,
    /// so joining again moves it. Returns the identity it left, if any.
    pub fn join(&mut self, conn_id: &ConnId, identity: &str) -> Option<String> {
        if self.identity_of(conn_id) == Some(identity) {
            return None;
        }
        let previous = self.leave(conn_id);

        self.presence_conns.insert(conn_id.clone(), identity.to_string());
        self.presence_users
            .entry(identity.to_string())
            .or_insert_with(HashSet::new)
            .insert(conn_id.clone());
        previous
    }

    /// Remove the connection from whatever channel it is in.
    pub fn leave(&mut self, conn_id: &ConnId) -> Option<String> {
        let identity = self.presence_conns.remove(conn_id)?;
        if let Some(conns) = self.presence_users.get_mut(&identity) {
            conns.remove(conn_id);
            if conns.is_empty() {
                self.presence_users.remove(&identity);
            }
        }
        Some(identity)
    }

    pub fn identity_of(&self, conn_id: &ConnId) -> Option<&str> {
        self.presence_conns.get(conn_id).map(String::as_str)
    }

    pub fn connection_count(&self, identity: &str) -> usize {
        self.presence_users.get(identity).map_or(0, HashSet::len)
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.connection_count(identity) > 0
    }

    /// Deliver to every connection joined under `identity`. Returns how many
    /// sinks accepted the event; zero when nobody is connected.
    pub fn broadcast(&self, identity: &str, event: &ServerEvent) -> usize {
        let Some(conns) = self.presence_users.get(identity) else {
            return 0;
        };

        conns
            .iter()
            .filter_map(|conn_id| self.sinks.get(conn_id))
            .filter(|sink| sink.send(event.clone()).is_ok())
            .count()
    }

    /// Deliver to every attached connection, joined or not.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        self.sinks
            .values()
            .filter(|sink| sink.send(event.clone()).is_ok())
            .count()
    }

    /// Send to a single connection (replies such as protocol errors).
    pub fn send_to(&self, conn_id: &ConnId, event: ServerEvent) -> bool {
        self.sinks
            .get(conn_id)
            .map_or(false, |sink| sink.send(event).is_ok())
    }

    /// Drop every sink and membership; writer tasks see their channel close.
    pub fn clear(&mut self) {
        self.sinks.clear();
        self.presence_conns.clear();
        self.presence_users.clear();
    }
}
