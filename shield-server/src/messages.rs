use serde::{Deserialize, Serialize};

use crate::state::ParticipantRecord;

// ============================================
// WebSocket Messages
// ============================================

/// Frames a client may send over the realtime channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join the channel for `identity` on this connection.
    RegisterPresence { identity: String },
    /// `saver` agrees to help `victim`.
    AcceptSos { saver: String, victim: String },
    DeclineSos { saver: String, victim: String },
    /// Victim (or someone on their behalf) stands the alert down.
    ResolveSos { identity: String },
}

/// Frames the server pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Someone within range triggered an SOS.
    SosAlert {
        identity: String,
        location_label: String,
    },
    /// Sent to the helper after accepting; carries the victim's last known state.
    SosAccepted {
        saver: String,
        victim: String,
        victim_record: ParticipantRecord,
    },
    /// Sent to the victim when a helper accepts.
    HelperAccepted { saver: String },
    /// Global presence update, no distance filter.
    UserOnline {
        identity: String,
        lat: f64,
        lon: f64,
        alerting: bool,
    },
    SosResolved { identity: String },
    Error { message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SosAlert { .. } => "sos-alert",
            ServerEvent::SosAccepted { .. } => "sos-accepted",
            ServerEvent::HelperAccepted { .. } => "helper-accepted",
            ServerEvent::UserOnline { .. } => "user-online",
            ServerEvent::SosResolved { .. } => "sos-resolved",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_frames() {
        let msg: ClientEvent =
            serde_json::from_str(r#"{"type":"register-presence","identity":"alice"}"#).unwrap();
        assert_eq!(msg, ClientEvent::RegisterPresence { identity: "alice".into() });

        let msg: ClientEvent =
            serde_json::from_str(r#"{"type":"accept-sos","saver":"bob","victim":"alice"}"#).unwrap();
        assert_eq!(
            msg,
            ClientEvent::AcceptSos { saver: "bob".into(), victim: "alice".into() }
        );

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"offer"}"#).is_err());
    }

    #[test]
    fn sos_alert_wire_shape() {
        let ev = ServerEvent::SosAlert {
            identity: "alice".into(),
            location_label: "near bridge".into(),
        };
        assert_eq!(ev.name(), "sos-alert");
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "sos-alert", "identity": "alice", "locationLabel": "near bridge"})
        );
    }

    #[test]
    fn sos_accepted_embeds_victim_record() {
        let mut record = ParticipantRecord::default();
        record.lat = Some(40.0);
        record.lon = Some(-75.0);
        record.alerting = true;
        let ev = ServerEvent::SosAccepted {
            saver: "bob".into(),
            victim: "alice".into(),
            victim_record: record,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "sos-accepted");
        assert_eq!(v["victimRecord"]["lat"], 40.0);
        assert_eq!(v["victimRecord"]["lon"], -75.0);
        assert_eq!(v["victimRecord"]["alerting"], true);
    }
}
