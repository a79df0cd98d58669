use log::info;

use crate::error::{ShieldError, ShieldResult};
use crate::geo::NEARBY_RADIUS_KM;
use crate::mailer::{sos_email, EmailMessage, MailQueue};
use crate::messages::ServerEvent;
use crate::state::{SharedState, ShieldState};

/// Result of a successful SOS trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct SosOutcome {
    /// Identities that were sent an `sos-alert`, nearest first.
    pub notified: Vec<String>,
    pub email_queued: bool,
}

/// Critical-section half of a trigger: mark the victim alerting and fan out
/// to everyone within range. Returns the notified identities and the email
/// to hand off once the lock is released.
pub fn raise(
    state: &mut ShieldState,
    identity: &str,
    location_label: &str,
) -> ShieldResult<(Vec<String>, Option<EmailMessage>)> {
    if identity.trim().is_empty() || location_label.trim().is_empty() {
        return Err(ShieldError::Validation("Missing fields".to_string()));
    }

    let record = state.registry.raise_alert(identity)?;
    let Some(origin) = record.coordinates() else {
        return Err(ShieldError::Precondition(format!(
            "User location data missing to trigger SOS: {}",
            identity
        )));
    };
    let email = sos_email(identity, location_label, record);

    let alert = ServerEvent::SosAlert {
        identity: identity.to_string(),
        location_label: location_label.to_string(),
    };

    let mut notified = Vec::new();
    for helper in state.registry.nearby(&origin, NEARBY_RADIUS_KM, identity) {
        let delivered = state.presence.broadcast(&helper.identity, &alert);
        info!(
            "Notified nearby user {} (Distance: {:.2} km, {} connection(s))",
            helper.identity, helper.distance_km, delivered
        );
        notified.push(helper.identity);
    }

    Ok((notified, email))
}

/// Trigger an SOS for `identity`. Email delivery is queued after the state
/// lock is dropped and never affects the result.
pub async fn trigger(
    state: &SharedState,
    mail: &MailQueue,
    identity: &str,
    location_label: &str,
) -> ShieldResult<SosOutcome> {
    let (notified, email) = {
        let mut st = state.lock().await;
        raise(&mut st, identity, location_label)?
    };

    let email_queued = match email {
        Some(msg) => mail.enqueue(msg),
        None => {
            info!("No emergency email on file for {}; skipping email", identity);
            false
        }
    };

    info!("SOS triggered by {}: {} nearby user(s) notified", identity, notified.len());
    Ok(SosOutcome {
        notified,
        email_queued,
    })
}

/// Stand an alert down (Active -> Idle). The victim's own channel and everyone
/// currently in range get `sos-resolved`. Returns whether an alert was active.
pub fn resolve(state: &mut ShieldState, identity: &str) -> ShieldResult<bool> {
    if identity.trim().is_empty() {
        return Err(ShieldError::Validation("Missing field: username".to_string()));
    }
    let was_active = state.registry.resolve(identity)?;
    if !was_active {
        return Ok(false);
    }

    let event = ServerEvent::SosResolved {
        identity: identity.to_string(),
    };
    state.presence.broadcast(identity, &event);
    if let Some(origin) = state.registry.get(identity)?.coordinates() {
        for helper in state.registry.nearby(&origin, NEARBY_RADIUS_KM, identity) {
            state.presence.broadcast(&helper.identity, &event);
        }
    }
    info!("SOS resolved for {}", identity);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::testing::recording_queue;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    fn join(st: &mut ShieldState, conn: &str, identity: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        st.presence.attach(&conn.to_string(), tx);
        st.presence.join(&conn.to_string(), identity);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn bridge_alert() -> ServerEvent {
        ServerEvent::SosAlert {
            identity: "alice".into(),
            location_label: "near bridge".into(),
        }
    }

    #[test]
    fn alerts_only_helpers_in_range() {
        let mut st = ShieldState::new();
        st.registry.register("alice", "a@x.com", "555-1").unwrap();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("bob", Some(40.01), Some(-75.01)).unwrap();
        st.registry.update_location("carol", Some(41.5), Some(-75.0)).unwrap();
        st.registry.register("dave", "d@x.com", "555-4").unwrap();

        let mut alice = join(&mut st, "c-alice", "alice");
        let mut bob = join(&mut st, "c-bob", "bob");
        let mut carol = join(&mut st, "c-carol", "carol");
        let mut dave = join(&mut st, "c-dave", "dave");

        let (notified, email) = raise(&mut st, "alice", "near bridge").unwrap();

        assert_eq!(notified, vec!["bob".to_string()]);
        assert_eq!(drain(&mut bob), vec![bridge_alert()]);
        assert!(drain(&mut carol).is_empty());
        assert!(drain(&mut dave).is_empty());
        assert!(drain(&mut alice).is_empty());
        assert!(st.registry.get("alice").unwrap().alerting);
        assert_eq!(email.unwrap().to, "a@x.com");
    }

    #[test]
    fn every_device_of_a_helper_gets_exactly_one_alert() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("bob", Some(40.0), Some(-75.0)).unwrap();
        let mut phone = join(&mut st, "c1", "bob");
        let mut laptop = join(&mut st, "c2", "bob");

        raise(&mut st, "alice", "near bridge").unwrap();
        assert_eq!(drain(&mut phone), vec![bridge_alert()]);
        assert_eq!(drain(&mut laptop), vec![bridge_alert()]);
    }

    #[test]
    fn helpers_straddling_the_radius() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("near-edge", Some(40.0449), Some(-75.0)).unwrap();
        st.registry.update_location("past-edge", Some(40.0451), Some(-75.0)).unwrap();
        let mut inside = join(&mut st, "c-in", "near-edge");
        let mut outside = join(&mut st, "c-out", "past-edge");

        let (notified, _) = raise(&mut st, "alice", "near bridge").unwrap();
        assert_eq!(notified, vec!["near-edge".to_string()]);
        assert_eq!(drain(&mut inside), vec![bridge_alert()]);
        assert!(drain(&mut outside).is_empty());
    }

    #[test]
    fn offline_helper_in_range_is_still_counted() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("bob", Some(40.01), Some(-75.01)).unwrap();
        let (notified, email) = raise(&mut st, "alice", "near bridge").unwrap();
        assert_eq!(notified, vec!["bob".to_string()]);
        assert!(email.is_none());
    }

    #[test]
    fn no_location_is_a_precondition_failure_without_broadcasts() {
        let mut st = ShieldState::new();
        st.registry.register("alice", "a@x.com", "555-1").unwrap();
        st.registry.update_location("bob", Some(40.0), Some(-75.0)).unwrap();
        let mut bob = join(&mut st, "c-bob", "bob");

        assert!(matches!(
            raise(&mut st, "alice", "near bridge"),
            Err(ShieldError::Precondition(_))
        ));
        assert!(matches!(
            raise(&mut st, "ghost", "near bridge"),
            Err(ShieldError::Precondition(_))
        ));
        assert!(drain(&mut bob).is_empty());
        assert!(!st.registry.get("alice").unwrap().alerting);
    }

    #[test]
    fn missing_label_is_validation_error() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        assert!(matches!(raise(&mut st, "alice", " "), Err(ShieldError::Validation(_))));
        assert!(!st.registry.get("alice").unwrap().alerting);
    }

    #[tokio::test]
    async fn trigger_succeeds_when_email_fails() {
        let state = Arc::new(Mutex::new(ShieldState::new()));
        let (mail, mut sent) = recording_queue(true);
        {
            let mut st = state.lock().await;
            st.registry.register("alice", "a@x.com", "555-1").unwrap();
            st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
            st.registry.update_location("bob", Some(40.01), Some(-75.01)).unwrap();
        }

        let outcome = trigger(&state, &mail, "alice", "near bridge").await.unwrap();
        assert_eq!(outcome.notified, vec!["bob".to_string()]);
        assert!(outcome.email_queued);

        let msg = sent.recv().await.unwrap();
        assert_eq!(msg.to, "a@x.com");
        assert!(msg.body.contains("near bridge"));
    }

    #[test]
    fn resolve_notifies_victim_and_helpers() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("bob", Some(40.01), Some(-75.01)).unwrap();
        let mut alice = join(&mut st, "c-alice", "alice");
        let mut bob = join(&mut st, "c-bob", "bob");

        assert_eq!(resolve(&mut st, "alice"), Ok(false));
        assert!(drain(&mut bob).is_empty());

        raise(&mut st, "alice", "near bridge").unwrap();
        drain(&mut bob);

        assert_eq!(resolve(&mut st, "alice"), Ok(true));
        let resolved = ServerEvent::SosResolved { identity: "alice".into() };
        assert_eq!(drain(&mut alice), vec![resolved.clone()]);
        assert_eq!(drain(&mut bob), vec![resolved]);
        assert!(!st.registry.get("alice").unwrap().alerting);
    }
}
