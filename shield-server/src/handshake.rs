use log::{info, warn};

use crate::messages::ServerEvent;
use crate::state::ShieldState;

/// `saver` accepts `victim`'s SOS. The saver gets the victim's record, the
/// victim learns who is coming. Unknown victims are logged and dropped.
/// Returns whether anything was broadcast.
pub fn accept(state: &ShieldState, saver: &str, victim: &str) -> bool {
    let record = match state.registry.get(victim) {
        Ok(rec) => rec.clone(),
        Err(e) => {
            warn!("{} tried to accept SOS of unknown user: {}", saver, e);
            return false;
        }
    };

    state.presence.broadcast(
        saver,
        &ServerEvent::SosAccepted {
            saver: saver.to_string(),
            victim: victim.to_string(),
            victim_record: record,
        },
    );
    state.presence.broadcast(
        victim,
        &ServerEvent::HelperAccepted {
            saver: saver.to_string(),
        },
    );

    info!("{} accepted SOS of {}", saver, victim);
    true
}

/// Logged only; the victim is not told.
pub fn decline(saver: &str, victim: &str) {
    info!("{} declined SOS of {}", saver, victim);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sos;
    use tokio::sync::mpsc;

    fn join(st: &mut ShieldState, conn: &str, identity: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        st.presence.attach(&conn.to_string(), tx);
        st.presence.join(&conn.to_string(), identity);
        rx
    }

    #[test]
    fn accept_notifies_both_parties() {
        let mut st = ShieldState::new();
        st.registry.register("alice", "a@x.com", "555-1").unwrap();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        st.registry.update_location("bob", Some(40.01), Some(-75.01)).unwrap();
        let mut alice = join(&mut st, "c-alice", "alice");
        let mut bob = join(&mut st, "c-bob", "bob");

        sos::raise(&mut st, "alice", "near bridge").unwrap();
        let _ = bob.try_recv();

        assert!(accept(&st, "bob", "alice"));

        match bob.try_recv().unwrap() {
            ServerEvent::SosAccepted { saver, victim, victim_record } => {
                assert_eq!(saver, "bob");
                assert_eq!(victim, "alice");
                assert_eq!(victim_record.lat, Some(40.0));
                assert_eq!(victim_record.lon, Some(-75.0));
                assert!(victim_record.alerting);
                assert_eq!(victim_record.emergency_email.as_deref(), Some("a@x.com"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            alice.try_recv().unwrap(),
            ServerEvent::HelperAccepted { saver: "bob".into() }
        );
        assert!(st.registry.get("alice").unwrap().alerting);
    }

    #[test]
    fn accept_unknown_victim_is_silent() {
        let mut st = ShieldState::new();
        let mut bob = join(&mut st, "c-bob", "bob");
        let mut ghost = join(&mut st, "c-ghost", "ghost");

        assert!(!accept(&st, "bob", "ghost"));
        assert!(bob.try_recv().is_err());
        assert!(ghost.try_recv().is_err());
    }

    #[test]
    fn decline_sends_nothing_and_keeps_alert() {
        let mut st = ShieldState::new();
        st.registry.update_location("alice", Some(40.0), Some(-75.0)).unwrap();
        let mut alice = join(&mut st, "c-alice", "alice");
        sos::raise(&mut st, "alice", "park").unwrap();

        decline("bob", "alice");
        assert!(alice.try_recv().is_err());
        assert!(st.registry.get("alice").unwrap().alerting);
    }
}
