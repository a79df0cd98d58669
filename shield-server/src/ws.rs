use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper_tungstenite::tungstenite::Message;
use log::{error, info, warn};

use crate::error::{ShieldError, ShieldResult};
use crate::handshake;
use crate::messages::{ClientEvent, ServerEvent};
use crate::sos;
use crate::state::{AppState, ConnId};

// ============================================
// WebSocket Connection Handler
// ============================================

pub async fn handle_connection(
    ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    addr: SocketAddr,
    app: Arc<AppState>,
) {
    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();
    info!("User connected: {} ({})", conn_id, addr);

    let (mut ws_sender, mut ws_receiver) = ws.split();

    // The presence table holds the only sender, so dropping it there
    // (disconnect or teardown) ends the writer task.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();
    app.shield.lock().await.presence.attach(&conn_id, tx);

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize {}: {}", event.name(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Pings are answered by tungstenite itself.
    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(msg) => handle_message(msg, &conn_id, &app).await,
                            Err(e) => Err(ShieldError::Validation(format!("Invalid message format: {}", e))),
                        };
                        if let Err(e) = outcome {
                            warn!("Error handling message from {}: {}", conn_id, e);
                            let reply = ServerEvent::Error { message: e.to_string() };
                            app.shield.lock().await.presence.send_to(&conn_id, reply);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", conn_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut send_task => {
                break;
            }
        }
    }

    // Leaving the channel is automatic on disconnect.
    {
        let mut st = app.shield.lock().await;
        match st.presence.detach(&conn_id) {
            Some(identity) => info!(
                "User disconnected: {} (was {}, {} connection(s) left)",
                conn_id,
                identity,
                st.presence.connection_count(&identity)
            ),
            None => info!("User disconnected: {}", conn_id),
        }
    }

    send_task.abort();
}

pub async fn handle_message(msg: ClientEvent, conn_id: &ConnId, app: &AppState) -> ShieldResult<()> {
    match msg {
        ClientEvent::RegisterPresence { identity } => {
            if identity.trim().is_empty() {
                return Err(ShieldError::Validation("Missing field: identity".to_string()));
            }
            let mut st = app.shield.lock().await;
            st.announce_presence(conn_id, &identity);
            info!("Registered user via socket and joined channel: {}", identity);
            Ok(())
        }
        ClientEvent::AcceptSos { saver, victim } => {
            let st = app.shield.lock().await;
            handshake::accept(&st, &saver, &victim);
            Ok(())
        }
        ClientEvent::DeclineSos { saver, victim } => {
            handshake::decline(&saver, &victim);
            Ok(())
        }
        ClientEvent::ResolveSos { identity } => {
            let mut st = app.shield.lock().await;
            sos::resolve(&mut st, &identity)?;
            Ok(())
        }
    }
}
