//! Echo client: connect, send numbered messages, log the echoes.

use std::net::SocketAddr;
use std::time::Duration;

use tether_net::transport::{SocketKind, TransportEvents};
use tether_net::{DisconnectReason, Reliability, TransportEvent, TransportHandle};
use tracing::{error, info, warn};

const SEND_INTERVAL: Duration = Duration::from_millis(500);

/// Run one echo session against `server`.
pub async fn run(
    handle: TransportHandle,
    mut events: TransportEvents,
    server: SocketAddr,
    kind: SocketKind,
    count: u32,
) {
    let id = match handle.connect(server, kind) {
        Ok(id) => id,
        Err(err) => {
            error!(%server, %err, "connect failed");
            return;
        }
    };
    info!(%id, %server, %kind, "connecting");

    let mut connected = false;
    let mut sent = 0u32;
    let mut echoed = 0u32;
    let mut ticker = tokio::time::interval(SEND_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick(), if connected && sent < count => {
                sent += 1;
                let message = format!("echo #{sent}");
                if let Err(err) = handle.send(id, message.into_bytes(), Reliability::Reliable) {
                    warn!(%id, %err, "send failed");
                }
            }
            payload = events.payloads.recv() => {
                let Some(payload) = payload else { break };
                echoed += 1;
                info!(%id, echo = %String::from_utf8_lossy(&payload.payload), "received");
                if echoed >= count {
                    handle.disconnect(id, DisconnectReason::Requested);
                }
            }
            event = events.lifecycle.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::Connected { peer, .. } => {
                        info!(%id, %peer, "connected");
                        connected = true;
                    }
                    TransportEvent::Disconnected { reason, error, .. } => {
                        match error {
                            Some(err) => warn!(%id, %reason, %err, "disconnected"),
                            None => info!(%id, %reason, "disconnected"),
                        }
                        break;
                    }
                    other => warn!(event = ?other, "transport event"),
                }
            }
        }
    }
    info!(sent, echoed, "echo client finished");
}
