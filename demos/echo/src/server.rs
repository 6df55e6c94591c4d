//! Echo server loop.

use tether_net::transport::TransportEvents;
use tether_net::{Reliability, TransportEvent, TransportHandle};
use tracing::{debug, info, warn};

/// Echo payloads until both event streams close.
pub async fn serve(handle: TransportHandle, mut events: TransportEvents) {
    loop {
        tokio::select! {
            payload = events.payloads.recv() => {
                let Some(payload) = payload else { break };
                debug!(id = %payload.id, len = payload.payload.len(), "echo");
                if let Err(err) = handle.send(payload.id, payload.payload, Reliability::Reliable) {
                    warn!(id = %payload.id, %err, "echo failed");
                }
            }
            event = events.lifecycle.recv() => {
                let Some(event) = event else { break };
                match event {
                    TransportEvent::Connected { id, peer } => info!(%id, %peer, "client connected"),
                    TransportEvent::Disconnected { id, peer, reason, .. } => {
                        info!(%id, %peer, %reason, "client disconnected");
                    }
                    other => warn!(event = ?other, "transport event"),
                }
            }
        }
    }
    info!("echo server stopped");
}
