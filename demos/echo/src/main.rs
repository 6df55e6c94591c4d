//! Tether echo demo.
//!
//! The server echoes every payload back on the reliable channel. The client
//! connects, sends a numbered message every interval, and logs the echoes.
//!
//! Environment variables:
//! - TETHER_MODE: "server" or "client" (default server)
//! - TETHER_BIND_ADDR: listen address (server only, default 0.0.0.0:19999)
//! - TETHER_SERVER_ADDR: server address (client only, default 127.0.0.1:19999)
//! - TETHER_SOCKET: "udp" or "tcp" (default udp)
//! - TETHER_COUNT: messages the client sends before disconnecting (default 10)
//! - TETHER_LOG_LEVEL: trace|debug|info|warn|error (default info)

mod client;
mod server;

use std::net::SocketAddr;
use std::thread;

use tether_net::transport::SocketKind;
use tether_net::{Transport, TransportConfig, TransportHandle};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::util::SubscriberInitExt;

/// Demo failures.
#[derive(Debug, Error)]
pub enum DemoError {
    /// An environment variable has an unusable value.
    #[error("invalid {name}: {value}")]
    Env {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// Transport setup failed.
    #[error(transparent)]
    Transport(#[from] tether_net::TransportError),

    /// The reactor thread died.
    #[error("reactor thread panicked")]
    Reactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Server,
    Client,
}

#[derive(Debug)]
struct Settings {
    mode: Mode,
    bind: SocketAddr,
    server: SocketAddr,
    kind: SocketKind,
    count: u32,
}

fn var(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, DemoError> {
    let value = var(name, default);
    value.parse().map_err(|_| DemoError::Env { name, value })
}

impl Settings {
    fn from_env() -> Result<Self, DemoError> {
        let mode = match var("TETHER_MODE", "server").as_str() {
            "server" => Mode::Server,
            "client" => Mode::Client,
            other => {
                return Err(DemoError::Env {
                    name: "TETHER_MODE",
                    value: other.to_string(),
                });
            }
        };
        let kind = match var("TETHER_SOCKET", "udp").as_str() {
            "udp" => SocketKind::Udp,
            "tcp" => SocketKind::Tcp,
            other => {
                return Err(DemoError::Env {
                    name: "TETHER_SOCKET",
                    value: other.to_string(),
                });
            }
        };
        Ok(Self {
            mode,
            bind: parse("TETHER_BIND_ADDR", "0.0.0.0:19999")?,
            server: parse("TETHER_SERVER_ADDR", "127.0.0.1:19999")?,
            kind,
            count: parse("TETHER_COUNT", "10")?,
        })
    }
}

fn setup_log() {
    let level = var("TETHER_LOG_LEVEL", "info");
    let _ = SubscriberBuilder::default()
        .with_env_filter(EnvFilter::new(level))
        .finish()
        .try_init();
}

/// Run the reactor on its own thread until a handle asks it to stop.
fn spawn_reactor(mut transport: Transport) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(err) = transport.run() {
            error!(%err, "reactor stopped");
        }
    })
}

async fn shutdown_on_ctrl_c(handle: TransportHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupted, shutting down");
        handle.shutdown();
    }
}

#[tokio::main]
async fn main() {
    setup_log();
    if let Err(err) = run().await {
        error!(%err, "tether-echo failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DemoError> {
    let settings = Settings::from_env()?;
    let (mut transport, events) = Transport::new(TransportConfig::default())?;
    let handle = transport.handle();

    match settings.mode {
        Mode::Server => {
            let listener = transport
                .listen(settings.bind, settings.kind)
                .map_err(tether_net::TransportError::from)?;
            info!(addr = %listener.local_addr(), kind = %settings.kind, "echo server listening");
            let reactor = spawn_reactor(transport);
            tokio::spawn(shutdown_on_ctrl_c(handle.clone()));
            server::serve(handle, events).await;
            reactor.join().map_err(|_| DemoError::Reactor)?;
        }
        Mode::Client => {
            let reactor = spawn_reactor(transport);
            tokio::spawn(shutdown_on_ctrl_c(handle.clone()));
            client::run(handle.clone(), events, settings.server, settings.kind, settings.count)
                .await;
            handle.shutdown();
            reactor.join().map_err(|_| DemoError::Reactor)?;
        }
    }
    Ok(())
}
