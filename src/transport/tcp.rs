//! TCP sockets backed by mio.
//!
//! One [`TcpTransportSocket`] owns an optional listener plus every stream
//! accepted by it or opened through it, keyed by peer address. All streams
//! share the socket's reactor token: the reactor drains every socket on every
//! tick, so the token only has to wake it.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, info, trace, warn};

use super::socket::{Received, SocketError, SocketMode, TransportSocket};

/// Bytes read from one stream per `read` call.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Unsent bytes buffered per stream before new frames are refused.
pub const MAX_PENDING_WRITE: usize = 1 << 20;

#[derive(Debug)]
struct StreamEntry {
    stream: TcpStream,
    connected: bool,
    pending: BytesMut,
}

impl StreamEntry {
    fn new(stream: TcpStream, connected: bool) -> Self {
        Self {
            stream,
            connected,
            pending: BytesMut::new(),
        }
    }

    /// Finish a non-blocking connect. `Ok(false)` while still in progress.
    fn poll_connected(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Write as much of the pending buffer as the OS takes.
    fn write_pending(&mut self) -> io::Result<()> {
        if !self.poll_connected()? {
            return Ok(());
        }
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.pending.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// TCP listener and its streams.
#[derive(Debug)]
pub struct TcpTransportSocket {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    streams: HashMap<SocketAddr, StreamEntry>,
    registration: Option<(Registry, Token)>,
    ready: VecDeque<Result<Received, SocketError>>,
    read_buffer: Vec<u8>,
    max_streams: usize,
}

impl TcpTransportSocket {
    /// Listen on `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            local_addr,
            streams: HashMap::new(),
            registration: None,
            ready: VecDeque::new(),
            read_buffer: vec![0u8; READ_CHUNK_SIZE],
            max_streams: usize::MAX,
        })
    }

    /// Open an outbound stream to `peer` without a listener.
    ///
    /// The connect completes in the background; frames sent before then are
    /// buffered.
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(peer)?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let mut streams = HashMap::new();
        streams.insert(peer, StreamEntry::new(stream, false));
        Ok(Self {
            listener: None,
            local_addr,
            streams,
            registration: None,
            ready: VecDeque::new(),
            read_buffer: vec![0u8; READ_CHUNK_SIZE],
            max_streams: usize::MAX,
        })
    }

    /// Number of open streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn register_stream(&self, stream: &mut TcpStream) -> io::Result<()> {
        if let Some((registry, token)) = &self.registration {
            registry.register(stream, *token, Interest::READABLE | Interest::WRITABLE)?;
        }
        Ok(())
    }

    fn drop_stream(&mut self, peer: SocketAddr) {
        if let Some(mut entry) = self.streams.remove(&peer) {
            if let Some((registry, _)) = &self.registration {
                let _ = registry.deregister(&mut entry.stream);
            }
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
    }

    fn accept_pending(&mut self) -> Result<(), SocketError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => accepted.push((stream, peer)),
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        warn!(?err, local_addr = %self.local_addr, "transient accept error");
                        continue;
                    }
                    _ => return Err(SocketError::Fatal(err)),
                },
            }
        }

        for (mut stream, peer) in accepted {
            if self.streams.len() >= self.max_streams && !self.streams.contains_key(&peer) {
                debug!(local_addr = %self.local_addr, %peer, open = self.streams.len(), "stream limit reached, refusing");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, ?err, "set_nodelay failed");
            }
            if let Err(err) = self.register_stream(&mut stream) {
                warn!(%peer, ?err, "failed to register accepted stream");
                continue;
            }
            info!(local_addr = %self.local_addr, %peer, "accepted tcp stream");
            if let Some(mut old) = self.streams.insert(peer, StreamEntry::new(stream, true)) {
                if let Some((registry, _)) = &self.registration {
                    let _ = registry.deregister(&mut old.stream);
                }
            }
        }
        Ok(())
    }

    /// Read every stream until it would block, queueing chunks and errors.
    fn read_streams(&mut self) {
        let mut closed = Vec::new();
        for (peer, entry) in &mut self.streams {
            match entry.poll_connected() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    self.ready.push_back(Err(SocketError::from_peer_io(err, *peer)));
                    closed.push(*peer);
                    continue;
                }
            }
            loop {
                match entry.stream.read(&mut self.read_buffer) {
                    Ok(0) => {
                        debug!(peer = %peer, "tcp stream closed by peer");
                        self.ready
                            .push_back(Err(SocketError::ConnectionReset { peer: Some(*peer) }));
                        closed.push(*peer);
                        break;
                    }
                    Ok(n) => {
                        trace!(peer = %peer, len = n, "tcp recv");
                        self.ready.push_back(Ok(Received {
                            peer: *peer,
                            data: Bytes::copy_from_slice(&self.read_buffer[..n]),
                        }));
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.ready.push_back(Err(SocketError::from_peer_io(err, *peer)));
                        closed.push(*peer);
                        break;
                    }
                }
            }
        }
        for peer in closed {
            self.drop_stream(peer);
        }
    }

    fn open_stream(&mut self, peer: SocketAddr) -> Result<(), SocketError> {
        let mut stream =
            TcpStream::connect(peer).map_err(|err| SocketError::from_peer_io(err, peer))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, ?err, "set_nodelay failed");
        }
        self.register_stream(&mut stream)
            .map_err(|err| SocketError::from_peer_io(err, peer))?;
        debug!(%peer, "opening tcp stream");
        self.streams.insert(peer, StreamEntry::new(stream, false));
        Ok(())
    }
}

impl TransportSocket for TcpTransportSocket {
    fn mode(&self) -> SocketMode {
        SocketMode::Stream
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn try_send(&mut self, peer: SocketAddr, frame: &[u8]) -> Result<usize, SocketError> {
        if !self.streams.contains_key(&peer) {
            self.open_stream(peer)?;
        }
        let Some(entry) = self.streams.get_mut(&peer) else {
            return Err(SocketError::ConnectionReset { peer: Some(peer) });
        };
        // Whole frames only, so the stream never carries a partial packet.
        if entry.pending.len() + frame.len() > MAX_PENDING_WRITE {
            return Err(SocketError::WouldBlock);
        }
        entry.pending.extend_from_slice(frame);
        match entry.write_pending() {
            Ok(()) => Ok(frame.len()),
            Err(err) => {
                self.drop_stream(peer);
                Err(SocketError::from_peer_io(err, peer))
            }
        }
    }

    fn try_receive(&mut self) -> Result<Option<Received>, SocketError> {
        if self.ready.is_empty() {
            self.accept_pending()?;
            self.read_streams();
        }
        match self.ready.pop_front() {
            Some(Ok(received)) => Ok(Some(received)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        if let Some(listener) = &mut self.listener {
            registry.register(listener, token, Interest::READABLE)?;
        }
        for entry in self.streams.values_mut() {
            registry.register(
                &mut entry.stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?;
        }
        self.registration = Some((registry.try_clone()?, token));
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        if let Some(listener) = &mut self.listener {
            registry.deregister(listener)?;
        }
        for entry in self.streams.values_mut() {
            let _ = registry.deregister(&mut entry.stream);
        }
        self.registration = None;
        Ok(())
    }

    fn flush(&mut self) {
        let mut failed = Vec::new();
        for (peer, entry) in &mut self.streams {
            if entry.pending.is_empty() {
                continue;
            }
            if let Err(err) = entry.write_pending() {
                self.ready.push_back(Err(SocketError::from_peer_io(err, *peer)));
                failed.push(*peer);
            }
        }
        for peer in failed {
            self.drop_stream(peer);
        }
    }

    fn close_peer(&mut self, peer: SocketAddr) {
        if let Some(entry) = self.streams.get_mut(&peer) {
            // Best effort: a goodbye frame may still be buffered.
            let _ = entry.write_pending();
        }
        self.drop_stream(peer);
        // Chunks already read from the stream must not outlive it.
        self.ready.retain(|item| match item {
            Ok(received) => received.peer != peer,
            Err(err) => err.peer() != Some(peer),
        });
    }

    fn open_peers(&self) -> Vec<SocketAddr> {
        self.streams.keys().copied().collect()
    }

    fn limit_peers(&mut self, max: usize) {
        self.max_streams = max;
    }
}
