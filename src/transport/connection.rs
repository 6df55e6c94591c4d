//! Per-peer connection state machine.
//!
//! ```text
//! Connecting ──handshake ok──▶ Connected ──disconnect──▶ Disconnecting ──▶ Closed
//!     │                                                                      ▲
//!     └────────── timeout / rejection / version mismatch ────────────────────┘
//! ```
//!
//! A [`ConnectionState`] never touches a socket. Handlers queue outbound
//! packets in an outbox and delivered payloads in an inbox; the multiplexer
//! drains both once per tick. All time comes in as an argument, so a state
//! machine can be driven entirely by a test clock.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::reliable::{AckOutcome, ReorderBuffer, RetransmitQueue};
use super::socket::SocketId;
use super::table::ConnectionId;
use super::timing::{RttEstimator, backoff};
use crate::codec::packet::{handshake_payload, parse_handshake_payload};
use crate::codec::{PacketHeader, PacketType, SequenceNumber};
use crate::core::TransportConfig;
use crate::core::error::{ConnectError, DisconnectReason, SendError};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete, data flows.
    Connected,
    /// Goodbye queued; becomes `Closed` in the same step.
    Disconnecting,
    /// Terminal. Removed from the table at the end of the tick.
    Closed,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the handshake.
    Initiator,
    /// Answered a handshake.
    Responder,
}

/// Delivery guarantee for one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Fire and forget; stale packets are dropped.
    #[default]
    Unreliable,
    /// Acknowledged, retransmitted, delivered in order.
    Reliable,
}

/// A packet waiting to be encoded and written to the socket.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// Header; its length field is filled in by the codec.
    pub header: PacketHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets queued for sending (including retransmissions).
    pub packets_sent: u64,
    /// Valid packets received.
    pub packets_received: u64,
    /// Payload bytes queued for sending.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Reliable retransmissions.
    pub retransmits: u64,
    /// Duplicate or stale Data packets dropped.
    pub duplicates: u64,
    /// Reliable sequences skipped because they fell out of the reorder window.
    pub lost: u64,
    /// Malformed packets attributed to this peer.
    pub malformed: u32,
    /// Payloads handed to the application.
    pub delivered: u64,
}

/// Copied snapshot of one connection, safe to hand to any thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Socket carrying the connection.
    pub socket: SocketId,
    /// Remote address.
    pub peer: SocketAddr,
    /// Lifecycle state.
    pub phase: ConnectionPhase,
    /// Which side opened it.
    pub role: Role,
    /// Smoothed RTT, once measured.
    pub srtt: Option<Duration>,
    /// RTT variance, once measured.
    pub rttvar: Option<Duration>,
    /// Current retransmission timeout.
    pub rto: Duration,
    /// Reliable packets awaiting acknowledgment.
    pub in_flight: usize,
    /// Reliable payloads waiting for window space.
    pub queued: usize,
    /// Counters.
    pub stats: ConnectionStats,
}

#[derive(Debug, Clone, Copy)]
struct HandshakeTimer {
    attempts: u32,
    first_sent: Instant,
    last_sent: Instant,
    rto: Duration,
}

/// State of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    socket: SocketId,
    peer: SocketAddr,
    role: Role,
    phase: ConnectionPhase,
    close_reason: Option<DisconnectReason>,
    close_error: Option<ConnectError>,
    config: Arc<TransportConfig>,

    last_received: Instant,
    last_sent: Instant,
    /// Something was queued since `last_sent` was stamped.
    sent_since_tick: bool,
    last_keep_alive: Option<Instant>,
    handshake: Option<HandshakeTimer>,

    next_unreliable: SequenceNumber,
    last_unreliable: Option<SequenceNumber>,
    next_reliable: SequenceNumber,
    retransmit: RetransmitQueue,
    backlog: VecDeque<Bytes>,
    reorder: ReorderBuffer,
    rtt: RttEstimator,

    stats: ConnectionStats,
    outbox: Vec<OutboundPacket>,
    inbox: Vec<Bytes>,
    just_connected: bool,
}

impl ConnectionState {
    fn new(
        id: ConnectionId,
        socket: SocketId,
        peer: SocketAddr,
        role: Role,
        config: Arc<TransportConfig>,
        now: Instant,
    ) -> Self {
        let window = config.reorder_window;
        let rtt = RttEstimator::new(config.initial_rto);
        Self {
            id,
            socket,
            peer,
            role,
            phase: ConnectionPhase::Connecting,
            close_reason: None,
            close_error: None,
            config,
            last_received: now,
            last_sent: now,
            sent_since_tick: false,
            last_keep_alive: None,
            handshake: None,
            next_unreliable: SequenceNumber::ZERO,
            last_unreliable: None,
            next_reliable: SequenceNumber::ZERO,
            retransmit: RetransmitQueue::new(window),
            backlog: VecDeque::new(),
            reorder: ReorderBuffer::new(window),
            rtt,
            stats: ConnectionStats::default(),
            outbox: Vec::new(),
            inbox: Vec::new(),
            just_connected: false,
        }
    }

    /// Open a connection to `peer`; the first handshake is queued at once.
    pub fn outbound(
        id: ConnectionId,
        socket: SocketId,
        peer: SocketAddr,
        config: Arc<TransportConfig>,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(id, socket, peer, Role::Initiator, config, now);
        let rto = conn.rtt.rto();
        conn.handshake = Some(HandshakeTimer {
            attempts: 1,
            first_sent: now,
            last_sent: now,
            rto,
        });
        conn.queue_handshake(1);
        conn.sent_since_tick = false;
        conn
    }

    /// State for a peer whose handshake just arrived. Feed the handshake to
    /// [`on_handshake`](Self::on_handshake) next.
    pub fn inbound(
        id: ConnectionId,
        socket: SocketId,
        peer: SocketAddr,
        config: Arc<TransportConfig>,
        now: Instant,
    ) -> Self {
        Self::new(id, socket, peer, Role::Responder, config, now)
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Socket the connection lives on.
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Which side opened the connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Check if the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.phase == ConnectionPhase::Closed
    }

    /// Why the connection closed.
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason
    }

    /// Take the handshake failure, if the connection ended with one.
    pub fn take_close_error(&mut self) -> Option<ConnectError> {
        self.close_error.take()
    }

    /// Counters.
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Copied snapshot.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            socket: self.socket,
            peer: self.peer,
            phase: self.phase,
            role: self.role,
            srtt: self.rtt.srtt(),
            rttvar: self.rtt.rttvar(),
            rto: self.rtt.rto(),
            in_flight: self.retransmit.len(),
            queued: self.backlog.len(),
            stats: self.stats,
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Dispatch one decoded packet.
    pub fn receive(&mut self, now: Instant, header: PacketHeader, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        self.last_received = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += payload.len() as u64;

        match header.packet_type {
            PacketType::Handshake => self.on_handshake(header, &payload),
            PacketType::HandshakeAck => self.on_handshake_ack(now, &payload),
            PacketType::Data => {
                if header.flags.is_reliable() {
                    self.on_reliable_data(header.sequence, payload);
                } else {
                    self.on_unreliable_data(header.sequence, payload);
                }
            }
            PacketType::Ack => self.on_ack(now, header.sequence),
            PacketType::KeepAlive => trace!(id = %self.id, "keep-alive received"),
            PacketType::Disconnect => self.on_disconnect(header.flags.as_byte()),
        }
    }

    /// Handshake from the peer: check the version, answer with an ack.
    ///
    /// Repeated handshakes (our ack was lost) are answered again.
    pub fn on_handshake(&mut self, header: PacketHeader, payload: &[u8]) {
        if self.role != Role::Responder {
            debug!(id = %self.id, peer = %self.peer, "ignoring handshake on outbound connection");
            return;
        }
        let Some(remote) = parse_handshake_payload(payload) else {
            self.on_malformed();
            return;
        };
        let local = self.config.protocol_version;

        // The ack tells the initiator our version either way.
        self.push(
            PacketHeader::handshake_ack(header.sequence),
            Bytes::copy_from_slice(&handshake_payload(local)),
        );

        if remote != local {
            warn!(id = %self.id, peer = %self.peer, local, remote, "protocol version mismatch");
            self.close_error = Some(ConnectError::VersionMismatch { local, remote });
            self.disconnect(DisconnectReason::VersionMismatch);
            return;
        }

        if self.phase == ConnectionPhase::Connecting {
            self.phase = ConnectionPhase::Connected;
            self.just_connected = true;
            info!(id = %self.id, peer = %self.peer, "connection accepted");
        }
    }

    /// Handshake ack from the peer: the initiator's connection is up.
    pub fn on_handshake_ack(&mut self, now: Instant, payload: &[u8]) {
        if self.role != Role::Initiator || self.phase != ConnectionPhase::Connecting {
            return;
        }
        let Some(remote) = parse_handshake_payload(payload) else {
            self.on_malformed();
            return;
        };
        let local = self.config.protocol_version;
        if remote != local {
            warn!(id = %self.id, peer = %self.peer, local, remote, "protocol version mismatch");
            self.close_error = Some(ConnectError::VersionMismatch { local, remote });
            self.disconnect(DisconnectReason::VersionMismatch);
            return;
        }

        if let Some(timer) = self.handshake.take() {
            // Karn: only an unambiguous round trip is a sample.
            if timer.attempts == 1 {
                self.rtt.update(now.saturating_duration_since(timer.first_sent));
            }
        }
        self.phase = ConnectionPhase::Connected;
        self.just_connected = true;
        info!(id = %self.id, peer = %self.peer, srtt = ?self.rtt.srtt(), "connection established");
    }

    /// Reliable Data: ack it, then deliver whatever is now in order.
    pub fn on_reliable_data(&mut self, sequence: SequenceNumber, payload: Bytes) {
        if self.phase != ConnectionPhase::Connected {
            self.stats.duplicates += 1;
            return;
        }
        // Always ack, even duplicates: the first ack may have been lost.
        self.push(PacketHeader::ack(sequence), Bytes::new());

        let before = self.inbox.len();
        let outcome = self.reorder.receive(sequence, payload, &mut self.inbox);
        if outcome.duplicate {
            self.stats.duplicates += 1;
            trace!(id = %self.id, %sequence, "duplicate reliable packet");
        }
        if outcome.skipped > 0 {
            self.stats.lost += u64::from(outcome.skipped);
            debug!(id = %self.id, skipped = outcome.skipped, "reorder window advanced past a gap");
        }
        self.stats.delivered += (self.inbox.len() - before) as u64;
    }

    /// Unreliable Data: deliver only if newer than anything delivered so far.
    pub fn on_unreliable_data(&mut self, sequence: SequenceNumber, payload: Bytes) {
        if self.phase != ConnectionPhase::Connected {
            self.stats.duplicates += 1;
            return;
        }
        let fresh = self
            .last_unreliable
            .is_none_or(|last| sequence.is_after(last));
        if !fresh {
            self.stats.duplicates += 1;
            trace!(id = %self.id, %sequence, "stale unreliable packet");
            return;
        }
        self.last_unreliable = Some(sequence);
        self.inbox.push(payload);
        self.stats.delivered += 1;
    }

    /// Ack for one reliable sequence.
    pub fn on_ack(&mut self, now: Instant, sequence: SequenceNumber) {
        match self.retransmit.on_ack(sequence, now) {
            AckOutcome::Acked(Some(sample)) => self.rtt.update(sample),
            AckOutcome::Acked(None) => {}
            AckOutcome::Unknown => {
                trace!(id = %self.id, %sequence, "ack for unknown sequence");
                return;
            }
        }
        self.pump_backlog(now);
    }

    /// Disconnect from the peer. Nothing is sent back.
    pub fn on_disconnect(&mut self, code: u8) {
        let reason = DisconnectReason::from_remote_code(code);
        info!(id = %self.id, peer = %self.peer, %reason, "peer disconnected");
        self.close(reason);
    }

    /// Count a malformed packet from this peer; too many closes the connection.
    pub fn on_malformed(&mut self) {
        self.stats.malformed += 1;
        debug!(id = %self.id, count = self.stats.malformed, "malformed packet");
        if self.stats.malformed > self.config.max_malformed_packets {
            warn!(id = %self.id, peer = %self.peer, "too many malformed packets");
            self.disconnect(DisconnectReason::ProtocolViolation);
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Queue an application payload.
    pub fn send(
        &mut self,
        now: Instant,
        payload: Bytes,
        reliability: Reliability,
    ) -> Result<(), SendError> {
        if self.phase != ConnectionPhase::Connected {
            return Err(SendError::NotConnected);
        }
        let max = self.config.max_payload_size();
        if payload.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        match reliability {
            Reliability::Unreliable => {
                let sequence = self.next_unreliable;
                self.next_unreliable = sequence.next();
                self.push(
                    PacketHeader::data(sequence, false, payload.len() as u32),
                    payload,
                );
            }
            Reliability::Reliable => {
                if self.backlog.is_empty() && self.retransmit.can_send(self.next_reliable) {
                    self.transmit_reliable(now, payload);
                } else if self.backlog.len() >= self.config.send_queue_limit {
                    return Err(SendError::QueueFull {
                        limit: self.config.send_queue_limit,
                    });
                } else {
                    self.backlog.push_back(payload);
                }
            }
        }
        Ok(())
    }

    fn transmit_reliable(&mut self, now: Instant, payload: Bytes) {
        let sequence = self.next_reliable;
        self.next_reliable = sequence.next();
        self.retransmit
            .push(sequence, payload.clone(), now, self.rtt.rto());
        self.push(
            PacketHeader::data(sequence, true, payload.len() as u32),
            payload,
        );
    }

    fn pump_backlog(&mut self, now: Instant) {
        while self.retransmit.can_send(self.next_reliable) {
            let Some(payload) = self.backlog.pop_front() else {
                break;
            };
            self.transmit_reliable(now, payload);
        }
    }

    fn queue_handshake(&mut self, attempt: u32) {
        let version = self.config.protocol_version;
        self.push(
            PacketHeader::handshake(attempt),
            Bytes::copy_from_slice(&handshake_payload(version)),
        );
    }

    fn push(&mut self, header: PacketHeader, payload: Bytes) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        self.sent_since_tick = true;
        self.outbox.push(OutboundPacket { header, payload });
    }

    /// Send a goodbye and close.
    ///
    /// The Disconnect packet is best-effort and never retransmitted.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        self.phase = ConnectionPhase::Disconnecting;
        self.push(PacketHeader::disconnect(reason), Bytes::new());
        self.close(reason);
    }

    /// Close without telling the peer.
    pub fn close(&mut self, reason: DisconnectReason) {
        if self.is_closed() {
            return;
        }
        if reason == DisconnectReason::Timeout && self.close_error.is_none() {
            self.close_error = Some(ConnectError::Timeout);
        }
        self.phase = ConnectionPhase::Closed;
        self.close_reason = Some(reason);
        self.retransmit.clear();
        self.backlog.clear();
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Run timers: handshake retry, retransmission, keep-alive, inactivity.
    pub fn tick(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        if std::mem::take(&mut self.sent_since_tick) {
            self.last_sent = now;
        }

        if now.saturating_duration_since(self.last_received) >= self.config.inactivity_timeout {
            info!(id = %self.id, peer = %self.peer, "inactivity timeout");
            self.disconnect(DisconnectReason::Timeout);
            return;
        }

        match self.phase {
            ConnectionPhase::Connecting => self.tick_handshake(now),
            ConnectionPhase::Connected => {
                self.tick_retransmit(now);
                if !self.is_closed() {
                    self.tick_keep_alive(now);
                }
            }
            ConnectionPhase::Disconnecting | ConnectionPhase::Closed => {}
        }
    }

    fn tick_handshake(&mut self, now: Instant) {
        let Some(mut timer) = self.handshake else {
            return;
        };
        if timer.last_sent.checked_add(timer.rto).is_none_or(|due| now < due) {
            return;
        }
        if timer.attempts > self.config.max_retransmit_attempts {
            info!(id = %self.id, peer = %self.peer, attempts = timer.attempts, "handshake timed out");
            self.close(DisconnectReason::Timeout);
            return;
        }
        timer.attempts += 1;
        timer.last_sent = now;
        timer.rto = backoff(timer.rto);
        self.handshake = Some(timer);
        debug!(id = %self.id, attempt = timer.attempts, "retrying handshake");
        self.queue_handshake(timer.attempts);
    }

    fn tick_retransmit(&mut self, now: Instant) {
        match self
            .retransmit
            .poll_retransmits(now, self.config.max_retransmit_attempts)
        {
            Ok(due) => {
                for (sequence, payload) in due {
                    debug!(id = %self.id, %sequence, "retransmitting");
                    self.stats.retransmits += 1;
                    self.push(
                        PacketHeader::data(sequence, true, payload.len() as u32),
                        payload,
                    );
                }
            }
            Err(exhausted) => {
                warn!(id = %self.id, sequence = %exhausted.sequence, "retransmission attempts exhausted");
                self.disconnect(DisconnectReason::Timeout);
            }
        }
    }

    /// Quiet in either direction for an interval: the peer may be idling
    /// toward its own inactivity timeout.
    /// `None` when the interval is too long to land on an `Instant`.
    fn keep_alive_due(&self) -> Option<Instant> {
        let interval = self.config.keep_alive_interval;
        let due = self.last_received.min(self.last_sent).checked_add(interval)?;
        match self.last_keep_alive {
            Some(sent) => Some(due.max(sent.checked_add(interval)?)),
            None => Some(due),
        }
    }

    fn tick_keep_alive(&mut self, now: Instant) {
        if self.keep_alive_due().is_some_and(|due| now >= due) {
            trace!(id = %self.id, "sending keep-alive");
            self.last_keep_alive = Some(now);
            self.push(PacketHeader::keep_alive(), Bytes::new());
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    ///
    /// `None` once closed, or when every timer is too far out to represent.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_closed() {
            return None;
        }
        let inactivity = self
            .last_received
            .checked_add(self.config.inactivity_timeout);

        match self.phase {
            ConnectionPhase::Connecting => earliest(
                inactivity,
                self.handshake
                    .and_then(|timer| timer.last_sent.checked_add(timer.rto)),
            ),
            ConnectionPhase::Connected => earliest(
                earliest(inactivity, self.retransmit.next_deadline()),
                self.keep_alive_due(),
            ),
            ConnectionPhase::Disconnecting | ConnectionPhase::Closed => inactivity,
        }
    }

    // =========================================================================
    // Drained by the multiplexer
    // =========================================================================

    /// Take queued outbound packets.
    pub fn take_outbox(&mut self) -> Vec<OutboundPacket> {
        std::mem::take(&mut self.outbox)
    }

    /// Take payloads ready for the application.
    pub fn take_delivered(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.inbox)
    }

    /// Returns `true` once after the handshake completes.
    pub fn take_connected(&mut self) -> bool {
        std::mem::take(&mut self.just_connected)
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
