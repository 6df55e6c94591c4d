//! Connection table: sole owner of every live [`ConnectionState`].
//!
//! Two indices are kept in sync: id → state and (socket, peer) → id.
//! Everything outside the table refers to a connection by [`ConnectionId`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::connection::ConnectionState;
use super::socket::SocketId;
use crate::core::error::TableError;

/// Opaque handle for one connection. Never reused within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out connection ids. Clones share the counter, so ids can be
/// reserved from any thread before the reactor creates the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIdAllocator {
    next: Arc<AtomicU64>,
}

impl ConnectionIdAllocator {
    /// Create an allocator starting at 1.
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Reserve a fresh id.
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Live connections, indexed by id and by address.
#[derive(Debug)]
pub struct ConnectionTable {
    by_id: HashMap<ConnectionId, ConnectionState>,
    by_address: HashMap<(SocketId, SocketAddr), ConnectionId>,
    ids: ConnectionIdAllocator,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create an empty table holding at most `max_connections` entries.
    pub fn new(max_connections: usize, ids: ConnectionIdAllocator) -> Self {
        Self {
            by_id: HashMap::new(),
            by_address: HashMap::new(),
            ids,
            max_connections,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Check if another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.by_id.len() >= self.max_connections
    }

    /// Configured limit.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Shared id allocator.
    pub fn allocator(&self) -> &ConnectionIdAllocator {
        &self.ids
    }

    /// Check that a connection for `peer` on `socket` could be created.
    pub fn check_insert(&self, socket: SocketId, peer: SocketAddr) -> Result<(), TableError> {
        if self.by_address.contains_key(&(socket, peer)) {
            return Err(TableError::AddressInUse(peer));
        }
        if self.is_full() {
            return Err(TableError::Full {
                max: self.max_connections,
            });
        }
        Ok(())
    }

    /// Allocate an id and insert the state built by `make`.
    ///
    /// Nothing is created when the table refuses the entry.
    pub fn create<F>(
        &mut self,
        socket: SocketId,
        peer: SocketAddr,
        make: F,
    ) -> Result<ConnectionId, TableError>
    where
        F: FnOnce(ConnectionId) -> ConnectionState,
    {
        self.check_insert(socket, peer)?;
        let id = self.ids.allocate();
        self.by_id.insert(id, make(id));
        self.by_address.insert((socket, peer), id);
        Ok(id)
    }

    /// Insert a state whose id was reserved earlier through the allocator.
    pub fn insert_reserved(&mut self, state: ConnectionState) -> Result<ConnectionId, TableError> {
        let (id, socket, peer) = (state.id(), state.socket(), state.peer());
        self.check_insert(socket, peer)?;
        self.by_id.insert(id, state);
        self.by_address.insert((socket, peer), id);
        Ok(id)
    }

    /// Look up by id.
    pub fn find(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.by_id.get(&id)
    }

    /// Look up by id, mutably.
    pub fn find_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionState> {
        self.by_id.get_mut(&id)
    }

    /// Look up the id serving `peer` on `socket`.
    pub fn find_by_address(&self, socket: SocketId, peer: SocketAddr) -> Option<ConnectionId> {
        self.by_address.get(&(socket, peer)).copied()
    }

    /// Remove from both indices.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionState> {
        let state = self.by_id.remove(&id)?;
        self.by_address.remove(&(state.socket(), state.peer()));
        Some(state)
    }

    /// Ids of every connection on `socket`.
    pub fn ids_on_socket(&self, socket: SocketId) -> Vec<ConnectionId> {
        self.by_address
            .iter()
            .filter(|((s, _), _)| *s == socket)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Ids of every connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.by_id.keys().copied().collect()
    }

    /// Iterate mutably over every connection.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnectionId, &mut ConnectionState)> {
        self.by_id.iter_mut()
    }

    /// Iterate over every connection.
    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &ConnectionState)> {
        self.by_id.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Clock, SystemClock, TransportConfig};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table(max: usize) -> ConnectionTable {
        ConnectionTable::new(max, ConnectionIdAllocator::new())
    }

    fn inbound(id: ConnectionId, socket: SocketId, peer: SocketAddr) -> ConnectionState {
        ConnectionState::inbound(
            id,
            socket,
            peer,
            Arc::new(TransportConfig::default()),
            SystemClock.now(),
        )
    }

    #[test]
    fn test_create_and_find() {
        let mut table = table(4);
        let socket = SocketId(0);
        let id = table
            .create(socket, addr(1000), |id| inbound(id, socket, addr(1000)))
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.find(id).map(|c| c.peer()), Some(addr(1000)));
        assert_eq!(table.find_by_address(socket, addr(1000)), Some(id));
        assert_eq!(table.find_by_address(SocketId(1), addr(1000)), None);
    }

    #[test]
    fn test_full_creates_nothing() {
        let mut table = table(1);
        let socket = SocketId(0);
        table
            .create(socket, addr(1), |id| inbound(id, socket, addr(1)))
            .unwrap();

        let err = table
            .create(socket, addr(2), |id| inbound(id, socket, addr(2)))
            .unwrap_err();
        assert_eq!(err, TableError::Full { max: 1 });
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_address(socket, addr(2)), None);
    }

    #[test]
    fn test_one_connection_per_address() {
        let mut table = table(4);
        let socket = SocketId(0);
        table
            .create(socket, addr(1), |id| inbound(id, socket, addr(1)))
            .unwrap();
        assert_eq!(
            table.create(socket, addr(1), |id| inbound(id, socket, addr(1))),
            Err(TableError::AddressInUse(addr(1)))
        );

        // Same peer on another socket is a different connection.
        let other = SocketId(1);
        assert!(
            table
                .create(other, addr(1), |id| inbound(id, other, addr(1)))
                .is_ok()
        );
    }

    #[test]
    fn test_remove_clears_both_indices() {
        let mut table = table(4);
        let socket = SocketId(0);
        let id = table
            .create(socket, addr(1), |id| inbound(id, socket, addr(1)))
            .unwrap();

        assert!(table.remove(id).is_some());
        assert!(table.find(id).is_none());
        assert_eq!(table.find_by_address(socket, addr(1)), None);
        assert!(table.remove(id).is_none());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = table(4);
        let socket = SocketId(0);
        let first = table
            .create(socket, addr(1), |id| inbound(id, socket, addr(1)))
            .unwrap();
        table.remove(first);
        let second = table
            .create(socket, addr(1), |id| inbound(id, socket, addr(1)))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_insert_reserved() {
        let mut table = table(4);
        let reserved = table.allocator().allocate();
        let socket = SocketId(3);

        let id = table
            .insert_reserved(inbound(reserved, socket, addr(9)))
            .unwrap();
        assert_eq!(id, reserved);
        assert_eq!(table.ids_on_socket(socket), vec![reserved]);
    }
}
