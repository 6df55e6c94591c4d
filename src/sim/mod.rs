//! In-memory datagram network for deterministic tests.
//!
//! A [`SimNetwork`] is a set of mailboxes keyed by address. [`SimSocket`]s
//! bound on it exchange datagrams through those mailboxes, subject to a
//! seeded loss, duplication, and reordering model. Nothing here touches the
//! OS, so a transport built on sim sockets should be ticked with a zero
//! wait and a [`ManualClock`](crate::core::ManualClock).

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::transport::socket::{Received, SocketError, SocketMode, TransportSocket};

/// Delivery counters for the whole network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Datagrams placed in a mailbox.
    pub delivered: u64,
    /// Datagrams dropped by the loss model.
    pub lost: u64,
    /// Extra copies created by the duplication model.
    pub duplicated: u64,
    /// Datagrams to or from a blocked address, or to nobody.
    pub blackholed: u64,
}

#[derive(Debug)]
struct Inner {
    mailboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Bytes)>>,
    blocked: HashSet<SocketAddr>,
    failed: HashSet<SocketAddr>,
    rng: StdRng,
    loss: f64,
    duplicate: f64,
    reorder: f64,
    stats: SimStats,
}

impl Inner {
    fn enqueue(&mut self, from: SocketAddr, to: SocketAddr, data: Bytes) {
        let reorder = self.reorder;
        let roll = reorder > 0.0 && self.rng.gen_bool(reorder);
        let Some(mailbox) = self.mailboxes.get_mut(&to) else {
            self.stats.blackholed += 1;
            return;
        };
        if roll && !mailbox.is_empty() {
            let at = self.rng.gen_range(0..mailbox.len());
            mailbox.insert(at, (from, data));
        } else {
            mailbox.push_back((from, data));
        }
        self.stats.delivered += 1;
    }
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl SimNetwork {
    /// Create a perfect network whose random choices derive from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                mailboxes: HashMap::new(),
                blocked: HashSet::new(),
                failed: HashSet::new(),
                rng: StdRng::seed_from_u64(seed),
                loss: 0.0,
                duplicate: 0.0,
                reorder: 0.0,
                stats: SimStats::default(),
            })),
        }
    }

    /// Drop each datagram with probability `rate`.
    pub fn set_loss(&self, rate: f64) {
        self.inner.lock().loss = rate.clamp(0.0, 1.0);
    }

    /// Deliver each datagram twice with probability `rate`.
    pub fn set_duplicate(&self, rate: f64) {
        self.inner.lock().duplicate = rate.clamp(0.0, 1.0);
    }

    /// Insert each datagram at a random queue position with probability `rate`.
    pub fn set_reorder(&self, rate: f64) {
        self.inner.lock().reorder = rate.clamp(0.0, 1.0);
    }

    /// Bind a socket. Fails with `AddrInUse` if the address is taken.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SimSocket> {
        let mut inner = self.inner.lock();
        if inner.mailboxes.contains_key(&addr) {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        inner.mailboxes.insert(addr, VecDeque::new());
        inner.failed.remove(&addr);
        Ok(SimSocket {
            network: self.clone(),
            local_addr: addr,
        })
    }

    /// Silently drop everything sent to or from `addr`.
    pub fn block(&self, addr: SocketAddr) {
        self.inner.lock().blocked.insert(addr);
    }

    /// Undo [`block`](Self::block).
    pub fn unblock(&self, addr: SocketAddr) {
        self.inner.lock().blocked.remove(&addr);
    }

    /// Make every later operation on the socket at `addr` fail fatally.
    pub fn fail(&self, addr: SocketAddr) {
        self.inner.lock().failed.insert(addr);
    }

    /// Place raw bytes in `to`'s mailbox as if `from` had sent them.
    ///
    /// Bypasses the loss model; used to feed garbage to a transport.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: impl Into<Bytes>) {
        let mut inner = self.inner.lock();
        if let Some(mailbox) = inner.mailboxes.get_mut(&to) {
            mailbox.push_back((from, data.into()));
        }
    }

    /// Datagrams waiting for `addr`.
    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.inner
            .lock()
            .mailboxes
            .get(&addr)
            .map_or(0, VecDeque::len)
    }

    /// Delivery counters.
    pub fn stats(&self) -> SimStats {
        self.inner.lock().stats
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> Result<usize, SocketError> {
        let mut inner = self.inner.lock();
        if inner.failed.contains(&from) {
            return Err(SocketError::Fatal(io::Error::other("simulated socket failure")));
        }
        if inner.blocked.contains(&from) || inner.blocked.contains(&to) {
            inner.stats.blackholed += 1;
            return Ok(data.len());
        }
        let loss = inner.loss;
        if loss > 0.0 && inner.rng.gen_bool(loss) {
            trace!(%from, %to, len = data.len(), "sim drop");
            inner.stats.lost += 1;
            return Ok(data.len());
        }

        let len = data.len();
        let data = Bytes::copy_from_slice(data);
        let duplicate = inner.duplicate;
        if duplicate > 0.0 && inner.rng.gen_bool(duplicate) {
            inner.stats.duplicated += 1;
            inner.enqueue(from, to, data.clone());
        }
        inner.enqueue(from, to, data);
        Ok(len)
    }

    fn receive(&self, addr: SocketAddr) -> Result<Option<Received>, SocketError> {
        let mut inner = self.inner.lock();
        if inner.failed.contains(&addr) {
            return Err(SocketError::Fatal(io::Error::other("simulated socket failure")));
        }
        loop {
            let Some((peer, data)) = inner.mailboxes.get_mut(&addr).and_then(VecDeque::pop_front)
            else {
                return Ok(None);
            };
            if inner.blocked.contains(&addr) || inner.blocked.contains(&peer) {
                inner.stats.blackholed += 1;
                continue;
            }
            return Ok(Some(Received { peer, data }));
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        inner.mailboxes.remove(&addr);
        inner.failed.remove(&addr);
    }
}

/// A datagram socket on a [`SimNetwork`]. Unbinds on drop.
#[derive(Debug)]
pub struct SimSocket {
    network: SimNetwork,
    local_addr: SocketAddr,
}

impl TransportSocket for SimSocket {
    fn mode(&self) -> SocketMode {
        SocketMode::Datagram
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn try_send(&mut self, peer: SocketAddr, frame: &[u8]) -> Result<usize, SocketError> {
        self.network.send(self.local_addr, peer, frame)
    }

    fn try_receive(&mut self) -> Result<Option<Received>, SocketError> {
        self.network.receive(self.local_addr)
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.network.unbind(self.local_addr);
    }
}
