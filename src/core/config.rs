//! Transport configuration.

use std::time::Duration;

use super::constants::*;
use super::error::ConfigError;

/// Tunables shared by every socket and connection of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum number of live connections.
    pub max_connections: usize,

    /// Maximum encoded frame size (header + payload) in bytes.
    pub max_frame_size: usize,

    /// Reliable reorder window, in packets. Also bounds reliable packets in flight.
    pub reorder_window: u32,

    /// Send a keep-alive after this long without traffic in either direction.
    pub keep_alive_interval: Duration,

    /// Close the connection after this long without hearing from the peer.
    /// `Duration::MAX` never times out. Also bounds how long an accepted
    /// stream may stay open without completing a handshake.
    pub inactivity_timeout: Duration,

    /// Retransmissions of one packet before the connection is dropped.
    pub max_retransmit_attempts: u32,

    /// Retransmission timeout used before the first RTT sample.
    pub initial_rto: Duration,

    /// Malformed packets tolerated from one peer before it is disconnected.
    pub max_malformed_packets: u32,

    /// Upper bound on how long one reactor tick waits for I/O.
    pub max_poll_interval: Duration,

    /// Application protocol version both sides must agree on.
    pub protocol_version: u32,

    /// Reliable payloads queued per connection while the window is full.
    pub send_queue_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            reorder_window: DEFAULT_REORDER_WINDOW,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_retransmit_attempts: DEFAULT_MAX_RETRANSMIT_ATTEMPTS,
            initial_rto: INITIAL_RTO,
            max_malformed_packets: DEFAULT_MAX_MALFORMED_PACKETS,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Largest payload that fits in one frame.
    pub fn max_payload_size(&self) -> usize {
        self.max_frame_size.saturating_sub(HEADER_SIZE)
    }

    /// Check every option against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_connections",
                reason: "must be at least 1",
            });
        }
        if self.max_frame_size <= HEADER_SIZE {
            return Err(ConfigError::OutOfRange {
                field: "max_frame_size",
                reason: "must exceed the packet header size",
            });
        }
        if self.max_frame_size > MAX_UDP_PAYLOAD {
            return Err(ConfigError::OutOfRange {
                field: "max_frame_size",
                reason: "must fit in a single UDP datagram",
            });
        }
        if self.reorder_window == 0 || self.reorder_window > MAX_REORDER_WINDOW {
            return Err(ConfigError::OutOfRange {
                field: "reorder_window",
                reason: "must be between 1 and 32768 packets",
            });
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "keep_alive_interval",
                reason: "must be non-zero",
            });
        }
        if self
            .keep_alive_interval
            .checked_mul(2)
            .is_none_or(|min| self.inactivity_timeout < min)
        {
            return Err(ConfigError::OutOfRange {
                field: "inactivity_timeout",
                reason: "must be at least two keep-alive intervals",
            });
        }
        if self.max_retransmit_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_retransmit_attempts",
                reason: "must be at least 1",
            });
        }
        if self.initial_rto < MIN_RTO || self.initial_rto > MAX_RTO {
            return Err(ConfigError::OutOfRange {
                field: "initial_rto",
                reason: "must be between 100ms and 60s",
            });
        }
        if self.max_poll_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "max_poll_interval",
                reason: "must be non-zero",
            });
        }
        if self.send_queue_limit == 0 {
            return Err(ConfigError::OutOfRange {
                field: "send_queue_limit",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
        }
    }

    /// Set the maximum number of live connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the maximum encoded frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the reliable reorder window.
    pub fn reorder_window(mut self, packets: u32) -> Self {
        self.config.reorder_window = packets;
        self
    }

    /// Set the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    /// Set the inactivity timeout.
    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout = timeout;
        self
    }

    /// Set the retransmission limit.
    pub fn max_retransmit_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retransmit_attempts = attempts;
        self
    }

    /// Set the initial retransmission timeout.
    pub fn initial_rto(mut self, rto: Duration) -> Self {
        self.config.initial_rto = rto;
        self
    }

    /// Set the malformed packet threshold.
    pub fn max_malformed_packets(mut self, max: u32) -> Self {
        self.config.max_malformed_packets = max;
        self
    }

    /// Set the maximum reactor wait.
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.config.max_poll_interval = interval;
        self
    }

    /// Set the application protocol version.
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Set the per-connection reliable send queue limit.
    pub fn send_queue_limit(mut self, limit: usize) -> Self {
        self.config.send_queue_limit = limit;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TransportConfig::builder()
            .max_connections(8)
            .max_frame_size(512)
            .reorder_window(16)
            .keep_alive_interval(Duration::from_millis(200))
            .inactivity_timeout(Duration::from_secs(1))
            .protocol_version(7)
            .build()
            .unwrap();

        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_payload_size(), 512 - HEADER_SIZE);
        assert_eq!(config.reorder_window, 16);
        assert_eq!(config.protocol_version, 7);
    }

    #[test]
    fn test_rejects_tiny_frames() {
        let err = TransportConfig::builder()
            .max_frame_size(HEADER_SIZE)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_frame_size", .. }));
    }

    #[test]
    fn test_rejects_short_inactivity_timeout() {
        let err = TransportConfig::builder()
            .keep_alive_interval(Duration::from_secs(5))
            .inactivity_timeout(Duration::from_secs(6))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "inactivity_timeout", .. }));
    }

    #[test]
    fn test_unbounded_durations() {
        let config = TransportConfig::builder()
            .inactivity_timeout(Duration::MAX)
            .build()
            .unwrap();
        assert_eq!(config.inactivity_timeout, Duration::MAX);

        let err = TransportConfig::builder()
            .keep_alive_interval(Duration::MAX)
            .inactivity_timeout(Duration::MAX)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "inactivity_timeout", .. }));
    }

    #[test]
    fn test_rejects_zero_window() {
        assert!(TransportConfig::builder().reorder_window(0).build().is_err());
        assert!(TransportConfig::builder().reorder_window(1 << 20).build().is_err());
    }

    #[test]
    fn test_rejects_rto_out_of_bounds() {
        assert!(
            TransportConfig::builder()
                .initial_rto(Duration::from_millis(1))
                .build()
                .is_err()
        );
    }
}
