//! Transport configuration

use sockem_core::constants::MAX_PAYLOAD;
use sockem_core::env::env_get;

/// Runtime sizing for one process's transport.
///
/// Ring depths are compile-time constants (`sockem_core::constants`); this
/// only sizes the pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Datagram channel slots (shared by datagram and raw sockets)
    pub dgram_sockets: usize,

    /// Stream channel slots
    pub stream_sockets: usize,

    /// Packet buffers in the stand-in stack allocator
    pub packets: usize,

    /// Payload bytes per packet buffer
    pub packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dgram_sockets: 64,
            stream_sockets: 16,
            packets: 4096,
            packet_size: 2048,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `SOCKEM_DGRAM_SOCKETS`, `SOCKEM_STREAM_SOCKETS`,
    /// `SOCKEM_PACKETS` and `SOCKEM_PACKET_SIZE`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dgram_sockets: env_get("SOCKEM_DGRAM_SOCKETS", d.dgram_sockets),
            stream_sockets: env_get("SOCKEM_STREAM_SOCKETS", d.stream_sockets),
            packets: env_get("SOCKEM_PACKETS", d.packets),
            packet_size: env_get("SOCKEM_PACKET_SIZE", d.packet_size),
        }
    }

    /// Set number of datagram channel slots
    pub fn dgram_sockets(mut self, n: usize) -> Self {
        self.dgram_sockets = n;
        self
    }

    /// Set number of stream channel slots
    pub fn stream_sockets(mut self, n: usize) -> Self {
        self.stream_sockets = n;
        self
    }

    /// Set packet buffer count
    pub fn packets(mut self, n: usize) -> Self {
        self.packets = n;
        self
    }

    /// Set payload bytes per packet buffer (capped at the descriptor limit)
    pub fn packet_size(mut self, n: usize) -> Self {
        self.packet_size = n.min(MAX_PAYLOAD);
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.dgram_sockets == 0 && self.stream_sockets == 0 {
            return Err("at least one channel slot is required");
        }
        if self.packets == 0 {
            return Err("packets must be at least 1");
        }
        if self.packet_size == 0 {
            return Err("packet_size must be at least 1");
        }
        if self.packet_size > MAX_PAYLOAD {
            return Err("packet_size exceeds descriptor length limit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let cfg = TransportConfig::new()
            .dgram_sockets(4)
            .stream_sockets(2)
            .packets(32)
            .packet_size(1 << 20);
        assert_eq!(cfg.dgram_sockets, 4);
        assert_eq!(cfg.stream_sockets, 2);
        assert_eq!(cfg.packet_size, MAX_PAYLOAD);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::default().validate().is_ok());
        assert!(TransportConfig::new().packets(0).validate().is_err());
        let cfg = TransportConfig::new().dgram_sockets(0).stream_sockets(0);
        assert!(cfg.validate().is_err());
        let cfg = TransportConfig { packet_size: MAX_PAYLOAD + 1, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_env_overlay() {
        std::env::set_var("SOCKEM_STREAM_SOCKETS", "3");
        std::env::set_var("SOCKEM_PACKET_SIZE", "bogus");
        let cfg = TransportConfig::from_env();
        assert_eq!(cfg.stream_sockets, 3);
        assert_eq!(cfg.packet_size, TransportConfig::default().packet_size);
        std::env::remove_var("SOCKEM_STREAM_SOCKETS");
        std::env::remove_var("SOCKEM_PACKET_SIZE");
    }
}
