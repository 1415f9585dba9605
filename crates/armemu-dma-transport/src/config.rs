use serde::Deserialize;
use thiserror::Error;

/// Power-on configuration for the DMA transport.
///
/// The defaults match the board's shipping guest drivers; changing any of the sizes moves the
/// register layout (see [`crate::regs::RegisterLayout`]).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Statically addressable channels `[0, static_channels)`, each with its own register block.
    pub static_channels: u32,
    /// Indices directly after the static range that are never allocated.
    pub reserved_channels: u32,
    /// Size of each shared packet buffer and of every queue slot, in bytes.
    pub packet_size: u32,
    /// Packets buffered per direction per channel.
    pub queue_depth: u32,
    /// Buckets in the index lookup table. Must cover the static and reserved ranges.
    pub lookup_buckets: u32,
    /// Channel slots added each time the pool grows.
    pub slot_chunk: u32,
    /// Upper bound on simultaneously allocated channel records.
    pub max_channels: u32,
    /// Interrupt controller input driven by the transport.
    pub irq_line: u32,
    /// Maximum worker threads in the host completion pool.
    pub max_workers: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            static_channels: 8,
            reserved_channels: 8,
            packet_size: 4096,
            queue_depth: 16,
            lookup_buckets: 64,
            slot_chunk: 16,
            max_channels: 1024,
            irq_line: 5,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("packet_size must be a multiple of 4 and at least 16 bytes (got {0})")]
    PacketSize(u32),

    #[error("lookup_buckets ({buckets}) must cover the static and reserved ranges ({boundary})")]
    LookupTooSmall { buckets: u32, boundary: u32 },

    #[error("static and reserved ranges overflow the channel index space")]
    IndexSpace,
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("static_channels", self.static_channels),
            ("queue_depth", self.queue_depth),
            ("lookup_buckets", self.lookup_buckets),
            ("slot_chunk", self.slot_chunk),
            ("max_channels", self.max_channels),
            ("max_workers", self.max_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.packet_size < 16 || self.packet_size % 4 != 0 {
            return Err(ConfigError::PacketSize(self.packet_size));
        }
        let boundary = self
            .static_channels
            .checked_add(self.reserved_channels)
            .filter(|b| *b < u32::MAX)
            .ok_or(ConfigError::IndexSpace)?;
        if self.lookup_buckets < boundary {
            return Err(ConfigError::LookupTooSmall {
                buckets: self.lookup_buckets,
                boundary,
            });
        }
        Ok(())
    }

    /// First index of the reserved gap.
    pub fn virtual_base(&self) -> u32 {
        self.static_channels
    }

    /// First dynamically allocatable virtual index.
    pub fn first_dynamic_index(&self) -> u32 {
        self.static_channels + self.reserved_channels
    }

    pub fn is_static(&self, index: u32) -> bool {
        index < self.static_channels
    }

    pub fn is_reserved(&self, index: u32) -> bool {
        (self.virtual_base()..self.first_dynamic_index()).contains(&index)
    }

    pub fn is_dynamic(&self, index: u32) -> bool {
        index >= self.first_dynamic_index()
    }
}
