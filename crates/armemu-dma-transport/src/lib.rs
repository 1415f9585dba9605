//! DMA virtual-channel transport between the emulated guest and the host.
//!
//! The guest drives the transport through a register window ([`DmaTransportDevice`]); the host
//! binds [`ChannelHandle`]s to the same channels through [`DmaTransport`]. Packets flow once
//! both sides are attached to a channel. Channels attached to the address directory carry
//! publish/scan requests instead of data.

#![forbid(unsafe_code)]

mod channel;
mod config;
mod device;
pub mod directory;
mod error;
mod handle;
mod pool;
mod queue;
pub mod regs;
mod snapshot;
mod transport;

pub use channel::{ChannelPresence, ChannelRecord, ConnectionState, Side};
pub use config::{ConfigError, TransportConfig};
pub use device::DmaTransportDevice;
pub use directory::{AddressDirectory, AddressRecord, DirectoryRequest, ScanEnd};
pub use error::{status_of, Result, TransportError, STATUS_SUCCESS};
pub use handle::ChannelHandle;
pub use pool::{bucket_key, ChannelPool, SlotId};
pub use queue::{FullPolicy, PacketQueue, QueueFull};
pub use transport::DmaTransport;
