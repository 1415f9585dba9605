//! Register window layout of the DMA transport.
//!
//! ```text
//! 0                      input buffer        (packet_size bytes, guest reads packets here)
//! packet_size            output buffer       (packet_size bytes, guest writes packets here)
//! 2 * packet_size        Flags[index]        (one word per static + reserved index)
//! flags_end              static blocks       (6 words per static channel)
//! blocks_end             indirection block   (INDIRECT_REGS words)
//! ```

use bitflags::bitflags;

use crate::config::TransportConfig;

/// Latched IOInput length meaning "no packet was available".
pub const NO_PACKET: u32 = 0xFFFF_FFFF;

// Static channel block, word offsets.
pub const BLOCK_GLOBAL: u64 = 0x00;
pub const BLOCK_FLAGS: u64 = 0x04;
pub const BLOCK_IO_INPUT: u64 = 0x08;
pub const BLOCK_IO_OUTPUT: u64 = 0x0C;
pub const BLOCK_IRQ: u64 = 0x10;
pub const BLOCK_IRQ_ACK: u64 = 0x14;
pub const BLOCK_SIZE: u64 = 0x18;

// Indirection block, byte offsets from its base.
pub const REG_CURRENT_CHANNEL: u64 = 0x00;
pub const REG_OPERATION: u64 = 0x04;
pub const REG_STATUS: u64 = 0x08;
pub const REG_CURRENT_GLOBAL: u64 = 0x0C;
pub const REG_CURRENT_FLAGS: u64 = 0x10;
pub const REG_CURRENT_IO_INPUT: u64 = 0x14;
pub const REG_CURRENT_IO_OUTPUT: u64 = 0x18;
pub const REG_FORWARD_CHANNEL: u64 = 0x1C;
pub const REG_FORWARD_FLAGS: u64 = 0x20;
pub const REG_REVERSE_CHANNEL: u64 = 0x24;
pub const REG_REVERSE_FLAGS: u64 = 0x28;
pub const REG_WRITE_CHANNEL: u64 = 0x2C;
pub const REG_WRITE_FLAGS: u64 = 0x30;
pub const INDIRECT_SIZE: u64 = 0x34;

bitflags! {
    /// Global register of a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GlobalBits: u32 {
        /// IOInput/IOOutput triggers are honoured.
        const ENABLE = 1 << 0;
        /// The channel contributes to the shared interrupt line.
        const IRQ_ENABLE = 1 << 1;
    }
}

bitflags! {
    /// Read-only Flags register of a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u32 {
        const DEVICE_CONNECTED = 1 << 0;
        const DESKTOP_CONNECTED = 1 << 1;
        const ADDR_CONNECTED = 1 << 2;
        /// A packet is waiting for IOInput.
        const DATA_READY = 1 << 3;
        /// Packets written by the guest have not been drained by the host yet.
        const DESKTOP_PENDING = 1 << 4;
    }
}

/// Values written to the Operation register; each acts on CurrentChannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    Attach = 1,
    Detach = 2,
    IsInUse = 3,
    NewVirtualChannel = 4,
    NewAddressChannel = 5,
}

impl Operation {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Attach,
            2 => Self::Detach,
            3 => Self::IsInUse,
            4 => Self::NewVirtualChannel,
            5 => Self::NewAddressChannel,
            _ => return None,
        })
    }
}

/// A decoded register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    InputBuffer(usize),
    OutputBuffer(usize),
    Flags(u32),
    Static { channel: u32, reg: u64 },
    Indirect(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub packet_size: u64,
    pub flags_base: u64,
    pub flags_count: u32,
    pub blocks_base: u64,
    pub static_channels: u32,
    pub indirect_base: u64,
}

impl RegisterLayout {
    pub fn new(config: &TransportConfig) -> Self {
        let packet_size = u64::from(config.packet_size);
        let flags_base = 2 * packet_size;
        let flags_count = config.first_dynamic_index();
        let blocks_base = flags_base + 4 * u64::from(flags_count);
        let indirect_base = blocks_base + BLOCK_SIZE * u64::from(config.static_channels);
        Self {
            packet_size,
            flags_base,
            flags_count,
            blocks_base,
            static_channels: config.static_channels,
            indirect_base,
        }
    }

    /// Total size of the MMIO window.
    pub fn window_size(&self) -> u64 {
        self.indirect_base + INDIRECT_SIZE
    }

    pub fn static_block(&self, channel: u32) -> u64 {
        self.blocks_base + BLOCK_SIZE * u64::from(channel)
    }

    pub fn flags_reg(&self, index: u32) -> u64 {
        self.flags_base + 4 * u64::from(index)
    }

    pub fn indirect(&self, reg: u64) -> u64 {
        self.indirect_base + reg
    }

    /// Map a window offset to a register. Register decoding requires aligned word offsets;
    /// buffer offsets are returned as raw byte positions.
    pub fn decode(&self, offset: u64) -> Option<Register> {
        if offset < self.packet_size {
            return Some(Register::InputBuffer(offset as usize));
        }
        if offset < self.flags_base {
            return Some(Register::OutputBuffer((offset - self.packet_size) as usize));
        }
        if offset % 4 != 0 {
            return None;
        }
        if offset < self.blocks_base {
            return Some(Register::Flags(((offset - self.flags_base) / 4) as u32));
        }
        if offset < self.indirect_base {
            let rel = offset - self.blocks_base;
            return Some(Register::Static {
                channel: (rel / BLOCK_SIZE) as u32,
                reg: rel % BLOCK_SIZE,
            });
        }
        if offset < self.window_size() {
            return Some(Register::Indirect(offset - self.indirect_base));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_offsets() {
        let layout = RegisterLayout::new(&TransportConfig::default());
        assert_eq!(layout.flags_base, 0x2000);
        assert_eq!(layout.blocks_base, 0x2040);
        assert_eq!(layout.indirect_base, 0x2100);
        assert_eq!(layout.window_size(), 0x2134);
    }

    #[test]
    fn decode_covers_every_region() {
        let layout = RegisterLayout::new(&TransportConfig::default());
        assert_eq!(layout.decode(3), Some(Register::InputBuffer(3)));
        assert_eq!(layout.decode(0x1001), Some(Register::OutputBuffer(1)));
        assert_eq!(layout.decode(0x2004), Some(Register::Flags(1)));
        assert_eq!(layout.decode(0x2002), None);
        assert_eq!(
            layout.decode(layout.static_block(2) + BLOCK_IRQ_ACK),
            Some(Register::Static {
                channel: 2,
                reg: BLOCK_IRQ_ACK
            })
        );
        assert_eq!(
            layout.decode(layout.indirect(REG_WRITE_FLAGS)),
            Some(Register::Indirect(REG_WRITE_FLAGS))
        );
        assert_eq!(layout.decode(layout.window_size()), None);
    }
}
