//! Shared helpers for `armemu-dma-transport` integration tests.
//!
//! [`Guest`] drives the register window the way the guest driver does: select a channel through
//! the indirection block, then trigger IO on it.

#![allow(dead_code)]

use std::sync::Arc;

use armemu_dma_transport::regs::{self, GlobalBits, Operation, RegisterLayout, NO_PACKET};
use armemu_dma_transport::{DmaTransport, DmaTransportDevice, TransportConfig};
use armemu_platform::{InlineDispatcher, LevelInterrupts, MmioDevice};

pub struct Rig {
    pub transport: DmaTransport,
    pub irq: Arc<LevelInterrupts>,
    pub guest: Guest,
}

pub fn rig() -> Rig {
    rig_with(TransportConfig::default())
}

pub fn rig_with(config: TransportConfig) -> Rig {
    let irq = Arc::new(LevelInterrupts::new());
    let transport = DmaTransport::new(config, irq.clone(), Arc::new(InlineDispatcher))
        .expect("valid transport config");
    let guest = Guest::new(&transport);
    Rig {
        transport,
        irq,
        guest,
    }
}

pub struct Guest {
    pub dev: DmaTransportDevice,
    pub layout: RegisterLayout,
}

impl Guest {
    pub fn new(transport: &DmaTransport) -> Self {
        Self {
            dev: transport.device(),
            layout: *transport.layout(),
        }
    }

    pub fn read(&mut self, offset: u64) -> u32 {
        self.dev.mmio_read(offset, 4)
    }

    pub fn write(&mut self, offset: u64, value: u32) {
        self.dev.mmio_write(offset, 4, value);
    }

    pub fn indirect(&mut self, reg: u64) -> u32 {
        let off = self.layout.indirect(reg);
        self.read(off)
    }

    pub fn set_indirect(&mut self, reg: u64, value: u32) {
        let off = self.layout.indirect(reg);
        self.write(off, value);
    }

    pub fn select(&mut self, channel: u32) {
        self.set_indirect(regs::REG_CURRENT_CHANNEL, channel);
    }

    pub fn status(&mut self) -> u32 {
        self.indirect(regs::REG_STATUS)
    }

    /// Run `op` on `channel` and return the Status register.
    pub fn op(&mut self, channel: u32, op: Operation) -> u32 {
        self.select(channel);
        self.set_indirect(regs::REG_OPERATION, op as u32);
        self.status()
    }

    /// Mint a virtual (or address) channel and return its index.
    pub fn new_channel(&mut self, op: Operation) -> u32 {
        self.set_indirect(regs::REG_OPERATION, op as u32);
        assert_eq!(self.status(), 0, "{op:?} failed");
        self.indirect(regs::REG_CURRENT_CHANNEL)
    }

    pub fn set_global(&mut self, channel: u32, bits: GlobalBits) -> u32 {
        self.select(channel);
        self.set_indirect(regs::REG_CURRENT_GLOBAL, bits.bits());
        self.status()
    }

    pub fn flags(&mut self, channel: u32) -> u32 {
        self.select(channel);
        self.indirect(regs::REG_CURRENT_FLAGS)
    }

    /// Copy `packet` into the output buffer and trigger IOOutput on `channel`.
    pub fn send(&mut self, channel: u32, packet: &[u8]) -> u32 {
        let base = self.layout.packet_size;
        for (i, b) in packet.iter().enumerate() {
            self.dev.mmio_write(base + i as u64, 1, u32::from(*b));
        }
        self.select(channel);
        self.set_indirect(regs::REG_CURRENT_IO_OUTPUT, packet.len() as u32);
        self.status()
    }

    /// Trigger IOInput on `channel` and read back the latched packet.
    pub fn recv(&mut self, channel: u32) -> Option<Vec<u8>> {
        self.select(channel);
        self.set_indirect(regs::REG_CURRENT_IO_INPUT, 0);
        let len = self.indirect(regs::REG_CURRENT_IO_INPUT);
        if len == NO_PACKET {
            return None;
        }
        Some(
            (0..u64::from(len))
                .map(|i| self.dev.mmio_read(i, 1) as u8)
                .collect(),
        )
    }
}
