//! Scripted guest/host exchange over the transport's register window.
//!
//! The guest half is driven purely through bus accesses, the way the guest driver would: it
//! attaches to a channel the host minted, advertises it in the address directory, and echoes
//! every packet the host sends.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context, Result};
use armemu_dma_transport::directory::decode_scan;
use armemu_dma_transport::regs::{self, GlobalBits, Operation, RegisterLayout, NO_PACKET};
use armemu_dma_transport::{AddressRecord, DirectoryRequest, DmaTransport, TransportError};
use armemu_platform::{LevelInterrupts, MmioBus};

/// Where the board maps the transport's register window.
pub const TRANSPORT_BASE: u64 = 0x4800_0000;

/// Identity the guest publishes for its echo channel.
pub const ECHO_SERVICE: &[u8] = b"armemu.echo";

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopbackReport {
    pub channel: u32,
    pub packets: usize,
    pub bytes: usize,
    pub interrupts: usize,
    pub directory_entries: usize,
}

fn check(status: u32) -> std::result::Result<(), TransportError> {
    match TransportError::from_status_code(status) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

struct BusGuest<'a> {
    bus: &'a mut MmioBus,
    base: u64,
    layout: RegisterLayout,
}

impl BusGuest<'_> {
    fn indirect(&mut self, reg: u64) -> u32 {
        self.bus.read_u32(self.base + self.layout.indirect(reg))
    }

    fn set_indirect(&mut self, reg: u64, value: u32) {
        self.bus
            .write_u32(self.base + self.layout.indirect(reg), value);
    }

    fn status(&mut self) -> std::result::Result<(), TransportError> {
        let status = self.indirect(regs::REG_STATUS);
        check(status)
    }

    fn operation(&mut self, channel: u32, op: Operation) -> Result<()> {
        self.set_indirect(regs::REG_CURRENT_CHANNEL, channel);
        self.set_indirect(regs::REG_OPERATION, op as u32);
        self.status()
            .with_context(|| format!("{op:?} on channel {channel}"))
    }

    fn new_channel(&mut self, op: Operation) -> Result<u32> {
        self.set_indirect(regs::REG_OPERATION, op as u32);
        self.status().with_context(|| format!("{op:?}"))?;
        Ok(self.indirect(regs::REG_CURRENT_CHANNEL))
    }

    fn set_global(&mut self, channel: u32, bits: GlobalBits) -> Result<()> {
        self.set_indirect(regs::REG_CURRENT_CHANNEL, channel);
        self.set_indirect(regs::REG_CURRENT_GLOBAL, bits.bits());
        self.status()
            .with_context(|| format!("enabling channel {channel}"))
    }

    fn acknowledge_irq(&mut self) {
        let ack = self.base + self.layout.static_block(0) + regs::BLOCK_IRQ_ACK;
        self.bus.write_u32(ack, 1);
    }

    fn write_packet(&mut self, channel: u32, packet: &[u8]) -> Result<()> {
        let out = self.base + self.layout.packet_size;
        for (i, chunk) in packet.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.bus
                .write_u32(out + 4 * i as u64, u32::from_le_bytes(word));
        }
        self.set_indirect(regs::REG_CURRENT_CHANNEL, channel);
        self.set_indirect(regs::REG_CURRENT_IO_OUTPUT, packet.len() as u32);
        self.status()
            .with_context(|| format!("IOOutput on channel {channel}"))
    }

    fn read_packet(&mut self, channel: u32) -> Option<Vec<u8>> {
        self.set_indirect(regs::REG_CURRENT_CHANNEL, channel);
        self.set_indirect(regs::REG_CURRENT_IO_INPUT, 0);
        let len = self.indirect(regs::REG_CURRENT_IO_INPUT);
        if len == NO_PACKET {
            return None;
        }
        let mut packet = Vec::with_capacity(len as usize);
        for offset in (0..u64::from(len)).step_by(4) {
            let word = self.bus.read_u32(self.base + offset).to_le_bytes();
            packet.extend_from_slice(&word);
        }
        packet.truncate(len as usize);
        Some(packet)
    }

    /// Poll IOInput until a packet shows up; directory replies arrive asynchronously.
    fn wait_packet(&mut self, channel: u32, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.read_packet(channel) {
                return Some(packet);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Echo `packets` host packets through the guest and verify every byte comes back.
pub fn run(
    transport: &DmaTransport,
    bus: &mut MmioBus,
    irq: &LevelInterrupts,
    packets: usize,
) -> Result<LoopbackReport> {
    let host = transport
        .bind_new_virtual()
        .context("binding host channel")?;
    let channel = host.index();
    let line = transport.config().irq_line;
    let mut guest = BusGuest {
        bus,
        base: TRANSPORT_BASE,
        layout: *transport.layout(),
    };

    guest.operation(channel, Operation::Attach)?;
    guest.set_global(channel, GlobalBits::ENABLE | GlobalBits::IRQ_ENABLE)?;

    let addr = guest.new_channel(Operation::NewAddressChannel)?;
    guest.set_global(addr, GlobalBits::ENABLE)?;
    let publish = DirectoryRequest::Publish(AddressRecord::new(ECHO_SERVICE, channel));
    guest.write_packet(addr, &publish.encode())?;
    let reply = guest
        .wait_packet(addr, REPLY_TIMEOUT)
        .context("no reply from the address directory")?;
    ensure!(
        reply == 0u32.to_le_bytes(),
        "publishing {:?} failed: {reply:?}",
        String::from_utf8_lossy(ECHO_SERVICE)
    );

    let (records, _) = decode_scan(&transport.scan_addresses(None))?;
    ensure!(
        records
            .iter()
            .any(|r| r.id == ECHO_SERVICE && r.owner == channel),
        "echo service missing from the directory"
    );

    let mut report = LoopbackReport {
        channel,
        directory_entries: records.len(),
        ..LoopbackReport::default()
    };
    let mut buf = vec![0u8; transport.config().packet_size as usize];
    for seq in 0..packets {
        let payload = format!("loopback packet {seq}").into_bytes();
        host.send(&payload)?;

        if !irq.is_asserted(line) {
            bail!("interrupt not raised for packet {seq}");
        }
        report.interrupts += 1;
        guest.acknowledge_irq();

        let packet = guest
            .read_packet(channel)
            .with_context(|| format!("guest saw no data for packet {seq}"))?;
        guest.write_packet(channel, &packet)?;

        let len = host.receive(&mut buf, REPLY_TIMEOUT)?;
        ensure!(len > 0, "host timed out waiting for packet {seq}");
        ensure!(buf[..len] == payload[..], "echo mismatch on packet {seq}");
        tracing::trace!(seq, len, "loopback packet verified");

        report.packets += 1;
        report.bytes += len;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use armemu_dma_transport::TransportConfig;
    use armemu_platform::{Dispatcher, InlineDispatcher, WorkerPool};
    use pretty_assertions::assert_eq;

    use super::*;

    fn board(dispatcher: Arc<dyn Dispatcher>) -> (DmaTransport, MmioBus, Arc<LevelInterrupts>) {
        let irq = Arc::new(LevelInterrupts::new());
        let transport =
            DmaTransport::new(TransportConfig::default(), irq.clone(), dispatcher).unwrap();
        let mut bus = MmioBus::new();
        let device = transport.device();
        bus.register_range(TRANSPORT_BASE, device.window_size(), Box::new(device));
        (transport, bus, irq)
    }

    #[test]
    fn loopback_with_inline_dispatch() {
        let (transport, mut bus, irq) = board(Arc::new(InlineDispatcher));
        let report = run(&transport, &mut bus, &irq, 4).unwrap();
        assert_eq!(report.packets, 4);
        assert_eq!(report.interrupts, 4);
        assert_eq!(report.directory_entries, 1);
        assert!(report.channel >= transport.config().first_dynamic_index());
    }

    #[test]
    fn loopback_with_worker_pool() {
        let (transport, mut bus, irq) = board(Arc::new(WorkerPool::new(2).unwrap()));
        let report = run(&transport, &mut bus, &irq, 8).unwrap();
        assert_eq!(report.packets, 8);
        assert_eq!(
            report.bytes,
            (0..8)
                .map(|seq| format!("loopback packet {seq}").len())
                .sum::<usize>()
        );
    }
}
