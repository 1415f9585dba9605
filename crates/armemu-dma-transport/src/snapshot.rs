//! Suspend/resume state of the transport.
//!
//! Only the guest's half survives a snapshot: device-attached channels, the address directory,
//! and the register file. Queued packets are not saved; host handles re-bind after resume.

use armemu_io_snapshot::io::state::codec::{Decoder, Encoder};
use armemu_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use armemu_platform::MmioDevice;

use crate::channel::Side;
use crate::device::DmaTransportDevice;
use crate::directory::{decode_scan, AddressRecord, SCAN_END};
use crate::regs::GlobalBits;

const TAG_DEVICE_CHANNELS: u16 = 1;
const TAG_ADDRESSES: u16 = 2;
const TAG_ADDR_CHANNELS: u16 = 3;
const TAG_STATIC_GLOBALS: u16 = 4;
const TAG_CURRENT_CHANNEL: u16 = 5;
const TAG_NEXT_INDEX: u16 = 6;
const TAG_DYNAMIC_GLOBALS: u16 = 7;

fn encode_u32_list(values: impl ExactSizeIterator<Item = u32>) -> Vec<u8> {
    let mut enc = Encoder::new().u32(values.len() as u32);
    for v in values {
        enc = enc.u32(v);
    }
    enc.finish()
}

fn decode_u32_list(buf: &[u8]) -> SnapshotResult<Vec<u32>> {
    let mut d = Decoder::new(buf);
    let count = d.u32()? as usize;
    if count > d.remaining() / 4 {
        return Err(SnapshotError::InvalidFieldEncoding("channel list length"));
    }
    let values = (0..count).map(|_| d.u32()).collect::<SnapshotResult<Vec<_>>>()?;
    d.finish()?;
    Ok(values)
}

fn decode_dynamic_globals(buf: &[u8]) -> SnapshotResult<Vec<(u32, u32)>> {
    let mut d = Decoder::new(buf);
    let count = d.u32()? as usize;
    if count > d.remaining() / 8 {
        return Err(SnapshotError::InvalidFieldEncoding("global register list length"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push((d.u32()?, d.u32()?));
    }
    d.finish()?;
    Ok(out)
}

impl IoSnapshot for DmaTransportDevice {
    const DEVICE_ID: [u8; 4] = *b"DMAT";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let state = self.shared.lock_state();
        let directory = self.shared.lock_directory();

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);

        let device = state.pool.indices_attached(Side::Device);
        w.field_bytes(TAG_DEVICE_CHANNELS, encode_u32_list(device.iter().copied()));

        let mut addresses = Vec::new();
        for record in directory.live_records() {
            record.encode_into(&mut addresses);
        }
        addresses.extend_from_slice(&SCAN_END.to_le_bytes());
        w.field_bytes(TAG_ADDRESSES, addresses);

        let subscribers: Vec<u32> = directory.subscribers().collect();
        w.field_bytes(TAG_ADDR_CHANNELS, encode_u32_list(subscribers.into_iter()));

        w.field_bytes(
            TAG_STATIC_GLOBALS,
            encode_u32_list(state.static_globals.iter().copied()),
        );
        w.field_u32(TAG_CURRENT_CHANNEL, state.regs.current);
        w.field_u32(TAG_NEXT_INDEX, state.pool.peek_next_index());

        let dynamic: Vec<(u32, u32)> = state
            .pool
            .iter()
            .filter(|r| r.is_attached(Side::Device) && r.global != 0)
            .filter(|r| !self.shared.config.is_static(r.index()))
            .map(|r| (r.index(), r.global))
            .collect();
        let mut enc = Encoder::new().u32(dynamic.len() as u32);
        for (index, global) in dynamic {
            enc = enc.u32(index).u32(global);
        }
        w.field_bytes(TAG_DYNAMIC_GLOBALS, enc.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Decode every field before touching the device so a corrupt blob changes nothing.
        let list = |tag: u16| -> SnapshotResult<Vec<u32>> {
            r.bytes(tag).map_or(Ok(Vec::new()), decode_u32_list)
        };
        let device_channels = list(TAG_DEVICE_CHANNELS)?;
        let addr_channels = list(TAG_ADDR_CHANNELS)?;
        let static_globals = list(TAG_STATIC_GLOBALS)?;
        let addresses: Vec<AddressRecord> = match r.bytes(TAG_ADDRESSES) {
            Some(buf) => {
                decode_scan(buf)
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("address directory"))?
                    .0
            }
            None => Vec::new(),
        };
        let dynamic_globals = r
            .bytes(TAG_DYNAMIC_GLOBALS)
            .map_or(Ok(Vec::new()), decode_dynamic_globals)?;
        let current = r.u32(TAG_CURRENT_CHANNEL)?.unwrap_or(0);
        let next_index = r.u32(TAG_NEXT_INDEX)?;

        self.reset();

        let mut state = self.shared.lock_state();
        for index in device_channels {
            if let Err(err) = state.pool.create_channel(index, Side::Device) {
                tracing::warn!(index, "failed to restore transport channel: {err}");
            }
        }

        {
            let mut directory = self.shared.lock_directory();
            directory.clear();
            for index in addr_channels {
                match state.pool.get_mut(index) {
                    Some(record) => directory.connect(record),
                    None => tracing::warn!(index, "address channel missing after restore"),
                }
            }
            // Saved newest first; publishing prepends.
            for record in addresses.into_iter().rev() {
                let owner = record.owner;
                let Some(presence) = state.pool.get(owner).map(|r| r.presence().clone()) else {
                    tracing::warn!(owner, "dropping address entry for a missing channel");
                    continue;
                };
                if let Err(err) = directory.publish(record, &presence) {
                    tracing::warn!(owner, "dropping address entry on restore: {err}");
                }
            }
        }

        for (slot, value) in state.static_globals.iter_mut().zip(static_globals) {
            *slot = value & GlobalBits::all().bits();
        }
        for (index, value) in dynamic_globals {
            match state.pool.get_mut(index) {
                Some(record) => record.global = value & GlobalBits::all().bits(),
                None => tracing::warn!(index, "global register for a missing channel"),
            }
        }
        state.regs.current = current;
        if let Some(next) = next_index {
            state.pool.set_next_index(next);
        }
        self.shared.update_irq(&mut state);

        Ok(())
    }
}
