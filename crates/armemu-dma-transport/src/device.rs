//! Guest-facing register window of the DMA transport.

use std::sync::Arc;

use armemu_platform::MmioDevice;

use crate::channel::{ConnectionState, Side};
use crate::error::{status_of, Result, TransportError};
use crate::queue::{FullPolicy, QueueFull};
use crate::regs::{self, GlobalBits, Operation, Register, NO_PACKET};
use crate::transport::{DirectoryJob, DmaTransport, Shared, TransportState};

/// Value returned for reads the window does not decode.
const OPEN_BUS: u32 = 0xFFFF_FFFF;

/// MMIO view of a [`DmaTransport`], mounted on the board bus at the transport's base address.
#[derive(Debug, Clone)]
pub struct DmaTransportDevice {
    pub(crate) shared: Arc<Shared>,
}

impl DmaTransport {
    pub fn device(&self) -> DmaTransportDevice {
        DmaTransportDevice {
            shared: self.shared.clone(),
        }
    }
}

impl DmaTransportDevice {
    pub fn window_size(&self) -> u64 {
        self.shared.layout.window_size()
    }

    fn read_locked(&self, state: &TransportState, offset: u64, size: usize) -> u32 {
        match self.shared.layout.decode(offset) {
            Some(Register::InputBuffer(pos)) => read_buffer(&state.input, pos, size),
            Some(Register::OutputBuffer(pos)) => read_buffer(&state.output, pos, size),
            Some(reg) if size == 4 => self.read_register(state, reg),
            _ => {
                tracing::debug!(offset, size, "invalid transport register read");
                OPEN_BUS
            }
        }
    }

    fn read_register(&self, state: &TransportState, reg: Register) -> u32 {
        match reg {
            Register::InputBuffer(_) | Register::OutputBuffer(_) => OPEN_BUS,
            Register::Flags(index) => state.flags(index).bits(),
            Register::Static { channel, reg } => match reg {
                regs::BLOCK_GLOBAL => state.global(channel).bits(),
                regs::BLOCK_FLAGS => state.flags(channel).bits(),
                regs::BLOCK_IO_INPUT => input_len(state, channel),
                regs::BLOCK_IRQ => u32::from(state.irq_pending(channel)),
                _ => 0,
            },
            Register::Indirect(reg) => {
                let ind = &state.regs;
                match reg {
                    regs::REG_CURRENT_CHANNEL => ind.current,
                    regs::REG_OPERATION => ind.operation,
                    regs::REG_STATUS => ind.status,
                    regs::REG_CURRENT_GLOBAL => state.global(ind.current).bits(),
                    regs::REG_CURRENT_FLAGS => state.flags(ind.current).bits(),
                    regs::REG_CURRENT_IO_INPUT => input_len(state, ind.current),
                    regs::REG_FORWARD_CHANNEL => ind.forward,
                    regs::REG_FORWARD_FLAGS => state.flags(ind.forward).bits(),
                    regs::REG_REVERSE_CHANNEL => ind.reverse,
                    regs::REG_REVERSE_FLAGS => state.flags(ind.reverse).bits(),
                    regs::REG_WRITE_CHANNEL => ind.write,
                    regs::REG_WRITE_FLAGS => state.flags(ind.write).bits(),
                    _ => 0,
                }
            }
        }
    }

    fn write_locked(
        &self,
        state: &mut TransportState,
        jobs: &mut Vec<DirectoryJob>,
        offset: u64,
        size: usize,
        value: u32,
    ) {
        let reg = match self.shared.layout.decode(offset) {
            Some(Register::InputBuffer(pos)) => {
                return write_buffer(&mut state.input, pos, size, value, offset)
            }
            Some(Register::OutputBuffer(pos)) => {
                return write_buffer(&mut state.output, pos, size, value, offset)
            }
            Some(reg) if size == 4 => reg,
            _ => {
                tracing::debug!(offset, size, value, "invalid transport register write");
                return;
            }
        };

        let current = state.regs.current;
        match reg {
            Register::Static { channel, reg } => match reg {
                regs::BLOCK_GLOBAL => {
                    state.static_globals[channel as usize] = value & GlobalBits::all().bits();
                    self.shared.update_irq(state);
                }
                regs::BLOCK_IO_INPUT => {
                    let result = self.io_input(state, channel);
                    state.regs.status = status_of(&result);
                }
                regs::BLOCK_IO_OUTPUT => {
                    let result = self.io_output(state, channel, value);
                    state.regs.status = status_of(&result);
                    jobs.extend(result.ok().flatten());
                }
                regs::BLOCK_IRQ_ACK => self.shared.acknowledge_irq(state),
                _ => tracing::debug!(channel, reg, "write to read-only static register"),
            },
            Register::Indirect(reg) => match reg {
                regs::REG_CURRENT_CHANNEL => state.regs.current = value,
                regs::REG_OPERATION => {
                    state.regs.operation = value;
                    state.regs.status = self.run_operation(state, value);
                }
                regs::REG_CURRENT_GLOBAL => {
                    let result = self.set_global(state, current, value);
                    state.regs.status = status_of(&result);
                }
                regs::REG_CURRENT_IO_INPUT => {
                    let result = self.io_input(state, current);
                    state.regs.status = status_of(&result);
                }
                regs::REG_CURRENT_IO_OUTPUT => {
                    let result = self.io_output(state, current, value);
                    state.regs.status = status_of(&result);
                    jobs.extend(result.ok().flatten());
                }
                regs::REG_FORWARD_CHANNEL => state.regs.forward = value,
                regs::REG_REVERSE_CHANNEL => state.regs.reverse = value,
                regs::REG_WRITE_CHANNEL => state.regs.write = value,
                _ => tracing::debug!(reg, "write to read-only indirection register"),
            },
            Register::Flags(index) => tracing::debug!(index, "write to read-only flags register"),
            Register::InputBuffer(_) | Register::OutputBuffer(_) => {}
        }
    }

    fn set_global(&self, state: &mut TransportState, index: u32, value: u32) -> Result<()> {
        let value = value & GlobalBits::all().bits();
        if let Some(global) = state.static_globals.get_mut(index as usize) {
            *global = value;
        } else {
            let record = state
                .pool
                .get_mut(index)
                .filter(|r| r.is_attached(Side::Device))
                .ok_or(TransportError::InvalidArgument)?;
            record.global = value;
        }
        self.shared.update_irq(state);
        Ok(())
    }

    /// IOInput trigger: move the next host packet into the input buffer.
    fn io_input(&self, state: &mut TransportState, index: u32) -> Result<()> {
        let enabled = state.global(index).contains(GlobalBits::ENABLE);
        let TransportState { pool, input, .. } = &mut *state;
        let record = pool
            .get_mut(index)
            .filter(|r| r.is_attached(Side::Device) || self.shared.config.is_static(index))
            .ok_or(TransportError::NotReady)?;
        record.input_len = NO_PACKET;
        if !enabled {
            return Err(TransportError::NotReady);
        }
        let result = match record.to_device.dequeue(input) {
            Some(len) => {
                tracing::trace!(index, len, "guest received packet");
                record.input_len = len as u32;
                Ok(())
            }
            None => Err(TransportError::NotReady),
        };
        self.shared.update_irq(state);
        result
    }

    /// IOOutput trigger: send `len` bytes of the output buffer to the host or the directory.
    fn io_output(
        &self,
        state: &mut TransportState,
        index: u32,
        len: u32,
    ) -> Result<Option<DirectoryJob>> {
        if !state.global(index).contains(GlobalBits::ENABLE) {
            return Err(TransportError::NotReady);
        }
        let attached = state.pool.is_in_use(index, Side::Device);
        if !attached {
            if !self.shared.config.is_static(index) {
                return Err(TransportError::InvalidArgument);
            }
            state.pool.create_channel(index, Side::Device)?;
        }

        let TransportState { pool, output, .. } = &mut *state;
        let packet = &output[..(len as usize).min(output.len())];
        let record = pool
            .get_mut(index)
            .ok_or(TransportError::GeneralFailure)?;

        if record.state().contains(ConnectionState::ADDR) {
            return Ok(Some(DirectoryJob {
                index,
                generation: record.generation(),
                side: Side::Device,
                packet: packet.to_vec(),
            }));
        }
        if self.shared.config.is_dynamic(index) && !record.is_attached(Side::Desktop) {
            return Err(TransportError::NotReady);
        }
        record
            .to_desktop
            .enqueue(packet, FullPolicy::DropOldest)
            .map_err(|QueueFull| TransportError::QueueFull)?;
        tracing::trace!(index, len = packet.len(), "guest sent packet");
        record.ready_signal().notify_all();
        Ok(None)
    }

    fn run_operation(&self, state: &mut TransportState, opcode: u32) -> u32 {
        let current = state.regs.current;
        let result = match Operation::from_u32(opcode) {
            Some(Operation::Attach) => state.pool.create_channel(current, Side::Device).map(drop),
            Some(Operation::Detach) => {
                state
                    .pool
                    .detach(current, Side::Device, &self.shared.directory)
            }
            Some(Operation::IsInUse) => {
                return u32::from(state.pool.is_in_use(current, Side::Device));
            }
            Some(Operation::NewVirtualChannel) => self.new_channel(state, false),
            Some(Operation::NewAddressChannel) => self.new_channel(state, true),
            None => Err(TransportError::InvalidArgument),
        };
        if let Err(err) = result {
            tracing::debug!(opcode, channel = current, "transport operation failed: {err}");
        }
        self.shared.update_irq(state);
        status_of(&result)
    }

    fn new_channel(&self, state: &mut TransportState, addr: bool) -> Result<()> {
        let index = state.pool.next_unused_index(Side::Device)?;
        let slot = state.pool.create_channel(index, Side::Device)?;
        if addr {
            self.shared
                .lock_directory()
                .connect(state.pool.record_mut(slot));
        }
        state.regs.current = index;
        Ok(())
    }
}

fn input_len(state: &TransportState, index: u32) -> u32 {
    state.pool.get(index).map_or(NO_PACKET, |r| r.input_len)
}

fn read_buffer(buf: &[u8], pos: usize, size: usize) -> u32 {
    match buf.get(pos..pos + size) {
        Some(bytes) if matches!(size, 1 | 2 | 4) => bytes
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
        _ => {
            tracing::debug!(pos, size, "invalid transport buffer read");
            OPEN_BUS
        }
    }
}

fn write_buffer(buf: &mut [u8], pos: usize, size: usize, value: u32, offset: u64) {
    match buf.get_mut(pos..pos + size) {
        Some(bytes) if matches!(size, 1 | 2 | 4) => {
            bytes.copy_from_slice(&value.to_le_bytes()[..size]);
        }
        _ => tracing::debug!(offset, size, value, "invalid transport buffer write"),
    }
}

impl MmioDevice for DmaTransportDevice {
    fn mmio_read(&mut self, offset: u64, size: usize) -> u32 {
        let state = self.shared.lock_state();
        self.read_locked(&state, offset, size)
    }

    fn mmio_write(&mut self, offset: u64, size: usize, value: u32) {
        let mut jobs = Vec::new();
        {
            let mut state = self.shared.lock_state();
            self.write_locked(&mut state, &mut jobs, offset, size, value);
        }
        if !jobs.is_empty() {
            self.shared.dispatch_directory_jobs(jobs);
        }
    }

    fn reset(&mut self) {
        let mut state = self.shared.lock_state();
        state.pool.disconnect_all(Side::Device, &self.shared.directory);
        state.static_globals.fill(0);
        state.regs = Default::default();
        state.input.fill(0);
        state.output.fill(0);
        self.shared.acknowledge_irq(&mut state);
        tracing::debug!("transport reset");
    }
}
