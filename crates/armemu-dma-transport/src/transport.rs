//! The transport subsystem object shared by the register device and host handles.
//!
//! All channel, pool, register and interrupt state lives in [`TransportState`] behind one mutex
//! (the device lock). The guest thread holds it for the whole of each register access; host
//! handles take it only to enqueue or dequeue, and wait for data on a per-channel condition
//! variable with the lock released.
//!
//! The address directory has its own lock, always taken after the device lock. Requests to the
//! directory arriving over a channel are executed on the dispatcher once the device lock has been
//! released; their replies come back through a [`CompletionPort`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use armemu_platform::{CompletionPort, Dispatcher, InterruptController};

use crate::channel::{ConnectionState, Side};
use crate::config::{ConfigError, TransportConfig};
use crate::directory::{AddressDirectory, AddressRecord, DirectoryRequest};
use crate::error::{status_of, Result, TransportError};
use crate::handle::{ChannelHandle, HandleInner};
use crate::pool::ChannelPool;
use crate::queue::{FullPolicy, QueueFull};
use crate::regs::{ChannelFlags, GlobalBits, RegisterLayout};

/// Indirection block registers.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IndirectRegs {
    pub current: u32,
    pub operation: u32,
    pub status: u32,
    pub forward: u32,
    pub reverse: u32,
    pub write: u32,
}

pub(crate) struct TransportState {
    pub pool: ChannelPool,
    pub static_globals: Vec<u32>,
    pub regs: IndirectRegs,
    pub input: Box<[u8]>,
    pub output: Box<[u8]>,
    pub irq_asserted: bool,
}

impl TransportState {
    fn new(config: &TransportConfig) -> Self {
        Self {
            pool: ChannelPool::new(config),
            static_globals: vec![0; config.static_channels as usize],
            regs: IndirectRegs::default(),
            input: vec![0u8; config.packet_size as usize].into_boxed_slice(),
            output: vec![0u8; config.packet_size as usize].into_boxed_slice(),
            irq_asserted: false,
        }
    }

    pub fn global(&self, index: u32) -> GlobalBits {
        let bits = match self.static_globals.get(index as usize) {
            Some(bits) => *bits,
            None => self.pool.get(index).map_or(0, |r| r.global),
        };
        GlobalBits::from_bits_truncate(bits)
    }

    pub fn flags(&self, index: u32) -> ChannelFlags {
        let Some(record) = self.pool.get(index) else {
            return ChannelFlags::empty();
        };
        let state = record.state();
        let mut flags = ChannelFlags::empty();
        flags.set(
            ChannelFlags::DEVICE_CONNECTED,
            state.contains(ConnectionState::DEVICE),
        );
        flags.set(
            ChannelFlags::DESKTOP_CONNECTED,
            state.contains(ConnectionState::DESKTOP),
        );
        flags.set(
            ChannelFlags::ADDR_CONNECTED,
            state.contains(ConnectionState::ADDR),
        );
        flags.set(ChannelFlags::DATA_READY, !record.to_device.is_empty());
        flags.set(ChannelFlags::DESKTOP_PENDING, record.has_desktop_data());
        flags
    }

    /// Whether channel `index` currently wants the interrupt line.
    pub fn irq_pending(&self, index: u32) -> bool {
        self.global(index).contains(GlobalBits::IRQ_ENABLE)
            && self
                .pool
                .get(index)
                .is_some_and(|r| !r.to_device.is_empty())
    }
}

/// A packet written to an address-connected channel, waiting to be handled by the directory.
#[derive(Debug)]
pub(crate) struct DirectoryJob {
    pub index: u32,
    pub generation: u32,
    pub side: Side,
    pub packet: Vec<u8>,
}

/// The directory's answer to a [`DirectoryJob`], routed back to the requesting side.
#[derive(Debug)]
struct DirectoryReply {
    index: u32,
    generation: u32,
    side: Side,
    packet: Vec<u8>,
}

pub(crate) struct Shared {
    pub config: TransportConfig,
    pub layout: RegisterLayout,
    state: Mutex<TransportState>,
    pub directory: Mutex<AddressDirectory>,
    irq: Arc<dyn InterruptController>,
    dispatcher: Arc<dyn Dispatcher>,
    replies: CompletionPort<DirectoryReply>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub fn lock_state(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_directory(&self) -> MutexGuard<'_, AddressDirectory> {
        self.directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Bring the shared interrupt line in line with the channels' pending state.
    pub fn update_irq(&self, state: &mut TransportState) {
        let pending = state.pool.iter().any(|r| state.irq_pending(r.index()));
        if pending && !state.irq_asserted {
            tracing::debug!(line = self.config.irq_line, "raising transport interrupt");
            state.irq_asserted = true;
            self.irq.raise(self.config.irq_line);
        } else if !pending && state.irq_asserted {
            state.irq_asserted = false;
            self.irq.clear(self.config.irq_line);
        }
    }

    /// IRQAcknowledge: lower the shared line regardless of pending channels.
    pub fn acknowledge_irq(&self, state: &mut TransportState) {
        state.irq_asserted = false;
        self.irq.clear(self.config.irq_line);
    }

    /// Attach a new host handle to `index` while holding the device lock.
    fn bind_locked(
        self: &Arc<Self>,
        state: &mut TransportState,
        index: u32,
    ) -> Result<ChannelHandle> {
        let slot = state.pool.create_channel(index, Side::Desktop)?;
        let inner = Arc::new(HandleInner::new(self.clone(), index));
        state
            .pool
            .record_mut(slot)
            .bind_facade(Arc::downgrade(&inner));
        Ok(ChannelHandle::from_inner(inner))
    }

    /// Called when the last clone of a host handle goes away.
    pub fn release_desktop(&self, index: u32) {
        let mut state = self.lock_state();
        if !state.pool.is_in_use(index, Side::Desktop) {
            return;
        }
        if let Err(err) = state.pool.detach(index, Side::Desktop, &self.directory) {
            tracing::warn!(index, "failed to release host handle: {err}");
        }
        self.update_irq(&mut state);
    }

    pub fn send(self: &Arc<Self>, index: u32, packet: &[u8], policy: FullPolicy) -> Result<()> {
        if packet.len() > self.config.packet_size as usize {
            return Err(TransportError::InvalidArgument);
        }
        let job = {
            let mut state = self.lock_state();
            let record = state
                .pool
                .get_mut(index)
                .filter(|r| r.is_attached(Side::Desktop))
                .ok_or(TransportError::InvalidArgument)?;

            if record.state().contains(ConnectionState::ADDR) {
                Some(DirectoryJob {
                    index,
                    generation: record.generation(),
                    side: Side::Desktop,
                    packet: packet.to_vec(),
                })
            } else {
                if self.config.is_dynamic(index) && !record.is_attached(Side::Device) {
                    return Err(TransportError::NotReady);
                }
                record
                    .to_device
                    .enqueue(packet, policy)
                    .map_err(|QueueFull| TransportError::QueueFull)?;
                tracing::trace!(index, len = packet.len(), "host packet queued for guest");
                self.update_irq(&mut state);
                None
            }
        };
        if let Some(job) = job {
            self.dispatch_directory_jobs(vec![job]);
        }
        Ok(())
    }

    pub fn receive(&self, index: u32, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        loop {
            let record = state
                .pool
                .get_mut(index)
                .filter(|r| r.is_attached(Side::Desktop))
                .ok_or(TransportError::InvalidArgument)?;
            if let Some(len) = record.to_desktop.dequeue(buf) {
                tracing::trace!(index, len, "guest packet delivered to host");
                return Ok(len.min(buf.len()));
            }
            let ready = record.ready_signal().clone();

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    deadline - now
                }
                None => Duration::MAX,
            };
            state = ready
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Queue directory requests on the dispatcher. Must be called without the device lock held.
    pub fn dispatch_directory_jobs(self: &Arc<Self>, jobs: Vec<DirectoryJob>) {
        for job in jobs {
            let shared = self.clone();
            self.dispatcher
                .schedule(Box::new(move || shared.run_directory_job(job)));
        }
    }

    fn run_directory_job(&self, job: DirectoryJob) {
        let reply = match DirectoryRequest::decode(&job.packet) {
            Ok(DirectoryRequest::Scan) => {
                let requester = self
                    .lock_state()
                    .pool
                    .get(job.index)
                    .filter(|r| r.generation() == job.generation)
                    .map(|r| r.presence().clone());
                self.lock_directory().scan(requester.as_deref())
            }
            Ok(DirectoryRequest::Publish(record)) => {
                status_of(&self.publish(record)).to_le_bytes().to_vec()
            }
            Ok(DirectoryRequest::Withdraw(record)) => {
                let found = self.lock_directory().withdraw(&record.id, record.owner);
                let result: Result<()> = if found {
                    Ok(())
                } else {
                    Err(TransportError::InvalidArgument)
                };
                status_of(&result).to_le_bytes().to_vec()
            }
            Err(err) => err.status_code().to_le_bytes().to_vec(),
        };
        // The directory lock is released before the reply is routed back into a channel.
        self.replies.post(DirectoryReply {
            index: job.index,
            generation: job.generation,
            side: job.side,
            packet: reply,
        });
    }

    fn deliver_directory_reply(&self, reply: DirectoryReply) {
        let mut state = self.lock_state();
        let Some(record) = state
            .pool
            .get_mut(reply.index)
            .filter(|r| r.generation() == reply.generation && r.is_attached(reply.side))
        else {
            tracing::debug!(index = reply.index, "directory reply for a closed channel");
            return;
        };
        match reply.side {
            Side::Device => {
                let _ = record.to_device.enqueue(&reply.packet, FullPolicy::DropOldest);
                self.update_irq(&mut state);
            }
            Side::Desktop => {
                let _ = record.to_desktop.enqueue(&reply.packet, FullPolicy::DropOldest);
                record.ready_signal().notify_all();
            }
        }
    }

    pub fn publish(&self, record: AddressRecord) -> Result<()> {
        let owner = self
            .lock_state()
            .pool
            .get(record.owner)
            .map(|r| r.presence().clone())
            .ok_or(TransportError::InvalidArgument)?;
        self.lock_directory().publish(record, &owner)
    }
}

/// The DMA transport of one emulated board.
///
/// Created once at power-on; clones share the same channels. The guest reaches it through
/// [`DmaTransport::device`], the host through [`DmaTransport::bind`].
#[derive(Debug, Clone)]
pub struct DmaTransport {
    pub(crate) shared: Arc<Shared>,
}

impl DmaTransport {
    pub fn new(
        config: TransportConfig,
        irq: Arc<dyn InterruptController>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let replies = CompletionPort::associate(dispatcher.clone(), move |reply: DirectoryReply| {
                if let Some(shared) = weak.upgrade() {
                    shared.deliver_directory_reply(reply);
                }
            });
            Shared {
                layout: RegisterLayout::new(&config),
                state: Mutex::new(TransportState::new(&config)),
                directory: Mutex::new(AddressDirectory::new(config.packet_size as usize)),
                config,
                irq,
                dispatcher,
                replies,
            }
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.shared.layout
    }

    /// Bind a host handle to channel `index`.
    ///
    /// Static channels are usable immediately. A virtual index may be bound before the guest
    /// attaches; sends fail with [`TransportError::NotReady`] until it does.
    pub fn bind(&self, index: u32) -> Result<ChannelHandle> {
        let mut state = self.shared.lock_state();
        self.shared.bind_locked(&mut state, index)
    }

    /// Mint a fresh virtual channel index and bind a host handle to it.
    pub fn bind_new_virtual(&self) -> Result<ChannelHandle> {
        let mut state = self.shared.lock_state();
        let index = state.pool.next_unused_index(Side::Desktop)?;
        self.shared.bind_locked(&mut state, index)
    }

    pub fn is_in_use(&self, index: u32, side: Side) -> bool {
        self.shared.lock_state().pool.is_in_use(index, side)
    }

    pub fn channel_state(&self, index: u32) -> Option<ConnectionState> {
        self.shared.lock_state().pool.get(index).map(|r| r.state())
    }

    /// Number of live channel records.
    pub fn channel_count(&self) -> usize {
        self.shared.lock_state().pool.len()
    }

    pub fn irq_asserted(&self) -> bool {
        self.shared.lock_state().irq_asserted
    }

    /// Publish one encoded `[len][id][owner]` record on behalf of its owning channel.
    pub fn publish_address(&self, encoded: &[u8]) -> Result<()> {
        let record = AddressRecord::decode(encoded)?;
        self.shared.publish(record)
    }

    pub fn withdraw_address(&self, id: &[u8], owner: u32) -> bool {
        self.shared.lock_directory().withdraw(id, owner)
    }

    /// Next page of the directory, resuming where `requester` left off.
    pub fn scan_addresses(&self, requester: Option<&ChannelHandle>) -> Vec<u8> {
        let presence = requester.and_then(|handle| {
            self.shared
                .lock_state()
                .pool
                .get(handle.index())
                .map(|r| r.presence().clone())
        });
        self.shared.lock_directory().scan(presence.as_deref())
    }

    /// Number of entries in the directory, including ones not yet collected.
    pub fn address_count(&self) -> usize {
        self.shared.lock_directory().len()
    }
}
