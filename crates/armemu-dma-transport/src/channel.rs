//! Per-channel connection state and packet queues.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

use bitflags::bitflags;

use crate::directory::AddressDirectory;
use crate::handle::HandleInner;
use crate::queue::PacketQueue;
use crate::regs::NO_PACKET;

bitflags! {
    /// Which parties currently hold a channel open.
    ///
    /// An allocated record with no bits set is *blank* and may be reused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConnectionState: u32 {
        /// The guest (through the register window).
        const DEVICE = 1 << 0;
        /// A host-side [`crate::ChannelHandle`].
        const DESKTOP = 1 << 1;
        /// The address directory.
        const ADDR = 1 << 2;
    }
}

impl ConnectionState {
    pub const DATA: ConnectionState = ConnectionState::DEVICE.union(ConnectionState::DESKTOP);
}

/// One of the two data-carrying parties of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Device,
    Desktop,
}

impl Side {
    pub const fn bit(self) -> ConnectionState {
        match self {
            Side::Device => ConnectionState::DEVICE,
            Side::Desktop => ConnectionState::DESKTOP,
        }
    }

    pub const fn peer(self) -> Side {
        match self {
            Side::Device => Side::Desktop,
            Side::Desktop => Side::Device,
        }
    }
}

/// Lock-free view of a record's identity, shared with the address directory.
///
/// The directory holds these weakly and reads them without taking the device lock; the record
/// keeps them current under that lock. `generation` changes every time the slot is recycled.
#[derive(Debug, Default)]
pub struct ChannelPresence {
    index: AtomicU32,
    state: AtomicU32,
    generation: AtomicU32,
    // 0 = no saved position, otherwise the serial of the next entry to visit.
    scan_cursor: AtomicU64,
}

impl ChannelPresence {
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Attached by the guest or by a host handle (directory attachment alone does not count).
    pub fn is_data_connected(&self) -> bool {
        self.state().intersects(ConnectionState::DATA)
    }

    pub(crate) fn scan_cursor(&self) -> Option<u64> {
        match self.scan_cursor.load(Ordering::Acquire) {
            0 => None,
            serial => Some(serial),
        }
    }

    pub(crate) fn set_scan_cursor(&self, serial: Option<u64>) {
        self.scan_cursor.store(serial.unwrap_or(0), Ordering::Release);
    }
}

/// Result of [`ChannelRecord::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetachOutcome {
    StillAttached,
    /// Every bit is clear; the pool must unlink the record and recycle its slot.
    Released,
}

#[derive(Debug)]
pub struct ChannelRecord {
    index: u32,
    state: ConnectionState,
    generation: u32,
    /// Packets travelling host → guest, drained by `IOInput`.
    pub(crate) to_device: PacketQueue,
    /// Packets travelling guest → host, drained by [`crate::ChannelHandle::receive`].
    pub(crate) to_desktop: PacketQueue,
    ready: Arc<Condvar>,
    presence: Arc<ChannelPresence>,
    facade: Option<Weak<HandleInner>>,
    /// Global register for channels outside the static register blocks.
    pub(crate) global: u32,
    /// Length latched by the last `IOInput` trigger.
    pub(crate) input_len: u32,
}

impl ChannelRecord {
    pub(crate) fn new(queue_depth: usize, packet_size: usize) -> Self {
        Self {
            index: 0,
            state: ConnectionState::empty(),
            generation: 0,
            to_device: PacketQueue::new(queue_depth, packet_size),
            to_desktop: PacketQueue::new(queue_depth, packet_size),
            ready: Arc::new(Condvar::new()),
            presence: Arc::new(ChannelPresence::default()),
            facade: None,
            global: 0,
            input_len: NO_PACKET,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_blank(&self) -> bool {
        self.state.is_empty()
    }

    pub fn is_attached(&self, side: Side) -> bool {
        self.state.contains(side.bit())
    }

    pub fn presence(&self) -> &Arc<ChannelPresence> {
        &self.presence
    }

    pub(crate) fn ready_signal(&self) -> &Arc<Condvar> {
        &self.ready
    }

    /// Host-bound data is waiting; stays set until the host drains the queue.
    pub fn has_desktop_data(&self) -> bool {
        !self.to_desktop.is_empty()
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.presence.state.store(state.bits(), Ordering::Release);
    }

    pub(crate) fn set_addr_connected(&mut self, connected: bool) {
        let mut state = self.state;
        state.set(ConnectionState::ADDR, connected);
        self.set_state(state);
    }

    /// Return a blank record to its power-on contents for a new owner.
    pub(crate) fn recycle(&mut self) {
        debug_assert!(self.is_blank(), "recycling attached channel {}", self.index);
        self.generation = self.generation.wrapping_add(1);
        self.presence
            .generation
            .store(self.generation, Ordering::Release);
        self.presence.set_scan_cursor(None);
        self.to_device.clear();
        self.to_desktop.clear();
        self.facade = None;
        self.global = 0;
        self.input_len = NO_PACKET;
    }

    /// Attach `side` to this record under `index`.
    ///
    /// The record must be blank, or held only by the other data side (possibly alongside the
    /// directory). Host facades are bound separately with [`Self::bind_facade`].
    pub(crate) fn attach(&mut self, index: u32, side: Side) {
        debug_assert!(
            self.is_blank() || (self.index == index && !self.is_attached(side)),
            "attach {side:?} to channel {index} in state {:?}",
            self.state
        );
        self.index = index;
        self.presence.index.store(index, Ordering::Release);
        self.set_state(self.state | side.bit());
        tracing::debug!(index, ?side, state = ?self.state, "channel attached");
    }

    pub(crate) fn bind_facade(&mut self, facade: Weak<HandleInner>) {
        debug_assert!(self.is_attached(Side::Desktop));
        self.facade = Some(facade);
    }

    /// Whether a live host handle is bound to this record.
    pub fn has_live_facade(&self) -> bool {
        self.facade.as_ref().is_some_and(|f| f.strong_count() > 0)
    }

    pub(crate) fn detach(
        &mut self,
        side: Side,
        directory: &Mutex<AddressDirectory>,
    ) -> DetachOutcome {
        debug_assert!(self.is_attached(side), "detaching {side:?} that is not attached");
        self.set_state(self.state - side.bit());
        tracing::debug!(index = self.index, ?side, state = ?self.state, "channel detached");
        if side == Side::Device {
            // The register file belongs to the guest's attachment.
            self.global = 0;
            self.input_len = NO_PACKET;
        }

        if self.state == ConnectionState::ADDR {
            directory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .disconnect(self);
        }

        // Wake host receivers so they notice the state change.
        self.ready.notify_all();

        if !self.is_blank() {
            return DetachOutcome::StillAttached;
        }
        if side == Side::Desktop {
            debug_assert!(
                !self.has_live_facade(),
                "desktop detached from channel {} with live handles",
                self.index
            );
            self.facade = None;
        }
        DetachOutcome::Released
    }
}
