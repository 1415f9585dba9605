//! Channel record pool and index lookup.
//!
//! Records live in a slot vector that grows a chunk at a time and is never shrunk. Slots are
//! addressed by [`SlotId`] (a position, not a pointer) so growth never invalidates anything held
//! elsewhere. A slot is either never-used (`Uninitialized`, no queue memory yet) or holds a
//! record; blank records go back on the free list and are recycled on the next allocation.
//!
//! Index lookup goes through a small chained table. Static and reserved indices map to their own
//! bucket; dynamic indices are folded onto the table modulo its size (see [`bucket_key`]).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::channel::{ChannelRecord, DetachOutcome, Side};
use crate::config::TransportConfig;
use crate::directory::AddressDirectory;
use crate::error::{Result, TransportError};

/// Bucket for `index` in a table of `buckets` chains.
///
/// Indices below `boundary` (static + reserved) are used directly; the rest are rebased to the
/// boundary and wrapped. `buckets` must be at least `boundary`.
pub fn bucket_key(index: u32, boundary: u32, buckets: u32) -> usize {
    if index < boundary {
        index as usize
    } else {
        ((index - boundary) % buckets) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

#[derive(Debug)]
enum Slot {
    Uninitialized,
    Record(Box<ChannelRecord>),
}

#[derive(Debug)]
pub struct ChannelPool {
    slots: Vec<Slot>,
    free: VecDeque<SlotId>,
    buckets: Vec<Vec<(u32, SlotId)>>,
    static_channels: u32,
    boundary: u32,
    next_index: u32,
    live: usize,
    queue_depth: usize,
    packet_size: usize,
    slot_chunk: usize,
    max_channels: usize,
}

impl ChannelPool {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            buckets: vec![Vec::new(); config.lookup_buckets as usize],
            static_channels: config.static_channels,
            boundary: config.first_dynamic_index(),
            next_index: config.first_dynamic_index(),
            live: 0,
            queue_depth: config.queue_depth as usize,
            packet_size: config.packet_size as usize,
            slot_chunk: config.slot_chunk as usize,
            max_channels: config.max_channels as usize,
        }
    }

    /// Number of records currently linked into the table.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots allocated so far, used or not.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn first_dynamic_index(&self) -> u32 {
        self.boundary
    }

    fn is_reserved(&self, index: u32) -> bool {
        (self.static_channels..self.boundary).contains(&index)
    }

    fn grow(&mut self) -> Result<()> {
        let room = self.max_channels.saturating_sub(self.slots.len());
        let chunk = self.slot_chunk.min(room);
        if chunk == 0 {
            tracing::warn!(max = self.max_channels, "channel pool exhausted");
            return Err(TransportError::OutOfMemory);
        }
        self.slots
            .try_reserve(chunk)
            .map_err(|_| TransportError::OutOfMemory)?;
        let start = self.slots.len();
        self.slots
            .extend(std::iter::repeat_with(|| Slot::Uninitialized).take(chunk));
        self.free.extend((start..start + chunk).map(SlotId));
        tracing::debug!(slots = self.slots.len(), "channel pool grew");
        Ok(())
    }

    /// Hand out a blank record, initialising or recycling its slot.
    pub fn allocate_blank_slot(&mut self) -> Result<SlotId> {
        if self.free.is_empty() {
            self.grow()?;
        }
        let id = self.free.pop_front().ok_or(TransportError::OutOfMemory)?;
        let (depth, size) = (self.queue_depth, self.packet_size);
        let slot = &mut self.slots[id.0];
        if let Slot::Record(record) = slot {
            record.recycle();
        } else {
            *slot = Slot::Record(Box::new(ChannelRecord::new(depth, size)));
        }
        Ok(id)
    }

    pub(crate) fn record(&self, id: SlotId) -> &ChannelRecord {
        match &self.slots[id.0] {
            Slot::Record(record) => &**record,
            Slot::Uninitialized => panic!("slot {} is uninitialised", id.0),
        }
    }

    pub(crate) fn record_mut(&mut self, id: SlotId) -> &mut ChannelRecord {
        match &mut self.slots[id.0] {
            Slot::Record(record) => &mut **record,
            Slot::Uninitialized => panic!("slot {} is uninitialised", id.0),
        }
    }

    fn bucket(&self, index: u32) -> usize {
        bucket_key(index, self.boundary, self.buckets.len() as u32)
    }

    pub fn lookup(&self, index: u32) -> Option<SlotId> {
        self.buckets[self.bucket(index)]
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, id)| *id)
    }

    pub fn get(&self, index: u32) -> Option<&ChannelRecord> {
        self.lookup(index).map(|id| self.record(id))
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut ChannelRecord> {
        self.lookup(index).map(|id| self.record_mut(id))
    }

    fn insert(&mut self, index: u32, id: SlotId) {
        debug_assert!(self.lookup(index).is_none(), "channel {index} linked twice");
        let bucket = self.bucket(index);
        self.buckets[bucket].push((index, id));
        self.live += 1;
    }

    /// Unlink `index` from the table. The slot itself is left alone.
    pub fn remove(&mut self, index: u32) -> Option<SlotId> {
        let bucket = self.bucket(index);
        let chain = &mut self.buckets[bucket];
        let pos = chain.iter().position(|(i, _)| *i == index)?;
        let (_, id) = chain.swap_remove(pos);
        self.live -= 1;
        Some(id)
    }

    pub fn is_in_use(&self, index: u32, side: Side) -> bool {
        self.get(index).is_some_and(|r| r.is_attached(side))
    }

    /// Attach `side` to channel `index`, creating the record if nobody holds it yet.
    ///
    /// An existing record must be held by the other side only; this is the rendezvous that
    /// joins a guest channel and a host handle.
    pub fn create_channel(&mut self, index: u32, side: Side) -> Result<SlotId> {
        if self.is_reserved(index) {
            return Err(TransportError::InvalidArgument);
        }
        if let Some(id) = self.lookup(index) {
            let record = self.record_mut(id);
            if record.is_attached(side) {
                return Err(TransportError::AlreadyInUse);
            }
            if !record.is_attached(side.peer()) {
                debug_assert!(false, "channel {index} linked without a data side");
                return Err(TransportError::GeneralFailure);
            }
            record.attach(index, side);
            return Ok(id);
        }

        let id = self.allocate_blank_slot()?;
        self.record_mut(id).attach(index, side);
        self.insert(index, id);
        Ok(id)
    }

    /// Detach `side` from `index`; the slot is recycled once nothing is attached.
    pub fn detach(
        &mut self,
        index: u32,
        side: Side,
        directory: &Mutex<AddressDirectory>,
    ) -> Result<()> {
        let id = self.lookup(index).ok_or(TransportError::InvalidArgument)?;
        let record = self.record_mut(id);
        if !record.is_attached(side) {
            return Err(TransportError::InvalidArgument);
        }
        if record.detach(side, directory) == DetachOutcome::Released {
            self.remove(index);
            self.free.push_back(id);
        }
        Ok(())
    }

    /// Next dynamic index not held by `side`.
    pub fn next_unused_index(&mut self, side: Side) -> Result<u32> {
        // At most `live` indices can be taken, so this many attempts always find a gap.
        for _ in 0..=self.live {
            let candidate = self.next_index;
            self.next_index = candidate.checked_add(1).unwrap_or(self.boundary);
            if !self.is_in_use(candidate, side) {
                return Ok(candidate);
            }
        }
        Err(TransportError::OutOfMemory)
    }

    pub fn peek_next_index(&self) -> u32 {
        self.next_index
    }

    pub(crate) fn set_next_index(&mut self, index: u32) {
        self.next_index = index.max(self.boundary);
    }

    /// Detach `side` from every channel it holds.
    pub fn disconnect_all(&mut self, side: Side, directory: &Mutex<AddressDirectory>) {
        for index in self.indices_attached(side) {
            if let Err(err) = self.detach(index, side, directory) {
                tracing::warn!(index, ?side, "failed to detach channel: {err}");
            }
        }
    }

    /// Indices held by `side`, ascending.
    pub fn indices_attached(&self, side: Side) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .iter()
            .filter(|r| r.is_attached(side))
            .map(ChannelRecord::index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Every linked record, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelRecord> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Record(record) if !record.is_blank() => Some(&**record),
            _ => None,
        })
    }
}
