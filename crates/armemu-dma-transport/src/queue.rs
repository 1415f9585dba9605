//! Bounded packet ring with a selectable overflow policy.
//!
//! Storage is `capacity + 1` fixed-size slots in one allocation; `head` is the next slot to
//! write and `tail` the next slot to read, so `head == tail` means empty and the ring holds at
//! most `capacity` packets. The queue does no locking of its own: every caller holds the
//! transport's device lock.

/// What to do when a packet arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullPolicy {
    /// Overwrite the oldest queued packet (logged, never reported to the sender).
    #[default]
    DropOldest,
    /// Refuse the new packet.
    FailOnFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

pub struct PacketQueue {
    slot_size: usize,
    slots: Box<[u8]>,
    lens: Box<[u32]>,
    head: usize,
    tail: usize,
    dropped: u64,
}

impl PacketQueue {
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        assert!(capacity > 0, "packet queue capacity must be non-zero");
        let ring = capacity + 1;
        Self {
            slot_size,
            slots: vec![0u8; ring * slot_size].into_boxed_slice(),
            lens: vec![0u32; ring].into_boxed_slice(),
            head: 0,
            tail: 0,
            dropped: 0,
        }
    }

    fn ring_len(&self) -> usize {
        self.lens.len()
    }

    fn next(&self, cursor: usize) -> usize {
        (cursor + 1) % self.ring_len()
    }

    pub fn capacity(&self) -> usize {
        self.ring_len() - 1
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn len(&self) -> usize {
        (self.head + self.ring_len() - self.tail) % self.ring_len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.next(self.head) == self.tail
    }

    /// Packets overwritten by [`FullPolicy::DropOldest`] since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue `packet`, truncated to the slot size.
    pub fn enqueue(&mut self, packet: &[u8], policy: FullPolicy) -> Result<(), QueueFull> {
        if self.is_full() {
            match policy {
                FullPolicy::FailOnFull => return Err(QueueFull),
                FullPolicy::DropOldest => {
                    self.dropped += 1;
                    tracing::warn!(
                        len = self.lens[self.tail],
                        dropped = self.dropped,
                        "packet queue full; dropping oldest packet"
                    );
                    self.tail = self.next(self.tail);
                }
            }
        }

        let len = packet.len().min(self.slot_size);
        if len < packet.len() {
            tracing::debug!(len = packet.len(), slot = self.slot_size, "truncating packet");
        }
        let start = self.head * self.slot_size;
        self.slots[start..start + len].copy_from_slice(&packet[..len]);
        self.lens[self.head] = len as u32;
        self.head = self.next(self.head);
        Ok(())
    }

    /// Copy the oldest packet into `buf` and release its slot.
    ///
    /// Returns the stored packet length; only `min(len, buf.len())` bytes are copied.
    pub fn dequeue(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let len = self.lens[self.tail] as usize;
        let start = self.tail * self.slot_size;
        let copy = len.min(buf.len());
        buf[..copy].copy_from_slice(&self.slots[start..start + copy]);
        self.tail = self.next(self.tail);
        Some(len)
    }

    /// Length of the oldest packet without consuming it.
    pub fn peek_len(&self) -> Option<usize> {
        (!self.is_empty()).then(|| self.lens[self.tail] as usize)
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("capacity", &self.capacity())
            .field("slot_size", &self.slot_size)
            .field("len", &self.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(q: &mut PacketQueue) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; q.slot_size()];
        while let Some(len) = q.dequeue(&mut buf) {
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn empty_queue_dequeues_nothing() {
        let mut q = PacketQueue::new(2, 8);
        let mut buf = [0u8; 8];
        assert!(q.is_empty());
        assert_eq!(q.dequeue(&mut buf), None);
        assert_eq!(q.peek_len(), None);
    }

    #[test]
    fn fail_on_full_rejects_and_keeps_contents() {
        let mut q = PacketQueue::new(2, 8);
        q.enqueue(b"a", FullPolicy::FailOnFull).unwrap();
        q.enqueue(b"b", FullPolicy::FailOnFull).unwrap();
        assert_eq!(q.enqueue(b"c", FullPolicy::FailOnFull), Err(QueueFull));
        assert_eq!(q.dropped(), 0);
        assert_eq!(drain(&mut q), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn oversized_packets_are_truncated_to_the_slot() {
        let mut q = PacketQueue::new(1, 4);
        q.enqueue(b"abcdefgh", FullPolicy::DropOldest).unwrap();
        assert_eq!(q.peek_len(), Some(4));
        assert_eq!(drain(&mut q), vec![b"abcd".to_vec()]);
    }

    #[test]
    fn short_destination_buffer_reports_full_length() {
        let mut q = PacketQueue::new(1, 8);
        q.enqueue(b"abcdef", FullPolicy::DropOldest).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(q.dequeue(&mut buf), Some(6));
        assert_eq!(&buf, b"ab");
        assert!(q.is_empty());
    }

    #[test]
    fn zero_length_packets_are_preserved() {
        let mut q = PacketQueue::new(2, 8);
        q.enqueue(&[], FullPolicy::DropOldest).unwrap();
        assert!(!q.is_empty());
        assert_eq!(drain(&mut q), vec![Vec::<u8>::new()]);
    }

    proptest! {
        #[test]
        fn fifo_within_capacity(
            cap in 1usize..8,
            packets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..8),
        ) {
            let packets: Vec<_> = packets.into_iter().take(cap).collect();
            let mut q = PacketQueue::new(cap, 16);
            for (i, p) in packets.iter().enumerate() {
                q.enqueue(p, FullPolicy::FailOnFull).unwrap();
                prop_assert!(!q.is_empty());
                prop_assert_eq!(q.len(), i + 1);
            }
            prop_assert_eq!(drain(&mut q), packets);
            prop_assert!(q.is_empty());
        }

        #[test]
        fn overflow_keeps_the_newest_capacity_packets(
            cap in 1usize..6,
            count in 0usize..20,
        ) {
            let mut q = PacketQueue::new(cap, 4);
            for i in 0..count {
                q.enqueue(&(i as u32).to_le_bytes(), FullPolicy::DropOldest).unwrap();
                prop_assert!(q.len() <= cap);
            }
            let expected: Vec<Vec<u8>> = (count.saturating_sub(cap)..count)
                .map(|i| (i as u32).to_le_bytes().to_vec())
                .collect();
            prop_assert_eq!(q.dropped(), count.saturating_sub(cap) as u64);
            prop_assert_eq!(drain(&mut q), expected);
        }
    }
}
