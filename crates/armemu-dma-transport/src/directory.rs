//! Address directory: channel identities published over the packet transport.
//!
//! Owners publish an opaque identifier bound to one of their channel indices; anyone can scan
//! the list to discover which index to bind. Entries are kept newest-first and hold only a weak
//! reference to the owning record's [`ChannelPresence`], so an owner going away never has to
//! touch the directory: stale entries are collected by the next scan that walks over them.
//!
//! Wire format, shared by scan replies, publish requests and snapshots (all little-endian):
//!
//! ```text
//! record := len:u32  id:[u8; len]  owner:u32
//! scan   := record* (SCAN_END | SCAN_MORE)
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use crate::channel::{ChannelPresence, ChannelRecord, ConnectionState};
use crate::error::{Result, TransportError};

/// Terminates a scan reply that reached the end of the list.
pub const SCAN_END: u32 = 0xFFFF_FFFF;
/// Terminates a scan reply that ran out of room; scan again to continue.
pub const SCAN_MORE: u32 = 0xFFFF_FFFE;

/// `len` and `owner` words around the id bytes.
pub const RECORD_OVERHEAD: usize = 8;

pub const OP_PUBLISH: u32 = 1;
pub const OP_SCAN: u32 = 2;
pub const OP_WITHDRAW: u32 = 3;

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    let end = pos.checked_add(4).ok_or(TransportError::InvalidArgument)?;
    let bytes = buf.get(pos..end).ok_or(TransportError::InvalidArgument)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// One published identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressRecord {
    pub id: Vec<u8>,
    pub owner: u32,
}

impl AddressRecord {
    pub fn new(id: impl Into<Vec<u8>>, owner: u32) -> Self {
        Self {
            id: id.into(),
            owner,
        }
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.id.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.id.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.owner.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode the record at the start of `buf`, returning it and the number of bytes consumed.
    ///
    /// The id length is checked against what is actually left in `buf`.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Self, usize)> {
        let len = read_u32(buf, 0)? as usize;
        if len >= SCAN_MORE as usize {
            return Err(TransportError::InvalidArgument);
        }
        let id_end = 4usize
            .checked_add(len)
            .ok_or(TransportError::InvalidArgument)?;
        let id = buf.get(4..id_end).ok_or(TransportError::InvalidArgument)?;
        let owner = read_u32(buf, id_end)?;
        Ok((Self::new(id, owner), id_end + 4))
    }

    /// Decode a buffer holding exactly one record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (record, used) = Self::decode_prefix(buf)?;
        if used != buf.len() {
            return Err(TransportError::InvalidArgument);
        }
        Ok(record)
    }
}

/// How a scan reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    Drained,
    More,
}

/// Parse a scan reply (or a snapshot's directory field).
pub fn decode_scan(packet: &[u8]) -> Result<(Vec<AddressRecord>, ScanEnd)> {
    let mut records = Vec::new();
    let mut pos = 0;
    loop {
        match read_u32(packet, pos)? {
            SCAN_END => return Ok((records, ScanEnd::Drained)),
            SCAN_MORE => return Ok((records, ScanEnd::More)),
            _ => {
                let (record, used) = AddressRecord::decode_prefix(&packet[pos..])?;
                records.push(record);
                pos += used;
            }
        }
    }
}

/// A request written to an address-connected channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRequest {
    Publish(AddressRecord),
    Scan,
    Withdraw(AddressRecord),
}

impl DirectoryRequest {
    pub fn decode(packet: &[u8]) -> Result<Self> {
        let op = read_u32(packet, 0)?;
        let body = &packet[4..];
        match op {
            OP_PUBLISH => Ok(Self::Publish(AddressRecord::decode(body)?)),
            OP_SCAN if body.is_empty() => Ok(Self::Scan),
            OP_WITHDRAW => Ok(Self::Withdraw(AddressRecord::decode(body)?)),
            _ => Err(TransportError::InvalidArgument),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Publish(record) => {
                out.extend_from_slice(&OP_PUBLISH.to_le_bytes());
                record.encode_into(&mut out);
            }
            Self::Scan => out.extend_from_slice(&OP_SCAN.to_le_bytes()),
            Self::Withdraw(record) => {
                out.extend_from_slice(&OP_WITHDRAW.to_le_bytes());
                record.encode_into(&mut out);
            }
        }
        out
    }
}

#[derive(Debug)]
struct AddressEntry {
    serial: u64,
    record: AddressRecord,
    owner: Weak<ChannelPresence>,
    generation: u32,
}

impl AddressEntry {
    fn is_live(&self) -> bool {
        self.owner.upgrade().is_some_and(|p| {
            p.is_data_connected()
                && p.index() == self.record.owner
                && p.generation() == self.generation
        })
    }
}

/// The directory itself. Lives behind its own lock, always taken after the device lock.
#[derive(Debug)]
pub struct AddressDirectory {
    // Newest first.
    entries: VecDeque<AddressEntry>,
    next_serial: u64,
    subscribers: BTreeSet<u32>,
    packet_size: usize,
}

impl AddressDirectory {
    pub fn new(packet_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_serial: 1,
            subscribers: BTreeSet::new(),
            packet_size,
        }
    }

    /// Longest id that still fits a scan reply on its own.
    pub fn max_id_len(&self) -> usize {
        self.packet_size.saturating_sub(RECORD_OVERHEAD + 4)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prepend `record`, owned by the channel behind `owner`.
    ///
    /// Re-publishing an `(id, owner)` pair replaces the earlier entry.
    pub fn publish(&mut self, record: AddressRecord, owner: &Arc<ChannelPresence>) -> Result<()> {
        if record.id.len() > self.max_id_len() {
            return Err(TransportError::InvalidArgument);
        }
        if owner.index() != record.owner || !owner.is_data_connected() {
            return Err(TransportError::InvalidArgument);
        }
        self.withdraw(&record.id, record.owner);
        let serial = self.next_serial;
        self.next_serial += 1;
        tracing::debug!(owner = record.owner, serial, "address published");
        self.entries.push_front(AddressEntry {
            serial,
            record,
            owner: Arc::downgrade(owner),
            generation: owner.generation(),
        });
        Ok(())
    }

    /// Remove the entry publishing `id` for `owner`. Returns whether one was found.
    pub fn withdraw(&mut self, id: &[u8], owner: u32) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.record.owner == owner && e.record.id == id)
        else {
            return false;
        };
        self.entries.remove(pos);
        true
    }

    /// Encode the next page of live entries for `requester`.
    ///
    /// Without a requester the scan starts at the newest entry and no position is remembered.
    /// Dead entries met along the way are dropped.
    pub fn scan(&mut self, requester: Option<&ChannelPresence>) -> Vec<u8> {
        let mut i = match requester.and_then(ChannelPresence::scan_cursor) {
            None => 0,
            Some(cursor) => self
                .entries
                .iter()
                .position(|e| e.serial <= cursor)
                .unwrap_or(self.entries.len()),
        };

        let mut out = Vec::new();
        while i < self.entries.len() {
            let entry = &self.entries[i];
            if !entry.is_live() {
                tracing::debug!(
                    owner = entry.record.owner,
                    serial = entry.serial,
                    "dropping stale address entry"
                );
                self.entries.remove(i);
                continue;
            }
            if out.len() + entry.record.encoded_len() + 4 > self.packet_size {
                break;
            }
            entry.record.encode_into(&mut out);
            i += 1;
        }

        let cursor = self.entries.get(i).map(|e| e.serial);
        let terminator = if cursor.is_some() { SCAN_MORE } else { SCAN_END };
        out.extend_from_slice(&terminator.to_le_bytes());
        if let Some(requester) = requester {
            requester.set_scan_cursor(cursor);
        }
        out
    }

    /// Every live entry, newest first.
    pub fn live_records(&self) -> Vec<AddressRecord> {
        self.entries
            .iter()
            .filter(|e| e.is_live())
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn connect(&mut self, record: &mut ChannelRecord) {
        record.set_addr_connected(true);
        self.subscribers.insert(record.index());
    }

    /// Drop the directory's attachment. The channel must have no data side left.
    pub fn disconnect(&mut self, record: &mut ChannelRecord) {
        debug_assert!(
            !record.state().intersects(ConnectionState::DATA),
            "directory disconnecting active channel {}",
            record.index()
        );
        record.set_addr_connected(false);
        self.subscribers.remove(&record.index());
    }

    pub fn is_subscriber(&self, index: u32) -> bool {
        self.subscribers.contains(&index)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = u32> + '_ {
        self.subscribers.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Side;

    fn owner(index: u32) -> ChannelRecord {
        let mut rec = ChannelRecord::new(1, 16);
        rec.attach(index, Side::Device);
        rec
    }

    fn scan_all(dir: &mut AddressDirectory, requester: &ChannelPresence) -> Vec<AddressRecord> {
        let mut all = Vec::new();
        loop {
            let (records, end) = decode_scan(&dir.scan(Some(requester))).unwrap();
            all.extend(records);
            if end == ScanEnd::Drained {
                return all;
            }
        }
    }

    #[test]
    fn record_decode_checks_id_length_against_buffer() {
        let mut buf = AddressRecord::new(*b"abc", 9).encode();
        assert_eq!(AddressRecord::decode(&buf).unwrap(), AddressRecord::new(*b"abc", 9));

        // Claim a longer id than the buffer holds.
        buf[0] = 200;
        assert_eq!(AddressRecord::decode(&buf), Err(TransportError::InvalidArgument));
        assert_eq!(
            AddressRecord::decode(&u32::MAX.to_le_bytes()),
            Err(TransportError::InvalidArgument)
        );
        assert_eq!(AddressRecord::decode(&[1, 0]), Err(TransportError::InvalidArgument));
    }

    #[test]
    fn truncated_multi_record_scan_is_rejected() {
        let mut packet = Vec::new();
        AddressRecord::new(*b"one", 16).encode_into(&mut packet);
        AddressRecord::new(*b"two", 17).encode_into(&mut packet);
        packet.extend_from_slice(&SCAN_END.to_le_bytes());
        assert_eq!(decode_scan(&packet).unwrap().0.len(), 2);

        for cut in 1..packet.len() {
            assert!(decode_scan(&packet[..cut]).is_err(), "cut={cut}");
        }
    }

    #[test]
    fn request_encoding_round_trips_each_op() {
        for req in [
            DirectoryRequest::Publish(AddressRecord::new(*b"svc", 20)),
            DirectoryRequest::Scan,
            DirectoryRequest::Withdraw(AddressRecord::new(*b"svc", 20)),
        ] {
            assert_eq!(DirectoryRequest::decode(&req.encode()).unwrap(), req);
        }
        assert!(DirectoryRequest::decode(&7u32.to_le_bytes()).is_err());
    }

    #[test]
    fn publish_requires_a_connected_owner_with_matching_index() {
        let mut dir = AddressDirectory::new(64);
        let rec = owner(16);
        assert_eq!(
            dir.publish(AddressRecord::new(*b"x", 17), rec.presence()),
            Err(TransportError::InvalidArgument)
        );
        let blank = ChannelRecord::new(1, 16);
        assert_eq!(
            dir.publish(AddressRecord::new(*b"x", 0), blank.presence()),
            Err(TransportError::InvalidArgument)
        );
        let too_long = vec![0u8; dir.max_id_len() + 1];
        assert_eq!(
            dir.publish(AddressRecord::new(too_long, 16), rec.presence()),
            Err(TransportError::InvalidArgument)
        );
        dir.publish(AddressRecord::new(*b"x", 16), rec.presence()).unwrap();
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn paged_scan_yields_every_entry_once() {
        // Room for two 4-byte ids (12 bytes each) plus the terminator.
        let mut dir = AddressDirectory::new(28);
        let owners: Vec<_> = (16..21).map(owner).collect();
        for rec in &owners {
            let id = rec.index().to_le_bytes();
            dir.publish(AddressRecord::new(id, rec.index()), rec.presence())
                .unwrap();
        }

        let requester = owner(30);
        let (first, end) = decode_scan(&dir.scan(Some(requester.presence()))).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(end, ScanEnd::More);

        let rest = scan_all(&mut dir, requester.presence());
        let mut seen: Vec<u32> = first.iter().chain(rest.iter()).map(|r| r.owner).collect();
        // Newest first.
        assert_eq!(seen, vec![20, 19, 18, 17, 16]);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        // A fresh scan starts over.
        assert_eq!(scan_all(&mut dir, requester.presence()).len(), 5);
    }

    #[test]
    fn disconnected_owners_are_collected_by_scan() {
        let mut dir = AddressDirectory::new(256);
        let directory = std::sync::Mutex::new(AddressDirectory::new(256));
        let mut a = owner(16);
        let b = owner(17);
        dir.publish(AddressRecord::new(*b"a", 16), a.presence()).unwrap();
        dir.publish(AddressRecord::new(*b"b", 17), b.presence()).unwrap();

        a.detach(Side::Device, &directory);
        let (records, end) = decode_scan(&dir.scan(None)).unwrap();
        assert_eq!(end, ScanEnd::Drained);
        assert_eq!(records, vec![AddressRecord::new(*b"b", 17)]);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn recycled_owner_slot_does_not_revive_old_entries() {
        let mut dir = AddressDirectory::new(256);
        let directory = std::sync::Mutex::new(AddressDirectory::new(256));
        let mut rec = owner(16);
        dir.publish(AddressRecord::new(*b"old", 16), rec.presence()).unwrap();

        rec.detach(Side::Device, &directory);
        rec.recycle();
        rec.attach(16, Side::Device);

        assert!(dir.live_records().is_empty());
        let (records, _) = decode_scan(&dir.scan(None)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn withdraw_removes_only_the_matching_entry() {
        let mut dir = AddressDirectory::new(256);
        let rec = owner(16);
        dir.publish(AddressRecord::new(*b"a", 16), rec.presence()).unwrap();
        dir.publish(AddressRecord::new(*b"b", 16), rec.presence()).unwrap();
        assert!(!dir.withdraw(b"a", 17));
        assert!(dir.withdraw(b"a", 16));
        assert_eq!(dir.live_records(), vec![AddressRecord::new(*b"b", 16)]);
    }

    #[test]
    fn republishing_replaces_the_existing_entry() {
        let mut dir = AddressDirectory::new(256);
        let a = owner(16);
        let b = owner(17);
        dir.publish(AddressRecord::new(*b"svc", 16), a.presence()).unwrap();
        dir.publish(AddressRecord::new(*b"svc", 17), b.presence()).unwrap();
        dir.publish(AddressRecord::new(*b"svc", 16), a.presence()).unwrap();

        assert_eq!(dir.len(), 2);
        let (records, end) = decode_scan(&dir.scan(None)).unwrap();
        assert_eq!(end, ScanEnd::Drained);
        assert_eq!(
            records,
            vec![AddressRecord::new(*b"svc", 16), AddressRecord::new(*b"svc", 17)]
        );
    }
}
