use armemu_io_snapshot::io::state::{
    SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter, IO_SNAPSHOT_MAGIC,
};
use pretty_assertions::assert_eq;

fn sample() -> Vec<u8> {
    let mut w = SnapshotWriter::new(*b"DMAT", SnapshotVersion::new(1, 0));
    w.field_u32(1, 42);
    w.field_bytes(2, vec![1, 2, 3]);
    w.finish()
}

#[test]
fn truncated_snapshot_is_rejected_at_every_length() {
    let bytes = sample();
    // Header (16 bytes), then a u32 field (6 + 4) and a 3-byte field (6 + 3). Cutting exactly on a
    // field boundary yields a shorter but well-formed snapshot.
    let boundaries = [16, 26];
    assert_eq!(bytes.len(), 35);
    for len in (0..bytes.len()).filter(|len| !boundaries.contains(len)) {
        let err = SnapshotReader::parse(&bytes[..len], *b"DMAT")
            .expect_err("truncated snapshot must not parse");
        assert!(
            matches!(err, SnapshotError::UnexpectedEof),
            "len={len} err={err:?}"
        );
    }
    assert!(SnapshotReader::parse(&bytes, *b"DMAT").is_ok());
}

#[test]
fn wrong_device_id_is_reported() {
    let bytes = sample();
    let err = SnapshotReader::parse(&bytes, *b"NOPE").unwrap_err();
    assert_eq!(
        err,
        SnapshotError::DeviceIdMismatch {
            expected: *b"NOPE",
            found: *b"DMAT"
        }
    );
}

#[test]
fn bad_magic_is_reported() {
    let mut bytes = sample();
    bytes[0] ^= 0xFF;
    assert_ne!(bytes[0..4], IO_SNAPSHOT_MAGIC);
    assert_eq!(
        SnapshotReader::parse(&bytes, *b"DMAT").unwrap_err(),
        SnapshotError::InvalidMagic
    );
}

#[test]
fn duplicate_tags_are_rejected() {
    let mut bytes = sample();
    // Append a second copy of tag 1.
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&4u32.to_le_bytes());
    bytes.extend_from_slice(&7u32.to_le_bytes());
    assert_eq!(
        SnapshotReader::parse(&bytes, *b"DMAT").unwrap_err(),
        SnapshotError::DuplicateFieldTag(1)
    );
}
