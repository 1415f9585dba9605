mod common;

use armemu_dma_transport::directory::{decode_scan, SCAN_END};
use armemu_dma_transport::regs::{self, GlobalBits, Operation};
use armemu_dma_transport::{AddressRecord, ConnectionState, DirectoryRequest, Side};
use armemu_io_snapshot::io::state::codec::Encoder;
use armemu_io_snapshot::io::state::{
    IoSnapshot, SnapshotError, SnapshotVersion, SnapshotWriter,
};
use pretty_assertions::assert_eq;

use common::rig;

#[test]
fn restore_recreates_guest_channels_and_directory() {
    let mut before = rig();
    let owner = before.guest.new_channel(Operation::NewVirtualChannel);
    let a = before.guest.new_channel(Operation::NewAddressChannel);
    before.guest.set_global(a, GlobalBits::ENABLE);
    before
        .guest
        .set_global(owner, GlobalBits::ENABLE | GlobalBits::IRQ_ENABLE);
    before.guest.set_global(3, GlobalBits::ENABLE);

    let record = AddressRecord::new(b"svc.persist".to_vec(), owner);
    let publish = DirectoryRequest::Publish(record.clone()).encode();
    assert_eq!(before.guest.send(a, &publish), 0);
    assert_eq!(before.guest.recv(a), Some(0u32.to_le_bytes().to_vec()));
    before.guest.select(owner);

    let blob = before.guest.dev.save_state();

    let mut after = rig();
    after.guest.dev.load_state(&blob).unwrap();

    assert!(after.transport.is_in_use(owner, Side::Device));
    assert_eq!(
        after.transport.channel_state(a),
        Some(ConnectionState::DEVICE | ConnectionState::ADDR)
    );
    let page = after.transport.scan_addresses(None);
    assert_eq!(decode_scan(&page).unwrap().0, vec![record]);

    let block = after.guest.layout.static_block(3);
    assert_eq!(
        after.guest.read(block + regs::BLOCK_GLOBAL),
        GlobalBits::ENABLE.bits()
    );
    assert_eq!(after.guest.indirect(regs::REG_CURRENT_CHANNEL), owner);
    assert_eq!(
        after.guest.indirect(regs::REG_CURRENT_GLOBAL),
        (GlobalBits::ENABLE | GlobalBits::IRQ_ENABLE).bits()
    );

    // Saving the restored device reproduces the same bytes.
    assert_eq!(after.guest.dev.save_state(), blob);

    // Freshly minted indices continue after the restored ones.
    let next = after.guest.new_channel(Operation::NewVirtualChannel);
    assert_eq!(next, a + 1);
}

#[test]
fn corrupt_blobs_leave_the_device_untouched() {
    let mut rig = rig();
    let v = rig.guest.new_channel(Operation::NewVirtualChannel);

    assert!(rig.guest.dev.load_state(b"garbage").is_err());

    let mut w = SnapshotWriter::new(*b"XXXX", SnapshotVersion::new(1, 0));
    w.field_u32(5, 0);
    assert!(matches!(
        rig.guest.dev.load_state(&w.finish()),
        Err(SnapshotError::DeviceIdMismatch { .. })
    ));

    // Channel list claiming more entries than it carries.
    let mut w = SnapshotWriter::new(*b"DMAT", SnapshotVersion::new(1, 0));
    w.field_bytes(1, Encoder::new().u32(5).u32(16).finish());
    assert!(matches!(
        rig.guest.dev.load_state(&w.finish()),
        Err(SnapshotError::InvalidFieldEncoding(_))
    ));

    let mut w = SnapshotWriter::new(*b"DMAT", SnapshotVersion::new(2, 0));
    w.field_u32(5, 0);
    assert!(matches!(
        rig.guest.dev.load_state(&w.finish()),
        Err(SnapshotError::UnsupportedDeviceMajorVersion { .. })
    ));

    assert!(rig.transport.is_in_use(v, Side::Device));
}

#[test]
fn entries_for_missing_channels_are_dropped_on_restore() {
    let mut rig = rig();

    let mut directory = AddressRecord::new(b"orphan".to_vec(), 99).encode();
    directory.extend_from_slice(&SCAN_END.to_le_bytes());

    let mut w = SnapshotWriter::new(*b"DMAT", SnapshotVersion::new(1, 0));
    w.field_bytes(1, Encoder::new().u32(1).u32(20).finish());
    w.field_bytes(2, directory);
    rig.guest.dev.load_state(&w.finish()).unwrap();

    assert!(rig.transport.is_in_use(20, Side::Device));
    assert_eq!(rig.transport.address_count(), 0);
}
