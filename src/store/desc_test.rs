use super::*;

#[test]
fn test_desc_roundtrip() {
    let mut desc = CollDesc::new("db.events").unwrap();
    desc.first_extent = DiskLoc::new(0, 0x1000);
    desc.last_extent = DiskLoc::new(1, 0x2000);
    desc.last_extent_size = 0x10000;
    desc.n_records = 42;
    desc.data_size = 4096;
    desc.padding = 1.5;
    desc.capped_max_bytes = 1 << 20;
    desc.capped_max_docs = 100;
    desc.cap_extent = DiskLoc::new(0, 0x1000);
    desc.deleted[3] = DiskLoc::new(0, 0x3000);
    desc.add_index(DiskLoc::new(0, 0x100), DiskLoc::new(0, 0x4000)).unwrap();

    let mut buf = vec![0_u8; DESC_SIZE];
    desc.store(&mut buf);
    let val = CollDesc::load(&buf).unwrap();
    assert_eq!(val.name, "db.events");
    assert_eq!(val.first_extent, desc.first_extent);
    assert_eq!(val.last_extent, desc.last_extent);
    assert_eq!(val.last_extent_size, 0x10000);
    assert_eq!(val.n_records, 42);
    assert_eq!(val.data_size, 4096);
    assert_eq!(val.padding, 1.5);
    assert_eq!(val.n_indexes, 1);
    assert_eq!(val.capped_max_bytes, 1 << 20);
    assert_eq!(val.capped_max_docs, 100);
    assert_eq!(val.deleted[3], DiskLoc::new(0, 0x3000));
    assert_eq!(val.indexes[0], IndexSlot { info: DiskLoc::new(0, 0x100), head: DiskLoc::new(0, 0x4000) });
    assert_eq!(val.indexes[1], IndexSlot::NULL);
}

#[test]
fn test_desc_padding_clamps() {
    let mut desc = CollDesc::new("x").unwrap();
    assert_eq!(desc.padding, 1.0);

    // fits never dips below 1.0.
    desc.padding_fits();
    assert_eq!(desc.padding, 1.0);

    // too-small jumps by 0.6 and saturates at 2.0.
    desc.padding_too_small();
    assert!((desc.padding - 1.6).abs() < 1e-6);
    desc.padding_too_small();
    assert_eq!(desc.padding, 2.0);
    desc.padding_too_small();
    assert_eq!(desc.padding, 2.0);

    for _ in 0..200 {
        desc.padding_fits();
        assert!(desc.padding >= 1.0 && desc.padding <= 2.0);
    }
    assert_eq!(desc.padding, 1.0);
}

#[test]
fn test_desc_legacy_zero_padding() {
    let desc = CollDesc::new("x").unwrap();
    let mut buf = vec![0_u8; DESC_SIZE];
    desc.store(&mut buf);
    // a zeroed padding field reads as 1.0.
    buf[168..172].copy_from_slice(&0.0_f32.to_le_bytes());
    let val = CollDesc::load(&buf).unwrap();
    assert_eq!(val.padding, 1.0);
}

#[test]
fn test_desc_multikey_bits() {
    let mut desc = CollDesc::new("x").unwrap();
    desc.add_index(DiskLoc::new(0, 0x10), DiskLoc::NULL).unwrap();
    desc.add_index(DiskLoc::new(0, 0x20), DiskLoc::NULL).unwrap();
    desc.add_index(DiskLoc::new(0, 0x30), DiskLoc::NULL).unwrap();

    desc.set_multikey(1);
    desc.set_multikey(2);
    assert!(!desc.is_multikey(0));
    assert!(desc.is_multikey(1));
    assert!(desc.is_multikey(2));

    // removing an index shifts the bits above it down.
    desc.remove_index(1);
    assert_eq!(desc.n_indexes, 2);
    assert!(!desc.is_multikey(0));
    assert!(desc.is_multikey(1));
    assert_eq!(desc.indexes[0].info, DiskLoc::new(0, 0x10));
    assert_eq!(desc.indexes[1].info, DiskLoc::new(0, 0x30));
    assert_eq!(desc.indexes[2], IndexSlot::NULL);
}

#[test]
fn test_desc_index_cap() {
    let mut desc = CollDesc::new("x").unwrap();
    for i in 0..MAX_INDEXES {
        desc.add_index(DiskLoc::new(0, (i as u32 + 1) * 16), DiskLoc::NULL).unwrap();
    }
    assert!(desc.add_index(DiskLoc::new(0, 0x8000), DiskLoc::NULL).is_err());
}

#[test]
fn test_desc_name_too_long() {
    let name = "n".repeat(NS_NAME_LEN);
    assert!(CollDesc::new(&name).is_err());
}
