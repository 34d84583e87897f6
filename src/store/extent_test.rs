use super::*;

#[test]
fn test_extent_header_roundtrip() {
    let loc = DiskLoc::new(0, 0x1000);
    let mut hdr = ExtentHdr::new(loc, 0x10000, "db.events");
    hdr.prev = DiskLoc::new(0, 0x800);
    hdr.next = DiskLoc::new(1, 0x40);
    hdr.first_rec = loc.advance(EXTENT_HDR_SIZE as u32);
    hdr.last_rec = loc.advance(0x8000);

    let mut buf = vec![0_u8; EXTENT_HDR_SIZE];
    hdr.store(&mut buf);
    let val = ExtentHdr::load(loc, &buf).unwrap();
    assert_eq!(val.prev, hdr.prev);
    assert_eq!(val.next, hdr.next);
    assert_eq!(val.length, 0x10000);
    assert_eq!(val.first_rec, hdr.first_rec);
    assert_eq!(val.last_rec, hdr.last_rec);
    assert_eq!(val.ns_diag_str(), "db.events");
    assert_eq!(val.data_loc(), loc.advance(EXTENT_HDR_SIZE as u32));
    assert_eq!(val.data_len(), 0x10000 - EXTENT_HDR_SIZE as u32);
}

#[test]
fn test_extent_magic_checked() {
    let loc = DiskLoc::new(0, 0x1000);
    let hdr = ExtentHdr::new(loc, 0x10000, "x");
    let mut buf = vec![0_u8; EXTENT_HDR_SIZE];
    hdr.store(&mut buf);

    buf[0] ^= 0xFF;
    match ExtentHdr::load(loc, &buf) {
        Err(Error::Corruption(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }

    // self-locator mismatch is corruption too.
    buf[0] ^= 0xFF;
    match ExtentHdr::load(DiskLoc::new(0, 0x2000), &buf) {
        Err(Error::Corruption(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_extent_long_ns_truncated() {
    let loc = DiskLoc::new(0, 0x1000);
    let ns = "a".repeat(EXTENT_NS_LEN + 10);
    let hdr = ExtentHdr::new(loc, 0x10000, &ns);
    let mut buf = vec![0_u8; EXTENT_HDR_SIZE];
    hdr.store(&mut buf);
    let val = ExtentHdr::load(loc, &buf).unwrap();
    assert_eq!(val.ns_diag_str().len(), EXTENT_NS_LEN);
}
