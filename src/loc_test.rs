use super::*;

#[test]
fn test_diskloc_roundtrip() {
    let loc = DiskLoc::new(3, 0x1000);
    let val = DiskLoc::from_bytes(&loc.to_bytes()).unwrap();
    assert_eq!(loc, val);
    assert!(!loc.is_null());

    let val = DiskLoc::from_bytes(&DiskLoc::NULL.to_bytes()).unwrap();
    assert!(val.is_null());

    assert_eq!(DiskLoc::from_bytes(&[0_u8; 4]).is_err(), true);
}

#[test]
fn test_diskloc_order() {
    let a = DiskLoc::new(0, 0x100);
    let b = DiskLoc::new(0, 0x200);
    let c = DiskLoc::new(1, 0x100);
    assert!(a < b);
    assert!(b < c);
    assert!(a.as_u64() < b.as_u64());
    assert!(b.as_u64() < c.as_u64());

    assert_eq!(a.advance(0x100), b);
}

#[test]
fn test_recref_tag() {
    let loc = DiskLoc::new(2, 0x800);
    let mut rr = RecRef::new(loc);
    assert!(!rr.is_unused());
    assert_eq!(rr.loc(), loc);

    rr.set_unused();
    assert!(rr.is_unused());
    // the tag rides the low offset bit on disk.
    let bytes = rr.to_bytes();
    assert_eq!(bytes[4] & 1, 1);

    let val = RecRef::from_bytes(&bytes).unwrap();
    assert!(val.is_unused());
    assert_eq!(val.loc(), loc);
    // the tie-break value ignores the tag.
    assert_eq!(val.as_u64(), RecRef::new(loc).as_u64());

    let mut val = val;
    val.set_used();
    assert_eq!(val, RecRef::new(loc));
}

#[test]
fn test_recref_null() {
    let rr = RecRef::from_bytes(&DiskLoc::NULL.to_bytes()).unwrap();
    assert!(rr.loc().is_null());
    assert!(!rr.is_unused());
}
