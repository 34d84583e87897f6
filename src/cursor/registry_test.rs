use super::*;

use crate::{
    ctx::Opctx,
    doc::Doc,
    store::{CollOpts, Config, Store},
};

fn setup(name: &str) -> (Store, Opctx) {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str(), "t");
    config.set_file_size(4 * 1024 * 1024, 16 * 1024 * 1024);
    let store = Store::create(config).unwrap();
    let ctx = Opctx::new();
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();
    (store, ctx)
}

#[test]
fn test_cursor_ids() {
    let (store, ctx) = setup("recstore-reg-ids");
    for i in 0..5_i64 {
        store.insert("c", &Doc::new().set("i", i), &ctx).unwrap();
    }

    let mut ids = std::collections::HashSet::new();
    let mut cursors = vec![];
    for _ in 0..32 {
        let cur = store.scan("c", 1).unwrap();
        // ids are nonzero, high-bit tagged, unique among live cursors.
        assert_ne!(cur.id(), 0);
        assert_eq!(cur.id() & 0x8000_0000_0000_0000, 0x8000_0000_0000_0000);
        assert!(ids.insert(cur.id()));
        cursors.push(cur);
    }
}

#[test]
fn test_register_unregister() {
    let (store, ctx) = setup("recstore-reg-drop");
    store.insert("c", &Doc::new().set("i", 1_i64), &ctx).unwrap();

    let reg = store.with_inner(|inner| std::sync::Arc::clone(&inner.registry));
    let n0 = reg.len();
    {
        let _c1 = store.scan("c", 1).unwrap();
        let _c2 = store.scan("c", 1).unwrap();
        assert_eq!(reg.len(), n0 + 2);
    }
    // dropping the handles unregisters.
    assert_eq!(reg.len(), n0);
}

#[test]
fn test_lookup_and_update_loc() {
    let (store, ctx) = setup("recstore-reg-loc");
    let mut locs = vec![];
    for i in 0..5_i64 {
        locs.push(store.insert("c", &Doc::new().set("i", i), &ctx).unwrap());
    }

    let reg = store.with_inner(|inner| std::sync::Arc::clone(&inner.registry));
    let mut cur = store.scan("c", 1).unwrap();
    assert!(reg.lookup(cur.id()).is_some());
    assert!(reg.lookup(0).is_none());

    // the registered core tracks the cursor's current record.
    store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    let core = reg.lookup(cur.id()).unwrap();
    assert_eq!(core.read().current_loc(), locs[0]);
    store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    assert_eq!(core.read().current_loc(), locs[1]);
}

#[test]
fn test_invalidate_ns() {
    let (store, ctx) = setup("recstore-reg-invalidate");
    store.create_collection("d", CollOpts::default(), &ctx).unwrap();
    store.insert("c", &Doc::new().set("i", 1_i64), &ctx).unwrap();
    store.insert("d", &Doc::new().set("i", 2_i64), &ctx).unwrap();

    let mut on_c = store.scan("c", 1).unwrap();
    let mut on_d = store.scan("d", 1).unwrap();

    store.drop_collection("c", &ctx).unwrap();
    // only cursors on the dropped namespace die.
    assert!(store.cursor_next(&mut on_c, &ctx).unwrap().is_none());
    assert!(store.cursor_next(&mut on_d, &ctx).unwrap().is_some());
}
