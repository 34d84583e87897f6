use super::*;

use crate::{
    ctx::Opctx,
    doc::Doc,
    store::{CollOpts, Config, Store},
};

fn temp_config(name: &str) -> Config {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    let mut config = Config::new(dir.as_os_str(), "t");
    config.set_file_size(4 * 1024 * 1024, 16 * 1024 * 1024);
    config
}

#[test]
fn test_bootstrap_namespaces() {
    let config = temp_config("recstore-catalog-boot");
    let store = Store::create(config).unwrap();

    let names = store.list_collections();
    assert_eq!(
        names,
        vec![
            FREELIST_NS.to_string(),
            INDEXES_NS.to_string(),
            NAMESPACES_NS.to_string()
        ]
    );

    store.with_inner(|inner| {
        // file 0 anchors the catalog descriptor.
        let header = inner.files.file(0).unwrap().load_header().unwrap();
        assert!(!header.catalog.is_null());
        let desc = inner.load_desc(header.catalog).unwrap();
        assert_eq!(desc.name, NAMESPACES_NS);
        // three descriptors live in the catalog.
        assert_eq!(desc.n_records, 3);
    });
}

#[test]
fn test_create_remove_ns() {
    let config = temp_config("recstore-catalog-crud");
    let store = Store::create(config).unwrap();
    let ctx = Opctx::new();

    store.create_collection("events", CollOpts::default(), &ctx).unwrap();
    assert!(store.list_collections().contains(&"events".to_string()));

    // double create fails.
    match store.create_collection("events", CollOpts::default(), &ctx) {
        Err(Error::InvalidInput(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
    // system namespaces are refused.
    assert!(store.create_collection("system.users", CollOpts::default(), &ctx).is_err());
    assert!(store.drop_collection(NAMESPACES_NS, &ctx).is_err());
    assert!(store.drop_collection(FREELIST_NS, &ctx).is_err());

    store.drop_collection("events", &ctx).unwrap();
    assert!(!store.list_collections().contains(&"events".to_string()));
    match store.drop_collection("events", &ctx) {
        Err(Error::NsNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res.err()),
    }
}

#[test]
fn test_catalog_survives_reopen() {
    let config = temp_config("recstore-catalog-reopen");
    let dir = config.dir.clone();
    let ctx = Opctx::new();
    {
        let store = Store::create(config).unwrap();
        store.create_collection("events", CollOpts::default(), &ctx).unwrap();
        store.create_collection("users", CollOpts::default(), &ctx).unwrap();
        let doc = Doc::new().set("x", 1_i64);
        store.insert("events", &doc, &ctx).unwrap();
        store.close().unwrap();
    }

    let store = Store::open(&dir, "t").unwrap();
    let names = store.list_collections();
    assert!(names.contains(&"events".to_string()));
    assert!(names.contains(&"users".to_string()));

    let stats = store.stats("events").unwrap();
    assert_eq!(stats.n_records, 1);

    // and the data is readable.
    let mut cur = store.scan("events", 1).unwrap();
    let (_, doc) = store.cursor_next(&mut cur, &ctx).unwrap().unwrap();
    assert_eq!(doc.get("x"), Some(&crate::doc::Value::Integer(1)));
}

#[test]
fn test_each_record_order() {
    let config = temp_config("recstore-catalog-each");
    let store = Store::create(config).unwrap();
    let ctx = Opctx::new();
    store.create_collection("c", CollOpts::default(), &ctx).unwrap();

    let mut expect = vec![];
    for i in 0..50_i64 {
        let doc = Doc::new().set("i", i);
        expect.push(store.insert("c", &doc, &ctx).unwrap());
    }
    store.with_inner(|inner| {
        let desc_loc = inner.desc_loc("c").unwrap();
        let desc = inner.load_desc(desc_loc).unwrap();
        let locs = each_record(inner, &desc).unwrap();
        assert_eq!(locs, expect);
    });
}
